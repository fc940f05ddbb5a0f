//! File extraction from raw model output
//!
//! Subagents answer in markdown where every generated file is a `### path`
//! heading followed by one fenced code block:
//!
//! ````text
//! ### src/models/user.rs
//! ```rust
//! pub struct User;
//! ```
//! ````
//!
//! Code blocks without a preceding heading are ignored.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedFile {
    pub path: String,
    pub content: String,
    /// Info string of the fence, if any
    pub language: Option<String>,
}

pub fn extract_files(markdown: &str) -> Vec<ExtractedFile> {
    let mut files = Vec::new();
    let mut current_path: Option<String> = None;
    let mut current_language: Option<String> = None;
    let mut code: Vec<&str> = Vec::new();
    let mut in_block = false;

    for line in markdown.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if !in_block && line.starts_with("###") {
            current_path = clean_path(line.trim_start_matches('#'));
        } else if line.trim_start().starts_with("```") {
            if !in_block {
                in_block = true;
                let info = line.trim_start().trim_start_matches('`').trim();
                current_language = (!info.is_empty()).then(|| info.to_string());
                code.clear();
            } else {
                in_block = false;
                if let Some(path) = current_path.take() {
                    files.push(ExtractedFile {
                        path,
                        content: code.join("\n"),
                        language: current_language.take(),
                    });
                }
                current_language = None;
                code.clear();
            }
        } else if in_block {
            code.push(line);
        }
    }

    files
}

fn clean_path(raw: &str) -> Option<String> {
    let path = raw.trim().trim_matches('`').trim();
    if path.is_empty() {
        None
    } else {
        Some(path.to_string())
    }
}
