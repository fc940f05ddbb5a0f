use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Detected kind of a file's content
///
/// A differing kind at the same path is a type conflict rather than a plain
/// content conflict.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum ContentKind {
    Json,
    Yaml,
    Toml,
    Markdown,
    TypeScript,
    JavaScript,
    Rust,
    CSharp,
    Python,
    Html,
    Css,
    Sql,
    Shell,
    Text,
    Other(String),
}

impl ContentKind {
    /// Executor label first, then extension, then a content sniff
    pub fn detect(path: &str, language: Option<&str>, content: &str) -> Self {
        language
            .and_then(Self::from_label)
            .or_else(|| Self::from_extension(path))
            .unwrap_or_else(|| Self::sniff(content))
    }

    /// Kind of a deleted path, which has no content to sniff
    pub fn for_path(path: &str) -> Self {
        Self::from_extension(path).unwrap_or(ContentKind::Text)
    }

    // "text" carries no information; let the extension decide
    fn from_label(label: &str) -> Option<Self> {
        let label = label.trim().to_ascii_lowercase();
        match label.as_str() {
            "" | "text" | "txt" | "plaintext" | "plain" => None,
            _ => Some(Self::from_name(&label)),
        }
    }

    fn from_name(name: &str) -> Self {
        match name {
            "json" | "jsonc" => ContentKind::Json,
            "yaml" | "yml" => ContentKind::Yaml,
            "toml" => ContentKind::Toml,
            "markdown" | "md" => ContentKind::Markdown,
            "typescript" | "ts" | "tsx" => ContentKind::TypeScript,
            "javascript" | "js" | "jsx" | "mjs" | "cjs" => ContentKind::JavaScript,
            "rust" | "rs" => ContentKind::Rust,
            "csharp" | "cs" | "c#" => ContentKind::CSharp,
            "python" | "py" => ContentKind::Python,
            "html" | "htm" => ContentKind::Html,
            "css" | "scss" | "less" => ContentKind::Css,
            "sql" => ContentKind::Sql,
            "shell" | "sh" | "bash" | "zsh" => ContentKind::Shell,
            "text" | "txt" => ContentKind::Text,
            other => ContentKind::Other(other.to_string()),
        }
    }

    fn from_extension(path: &str) -> Option<Self> {
        let ext = Path::new(path).extension()?.to_str()?.to_ascii_lowercase();
        match Self::from_name(&ext) {
            ContentKind::Other(_) => None,
            kind => Some(kind),
        }
    }

    fn sniff(content: &str) -> Self {
        let trimmed = content.trim_start();
        if (trimmed.starts_with('{') || trimmed.starts_with('['))
            && serde_json::from_str::<serde_json::Value>(trimmed).is_ok()
        {
            return ContentKind::Json;
        }
        if trimmed.starts_with("#!") && trimmed.lines().next().is_some_and(|l| l.contains("sh")) {
            return ContentKind::Shell;
        }
        let lower = trimmed.get(..15).unwrap_or(trimmed).to_ascii_lowercase();
        if lower.starts_with("<!doctype html") || lower.starts_with("<html") {
            return ContentKind::Html;
        }
        if trimmed.starts_with("---") {
            return ContentKind::Yaml;
        }
        if trimmed.starts_with("# ") {
            return ContentKind::Markdown;
        }
        ContentKind::Text
    }

    pub fn as_str(&self) -> &str {
        match self {
            ContentKind::Json => "json",
            ContentKind::Yaml => "yaml",
            ContentKind::Toml => "toml",
            ContentKind::Markdown => "markdown",
            ContentKind::TypeScript => "typescript",
            ContentKind::JavaScript => "javascript",
            ContentKind::Rust => "rust",
            ContentKind::CSharp => "csharp",
            ContentKind::Python => "python",
            ContentKind::Html => "html",
            ContentKind::Css => "css",
            ContentKind::Sql => "sql",
            ContentKind::Shell => "shell",
            ContentKind::Text => "text",
            ContentKind::Other(name) => name,
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for ContentKind {
    fn from(value: String) -> Self {
        Self::from_name(&value.trim().to_ascii_lowercase())
    }
}

impl From<ContentKind> for String {
    fn from(value: ContentKind) -> Self {
        value.as_str().to_string()
    }
}
