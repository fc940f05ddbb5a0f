use chrono::Utc;
use glob::Pattern;
use tracing::debug;
use uuid::Uuid;

use super::diff::{change_ratio, merge_union};
use super::types::{ConflictCandidate, ConflictStatus, ConflictType, MergeConflict, Severity};
use crate::config::ConflictConfig;
use crate::core::{OrchestraError, Result};
use crate::model::SessionId;

/// Classifies divergent writes and scores their severity
#[derive(Debug, Clone)]
pub struct ConflictDetector {
    critical_paths: Vec<Pattern>,
    high_change_ratio: f64,
}

impl ConflictDetector {
    pub fn new(config: &ConflictConfig) -> Result<Self> {
        let critical_paths = config
            .critical_paths
            .iter()
            .map(|p| {
                Pattern::new(p).map_err(|e| {
                    OrchestraError::configuration_field(
                        format!("invalid critical path pattern '{}': {}", p, e),
                        "conflicts.critical_paths",
                    )
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            critical_paths,
            high_change_ratio: config.high_change_ratio,
        })
    }

    /// Matches the full path or just its file name
    pub fn is_critical(&self, path: &str) -> bool {
        let normalized = path.replace('\\', "/");
        let file_name = normalized.rsplit('/').next().unwrap_or(&normalized);
        self.critical_paths
            .iter()
            .any(|p| p.matches(&normalized) || p.matches(file_name))
    }

    pub fn classify(candidates: &[ConflictCandidate]) -> ConflictType {
        if let Some(deleted) = candidates.iter().find(|c| c.content.is_none()) {
            if candidates.iter().any(|c| c.content.is_some()) {
                return ConflictType::Structural {
                    deleted_by: deleted.task_id.clone(),
                };
            }
        }
        let mut written = candidates.iter().filter(|c| c.content.is_some());
        if let Some(first) = written.next() {
            if let Some(other) = written.find(|c| c.kind != first.kind) {
                return ConflictType::Type {
                    existing: first.kind.clone(),
                    incoming: other.kind.clone(),
                };
            }
        }
        ConflictType::Content
    }

    /// Maximum severity over every candidate compared with the first one
    pub fn severity(&self, path: &str, candidates: &[ConflictCandidate]) -> Severity {
        if self.is_critical(path) {
            return Severity::Critical;
        }
        let Some((base, rest)) = candidates.split_first() else {
            return Severity::Medium;
        };
        let base = base.content.as_deref().unwrap_or("");
        rest.iter()
            .map(|c| {
                let ratio = change_ratio(base, c.content.as_deref().unwrap_or(""));
                if ratio > self.high_change_ratio {
                    Severity::High
                } else {
                    Severity::Medium
                }
            })
            .max()
            .unwrap_or(Severity::Medium)
    }

    /// Open a new conflict record for `path`; needs at least two candidates
    pub fn detect(
        &self,
        session_id: SessionId,
        path: &str,
        contributors: Vec<String>,
        candidates: Vec<ConflictCandidate>,
    ) -> MergeConflict {
        let conflict_type = Self::classify(&candidates);
        let severity = self.severity(path, &candidates);
        let description = describe(path, &conflict_type, &contributors);
        debug!(
            path = %path,
            severity = ?severity,
            contributors = contributors.len(),
            "Merge conflict detected"
        );
        MergeConflict {
            id: Uuid::new_v4(),
            session_id,
            path: path.to_string(),
            conflict_type,
            severity,
            contributors,
            candidates,
            status: ConflictStatus::Open,
            resolution: None,
            resolved_by: None,
            resolved_at: None,
            detected_at: Utc::now(),
            description,
        }
    }

    /// Fold a new candidate into an open record and rescore it
    pub fn extend(&self, conflict: &mut MergeConflict, candidate: ConflictCandidate) {
        if !conflict.has_contributor(&candidate.task_id) {
            conflict.contributors.push(candidate.task_id.clone());
        }
        if conflict.candidate(&candidate.task_id).is_none() {
            conflict.candidates.push(candidate);
        }
        conflict.conflict_type = Self::classify(&conflict.candidates);
        conflict.severity = self.severity(&conflict.path, &conflict.candidates);
        conflict.description = describe(
            &conflict.path,
            &conflict.conflict_type,
            &conflict.contributors,
        );
    }

    /// Line-union merge of all candidates, folded pairwise
    ///
    /// Only content conflicts below Critical qualify. `None` means the
    /// conflict needs a human decision.
    pub fn try_auto_merge(&self, conflict: &MergeConflict) -> Option<String> {
        if conflict.severity == Severity::Critical
            || conflict.conflict_type != ConflictType::Content
        {
            return None;
        }
        let mut contents = conflict.candidates.iter().map(|c| c.content.as_deref());
        let mut merged = contents.next()??.to_string();
        for next in contents {
            let next = next?;
            if next != merged {
                merged = merge_union(&merged, next)?;
            }
        }
        Some(merged)
    }
}

fn describe(path: &str, conflict_type: &ConflictType, contributors: &[String]) -> String {
    let who = contributors.join(", ");
    match conflict_type {
        ConflictType::Content => format!("{} was written with different content by {}", path, who),
        ConflictType::Type { existing, incoming } => format!(
            "{} was written as {} and as {} by {}",
            path, existing, incoming, who
        ),
        ConflictType::Structural { deleted_by } => {
            format!("{} was deleted by {} but written by others ({})", path, deleted_by, who)
        }
    }
}
