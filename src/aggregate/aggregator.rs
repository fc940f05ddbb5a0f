use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use super::content::ContentKind;
use crate::config::ConflictConfig;
use crate::conflict::{
    ConflictCandidate, ConflictDetector, ConflictRegistry, ConflictUpdate, MergeConflict,
    Resolution, ResolutionChoice,
};
use crate::core::{OrchestraError, Result};
use crate::executor::{OutputFile, TaskOutput};
use crate::model::{ConflictId, SessionId, TaskId};

/// One path in the merged project tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedFile {
    pub path: String,
    /// `None` marks a deletion
    pub content: Option<String>,
    pub kind: ContentKind,
    pub contributors: Vec<TaskId>,
    /// Tasks whose proposal is the stored content
    #[serde(skip)]
    content_owners: Vec<TaskId>,
    pub updated_at: DateTime<Utc>,
}

impl AggregatedFile {
    fn new(path: &str, task_id: &str, content: Option<String>, kind: ContentKind) -> Self {
        Self {
            path: path.to_string(),
            content,
            kind,
            contributors: vec![task_id.to_string()],
            content_owners: vec![task_id.to_string()],
            updated_at: Utc::now(),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.content.is_none()
    }

    pub fn content_length(&self) -> usize {
        self.content.as_ref().map(String::len).unwrap_or(0)
    }

    fn owner_candidates(&self) -> Vec<ConflictCandidate> {
        let owners = if self.content_owners.is_empty() {
            &self.contributors[..1.min(self.contributors.len())]
        } else {
            &self.content_owners[..]
        };
        owners
            .iter()
            .map(|task_id| ConflictCandidate {
                task_id: task_id.clone(),
                content: self.content.clone(),
                kind: self.kind.clone(),
            })
            .collect()
    }
}

/// What one call to [`ResultAggregator::aggregate`] did
#[derive(Debug, Clone, Default)]
pub struct AggregationReport {
    pub task_id: TaskId,
    /// Paths seen for the first time
    pub created: Vec<String>,
    /// Paths where the task wrote the content already stored
    pub unchanged: Vec<String>,
    /// Paths the task had already contributed to
    pub skipped: Vec<String>,
    pub conflicts: Vec<ConflictUpdate>,
    pub auto_resolved: Vec<MergeConflict>,
}

impl AggregationReport {
    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.created
            .iter()
            .chain(self.unchanged.iter())
            .chain(self.conflicts.iter().map(|c| &c.conflict().path))
    }
}

/// Merges task outputs into one file set and tracks conflicts
///
/// Per-path updates run under the map entry's shard lock. Readers take
/// snapshots shard by shard.
pub struct ResultAggregator {
    session_id: SessionId,
    files: DashMap<String, AggregatedFile>,
    conflicts: ConflictRegistry,
    auto_resolve: bool,
}

impl ResultAggregator {
    pub fn new(session_id: SessionId, config: &ConflictConfig) -> Result<Self> {
        let detector = ConflictDetector::new(config)?;
        Ok(Self {
            session_id,
            files: DashMap::new(),
            conflicts: ConflictRegistry::new(session_id, detector),
            auto_resolve: config.auto_resolve,
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Fold one completed task's output into the file set
    #[instrument(
        skip(self, output),
        fields(session_id = %self.session_id, files = output.files.len())
    )]
    pub fn aggregate(&self, task_id: &str, output: &TaskOutput) -> AggregationReport {
        let mut report = AggregationReport {
            task_id: task_id.to_string(),
            ..Default::default()
        };

        for (path, file) in &output.files {
            let (content, kind) = match file {
                OutputFile::Write { content, language } => (
                    Some(content.clone()),
                    ContentKind::detect(path, language.as_deref(), content),
                ),
                OutputFile::Delete => (None, ContentKind::for_path(path)),
            };

            match self.files.entry(path.clone()) {
                Entry::Vacant(vacant) => {
                    vacant.insert(AggregatedFile::new(path, task_id, content, kind));
                    report.created.push(path.clone());
                }
                Entry::Occupied(mut occupied) => {
                    let existing = occupied.get_mut();
                    if existing.contributors.iter().any(|t| t == task_id) {
                        debug!(task_id, path = %path, "Task already contributed to path, skipping");
                        report.skipped.push(path.clone());
                        continue;
                    }
                    existing.contributors.push(task_id.to_string());
                    existing.updated_at = Utc::now();

                    let incoming = ConflictCandidate {
                        task_id: task_id.to_string(),
                        content: content.clone(),
                        kind,
                    };

                    if existing.content == content {
                        existing.content_owners.push(task_id.to_string());
                        match self.conflicts.join_open(path, incoming) {
                            Some(conflict) => {
                                report.conflicts.push(ConflictUpdate::Extended(conflict))
                            }
                            None => report.unchanged.push(path.clone()),
                        }
                        continue;
                    }

                    let update =
                        self.conflicts
                            .record_divergence(path, existing.owner_candidates(), incoming);

                    if self.auto_resolve {
                        if let Some(merged) =
                            self.conflicts.detector().try_auto_merge(update.conflict())
                        {
                            let id = update.conflict().id;
                            let resolution = Resolution::AutoMerged {
                                content: merged.clone(),
                            };
                            if let Ok(resolved) =
                                self.conflicts
                                    .mark_resolved(id, resolution, Some("auto".to_string()))
                            {
                                existing.content = Some(merged);
                                existing.content_owners = resolved.contributors.clone();
                                report.conflicts.push(update);
                                report.auto_resolved.push(resolved);
                                continue;
                            }
                        }
                    }
                    report.conflicts.push(update);
                }
            }
        }

        debug!(
            task_id,
            created = report.created.len(),
            unchanged = report.unchanged.len(),
            conflicts = report.conflicts.len(),
            "Aggregated task output"
        );
        report
    }

    /// Apply a resolution choice to an open conflict
    ///
    /// `ResolutionChoice::Auto` returns the conflict still open when no
    /// unambiguous merge exists.
    pub fn resolve(
        &self,
        conflict_id: ConflictId,
        choice: ResolutionChoice,
        resolved_by: Option<String>,
    ) -> Result<MergeConflict> {
        let path = self.conflicts.open_snapshot(conflict_id)?.path;

        // File entry first, then the conflict record
        let mut file = self
            .files
            .get_mut(&path)
            .ok_or_else(|| OrchestraError::internal(format!("no aggregated file for {}", path)))?;
        let conflict = self.conflicts.open_snapshot(conflict_id)?;

        let (resolution, content, kind, owners) = match choice {
            ResolutionChoice::WinningTask(task_id) => {
                let winner = conflict.candidate(&task_id).ok_or_else(|| {
                    OrchestraError::UnknownContributor {
                        conflict_id,
                        task_id: task_id.clone(),
                    }
                })?;
                let owners: Vec<TaskId> = conflict
                    .candidates
                    .iter()
                    .filter(|c| c.content == winner.content)
                    .map(|c| c.task_id.clone())
                    .collect();
                (
                    Resolution::WinningTask {
                        task_id: task_id.clone(),
                    },
                    winner.content.clone(),
                    winner.kind.clone(),
                    owners,
                )
            }
            ResolutionChoice::MergedContent(merged) => {
                let kind = ContentKind::detect(&path, None, &merged);
                (
                    Resolution::MergedContent {
                        content: merged.clone(),
                    },
                    Some(merged),
                    kind,
                    conflict.contributors.clone(),
                )
            }
            ResolutionChoice::Auto => match self.conflicts.detector().try_auto_merge(&conflict) {
                Some(merged) => (
                    Resolution::AutoMerged {
                        content: merged.clone(),
                    },
                    Some(merged),
                    file.kind.clone(),
                    conflict.contributors.clone(),
                ),
                None => {
                    info!(
                        conflict_id = %conflict_id,
                        path = %path,
                        "No unambiguous merge, conflict stays open"
                    );
                    return Ok(conflict);
                }
            },
        };

        let resolved = self
            .conflicts
            .mark_resolved(conflict_id, resolution, resolved_by)?;
        file.content = content;
        file.kind = kind;
        file.content_owners = owners;
        file.updated_at = Utc::now();
        Ok(resolved)
    }

    /// Point-in-time copy of every aggregated file, sorted by path
    pub fn snapshot(&self) -> Vec<AggregatedFile> {
        let mut files: Vec<AggregatedFile> =
            self.files.iter().map(|entry| entry.value().clone()).collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        files
    }

    pub fn file(&self, path: &str) -> Option<AggregatedFile> {
        self.files.get(path).map(|f| f.clone())
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn conflicts(&self) -> Vec<MergeConflict> {
        self.conflicts.list()
    }

    pub fn conflict(&self, id: ConflictId) -> Option<MergeConflict> {
        self.conflicts.get(id)
    }

    pub fn has_open_conflicts(&self) -> bool {
        self.conflicts.has_open()
    }

    pub fn open_conflict_count(&self) -> usize {
        self.conflicts.open_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::{ConflictStatus, ConflictType, Severity};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use uuid::Uuid;

    fn aggregator(auto_resolve: bool) -> ResultAggregator {
        let config = ConflictConfig {
            auto_resolve,
            ..Default::default()
        };
        ResultAggregator::new(Uuid::new_v4(), &config).unwrap()
    }

    fn write(path: &str, content: &str) -> TaskOutput {
        TaskOutput::new().with_file(path, OutputFile::write(content))
    }

    #[test]
    fn test_identical_writes_share_the_file() {
        let agg = aggregator(false);
        agg.aggregate("a", &write("README.md", "# App\n"));
        let report = agg.aggregate("b", &write("README.md", "# App\n"));
        assert_eq!(report.unchanged, vec!["README.md".to_string()]);
        let file = agg.file("README.md").unwrap();
        assert_eq!(file.contributors, vec!["a", "b"]);
        assert!(agg.conflicts().is_empty());
    }

    #[test]
    fn test_divergent_write_keeps_first_content() {
        let agg = aggregator(false);
        agg.aggregate("a", &write("config.json", "x"));
        let report = agg.aggregate("b", &write("config.json", "y"));
        assert_eq!(report.conflicts.len(), 1);
        let conflict = report.conflicts[0].conflict();
        assert_eq!(conflict.contributors, vec!["a", "b"]);
        assert_eq!(conflict.conflict_type, ConflictType::Content);
        assert_eq!(agg.file("config.json").unwrap().content.as_deref(), Some("x"));
        assert!(agg.has_open_conflicts());
    }

    #[test]
    fn test_aggregation_is_idempotent() {
        let agg = aggregator(false);
        let output = write("src/lib.rs", "pub fn a() {}");
        agg.aggregate("a", &output);
        let before = agg.snapshot();
        let report = agg.aggregate("a", &output);
        assert_eq!(report.skipped, vec!["src/lib.rs".to_string()]);
        assert_eq!(agg.snapshot(), before);
    }

    #[test]
    fn test_third_writer_joins_open_conflict() {
        let agg = aggregator(false);
        agg.aggregate("a", &write("config.json", "x"));
        agg.aggregate("b", &write("config.json", "y"));
        agg.aggregate("c", &write("config.json", "z"));
        agg.aggregate("d", &write("config.json", "x"));
        let conflicts = agg.conflicts();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].contributors, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_delete_against_write_is_structural() {
        let agg = aggregator(false);
        agg.aggregate("a", &write("old.txt", "legacy"));
        let delete = TaskOutput::new().with_file("old.txt", OutputFile::Delete);
        let report = agg.aggregate("b", &delete);
        assert!(matches!(
            report.conflicts[0].conflict().conflict_type,
            ConflictType::Structural { ref deleted_by } if deleted_by == "b"
        ));
    }

    #[test]
    fn test_resolve_with_winner_and_once_only() {
        let agg = aggregator(false);
        agg.aggregate("a", &write("config.json", "x"));
        let id = agg.aggregate("b", &write("config.json", "y")).conflicts[0]
            .conflict()
            .id;

        let err = agg
            .resolve(id, ResolutionChoice::WinningTask("ghost".into()), None)
            .unwrap_err();
        assert!(matches!(err, OrchestraError::UnknownContributor { .. }));

        let resolved = agg
            .resolve(id, ResolutionChoice::WinningTask("b".into()), Some("reviewer".into()))
            .unwrap();
        assert_eq!(resolved.status, ConflictStatus::Resolved);
        assert_eq!(resolved.resolved_by.as_deref(), Some("reviewer"));
        let file = agg.file("config.json").unwrap();
        assert_eq!(file.content.as_deref(), Some("y"));
        assert_eq!(file.contributors, vec!["a", "b"]);

        let again = agg.resolve(id, ResolutionChoice::MergedContent("z".into()), None);
        assert!(matches!(again, Err(OrchestraError::AlreadyResolved { .. })));
    }

    #[test]
    fn test_new_episode_after_resolution() {
        let agg = aggregator(false);
        agg.aggregate("a", &write("config.json", "x"));
        let first = agg.aggregate("b", &write("config.json", "y")).conflicts[0]
            .conflict()
            .id;
        agg.resolve(first, ResolutionChoice::MergedContent("xy".into()), None)
            .unwrap();
        let second = agg.aggregate("c", &write("config.json", "z")).conflicts[0]
            .conflict()
            .clone();
        assert!(second.id != first);
        assert_eq!(second.contributors, vec!["a", "b", "c"]);
        assert_eq!(agg.conflicts().len(), 2);
    }

    #[test]
    fn test_auto_resolve_on_detection() {
        let agg = aggregator(true);
        agg.aggregate("a", &write("README.md", "# App\nIntro\n"));
        let report = agg.aggregate("b", &write("README.md", "# App\nIntro\nUsage\n"));
        assert_eq!(report.auto_resolved.len(), 1);
        assert!(!agg.has_open_conflicts());
        assert_eq!(
            agg.file("README.md").unwrap().content.as_deref(),
            Some("# App\nIntro\nUsage\n")
        );
    }

    #[test]
    fn test_auto_resolve_never_touches_critical_paths() {
        let agg = aggregator(true);
        agg.aggregate("a", &write("package.json", "{\n}\n"));
        let report = agg.aggregate("b", &write("package.json", "{\n  \"name\": \"app\"\n}\n"));
        assert!(report.auto_resolved.is_empty());
        let conflict = report.conflicts[0].conflict();
        assert_eq!(conflict.severity, Severity::Critical);
        let still_open = agg.resolve(conflict.id, ResolutionChoice::Auto, None).unwrap();
        assert!(still_open.is_open());
    }

    #[test]
    fn test_concurrent_writers_on_one_path() {
        let agg = Arc::new(aggregator(false));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let agg = Arc::clone(&agg);
                std::thread::spawn(move || {
                    agg.aggregate(&format!("t{}", i), &write("shared.txt", &format!("v{}", i % 2)));
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let file = agg.file("shared.txt").unwrap();
        assert_eq!(file.contributors.len(), 8);
        let conflicts = agg.conflicts();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].contributors.len(), 8);
    }
}
