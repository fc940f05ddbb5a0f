use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::detector::ConflictDetector;
use super::types::{ConflictCandidate, ConflictStatus, MergeConflict, Resolution};
use crate::core::{OrchestraError, Result};
use crate::model::{ConflictId, SessionId, TaskId};

/// Result of recording a write against a path that has diverged
#[derive(Debug, Clone)]
pub enum ConflictUpdate {
    Opened(MergeConflict),
    Extended(MergeConflict),
}

impl ConflictUpdate {
    pub fn conflict(&self) -> &MergeConflict {
        match self {
            ConflictUpdate::Opened(c) | ConflictUpdate::Extended(c) => c,
        }
    }
}

/// Conflict records for one session
///
/// Callers hold the aggregated file's entry while calling the mutating
/// methods here, so file locks are always taken before conflict locks.
pub struct ConflictRegistry {
    session_id: SessionId,
    detector: ConflictDetector,
    conflicts: DashMap<ConflictId, MergeConflict>,
    open_by_path: DashMap<String, ConflictId>,
    order: Mutex<Vec<ConflictId>>,
}

impl ConflictRegistry {
    pub fn new(session_id: SessionId, detector: ConflictDetector) -> Self {
        Self {
            session_id,
            detector,
            conflicts: DashMap::new(),
            open_by_path: DashMap::new(),
            order: Mutex::new(Vec::new()),
        }
    }

    pub fn detector(&self) -> &ConflictDetector {
        &self.detector
    }

    pub fn open_for(&self, path: &str) -> Option<ConflictId> {
        self.open_by_path.get(path).map(|id| *id)
    }

    /// Add `incoming` to the open record for `path`, or open one against `current`
    ///
    /// `current` holds one candidate per task backing the stored content.
    pub fn record_divergence(
        &self,
        path: &str,
        current: Vec<ConflictCandidate>,
        incoming: ConflictCandidate,
    ) -> ConflictUpdate {
        if let Some(extended) = self.join_open(path, incoming.clone()) {
            return ConflictUpdate::Extended(extended);
        }

        let mut candidates: Vec<ConflictCandidate> = Vec::with_capacity(current.len() + 1);
        for candidate in current.into_iter().chain(std::iter::once(incoming)) {
            if !candidates.iter().any(|c| c.task_id == candidate.task_id) {
                candidates.push(candidate);
            }
        }
        let contributors: Vec<TaskId> = candidates.iter().map(|c| c.task_id.clone()).collect();
        let conflict = self
            .detector
            .detect(self.session_id, path, contributors, candidates);
        self.open_by_path.insert(path.to_string(), conflict.id);
        self.conflicts.insert(conflict.id, conflict.clone());
        self.order.lock().push(conflict.id);
        info!(
            session_id = %self.session_id,
            conflict_id = %conflict.id,
            path = %path,
            severity = ?conflict.severity,
            "Merge conflict opened"
        );
        ConflictUpdate::Opened(conflict)
    }

    /// Append a contributor to the open record for `path`, if there is one
    pub fn join_open(&self, path: &str, incoming: ConflictCandidate) -> Option<MergeConflict> {
        let id = self.open_for(path)?;
        let mut conflict = self.conflicts.get_mut(&id)?;
        if !conflict.is_open() {
            return None;
        }
        self.detector.extend(&mut conflict, incoming);
        debug!(
            conflict_id = %id,
            path = %path,
            contributors = conflict.contributors.len(),
            "Merge conflict extended"
        );
        Some(conflict.clone())
    }

    pub fn get(&self, id: ConflictId) -> Option<MergeConflict> {
        self.conflicts.get(&id).map(|c| c.clone())
    }

    /// Current state of an open conflict, for the start of a resolution
    pub fn open_snapshot(&self, id: ConflictId) -> Result<MergeConflict> {
        let conflict = self.get(id).ok_or(OrchestraError::ConflictNotFound(id))?;
        if !conflict.is_open() {
            return Err(OrchestraError::AlreadyResolved { conflict_id: id });
        }
        Ok(conflict)
    }

    /// Move a conflict to Resolved, re-checking under its lock that it is still open
    pub fn mark_resolved(
        &self,
        id: ConflictId,
        resolution: Resolution,
        resolved_by: Option<String>,
    ) -> Result<MergeConflict> {
        let mut conflict = self
            .conflicts
            .get_mut(&id)
            .ok_or(OrchestraError::ConflictNotFound(id))?;
        if !conflict.is_open() {
            return Err(OrchestraError::AlreadyResolved { conflict_id: id });
        }
        conflict.status = ConflictStatus::Resolved;
        conflict.resolution = Some(resolution);
        conflict.resolved_by = resolved_by;
        conflict.resolved_at = Some(Utc::now());
        let resolved = conflict.clone();
        drop(conflict);

        self.open_by_path
            .remove_if(&resolved.path, |_, open_id| *open_id == id);
        info!(
            session_id = %self.session_id,
            conflict_id = %id,
            path = %resolved.path,
            resolution = ?resolved.resolution,
            "Merge conflict resolved"
        );
        Ok(resolved)
    }

    /// All conflicts in detection order
    pub fn list(&self) -> Vec<MergeConflict> {
        let order = self.order.lock().clone();
        order.into_iter().filter_map(|id| self.get(id)).collect()
    }

    pub fn open_count(&self) -> usize {
        self.open_by_path.len()
    }

    pub fn has_open(&self) -> bool {
        !self.open_by_path.is_empty()
    }
}
