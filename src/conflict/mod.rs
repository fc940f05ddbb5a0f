//! Conflict detection, scoring and resolution

pub mod detector;
pub mod diff;
pub mod registry;
pub mod types;

pub use detector::ConflictDetector;
pub use registry::{ConflictRegistry, ConflictUpdate};
pub use types::{
    ConflictCandidate, ConflictStatus, ConflictType, MergeConflict, Resolution, ResolutionChoice,
    Severity,
};
