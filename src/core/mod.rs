// Infrastructure shared by the graph, scheduler, aggregator and streamer

pub mod errors;
pub mod usage;

pub use errors::{OrchestraError, Result};
pub use usage::{ResourceUsage, UsageTracker};
