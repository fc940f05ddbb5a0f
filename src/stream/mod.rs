//! Ordered event fan-out to session subscribers

pub mod events;
pub mod streamer;

pub use events::{OrchestrationEvent, StreamEvent, EVENT_VERSION};
pub use streamer::{EventStreamer, EventSubscription};
