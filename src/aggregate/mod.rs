//! Result aggregation into a single project file set

pub mod aggregator;
pub mod content;
pub mod extract;

pub use aggregator::{AggregatedFile, AggregationReport, ResultAggregator};
pub use content::ContentKind;
pub use extract::{extract_files, ExtractedFile};
