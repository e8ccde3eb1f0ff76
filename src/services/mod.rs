//! Services - classification logic
//!
//! - `features` - feature derivation from flow aggregates and mission metadata
//! - `classifier` - classifier interface and the tree-ensemble model
//! - `pipeline` - per-mission query, classify and persist orchestration

pub mod classifier;
pub mod features;
pub mod pipeline;

// Re-export commonly used types
pub use classifier::{Classifier, TreeEnsemble};
pub use features::derive_features;
pub use pipeline::{AggregateSource, ClassificationOutcome, ClassificationPipeline, ResultSink};
