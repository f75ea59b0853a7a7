//! Services - occupancy logic
//!
//! - `crossing` - Directional crossing detection with adaptive debounce
//! - `aggregator` - Rolling environmental feature window
//! - `model` - Regression model artifacts
//! - `scorer` - Crowdiness scoring strategies
//! - `pipeline` - Per-doorway processing loop and supervisor

pub mod aggregator;
pub mod crossing;
pub mod model;
pub mod pipeline;
pub mod scorer;

// Re-export commonly used types
pub use aggregator::RollingAggregator;
pub use crossing::CrossingDetector;
pub use pipeline::{DoorwayPipeline, DoorwayRunner};
pub use scorer::CrowdinessEstimator;
