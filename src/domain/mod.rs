//! Domain models - core sensor and occupancy types
//!
//! This module contains the canonical data types used throughout the system:
//! - `SensorSample` / `EnvironmentSample` - one parsed reading from a doorway
//! - `CrossingEvent` - a directional ENTER/EXIT crossing
//! - `AggregatedFeatures` / `OccupancySnapshot` - periodic crowdiness output
//! - `reading` - the line grammar spoken by the sensor boards

pub mod reading;
pub mod types;

// Re-export commonly used types at module level
pub use reading::{parse_line, ParseError};
pub use types::{
    epoch_ms, iso_timestamp, AggregatedFeatures, CrossingEvent, CrossingKind, CrowdLevel,
    EnvironmentSample, OccupancySnapshot, Reading, SensorMode, SensorSample,
};
