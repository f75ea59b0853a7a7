//! I/O - external interfaces
//!
//! - `source` - Serial, stdin and child-process line sources
//! - `store` - Document store backends (REST, MQTT, in-memory)
//! - `publisher` - Bounded publish queue and store writer
//! - `dataset` - CSV recording of published snapshots
//! - `prometheus` - Metrics HTTP endpoint

pub mod dataset;
pub mod prometheus;
pub mod publisher;
pub mod source;
pub mod store;

// Re-export commonly used types
pub use publisher::{PublishError, PublishQueue, PublishWorker, Publisher};
pub use source::LineSource;
pub use store::{DocumentStore, StoreError};
