//! Document store backends
//!
//! Everything the publisher writes goes through [`DocumentStore`]: a tree of
//! JSON documents addressed by slash-separated paths. Backends:
//! - `rest` - Firebase-style realtime database over HTTPS
//! - `mqtt` - mirrors writes to retained MQTT topics
//! - `memory` - in-process tree for dry runs and tests

pub mod memory;
pub mod mqtt;
pub mod rest;

pub use memory::MemoryStore;
pub use mqtt::MqttStore;
pub use rest::RestStore;

use crate::infra::config::{Config, StoreBackend};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("http request to {path} failed: {source}")]
    Http {
        path: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("store returned {status} for {path}")]
    Status { status: u16, path: String },

    #[error("mqtt publish to {topic} failed: {source}")]
    Mqtt {
        topic: String,
        #[source]
        source: rumqttc::ClientError,
    },

    #[error("failed to encode document: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("{backend} backend does not support {op}")]
    Unsupported { backend: &'static str, op: &'static str },

    #[error("failed to build store client: {0}")]
    Client(String),
}

impl StoreError {
    /// Whether retrying the same write could succeed
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Http { .. } | StoreError::Mqtt { .. } => true,
            StoreError::Status { status, .. } => *status == 429 || *status >= 500,
            StoreError::Encode(_) | StoreError::Unsupported { .. } | StoreError::Client(_) => false,
        }
    }
}

/// Hierarchical JSON document store
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Read the document at `path`, `None` when absent
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError>;

    /// Replace the document at `path`
    async fn set(&self, path: &str, value: &Value) -> Result<(), StoreError>;

    /// Merge the fields of an object into the document at `path`
    async fn update(&self, path: &str, fields: &Value) -> Result<(), StoreError>;

    /// Append a child under `path` with a generated, time-ordered key
    async fn push(&self, path: &str, value: &Value) -> Result<String, StoreError>;

    /// Remove the document at `path` and everything below it
    async fn delete(&self, path: &str) -> Result<(), StoreError>;

    fn name(&self) -> &'static str;
}

/// Split a path into its non-empty segments
pub fn path_segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Join segments into a canonical path without leading or trailing slashes
pub fn join_path(base: &str, child: &str) -> String {
    path_segments(base).chain(path_segments(child)).collect::<Vec<_>>().join("/")
}

/// Generate a time-ordered push key
pub fn push_key() -> String {
    uuid::Uuid::now_v7().simple().to_string()
}

/// Build the configured backend
pub fn create_store(config: &Config) -> Result<Arc<dyn DocumentStore>, StoreError> {
    let store: Arc<dyn DocumentStore> = match config.store_backend() {
        StoreBackend::Rest => Arc::new(RestStore::from_config(config.store())?),
        StoreBackend::Mqtt => Arc::new(MqttStore::from_config(config.store())),
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
    };
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_path_normalizes_slashes() {
        assert_eq!(join_path("rooms/", "/room01"), "rooms/room01");
        assert_eq!(join_path("", "live_data"), "live_data");
        assert_eq!(join_path("sessions//a", ""), "sessions/a");
    }

    #[test]
    fn test_push_keys_are_unique() {
        let a = push_key();
        let b = push_key();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::Status { status: 503, path: "x".into() }.is_transient());
        assert!(StoreError::Status { status: 429, path: "x".into() }.is_transient());
        assert!(!StoreError::Status { status: 401, path: "x".into() }.is_transient());
        assert!(!StoreError::Unsupported { backend: "mqtt", op: "get" }.is_transient());
    }
}
