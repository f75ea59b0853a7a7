//! Firebase-style realtime database over HTTPS
//!
//! Each path maps to `{base_url}/{path}.json`. Writes use PUT (set),
//! PATCH (update) and POST (push, server generates the key). An access
//! token, if configured, is passed as the `auth` query parameter.

use super::{join_path, DocumentStore, StoreError};
use crate::infra::config::StoreConfig;
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Response body of a POST: the generated child key
#[derive(Debug, Deserialize)]
struct PushResponse {
    name: String,
}

pub struct RestStore {
    client: Client,
    base_url: String,
    auth_token: Option<String>,
}

impl RestStore {
    pub fn new(
        base_url: &str,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        // One client for the lifetime of the process (connection pooling)
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Client(e.to_string()))?;

        Ok(Self { client, base_url: base_url.trim_end_matches('/').to_string(), auth_token })
    }

    pub fn from_config(config: &StoreConfig) -> Result<Self, StoreError> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| StoreError::Client("store.url is not set".to_string()))?;
        Self::new(url, config.auth_token.clone(), Duration::from_millis(config.timeout_ms))
    }

    /// Document URL for a path
    pub fn url_for(&self, path: &str) -> String {
        let path = join_path("", path);
        if path.is_empty() {
            format!("{}/.json", self.base_url)
        } else {
            format!("{}/{}.json", self.base_url, path)
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, self.url_for(path));
        match &self.auth_token {
            Some(token) => builder.query(&[("auth", token.as_str())]),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder, path: &str) -> Result<reqwest::Response, StoreError> {
        let response = builder
            .send()
            .await
            .map_err(|source| StoreError::Http { path: path.to_string(), source })?;

        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::Status { status: status.as_u16(), path: path.to_string() });
        }
        debug!(path = %path, status = %status.as_u16(), "store_rest_ok");
        Ok(response)
    }
}

#[async_trait]
impl DocumentStore for RestStore {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        let response = self.request(Method::GET, path).send().await.map_err(|source| {
            StoreError::Http { path: path.to_string(), source }
        })?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(StoreError::Status {
                status: response.status().as_u16(),
                path: path.to_string(),
            });
        }
        let value: Value = response
            .json()
            .await
            .map_err(|source| StoreError::Http { path: path.to_string(), source })?;
        // Absent nodes read back as JSON null
        Ok(if value.is_null() { None } else { Some(value) })
    }

    async fn set(&self, path: &str, value: &Value) -> Result<(), StoreError> {
        self.send(self.request(Method::PUT, path).json(value), path).await?;
        Ok(())
    }

    async fn update(&self, path: &str, fields: &Value) -> Result<(), StoreError> {
        self.send(self.request(Method::PATCH, path).json(fields), path).await?;
        Ok(())
    }

    async fn push(&self, path: &str, value: &Value) -> Result<String, StoreError> {
        let response = self.send(self.request(Method::POST, path).json(value), path).await?;
        let body: PushResponse = response
            .json()
            .await
            .map_err(|source| StoreError::Http { path: path.to_string(), source })?;
        Ok(body.name)
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        self.send(self.request(Method::DELETE, path), path).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "rest"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_for_paths() {
        let store =
            RestStore::new("https://example.test/db/", None, Duration::from_secs(1)).unwrap();
        assert_eq!(store.url_for("rooms/room01"), "https://example.test/db/rooms/room01.json");
        assert_eq!(store.url_for("/live_data/room01/"), "https://example.test/db/live_data/room01.json");
        assert_eq!(store.url_for(""), "https://example.test/db/.json");
    }

    #[test]
    fn test_from_config_requires_url() {
        let config = StoreConfig::default();
        assert!(matches!(RestStore::from_config(&config), Err(StoreError::Client(_))));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transient() {
        let store =
            RestStore::new("http://127.0.0.1:1", None, Duration::from_millis(200)).unwrap();
        let err = store.set("rooms/room01", &serde_json::json!({"count": 0})).await.unwrap_err();
        assert!(matches!(err, StoreError::Http { .. }));
        assert!(err.is_transient());
    }
}
