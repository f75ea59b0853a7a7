//! MQTT mirror of the document tree
//!
//! Each document path becomes the topic `{prefix}/{path}` and the retained
//! message on that topic is always the whole current document:
//! - `set` publishes the document retained
//! - `update` merges the fields into the last published copy and republishes
//!   the merged document retained on the same topic
//! - `push` publishes a non-retained message under a generated child key
//! - `delete` clears the retained message of the path and of every cached
//!   document below it
//!
//! Reads are not possible over MQTT, so merge bases come from a local cache.
//! Documents that have been updated stay cached until deleted; documents only
//! ever `set` are kept in a small bounded cache in case an update follows.

use super::memory::MemoryStore;
use super::{join_path, push_key, DocumentStore, StoreError};
use crate::infra::config::StoreConfig;
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use rustc_hash::FxHashMap;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Set-only documents remembered as merge bases
const RECENT_SET_CAPACITY: usize = 256;

/// One message to send
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

/// Last published copy of each document, keyed by canonical path
#[derive(Debug, Default)]
struct RetainedDocuments {
    updated: FxHashMap<String, Value>,
    recent: FxHashMap<String, Value>,
    recent_order: VecDeque<String>,
}

impl RetainedDocuments {
    fn set(&mut self, path: &str, value: Value) {
        if let Some(doc) = self.updated.get_mut(path) {
            *doc = value;
            return;
        }
        if self.recent.insert(path.to_string(), value).is_none() {
            self.recent_order.push_back(path.to_string());
        }
        while self.recent_order.len() > RECENT_SET_CAPACITY {
            if let Some(oldest) = self.recent_order.pop_front() {
                self.recent.remove(&oldest);
            }
        }
    }

    /// Merge `fields` into the cached document and return the result
    fn merge(&mut self, path: &str, fields: &Map<String, Value>) -> Value {
        let base = self.updated.remove(path).or_else(|| {
            let doc = self.recent.remove(path)?;
            self.recent_order.retain(|p| p != path);
            Some(doc)
        });
        let mut doc = base.filter(Value::is_object).unwrap_or_else(|| Value::Object(Map::new()));
        for (key, value) in fields {
            MemoryStore::write(&mut doc, key, value.clone());
        }
        self.updated.insert(path.to_string(), doc.clone());
        doc
    }

    /// Forget `path` and everything below it; returns the forgotten paths
    fn remove_subtree(&mut self, path: &str) -> Vec<String> {
        let prefix = format!("{path}/");
        let below = |p: &String| p == path || p.starts_with(&prefix);

        let mut removed: Vec<String> =
            self.updated.keys().chain(self.recent.keys()).filter(|p| below(p)).cloned().collect();
        removed.sort();
        removed.dedup();

        self.updated.retain(|p, _| !below(p));
        self.recent.retain(|p, _| !below(p));
        self.recent_order.retain(|p| !below(p));
        removed
    }
}

pub struct MqttStore {
    client: AsyncClient,
    topic_prefix: String,
    documents: Mutex<RetainedDocuments>,
}

impl MqttStore {
    /// Connect to the configured broker; the event loop runs on its own task
    pub fn from_config(config: &StoreConfig) -> Self {
        let client_id = format!("doorway-occupancy-{}", std::process::id());
        let mut mqttoptions = MqttOptions::new(client_id, &config.mqtt_host, config.mqtt_port);
        mqttoptions.set_keep_alive(Duration::from_secs(30));
        mqttoptions.set_clean_session(true);

        if let (Some(username), Some(password)) = (&config.mqtt_username, &config.mqtt_password) {
            mqttoptions.set_credentials(username, password);
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);

        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("store_mqtt_connected");
                    }
                    Ok(Event::Incoming(Packet::PubAck(_))) => {
                        debug!("store_mqtt_puback");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "store_mqtt_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Self {
            client,
            topic_prefix: config.mqtt_topic_prefix.clone(),
            documents: Mutex::new(RetainedDocuments::default()),
        }
    }

    pub fn topic_for(&self, path: &str) -> String {
        join_path(&self.topic_prefix, path)
    }

    fn retained(&self, path: &str, value: &Value) -> Result<Outgoing, StoreError> {
        Ok(Outgoing { topic: self.topic_for(path), payload: serde_json::to_vec(value)?, retain: true })
    }

    /// An empty retained payload clears the topic
    fn cleared(&self, path: &str) -> Outgoing {
        Outgoing { topic: self.topic_for(path), payload: Vec::new(), retain: true }
    }

    pub fn plan_set(&self, path: &str, value: &Value) -> Result<Outgoing, StoreError> {
        let path = join_path(path, "");
        if value.is_null() {
            self.documents.lock().remove_subtree(&path);
            return Ok(self.cleared(&path));
        }
        let outgoing = self.retained(&path, value)?;
        self.documents.lock().set(&path, value.clone());
        Ok(outgoing)
    }

    pub fn plan_update(&self, path: &str, fields: &Value) -> Result<Outgoing, StoreError> {
        let Some(map) = fields.as_object() else {
            return self.plan_set(path, fields);
        };
        let path = join_path(path, "");
        let merged = self.documents.lock().merge(&path, map);
        if merged.as_object().is_some_and(Map::is_empty) {
            return Ok(self.cleared(&path));
        }
        self.retained(&path, &merged)
    }

    pub fn plan_delete(&self, path: &str) -> Vec<Outgoing> {
        let path = join_path(path, "");
        let mut paths = self.documents.lock().remove_subtree(&path);
        if !paths.contains(&path) {
            paths.insert(0, path);
        }
        paths.iter().map(|p| self.cleared(p)).collect()
    }

    async fn send(&self, outgoing: Outgoing) -> Result<(), StoreError> {
        let Outgoing { topic, payload, retain } = outgoing;
        self.client
            .publish(topic.as_str(), QoS::AtLeastOnce, retain, payload)
            .await
            .map_err(|source| StoreError::Mqtt { topic, source })
    }
}

#[async_trait]
impl DocumentStore for MqttStore {
    async fn get(&self, _path: &str) -> Result<Option<Value>, StoreError> {
        Err(StoreError::Unsupported { backend: "mqtt", op: "get" })
    }

    async fn set(&self, path: &str, value: &Value) -> Result<(), StoreError> {
        let outgoing = self.plan_set(path, value)?;
        self.send(outgoing).await
    }

    async fn update(&self, path: &str, fields: &Value) -> Result<(), StoreError> {
        let outgoing = self.plan_update(path, fields)?;
        self.send(outgoing).await
    }

    async fn push(&self, path: &str, value: &Value) -> Result<String, StoreError> {
        let key = push_key();
        let topic = self.topic_for(&join_path(path, &key));
        self.send(Outgoing { topic, payload: serde_json::to_vec(value)?, retain: false }).await?;
        Ok(key)
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        for outgoing in self.plan_delete(path) {
            self.send(outgoing).await?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "mqtt"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> MqttStore {
        let config = StoreConfig { mqtt_topic_prefix: "campus".to_string(), ..Default::default() };
        MqttStore::from_config(&config)
    }

    fn payload(outgoing: &Outgoing) -> Value {
        serde_json::from_slice(&outgoing.payload).unwrap()
    }

    #[tokio::test]
    async fn test_topic_for_uses_prefix() {
        let config = StoreConfig { mqtt_topic_prefix: "campus/occupancy/".to_string(), ..Default::default() };
        let store = MqttStore::from_config(&config);
        assert_eq!(store.topic_for("rooms/room01"), "campus/occupancy/rooms/room01");
        assert_eq!(store.topic_for("/live_data/room01"), "campus/occupancy/live_data/room01");
    }

    #[tokio::test]
    async fn test_get_is_unsupported() {
        let store = MqttStore::from_config(&StoreConfig::default());
        let err = store.get("rooms").await.unwrap_err();
        assert!(matches!(err, StoreError::Unsupported { op: "get", .. }));
    }

    #[tokio::test]
    async fn test_set_then_update_republishes_whole_document() {
        let store = store();

        let init = store
            .plan_set("rooms/room01", &json!({"count": 0, "lastEvent": "INIT", "lastUpdate": "t0"}))
            .unwrap();
        assert_eq!(init.topic, "campus/rooms/room01");
        assert!(init.retain);

        let enter = store
            .plan_update("rooms/room01", &json!({"count": 1, "lastEvent": "ENTER", "lastUpdate": "t1"}))
            .unwrap();
        assert_eq!(enter.topic, "campus/rooms/room01");
        assert!(enter.retain);
        assert_eq!(payload(&enter), json!({"count": 1, "lastEvent": "ENTER", "lastUpdate": "t1"}));

        let partial = store.plan_update("/rooms/room01/", &json!({"count": 0})).unwrap();
        assert_eq!(partial.topic, "campus/rooms/room01");
        assert_eq!(payload(&partial), json!({"count": 0, "lastEvent": "ENTER", "lastUpdate": "t1"}));
    }

    #[tokio::test]
    async fn test_update_without_set_builds_document() {
        let store = store();
        store.plan_update("sessions/room01/s1", &json!({"started_at": "t0"})).unwrap();
        let ended = store.plan_update("sessions/room01/s1", &json!({"ended_at": "t9"})).unwrap();
        assert_eq!(payload(&ended), json!({"started_at": "t0", "ended_at": "t9"}));
    }

    #[tokio::test]
    async fn test_set_after_update_replaces_cached_document() {
        let store = store();
        store.plan_update("rooms/room01", &json!({"count": 4, "lastEvent": "ENTER"})).unwrap();
        store.plan_set("rooms/room01", &json!({"count": 0})).unwrap();
        let next = store.plan_update("rooms/room01", &json!({"lastEvent": "EXIT"})).unwrap();
        assert_eq!(payload(&next), json!({"count": 0, "lastEvent": "EXIT"}));
    }

    #[tokio::test]
    async fn test_set_only_cache_is_bounded() {
        let store = store();
        for i in 0..RECENT_SET_CAPACITY + 50 {
            store.plan_set(&format!("sessions/r/s/data/{i}"), &json!({"i": i})).unwrap();
        }
        let docs = store.documents.lock();
        assert_eq!(docs.recent.len(), RECENT_SET_CAPACITY);
        assert_eq!(docs.recent_order.len(), RECENT_SET_CAPACITY);
        assert!(!docs.recent.contains_key("sessions/r/s/data/0"));
    }

    #[tokio::test]
    async fn test_delete_clears_cached_descendants() {
        let store = store();
        store.plan_set("rooms/room01", &json!({"count": 0})).unwrap();
        store.plan_update("rooms/room02", &json!({"count": 2})).unwrap();
        store.plan_set("live_data/room01", &json!({"x": 1})).unwrap();

        let cleared = store.plan_delete("rooms");
        let topics: Vec<&str> = cleared.iter().map(|o| o.topic.as_str()).collect();
        assert_eq!(topics, vec!["campus/rooms", "campus/rooms/room01", "campus/rooms/room02"]);
        assert!(cleared.iter().all(|o| o.retain && o.payload.is_empty()));

        // The merge base is gone with the document
        let fresh = store.plan_update("rooms/room02", &json!({"lastEvent": "EXIT"})).unwrap();
        assert_eq!(payload(&fresh), json!({"lastEvent": "EXIT"}));
    }
}
