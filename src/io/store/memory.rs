//! In-process document tree
//!
//! Mirrors realtime-database semantics closely enough for dry runs: writing
//! `null` removes a node, `update` merges per key and keys may themselves be
//! sub-paths, and empty objects disappear.

use super::{path_segments, push_key, DocumentStore, StoreError};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};

#[derive(Debug)]
pub struct MemoryStore {
    root: Mutex<Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self { root: Mutex::new(Value::Object(Map::new())) }
    }

    /// Copy of the whole tree
    pub fn snapshot(&self) -> Value {
        self.root.lock().clone()
    }

    fn read(root: &Value, path: &str) -> Option<Value> {
        let mut node = root;
        for segment in path_segments(path) {
            node = node.as_object()?.get(segment)?;
        }
        Some(node.clone())
    }

    /// Write `value` at `path` below `root`; `null` removes the node
    pub(super) fn write(root: &mut Value, path: &str, value: Value) {
        let segments: Vec<&str> = path_segments(path).collect();
        let Some((last, parents)) = segments.split_last() else {
            *root = if value.is_null() { Value::Object(Map::new()) } else { value };
            return;
        };

        if value.is_null() {
            Self::remove(root, parents, last);
            return;
        }

        let mut node = root;
        for segment in parents {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            node = match node {
                Value::Object(map) => {
                    map.entry(segment.to_string()).or_insert_with(|| Value::Object(Map::new()))
                }
                _ => return,
            };
        }
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        if let Value::Object(map) = node {
            map.insert(last.to_string(), value);
        }
    }

    /// Remove `parents/last`, pruning parents left empty
    fn remove(node: &mut Value, parents: &[&str], last: &str) {
        let Value::Object(map) = node else {
            return;
        };
        match parents.split_first() {
            None => {
                map.remove(last);
            }
            Some((head, rest)) => {
                if let Some(child) = map.get_mut(*head) {
                    Self::remove(child, rest, last);
                    if child.as_object().is_some_and(|m| m.is_empty()) {
                        map.remove(*head);
                    }
                }
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        Ok(Self::read(&self.root.lock(), path))
    }

    async fn set(&self, path: &str, value: &Value) -> Result<(), StoreError> {
        Self::write(&mut self.root.lock(), path, value.clone());
        Ok(())
    }

    async fn update(&self, path: &str, fields: &Value) -> Result<(), StoreError> {
        let Some(fields) = fields.as_object() else {
            return Self::set(self, path, fields).await;
        };
        let mut root = self.root.lock();
        for (key, value) in fields {
            Self::write(&mut root, &super::join_path(path, key), value.clone());
        }
        Ok(())
    }

    async fn push(&self, path: &str, value: &Value) -> Result<String, StoreError> {
        let key = push_key();
        Self::write(&mut self.root.lock(), &super::join_path(path, &key), value.clone());
        Ok(key)
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        Self::write(&mut self.root.lock(), path, Value::Null);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_and_get_nested() {
        let store = MemoryStore::new();
        store.set("rooms/room01", &json!({"count": 0})).await.unwrap();

        assert_eq!(store.get("rooms/room01/count").await.unwrap(), Some(json!(0)));
        assert_eq!(store.get("/rooms/room01/").await.unwrap(), Some(json!({"count": 0})));
        assert_eq!(store.get("rooms/room02").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_update_merges_fields() {
        let store = MemoryStore::new();
        store.set("rooms/room01", &json!({"count": 0, "lastEvent": "INIT"})).await.unwrap();
        store.update("rooms/room01", &json!({"count": 3, "lastEvent": "ENTER"})).await.unwrap();
        store.update("rooms/room01", &json!({"meta/floor": 2})).await.unwrap();

        assert_eq!(
            store.get("rooms/room01").await.unwrap(),
            Some(json!({"count": 3, "lastEvent": "ENTER", "meta": {"floor": 2}}))
        );
    }

    #[tokio::test]
    async fn test_push_appends_children() {
        let store = MemoryStore::new();
        let a = store.push("sessions/r/s/events", &json!({"type": "ENTER"})).await.unwrap();
        let b = store.push("sessions/r/s/events", &json!({"type": "EXIT"})).await.unwrap();
        assert_ne!(a, b);

        let events = store.get("sessions/r/s/events").await.unwrap().unwrap();
        assert_eq!(events.as_object().unwrap().len(), 2);
        assert_eq!(events[&a]["type"], "ENTER");
    }

    #[tokio::test]
    async fn test_delete_prunes_empty_parents() {
        let store = MemoryStore::new();
        store.set("live_data/room01", &json!({"x": 1})).await.unwrap();
        store.set("rooms/room01", &json!({"count": 1})).await.unwrap();

        store.delete("live_data/room01").await.unwrap();
        assert_eq!(store.snapshot(), json!({"rooms": {"room01": {"count": 1}}}));

        // Deleting a missing node is not an error
        store.delete("sessions/nothing").await.unwrap();
    }

    #[tokio::test]
    async fn test_set_over_scalar_replaces_it() {
        let store = MemoryStore::new();
        store.set("a", &json!(5)).await.unwrap();
        store.set("a/b", &json!(true)).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(json!({"b": true})));
    }
}
