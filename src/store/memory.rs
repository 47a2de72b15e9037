//! In-process document store with a change feed.

use super::{ChangeEvent, DocumentId, DocumentStore, Operation, Query, StoreError};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Capacity of the change feed before slow watchers start lagging.
const FEED_CAPACITY: usize = 1024;

/// Collections of JSON documents held in memory.
pub struct MemoryStore {
    collections: Mutex<HashMap<String, Vec<Value>>>,
    feed: broadcast::Sender<ChangeEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            collections: Mutex::new(HashMap::new()),
            feed,
        }
    }

    /// Load a snapshot written by [`MemoryStore::save`]; a missing file gives an empty store.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let store = Self::new();
        if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| StoreError::Io(e.to_string()))?;
            let collections: HashMap<String, Vec<Value>> = serde_json::from_str(&content)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            *store.lock()? = collections;
        }
        Ok(store)
    }

    /// Write every collection to `path` as JSON.
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(e.to_string()))?;
        }
        let json = {
            let collections = self.lock()?;
            serde_json::to_string(&*collections).map_err(|e| StoreError::Serialization(e.to_string()))?
        };
        std::fs::write(path, json).map_err(|e| StoreError::Io(e.to_string()))
    }

    /// Number of documents in a collection.
    pub fn count(&self, collection: &str) -> usize {
        self.lock()
            .map(|c| c.get(collection).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Vec<Value>>>, StoreError> {
        self.collections
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))
    }

    fn publish(&self, operation: Operation, collection: &str, document: Value) {
        // no watchers is fine
        let _ = self.feed.send(ChangeEvent {
            operation,
            collection: collection.to_string(),
            full_document: document,
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentStore for MemoryStore {
    fn insert(&self, collection: &str, document: Value) -> Result<DocumentId, StoreError> {
        let Value::Object(mut fields) = document else {
            return Err(StoreError::InvalidDocument(format!(
                "expected a JSON object for collection {collection}"
            )));
        };

        let id = match fields.get("_id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => {
                let id = Uuid::new_v4().to_string();
                fields.insert("_id".to_string(), Value::String(id.clone()));
                id
            }
        };
        let document = Value::Object(fields);

        self.lock()?
            .entry(collection.to_string())
            .or_default()
            .push(document.clone());
        self.publish(Operation::Insert, collection, document);
        Ok(id)
    }

    fn update(&self, collection: &str, id: &str, fields: Map<String, Value>) -> Result<bool, StoreError> {
        let updated = {
            let mut collections = self.lock()?;
            let Some(doc) = collections
                .get_mut(collection)
                .and_then(|docs| docs.iter_mut().find(|d| d.get("_id").and_then(Value::as_str) == Some(id)))
            else {
                return Ok(false);
            };
            if let Value::Object(existing) = doc {
                for (key, value) in fields {
                    if key != "_id" {
                        existing.insert(key, value);
                    }
                }
            }
            doc.clone()
        };
        self.publish(Operation::Update, collection, updated);
        Ok(true)
    }

    fn find(&self, collection: &str, query: &Query) -> Result<Vec<Value>, StoreError> {
        let collections = self.lock()?;
        Ok(collections
            .get(collection)
            .map(|docs| query.apply(docs))
            .unwrap_or_default())
    }

    fn watch(&self) -> broadcast::Receiver<ChangeEvent> {
        self.feed.subscribe()
    }
}
