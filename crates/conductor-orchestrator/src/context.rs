use crate::types::CURRENT_FEATURE_KEY;
use conductor_core::{Event, EventBus};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Process-wide key/value state shared by agents and the scheduler.
///
/// Every write is atomic on its own; compound read-modify-write sequences go
/// through [`SharedContext::update`] so they cannot interleave with other writers.
#[derive(Clone)]
pub struct SharedContext {
    entries: Arc<RwLock<HashMap<String, serde_json::Value>>>,
    events: EventBus,
}

impl SharedContext {
    pub fn new(events: EventBus) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.entries.read().get(key).cloned()
    }

    /// Write a key and emit `context:update`. Returns the previous value.
    pub fn set(
        &self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Option<serde_json::Value> {
        let key = key.into();
        let previous = self.entries.write().insert(key.clone(), value.clone());
        self.events.emit(Event::ContextUpdated {
            key,
            value: Some(value),
        });
        previous
    }

    /// Apply `f` to the current value of `key` under a single write lock.
    pub fn update<F>(&self, key: impl Into<String>, f: F) -> serde_json::Value
    where
        F: FnOnce(Option<&serde_json::Value>) -> serde_json::Value,
    {
        let key = key.into();
        let value = {
            let mut entries = self.entries.write();
            let next = f(entries.get(&key));
            entries.insert(key.clone(), next.clone());
            next
        };
        self.events.emit(Event::ContextUpdated {
            key,
            value: Some(value.clone()),
        });
        value
    }

    pub fn remove(&self, key: &str) -> Option<serde_json::Value> {
        let removed = self.entries.write().remove(key);
        if removed.is_some() {
            self.events.emit(Event::ContextUpdated {
                key: key.to_string(),
                value: None,
            });
        }
        removed
    }

    /// The feature currently under work, snapshotted into execution records.
    pub fn current_feature(&self) -> Option<serde_json::Value> {
        self.get(CURRENT_FEATURE_KEY)
    }

    pub fn snapshot(&self) -> HashMap<String, serde_json::Value> {
        self.entries.read().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
