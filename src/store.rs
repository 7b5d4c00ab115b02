//! Snapshot persistence.
//!
//! A task with an attached [`SnapshotStore`] writes a [`Snapshot`] under its
//! name after every terminal transition and reset. Restoring is explicit:
//! call [`hydrate`] (or the [`hydrate!`](crate::hydrate!) macro) once the
//! tasks are built.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cache::CallRecord;
use crate::options::duration_ms;
use crate::task::{CallArgs, StateChange, Task, TaskOutput};

// ============================================================================
// Store Trait
// ============================================================================

/// Errors that can occur during storage operations.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// A storage backend error occurred.
    #[error("Storage error: {0}")]
    Backend(String),

    /// A snapshot could not be serialized.
    #[error("Could not encode snapshot: {0}")]
    Encode(String),

    /// A stored snapshot does not match the task's types.
    #[error("Could not decode snapshot {key}: {reason}")]
    Decode {
        /// Key of the offending entry.
        key: String,
        /// Deserializer message.
        reason: String,
    },
}

/// A string-keyed store of snapshots.
///
/// One entry per task name; the store is assumed single-writer per key.
pub trait SnapshotStore: Send + Sync {
    /// Read the entry under `key`.
    fn load(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Write `value` under `key`, replacing any previous entry.
    fn save(&self, key: &str, value: Value) -> Result<(), StoreError>;

    /// Delete the entry under `key`.
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

// ============================================================================
// In-Memory Store
// ============================================================================

/// In-memory storage backend for testing and single-process use.
///
/// Uses `parking_lot::RwLock` for thread-safe access.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Value>>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Raw copy of the entry under `key`.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.read().get(key).cloned()
    }

    /// Write a raw entry, bypassing any task.
    pub fn insert(&self, key: impl Into<String>, value: Value) {
        self.entries.write().insert(key.into(), value);
    }
}

impl SnapshotStore for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.get(key))
    }

    fn save(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.insert(key, value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.write().remove(key);
        Ok(())
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// The record a task writes to its store.
///
/// `args` and `data` are present only after a successful transition;
/// `apiCalls` only for caching tasks. Paged tasks add their own fields,
/// which travel in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(bound(
    serialize = "A: Serialize, T: Serialize",
    deserialize = "A: serde::de::DeserializeOwned, T: serde::de::DeserializeOwned"
))]
pub struct Snapshot<A, T> {
    /// Arguments of the successful call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<A>,
    /// Result of the successful call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Absolute expiry (Unix millis).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<u64>,
    /// Live cache entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_calls: Option<Vec<CallRecord<A, T>>>,
    /// Fields contributed by extensions.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl<A, T> Snapshot<A, T> {
    /// Whether the snapshot has expired at `now`.
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }
}

/// A task that can be restored from a store.
pub trait Hydrate {
    /// Key the task reads and writes.
    fn snapshot_key(&self) -> &str;

    /// Attach `store` and restore from it. Returns `true` if a live
    /// snapshot was applied.
    fn hydrate_from(&self, store: Arc<dyn SnapshotStore>) -> Result<bool, StoreError>;
}

/// Attach `store` to every task in `tasks` and restore their snapshots.
///
/// Returns how many tasks were restored. Stops at the first error.
pub fn hydrate(store: Arc<dyn SnapshotStore>, tasks: &[&dyn Hydrate]) -> Result<usize, StoreError> {
    let mut restored = 0;
    for task in tasks {
        if task.hydrate_from(store.clone())? {
            restored += 1;
        }
    }
    #[cfg(feature = "tracing")]
    tracing::debug!(tasks = tasks.len(), restored, "store.hydrate");
    Ok(restored)
}

impl<A: CallArgs, T: TaskOutput> Task<A, T> {
    /// Attach a store without restoring from it. Subsequent transitions are
    /// persisted.
    pub fn attach_store(&self, store: Arc<dyn SnapshotStore>) -> &Self {
        self.set_store(store);
        self
    }

    /// The snapshot this task would write now.
    pub fn snapshot(&self) -> Result<Snapshot<A, T>, StoreError> {
        let now = self.context().now_millis();
        let view = self.terminal_view(now);
        let mut extra = Map::new();
        self.extension().persist(&mut extra)?;
        Ok(Snapshot {
            args: view.args,
            data: view.data,
            expires: self
                .resolved()
                .expires_in
                .map(|ttl| now.saturating_add(duration_ms(ttl))),
            api_calls: view.calls,
            extra,
        })
    }

    /// Write the current snapshot to the attached store, if any. Failures
    /// are logged, never propagated into the task's outcome.
    pub(crate) fn persist(&self) {
        let Some(store) = self.store() else {
            return;
        };
        let written = self.snapshot().and_then(|snapshot| {
            let value = serde_json::to_value(&snapshot)
                .map_err(|error| StoreError::Encode(error.to_string()))?;
            store.save(self.name(), value)
        });
        match written {
            Ok(()) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(task = self.name(), "task.persist");
            }
            Err(_error) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(task = self.name(), error = %_error, "task.persist.failed");
            }
        }
    }

    /// Apply a decoded snapshot. Expired snapshots reset the task instead.
    pub fn restore(&self, snapshot: Snapshot<A, T>) -> Result<bool, StoreError> {
        if snapshot.is_expired(self.context().now_millis()) {
            self.reset_inner(false);
            return Ok(false);
        }
        self.extension().restore(&snapshot.extra)?;
        self.apply_restore(snapshot.args, snapshot.data, snapshot.api_calls);
        #[cfg(feature = "tracing")]
        tracing::info!(task = self.name(), "task.hydrate");
        self.notify(&StateChange::Restored);
        Ok(true)
    }
}

impl<A: CallArgs, T: TaskOutput> Hydrate for Task<A, T> {
    fn snapshot_key(&self) -> &str {
        self.name()
    }

    fn hydrate_from(&self, store: Arc<dyn SnapshotStore>) -> Result<bool, StoreError> {
        let key = self.name();
        let Some(value) = store.load(key)? else {
            self.set_store(store);
            return Ok(false);
        };
        let snapshot: Snapshot<A, T> =
            serde_json::from_value(value).map_err(|error| StoreError::Decode {
                key: key.to_string(),
                reason: error.to_string(),
            })?;

        if snapshot.is_expired(self.context().now_millis()) {
            #[cfg(feature = "tracing")]
            tracing::info!(task = key, "task.hydrate.expired");
            store.remove(key)?;
            self.reset_inner(false);
            self.set_store(store);
            return Ok(false);
        }

        let restored = self.restore(snapshot)?;
        self.set_store(store);
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn memory_store_save_load_remove() {
        let store = MemoryStore::new();
        assert!(store.is_empty());

        store.save("a", json!({"data": 1})).expect("save should succeed");
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.load("a").expect("load should succeed"),
            Some(json!({"data": 1}))
        );

        store.remove("a").expect("remove should succeed");
        assert_eq!(store.load("a").expect("load should succeed"), None);
    }

    #[test]
    fn snapshot_uses_camel_case_and_keeps_extras() {
        let value = json!({
            "args": [1, "x"],
            "data": 3,
            "expires": 10,
            "apiCalls": [{"args": [1, "x"], "result": 3}],
            "hasMore": false
        });
        let snapshot: Snapshot<(u32, String), u32> =
            serde_json::from_value(value.clone()).expect("snapshot should decode");

        assert_eq!(snapshot.args, Some((1, "x".to_string())));
        assert_eq!(snapshot.api_calls.as_ref().map(Vec::len), Some(1));
        assert_eq!(snapshot.extra.get("hasMore"), Some(&json!(false)));
        assert_eq!(serde_json::to_value(&snapshot).ok(), Some(value));
    }

    #[test]
    fn snapshot_expiry() {
        let snapshot: Snapshot<u32, u32> =
            serde_json::from_value(json!({"expires": 100})).expect("snapshot should decode");
        assert!(!snapshot.is_expired(99));
        assert!(snapshot.is_expired(100));

        let forever: Snapshot<u32, u32> =
            serde_json::from_value(json!({})).expect("snapshot should decode");
        assert!(!forever.is_expired(u64::MAX));
    }
}
