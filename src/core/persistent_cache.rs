//! Best-effort durable cache of per-identity snapshots.
//!
//! Each remembered identity has one serialized [`Snapshot`] stored under its
//! cache key. A separate index record keeps the identities in
//! least-recently-used order so the cache can stay within its configured
//! capacity. Storage failures never propagate: they are logged once per
//! failure class and reported to the registered error handler, and the
//! in-memory store stays authoritative.

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

use super::storage::StorageBackend;
use crate::error::{DataSourceError, StorageError};
use crate::types::{Identity, Snapshot};

/// Default number of identities whose data is remembered.
pub const DEFAULT_MAX_CACHED_IDENTITIES: i32 = 5;

const INDEX_KEY: &str = "index";

/// Callback receiving storage failures for status reporting.
pub type StoreErrorCallback = Arc<dyn Fn(DataSourceError) + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexEntry {
    key: String,
    timestamp: i64,
}

pub struct PersistentCache {
    backend: Option<Arc<dyn StorageBackend>>,
    data_namespace: String,
    index_namespace: String,
    capacity: i32,
    /// Oldest first. Also serializes every backend write.
    index: Mutex<Vec<IndexEntry>>,
    logged_failures: Mutex<HashSet<String>>,
    on_error: RwLock<Option<StoreErrorCallback>>,
}

impl PersistentCache {
    /// Creates a cache over `backend`.
    ///
    /// `capacity` is the maximum number of identities kept: 0 disables
    /// persistence entirely and any negative value means unbounded.
    pub fn new(backend: Arc<dyn StorageBackend>, namespace: &str, capacity: i32) -> Self {
        let cache = Self {
            backend: (capacity != 0).then_some(backend),
            data_namespace: format!("{}_flags", namespace),
            index_namespace: format!("{}_index", namespace),
            capacity,
            index: Mutex::new(Vec::new()),
            logged_failures: Mutex::new(HashSet::new()),
            on_error: RwLock::new(None),
        };
        cache.load_index();
        cache
    }

    /// A cache that never stores anything.
    pub fn disabled() -> Self {
        Self {
            backend: None,
            data_namespace: String::new(),
            index_namespace: String::new(),
            capacity: 0,
            index: Mutex::new(Vec::new()),
            logged_failures: Mutex::new(HashSet::new()),
            on_error: RwLock::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    pub fn capacity(&self) -> i32 {
        self.capacity
    }

    pub fn set_error_handler(&self, handler: StoreErrorCallback) {
        *self.on_error.write() = Some(handler);
    }

    /// Cache keys of remembered identities, least recently used first.
    pub fn cached_identities(&self) -> Vec<String> {
        self.index.lock().iter().map(|e| e.key.clone()).collect()
    }

    /// Stores a serialized snapshot for `identity`, evicting the least
    /// recently used identities beyond capacity.
    pub fn save(&self, identity: &Identity, serialized: &str) {
        let Some(backend) = self.backend.as_ref() else {
            return;
        };
        let key = identity.cache_key();

        let mut index = self.index.lock();
        if let Err(e) = backend.set(&self.data_namespace, &key, Some(serialized)) {
            self.handle_failure("save", e, Access::Write);
            return;
        }

        touch(&mut index, &key);
        for evicted in self.prune(&mut index) {
            tracing::debug!("Evicting cached flags for identity {}", evicted);
            if let Err(e) = backend.set(&self.data_namespace, &evicted, None) {
                self.handle_failure("evict", e, Access::Write);
            }
        }
        self.write_index(backend.as_ref(), &index);
    }

    /// Reads the serialized snapshot for `identity`, if one was stored.
    pub fn load(&self, identity: &Identity) -> Option<String> {
        let backend = self.backend.as_ref()?;
        let key = identity.cache_key();

        let mut index = self.index.lock();
        match backend.get(&self.data_namespace, &key) {
            Ok(Some(serialized)) => {
                touch(&mut index, &key);
                self.write_index(backend.as_ref(), &index);
                Some(serialized)
            }
            Ok(None) => None,
            Err(e) => {
                self.handle_failure("load", e, Access::Read);
                None
            }
        }
    }

    pub fn save_snapshot(&self, identity: &Identity, snapshot: &Snapshot) {
        if !self.is_enabled() {
            return;
        }
        match serde_json::to_string(snapshot) {
            Ok(serialized) => self.save(identity, &serialized),
            Err(e) => self.handle_failure("serialize", e.into(), Access::Write),
        }
    }

    /// Loads and decodes the stored snapshot; corrupt data reads as absent.
    pub fn load_snapshot(&self, identity: &Identity) -> Option<Snapshot> {
        let serialized = self.load(identity)?;
        match serde_json::from_str::<Snapshot>(&serialized) {
            Ok(snapshot) => Some(Snapshot::from_map(snapshot.into_items())),
            Err(e) => {
                self.handle_failure("decode", e.into(), Access::Read);
                None
            }
        }
    }

    fn prune(&self, index: &mut Vec<IndexEntry>) -> Vec<String> {
        if self.capacity < 0 {
            return Vec::new();
        }
        let capacity = self.capacity as usize;
        if index.len() <= capacity {
            return Vec::new();
        }
        let excess = index.len() - capacity;
        index.drain(..excess).map(|e| e.key).collect()
    }

    fn load_index(&self) {
        let Some(backend) = self.backend.as_ref() else {
            return;
        };
        let loaded = match backend.get(&self.index_namespace, INDEX_KEY) {
            Ok(Some(serialized)) => match serde_json::from_str::<Vec<IndexEntry>>(&serialized) {
                Ok(entries) => entries,
                Err(e) => {
                    self.handle_failure("load index", e.into(), Access::Read);
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                self.handle_failure("load index", e, Access::Read);
                Vec::new()
            }
        };
        *self.index.lock() = loaded;
    }

    fn write_index(&self, backend: &dyn StorageBackend, index: &[IndexEntry]) {
        let serialized = match serde_json::to_string(index) {
            Ok(serialized) => serialized,
            Err(e) => {
                self.handle_failure("serialize index", e.into(), Access::Write);
                return;
            }
        };
        if let Err(e) = backend.set(&self.index_namespace, INDEX_KEY, Some(&serialized)) {
            self.handle_failure("save index", e, Access::Write);
        }
    }

    fn handle_failure(&self, operation: &str, error: StorageError, access: Access) {
        let code = match access {
            Access::Read => error.read_code(),
            Access::Write => error.write_code(),
        };
        let first_of_class = self.logged_failures.lock().insert(error.class());
        if first_of_class {
            tracing::warn!("[{}] Persistent flag cache {} failed: {}", code, operation, error);
        } else {
            tracing::debug!(
                "[{}] Persistent flag cache {} failed again: {}",
                code,
                operation,
                error
            );
        }

        let handler = self.on_error.read().clone();
        if let Some(handler) = handler {
            handler(DataSourceError::store(format!(
                "[{}] persistent cache {} failed: {}",
                code, operation, error
            )));
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Access {
    Read,
    Write,
}

fn touch(index: &mut Vec<IndexEntry>, key: &str) {
    index.retain(|e| e.key != key);
    index.push(IndexEntry {
        key: key.to_string(),
        timestamp: Utc::now().timestamp_millis(),
    });
}
