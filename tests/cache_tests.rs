use flagsync::{
    DataSourceError, ErrorKind, FileStorage, Identity, InMemoryStorage, Item, PersistentCache,
    Snapshot, StorageBackend, StorageError,
};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

fn snapshot_for(identity: &str) -> Snapshot {
    Snapshot::from_items([Item::new("owner", 1, identity)])
}

#[test]
fn test_eviction_drops_least_recently_used() {
    let storage = Arc::new(InMemoryStorage::new());
    let cache = PersistentCache::new(storage, "test", 3);

    for name in ["u1", "u2", "u3", "u4"] {
        cache.save_snapshot(&Identity::new(name), &snapshot_for(name));
    }

    assert!(cache.load_snapshot(&Identity::new("u1")).is_none());
    for name in ["u2", "u3", "u4"] {
        let snapshot = cache.load_snapshot(&Identity::new(name)).unwrap();
        assert_eq!(snapshot.get("owner").unwrap().value, json!(name));
    }
}

#[test]
fn test_load_refreshes_recency() {
    let storage = Arc::new(InMemoryStorage::new());
    let cache = PersistentCache::new(storage, "test", 2);

    cache.save_snapshot(&Identity::new("u1"), &snapshot_for("u1"));
    cache.save_snapshot(&Identity::new("u2"), &snapshot_for("u2"));
    assert!(cache.load_snapshot(&Identity::new("u1")).is_some());

    cache.save_snapshot(&Identity::new("u3"), &snapshot_for("u3"));

    assert_eq!(cache.cached_identities(), vec!["u1", "u3"]);
    assert!(cache.load_snapshot(&Identity::new("u2")).is_none());
}

#[test]
fn test_evicted_entry_removed_from_backend() {
    let storage = Arc::new(InMemoryStorage::new());
    let cache = PersistentCache::new(storage.clone(), "test", 1);

    cache.save_snapshot(&Identity::new("u1"), &snapshot_for("u1"));
    cache.save_snapshot(&Identity::new("u2"), &snapshot_for("u2"));

    assert_eq!(storage.get("test_flags", "u1").unwrap(), None);
    assert!(storage.get("test_flags", "u2").unwrap().is_some());
}

#[test]
fn test_anonymous_and_named_identities_are_separate() {
    let storage = Arc::new(InMemoryStorage::new());
    let cache = PersistentCache::new(storage, "test", 5);

    cache.save_snapshot(&Identity::new("same"), &snapshot_for("named"));
    cache.save_snapshot(&Identity::anonymous("same"), &snapshot_for("anonymous"));

    let named = cache.load_snapshot(&Identity::new("same")).unwrap();
    let anonymous = cache.load_snapshot(&Identity::anonymous("same")).unwrap();
    assert_eq!(named.get("owner").unwrap().value, json!("named"));
    assert_eq!(anonymous.get("owner").unwrap().value, json!("anonymous"));
}

#[test]
fn test_file_storage_persists_across_instances() {
    let dir = TempDir::new().unwrap();
    let identity = Identity::new("user@example.com");

    {
        let storage = Arc::new(FileStorage::new(dir.path()).unwrap());
        let cache = PersistentCache::new(storage, "app", 5);
        cache.save_snapshot(&identity, &snapshot_for("first-run"));
    }

    let storage = Arc::new(FileStorage::new(dir.path()).unwrap());
    let cache = PersistentCache::new(storage, "app", 5);

    assert_eq!(cache.cached_identities(), vec![identity.cache_key()]);
    let snapshot = cache.load_snapshot(&identity).unwrap();
    assert_eq!(snapshot.get("owner").unwrap().value, json!("first-run"));
}

#[test]
fn test_file_storage_eviction_across_instances() {
    let dir = TempDir::new().unwrap();

    {
        let storage = Arc::new(FileStorage::new(dir.path()).unwrap());
        let cache = PersistentCache::new(storage, "app", 2);
        cache.save_snapshot(&Identity::new("u1"), &snapshot_for("u1"));
        cache.save_snapshot(&Identity::new("u2"), &snapshot_for("u2"));
    }

    let storage = Arc::new(FileStorage::new(dir.path()).unwrap());
    let cache = PersistentCache::new(storage, "app", 2);
    cache.save_snapshot(&Identity::new("u3"), &snapshot_for("u3"));

    assert!(cache.load_snapshot(&Identity::new("u1")).is_none());
    assert!(cache.load_snapshot(&Identity::new("u2")).is_some());
    assert!(cache.load_snapshot(&Identity::new("u3")).is_some());
}

struct ReadOnlyStorage;

impl StorageBackend for ReadOnlyStorage {
    fn get(&self, _: &str, _: &str) -> Result<Option<String>, StorageError> {
        Ok(None)
    }

    fn set(&self, _: &str, _: &str, _: Option<&str>) -> Result<(), StorageError> {
        Err(StorageError::Unavailable("read-only".to_string()))
    }
}

#[test]
fn test_write_failure_reported_as_store_error() {
    let cache = PersistentCache::new(Arc::new(ReadOnlyStorage), "test", 5);
    let reported = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = Arc::clone(&reported);
    cache.set_error_handler(Arc::new(move |error: DataSourceError| sink.lock().push(error)));

    cache.save_snapshot(&Identity::new("u1"), &snapshot_for("u1"));
    cache.save_snapshot(&Identity::new("u2"), &snapshot_for("u2"));

    let reported = reported.lock();
    assert_eq!(reported.len(), 2);
    assert!(reported.iter().all(|e| e.kind == ErrorKind::StoreError));
    assert!(reported[0].message.starts_with("[CACHE_STORAGE_ERROR]"));
}

#[test]
fn test_zero_capacity_never_touches_backend() {
    let storage = Arc::new(InMemoryStorage::new());
    let cache = PersistentCache::new(storage.clone(), "test", 0);

    cache.save_snapshot(&Identity::new("u1"), &snapshot_for("u1"));

    assert!(!cache.is_enabled());
    assert!(storage.is_empty());
    assert!(cache.load_snapshot(&Identity::new("u1")).is_none());
}
