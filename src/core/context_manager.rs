//! Per-identity flag data management.
//!
//! This module owns the current identity together with its in-memory
//! [`VersionedItemStore`], and ties it to the persistent cache and the change
//! notifier. It is the target of every data-source update.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use super::change_notifier::ChangeNotifier;
use super::item_store::{diff, VersionedItemStore};
use super::persistent_cache::PersistentCache;
use crate::types::{Identity, Item, Snapshot};

struct ContextData {
    identity: Identity,
    store: VersionedItemStore,
}

/// Holds the current identity's flag data.
///
/// # Thread Safety
///
/// Evaluation reads clone the current `Arc<ContextData>` and never wait on a
/// writer for longer than that clone. Updates hold the read side while they
/// apply, so an identity switch (write side) cannot interleave with them.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use flagsync::core::{ChangeNotifier, ContextDataManager, PersistentCache};
/// use flagsync::types::{Identity, Item, Snapshot};
///
/// let manager = ContextDataManager::new(
///     Identity::new("user-1"),
///     Arc::new(PersistentCache::disabled()),
///     Arc::new(ChangeNotifier::new()),
/// );
///
/// let user = Identity::new("user-1");
/// manager.init(&user, Snapshot::from_items(vec![Item::new("flag", 1, true)]));
/// assert_eq!(manager.get("flag").unwrap().bool_value(), Some(true));
/// ```
pub struct ContextDataManager {
    current: RwLock<Arc<ContextData>>,
    cache: Arc<PersistentCache>,
    notifier: Arc<ChangeNotifier>,
}

impl ContextDataManager {
    /// Creates the manager, seeding the store from the persistent cache.
    pub fn new(
        identity: Identity,
        cache: Arc<PersistentCache>,
        notifier: Arc<ChangeNotifier>,
    ) -> Self {
        let store = match cache.load_snapshot(&identity) {
            Some(snapshot) => {
                tracing::debug!("Loaded {} cached flags for {}", snapshot.len(), identity);
                VersionedItemStore::from_snapshot(snapshot)
            }
            None => VersionedItemStore::new(),
        };

        Self {
            current: RwLock::new(Arc::new(ContextData { identity, store })),
            cache,
            notifier,
        }
    }

    pub fn identity(&self) -> Identity {
        self.current.read().identity.clone()
    }

    pub fn get(&self, key: &str) -> Option<Item> {
        let data = self.current.read().clone();
        data.store.get(key)
    }

    pub fn all_values(&self) -> HashMap<String, Value> {
        let data = self.current.read().clone();
        data.store.all_values()
    }

    pub fn snapshot(&self) -> Snapshot {
        let data = self.current.read().clone();
        data.store.snapshot()
    }

    /// Makes `identity` current, serving its cached data if there is any.
    ///
    /// Returns whether cached data was found. Listeners are notified of every
    /// key whose value differs between the two identities.
    pub fn switch_identity(&self, identity: Identity) -> bool {
        let cached = self.cache.load_snapshot(&identity);
        let found = cached.is_some();
        let snapshot = cached.unwrap_or_default();

        let changes = {
            let mut current = self.current.write();
            let old_items = current.store.snapshot().into_items();
            let changes = diff(&old_items, &snapshot.clone().into_items());

            tracing::debug!(
                "Switching identity {} -> {} ({} cached flags)",
                current.identity,
                identity,
                snapshot.len()
            );
            *current = Arc::new(ContextData {
                identity,
                store: VersionedItemStore::from_snapshot(snapshot),
            });
            changes
        };

        self.notifier.notify(changes);
        found
    }

    /// Replaces all data for `identity`.
    ///
    /// Data for an identity that is no longer current is still persisted so
    /// a later switch back can use it, but it is not applied in memory.
    pub fn init(&self, identity: &Identity, snapshot: Snapshot) {
        let current = self.current.read();
        if current.identity != *identity {
            tracing::debug!("Caching full data for non-current identity {}", identity);
            self.cache.save_snapshot(identity, &snapshot);
            return;
        }

        let changes = current.store.init(snapshot);
        self.cache.save_snapshot(identity, &current.store.snapshot());
        drop(current);

        self.notifier.notify(changes);
    }

    /// Applies a single item if it is newer than the stored one.
    pub fn upsert(&self, identity: &Identity, item: Item) {
        let current = self.current.read();
        if current.identity != *identity {
            tracing::debug!(
                "Dropping update for {} addressed to non-current identity {}",
                item.key,
                identity
            );
            return;
        }

        let Some(changes) = current.store.upsert(item) else {
            return;
        };
        self.cache.save_snapshot(identity, &current.store.snapshot());
        drop(current);

        self.notifier.notify(changes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::storage::InMemoryStorage;
    use serde_json::json;
    use std::sync::mpsc;
    use std::time::Duration;

    fn cache() -> Arc<PersistentCache> {
        Arc::new(PersistentCache::new(Arc::new(InMemoryStorage::new()), "test", 5))
    }

    #[test]
    fn test_init_and_upsert_persist() {
        let cache = cache();
        let user = Identity::new("u1");
        let manager = ContextDataManager::new(
            user.clone(),
            Arc::clone(&cache),
            Arc::new(ChangeNotifier::new()),
        );

        manager.init(&user, Snapshot::from_items(vec![Item::new("a", 1, json!(1))]));
        manager.upsert(&user, Item::new("b", 1, json!(2)));

        let persisted = cache.load_snapshot(&user).unwrap();
        assert_eq!(persisted.len(), 2);
        assert_eq!(manager.all_values().get("b"), Some(&json!(2)));
    }

    #[test]
    fn test_non_current_identity() {
        let cache = cache();
        let user = Identity::new("u1");
        let other = Identity::new("u2");
        let manager = ContextDataManager::new(
            user.clone(),
            Arc::clone(&cache),
            Arc::new(ChangeNotifier::new()),
        );

        manager.init(&other, Snapshot::from_items(vec![Item::new("a", 1, json!("late"))]));
        manager.upsert(&other, Item::new("b", 1, json!(true)));

        assert!(manager.get("a").is_none());
        assert!(manager.get("b").is_none());
        let persisted = cache.load_snapshot(&other).unwrap();
        assert!(persisted.get("a").is_some());
        assert!(persisted.get("b").is_none());
    }

    #[test]
    fn test_switch_identity_uses_cache_and_notifies() {
        let cache = cache();
        let u1 = Identity::new("u1");
        let u2 = Identity::new("u2");
        cache.save_snapshot(&u2, &Snapshot::from_items(vec![Item::new("a", 4, json!("u2"))]));

        let notifier = Arc::new(ChangeNotifier::new());
        let (tx, rx) = mpsc::channel();
        notifier.register(Arc::new(move |change: &crate::types::FlagChange| {
            let _ = tx.send(change.clone());
        }));

        let manager = ContextDataManager::new(u1.clone(), cache, notifier);
        manager.init(&u1, Snapshot::from_items(vec![Item::new("a", 1, json!("u1"))]));
        let _ = rx.recv_timeout(Duration::from_secs(1));

        assert!(manager.switch_identity(u2.clone()));

        assert_eq!(manager.identity(), u2);
        assert_eq!(manager.get("a").unwrap().value, json!("u2"));
        let change = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(change.old_value, json!("u1"));
        assert_eq!(change.new_value, json!("u2"));
    }

    #[test]
    fn test_switch_to_unknown_identity_clears() {
        let u1 = Identity::new("u1");
        let manager = ContextDataManager::new(u1.clone(), cache(), Arc::new(ChangeNotifier::new()));
        manager.init(&u1, Snapshot::from_items(vec![Item::new("a", 1, json!(1))]));

        assert!(!manager.switch_identity(Identity::new("fresh")));
        assert!(manager.all_values().is_empty());
    }
}
