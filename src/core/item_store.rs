//! In-memory versioned flag storage for one identity.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;

use crate::types::{FlagChange, Item, Snapshot};

/// Map of flag key to [`Item`], gated by version on partial updates.
///
/// Readers take a shared lock and clone whole items, so a reader never sees
/// a partially applied update.
#[derive(Debug, Default)]
pub struct VersionedItemStore {
    items: RwLock<HashMap<String, Item>>,
}

impl VersionedItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            items: RwLock::new(snapshot.into_items()),
        }
    }

    /// Current item for `key`; tombstones read as absent.
    pub fn get(&self, key: &str) -> Option<Item> {
        self.items
            .read()
            .get(key)
            .filter(|item| !item.deleted)
            .cloned()
    }

    /// Stored item including tombstones.
    pub fn get_raw(&self, key: &str) -> Option<Item> {
        self.items.read().get(key).cloned()
    }

    /// Visible values of all live items.
    pub fn all_values(&self) -> HashMap<String, Value> {
        self.items
            .read()
            .values()
            .filter(|item| !item.deleted)
            .map(|item| (item.key.clone(), item.value.clone()))
            .collect()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot::from_map(self.items.read().clone())
    }

    /// Number of live (non-deleted) items.
    pub fn len(&self) -> usize {
        self.items.read().values().filter(|item| !item.deleted).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replaces the whole content. Always accepted.
    ///
    /// Returns the value-level changes between the previous and new content.
    pub fn init(&self, snapshot: Snapshot) -> Vec<FlagChange> {
        let new_items = snapshot.into_items();
        let mut items = self.items.write();
        let changes = diff(&items, &new_items);
        *items = new_items;
        changes
    }

    /// Applies `item` if it is newer than what is stored.
    ///
    /// Returns `None` when the update was ignored as stale or duplicate, and
    /// otherwise the value change it caused (which may be empty when only
    /// the version moved).
    pub fn upsert(&self, item: Item) -> Option<Vec<FlagChange>> {
        let mut items = self.items.write();

        let existing = items.get(&item.key);
        if let Some(existing) = existing.filter(|existing| item.version <= existing.version) {
            tracing::debug!(
                "Ignoring stale update for {} (version {} <= {})",
                item.key,
                item.version,
                existing.version
            );
            return None;
        }

        let change = value_change(&item.key, existing, &item);
        items.insert(item.key.clone(), item);
        Some(change.into_iter().collect())
    }
}

/// Value-level differences between two item maps, sorted by key.
pub(crate) fn diff(old: &HashMap<String, Item>, new: &HashMap<String, Item>) -> Vec<FlagChange> {
    let mut changes = Vec::new();

    for (key, new_item) in new {
        changes.extend(value_change(key, old.get(key), new_item));
    }

    for (key, old_item) in old {
        if !new.contains_key(key) && !old_item.deleted {
            changes.push(FlagChange {
                key: key.clone(),
                old_value: old_item.value.clone(),
                new_value: Value::Null,
                deleted: true,
            });
        }
    }

    changes.sort_by(|a, b| a.key.cmp(&b.key));
    changes
}

/// A live item turning into a tombstone always counts as a change, even when
/// its value was already null.
fn value_change(key: &str, old: Option<&Item>, new_item: &Item) -> Option<FlagChange> {
    let was_live = old.is_some_and(|item| !item.deleted);
    let old_value = old.map_or(&Value::Null, Item::visible_value);
    let new_value = new_item.visible_value();
    if old_value == new_value && !(new_item.deleted && was_live) {
        return None;
    }
    Some(FlagChange {
        key: key.to_string(),
        old_value: old_value.clone(),
        new_value: new_value.clone(),
        deleted: new_item.deleted,
    })
}
