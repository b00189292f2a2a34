use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

const ANONYMOUS_CACHE_PREFIX: &str = "anon:";

static NULL_VALUE: Value = Value::Null;

/// The subject (user or other context) whose flags are being synchronized.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub key: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub anonymous: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, Value>,
}

impl Identity {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            anonymous: false,
            attributes: HashMap::new(),
        }
    }

    pub fn anonymous(key: impl Into<String>) -> Self {
        Self {
            anonymous: true,
            ..Self::new(key)
        }
    }

    pub fn attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Key under which this identity's snapshot is persisted.
    ///
    /// Attributes do not take part: flag data is evaluated per key.
    pub fn cache_key(&self) -> String {
        if self.anonymous {
            format!("{}{}", ANONYMOUS_CACHE_PREFIX, self.key)
        } else {
            self.key.clone()
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.cache_key())
    }
}

/// A single flag's pre-evaluated result for the current identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    #[serde(default)]
    pub key: String,
    pub version: u64,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variation: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub track_events: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub track_reason: bool,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub debug_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

impl Item {
    pub fn new(key: impl Into<String>, version: u64, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            version,
            value: value.into(),
            variation: None,
            reason: None,
            track_events: false,
            track_reason: false,
            debug_until: None,
            deleted: false,
        }
    }

    /// Placeholder recording that `key` was removed at `version`.
    pub fn tombstone(key: impl Into<String>, version: u64) -> Self {
        Self {
            deleted: true,
            ..Self::new(key, version, Value::Null)
        }
    }

    pub fn variation(mut self, variation: u32) -> Self {
        self.variation = Some(variation);
        self
    }

    pub fn track_events(mut self, track: bool) -> Self {
        self.track_events = track;
        self
    }

    pub fn debug_until(mut self, until: DateTime<Utc>) -> Self {
        self.debug_until = Some(until);
        self
    }

    /// The value as seen by readers: tombstones read as null.
    pub fn visible_value(&self) -> &Value {
        if self.deleted {
            &NULL_VALUE
        } else {
            &self.value
        }
    }

    pub fn bool_value(&self) -> Option<bool> {
        self.visible_value().as_bool()
    }

    pub fn string_value(&self) -> Option<&str> {
        self.visible_value().as_str()
    }

    pub fn number_value(&self) -> Option<f64> {
        self.visible_value().as_f64()
    }

    pub fn int_value(&self) -> Option<i64> {
        let value = self.visible_value();
        value.as_i64().or_else(|| value.as_f64().map(|n| n as i64))
    }
}

/// A complete set of items for one identity at a point in time.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot {
    items: HashMap<String, Item>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_items(items: impl IntoIterator<Item = Item>) -> Self {
        Self {
            items: items.into_iter().map(|item| (item.key.clone(), item)).collect(),
        }
    }

    /// Builds a snapshot from a key-keyed map, trusting the map keys over the
    /// embedded ones.
    pub fn from_map(items: HashMap<String, Item>) -> Self {
        Self {
            items: items
                .into_iter()
                .map(|(key, mut item)| {
                    item.key = key.clone();
                    (key, item)
                })
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Item> {
        self.items.get(key)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> impl Iterator<Item = &Item> {
        self.items.values()
    }

    pub fn into_items(self) -> HashMap<String, Item> {
        self.items
    }
}

/// Notification that the value served for a key changed.
#[derive(Debug, Clone, PartialEq)]
pub struct FlagChange {
    pub key: String,
    pub old_value: Value,
    pub new_value: Value,
    pub deleted: bool,
}
