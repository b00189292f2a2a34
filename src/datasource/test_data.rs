//! A manually driven data source for tests.
//!
//! [`TestData`] holds a set of flag definitions and acts as a
//! [`DataSourceFactory`]. Every source it builds starts by delivering the
//! current definitions; each later change made through the `TestData`
//! handle is pushed to every live source at once, so several clients
//! sharing one `TestData` observe the same sequence of updates.
//!
//! ```rust
//! use flagsync::datasource::TestData;
//!
//! let test_data = TestData::new();
//! test_data.update(test_data.flag("new-ui").value(true));
//! test_data.update(test_data.flag("theme").value("dark").value_for("user-2", "light"));
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use super::{DataSource, DataSourceContext, DataSourceFactory};
use crate::core::ConnectionState;
use crate::error::DataSourceError;
use crate::types::{Identity, Item, Snapshot};

/// Definition of one flag served by [`TestData`].
#[derive(Debug, Clone)]
pub struct FlagBuilder {
    key: String,
    value: Value,
    overrides: HashMap<String, Value>,
    variation: Option<u32>,
    track_events: bool,
}

impl FlagBuilder {
    fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: Value::Bool(true),
            overrides: HashMap::new(),
            variation: None,
            track_events: false,
        }
    }

    /// Value served to every identity without an override.
    pub fn value(mut self, value: impl Into<Value>) -> Self {
        self.value = value.into();
        self
    }

    /// Value served to the identity with this key.
    pub fn value_for(mut self, identity_key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.overrides.insert(identity_key.into(), value.into());
        self
    }

    pub fn variation(mut self, variation: u32) -> Self {
        self.variation = Some(variation);
        self
    }

    pub fn track_events(mut self, track: bool) -> Self {
        self.track_events = track;
        self
    }

    fn build_item(&self, identity: &Identity, version: u64) -> Item {
        let value = self
            .overrides
            .get(&identity.key)
            .unwrap_or(&self.value)
            .clone();
        let mut item = Item::new(self.key.clone(), version, value).track_events(self.track_events);
        item.variation = self.variation;
        item
    }
}

enum Definition {
    Flag { builder: FlagBuilder, version: u64 },
    Raw(Item),
}

impl Definition {
    fn version(&self) -> u64 {
        match self {
            Definition::Flag { version, .. } => *version,
            Definition::Raw(item) => item.version,
        }
    }

    fn item_for(&self, identity: &Identity) -> Item {
        match self {
            Definition::Flag { builder, version } => builder.build_item(identity, *version),
            Definition::Raw(item) => item.clone(),
        }
    }
}

#[derive(Default)]
struct TestDataState {
    definitions: HashMap<String, Definition>,
    sources: Vec<Weak<TestDataSource>>,
}

impl TestDataState {
    fn next_version(&self, key: &str) -> u64 {
        self.definitions.get(key).map_or(1, |d| d.version() + 1)
    }

    fn snapshot_for(&self, identity: &Identity) -> Snapshot {
        Snapshot::from_items(self.definitions.values().map(|d| d.item_for(identity)))
    }

    /// Live sources that already delivered their initial data.
    fn started_sources(&mut self) -> Vec<Arc<TestDataSource>> {
        self.sources.retain(|weak| weak.strong_count() > 0);
        self.sources
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|source| source.is_active())
            .collect()
    }
}

/// Shared handle to manually controlled flag data.
#[derive(Clone, Default)]
pub struct TestData {
    state: Arc<Mutex<TestDataState>>,
}

impl TestData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a definition for `key`, based on the current one if it exists.
    pub fn flag(&self, key: impl Into<String>) -> FlagBuilder {
        let key = key.into();
        match self.state.lock().definitions.get(&key) {
            Some(Definition::Flag { builder, .. }) => builder.clone(),
            _ => FlagBuilder::new(key),
        }
    }

    /// Stores `builder` with the next version and pushes it to all sources.
    pub fn update(&self, builder: FlagBuilder) {
        let (version, sources) = {
            let mut state = self.state.lock();
            let version = state.next_version(&builder.key);
            state.definitions.insert(
                builder.key.clone(),
                Definition::Flag {
                    builder: builder.clone(),
                    version,
                },
            );
            (version, state.started_sources())
        };

        for source in sources {
            let item = builder.build_item(&source.context.identity, version);
            source.push_upsert(item);
        }
    }

    /// Shorthand for a flag with a single value.
    pub fn set_value(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.update(self.flag(key).value(value));
    }

    /// Pushes `item` exactly as given, version included.
    ///
    /// Sources receive it even when it is stale, which makes this the way to
    /// exercise out-of-order delivery.
    pub fn upsert_item(&self, item: Item) {
        let sources = {
            let mut state = self.state.lock();
            let newer = state
                .definitions
                .get(&item.key)
                .map_or(true, |d| item.version > d.version());
            if newer {
                state
                    .definitions
                    .insert(item.key.clone(), Definition::Raw(item.clone()));
            }
            state.started_sources()
        };

        for source in sources {
            source.push_upsert(item.clone());
        }
    }

    /// Deletes `key` with the next version.
    pub fn delete(&self, key: &str) {
        let version = self.state.lock().next_version(key);
        self.upsert_item(Item::tombstone(key, version));
    }

    /// Replaces every definition and pushes a full data set to all sources.
    pub fn init_snapshot(&self, snapshot: Snapshot) {
        let sources = {
            let mut state = self.state.lock();
            state.definitions = snapshot
                .into_items()
                .into_iter()
                .map(|(key, item)| (key, Definition::Raw(item)))
                .collect();
            state.started_sources()
        };

        for source in sources {
            let snapshot = self.state.lock().snapshot_for(&source.context.identity);
            source.push_init(snapshot);
        }
    }

    /// Reports a status change from every live source.
    pub fn update_status(&self, state: ConnectionState, error: Option<DataSourceError>) {
        let sources = self.state.lock().started_sources();
        for source in sources {
            source.context.sink.update_status(Some(state), error.clone());
        }
    }

    /// Makes every live source fail permanently with `error`.
    pub fn fail(&self, error: DataSourceError) {
        let sources = self.state.lock().started_sources();
        for source in sources {
            source.context.sink.shut_down(error.clone());
        }
    }

    /// Number of sources built from this handle that are still alive.
    pub fn source_count(&self) -> usize {
        let mut state = self.state.lock();
        state.sources.retain(|weak| weak.strong_count() > 0);
        state
            .sources
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|source| !source.disposed.load(Ordering::SeqCst))
            .count()
    }
}

impl DataSourceFactory for TestData {
    fn build(&self, context: DataSourceContext) -> Arc<dyn DataSource> {
        let source = Arc::new(TestDataSource {
            context,
            data: self.clone(),
            initialized: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        });
        self.state.lock().sources.push(Arc::downgrade(&source));
        source
    }
}

struct TestDataSource {
    context: DataSourceContext,
    data: TestData,
    initialized: AtomicBool,
    disposed: AtomicBool,
}

impl TestDataSource {
    fn is_active(&self) -> bool {
        self.initialized.load(Ordering::SeqCst) && !self.disposed.load(Ordering::SeqCst)
    }

    fn push_upsert(&self, item: Item) {
        if self.is_active() {
            self.context.sink.upsert(&self.context.identity, item);
        }
    }

    fn push_init(&self, snapshot: Snapshot) {
        if self.is_active() {
            self.context.sink.init(&self.context.identity, snapshot);
        }
    }
}

#[async_trait]
impl DataSource for TestDataSource {
    async fn start(&self) -> bool {
        if self.disposed.load(Ordering::SeqCst) {
            return false;
        }
        if !self.initialized.load(Ordering::SeqCst) {
            {
                // held across init so no update slips between snapshot and activation
                let state = self.data.state.lock();
                let snapshot = state.snapshot_for(&self.context.identity);
                self.context.sink.init(&self.context.identity, snapshot);
                self.initialized.store(true, Ordering::SeqCst);
            }
            self.context
                .sink
                .update_status(Some(ConnectionState::Valid), None);
        }
        true
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    async fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }
}
