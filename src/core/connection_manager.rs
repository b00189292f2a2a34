//! Lifecycle owner of the active data source.
//!
//! The manager combines three inputs (forced offline, network reachability
//! and background mode) into a single decision: which connection state
//! applies and whether a data source should be running. At most one data
//! source is alive at any time. Replacing it goes through one async critical
//! section that first cuts off the old source's sink, then awaits its
//! disposal, and only then builds the new one.

use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::config::FlagSyncOptions;
use super::context_manager::ContextDataManager;
use super::status::{ConnectionState, StatusTracker};
use crate::datasource::{DataSource, DataSourceContext, DataSourceFactory, UpdateSink};
use crate::error::DataSourceError;
use crate::types::{Identity, Item, Snapshot};

#[derive(Debug)]
struct Flags {
    started: bool,
    force_offline: bool,
    network_enabled: bool,
    in_background: bool,
    previously_in_background: bool,
    initialized: bool,
    shut_down: bool,
    closed: bool,
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Network,
    Background,
}

struct Inner {
    disable_background_updating: bool,
    data: Arc<ContextDataManager>,
    status: Arc<StatusTracker>,
    factory: RwLock<Arc<dyn DataSourceFactory>>,
    flags: Mutex<Flags>,
    active: tokio::sync::Mutex<Option<Arc<dyn DataSource>>>,
    /// Incremented whenever a source is cut off or built; sinks of older
    /// generations drop their writes.
    generation: Arc<RwLock<u64>>,
    /// Outcome of the current start attempt; `None` while pending.
    start_outcome: watch::Sender<Option<bool>>,
    signal_tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Decides when to run, replace or stop the data source.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        options: &FlagSyncOptions,
        data: Arc<ContextDataManager>,
        status: Arc<StatusTracker>,
        factory: Arc<dyn DataSourceFactory>,
    ) -> Self {
        let (start_outcome, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                disable_background_updating: options.disable_background_updating,
                data,
                status,
                factory: RwLock::new(factory),
                flags: Mutex::new(Flags {
                    started: false,
                    force_offline: options.offline,
                    network_enabled: true,
                    in_background: false,
                    previously_in_background: false,
                    initialized: false,
                    shut_down: false,
                    closed: false,
                }),
                active: tokio::sync::Mutex::new(None),
                generation: Arc::new(RwLock::new(0)),
                start_outcome,
                signal_tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Starts synchronizing and waits up to `timeout` for the first data.
    ///
    /// A timeout only ends the wait; the data source keeps trying and may
    /// still succeed later. While forced offline this returns `true` at once.
    pub async fn start(&self, timeout: Duration) -> bool {
        {
            let mut flags = self.inner.flags.lock();
            if flags.closed {
                return false;
            }
            flags.started = true;
        }
        self.inner.update_data_source(false).await;
        self.wait_for_initialized(timeout).await
    }

    /// Waits for the outcome of the current start attempt.
    pub async fn wait_for_initialized(&self, timeout: Duration) -> bool {
        let mut receiver = self.inner.start_outcome.subscribe();
        let wait = receiver.wait_for(Option::is_some);
        let outcome = match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(outcome)) => outcome.unwrap_or(false),
            Ok(Err(_)) => false,
            Err(_) => {
                tracing::warn!(
                    "Timed out after {:?} waiting for flag data; still trying in the background",
                    timeout
                );
                false
            }
        };
        outcome
    }

    pub async fn set_force_offline(&self, offline: bool) {
        {
            let mut flags = self.inner.flags.lock();
            if flags.force_offline == offline {
                return;
            }
            flags.force_offline = offline;
        }
        tracing::info!("Force offline set to {}", offline);
        self.inner.update_data_source(false).await;
    }

    pub async fn set_network_enabled(&self, enabled: bool) {
        self.inner.apply_signal(Signal::Network, enabled).await;
    }

    pub async fn set_in_background(&self, in_background: bool) {
        self.inner.apply_signal(Signal::Background, in_background).await;
    }

    /// Replaces the running source.
    ///
    /// `factory` replaces the current factory when given. With
    /// `reset_initialized` the manager waits for fresh data again, as after
    /// an identity switch. A new source is only built when online.
    pub async fn reconfigure(
        &self,
        factory: Option<Arc<dyn DataSourceFactory>>,
        reset_initialized: bool,
    ) {
        if let Some(factory) = factory {
            *self.inner.factory.write() = factory;
        }
        if reset_initialized {
            self.inner.flags.lock().initialized = false;
        }
        self.inner.update_data_source(true).await;
    }

    /// Feeds platform signals into the manager until their senders drop.
    ///
    /// The current value of each receiver is applied immediately.
    pub fn attach_signals(
        &self,
        network: Option<watch::Receiver<bool>>,
        background: Option<watch::Receiver<bool>>,
    ) {
        let mut tasks = self.inner.signal_tasks.lock();
        if let Some(receiver) = network {
            tasks.push(spawn_signal(Arc::downgrade(&self.inner), Signal::Network, receiver));
        }
        if let Some(receiver) = background {
            tasks.push(spawn_signal(
                Arc::downgrade(&self.inner),
                Signal::Background,
                receiver,
            ));
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.flags.lock().initialized
    }

    pub fn is_force_offline(&self) -> bool {
        self.inner.flags.lock().force_offline
    }

    pub fn is_network_enabled(&self) -> bool {
        self.inner.flags.lock().network_enabled
    }

    pub fn is_in_background(&self) -> bool {
        self.inner.flags.lock().in_background
    }

    pub async fn has_data_source(&self) -> bool {
        self.inner.active.lock().await.is_some()
    }

    /// Stops the data source for good.
    pub async fn close(&self) {
        {
            let mut flags = self.inner.flags.lock();
            if flags.closed {
                return;
            }
            flags.closed = true;
        }
        let tasks: Vec<JoinHandle<()>> = self.inner.signal_tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }

        let mut active = self.inner.active.lock().await;
        self.inner.stop(&mut active).await;
        self.inner.status.set_state(ConnectionState::Shutdown);
        self.inner.finish_start(false);
        tracing::debug!("Connection manager closed");
    }
}

fn spawn_signal(
    owner: Weak<Inner>,
    signal: Signal,
    mut receiver: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut value = *receiver.borrow_and_update();
        loop {
            match owner.upgrade() {
                Some(inner) => inner.apply_signal(signal, value).await,
                None => return,
            }
            if receiver.changed().await.is_err() {
                return;
            }
            value = *receiver.borrow_and_update();
        }
    })
}

impl Inner {
    async fn apply_signal(self: &Arc<Self>, signal: Signal, value: bool) {
        let rebuild = {
            let mut flags = self.flags.lock();
            match signal {
                Signal::Network => {
                    if flags.network_enabled == value {
                        return;
                    }
                    flags.network_enabled = value;
                    false
                }
                Signal::Background => {
                    if flags.in_background == value {
                        return;
                    }
                    flags.in_background = value;
                    // background mode changes which source (or interval) applies
                    true
                }
            }
        };
        tracing::debug!("{:?} signal changed to {}", signal, value);
        self.update_data_source(rebuild).await;
    }

    /// The state that keeps the manager from running a source, if any.
    fn offline_state(&self, flags: &Flags) -> Option<ConnectionState> {
        if flags.force_offline {
            Some(ConnectionState::SetOffline)
        } else if !flags.network_enabled {
            Some(ConnectionState::NetworkUnavailable)
        } else if flags.in_background && self.disable_background_updating {
            Some(ConnectionState::BackgroundDisabled)
        } else {
            None
        }
    }

    async fn update_data_source(self: &Arc<Self>, rebuild: bool) {
        let mut active = self.active.lock().await;

        let offline_state = {
            let flags = self.flags.lock();
            if flags.closed || !flags.started {
                return;
            }
            if flags.shut_down {
                tracing::debug!("Data source shut down permanently; not rebuilding");
                return;
            }
            self.offline_state(&flags)
        };

        if let Some(state) = offline_state {
            self.stop(&mut active).await;
            self.status.set_state(state);
            self.start_outcome
                .send_replace(Some(state == ConnectionState::SetOffline));
            return;
        }

        if active.is_some() && !rebuild {
            return;
        }
        self.stop(&mut active).await;

        let (in_background, previously_in_background, initialized) = {
            let mut flags = self.flags.lock();
            let previous = flags.previously_in_background;
            flags.previously_in_background = flags.in_background;
            (flags.in_background, previous, flags.initialized)
        };

        let generation = {
            let mut current = self.generation.write();
            *current += 1;
            *current
        };
        let sink = Arc::new(ManagedSink {
            generation,
            gate: Arc::clone(&self.generation),
            data: Arc::clone(&self.data),
            status: Arc::clone(&self.status),
            owner: Arc::downgrade(self),
        });
        let context = DataSourceContext {
            identity: self.data.identity(),
            in_background,
            previously_in_background,
            initialized,
            sink,
        };

        if initialized {
            self.start_outcome.send_replace(Some(true));
        } else {
            self.start_outcome.send_replace(None);
        }
        if !initialized || self.status.state().is_offline() {
            self.status.set_state(ConnectionState::Initializing);
        }

        let factory = self.factory.read().clone();
        let source = factory.build(context);
        *active = Some(Arc::clone(&source));
        tracing::debug!(
            "Built data source (generation {}, background {})",
            generation,
            in_background
        );

        let owner = Arc::downgrade(self);
        tokio::spawn(async move {
            let succeeded = source.start().await;
            if let Some(inner) = owner.upgrade() {
                inner.on_started(generation, succeeded);
            }
        });
    }

    /// Cuts off the active source's sink and waits for it to stop.
    async fn stop(&self, active: &mut Option<Arc<dyn DataSource>>) {
        if let Some(source) = active.take() {
            *self.generation.write() += 1;
            tracing::debug!("Disposing data source");
            source.dispose().await;
        }
    }

    fn on_started(&self, generation: u64, succeeded: bool) {
        if *self.generation.read() != generation {
            return;
        }
        if succeeded {
            self.flags.lock().initialized = true;
        }
        self.finish_start(succeeded);
    }

    /// Resolves a pending start attempt; a resolved one is left alone.
    fn finish_start(&self, succeeded: bool) {
        self.start_outcome.send_if_modified(|outcome| {
            if outcome.is_some() {
                return false;
            }
            *outcome = Some(succeeded);
            true
        });
    }

    fn on_shut_down(&self, error: DataSourceError) {
        self.flags.lock().shut_down = true;
        self.status.update(Some(ConnectionState::Shutdown), Some(error));
        self.finish_start(false);
    }
}

/// Sink handed to one data source generation.
///
/// Each write holds the generation gate's read side, so cutting a source off
/// waits for its in-flight write and drops every later one.
struct ManagedSink {
    generation: u64,
    gate: Arc<RwLock<u64>>,
    data: Arc<ContextDataManager>,
    status: Arc<StatusTracker>,
    owner: Weak<Inner>,
}

impl ManagedSink {
    fn with_current<F: FnOnce()>(&self, write: F) {
        let current = self.gate.read();
        if *current != self.generation {
            tracing::debug!("Dropping write from stale data source");
            return;
        }
        write();
    }
}

impl UpdateSink for ManagedSink {
    fn init(&self, identity: &Identity, snapshot: Snapshot) {
        self.with_current(|| self.data.init(identity, snapshot));
    }

    fn upsert(&self, identity: &Identity, item: Item) {
        self.with_current(|| self.data.upsert(identity, item));
    }

    fn update_status(&self, state: Option<ConnectionState>, error: Option<DataSourceError>) {
        self.with_current(|| self.status.update(state, error));
    }

    fn shut_down(&self, error: DataSourceError) {
        self.with_current(|| {
            if let Some(inner) = self.owner.upgrade() {
                inner.on_shut_down(error);
            }
        });
    }
}
