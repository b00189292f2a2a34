use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};

use crate::core::{
    ChangeNotifier, ConnectionManager, ConnectionStatus, ContextDataManager, FlagSyncOptions,
    InMemoryStorage, Listener, ListenerId, PersistentCache, StatusTracker, StorageBackend,
};
use crate::datasource::{factory_for_options, DataSourceFactory};
use crate::error::{ErrorCode, FlagSyncError, Result};
use crate::http::HttpTransport;
use crate::types::{FlagChange, Identity, Item};

pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Extra wait on top of a blocking call's own timeout, covering task handoff.
const BLOCKING_GRACE: Duration = Duration::from_millis(250);

/// Replaceable parts of a client. Unset parts use the defaults: an
/// HTTP-backed source matching the configured mode, and in-memory storage.
#[derive(Default, Clone)]
pub struct ClientComponents {
    pub data_source_factory: Option<Arc<dyn DataSourceFactory>>,
    pub storage: Option<Arc<dyn StorageBackend>>,
}

impl ClientComponents {
    pub fn data_source_factory(mut self, factory: Arc<dyn DataSourceFactory>) -> Self {
        self.data_source_factory = Some(factory);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn StorageBackend>) -> Self {
        self.storage = Some(storage);
        self
    }
}

/// Keeps flags for one identity at a time in sync with the service.
///
/// Reads never touch the network and never fail because of
/// synchronization problems; those are visible through [`status`](Self::status).
///
/// Must be created inside a Tokio runtime. The `*_blocking` methods are for
/// callers outside the runtime and must not be called from async code.
pub struct FlagSyncClient {
    options: FlagSyncOptions,
    runtime: Handle,
    status: Arc<StatusTracker>,
    notifier: Arc<ChangeNotifier>,
    data: Arc<ContextDataManager>,
    connection: ConnectionManager,
}

impl std::fmt::Debug for FlagSyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlagSyncClient")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl FlagSyncClient {
    pub fn new(options: FlagSyncOptions, identity: Identity) -> Result<Self> {
        Self::with_components(options, identity, ClientComponents::default())
    }

    pub fn with_components(
        options: FlagSyncOptions,
        identity: Identity,
        components: ClientComponents,
    ) -> Result<Self> {
        options.validate()?;

        let runtime = Handle::try_current().map_err(|e| {
            FlagSyncError::with_source(
                ErrorCode::InitFailed,
                "FlagSyncClient must be created within a Tokio runtime",
                e,
            )
        })?;

        let status = Arc::new(StatusTracker::new());
        let notifier = Arc::new(ChangeNotifier::new());

        let storage = components
            .storage
            .unwrap_or_else(|| Arc::new(InMemoryStorage::new()));
        let cache = Arc::new(PersistentCache::new(
            storage,
            &options.storage_namespace,
            options.max_cached_identities,
        ));
        let status_for_cache = Arc::clone(&status);
        cache.set_error_handler(Arc::new(move |error| status_for_cache.record_error(error)));

        let data = Arc::new(ContextDataManager::new(identity, cache, Arc::clone(&notifier)));

        let factory = match components.data_source_factory {
            Some(factory) => factory,
            None => factory_for_options(&options, Arc::new(HttpTransport::new(&options)?)),
        };
        let connection =
            ConnectionManager::new(&options, Arc::clone(&data), Arc::clone(&status), factory);

        tracing::debug!("FlagSync client created (offline: {})", options.offline);

        Ok(Self {
            options,
            runtime,
            status,
            notifier,
            data,
            connection,
        })
    }

    pub fn options(&self) -> &FlagSyncOptions {
        &self.options
    }

    /// Starts synchronizing, waiting up to the configured start timeout.
    pub async fn start(&self) -> bool {
        self.connection.start(self.options.start_timeout).await
    }

    pub async fn start_with_timeout(&self, timeout: Duration) -> bool {
        self.connection.start(timeout).await
    }

    pub fn start_blocking(&self, timeout: Duration) -> bool {
        let connection = self.connection.clone();
        self.block_on(async move { connection.start(timeout).await }, timeout)
    }

    /// Current item for `key`, never a deleted one.
    pub fn current_value(&self, key: &str) -> Option<Item> {
        self.data.get(key)
    }

    pub fn all_values(&self) -> HashMap<String, Value> {
        self.data.all_values()
    }

    pub fn identity(&self) -> Identity {
        self.data.identity()
    }

    pub fn change_events(&self) -> broadcast::Receiver<FlagChange> {
        self.notifier.subscribe()
    }

    pub fn register_change_listener(&self, listener: Listener<FlagChange>) -> ListenerId {
        self.notifier.register(listener)
    }

    /// Registers a listener for changes to one flag.
    pub fn register_flag_listener(
        &self,
        key: impl Into<String>,
        listener: Listener<FlagChange>,
    ) -> ListenerId {
        self.notifier.register_for_key(key, listener)
    }

    pub fn unregister_change_listener(&self, id: ListenerId) -> bool {
        self.notifier.unregister(id)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.current()
    }

    pub fn status_events(&self) -> broadcast::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn register_status_listener(&self, listener: Listener<ConnectionStatus>) -> ListenerId {
        self.status.register(listener)
    }

    pub fn unregister_status_listener(&self, id: ListenerId) -> bool {
        self.status.unregister(id)
    }

    /// Forces the client offline or lets it reconnect.
    ///
    /// Going offline returns `true` immediately. Going online waits up to
    /// `timeout` for data and returns whether it arrived.
    pub async fn set_offline(&self, offline: bool, timeout: Duration) -> bool {
        set_offline(&self.connection, offline, timeout).await
    }

    pub fn set_offline_blocking(&self, offline: bool, timeout: Duration) -> bool {
        let connection = self.connection.clone();
        self.block_on(
            async move { set_offline(&connection, offline, timeout).await },
            timeout,
        )
    }

    /// Makes `identity` current and waits up to `timeout` for its data.
    ///
    /// Cached data for the identity is served immediately; the return value
    /// only says whether fresh data arrived in time.
    pub async fn switch_identity(&self, identity: Identity, timeout: Duration) -> bool {
        switch_identity(&self.data, &self.connection, identity, timeout).await
    }

    pub fn switch_identity_blocking(&self, identity: Identity, timeout: Duration) -> bool {
        let data = Arc::clone(&self.data);
        let connection = self.connection.clone();
        self.block_on(
            async move { switch_identity(&data, &connection, identity, timeout).await },
            timeout,
        )
    }

    pub async fn set_network_available(&self, available: bool) {
        self.connection.set_network_enabled(available).await;
    }

    pub async fn set_in_background(&self, in_background: bool) {
        self.connection.set_in_background(in_background).await;
    }

    /// Follows platform reachability and background signals.
    pub fn attach_signals(
        &self,
        network: Option<watch::Receiver<bool>>,
        background: Option<watch::Receiver<bool>>,
    ) {
        self.connection.attach_signals(network, background);
    }

    pub fn is_initialized(&self) -> bool {
        self.connection.is_initialized()
    }

    pub fn is_offline(&self) -> bool {
        self.connection.is_force_offline()
    }

    pub async fn close(&self) {
        self.connection.close().await;
    }

    fn block_on<F>(&self, future: F, timeout: Duration) -> bool
    where
        F: Future<Output = bool> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        self.runtime.spawn(async move {
            let _ = tx.send(future.await);
        });
        rx.recv_timeout(timeout + BLOCKING_GRACE).unwrap_or(false)
    }
}

async fn set_offline(connection: &ConnectionManager, offline: bool, timeout: Duration) -> bool {
    connection.set_force_offline(offline).await;
    if offline {
        return true;
    }
    connection.wait_for_initialized(timeout).await
}

async fn switch_identity(
    data: &ContextDataManager,
    connection: &ConnectionManager,
    identity: Identity,
    timeout: Duration,
) -> bool {
    tracing::info!("Switching identity to {}", identity);
    data.switch_identity(identity);
    connection.reconfigure(None, true).await;
    connection.wait_for_initialized(timeout).await
}
