mod change_notifier;
mod config;
mod connection_manager;
mod context_manager;
mod dispatcher;
mod item_store;
mod persistent_cache;
mod status;
mod storage;

pub use change_notifier::ChangeNotifier;
pub use config::{
    DataSourceMode, FlagSyncOptions, FlagSyncOptionsBuilder, DEFAULT_BACKGROUND_POLLING_INTERVAL,
    DEFAULT_BASE_URI, DEFAULT_INITIAL_RECONNECT_DELAY, DEFAULT_MAX_RECONNECT_DELAY,
    DEFAULT_POLLING_INTERVAL, DEFAULT_START_TIMEOUT, DEFAULT_STORAGE_NAMESPACE,
    DEFAULT_STREAM_URI, DEFAULT_TIMEOUT, MIN_POLLING_INTERVAL,
};
pub use connection_manager::ConnectionManager;
pub use context_manager::ContextDataManager;
pub use dispatcher::{EventDispatcher, Listener, ListenerId};
pub use item_store::VersionedItemStore;
pub use persistent_cache::{PersistentCache, StoreErrorCallback, DEFAULT_MAX_CACHED_IDENTITIES};
pub use status::{ConnectionState, ConnectionStatus, StatusTracker};
pub use storage::{FileStorage, InMemoryStorage, StorageBackend};
