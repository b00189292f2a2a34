//! FlagSync Rust SDK
//!
//! Client-side flag synchronization: keeps a versioned local mirror of the
//! flags for the current identity, persists recent identities' data, and
//! drives a streaming or polling connection through offline, background
//! and network changes.
//!
//! # Quick Start
//!
//! ```no_run
//! use flagsync::{FlagSyncClient, FlagSyncOptions, Identity};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> flagsync::Result<()> {
//!     let options = FlagSyncOptions::new("mob-your-mobile-key");
//!     let client = FlagSyncClient::new(options, Identity::new("user-123"))?;
//!
//!     // Wait for the first full data set
//!     if !client.start().await {
//!         println!("serving cached values: {}", client.status().state);
//!     }
//!
//!     let dark_mode = client
//!         .current_value("dark-mode")
//!         .and_then(|item| item.bool_value())
//!         .unwrap_or(false);
//!     println!("dark-mode = {}", dark_mode);
//!
//!     client
//!         .switch_identity(Identity::new("user-456"), Duration::from_secs(5))
//!         .await;
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```

pub mod core;
pub mod datasource;
pub mod error;
pub mod http;
pub mod types;
mod client;

pub use types::{FlagChange, Identity, Item, Snapshot};

pub use error::{DataSourceError, ErrorCode, ErrorKind, FlagSyncError, Result, StorageError};

pub use core::{
    ChangeNotifier, ConnectionManager, ConnectionState, ConnectionStatus, ContextDataManager,
    DataSourceMode, FileStorage, FlagSyncOptions, FlagSyncOptionsBuilder, InMemoryStorage,
    Listener, ListenerId, PersistentCache, StatusTracker, StorageBackend, VersionedItemStore,
};

pub use datasource::{
    DataSource, DataSourceContext, DataSourceFactory, FlagBuilder, TestData, Transport,
    UpdateSink,
};

pub use http::HttpTransport;

pub use client::{ClientComponents, FlagSyncClient, SDK_VERSION};
