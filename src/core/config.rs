use std::time::Duration;

use url::Url;

use super::persistent_cache::DEFAULT_MAX_CACHED_IDENTITIES;
use crate::error::{ErrorCode, FlagSyncError, Result};

pub const DEFAULT_BASE_URI: &str = "https://clientsdk.flagsync.dev";
pub const DEFAULT_STREAM_URI: &str = "https://clientstream.flagsync.dev";
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_BACKGROUND_POLLING_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_STORAGE_NAMESPACE: &str = "flagsync";

/// Lower bound accepted for the foreground polling interval.
pub const MIN_POLLING_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataSourceMode {
    #[default]
    Streaming,
    Polling,
}

#[derive(Debug, Clone)]
pub struct FlagSyncOptions {
    pub mobile_key: String,
    pub base_uri: String,
    pub stream_uri: String,
    pub data_source_mode: DataSourceMode,
    pub polling_interval: Duration,
    pub background_polling_interval: Duration,
    pub disable_background_updating: bool,
    pub stream_even_in_background: bool,
    pub initial_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    /// 0 disables persistence, negative means unbounded.
    pub max_cached_identities: i32,
    pub start_timeout: Duration,
    pub offline: bool,
    pub timeout: Duration,
    pub storage_namespace: String,
}

impl FlagSyncOptions {
    pub fn new(mobile_key: impl Into<String>) -> Self {
        FlagSyncOptionsBuilder::new(mobile_key).build()
    }

    pub fn builder(mobile_key: impl Into<String>) -> FlagSyncOptionsBuilder {
        FlagSyncOptionsBuilder::new(mobile_key)
    }

    pub fn validate(&self) -> Result<()> {
        if self.mobile_key.trim().is_empty() {
            return Err(FlagSyncError::new(
                ErrorCode::ConfigInvalidMobileKey,
                "Mobile key is required",
            ));
        }

        for (name, uri) in [("base URI", &self.base_uri), ("stream URI", &self.stream_uri)] {
            match Url::parse(uri) {
                Ok(url) if matches!(url.scheme(), "http" | "https") => {}
                Ok(url) => {
                    return Err(FlagSyncError::new(
                        ErrorCode::ConfigInvalidUrl,
                        format!("Unsupported {} scheme: {}", name, url.scheme()),
                    ));
                }
                Err(e) => {
                    return Err(FlagSyncError::new(
                        ErrorCode::ConfigInvalidUrl,
                        format!("Invalid {}: {}", name, e),
                    ));
                }
            }
        }

        if self.polling_interval < MIN_POLLING_INTERVAL {
            return Err(FlagSyncError::new(
                ErrorCode::ConfigInvalidPollingInterval,
                format!(
                    "Polling interval must be at least {}s",
                    MIN_POLLING_INTERVAL.as_secs()
                ),
            ));
        }

        if self.background_polling_interval < self.polling_interval {
            return Err(FlagSyncError::new(
                ErrorCode::ConfigInvalidPollingInterval,
                "Background polling interval must not be shorter than the polling interval",
            ));
        }

        if self.initial_reconnect_delay.is_zero()
            || self.max_reconnect_delay < self.initial_reconnect_delay
        {
            return Err(FlagSyncError::new(
                ErrorCode::ConfigInvalidReconnectDelay,
                "Reconnect delays must be positive and max must be >= initial",
            ));
        }

        if self.timeout.is_zero() {
            return Err(FlagSyncError::new(
                ErrorCode::ConfigInvalidInterval,
                "Timeout must be positive",
            ));
        }

        Ok(())
    }

    /// Whether the persistent cache is active.
    pub fn persistence_enabled(&self) -> bool {
        self.max_cached_identities != 0
    }
}

pub struct FlagSyncOptionsBuilder {
    mobile_key: String,
    base_uri: String,
    stream_uri: String,
    data_source_mode: DataSourceMode,
    polling_interval: Duration,
    background_polling_interval: Duration,
    disable_background_updating: bool,
    stream_even_in_background: bool,
    initial_reconnect_delay: Duration,
    max_reconnect_delay: Duration,
    max_cached_identities: i32,
    start_timeout: Duration,
    offline: bool,
    timeout: Duration,
    storage_namespace: String,
}

impl FlagSyncOptionsBuilder {
    pub fn new(mobile_key: impl Into<String>) -> Self {
        Self {
            mobile_key: mobile_key.into(),
            base_uri: DEFAULT_BASE_URI.to_string(),
            stream_uri: DEFAULT_STREAM_URI.to_string(),
            data_source_mode: DataSourceMode::default(),
            polling_interval: DEFAULT_POLLING_INTERVAL,
            background_polling_interval: DEFAULT_BACKGROUND_POLLING_INTERVAL,
            disable_background_updating: false,
            stream_even_in_background: false,
            initial_reconnect_delay: DEFAULT_INITIAL_RECONNECT_DELAY,
            max_reconnect_delay: DEFAULT_MAX_RECONNECT_DELAY,
            max_cached_identities: DEFAULT_MAX_CACHED_IDENTITIES,
            start_timeout: DEFAULT_START_TIMEOUT,
            offline: false,
            timeout: DEFAULT_TIMEOUT,
            storage_namespace: DEFAULT_STORAGE_NAMESPACE.to_string(),
        }
    }

    pub fn base_uri(mut self, uri: impl Into<String>) -> Self {
        self.base_uri = uri.into();
        self
    }

    pub fn stream_uri(mut self, uri: impl Into<String>) -> Self {
        self.stream_uri = uri.into();
        self
    }

    pub fn data_source_mode(mut self, mode: DataSourceMode) -> Self {
        self.data_source_mode = mode;
        self
    }

    pub fn polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    pub fn background_polling_interval(mut self, interval: Duration) -> Self {
        self.background_polling_interval = interval;
        self
    }

    pub fn disable_background_updating(mut self, disable: bool) -> Self {
        self.disable_background_updating = disable;
        self
    }

    pub fn stream_even_in_background(mut self, enabled: bool) -> Self {
        self.stream_even_in_background = enabled;
        self
    }

    pub fn initial_reconnect_delay(mut self, delay: Duration) -> Self {
        self.initial_reconnect_delay = delay;
        self
    }

    pub fn max_reconnect_delay(mut self, delay: Duration) -> Self {
        self.max_reconnect_delay = delay;
        self
    }

    pub fn max_cached_identities(mut self, count: i32) -> Self {
        self.max_cached_identities = count;
        self
    }

    pub fn start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn storage_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.storage_namespace = namespace.into();
        self
    }

    pub fn build(self) -> FlagSyncOptions {
        FlagSyncOptions {
            mobile_key: self.mobile_key,
            base_uri: self.base_uri,
            stream_uri: self.stream_uri,
            data_source_mode: self.data_source_mode,
            polling_interval: self.polling_interval,
            background_polling_interval: self.background_polling_interval,
            disable_background_updating: self.disable_background_updating,
            stream_even_in_background: self.stream_even_in_background,
            initial_reconnect_delay: self.initial_reconnect_delay,
            max_reconnect_delay: self.max_reconnect_delay,
            max_cached_identities: self.max_cached_identities,
            start_timeout: self.start_timeout,
            offline: self.offline,
            timeout: self.timeout,
            storage_namespace: self.storage_namespace,
        }
    }
}
