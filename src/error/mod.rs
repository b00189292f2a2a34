use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod sanitizer;

pub use sanitizer::sanitize_message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Initialization errors
    InitFailed,

    // Network errors
    NetworkError,
    NetworkTimeout,

    // HTTP errors
    HttpBadRequest,
    HttpUnauthorized,
    HttpForbidden,
    HttpNotFound,
    HttpRateLimited,
    HttpServerError,
    HttpInvalidResponse,

    // Cache errors
    CacheReadError,
    CacheWriteError,
    CacheInvalidData,
    CacheStorageError,

    // Data source errors
    DataSourceShutdown,
    DataSourceInvalidData,

    // Configuration errors
    ConfigInvalidUrl,
    ConfigInvalidInterval,
    ConfigInvalidMobileKey,
    ConfigInvalidPollingInterval,
    ConfigInvalidReconnectDelay,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InitFailed => "INIT_FAILED",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::NetworkTimeout => "NETWORK_TIMEOUT",
            ErrorCode::HttpBadRequest => "HTTP_BAD_REQUEST",
            ErrorCode::HttpUnauthorized => "HTTP_UNAUTHORIZED",
            ErrorCode::HttpForbidden => "HTTP_FORBIDDEN",
            ErrorCode::HttpNotFound => "HTTP_NOT_FOUND",
            ErrorCode::HttpRateLimited => "HTTP_RATE_LIMITED",
            ErrorCode::HttpServerError => "HTTP_SERVER_ERROR",
            ErrorCode::HttpInvalidResponse => "HTTP_INVALID_RESPONSE",
            ErrorCode::CacheReadError => "CACHE_READ_ERROR",
            ErrorCode::CacheWriteError => "CACHE_WRITE_ERROR",
            ErrorCode::CacheInvalidData => "CACHE_INVALID_DATA",
            ErrorCode::CacheStorageError => "CACHE_STORAGE_ERROR",
            ErrorCode::DataSourceShutdown => "DATA_SOURCE_SHUTDOWN",
            ErrorCode::DataSourceInvalidData => "DATA_SOURCE_INVALID_DATA",
            ErrorCode::ConfigInvalidUrl => "CONFIG_INVALID_URL",
            ErrorCode::ConfigInvalidInterval => "CONFIG_INVALID_INTERVAL",
            ErrorCode::ConfigInvalidMobileKey => "CONFIG_INVALID_MOBILE_KEY",
            ErrorCode::ConfigInvalidPollingInterval => "CONFIG_INVALID_POLLING_INTERVAL",
            ErrorCode::ConfigInvalidReconnectDelay => "CONFIG_INVALID_RECONNECT_DELAY",
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorCode::NetworkError
                | ErrorCode::NetworkTimeout
                | ErrorCode::HttpBadRequest
                | ErrorCode::HttpRateLimited
                | ErrorCode::HttpServerError
                | ErrorCode::HttpInvalidResponse
                | ErrorCode::CacheReadError
                | ErrorCode::CacheWriteError
                | ErrorCode::CacheInvalidData
                | ErrorCode::CacheStorageError
                | ErrorCode::DataSourceInvalidData
        )
    }

    /// Maps an HTTP status code onto the closest error code.
    pub fn from_status(status: u16) -> ErrorCode {
        match status {
            400 => ErrorCode::HttpBadRequest,
            401 => ErrorCode::HttpUnauthorized,
            403 => ErrorCode::HttpForbidden,
            404 => ErrorCode::HttpNotFound,
            408 => ErrorCode::NetworkTimeout,
            429 => ErrorCode::HttpRateLimited,
            500..=599 => ErrorCode::HttpServerError,
            _ => ErrorCode::HttpInvalidResponse,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Error, Debug)]
#[error("[{code}] {message}")]
pub struct FlagSyncError {
    pub code: ErrorCode,
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl FlagSyncError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        code: ErrorCode,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.code.is_recoverable()
    }

    pub fn is_config_error(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::ConfigInvalidUrl
                | ErrorCode::ConfigInvalidInterval
                | ErrorCode::ConfigInvalidMobileKey
                | ErrorCode::ConfigInvalidPollingInterval
                | ErrorCode::ConfigInvalidReconnectDelay
        )
    }
}

pub type Result<T> = std::result::Result<T, FlagSyncError>;

/// Classification of synchronization failures as seen by status observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// I/O failure talking to the service.
    NetworkError,
    /// The service answered with a non-2xx status.
    ErrorResponse,
    /// The service answered with a payload that could not be decoded.
    InvalidData,
    /// Applying or persisting an update failed locally.
    StoreError,
    Unknown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::NetworkError => "NETWORK_ERROR",
            ErrorKind::ErrorResponse => "ERROR_RESPONSE",
            ErrorKind::InvalidData => "INVALID_DATA",
            ErrorKind::StoreError => "STORE_ERROR",
            ErrorKind::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// Returns whether a failed request with this status is worth retrying.
///
/// 400, 408, 429 and all 5xx responses are transient; every other 4xx means
/// the credentials or the request itself will never be accepted.
pub fn is_http_error_recoverable(status: u16) -> bool {
    if (400..500).contains(&status) {
        matches!(status, 400 | 408 | 429)
    } else {
        true
    }
}

/// A failure reported by a data source or by the store while applying its
/// updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceError {
    pub kind: ErrorKind,
    pub status_code: Option<u16>,
    pub message: String,
    pub time: DateTime<Utc>,
}

impl DataSourceError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status_code: None,
            message: sanitize_message(&message.into()),
            time: Utc::now(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NetworkError, message)
    }

    pub fn response(status: u16) -> Self {
        Self {
            status_code: Some(status),
            ..Self::new(
                ErrorKind::ErrorResponse,
                format!("unexpected response status {}", status),
            )
        }
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidData, message)
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StoreError, message)
    }

    /// Whether the data source should keep retrying after this error.
    pub fn is_recoverable(&self) -> bool {
        match (self.kind, self.status_code) {
            (ErrorKind::ErrorResponse, Some(status)) => is_http_error_recoverable(status),
            _ => true,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match (self.kind, self.status_code) {
            (ErrorKind::ErrorResponse, Some(status)) => ErrorCode::from_status(status),
            (ErrorKind::NetworkError, _) => ErrorCode::NetworkError,
            (ErrorKind::InvalidData, _) => ErrorCode::DataSourceInvalidData,
            (ErrorKind::StoreError, _) => ErrorCode::CacheWriteError,
            _ => ErrorCode::InitFailed,
        }
    }
}

impl std::fmt::Display for DataSourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status_code {
            Some(status) => write!(f, "{} ({}): {}", self.kind, status, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for DataSourceError {}

impl From<DataSourceError> for FlagSyncError {
    fn from(error: DataSourceError) -> Self {
        FlagSyncError::new(error.code(), error.message)
    }
}

/// Failure of a persistent storage backend.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored data is corrupt: {0}")]
    Corrupt(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    /// Code for this failure while reading from the backend.
    pub fn read_code(&self) -> ErrorCode {
        match self {
            StorageError::Io(_) => ErrorCode::CacheReadError,
            StorageError::Corrupt(_) => ErrorCode::CacheInvalidData,
            StorageError::Unavailable(_) => ErrorCode::CacheStorageError,
        }
    }

    /// Code for this failure while writing to the backend.
    pub fn write_code(&self) -> ErrorCode {
        match self {
            StorageError::Io(_) => ErrorCode::CacheWriteError,
            StorageError::Corrupt(_) => ErrorCode::CacheInvalidData,
            StorageError::Unavailable(_) => ErrorCode::CacheStorageError,
        }
    }

    /// Stable name of the failure class, used to log each class only once.
    pub fn class(&self) -> String {
        match self {
            StorageError::Io(e) => format!("io:{:?}", e.kind()),
            StorageError::Corrupt(_) => "corrupt".to_string(),
            StorageError::Unavailable(_) => "unavailable".to_string(),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(error: serde_json::Error) -> Self {
        StorageError::Corrupt(error.to_string())
    }
}
