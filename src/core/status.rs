//! Connection status tracking.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use tokio::sync::broadcast;

use super::dispatcher::{EventDispatcher, Listener, ListenerId};
use crate::error::DataSourceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// No data received yet for the current identity.
    Initializing,
    Valid,
    /// Connection lost; the data source is retrying.
    Interrupted,
    BackgroundDisabled,
    NetworkUnavailable,
    SetOffline,
    /// Permanently stopped, either by an unrecoverable error or by close.
    Shutdown,
}

impl ConnectionState {
    /// States in which no data source is expected to run.
    pub fn is_offline(&self) -> bool {
        matches!(
            self,
            ConnectionState::BackgroundDisabled
                | ConnectionState::NetworkUnavailable
                | ConnectionState::SetOffline
                | ConnectionState::Shutdown
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Initializing => "INITIALIZING",
            ConnectionState::Valid => "VALID",
            ConnectionState::Interrupted => "INTERRUPTED",
            ConnectionState::BackgroundDisabled => "BACKGROUND_DISABLED",
            ConnectionState::NetworkUnavailable => "NETWORK_UNAVAILABLE",
            ConnectionState::SetOffline => "SET_OFFLINE",
            ConnectionState::Shutdown => "SHUTDOWN",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub state_since: DateTime<Utc>,
    pub last_error: Option<DataSourceError>,
    pub last_successful_connection: Option<DateTime<Utc>>,
}

impl ConnectionStatus {
    fn initial() -> Self {
        Self {
            state: ConnectionState::Initializing,
            state_since: Utc::now(),
            last_error: None,
            last_successful_connection: None,
        }
    }
}

/// Holds the single current [`ConnectionStatus`] and publishes changes.
pub struct StatusTracker {
    status: RwLock<ConnectionStatus>,
    dispatcher: EventDispatcher<ConnectionStatus>,
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusTracker {
    pub fn new() -> Self {
        Self {
            status: RwLock::new(ConnectionStatus::initial()),
            dispatcher: EventDispatcher::new("status"),
        }
    }

    pub fn current(&self) -> ConnectionStatus {
        self.status.read().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.status.read().state
    }

    /// Records a state transition and/or an error.
    ///
    /// `Interrupted` while still `Initializing` keeps `Initializing`: the
    /// source never delivered data, so there was nothing to interrupt.
    pub fn update(&self, state: Option<ConnectionState>, error: Option<DataSourceError>) {
        let updated = {
            let mut status = self.status.write();
            let mut changed = false;

            if let Some(mut new_state) = state {
                if new_state == ConnectionState::Interrupted
                    && status.state == ConnectionState::Initializing
                {
                    new_state = ConnectionState::Initializing;
                }
                if new_state != status.state {
                    tracing::debug!("Connection state {} -> {}", status.state, new_state);
                    status.state = new_state;
                    status.state_since = Utc::now();
                    changed = true;
                }
                if new_state == ConnectionState::Valid {
                    status.last_successful_connection = Some(status.state_since);
                }
            }

            if let Some(error) = error {
                tracing::debug!("Recording data source error: {}", error);
                status.last_error = Some(error);
                changed = true;
            }

            changed.then(|| status.clone())
        };

        if let Some(status) = updated {
            self.dispatcher.dispatch(status);
        }
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.update(Some(state), None);
    }

    pub fn record_error(&self, error: DataSourceError) {
        self.update(None, Some(error));
    }

    pub fn register(&self, listener: Listener<ConnectionStatus>) -> ListenerId {
        self.dispatcher.register(listener)
    }

    pub fn unregister(&self, id: ListenerId) -> bool {
        self.dispatcher.unregister(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionStatus> {
        self.dispatcher.subscribe()
    }
}
