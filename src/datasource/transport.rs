use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::Deserialize;

use crate::error::DataSourceError;
use crate::types::{Identity, Item, Snapshot};

/// Events of one open subscription, in arrival order.
pub type EventStream = BoxStream<'static, Result<StreamEvent, DataSourceError>>;

/// Decoded message from a flag subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Full data set, replaces everything.
    Put(Snapshot),
    /// One added or updated item.
    Patch(Item),
    /// One removed item.
    Delete { key: String, version: u64 },
    /// Data changed upstream; fetch the full set.
    Ping,
}

#[derive(Deserialize)]
struct DeletePayload {
    key: String,
    version: u64,
}

impl StreamEvent {
    /// Decodes an event from its name and JSON payload.
    ///
    /// Returns `Ok(None)` for event names this client does not handle.
    pub fn parse(event: &str, data: &str) -> Result<Option<Self>, DataSourceError> {
        let invalid =
            |e: serde_json::Error| DataSourceError::invalid_data(format!("bad {} event: {}", event, e));

        let parsed = match event {
            "put" => {
                let snapshot: Snapshot = serde_json::from_str(data).map_err(invalid)?;
                StreamEvent::Put(Snapshot::from_map(snapshot.into_items()))
            }
            "patch" => {
                let item: Item = serde_json::from_str(data).map_err(invalid)?;
                if item.key.is_empty() {
                    return Err(DataSourceError::invalid_data("patch event without key"));
                }
                StreamEvent::Patch(item)
            }
            "delete" => {
                let payload: DeletePayload = serde_json::from_str(data).map_err(invalid)?;
                StreamEvent::Delete {
                    key: payload.key,
                    version: payload.version,
                }
            }
            "ping" => StreamEvent::Ping,
            other => {
                tracing::debug!("Ignoring unknown stream event {}", other);
                return Ok(None);
            }
        };
        Ok(Some(parsed))
    }
}

/// Network primitives the built-in sources are written against.
///
/// Implementations report failures as [`DataSourceError`]s; the sources
/// decide whether to retry from [`DataSourceError::is_recoverable`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetches the complete data set for `identity`.
    async fn fetch_once(&self, identity: &Identity) -> Result<Snapshot, DataSourceError>;

    /// Opens a subscription for `identity`.
    ///
    /// The stream ends when the connection closes; an item error means the
    /// connection failed.
    async fn subscribe(&self, identity: &Identity) -> Result<EventStream, DataSourceError>;
}
