use std::sync::Arc;
use tokio::sync::broadcast;

use super::dispatcher::{EventDispatcher, Listener, ListenerId};
use crate::types::FlagChange;

/// Delivers value-level flag changes to listeners.
///
/// The diffing itself happens in the item store; the notifier only fans out
/// the resulting [`FlagChange`]s without blocking the writer.
pub struct ChangeNotifier {
    dispatcher: EventDispatcher<FlagChange>,
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self {
            dispatcher: EventDispatcher::new("flag-changes"),
        }
    }

    pub fn register(&self, listener: Listener<FlagChange>) -> ListenerId {
        self.dispatcher.register(listener)
    }

    /// Registers a listener that only sees changes to `key`.
    pub fn register_for_key(
        &self,
        key: impl Into<String>,
        listener: Listener<FlagChange>,
    ) -> ListenerId {
        let key = key.into();
        self.dispatcher.register(Arc::new(move |change: &FlagChange| {
            if change.key == key {
                listener(change);
            }
        }))
    }

    pub fn unregister(&self, id: ListenerId) -> bool {
        self.dispatcher.unregister(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlagChange> {
        self.dispatcher.subscribe()
    }

    pub fn notify(&self, changes: Vec<FlagChange>) {
        for change in changes {
            tracing::debug!(
                key = %change.key,
                deleted = change.deleted,
                "Flag value changed"
            );
            self.dispatcher.dispatch(change);
        }
    }
}
