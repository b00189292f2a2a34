//! Pluggable sources of flag data.
//!
//! A [`DataSource`] pushes data for one identity into an [`UpdateSink`]: one
//! `init` with the full snapshot once it has it, then zero or more `upsert`s.
//! Sources are built by a [`DataSourceFactory`] each time the connection
//! manager (re)creates one, and are disposed before their replacement is
//! built.
//!
//! Built-in variants:
//!
//! - [`StreamingDataSource`]: long-lived subscription with reconnect backoff
//! - [`PollingDataSource`]: full fetch on a fixed interval
//! - [`TestData`]: manually driven, no network

mod backoff;
mod polling;
mod streaming;
mod test_data;
mod transport;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;

use crate::core::{ConnectionState, DataSourceMode, FlagSyncOptions};
use crate::error::DataSourceError;
use crate::types::{Identity, Item, Snapshot};

pub use backoff::Backoff;
pub use polling::{PollingDataSource, PollingDataSourceFactory};
pub use streaming::{StreamingDataSource, StreamingDataSourceFactory};
pub use test_data::{FlagBuilder, TestData};
pub use transport::{EventStream, StreamEvent, Transport};

/// Where a data source delivers what it receives.
pub trait UpdateSink: Send + Sync {
    /// Replaces all data for `identity`.
    fn init(&self, identity: &Identity, snapshot: Snapshot);

    /// Applies `item` if it is newer than what is stored.
    fn upsert(&self, identity: &Identity, item: Item);

    /// Reports a state change and/or a recoverable error.
    fn update_status(&self, state: Option<ConnectionState>, error: Option<DataSourceError>);

    /// Reports that the source stopped for good and must not be rebuilt.
    fn shut_down(&self, error: DataSourceError);
}

#[async_trait]
pub trait DataSource: Send + Sync {
    /// Starts the source if needed and resolves once the first full data set
    /// was delivered (`true`) or the source failed permanently (`false`).
    ///
    /// Calling it again after it resolved returns the same outcome.
    async fn start(&self) -> bool;

    fn is_initialized(&self) -> bool;

    /// Stops all activity. No sink call happens after this resolves.
    async fn dispose(&self);
}

/// Everything a factory needs to build a source for the current conditions.
#[derive(Clone)]
pub struct DataSourceContext {
    pub identity: Identity,
    pub in_background: bool,
    /// Background state when the previous source was built.
    pub previously_in_background: bool,
    /// Data for `identity` already arrived through an earlier source.
    pub initialized: bool,
    pub sink: Arc<dyn UpdateSink>,
}

impl DataSourceContext {
    /// True right after a foreground to background transition, with the
    /// identity's data already loaded.
    pub fn just_entered_background(&self) -> bool {
        self.initialized && self.in_background && !self.previously_in_background
    }
}

pub trait DataSourceFactory: Send + Sync {
    fn build(&self, context: DataSourceContext) -> Arc<dyn DataSource>;
}

/// Factory matching the configured [`DataSourceMode`].
pub fn factory_for_options(
    options: &FlagSyncOptions,
    transport: Arc<dyn Transport>,
) -> Arc<dyn DataSourceFactory> {
    match options.data_source_mode {
        DataSourceMode::Streaming => Arc::new(StreamingDataSourceFactory::new(options, transport)),
        DataSourceMode::Polling => Arc::new(PollingDataSourceFactory::new(options, transport)),
    }
}

/// One-shot outcome of a source's start, observable by any number of waiters.
pub(crate) struct StartSignal {
    outcome: watch::Sender<Option<bool>>,
}

impl StartSignal {
    pub(crate) fn new() -> Self {
        let (outcome, _) = watch::channel(None);
        Self { outcome }
    }

    /// Records the outcome; only the first call has an effect.
    pub(crate) fn complete(&self, succeeded: bool) {
        self.outcome.send_if_modified(|outcome| {
            if outcome.is_some() {
                return false;
            }
            *outcome = Some(succeeded);
            true
        });
    }

    pub(crate) async fn wait(&self) -> bool {
        let mut receiver = self.outcome.subscribe();
        let outcome = match receiver.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.unwrap_or(false),
            Err(_) => false,
        };
        outcome
    }
}
