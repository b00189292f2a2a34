use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use super::backoff::Backoff;
use super::polling::PollingDataSourceFactory;
use super::transport::{StreamEvent, Transport};
use super::{DataSource, DataSourceContext, DataSourceFactory, StartSignal};
use crate::core::{ConnectionState, FlagSyncOptions};
use crate::error::DataSourceError;
use crate::types::{Item, Snapshot};

/// Builds streaming sources, or background polling sources while the app
/// is backgrounded and streaming there is not enabled.
pub struct StreamingDataSourceFactory {
    transport: Arc<dyn Transport>,
    backoff: Backoff,
    stream_even_in_background: bool,
    background: PollingDataSourceFactory,
}

impl StreamingDataSourceFactory {
    pub fn new(options: &FlagSyncOptions, transport: Arc<dyn Transport>) -> Self {
        Self {
            backoff: Backoff::new(options.initial_reconnect_delay, options.max_reconnect_delay),
            stream_even_in_background: options.stream_even_in_background,
            background: PollingDataSourceFactory::new(options, Arc::clone(&transport)),
            transport,
        }
    }
}

impl DataSourceFactory for StreamingDataSourceFactory {
    fn build(&self, context: DataSourceContext) -> Arc<dyn DataSource> {
        if context.in_background && !self.stream_even_in_background {
            tracing::debug!("In background, using polling instead of streaming");
            return self.background.build(context);
        }
        Arc::new(StreamingDataSource::new(
            context,
            Arc::clone(&self.transport),
            self.backoff.clone(),
        ))
    }
}

struct StreamState {
    context: DataSourceContext,
    transport: Arc<dyn Transport>,
    signal: StartSignal,
    initialized: AtomicBool,
}

/// Keeps a subscription open and reconnects with backoff when it drops.
///
/// A `put` (or the fetch triggered by a `ping`) replaces all data; `patch`
/// and `delete` are applied as versioned upserts. While reconnecting the
/// status is `Interrupted`. An unrecoverable error stops the source and
/// reports it through [`UpdateSink::shut_down`](super::UpdateSink::shut_down).
pub struct StreamingDataSource {
    state: Arc<StreamState>,
    backoff: Backoff,
    started: AtomicBool,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StreamingDataSource {
    pub fn new(context: DataSourceContext, transport: Arc<dyn Transport>, backoff: Backoff) -> Self {
        Self {
            state: Arc::new(StreamState {
                context,
                transport,
                signal: StartSignal::new(),
                initialized: AtomicBool::new(false),
            }),
            backoff,
            started: AtomicBool::new(false),
            shutdown_tx: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }
}

#[async_trait]
impl DataSource for StreamingDataSource {
    async fn start(&self) -> bool {
        if !self.started.swap(true, Ordering::SeqCst) {
            let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
            *self.shutdown_tx.lock() = Some(shutdown_tx);

            let state = Arc::clone(&self.state);
            let mut backoff = self.backoff.clone();
            let handle = tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::debug!("Streaming data source shutting down");
                    }
                    _ = state.run(&mut backoff) => {}
                }
            });
            *self.worker.lock() = Some(handle);
        }

        self.state.signal.wait().await
    }

    fn is_initialized(&self) -> bool {
        self.state.initialized.load(Ordering::SeqCst)
    }

    async fn dispose(&self) {
        self.started.store(true, Ordering::SeqCst);
        self.state.signal.complete(false);

        let shutdown_tx = self.shutdown_tx.lock().take();
        if let Some(tx) = shutdown_tx {
            let _ = tx.send(()).await;
        }
        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            let _ = handle.await;
        }
        tracing::debug!("Streaming data source disposed");
    }
}

impl StreamState {
    async fn run(&self, backoff: &mut Backoff) {
        loop {
            let error = match self.stream_once(backoff).await {
                Ok(()) => DataSourceError::network("stream closed by server"),
                Err(e) => e,
            };

            if !error.is_recoverable() {
                tracing::error!(
                    "Stream for {} failed permanently: {}",
                    self.context.identity,
                    error
                );
                self.context.sink.shut_down(error);
                self.signal.complete(false);
                return;
            }

            let delay = backoff.next_delay();
            tracing::warn!("Stream interrupted: {}; reconnecting in {:?}", error, delay);
            self.context
                .sink
                .update_status(Some(ConnectionState::Interrupted), Some(error));
            sleep(delay).await;
        }
    }

    async fn stream_once(&self, backoff: &mut Backoff) -> Result<(), DataSourceError> {
        let identity = &self.context.identity;
        tracing::debug!("Opening flag stream for {}", identity);
        let mut events = self.transport.subscribe(identity).await?;

        while let Some(event) = events.next().await {
            match event? {
                StreamEvent::Put(snapshot) => {
                    self.apply_full(snapshot);
                    backoff.reset();
                }
                StreamEvent::Patch(item) => self.context.sink.upsert(identity, item),
                StreamEvent::Delete { key, version } => {
                    self.context.sink.upsert(identity, Item::tombstone(key, version))
                }
                StreamEvent::Ping => {
                    let snapshot = self.transport.fetch_once(identity).await?;
                    self.apply_full(snapshot);
                }
            }
        }

        Ok(())
    }

    fn apply_full(&self, snapshot: Snapshot) {
        tracing::debug!("Received {} flags from stream", snapshot.len());
        self.context.sink.init(&self.context.identity, snapshot);
        self.initialized.store(true, Ordering::SeqCst);
        self.context
            .sink
            .update_status(Some(ConnectionState::Valid), None);
        self.signal.complete(true);
    }
}
