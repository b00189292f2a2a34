use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use super::transport::Transport;
use super::{DataSource, DataSourceContext, DataSourceFactory, StartSignal};
use crate::core::{ConnectionState, FlagSyncOptions};

pub struct PollingDataSourceFactory {
    transport: Arc<dyn Transport>,
    interval: Duration,
    background_interval: Duration,
}

impl PollingDataSourceFactory {
    pub fn new(options: &FlagSyncOptions, transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            interval: options.polling_interval,
            background_interval: options.background_polling_interval,
        }
    }
}

impl DataSourceFactory for PollingDataSourceFactory {
    fn build(&self, context: DataSourceContext) -> Arc<dyn DataSource> {
        let interval = if context.in_background {
            self.background_interval
        } else {
            self.interval
        };
        // Entering the background right after a foreground sync; no need to
        // poll again straight away. Without data yet, poll immediately.
        let initial_delay = if context.just_entered_background() {
            interval
        } else {
            Duration::ZERO
        };

        Arc::new(PollingDataSource::new(
            context,
            Arc::clone(&self.transport),
            interval,
            initial_delay,
        ))
    }
}

struct PollState {
    context: DataSourceContext,
    transport: Arc<dyn Transport>,
    interval: Duration,
    initial_delay: Duration,
    signal: StartSignal,
    initialized: AtomicBool,
}

/// Fetches the full data set on a fixed interval.
pub struct PollingDataSource {
    state: Arc<PollState>,
    started: AtomicBool,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PollingDataSource {
    pub fn new(
        context: DataSourceContext,
        transport: Arc<dyn Transport>,
        interval: Duration,
        initial_delay: Duration,
    ) -> Self {
        Self {
            state: Arc::new(PollState {
                context,
                transport,
                interval,
                initial_delay,
                signal: StartSignal::new(),
                initialized: AtomicBool::new(false),
            }),
            started: AtomicBool::new(false),
            shutdown_tx: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.state.interval
    }

    pub fn initial_delay(&self) -> Duration {
        self.state.initial_delay
    }
}

#[async_trait]
impl DataSource for PollingDataSource {
    async fn start(&self) -> bool {
        if !self.started.swap(true, Ordering::SeqCst) {
            let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
            *self.shutdown_tx.lock() = Some(shutdown_tx);

            let state = Arc::clone(&self.state);
            let handle = tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::debug!("Polling data source shutting down");
                    }
                    _ = state.run() => {}
                }
            });
            *self.worker.lock() = Some(handle);

            tracing::debug!(
                "Polling data source started with interval {:?}",
                self.state.interval
            );
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
        tracing::debug!("Polling data source disposed");
    }
}

impl PollState {
    async fn run(&self) {
        if !self.initial_delay.is_zero() {
            if self.context.initialized {
                // Already-loaded data is considered current until the first poll.
                self.initialized.store(true, Ordering::SeqCst);
                self.signal.complete(true);
            }
            sleep(self.initial_delay).await;
        }

        loop {
            if !self.poll().await {
                return;
            }
            sleep(self.interval).await;
        }
    }

    /// Returns false once polling must stop.
    async fn poll(&self) -> bool {
        let identity = &self.context.identity;
        match self.transport.fetch_once(identity).await {
            Ok(snapshot) => {
                tracing::debug!("Poll returned {} flags for {}", snapshot.len(), identity);
                self.context.sink.init(identity, snapshot);
                self.initialized.store(true, Ordering::SeqCst);
                self.context
                    .sink
                    .update_status(Some(ConnectionState::Valid), None);
                self.signal.complete(true);
                true
            }
            Err(error) if !error.is_recoverable() => {
                tracing::error!("Polling for {} failed permanently: {}", identity, error);
                self.context.sink.shut_down(error);
                self.signal.complete(false);
                false
            }
            Err(error) => {
                tracing::warn!("Poll failed: {}; retrying in {:?}", error, self.interval);
                self.context
                    .sink
                    .update_status(Some(ConnectionState::Interrupted), Some(error));
                true
            }
        }
    }
}
