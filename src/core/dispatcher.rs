//! Ordered, non-blocking delivery of events to listeners.
//!
//! Producers hand events to an unbounded queue and return immediately. A
//! dedicated thread drains the queue and calls every registered listener in
//! registration order; a panicking listener is caught and logged so the
//! remaining listeners still run. Events are also fanned out on a
//! `broadcast` channel for async consumers.

use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

const BROADCAST_CAPACITY: usize = 256;

/// Callback invoked for every dispatched event.
pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Handle returned by registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type ListenerList<T> = Arc<RwLock<Vec<(ListenerId, Listener<T>)>>>;

pub struct EventDispatcher<T: Clone + Send + 'static> {
    listeners: ListenerList<T>,
    next_id: AtomicU64,
    queue: mpsc::UnboundedSender<T>,
    broadcast: broadcast::Sender<T>,
}

impl<T: Clone + Send + 'static> EventDispatcher<T> {
    pub fn new(name: &str) -> Self {
        let listeners: ListenerList<T> = Arc::new(RwLock::new(Vec::new()));
        let (queue, receiver) = mpsc::unbounded_channel();
        let (broadcast, _) = broadcast::channel(BROADCAST_CAPACITY);

        let worker_listeners = Arc::clone(&listeners);
        let spawned = std::thread::Builder::new()
            .name(format!("flagsync-{}", name))
            .spawn(move || run_listeners(receiver, worker_listeners));
        if let Err(e) = spawned {
            tracing::error!("Failed to start {} dispatcher thread: {}", name, e);
        }

        Self {
            listeners,
            next_id: AtomicU64::new(1),
            queue,
            broadcast,
        }
    }

    pub fn register(&self, listener: Listener<T>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    /// Returns false when `id` was not registered.
    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.broadcast.subscribe()
    }

    /// Queues `event` for delivery. Never blocks.
    pub fn dispatch(&self, event: T) {
        // no receivers is not an error
        let _ = self.broadcast.send(event.clone());
        if self.queue.send(event).is_err() {
            tracing::debug!("Dispatcher worker is gone; dropping event");
        }
    }
}

fn run_listeners<T>(mut receiver: mpsc::UnboundedReceiver<T>, listeners: ListenerList<T>) {
    while let Some(event) = receiver.blocking_recv() {
        let current: Vec<Listener<T>> = listeners
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in current {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                tracing::warn!("Listener panicked while handling an event");
            }
        }
    }
}
