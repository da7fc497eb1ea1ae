//! Lifecycle events and the hub that broadcasts them.
//!
//! Policies emit a [`PolicyEvent`] at every interesting transition: a retry
//! being scheduled, a circuit opening or closing, a timeout firing, a
//! fallback engaging, a bulkhead turning a caller away. The [`EventHub`]
//! fans those events out to subscribers without ever blocking the emitting
//! policy: `emit` pushes onto a bounded queue and a single dispatcher task
//! drains it, so subscribers observe events in emission order.
//!
//! The core itself logs nothing on success paths; attach
//! [`EventHub::subscribe_logger`] or a custom subscriber to get telemetry.

use crate::circuit_breaker::CircuitState;
use crate::error::RejectReason;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

/// Events emitted by policies during execution.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyEvent {
    /// A retry is about to be scheduled, after the numbered attempt failed.
    Retry {
        /// 1-based number of the attempt that just failed.
        attempt: usize,
        /// Total attempt budget; `None` when retrying forever.
        max_attempts: Option<usize>,
        /// Backoff delay taken before the next attempt.
        delay: Duration,
        /// Rendered failure, when the attempt failed with an error.
        error: Option<String>,
        source: String,
    },
    /// A circuit transitioned to open.
    CircuitOpened {
        circuit: String,
        previous: CircuitState,
        consecutive_failures: usize,
        source: String,
    },
    /// A circuit transitioned to closed.
    CircuitClosed { circuit: String, previous: CircuitState, source: String },
    /// An operation exceeded its deadline.
    Timeout { timeout: Duration, source: String },
    /// A fallback is about to run.
    Fallback {
        /// Rendered trigger, when an error (rather than a result) tripped it.
        error: Option<String>,
        source: String,
    },
    /// A bulkhead rejected a caller.
    BulkheadRejected {
        max_concurrency: usize,
        max_queue_depth: usize,
        reason: RejectReason,
        source: String,
    },
}

impl PolicyEvent {
    /// The policy instance that emitted this event.
    pub fn source(&self) -> &str {
        match self {
            PolicyEvent::Retry { source, .. }
            | PolicyEvent::CircuitOpened { source, .. }
            | PolicyEvent::CircuitClosed { source, .. }
            | PolicyEvent::Timeout { source, .. }
            | PolicyEvent::Fallback { source, .. }
            | PolicyEvent::BulkheadRejected { source, .. } => source,
        }
    }
}

impl fmt::Display for PolicyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyEvent::Retry { attempt, max_attempts, delay, .. } => match max_attempts {
                Some(max) => write!(f, "Retry(#{}/{}, delay={:?})", attempt, max, delay),
                None => write!(f, "Retry(#{}, delay={:?})", attempt, delay),
            },
            PolicyEvent::CircuitOpened { circuit, previous, consecutive_failures, .. } => {
                write!(
                    f,
                    "CircuitOpened('{}', from={}, failures={})",
                    circuit, previous, consecutive_failures
                )
            }
            PolicyEvent::CircuitClosed { circuit, previous, .. } => {
                write!(f, "CircuitClosed('{}', from={})", circuit, previous)
            }
            PolicyEvent::Timeout { timeout, .. } => write!(f, "Timeout({:?})", timeout),
            PolicyEvent::Fallback { error, .. } => match error {
                Some(error) => write!(f, "Fallback(error={})", error),
                None => write!(f, "Fallback(result)"),
            },
            PolicyEvent::BulkheadRejected { max_concurrency, max_queue_depth, reason, .. } => {
                write!(
                    f,
                    "BulkheadRejected({}, max={}, queue={})",
                    reason, max_concurrency, max_queue_depth
                )
            }
        }
    }
}

/// Handler invoked for every event delivered by the hub.
pub type EventHandler = Arc<dyn Fn(&PolicyEvent) + Send + Sync>;

/// Sink for subscriber panics: receives the event and the panic message.
pub type SubscriberErrorSink = Arc<dyn Fn(&PolicyEvent, &str) + Send + Sync>;

struct SubscriberSet {
    next_id: u64,
    handlers: Vec<(u64, EventHandler)>,
    error_sink: Option<SubscriberErrorSink>,
}

struct HubShared {
    subscribers: Mutex<SubscriberSet>,
    emitted: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// Non-blocking broadcast of policy events.
///
/// Must be created inside a tokio runtime: construction spawns the dispatcher
/// task. Dropping every clone of the hub shuts the dispatcher down.
#[derive(Clone)]
pub struct EventHub {
    tx: mpsc::Sender<PolicyEvent>,
    shared: Arc<HubShared>,
}

impl EventHub {
    /// Hub with the default queue capacity.
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Hub with an explicit dispatch-queue capacity. Events emitted while the
    /// queue is full are counted and dropped rather than blocking the emitter.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<PolicyEvent>(capacity.max(1));
        let shared = Arc::new(HubShared {
            subscribers: Mutex::new(SubscriberSet {
                next_id: 0,
                handlers: Vec::new(),
                error_sink: None,
            }),
            emitted: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });

        let worker_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let (handlers, sink) = {
                    let set = worker_shared.subscribers.lock().unwrap_or_else(|p| p.into_inner());
                    (set.handlers.clone(), set.error_sink.clone())
                };
                for (_, handler) in handlers {
                    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| handler(&event)));
                    if let Err(payload) = outcome {
                        let message = panic_message(payload.as_ref());
                        match &sink {
                            Some(sink) => sink(&event, message),
                            None => {
                                tracing::debug!(event = %event, message, "event subscriber panicked")
                            }
                        }
                    }
                }
                worker_shared.delivered.fetch_add(1, Ordering::Release);
            }
        });

        Self { tx, shared }
    }

    /// Queue an event for asynchronous delivery. Never blocks; a full queue
    /// drops the event and bumps [`EventHub::dropped`].
    pub fn emit(&self, event: PolicyEvent) {
        self.shared.emitted.fetch_add(1, Ordering::Release);
        if self.tx.try_send(event).is_err() {
            self.shared.dropped.fetch_add(1, Ordering::Release);
        }
    }

    /// Register a handler for all future events. The returned subscription
    /// deregisters the handler when cancelled; dropping it without cancelling
    /// leaves the handler attached.
    pub fn subscribe<F>(&self, handler: F) -> EventSubscription
    where
        F: Fn(&PolicyEvent) + Send + Sync + 'static,
    {
        let mut set = self.shared.subscribers.lock().unwrap_or_else(|p| p.into_inner());
        let id = set.next_id;
        set.next_id += 1;
        set.handlers.push((id, Arc::new(handler)));
        EventSubscription { id, shared: Arc::downgrade(&self.shared) }
    }

    /// Convenience subscriber that logs every event through `tracing`.
    pub fn subscribe_logger(&self) -> EventSubscription {
        self.subscribe(|event| tracing::info!(event = %event, "policy_event"))
    }

    /// Route subscriber panics somewhere instead of silently dropping them.
    pub fn set_error_sink<F>(&self, sink: F)
    where
        F: Fn(&PolicyEvent, &str) + Send + Sync + 'static,
    {
        self.shared.subscribers.lock().unwrap_or_else(|p| p.into_inner()).error_sink =
            Some(Arc::new(sink));
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.lock().unwrap_or_else(|p| p.into_inner()).handlers.len()
    }

    /// Events accepted by `emit` so far.
    pub fn emitted(&self) -> u64 {
        self.shared.emitted.load(Ordering::Acquire)
    }

    /// Events lost to a full dispatch queue.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Acquire)
    }

    /// Wait until every event emitted so far has been delivered or dropped.
    /// Intended for tests and orderly shutdown.
    pub async fn flushed(&self) {
        loop {
            let emitted = self.shared.emitted.load(Ordering::Acquire);
            let settled = self.shared.delivered.load(Ordering::Acquire)
                + self.shared.dropped.load(Ordering::Acquire);
            if settled >= emitted {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHub")
            .field("subscribers", &self.subscriber_count())
            .field("emitted", &self.emitted())
            .field("dropped", &self.dropped())
            .finish()
    }
}

/// Handle returned by [`EventHub::subscribe`].
#[derive(Debug)]
pub struct EventSubscription {
    id: u64,
    shared: Weak<HubShared>,
}

impl EventSubscription {
    /// Deregister the handler. Safe to call after the hub is gone.
    pub fn cancel(self) {
        if let Some(shared) = self.shared.upgrade() {
            let mut set = shared.subscribers.lock().unwrap_or_else(|p| p.into_inner());
            set.handlers.retain(|(id, _)| *id != self.id);
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "subscriber panicked"
    }
}
