//! Circuit breaker with shared, named state.
//!
//! Every policy constructed with the same `(registry, circuit_name)` pair
//! observes one state object, so a circuit tripped by one client is open for
//! all of them. Break-duration timing uses a monotonic [`Clock`]; the
//! wall-clock timestamps in [`CircuitMetrics`] are diagnostics only.
//!
//! The open → half-open transition is lazy: the admission check that finds
//! the break duration elapsed performs the transition but still rejects that
//! call; the next call claims the probe slot. Exactly one probe runs at a
//! time, claimed synchronously before the action's first suspension.

use crate::classify::ResponseStatus;
use crate::clock::{Clock, MonotonicClock};
use crate::events::{EventHub, PolicyEvent};
use crate::policy::{ResiliencePolicy, SharedAction};
use crate::ResilienceError;
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime};

/// Admission state of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Errors returned when configuring circuit breakers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CircuitBreakerError {
    #[error("failure threshold must be > 0")]
    ZeroFailureThreshold,
    #[error("success threshold must be > 0")]
    ZeroSuccessThreshold,
    #[error("circuit name must not be empty")]
    EmptyName,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive counted failures that trip the circuit.
    pub failure_threshold: usize,
    /// Consecutive successful probes that close it again.
    pub success_threshold: usize,
    /// How long the circuit stays open before probing resumes.
    pub break_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            break_duration: Duration::from_secs(30),
        }
    }
}

/// Point-in-time snapshot of a circuit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitMetrics {
    pub state: CircuitState,
    pub consecutive_failures: usize,
    pub consecutive_successes: usize,
    /// Calls that were admitted and ran to an outcome.
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    /// Calls turned away while open; disjoint from `total_calls`.
    pub rejected_calls: u64,
    pub opened_at: Option<SystemTime>,
    pub last_transition_at: Option<SystemTime>,
}

type StateListener = Arc<dyn Fn(CircuitState, CircuitState) + Send + Sync>;
type ListenerErrorSink = Arc<dyn Fn(&str) + Send + Sync>;

struct CircuitCore {
    state: CircuitState,
    consecutive_failures: usize,
    consecutive_successes: usize,
    opened_at_millis: Option<u64>,
    opened_at_wall: Option<SystemTime>,
    last_transition_wall: Option<SystemTime>,
    probe_in_flight: bool,
    total_calls: u64,
    successful_calls: u64,
    failed_calls: u64,
    rejected_calls: u64,
    listeners: Vec<(u64, StateListener)>,
    next_listener_id: u64,
    error_sink: Option<ListenerErrorSink>,
}

/// State shared by every policy bound to one circuit name.
pub(crate) struct CircuitShared {
    name: String,
    clock: Arc<dyn Clock>,
    core: Mutex<CircuitCore>,
}

pub(crate) enum Admission {
    Allowed { probe: bool },
    Rejected { retry_after: Option<Duration> },
}

impl CircuitShared {
    pub(crate) fn new(name: String, clock: Arc<dyn Clock>) -> Self {
        Self {
            name,
            clock,
            core: Mutex::new(CircuitCore {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at_millis: None,
                opened_at_wall: None,
                last_transition_wall: None,
                probe_in_flight: false,
                total_calls: 0,
                successful_calls: 0,
                failed_calls: 0,
                rejected_calls: 0,
                listeners: Vec::new(),
                next_listener_id: 0,
                error_sink: None,
            }),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn state(&self) -> CircuitState {
        self.core.lock().unwrap_or_else(|p| p.into_inner()).state
    }

    pub(crate) fn metrics(&self) -> CircuitMetrics {
        let core = self.core.lock().unwrap_or_else(|p| p.into_inner());
        CircuitMetrics {
            state: core.state,
            consecutive_failures: core.consecutive_failures,
            consecutive_successes: core.consecutive_successes,
            total_calls: core.total_calls,
            successful_calls: core.successful_calls,
            failed_calls: core.failed_calls,
            rejected_calls: core.rejected_calls,
            opened_at: core.opened_at_wall,
            last_transition_at: core.last_transition_wall,
        }
    }

    /// Decide whether a call may proceed, claiming the probe slot when one is
    /// available. Called synchronously at the start of `execute`.
    pub(crate) fn try_admit(&self, break_duration: Duration) -> Admission {
        let mut core = self.core.lock().unwrap_or_else(|p| p.into_inner());
        match core.state {
            CircuitState::Closed => Admission::Allowed { probe: false },
            CircuitState::Open => {
                let opened_at = core.opened_at_millis.unwrap_or(0);
                let elapsed = self.clock.now_millis().saturating_sub(opened_at);
                let break_millis = break_duration.as_millis() as u64;
                if elapsed >= break_millis {
                    // Lazy transition: observable by the next call; this one
                    // is still rejected.
                    self.transition(&mut core, CircuitState::HalfOpen);
                    core.rejected_calls += 1;
                    Admission::Rejected { retry_after: Some(Duration::ZERO) }
                } else {
                    core.rejected_calls += 1;
                    Admission::Rejected {
                        retry_after: Some(Duration::from_millis(break_millis - elapsed)),
                    }
                }
            }
            CircuitState::HalfOpen => {
                if core.probe_in_flight {
                    core.rejected_calls += 1;
                    Admission::Rejected { retry_after: None }
                } else {
                    core.probe_in_flight = true;
                    Admission::Allowed { probe: true }
                }
            }
        }
    }

    /// Record an admitted call's outcome and apply state transitions.
    pub(crate) fn record(
        &self,
        failure: bool,
        probe: bool,
        config: &CircuitBreakerConfig,
        hub: Option<&EventHub>,
        source: &str,
    ) {
        let mut core = self.core.lock().unwrap_or_else(|p| p.into_inner());
        if probe {
            core.probe_in_flight = false;
        }
        core.total_calls += 1;
        if failure {
            core.failed_calls += 1;
            core.consecutive_failures += 1;
            core.consecutive_successes = 0;
            let failures = core.consecutive_failures;
            match core.state {
                CircuitState::HalfOpen => {
                    let previous = core.state;
                    self.transition(&mut core, CircuitState::Open);
                    tracing::warn!(circuit = %self.name, failures, "probe failed, circuit reopened");
                    self.emit_opened(&core, previous, hub, source);
                }
                CircuitState::Closed if failures >= config.failure_threshold => {
                    let previous = core.state;
                    self.transition(&mut core, CircuitState::Open);
                    tracing::error!(
                        circuit = %self.name,
                        failures,
                        threshold = config.failure_threshold,
                        "circuit opened"
                    );
                    self.emit_opened(&core, previous, hub, source);
                }
                _ => {}
            }
        } else {
            core.successful_calls += 1;
            core.consecutive_successes += 1;
            core.consecutive_failures = 0;
            if core.state == CircuitState::HalfOpen
                && core.consecutive_successes >= config.success_threshold
            {
                let previous = core.state;
                self.transition(&mut core, CircuitState::Closed);
                core.consecutive_successes = 0;
                tracing::info!(circuit = %self.name, "circuit closed");
                if let Some(hub) = hub {
                    hub.emit(PolicyEvent::CircuitClosed {
                        circuit: self.name.clone(),
                        previous,
                        source: source.to_string(),
                    });
                }
            }
        }
    }

    fn emit_opened(
        &self,
        core: &CircuitCore,
        previous: CircuitState,
        hub: Option<&EventHub>,
        source: &str,
    ) {
        if let Some(hub) = hub {
            hub.emit(PolicyEvent::CircuitOpened {
                circuit: self.name.clone(),
                previous,
                consecutive_failures: core.consecutive_failures,
                source: source.to_string(),
            });
        }
    }

    /// Apply a state change and notify listeners while the lock is held.
    /// Listeners must not re-enter the circuit.
    fn transition(&self, core: &mut CircuitCore, to: CircuitState) {
        let from = core.state;
        if from == to {
            return;
        }
        core.state = to;
        core.last_transition_wall = Some(SystemTime::now());
        match to {
            CircuitState::Open => {
                core.opened_at_millis = Some(self.clock.now_millis());
                core.opened_at_wall = Some(SystemTime::now());
                core.probe_in_flight = false;
            }
            CircuitState::Closed => {
                core.opened_at_millis = None;
                core.probe_in_flight = false;
            }
            CircuitState::HalfOpen => {}
        }
        for (_, listener) in core.listeners.clone() {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| listener(from, to)));
            if let Err(payload) = outcome {
                let message = panic_text(payload.as_ref());
                match &core.error_sink {
                    Some(sink) => sink(message),
                    None => {
                        tracing::debug!(circuit = %self.name, message, "state listener panicked")
                    }
                }
            }
        }
    }

    pub(crate) fn release_probe(&self) {
        let mut core = self.core.lock().unwrap_or_else(|p| p.into_inner());
        core.probe_in_flight = false;
    }

    pub(crate) fn add_listener(self: Arc<Self>, listener: StateListener) -> CircuitListenerGuard {
        let shared = Arc::downgrade(&self);
        let mut core = self.core.lock().unwrap_or_else(|p| p.into_inner());
        let id = core.next_listener_id;
        core.next_listener_id += 1;
        core.listeners.push((id, listener));
        CircuitListenerGuard { id, shared }
    }

    pub(crate) fn set_error_sink(&self, sink: ListenerErrorSink) {
        self.core.lock().unwrap_or_else(|p| p.into_inner()).error_sink = Some(sink);
    }

    /// Force the circuit back to closed, clearing consecutive counters.
    /// Cumulative call counts are retained for diagnostics.
    pub(crate) fn reset(&self) {
        let mut core = self.core.lock().unwrap_or_else(|p| p.into_inner());
        core.consecutive_failures = 0;
        core.consecutive_successes = 0;
        self.transition(&mut core, CircuitState::Closed);
    }
}

impl fmt::Debug for CircuitShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitShared")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

fn panic_text(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "listener panicked"
    }
}

/// Handle to deregister a circuit state listener.
#[derive(Debug)]
pub struct CircuitListenerGuard {
    id: u64,
    shared: Weak<CircuitShared>,
}

impl CircuitListenerGuard {
    /// Remove the listener. Safe to call after the circuit is gone.
    pub fn cancel(self) {
        if let Some(shared) = self.shared.upgrade() {
            let mut core = shared.core.lock().unwrap_or_else(|p| p.into_inner());
            core.listeners.retain(|(id, _)| *id != self.id);
        }
    }
}

/// Releases the half-open probe slot if the call is dropped before its
/// outcome is recorded (timeout above us, cancelled hedge branch).
struct ProbeSlot {
    shared: Arc<CircuitShared>,
    armed: bool,
}

impl Drop for ProbeSlot {
    fn drop(&mut self) {
        if self.armed {
            self.shared.release_probe();
        }
    }
}

type CountPredicate<T, E> = Arc<dyn Fn(&Result<T, ResilienceError<E>>) -> bool + Send + Sync>;

/// Circuit breaker policy.
pub struct CircuitBreakerPolicy<T, E> {
    shared: Arc<CircuitShared>,
    config: CircuitBreakerConfig,
    should_count: CountPredicate<T, E>,
    event_hub: Option<EventHub>,
    source: String,
}

impl<T, E> Clone for CircuitBreakerPolicy<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            config: self.config.clone(),
            should_count: Arc::clone(&self.should_count),
            event_hub: self.event_hub.clone(),
            source: self.source.clone(),
        }
    }
}

impl<T, E> fmt::Debug for CircuitBreakerPolicy<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerPolicy")
            .field("circuit", &self.shared.name)
            .field("state", &self.shared.state())
            .field("config", &self.config)
            .finish()
    }
}

impl<T, E> CircuitBreakerPolicy<T, E>
where
    T: Send,
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn builder() -> CircuitBreakerBuilder<T, E> {
        CircuitBreakerBuilder::new()
    }

    pub fn circuit_name(&self) -> &str {
        self.shared.name()
    }

    pub fn state(&self) -> CircuitState {
        self.shared.state()
    }

    pub fn metrics(&self) -> CircuitMetrics {
        self.shared.metrics()
    }

    /// Register a state-change listener; cancel the returned guard to remove
    /// it. Every transition invokes every listener exactly once.
    pub fn add_state_change_listener<F>(&self, listener: F) -> CircuitListenerGuard
    where
        F: Fn(CircuitState, CircuitState) + Send + Sync + 'static,
    {
        Arc::clone(&self.shared).add_listener(Arc::new(listener))
    }

    pub async fn execute<Fut, Op>(&self, mut operation: Op) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        match self.shared.try_admit(self.config.break_duration) {
            Admission::Rejected { retry_after } => {
                tracing::debug!(circuit = %self.shared.name, "call rejected by open circuit");
                Err(ResilienceError::CircuitOpen {
                    circuit: self.shared.name.clone(),
                    retry_after,
                })
            }
            Admission::Allowed { probe } => {
                let mut slot = if probe {
                    Some(ProbeSlot { shared: Arc::clone(&self.shared), armed: true })
                } else {
                    None
                };
                let result = operation().await;
                if let Some(slot) = slot.as_mut() {
                    slot.armed = false;
                }
                let failure = (self.should_count)(&result);
                self.shared.record(
                    failure,
                    probe,
                    &self.config,
                    self.event_hub.as_ref(),
                    &self.source,
                );
                result
            }
        }
    }
}

#[async_trait]
impl<T, E> ResiliencePolicy<T, E> for CircuitBreakerPolicy<T, E>
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    async fn execute(&self, action: SharedAction<T, E>) -> Result<T, ResilienceError<E>> {
        CircuitBreakerPolicy::execute(self, move || action()).await
    }
}

pub struct CircuitBreakerBuilder<T, E> {
    circuit_name: String,
    config: CircuitBreakerConfig,
    registry: Option<crate::CircuitBreakerRegistry>,
    should_count: Option<CountPredicate<T, E>>,
    on_state_change: Option<StateListener>,
    listener_error_sink: Option<ListenerErrorSink>,
    event_hub: Option<EventHub>,
    clock: Option<Arc<dyn Clock>>,
    source: String,
}

impl<T, E> CircuitBreakerBuilder<T, E>
where
    T: Send,
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            circuit_name: String::new(),
            config: CircuitBreakerConfig::default(),
            registry: None,
            should_count: None,
            on_state_change: None,
            listener_error_sink: None,
            event_hub: None,
            clock: None,
            source: "circuit-breaker".to_string(),
        }
    }

    pub fn circuit_name(mut self, name: impl Into<String>) -> Self {
        self.circuit_name = name.into();
        self
    }

    pub fn failure_threshold(mut self, threshold: usize) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn success_threshold(mut self, threshold: usize) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    pub fn break_duration(mut self, duration: Duration) -> Self {
        self.config.break_duration = duration;
        self
    }

    /// Share state through this registry instead of the process-wide default.
    pub fn registry(mut self, registry: crate::CircuitBreakerRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Decide which outcomes count as failures. Default: every error except
    /// cancellation counts; results never do.
    pub fn should_count<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Result<T, ResilienceError<E>>) -> bool + Send + Sync + 'static,
    {
        self.should_count = Some(Arc::new(predicate));
        self
    }

    pub fn on_state_change<F>(mut self, listener: F) -> Self
    where
        F: Fn(CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Arc::new(listener));
        self
    }

    /// Route state-listener panics somewhere instead of a debug log line.
    pub fn listener_error_sink<F>(mut self, sink: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.listener_error_sink = Some(Arc::new(sink));
        self
    }

    pub fn event_hub(mut self, hub: EventHub) -> Self {
        self.event_hub = Some(hub);
        self
    }

    /// Clock used for break-duration timing when this builder creates the
    /// shared state. An existing circuit keeps its original clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn build(self) -> Result<CircuitBreakerPolicy<T, E>, CircuitBreakerError> {
        if self.circuit_name.is_empty() {
            return Err(CircuitBreakerError::EmptyName);
        }
        if self.config.failure_threshold == 0 {
            return Err(CircuitBreakerError::ZeroFailureThreshold);
        }
        if self.config.success_threshold == 0 {
            return Err(CircuitBreakerError::ZeroSuccessThreshold);
        }

        let registry =
            self.registry.unwrap_or_else(|| crate::CircuitBreakerRegistry::global().clone());
        let clock = self.clock.unwrap_or_else(|| Arc::new(MonotonicClock::default()));
        let shared = registry.shared(&self.circuit_name, clock);

        if let Some(listener) = self.on_state_change {
            // Construction-time listeners live as long as the circuit.
            let _ = Arc::clone(&shared).add_listener(listener);
        }
        if let Some(sink) = self.listener_error_sink {
            shared.set_error_sink(sink);
        }

        Ok(CircuitBreakerPolicy {
            shared,
            config: self.config,
            should_count: self
                .should_count
                .unwrap_or_else(|| Arc::new(|outcome| matches!(outcome, Err(e) if !e.is_cancelled()))),
            event_hub: self.event_hub,
            source: self.source,
        })
    }
}

impl<T, E> CircuitBreakerBuilder<T, E>
where
    T: ResponseStatus + Send,
    E: std::error::Error + Send + Sync + 'static,
{
    /// Count 5xx responses as failures in addition to errors, matching the
    /// default HTTP classification.
    pub fn count_http_failures(self) -> Self {
        self.should_count(|outcome| match outcome {
            Ok(response) => (500..=599).contains(&response.status_code()),
            Err(error) => !error.is_cancelled(),
        })
    }
}

impl<T, E> Default for CircuitBreakerBuilder<T, E>
where
    T: Send,
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
