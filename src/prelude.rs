//! Convenient re-exports for common Backstop types.
pub use crate::{
    backoff::Backoff,
    bulkhead::{BulkheadIsolationPolicy, BulkheadPolicy},
    cancellation::CancelToken,
    circuit_breaker::{CircuitBreakerConfig, CircuitBreakerPolicy, CircuitMetrics, CircuitState},
    circuit_registry::{CircuitBreakerRegistry, CircuitHandle},
    classify::{Classification, HttpOutcomeClassifier, OutcomeClassifier, ResponseStatus},
    error::{RejectReason, ResilienceError},
    events::{EventHub, PolicyEvent},
    fallback::FallbackPolicy,
    hedging::HedgingPolicy,
    policy::{ArcPolicy, ResiliencePolicy, SharedAction},
    registry::PolicyRegistry,
    retry::{RetryContext, RetryPolicy},
    sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper},
    timeout::TimeoutPolicy,
    wrap::{wrap, PolicyWrap},
};
