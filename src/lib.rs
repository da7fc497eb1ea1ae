#![forbid(unsafe_code)]

//! # Backstop
//!
//! Composable resilience policies for async Rust HTTP clients: retry with
//! backoff, circuit breaking, timeouts, bulkheads, speculative hedging, and
//! fallback, composed into ordered pipelines with precisely defined
//! semantics.
//!
//! ## Features
//!
//! - **Seven policies** with one uniform `execute` contract
//! - **Ordered composition** via [`PolicyWrap`], always stored flat
//! - **Outcome classification** unifying result- and error-based decisions
//! - **Shared circuit state** through a named registry
//! - **Cooperative cancellation** raced at every suspension point
//! - **Non-blocking event hub** for observability
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use backstop::{
//!     ArcPolicy, Backoff, CircuitBreakerPolicy, CircuitBreakerRegistry, PolicyWrap,
//!     ResilienceError, RetryPolicy, TimeoutPolicy,
//! };
//!
//! type IoError = std::io::Error;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ResilienceError<IoError>> {
//!     let retry: RetryPolicy<&'static str, IoError> = RetryPolicy::builder()
//!         .max_retries(3)
//!         .backoff(Backoff::full_jitter(Duration::from_millis(200)))
//!         .build();
//!     let breaker: CircuitBreakerPolicy<&'static str, IoError> =
//!         CircuitBreakerPolicy::builder()
//!             .circuit_name("docs")
//!             .registry(CircuitBreakerRegistry::new())
//!             .build()
//!             .expect("valid breaker");
//!     let timeout = TimeoutPolicy::new(Duration::from_secs(2)).expect("valid timeout");
//!
//!     // Outermost first: Timeout → CircuitBreaker → Retry → action.
//!     let pipeline = PolicyWrap::new(vec![
//!         Arc::new(timeout) as ArcPolicy<&'static str, IoError>,
//!         Arc::new(breaker),
//!         Arc::new(retry),
//!     ])
//!     .expect("at least two policies");
//!
//!     let value = pipeline.execute(|| async { Ok("done") }).await?;
//!     assert_eq!(value, "done");
//!     Ok(())
//! }
//! ```

mod backoff;
mod bulkhead;
mod cancellation;
mod circuit_breaker;
mod circuit_registry;
mod classify;
mod clock;
mod error;
mod events;
mod fallback;
mod hedging;
mod policy;
mod registry;
mod retry;
mod sleeper;
mod timeout;
mod wrap;

// Re-exports
pub use backoff::Backoff;
pub use bulkhead::{
    BulkheadError, BulkheadIsolationBuilder, BulkheadIsolationPolicy, BulkheadPolicy,
    BulkheadPolicyBuilder, FifoSemaphore, SemaphorePermit,
};
pub use cancellation::CancelToken;
pub use circuit_breaker::{
    CircuitBreakerBuilder, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerPolicy,
    CircuitListenerGuard, CircuitMetrics, CircuitState,
};
pub use circuit_registry::{CircuitBreakerRegistry, CircuitHandle, UnknownCircuit};
pub use classify::{
    Classification, CompositeClassifier, HttpOutcomeClassifier, OutcomeClassifier, ResponseStatus,
};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use error::{RejectReason, ResilienceError, MAX_RETRY_FAILURES};
pub use events::{EventHandler, EventHub, EventSubscription, PolicyEvent, SubscriberErrorSink};
pub use fallback::{FallbackPolicy, FallbackPolicyBuilder};
pub use hedging::{HedgingPolicy, HedgingPolicyBuilder};
pub use policy::{shared_action, ArcPolicy, PolicyFuture, ResiliencePolicy, SharedAction};
pub use registry::{PolicyRegistry, RegistryError};
pub use retry::{RetryContext, RetryPolicy, RetryPolicyBuilder};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use timeout::{TimeoutError, TimeoutPolicy, MAX_TIMEOUT};
pub use wrap::{wrap, PolicyWrap, WrapError};

pub mod prelude;
