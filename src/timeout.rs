//! Timeout policy for bounding async operation duration.
//!
//! Semantics
//! - Wraps an async operation and returns `ResilienceError::Timeout` when the
//!   deadline elapses.
//! - Uses `tokio::time::timeout`; on timeout the inner future is dropped, so
//!   cancellation-unsafe work may leave partial state behind. When a
//!   [`CancelToken`] is attached, it is signalled with reason `"timeout"` so
//!   downstream work sharing the token can abort cooperatively.
//! - Placed inside a retry, each attempt gets a fresh deadline; placed
//!   outside, all attempts share one budget.

use crate::events::{EventHub, PolicyEvent};
use crate::policy::{ResiliencePolicy, SharedAction};
use crate::{CancelToken, ResilienceError};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Maximum allowed timeout (30 days), guarding against accidental
/// effectively-infinite deadlines. Override via [`TimeoutPolicy::new_with_max`]
/// when longer horizons are genuinely required.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Errors returned when configuring timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TimeoutError {
    #[error("timeout duration must be > 0")]
    ZeroDuration,
    #[error("timeout duration {requested:?} exceeds maximum allowed {limit:?}")]
    ExceedsMaximum { requested: Duration, limit: Duration },
}

/// Policy that enforces a maximum duration on async operations.
#[derive(Debug, Clone)]
pub struct TimeoutPolicy {
    duration: Duration,
    cancel_token: Option<CancelToken>,
    event_hub: Option<EventHub>,
    source: String,
}

impl TimeoutPolicy {
    /// Creates a timeout policy with the specified duration.
    ///
    /// # Errors
    ///
    /// Returns [`TimeoutError::ZeroDuration`] if `duration` is zero and
    /// [`TimeoutError::ExceedsMaximum`] if it exceeds [`MAX_TIMEOUT`].
    pub fn new(duration: Duration) -> Result<Self, TimeoutError> {
        Self::new_with_max(duration, MAX_TIMEOUT)
    }

    /// Construct with a caller-specified maximum allowed timeout.
    pub fn new_with_max(duration: Duration, max: Duration) -> Result<Self, TimeoutError> {
        if duration.is_zero() {
            return Err(TimeoutError::ZeroDuration);
        }
        if duration > max {
            return Err(TimeoutError::ExceedsMaximum { requested: duration, limit: max });
        }
        Ok(Self { duration, cancel_token: None, event_hub: None, source: "timeout".to_string() })
    }

    /// Signal this token (reason `"timeout"`) whenever the deadline fires.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    pub fn with_event_hub(mut self, hub: EventHub) -> Self {
        self.event_hub = Some(hub);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Returns the configured timeout duration.
    #[must_use]
    #[inline]
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Execute an operation with a timeout.
    ///
    /// Returns `Ok(T)` when the operation finishes before the deadline, else
    /// `Err(ResilienceError::Timeout { elapsed, timeout })`. `elapsed` is
    /// measured from just before the operation is invoked and can exceed the
    /// configured duration slightly due to scheduling overhead.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        let start = Instant::now();

        match tokio::time::timeout(self.duration, operation()).await {
            Ok(result) => result,
            Err(_) => {
                let elapsed = start.elapsed();
                if let Some(token) = &self.cancel_token {
                    token.cancel_with_reason("timeout");
                }
                if let Some(hub) = &self.event_hub {
                    hub.emit(PolicyEvent::Timeout {
                        timeout: self.duration,
                        source: self.source.clone(),
                    });
                }
                tracing::debug!(timeout = ?self.duration, ?elapsed, "operation timed out");
                Err(ResilienceError::Timeout { elapsed, timeout: self.duration })
            }
        }
    }
}

#[async_trait]
impl<T, E> ResiliencePolicy<T, E> for TimeoutPolicy
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    async fn execute(&self, action: SharedAction<T, E>) -> Result<T, ResilienceError<E>> {
        TimeoutPolicy::execute(self, move || action()).await
    }
}
