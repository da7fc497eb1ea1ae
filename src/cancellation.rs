//! Cooperative cancellation shared across policies.
//!
//! A [`CancelToken`] is a single-writer, multi-reader stop signal. Policies
//! that suspend (backoff waits, hedge races, queued bulkhead waiters) race
//! their suspension against [`CancelToken::cancelled`] and fail with
//! `ResilienceError::Cancelled` when the token fires.

use crate::ResilienceError;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

type CancelListener = Box<dyn FnOnce(Option<&str>) + Send>;

struct TokenState {
    cancelled: bool,
    reason: Option<String>,
    listeners: Vec<CancelListener>,
}

struct TokenInner {
    flag: watch::Sender<bool>,
    state: Mutex<TokenState>,
}

/// Cooperative stop signal.
///
/// Cloning yields another handle to the same signal. `cancel` is idempotent:
/// the first call wins, records the reason, completes every pending
/// [`CancelToken::cancelled`] future, and invokes each registered listener
/// exactly once. Later calls are no-ops.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (flag, _) = watch::channel(false);
        Self {
            inner: Arc::new(TokenInner {
                flag,
                state: Mutex::new(TokenState {
                    cancelled: false,
                    reason: None,
                    listeners: Vec::new(),
                }),
            }),
        }
    }

    /// Signal cancellation with no reason.
    pub fn cancel(&self) {
        self.cancel_inner(None);
    }

    /// Signal cancellation, recording why.
    pub fn cancel_with_reason(&self, reason: impl Into<String>) {
        self.cancel_inner(Some(reason.into()));
    }

    fn cancel_inner(&self, reason: Option<String>) {
        let (reason, listeners) = {
            let mut state = self.inner.state.lock().unwrap_or_else(|p| p.into_inner());
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            state.reason = reason;
            (state.reason.clone(), std::mem::take(&mut state.listeners))
        };
        let _ = self.inner.flag.send(true);
        for listener in listeners {
            listener(reason.as_deref());
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.lock().unwrap_or_else(|p| p.into_inner()).cancelled
    }

    /// The reason recorded at cancellation time, if any.
    pub fn reason(&self) -> Option<String> {
        self.inner.state.lock().unwrap_or_else(|p| p.into_inner()).reason.clone()
    }

    /// Completes once the token is cancelled. Completes immediately for a
    /// token that is already cancelled; every caller observes the same
    /// completion.
    pub async fn cancelled(&self) {
        let mut rx = self.inner.flag.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Register a listener invoked exactly once at cancellation. A listener
    /// registered after the token fired is invoked immediately.
    pub fn on_cancelled<F>(&self, listener: F)
    where
        F: FnOnce(Option<&str>) + Send + 'static,
    {
        let mut state = self.inner.state.lock().unwrap_or_else(|p| p.into_inner());
        if state.cancelled {
            let reason = state.reason.clone();
            drop(state);
            listener(reason.as_deref());
        } else {
            state.listeners.push(Box::new(listener));
        }
    }

    /// The cancellation error this token maps to.
    pub fn as_error<E>(&self) -> ResilienceError<E> {
        ResilienceError::Cancelled { reason: self.reason() }
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("is_cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}
