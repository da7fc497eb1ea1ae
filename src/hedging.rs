//! Hedging policy: race speculative copies of an idempotent operation.
//!
//! The original attempt starts immediately. Whenever `hedge_after` elapses
//! without an acceptable outcome (and budget remains), a speculative copy is
//! launched; an attempt that completes hedge-worthy while nothing else is in
//! flight triggers the next hedge at once. The first acceptable outcome wins
//! and the losing in-flight branches are dropped, which cancels them at their
//! next suspension point and runs their cleanup guards, so slot-holding
//! policies below (bulkhead, circuit probe) release their resources promptly.
//!
//! Only apply this to operations the caller knows are idempotent.

use crate::policy::{ResiliencePolicy, SharedAction};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::{CancelToken, ResilienceError};
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

type HedgePredicate<T, E> = Arc<dyn Fn(&Result<T, ResilienceError<E>>) -> bool + Send + Sync>;

/// Hedging policy.
pub struct HedgingPolicy<T, E> {
    hedge_after: Duration,
    max_hedged_attempts: usize,
    should_hedge: HedgePredicate<T, E>,
    cancel_token: Option<CancelToken>,
    sleeper: Arc<dyn Sleeper>,
    source: String,
}

impl<T, E> Clone for HedgingPolicy<T, E> {
    fn clone(&self) -> Self {
        Self {
            hedge_after: self.hedge_after,
            max_hedged_attempts: self.max_hedged_attempts,
            should_hedge: Arc::clone(&self.should_hedge),
            cancel_token: self.cancel_token.clone(),
            sleeper: Arc::clone(&self.sleeper),
            source: self.source.clone(),
        }
    }
}

impl<T, E> fmt::Debug for HedgingPolicy<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HedgingPolicy")
            .field("hedge_after", &self.hedge_after)
            .field("max_hedged_attempts", &self.max_hedged_attempts)
            .field("source", &self.source)
            .finish()
    }
}

impl<T, E> HedgingPolicy<T, E>
where
    T: Send,
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn builder() -> HedgingPolicyBuilder<T, E> {
        HedgingPolicyBuilder::new()
    }

    pub async fn execute<Fut, Op>(&self, mut operation: Op) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        if let Some(token) = &self.cancel_token {
            if token.is_cancelled() {
                return Err(token.as_error());
            }
        }

        let mut in_flight = FuturesUnordered::new();
        in_flight.push(operation());
        let mut hedges_fired = 0usize;

        loop {
            // An attempt that completes hedge-worthy while nothing else is
            // racing triggers the next hedge without waiting out the delay.
            if in_flight.is_empty() {
                if hedges_fired >= self.max_hedged_attempts {
                    return Err(ResilienceError::HedgingExhausted {
                        attempts: hedges_fired + 1,
                    });
                }
                hedges_fired += 1;
                in_flight.push(operation());
            }

            if hedges_fired < self.max_hedged_attempts {
                let timer = self.sleeper.sleep(self.hedge_after);
                tokio::pin!(timer);
                loop {
                    tokio::select! {
                        outcome = in_flight.next() => {
                            match outcome {
                                Some(result) => {
                                    if !(self.should_hedge)(&result) {
                                        return result;
                                    }
                                    tracing::debug!(
                                        hedges_fired,
                                        "hedge-worthy outcome, continuing race"
                                    );
                                    if in_flight.is_empty() {
                                        break;
                                    }
                                }
                                None => break,
                            }
                        }
                        _ = &mut timer => {
                            hedges_fired += 1;
                            tracing::debug!(hedges_fired, "launching hedged attempt");
                            in_flight.push(operation());
                            break;
                        }
                        _ = wait_cancelled(&self.cancel_token) => {
                            return Err(self.cancellation_error());
                        }
                    }
                }
            } else {
                loop {
                    tokio::select! {
                        outcome = in_flight.next() => {
                            match outcome {
                                Some(result) => {
                                    if !(self.should_hedge)(&result) {
                                        return result;
                                    }
                                }
                                None => {
                                    return Err(ResilienceError::HedgingExhausted {
                                        attempts: hedges_fired + 1,
                                    });
                                }
                            }
                        }
                        _ = wait_cancelled(&self.cancel_token) => {
                            return Err(self.cancellation_error());
                        }
                    }
                }
            }
        }
    }

    fn cancellation_error(&self) -> ResilienceError<E> {
        match &self.cancel_token {
            Some(token) => token.as_error(),
            None => ResilienceError::Cancelled { reason: None },
        }
    }
}

async fn wait_cancelled(token: &Option<CancelToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl<T, E> ResiliencePolicy<T, E> for HedgingPolicy<T, E>
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    async fn execute(&self, action: SharedAction<T, E>) -> Result<T, ResilienceError<E>> {
        HedgingPolicy::execute(self, move || action()).await
    }
}

pub struct HedgingPolicyBuilder<T, E> {
    hedge_after: Duration,
    max_hedged_attempts: usize,
    should_hedge: HedgePredicate<T, E>,
    cancel_token: Option<CancelToken>,
    sleeper: Arc<dyn Sleeper>,
    source: String,
}

impl<T, E> HedgingPolicyBuilder<T, E>
where
    T: Send,
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            hedge_after: Duration::from_secs(1),
            max_hedged_attempts: 1,
            // Any successful result wins by default; errors keep the race
            // going.
            should_hedge: Arc::new(|outcome| outcome.is_err()),
            cancel_token: None,
            sleeper: Arc::new(TokioSleeper),
            source: "hedging".to_string(),
        }
    }

    /// Delay before each speculative copy is launched.
    pub fn hedge_after(mut self, delay: Duration) -> Self {
        self.hedge_after = delay;
        self
    }

    /// Speculative copies allowed beyond the original attempt.
    pub fn max_hedged_attempts(mut self, attempts: usize) -> Self {
        self.max_hedged_attempts = attempts;
        self
    }

    /// `true` means the outcome is hedge-worthy (keep racing); `false` means
    /// it wins.
    pub fn should_hedge<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Result<T, ResilienceError<E>>) -> bool + Send + Sync + 'static,
    {
        self.should_hedge = Arc::new(predicate);
        self
    }

    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn build(self) -> HedgingPolicy<T, E> {
        HedgingPolicy {
            hedge_after: self.hedge_after,
            max_hedged_attempts: self.max_hedged_attempts,
            should_hedge: self.should_hedge,
            cancel_token: self.cancel_token,
            sleeper: self.sleeper,
            source: self.source,
        }
    }
}

impl<T, E> HedgingPolicyBuilder<T, E>
where
    T: crate::classify::ResponseStatus + Send,
    E: std::error::Error + Send + Sync + 'static,
{
    /// HTTP acceptance: any non-5xx response wins; errors and 5xx keep the
    /// race going.
    pub fn hedge_on_http_failures(self) -> Self {
        self.should_hedge(|outcome| match outcome {
            Ok(response) => (500..=599).contains(&response.status_code()),
            Err(_) => true,
        })
    }
}

impl<T, E> Default for HedgingPolicyBuilder<T, E>
where
    T: Send,
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
