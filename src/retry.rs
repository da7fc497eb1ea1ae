//! Retry policy with backoff, cancellation, and outcome classification.
//!
//! An action runs up to `max_retries + 1` times (or forever). What counts as
//! "worth retrying" is decided, in priority order, by: an outcome classifier
//! when configured; otherwise the context-aware predicates; otherwise the
//! plain predicates. With nothing configured, every error is retryable and no
//! result triggers a retry.
//!
//! Predicates run on every failed attempt, including the last, so a
//! non-retryable error propagates immediately rather than after a budget
//! check. Between attempts the policy checks its cancellation token, then
//! races the backoff delay against it.

use crate::backoff::Backoff;
use crate::classify::{classify_outcome, OutcomeClassifier};
use crate::error::MAX_RETRY_FAILURES;
use crate::events::{EventHub, PolicyEvent};
use crate::policy::{ResiliencePolicy, SharedAction};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::{CancelToken, ResilienceError};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Snapshot handed to context-aware retry predicates.
///
/// `attempt` is the 1-based number of the attempt that just finished;
/// `elapsed` is measured from just before the first attempt. Exactly one of
/// `last_error` / `last_result` is populated.
#[derive(Debug)]
pub struct RetryContext<'a, T, E> {
    pub attempt: usize,
    pub elapsed: Duration,
    pub last_error: Option<&'a ResilienceError<E>>,
    pub last_result: Option<&'a T>,
}

type ErrorPredicate<E> = Arc<dyn Fn(&ResilienceError<E>) -> bool + Send + Sync>;
type ResultPredicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;
type ContextPredicate<T, E> =
    Arc<dyn for<'a> Fn(&RetryContext<'a, T, E>) -> bool + Send + Sync>;

/// Retry policy.
///
/// Instances are stateless per call: concurrent `execute` invocations on the
/// same policy are independent, apart from a deliberately shared cancellation
/// token.
pub struct RetryPolicy<T, E> {
    max_retries: usize,
    retry_forever: bool,
    backoff: Backoff,
    retry_on: ErrorPredicate<E>,
    retry_on_ctx: Option<ContextPredicate<T, E>>,
    retry_on_result: Option<ResultPredicate<T>>,
    retry_on_result_ctx: Option<ContextPredicate<T, E>>,
    classifier: Option<Arc<dyn OutcomeClassifier<T, E>>>,
    cancel_token: Option<CancelToken>,
    event_hub: Option<EventHub>,
    sleeper: Arc<dyn Sleeper>,
    source: String,
}

impl<T, E> Clone for RetryPolicy<T, E> {
    fn clone(&self) -> Self {
        Self {
            max_retries: self.max_retries,
            retry_forever: self.retry_forever,
            backoff: self.backoff.clone(),
            retry_on: Arc::clone(&self.retry_on),
            retry_on_ctx: self.retry_on_ctx.clone(),
            retry_on_result: self.retry_on_result.clone(),
            retry_on_result_ctx: self.retry_on_result_ctx.clone(),
            classifier: self.classifier.clone(),
            cancel_token: self.cancel_token.clone(),
            event_hub: self.event_hub.clone(),
            sleeper: Arc::clone(&self.sleeper),
            source: self.source.clone(),
        }
    }
}

impl<T, E> std::fmt::Debug for RetryPolicy<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("retry_forever", &self.retry_forever)
            .field("backoff", &self.backoff)
            .field("source", &self.source)
            .finish()
    }
}

impl<T, E> RetryPolicy<T, E>
where
    T: Send,
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn builder() -> RetryPolicyBuilder<T, E> {
        RetryPolicyBuilder::new()
    }

    /// Total attempt budget, or `None` when retrying forever.
    fn max_attempts(&self) -> Option<usize> {
        if self.retry_forever {
            None
        } else {
            Some(self.max_retries + 1)
        }
    }

    pub async fn execute<Fut, Op>(&self, mut operation: Op) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let started = Instant::now();
        let max_attempts = self.max_attempts();
        let mut failures: Vec<E> = Vec::new();
        let mut attempt = 0usize;

        loop {
            attempt += 1;
            let outcome = operation().await;

            // Cancellation always terminates the loop.
            if matches!(outcome, Err(ResilienceError::Cancelled { .. })) {
                return outcome;
            }

            let retryable = self.is_retryable(&outcome, attempt, started.elapsed());
            let exhausted = max_attempts.is_some_and(|max| attempt >= max);

            match outcome {
                Ok(value) => {
                    if !retryable {
                        return Ok(value);
                    }
                    if exhausted {
                        // A retryable result on the final attempt is returned
                        // as-is, unless a classifier marked it transient.
                        if self.classifier.is_some() {
                            return Err(ResilienceError::RetryExhausted {
                                attempts: attempt,
                                failures,
                            });
                        }
                        return Ok(value);
                    }
                    self.pause_before_next(attempt, max_attempts, None).await?;
                }
                Err(error) => {
                    if !retryable {
                        return Err(error);
                    }
                    let rendered = error.to_string();
                    if let ResilienceError::Inner(e) = error {
                        failures.push(e);
                        if failures.len() > MAX_RETRY_FAILURES {
                            let excess = failures.len() - MAX_RETRY_FAILURES;
                            failures.drain(0..excess);
                        }
                    }
                    if exhausted {
                        return Err(ResilienceError::RetryExhausted {
                            attempts: attempt,
                            failures,
                        });
                    }
                    self.pause_before_next(attempt, max_attempts, Some(rendered)).await?;
                }
            }
        }
    }

    /// Emit the retry event, then wait out the backoff delay, racing the
    /// cancellation token when one is attached.
    async fn pause_before_next(
        &self,
        attempt: usize,
        max_attempts: Option<usize>,
        error: Option<String>,
    ) -> Result<(), ResilienceError<E>> {
        if let Some(token) = &self.cancel_token {
            if token.is_cancelled() {
                return Err(token.as_error());
            }
        }

        let delay = self.backoff.delay(attempt);
        if let Some(hub) = &self.event_hub {
            hub.emit(PolicyEvent::Retry {
                attempt,
                max_attempts,
                delay,
                error,
                source: self.source.clone(),
            });
        }
        tracing::debug!(attempt, ?delay, "scheduling retry");

        match &self.cancel_token {
            Some(token) if !delay.is_zero() => {
                tokio::select! {
                    _ = self.sleeper.sleep(delay) => Ok(()),
                    _ = token.cancelled() => Err(token.as_error()),
                }
            }
            _ => {
                self.sleeper.sleep(delay).await;
                Ok(())
            }
        }
    }

    fn is_retryable(
        &self,
        outcome: &Result<T, ResilienceError<E>>,
        attempt: usize,
        elapsed: Duration,
    ) -> bool {
        if let Some(classifier) = &self.classifier {
            return classify_outcome(classifier.as_ref(), outcome).is_retryable();
        }
        match outcome {
            Ok(value) => {
                if let Some(predicate) = &self.retry_on_result_ctx {
                    predicate(&RetryContext {
                        attempt,
                        elapsed,
                        last_error: None,
                        last_result: Some(value),
                    })
                } else if let Some(predicate) = &self.retry_on_result {
                    predicate(value)
                } else {
                    false
                }
            }
            Err(error) => {
                if let Some(predicate) = &self.retry_on_ctx {
                    predicate(&RetryContext {
                        attempt,
                        elapsed,
                        last_error: Some(error),
                        last_result: None,
                    })
                } else {
                    (self.retry_on)(error)
                }
            }
        }
    }
}

#[async_trait]
impl<T, E> ResiliencePolicy<T, E> for RetryPolicy<T, E>
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    async fn execute(&self, action: SharedAction<T, E>) -> Result<T, ResilienceError<E>> {
        RetryPolicy::execute(self, move || action()).await
    }
}

pub struct RetryPolicyBuilder<T, E> {
    max_retries: usize,
    retry_forever: bool,
    backoff: Backoff,
    retry_on: ErrorPredicate<E>,
    retry_on_ctx: Option<ContextPredicate<T, E>>,
    retry_on_result: Option<ResultPredicate<T>>,
    retry_on_result_ctx: Option<ContextPredicate<T, E>>,
    classifier: Option<Arc<dyn OutcomeClassifier<T, E>>>,
    cancel_token: Option<CancelToken>,
    event_hub: Option<EventHub>,
    sleeper: Arc<dyn Sleeper>,
    source: String,
}

impl<T, E> RetryPolicyBuilder<T, E>
where
    T: Send,
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            max_retries: 3,
            retry_forever: false,
            backoff: Backoff::exponential(Duration::from_secs(1)),
            retry_on: Arc::new(|_| true),
            retry_on_ctx: None,
            retry_on_result: None,
            retry_on_result_ctx: None,
            classifier: None,
            cancel_token: None,
            event_hub: None,
            sleeper: Arc::new(TokioSleeper),
            source: "retry".to_string(),
        }
    }

    /// Number of retries after the first attempt.
    pub fn max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries;
        self
    }

    /// Retry until success or cancellation, ignoring `max_retries`.
    pub fn retry_forever(mut self) -> Self {
        self.retry_forever = true;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn retry_on<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ResilienceError<E>) -> bool + Send + Sync + 'static,
    {
        self.retry_on = Arc::new(predicate);
        self
    }

    /// Context-aware error predicate; takes priority over [`Self::retry_on`].
    pub fn retry_on_context<F>(mut self, predicate: F) -> Self
    where
        F: for<'a> Fn(&RetryContext<'a, T, E>) -> bool + Send + Sync + 'static,
    {
        self.retry_on_ctx = Some(Arc::new(predicate));
        self
    }

    /// Retry when a returned result matches.
    pub fn retry_on_result<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.retry_on_result = Some(Arc::new(predicate));
        self
    }

    /// Context-aware result predicate; takes priority over
    /// [`Self::retry_on_result`].
    pub fn retry_on_result_context<F>(mut self, predicate: F) -> Self
    where
        F: for<'a> Fn(&RetryContext<'a, T, E>) -> bool + Send + Sync + 'static,
    {
        self.retry_on_result_ctx = Some(Arc::new(predicate));
        self
    }

    /// Delegate retryability entirely to a classifier. Overrides every
    /// predicate when set.
    pub fn classifier(mut self, classifier: Arc<dyn OutcomeClassifier<T, E>>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    pub fn event_hub(mut self, hub: EventHub) -> Self {
        self.event_hub = Some(hub);
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

    pub fn build(self) -> RetryPolicy<T, E> {
        RetryPolicy {
            max_retries: self.max_retries,
            retry_forever: self.retry_forever,
            backoff: self.backoff,
            retry_on: self.retry_on,
            retry_on_ctx: self.retry_on_ctx,
            retry_on_result: self.retry_on_result,
            retry_on_result_ctx: self.retry_on_result_ctx,
            classifier: self.classifier,
            cancel_token: self.cancel_token,
            event_hub: self.event_hub,
            sleeper: self.sleeper,
            source: self.source,
        }
    }
}

impl<T, E> Default for RetryPolicyBuilder<T, E>
where
    T: Send,
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
