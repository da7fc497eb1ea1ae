//! Fallback policy: replace a failure with a substitute outcome.
//!
//! On an error the `should_handle` gate decides whether the fallback engages
//! (cancellation never does, unless opted into explicitly). On a result, the
//! `should_handle_result` predicate is the sole gate when set; otherwise a
//! configured classifier triggers the fallback for any non-success verdict.
//! The `on_fallback` callback fires, and the fallback event is emitted,
//! before the fallback action runs.

use crate::classify::OutcomeClassifier;
use crate::events::{EventHub, PolicyEvent};
use crate::policy::{PolicyFuture, ResiliencePolicy, SharedAction};
use crate::ResilienceError;
use async_trait::async_trait;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

type FallbackAction<T, E> =
    Arc<dyn Fn(Option<ResilienceError<E>>) -> PolicyFuture<T, E> + Send + Sync>;
type HandlePredicate<E> = Arc<dyn Fn(&ResilienceError<E>) -> bool + Send + Sync>;
type ResultPredicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;
type FallbackCallback<E> = Arc<dyn Fn(Option<&ResilienceError<E>>) + Send + Sync>;

/// Fallback policy.
pub struct FallbackPolicy<T, E> {
    fallback_action: FallbackAction<T, E>,
    should_handle: HandlePredicate<E>,
    should_handle_result: Option<ResultPredicate<T>>,
    classifier: Option<Arc<dyn OutcomeClassifier<T, E>>>,
    on_fallback: Option<FallbackCallback<E>>,
    event_hub: Option<EventHub>,
    source: String,
}

impl<T, E> Clone for FallbackPolicy<T, E> {
    fn clone(&self) -> Self {
        Self {
            fallback_action: Arc::clone(&self.fallback_action),
            should_handle: Arc::clone(&self.should_handle),
            should_handle_result: self.should_handle_result.clone(),
            classifier: self.classifier.clone(),
            on_fallback: self.on_fallback.clone(),
            event_hub: self.event_hub.clone(),
            source: self.source.clone(),
        }
    }
}

impl<T, E> fmt::Debug for FallbackPolicy<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackPolicy")
            .field("has_result_gate", &self.should_handle_result.is_some())
            .field("has_classifier", &self.classifier.is_some())
            .field("source", &self.source)
            .finish()
    }
}

impl<T, E> FallbackPolicy<T, E>
where
    T: Send,
    E: std::error::Error + Send + Sync + 'static,
{
    /// Policy that answers every handled failure with `fallback_action`.
    pub fn new<F, Fut>(fallback_action: F) -> Self
    where
        F: Fn(Option<ResilienceError<E>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send + 'static,
    {
        Self::builder(fallback_action).build()
    }

    pub fn builder<F, Fut>(fallback_action: F) -> FallbackPolicyBuilder<T, E>
    where
        F: Fn(Option<ResilienceError<E>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send + 'static,
    {
        FallbackPolicyBuilder::new(fallback_action)
    }

    pub async fn execute<Fut, Op>(&self, mut operation: Op) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        match operation().await {
            Ok(value) => {
                let triggered = if let Some(predicate) = &self.should_handle_result {
                    predicate(&value)
                } else if let Some(classifier) = &self.classifier {
                    !classifier.classify_response(&value).is_success()
                } else {
                    false
                };
                if !triggered {
                    return Ok(value);
                }
                self.engage(None).await
            }
            Err(error) => {
                if !(self.should_handle)(&error) {
                    return Err(error);
                }
                self.engage(Some(error)).await
            }
        }
    }

    async fn engage(&self, error: Option<ResilienceError<E>>) -> Result<T, ResilienceError<E>> {
        if let Some(callback) = &self.on_fallback {
            callback(error.as_ref());
        }
        if let Some(hub) = &self.event_hub {
            hub.emit(PolicyEvent::Fallback {
                error: error.as_ref().map(|e| e.to_string()),
                source: self.source.clone(),
            });
        }
        tracing::debug!(triggered_by_error = error.is_some(), "fallback engaged");
        (self.fallback_action)(error).await
    }
}

#[async_trait]
impl<T, E> ResiliencePolicy<T, E> for FallbackPolicy<T, E>
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    async fn execute(&self, action: SharedAction<T, E>) -> Result<T, ResilienceError<E>> {
        FallbackPolicy::execute(self, move || action()).await
    }
}

pub struct FallbackPolicyBuilder<T, E> {
    fallback_action: FallbackAction<T, E>,
    should_handle: HandlePredicate<E>,
    should_handle_result: Option<ResultPredicate<T>>,
    classifier: Option<Arc<dyn OutcomeClassifier<T, E>>>,
    on_fallback: Option<FallbackCallback<E>>,
    event_hub: Option<EventHub>,
    source: String,
}

impl<T, E> FallbackPolicyBuilder<T, E>
where
    T: Send,
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new<F, Fut>(fallback_action: F) -> Self
    where
        F: Fn(Option<ResilienceError<E>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send + 'static,
    {
        Self {
            fallback_action: Arc::new(move |error| fallback_action(error).boxed()),
            // Cancellation is not a failure to mask; everything else is
            // handled by default.
            should_handle: Arc::new(|error| !error.is_cancelled()),
            should_handle_result: None,
            classifier: None,
            on_fallback: None,
            event_hub: None,
            source: "fallback".to_string(),
        }
    }

    pub fn should_handle<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ResilienceError<E>) -> bool + Send + Sync + 'static,
    {
        self.should_handle = Arc::new(predicate);
        self
    }

    /// Sole result gate when set: `true` triggers the fallback, `false`
    /// returns the primary result unchanged. Takes strict precedence over a
    /// configured classifier.
    pub fn should_handle_result<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.should_handle_result = Some(Arc::new(predicate));
        self
    }

    /// Trigger the fallback for results a classifier deems non-success.
    pub fn classifier(mut self, classifier: Arc<dyn OutcomeClassifier<T, E>>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Side-effect callback invoked just before the fallback action runs.
    /// Must not panic.
    pub fn on_fallback<F>(mut self, callback: F) -> Self
    where
        F: Fn(Option<&ResilienceError<E>>) + Send + Sync + 'static,
    {
        self.on_fallback = Some(Arc::new(callback));
        self
    }

    pub fn event_hub(mut self, hub: EventHub) -> Self {
        self.event_hub = Some(hub);
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn build(self) -> FallbackPolicy<T, E> {
        FallbackPolicy {
            fallback_action: self.fallback_action,
            should_handle: self.should_handle,
            should_handle_result: self.should_handle_result,
            classifier: self.classifier,
            on_fallback: self.on_fallback,
            event_hub: self.event_hub,
            source: self.source,
        }
    }
}
