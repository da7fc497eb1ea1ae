//! The `execute` capability every policy exposes.
//!
//! Concrete policies keep their ergonomic inherent `execute` methods (taking
//! plain closures); this trait is the object-safe form used for composition.
//! A [`PolicyWrap`](crate::PolicyWrap) stores `Arc<dyn ResiliencePolicy>`
//! values and folds them into one nested chain, so the action closure must be
//! shareable and re-invocable — hence [`SharedAction`].

use crate::ResilienceError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;

/// Boxed future produced by a policy or an action.
pub type PolicyFuture<T, E> = BoxFuture<'static, Result<T, ResilienceError<E>>>;

/// A re-invocable, shareable action. Policies that retry or hedge call it
/// more than once, possibly concurrently.
pub type SharedAction<T, E> = Arc<dyn Fn() -> PolicyFuture<T, E> + Send + Sync>;

/// A policy stored behind a trait object, ready for composition.
pub type ArcPolicy<T, E> = Arc<dyn ResiliencePolicy<T, E>>;

/// Lift a closure into a [`SharedAction`].
pub fn shared_action<T, E, Fut, Op>(operation: Op) -> SharedAction<T, E>
where
    Op: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ResilienceError<E>>> + Send + 'static,
{
    Arc::new(move || operation().boxed())
}

/// A value that wraps an asynchronous operation with a resilience behavior.
///
/// `execute` runs the action under the policy's state machine and returns its
/// outcome. `dispose` releases policy-local resources; it is idempotent, and
/// executing after disposal is undefined.
#[async_trait]
pub trait ResiliencePolicy<T, E>: Send + Sync
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    async fn execute(&self, action: SharedAction<T, E>) -> Result<T, ResilienceError<E>>;

    fn dispose(&self) {}

    /// The flat policy sequence, for wraps; `None` for leaf policies.
    fn sequence(&self) -> Option<&[ArcPolicy<T, E>]> {
        None
    }
}
