//! Ordered composition of policies.
//!
//! `PolicyWrap([p0, p1, …, pn-1]).execute(action)` behaves exactly like
//! `p0.execute(|| p1.execute(… || pn-1.execute(action) …))`: outermost first.
//! The stored sequence is always flat — wrapping a wrap concatenates the
//! sequences, never nests them — so introspection sees the true execution
//! order.

use crate::policy::{ArcPolicy, ResiliencePolicy, SharedAction};
use crate::ResilienceError;
use async_trait::async_trait;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Errors returned when composing policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WrapError {
    #[error("cannot compose an empty policy list")]
    Empty,
    #[error("a policy wrap requires at least two policies (got {0})")]
    TooFew(usize),
}

/// An ordered pipeline of policies, outermost first.
pub struct PolicyWrap<T, E> {
    policies: Vec<ArcPolicy<T, E>>,
}

impl<T, E> fmt::Debug for PolicyWrap<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyWrap").field("len", &self.policies.len()).finish()
    }
}

impl<T, E> PolicyWrap<T, E>
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    /// Compose `policies` (outermost first) into one pipeline.
    ///
    /// Requires at least two policies; contained wraps are inlined so the
    /// stored sequence stays flat.
    pub fn new(policies: Vec<ArcPolicy<T, E>>) -> Result<Self, WrapError> {
        let flat = flatten(policies);
        match flat.len() {
            0 => Err(WrapError::Empty),
            1 => Err(WrapError::TooFew(1)),
            _ => Ok(Self { policies: flat }),
        }
    }

    /// The flat policy sequence, outermost first.
    pub fn policies(&self) -> &[ArcPolicy<T, E>] {
        &self.policies
    }

    /// A new wrap with `inner` appended as the innermost element; if `inner`
    /// is itself a wrap its sequence is inlined.
    pub fn wrap(&self, inner: ArcPolicy<T, E>) -> PolicyWrap<T, E> {
        let mut policies = self.policies.clone();
        policies.extend(flatten(vec![inner]));
        PolicyWrap { policies }
    }

    pub async fn execute<Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send + 'static,
        Op: Fn() -> Fut + Send + Sync + 'static,
    {
        self.execute_shared(crate::policy::shared_action(operation)).await
    }

    async fn execute_shared(&self, action: SharedAction<T, E>) -> Result<T, ResilienceError<E>> {
        // Fold innermost-out: each policy's action invokes the next policy in.
        let mut chain = action;
        for policy in self.policies.iter().rev() {
            let policy = Arc::clone(policy);
            let inner = chain;
            chain = Arc::new(move || {
                let policy = Arc::clone(&policy);
                let inner = Arc::clone(&inner);
                async move { policy.execute(inner).await }.boxed()
            });
        }
        chain().await
    }
}

/// Compose a policy list into a single policy.
///
/// A single-element list returns that policy unchanged; two or more become a
/// [`PolicyWrap`]; an empty list is an error.
pub fn wrap<T, E>(policies: Vec<ArcPolicy<T, E>>) -> Result<ArcPolicy<T, E>, WrapError>
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let mut flat = flatten(policies);
    match flat.len() {
        0 => Err(WrapError::Empty),
        1 => Ok(flat.remove(0)),
        _ => Ok(Arc::new(PolicyWrap { policies: flat })),
    }
}

fn flatten<T, E>(policies: Vec<ArcPolicy<T, E>>) -> Vec<ArcPolicy<T, E>>
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let mut flat = Vec::with_capacity(policies.len());
    for policy in policies {
        let inlined = policy.sequence().map(|sequence| sequence.to_vec());
        match inlined {
            Some(sequence) => flat.extend(sequence),
            None => flat.push(policy),
        }
    }
    flat
}

#[async_trait]
impl<T, E> ResiliencePolicy<T, E> for PolicyWrap<T, E>
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    async fn execute(&self, action: SharedAction<T, E>) -> Result<T, ResilienceError<E>> {
        self.execute_shared(action).await
    }

    fn dispose(&self) {
        for policy in &self.policies {
            policy.dispose();
        }
    }

    fn sequence(&self) -> Option<&[ArcPolicy<T, E>]> {
        Some(&self.policies)
    }
}
