#![forbid(unsafe_code)]

//! Tower adapter for backstop policies.
//!
//! [`PolicyLayer`] wraps any `tower::Service` so every call runs through a
//! resilience policy (or a whole [`backstop::PolicyWrap`] pipeline). The
//! request type must be `Clone`: retrying and hedging policies re-invoke the
//! inner service, and each invocation needs its own request value.
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use backstop::{ArcPolicy, TimeoutPolicy};
//! use backstop_http::PolicyLayer;
//! use tower::{service_fn, ServiceBuilder, ServiceExt};
//!
//! #[derive(Debug)]
//! struct UpstreamError;
//! impl std::fmt::Display for UpstreamError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "UpstreamError")
//!     }
//! }
//! impl std::error::Error for UpstreamError {}
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let timeout = TimeoutPolicy::new(Duration::from_secs(1))?;
//! let policy: ArcPolicy<String, UpstreamError> = Arc::new(timeout);
//!
//! let service = ServiceBuilder::new()
//!     .layer(PolicyLayer::new(policy))
//!     .service(service_fn(|request: &'static str| async move {
//!         Ok::<_, UpstreamError>(format!("handled: {request}"))
//!     }));
//!
//! let response = service.oneshot("GET /").await?;
//! assert_eq!(response, "handled: GET /");
//! # Ok(())
//! # }
//! ```

use backstop::{shared_action, ArcPolicy, ResilienceError};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_service::Service;

/// Layer that applies one policy (or pipeline) to a wrapped service.
pub struct PolicyLayer<T, E> {
    policy: ArcPolicy<T, E>,
}

impl<T, E> PolicyLayer<T, E> {
    pub fn new(policy: ArcPolicy<T, E>) -> Self {
        Self { policy }
    }
}

impl<T, E> Clone for PolicyLayer<T, E> {
    fn clone(&self) -> Self {
        Self { policy: Arc::clone(&self.policy) }
    }
}

impl<S, T, E> tower_layer::Layer<S> for PolicyLayer<T, E> {
    type Service = PolicyService<S, T, E>;

    fn layer(&self, inner: S) -> Self::Service {
        PolicyService { inner, policy: Arc::clone(&self.policy) }
    }
}

/// Service produced by [`PolicyLayer`].
pub struct PolicyService<S, T, E> {
    inner: S,
    policy: ArcPolicy<T, E>,
}

impl<S: Clone, T, E> Clone for PolicyService<S, T, E> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), policy: Arc::clone(&self.policy) }
    }
}

impl<S, Request> Service<Request> for PolicyService<S, S::Response, S::Error>
where
    Request: Clone + Send + Sync + 'static,
    S: Service<Request> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    type Response = S::Response;
    type Error = ResilienceError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(ResilienceError::Inner)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let policy = Arc::clone(&self.policy);
        let service = self.inner.clone();

        Box::pin(async move {
            let action = shared_action(move || {
                let mut service = service.clone();
                let request = request.clone();
                async move { service.call(request).await.map_err(ResilienceError::Inner) }
            });
            policy.execute(action).await
        })
    }
}
