//! End-to-end scenarios exercising each policy against its contract.

use backstop::{
    ArcPolicy, Backoff, BulkheadIsolationPolicy, CancelToken, CircuitBreakerPolicy,
    CircuitBreakerRegistry, CircuitState, FallbackPolicy, HttpOutcomeClassifier, PolicyWrap,
    RejectReason, ResilienceError, ResponseStatus, RetryPolicy, TimeoutPolicy, TrackingSleeper,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
struct AppError(String);

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AppError: {}", self.0)
    }
}

impl std::error::Error for AppError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Response(u16);

impl ResponseStatus for Response {
    fn status_code(&self) -> u16 {
        self.0
    }
}

/// Retry with exponential backoff: three failures then success yields the
/// value on the fourth invocation, with doubling waits in between.
#[tokio::test]
async fn retry_with_exponential_backoff_succeeds_on_fourth_attempt() {
    let sleeper = TrackingSleeper::new();
    let policy: RetryPolicy<&'static str, AppError> = RetryPolicy::builder()
        .max_retries(3)
        .backoff(Backoff::exponential(Duration::from_millis(100)))
        .with_sleeper(sleeper.clone())
        .build();

    let invocations = Arc::new(AtomicUsize::new(0));
    let invocations_clone = invocations.clone();
    let result = policy
        .execute(|| {
            let invocations = invocations_clone.clone();
            async move {
                if invocations.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(ResilienceError::Inner(AppError("flaky".to_string())))
                } else {
                    Ok("done")
                }
            }
        })
        .await;

    assert_eq!(result.unwrap(), "done");
    assert_eq!(invocations.load(Ordering::SeqCst), 4);
    assert_eq!(
        sleeper.calls(),
        vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(400),
        ]
    );
}

/// Retry exhaustion: a permanently failing action surfaces `RetryExhausted`
/// with the attempt count and the last cause.
#[tokio::test]
async fn retry_exhaustion_reports_four_attempts_and_last_cause() {
    let sleeper = TrackingSleeper::new();
    let policy: RetryPolicy<(), AppError> = RetryPolicy::builder()
        .max_retries(3)
        .backoff(Backoff::exponential(Duration::from_millis(100)))
        .with_sleeper(sleeper)
        .build();

    let result = policy
        .execute(|| async { Err::<(), _>(ResilienceError::Inner(AppError("fail".to_string()))) })
        .await;

    match result.unwrap_err() {
        ResilienceError::RetryExhausted { attempts, failures } => {
            assert_eq!(attempts, 4);
            assert_eq!(failures.last().unwrap().0, "fail");
        }
        e => panic!("expected RetryExhausted, got {:?}", e),
    }
}

/// Circuit breaker trip and recovery, with metrics separating rejections
/// from executed calls.
#[tokio::test]
async fn circuit_breaker_trips_rejects_then_recovers() {
    let registry = CircuitBreakerRegistry::new();
    let policy: CircuitBreakerPolicy<&'static str, AppError> = CircuitBreakerPolicy::builder()
        .circuit_name("svc")
        .failure_threshold(2)
        .break_duration(Duration::ZERO)
        .registry(registry.clone())
        .build()
        .unwrap();

    let invocations = Arc::new(AtomicUsize::new(0));

    // Two failures open the circuit.
    for _ in 0..2 {
        let invocations = invocations.clone();
        let result = policy
            .execute(|| {
                let invocations = invocations.clone();
                async move {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    Err::<&'static str, _>(ResilienceError::Inner(AppError("down".to_string())))
                }
            })
            .await;
        assert!(result.is_err());
    }
    assert_eq!(policy.state(), CircuitState::Open);

    // The third execute is rejected without invoking the action (the elapsed
    // break is observed lazily, so this call flips to half-open but is
    // itself turned away).
    let rejected = policy
        .execute(|| {
            let invocations = invocations.clone();
            async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                Ok("should not run")
            }
        })
        .await;
    assert!(rejected.unwrap_err().is_circuit_open());
    assert_eq!(invocations.load(Ordering::SeqCst), 2);

    // The fourth execute probes and closes the circuit.
    let recovered = policy
        .execute(|| {
            let invocations = invocations.clone();
            async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                Ok("ok")
            }
        })
        .await;
    assert_eq!(recovered.unwrap(), "ok");
    assert_eq!(policy.state(), CircuitState::Closed);

    let metrics = policy.metrics();
    assert_eq!(metrics.total_calls, 3);
    assert_eq!(metrics.failed_calls, 2);
    assert_eq!(metrics.rejected_calls, 1);
    assert_eq!(metrics.successful_calls, 1);

    // The registry sees the same circuit.
    assert_eq!(registry.get("svc").unwrap().state(), CircuitState::Closed);
}

/// Bulkhead isolation: with one slot and no queue, a concurrent call is
/// rejected immediately as queue-full.
#[tokio::test]
async fn bulkhead_isolation_rejects_immediately_without_queue() {
    let bulkhead = BulkheadIsolationPolicy::builder()
        .max_concurrent_requests(1)
        .max_queue_size(0)
        .build()
        .unwrap();

    let barrier = Arc::new(tokio::sync::Barrier::new(2));
    let holder = {
        let bulkhead = bulkhead.clone();
        let barrier = barrier.clone();
        tokio::spawn(async move {
            bulkhead
                .execute(|| {
                    let barrier = barrier.clone();
                    async move {
                        barrier.wait().await;
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok::<_, ResilienceError<AppError>>("held")
                    }
                })
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(10)).await;
    let started = Instant::now();
    let result = bulkhead.execute(|| async { Ok::<_, ResilienceError<AppError>>("nope") }).await;
    assert!(started.elapsed() < Duration::from_millis(50), "rejection must be immediate");
    assert_eq!(result.unwrap_err().reject_reason(), Some(RejectReason::QueueFull));

    barrier.wait().await;
    assert_eq!(holder.await.unwrap().unwrap(), "held");
    assert_eq!(bulkhead.active_count(), 0);
}

/// Bulkhead queue timeout: a queued caller gives up after its deadline and
/// leaves the queue clean.
#[tokio::test]
async fn bulkhead_queue_timeout_rejects_and_drains() {
    let bulkhead = BulkheadIsolationPolicy::builder()
        .max_concurrent_requests(1)
        .max_queue_size(5)
        .queue_timeout(Duration::from_millis(20))
        .build()
        .unwrap();

    let holder = {
        let bulkhead = bulkhead.clone();
        tokio::spawn(async move {
            bulkhead
                .execute(|| async {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Ok::<_, ResilienceError<AppError>>(())
                })
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(10)).await;
    let result = bulkhead.execute(|| async { Ok::<_, ResilienceError<AppError>>(()) }).await;
    assert_eq!(result.unwrap_err().reject_reason(), Some(RejectReason::QueueTimeout));
    assert_eq!(bulkhead.queued_count(), 0);

    let _ = holder.await;
}

/// Fallback on a classified 5xx: the classifier flags the response and the
/// cached value replaces it, with no error in sight.
#[tokio::test]
async fn fallback_replaces_classified_5xx_with_cached_response() {
    let cached = Response(200);
    let policy: FallbackPolicy<Response, AppError> = FallbackPolicy::builder(move |error| {
        assert!(error.is_none(), "a result trigger carries no error");
        async move { Ok(cached) }
    })
    .classifier(Arc::new(HttpOutcomeClassifier))
    .build();

    let result = policy
        .execute(|| async { Ok::<_, ResilienceError<AppError>>(Response(503)) })
        .await;
    assert_eq!(result.unwrap(), cached);
}

/// Composition order: Timeout(CircuitBreaker(Retry(action))). The first call
/// exhausts retries and opens the circuit; the second is rejected without
/// running the action.
#[tokio::test]
async fn composed_pipeline_opens_circuit_after_retry_exhaustion() {
    let registry = CircuitBreakerRegistry::new();
    let timeout = TimeoutPolicy::new(Duration::from_secs(5)).unwrap();
    let breaker: CircuitBreakerPolicy<&'static str, AppError> = CircuitBreakerPolicy::builder()
        .circuit_name("wrapped")
        .failure_threshold(1)
        .break_duration(Duration::from_secs(60))
        .registry(registry.clone())
        .build()
        .unwrap();
    let retry: RetryPolicy<&'static str, AppError> = RetryPolicy::builder()
        .max_retries(2)
        .backoff(Backoff::none())
        .build();

    let pipeline = PolicyWrap::new(vec![
        Arc::new(timeout) as ArcPolicy<&'static str, AppError>,
        Arc::new(breaker),
        Arc::new(retry),
    ])
    .unwrap();

    let invocations = Arc::new(AtomicUsize::new(0));
    let invocations_clone = invocations.clone();
    let first = pipeline
        .execute(move || {
            let invocations = invocations_clone.clone();
            async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                Err(ResilienceError::Inner(AppError("always".to_string())))
            }
        })
        .await;

    assert!(first.unwrap_err().is_retry_exhausted());
    assert_eq!(invocations.load(Ordering::SeqCst), 3);
    assert_eq!(registry.get("wrapped").unwrap().state(), CircuitState::Open);

    let invocations_clone = invocations.clone();
    let second = pipeline
        .execute(move || {
            let invocations = invocations_clone.clone();
            async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                Ok("unreachable")
            }
        })
        .await;

    assert!(second.unwrap_err().is_circuit_open());
    assert_eq!(invocations.load(Ordering::SeqCst), 3, "rejected call never runs the action");
}

/// Cancellation during backoff: a one-hour constant backoff is abandoned as
/// soon as the token fires.
#[tokio::test]
async fn cancellation_during_backoff_returns_quickly() {
    let token = CancelToken::new();
    let policy: RetryPolicy<(), AppError> = RetryPolicy::builder()
        .max_retries(10)
        .backoff(Backoff::constant(Duration::from_secs(3600)))
        .cancel_token(token.clone())
        .build();

    let canceller = {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel_with_reason("operator stop");
        })
    };

    let invocations = Arc::new(AtomicUsize::new(0));
    let invocations_clone = invocations.clone();
    let started = Instant::now();
    let result = policy
        .execute(move || {
            let invocations = invocations_clone.clone();
            async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ResilienceError::Inner(AppError("fail".to_string())))
            }
        })
        .await;

    match result.unwrap_err() {
        ResilienceError::Cancelled { reason } => {
            assert_eq!(reason.as_deref(), Some("operator stop"));
        }
        e => panic!("expected Cancelled, got {:?}", e),
    }
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert!(started.elapsed() < Duration::from_secs(1));

    let _ = canceller.await;
}
