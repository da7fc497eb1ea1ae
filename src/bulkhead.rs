//! Bulkhead policies: bounded concurrency with a bounded FIFO wait queue.
//!
//! Both variants share [`FifoSemaphore`], a semaphore whose waiters queue in
//! arrival order, each with an optional queue timeout. Releasing a slot walks
//! the queue from the head, skipping waiters that already gave up, and hands
//! the slot to the first live one — so a slot is never lost to a waiter that
//! timed out concurrently with the release.

use crate::error::RejectReason;
use crate::events::{EventHub, PolicyEvent};
use crate::policy::{ResiliencePolicy, SharedAction};
use crate::ResilienceError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

/// Errors returned when configuring bulkheads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BulkheadError {
    #[error("max concurrency must be > 0")]
    ZeroConcurrency,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<()>,
}

struct SemState {
    active: usize,
    next_id: u64,
    queue: VecDeque<Waiter>,
}

struct SemInner {
    max_concurrent: usize,
    max_queue_depth: usize,
    state: Mutex<SemState>,
}

/// Counting semaphore with FIFO waiters and per-waiter timeouts.
#[derive(Clone)]
pub struct FifoSemaphore {
    inner: Arc<SemInner>,
}

impl FifoSemaphore {
    pub fn new(max_concurrent: usize, max_queue_depth: usize) -> Self {
        Self {
            inner: Arc::new(SemInner {
                max_concurrent,
                max_queue_depth,
                state: Mutex::new(SemState { active: 0, next_id: 0, queue: VecDeque::new() }),
            }),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    pub fn max_queue_depth(&self) -> usize {
        self.inner.max_queue_depth
    }

    /// Slots currently held.
    pub fn active_count(&self) -> usize {
        self.inner.state.lock().unwrap_or_else(|p| p.into_inner()).active
    }

    /// Waiters currently queued.
    pub fn queued_count(&self) -> usize {
        self.inner.state.lock().unwrap_or_else(|p| p.into_inner()).queue.len()
    }

    /// Take a slot, queueing if none is free.
    ///
    /// Fast path: a free slot is claimed synchronously. Otherwise the caller
    /// enqueues (if the queue has room) and suspends until a release hands it
    /// the slot or `queue_timeout` elapses.
    pub async fn acquire(
        &self,
        queue_timeout: Option<Duration>,
    ) -> Result<SemaphorePermit, RejectReason> {
        let (id, rx) = {
            let mut state = self.inner.state.lock().unwrap_or_else(|p| p.into_inner());
            if state.active < self.inner.max_concurrent {
                state.active += 1;
                return Ok(SemaphorePermit { inner: Arc::clone(&self.inner) });
            }
            // Drop waiters whose callers went away before counting occupancy.
            state.queue.retain(|waiter| !waiter.tx.is_closed());
            if state.queue.len() >= self.inner.max_queue_depth {
                return Err(RejectReason::QueueFull);
            }
            let (tx, rx) = oneshot::channel();
            let id = state.next_id;
            state.next_id += 1;
            state.queue.push_back(Waiter { id, tx });
            (id, rx)
        };
        let mut waiter = QueuedWaiter { inner: Arc::clone(&self.inner), rx: Some(rx) };

        match queue_timeout {
            None => {
                if waiter.granted().await {
                    Ok(SemaphorePermit { inner: Arc::clone(&self.inner) })
                } else {
                    Err(RejectReason::QueueFull)
                }
            }
            Some(timeout) => {
                tokio::select! {
                    granted = waiter.granted() => {
                        if granted {
                            Ok(SemaphorePermit { inner: Arc::clone(&self.inner) })
                        } else {
                            Err(RejectReason::QueueFull)
                        }
                    }
                    _ = tokio::time::sleep(timeout) => {
                        {
                            let mut state =
                                self.inner.state.lock().unwrap_or_else(|p| p.into_inner());
                            state.queue.retain(|waiter| waiter.id != id);
                        }
                        // A release may have transferred the slot just as the
                        // deadline fired; keep it rather than leak it.
                        if waiter.try_granted() {
                            Ok(SemaphorePermit { inner: Arc::clone(&self.inner) })
                        } else {
                            Err(RejectReason::QueueTimeout)
                        }
                    }
                }
            }
        }
    }
}

/// A caller parked in the wait queue. Holding the grant receiver in a guard
/// closes the race between a release transferring the slot and this caller
/// going away: a slot received but never consumed is put back on drop.
struct QueuedWaiter {
    inner: Arc<SemInner>,
    rx: Option<oneshot::Receiver<()>>,
}

impl QueuedWaiter {
    /// Wait for a release to hand over a slot. `false` if the semaphore went
    /// away without granting.
    async fn granted(&mut self) -> bool {
        match self.rx.as_mut() {
            Some(rx) => {
                let outcome = rx.await.is_ok();
                self.rx = None;
                outcome
            }
            None => false,
        }
    }

    /// Non-blocking check for a grant that raced the queue timeout.
    fn try_granted(&mut self) -> bool {
        match self.rx.take() {
            Some(mut rx) => {
                rx.close();
                rx.try_recv().is_ok()
            }
            None => false,
        }
    }
}

impl Drop for QueuedWaiter {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
            if rx.try_recv().is_ok() {
                // Granted after this caller already gave up; put it back.
                release_slot(&self.inner);
            }
        }
    }
}

impl std::fmt::Debug for FifoSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FifoSemaphore")
            .field("max_concurrent", &self.inner.max_concurrent)
            .field("max_queue_depth", &self.inner.max_queue_depth)
            .field("active", &self.active_count())
            .field("queued", &self.queued_count())
            .finish()
    }
}

/// Slot guard; releasing happens on drop, so the slot is returned no matter
/// how the guarded operation ends.
pub struct SemaphorePermit {
    inner: Arc<SemInner>,
}

impl Drop for SemaphorePermit {
    fn drop(&mut self) {
        release_slot(&self.inner);
    }
}

/// Hand the slot to the first live waiter, skipping any that gave up; if
/// none is left, lower the active count.
fn release_slot(inner: &Arc<SemInner>) {
    let mut state = inner.state.lock().unwrap_or_else(|p| p.into_inner());
    loop {
        match state.queue.pop_front() {
            Some(waiter) => {
                if waiter.tx.send(()).is_ok() {
                    return;
                }
            }
            None => {
                state.active = state.active.saturating_sub(1);
                return;
            }
        }
    }
}

/// Plain bounded-concurrency policy.
#[derive(Clone)]
pub struct BulkheadPolicy {
    semaphore: FifoSemaphore,
    queue_timeout: Option<Duration>,
    event_hub: Option<EventHub>,
    source: String,
}

impl BulkheadPolicy {
    /// Bulkhead with `max_concurrent` slots and no wait queue.
    pub fn new(max_concurrent: usize) -> Result<Self, BulkheadError> {
        Self::builder().max_concurrency(max_concurrent).build()
    }

    /// Effectively unbounded; useful as a neutral element in composed stacks.
    pub fn unlimited() -> Self {
        Self {
            semaphore: FifoSemaphore::new(1_000_000_000, 0),
            queue_timeout: None,
            event_hub: None,
            source: "bulkhead".to_string(),
        }
    }

    pub fn builder() -> BulkheadPolicyBuilder {
        BulkheadPolicyBuilder::new()
    }

    pub fn active_count(&self) -> usize {
        self.semaphore.active_count()
    }

    pub fn queued_count(&self) -> usize {
        self.semaphore.queued_count()
    }

    fn rejection<E>(&self, reason: RejectReason) -> ResilienceError<E> {
        if let Some(hub) = &self.event_hub {
            hub.emit(PolicyEvent::BulkheadRejected {
                max_concurrency: self.semaphore.max_concurrent(),
                max_queue_depth: self.semaphore.max_queue_depth(),
                reason,
                source: self.source.clone(),
            });
        }
        tracing::debug!(%reason, "bulkhead rejected request");
        ResilienceError::BulkheadRejected {
            max_concurrency: self.semaphore.max_concurrent(),
            max_queue_depth: self.semaphore.max_queue_depth(),
            reason,
        }
    }

    pub async fn execute<T, E, Fut, Op>(&self, mut operation: Op) -> Result<T, ResilienceError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let permit = match self.semaphore.acquire(self.queue_timeout).await {
            Ok(permit) => permit,
            Err(reason) => return Err(self.rejection(reason)),
        };
        let result = operation().await;
        drop(permit);
        result
    }
}

impl std::fmt::Debug for BulkheadPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkheadPolicy")
            .field("semaphore", &self.semaphore)
            .field("queue_timeout", &self.queue_timeout)
            .finish()
    }
}

pub struct BulkheadPolicyBuilder {
    max_concurrency: usize,
    max_queue_depth: usize,
    queue_timeout: Option<Duration>,
    event_hub: Option<EventHub>,
    source: String,
}

impl BulkheadPolicyBuilder {
    pub fn new() -> Self {
        Self {
            max_concurrency: 100,
            max_queue_depth: 0,
            queue_timeout: None,
            event_hub: None,
            source: "bulkhead".to_string(),
        }
    }

    pub fn max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = depth;
        self
    }

    pub fn queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = Some(timeout);
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

    pub fn build(self) -> Result<BulkheadPolicy, BulkheadError> {
        if self.max_concurrency == 0 {
            return Err(BulkheadError::ZeroConcurrency);
        }
        Ok(BulkheadPolicy {
            semaphore: FifoSemaphore::new(self.max_concurrency, self.max_queue_depth),
            queue_timeout: self.queue_timeout,
            event_hub: self.event_hub,
            source: self.source,
        })
    }
}

impl Default for BulkheadPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T, E> ResiliencePolicy<T, E> for BulkheadPolicy
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    async fn execute(&self, action: SharedAction<T, E>) -> Result<T, ResilienceError<E>> {
        BulkheadPolicy::execute(self, move || action()).await
    }
}

/// Bulkhead variant with an isolation-oriented metrics surface: rejection
/// callback plus executed/rejected counters.
#[derive(Clone)]
pub struct BulkheadIsolationPolicy {
    semaphore: FifoSemaphore,
    queue_timeout: Option<Duration>,
    on_rejected: Option<Arc<dyn Fn(RejectReason) + Send + Sync>>,
    event_hub: Option<EventHub>,
    source: String,
    executed: Arc<AtomicU64>,
    rejected: Arc<AtomicU64>,
}

impl BulkheadIsolationPolicy {
    pub fn builder() -> BulkheadIsolationBuilder {
        BulkheadIsolationBuilder::new()
    }

    pub fn active_count(&self) -> usize {
        self.semaphore.active_count()
    }

    pub fn queued_count(&self) -> usize {
        self.semaphore.queued_count()
    }

    /// Operations that acquired a slot and ran.
    pub fn executed_count(&self) -> u64 {
        self.executed.load(Ordering::Acquire)
    }

    /// Callers turned away, for either reason.
    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Acquire)
    }

    pub async fn execute<T, E, Fut, Op>(&self, mut operation: Op) -> Result<T, ResilienceError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let permit = match self.semaphore.acquire(self.queue_timeout).await {
            Ok(permit) => permit,
            Err(reason) => {
                self.rejected.fetch_add(1, Ordering::Release);
                if let Some(callback) = &self.on_rejected {
                    callback(reason);
                }
                if let Some(hub) = &self.event_hub {
                    hub.emit(PolicyEvent::BulkheadRejected {
                        max_concurrency: self.semaphore.max_concurrent(),
                        max_queue_depth: self.semaphore.max_queue_depth(),
                        reason,
                        source: self.source.clone(),
                    });
                }
                tracing::debug!(%reason, "bulkhead isolation rejected request");
                return Err(ResilienceError::BulkheadRejected {
                    max_concurrency: self.semaphore.max_concurrent(),
                    max_queue_depth: self.semaphore.max_queue_depth(),
                    reason,
                });
            }
        };
        self.executed.fetch_add(1, Ordering::Release);
        let result = operation().await;
        drop(permit);
        result
    }
}

impl std::fmt::Debug for BulkheadIsolationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkheadIsolationPolicy")
            .field("semaphore", &self.semaphore)
            .field("queue_timeout", &self.queue_timeout)
            .field("executed", &self.executed_count())
            .field("rejected", &self.rejected_count())
            .finish()
    }
}

pub struct BulkheadIsolationBuilder {
    max_concurrent_requests: usize,
    max_queue_size: usize,
    queue_timeout: Option<Duration>,
    on_rejected: Option<Arc<dyn Fn(RejectReason) + Send + Sync>>,
    event_hub: Option<EventHub>,
    source: String,
}

impl BulkheadIsolationBuilder {
    pub fn new() -> Self {
        Self {
            max_concurrent_requests: 10,
            max_queue_size: 0,
            queue_timeout: None,
            on_rejected: None,
            event_hub: None,
            source: "bulkhead-isolation".to_string(),
        }
    }

    pub fn max_concurrent_requests(mut self, max: usize) -> Self {
        self.max_concurrent_requests = max;
        self
    }

    pub fn max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    pub fn queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = Some(timeout);
        self
    }

    pub fn on_rejected<F>(mut self, callback: F) -> Self
    where
        F: Fn(RejectReason) + Send + Sync + 'static,
    {
        self.on_rejected = Some(Arc::new(callback));
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

    pub fn build(self) -> Result<BulkheadIsolationPolicy, BulkheadError> {
        if self.max_concurrent_requests == 0 {
            return Err(BulkheadError::ZeroConcurrency);
        }
        Ok(BulkheadIsolationPolicy {
            semaphore: FifoSemaphore::new(self.max_concurrent_requests, self.max_queue_size),
            queue_timeout: self.queue_timeout,
            on_rejected: self.on_rejected,
            event_hub: self.event_hub,
            source: self.source,
            executed: Arc::new(AtomicU64::new(0)),
            rejected: Arc::new(AtomicU64::new(0)),
        })
    }
}

impl Default for BulkheadIsolationBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T, E> ResiliencePolicy<T, E> for BulkheadIsolationPolicy
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    async fn execute(&self, action: SharedAction<T, E>) -> Result<T, ResilienceError<E>> {
        BulkheadIsolationPolicy::execute(self, move || action()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    #[tokio::test]
    async fn allows_operations_within_limit() {
        let bulkhead = BulkheadPolicy::new(3).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let counter_clone = counter.clone();
            let result = bulkhead
                .execute(|| {
                    let counter = counter_clone.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, ResilienceError<TestError>>(42)
                    }
                })
                .await;
            assert!(result.is_ok());
        }

        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(bulkhead.active_count(), 0);
    }

    #[tokio::test]
    async fn rejects_queue_full_when_at_capacity() {
        let bulkhead = BulkheadPolicy::new(2).unwrap();
        let barrier = Arc::new(tokio::sync::Barrier::new(3));

        let mut handles = vec![];
        for _ in 0..2 {
            let bulkhead_clone = bulkhead.clone();
            let barrier_clone = barrier.clone();
            handles.push(tokio::spawn(async move {
                bulkhead_clone
                    .execute(|| {
                        let barrier = barrier_clone.clone();
                        async move {
                            barrier.wait().await;
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            Ok::<_, ResilienceError<TestError>>(42)
                        }
                    })
                    .await
            }));
        }

        tokio::time::sleep(Duration::from_millis(10)).await;

        let result =
            bulkhead.execute(|| async { Ok::<_, ResilienceError<TestError>>(99) }).await;
        let err = result.unwrap_err();
        assert!(err.is_bulkhead_rejected());
        assert_eq!(err.reject_reason(), Some(RejectReason::QueueFull));

        barrier.wait().await;
        for handle in handles {
            let _ = handle.await;
        }
    }

    #[tokio::test]
    async fn queued_caller_runs_after_release() {
        let bulkhead =
            BulkheadPolicy::builder().max_concurrency(1).max_queue_depth(4).build().unwrap();

        let holder = {
            let bulkhead = bulkhead.clone();
            tokio::spawn(async move {
                bulkhead
                    .execute(|| async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, ResilienceError<TestError>>("held")
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(bulkhead.active_count(), 1);

        let queued = bulkhead.execute(|| async { Ok::<_, ResilienceError<TestError>>("queued") });
        let result = tokio::time::timeout(Duration::from_secs(1), queued)
            .await
            .expect("queued caller should get the slot");
        assert_eq!(result.unwrap(), "queued");

        let _ = holder.await;
        assert_eq!(bulkhead.active_count(), 0);
        assert_eq!(bulkhead.queued_count(), 0);
    }

    #[tokio::test]
    async fn queue_timeout_rejects_and_leaves_queue_clean() {
        let bulkhead = BulkheadPolicy::builder()
            .max_concurrency(1)
            .max_queue_depth(5)
            .queue_timeout(Duration::from_millis(20))
            .build()
            .unwrap();

        let holder = {
            let bulkhead = bulkhead.clone();
            tokio::spawn(async move {
                bulkhead
                    .execute(|| async {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        Ok::<_, ResilienceError<TestError>>(())
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;

        let result =
            bulkhead.execute(|| async { Ok::<_, ResilienceError<TestError>>(()) }).await;
        let err = result.unwrap_err();
        assert_eq!(err.reject_reason(), Some(RejectReason::QueueTimeout));
        assert_eq!(bulkhead.queued_count(), 0, "timed-out waiter must be removed");

        let _ = holder.await;
        assert_eq!(bulkhead.active_count(), 0);
    }

    #[tokio::test]
    async fn release_skips_timed_out_waiters() {
        // One slot, two queued waiters with very different timeouts: the
        // first times out while the slot is still held, then the release must
        // skip it and wake the second.
        let semaphore = FifoSemaphore::new(1, 4);
        let permit = semaphore.acquire(None).await.unwrap();

        let first = {
            let semaphore = semaphore.clone();
            tokio::spawn(
                async move { semaphore.acquire(Some(Duration::from_millis(20))).await },
            )
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = {
            let semaphore = semaphore.clone();
            tokio::spawn(async move { semaphore.acquire(Some(Duration::from_secs(5))).await })
        };

        let first_result = first.await.unwrap();
        assert_eq!(first_result.err(), Some(RejectReason::QueueTimeout));

        drop(permit);
        let second_result = tokio::time::timeout(Duration::from_secs(1), second)
            .await
            .expect("second waiter should be granted the slot")
            .unwrap();
        assert!(second_result.is_ok());
        drop(second_result);

        assert_eq!(semaphore.active_count(), 0);
        assert_eq!(semaphore.queued_count(), 0);
    }

    #[tokio::test]
    async fn active_count_never_exceeds_limit() {
        let bulkhead =
            BulkheadPolicy::builder().max_concurrency(5).max_queue_depth(10).build().unwrap();
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];

        for _ in 0..15 {
            let bulkhead_clone = bulkhead.clone();
            let concurrent_clone = concurrent.clone();
            let max_clone = max_seen.clone();
            handles.push(tokio::spawn(async move {
                bulkhead_clone
                    .execute(|| {
                        let concurrent = concurrent_clone.clone();
                        let max = max_clone.clone();
                        async move {
                            let current = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                            max.fetch_max(current, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            concurrent.fetch_sub(1, Ordering::SeqCst);
                            Ok::<_, ResilienceError<TestError>>(())
                        }
                    })
                    .await
            }));
        }

        let results = futures::future::join_all(handles).await;
        let successes = results.iter().filter(|r| r.as_ref().unwrap().is_ok()).count();
        let rejections = results
            .iter()
            .filter(|r| r.as_ref().unwrap().as_ref().err().is_some_and(|e| e.is_bulkhead_rejected()))
            .count();

        assert!(max_seen.load(Ordering::SeqCst) <= 5);
        assert_eq!(successes + rejections, 15);
        assert_eq!(bulkhead.active_count(), 0);
        assert_eq!(bulkhead.queued_count(), 0);
    }

    #[tokio::test]
    async fn propagates_operation_errors_and_releases_slot() {
        let bulkhead = BulkheadPolicy::new(1).unwrap();

        let result = bulkhead
            .execute(|| async {
                Err::<(), _>(ResilienceError::Inner(TestError("operation failed".to_string())))
            })
            .await;

        match result.unwrap_err() {
            ResilienceError::Inner(e) => assert_eq!(e.0, "operation failed"),
            e => panic!("expected Inner error, got {:?}", e),
        }
        assert_eq!(bulkhead.active_count(), 0);
    }

    #[tokio::test]
    async fn unlimited_bulkhead_never_rejects() {
        let bulkhead = BulkheadPolicy::unlimited();
        let mut handles = vec![];

        for i in 0..100 {
            let bulkhead_clone = bulkhead.clone();
            handles.push(tokio::spawn(async move {
                bulkhead_clone
                    .execute(|| async move {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok::<_, ResilienceError<TestError>>(i)
                    })
                    .await
            }));
        }

        let results = futures::future::join_all(handles).await;
        let successes = results.iter().filter(|r| r.as_ref().unwrap().is_ok()).count();
        assert_eq!(successes, 100);
    }

    #[tokio::test]
    async fn isolation_variant_invokes_rejection_callback() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let bulkhead = BulkheadIsolationPolicy::builder()
            .max_concurrent_requests(1)
            .max_queue_size(0)
            .on_rejected(move |reason| seen_clone.lock().unwrap().push(reason))
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
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok::<_, ResilienceError<TestError>>(())
                        }
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        let result = bulkhead.execute(|| async { Ok::<_, ResilienceError<TestError>>(()) }).await;
        assert!(result.is_err());

        barrier.wait().await;
        let _ = holder.await;

        assert_eq!(seen.lock().unwrap().as_slice(), &[RejectReason::QueueFull]);
        assert_eq!(bulkhead.rejected_count(), 1);
        assert_eq!(bulkhead.executed_count(), 1);
    }

    #[tokio::test]
    async fn rejection_emits_event() {
        let hub = EventHub::new();
        let events = Arc::new(std::sync::Mutex::new(Vec::new()));
        let events_clone = events.clone();
        let _sub = hub.subscribe(move |event| events_clone.lock().unwrap().push(event.clone()));

        let bulkhead = BulkheadPolicy::builder()
            .max_concurrency(1)
            .event_hub(hub.clone())
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
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok::<_, ResilienceError<TestError>>(())
                        }
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        let _ = bulkhead.execute(|| async { Ok::<_, ResilienceError<TestError>>(()) }).await;

        barrier.wait().await;
        let _ = holder.await;
        hub.flushed().await;

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            PolicyEvent::BulkheadRejected { reason: RejectReason::QueueFull, max_concurrency: 1, .. }
        ));
    }

    #[test]
    fn builder_rejects_zero_concurrency() {
        assert_eq!(
            BulkheadPolicy::builder().max_concurrency(0).build().unwrap_err(),
            BulkheadError::ZeroConcurrency
        );
        assert_eq!(
            BulkheadIsolationPolicy::builder().max_concurrent_requests(0).build().unwrap_err(),
            BulkheadError::ZeroConcurrency
        );
    }
}
