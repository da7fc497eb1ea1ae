//! Error types shared by all resilience policies.

use std::fmt;
use std::time::Duration;

/// Cap on the number of failures recorded inside `RetryExhausted` so a
/// long-running forever-retry cannot grow the error unboundedly.
pub const MAX_RETRY_FAILURES: usize = 10;

/// Why a bulkhead turned a caller away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The waiter queue was already at capacity.
    QueueFull,
    /// The caller was queued but its queue timeout elapsed first.
    QueueTimeout,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::QueueFull => write!(f, "queue full"),
            RejectReason::QueueTimeout => write!(f, "queue timeout"),
        }
    }
}

/// Unified error type for all resilience policies.
///
/// Every policy-raised failure is a variant of this enum, so a single match
/// arm catches the whole family while callers that care can discriminate on
/// kind. Application failures travel as `Inner(E)` and are moved through
/// policy boundaries unmodified.
#[derive(Debug)]
pub enum ResilienceError<E> {
    /// The operation exceeded its deadline.
    Timeout { elapsed: Duration, timeout: Duration },
    /// A circuit breaker rejected the call without running it.
    CircuitOpen {
        circuit: String,
        /// Time remaining until the break duration elapses, when known.
        retry_after: Option<Duration>,
    },
    /// All retry attempts failed.
    RetryExhausted { attempts: usize, failures: Vec<E> },
    /// A bulkhead rejected the call.
    BulkheadRejected {
        max_concurrency: usize,
        max_queue_depth: usize,
        reason: RejectReason,
    },
    /// Every hedged attempt completed without an acceptable outcome.
    HedgingExhausted { attempts: usize },
    /// A cancellation token fired.
    Cancelled { reason: Option<String> },
    /// The underlying operation failed.
    Inner(E),
}

impl<E: Clone> Clone for ResilienceError<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Timeout { elapsed, timeout } => {
                Self::Timeout { elapsed: *elapsed, timeout: *timeout }
            }
            Self::CircuitOpen { circuit, retry_after } => {
                Self::CircuitOpen { circuit: circuit.clone(), retry_after: *retry_after }
            }
            Self::RetryExhausted { attempts, failures } => {
                Self::RetryExhausted { attempts: *attempts, failures: failures.clone() }
            }
            Self::BulkheadRejected { max_concurrency, max_queue_depth, reason } => {
                Self::BulkheadRejected {
                    max_concurrency: *max_concurrency,
                    max_queue_depth: *max_queue_depth,
                    reason: *reason,
                }
            }
            Self::HedgingExhausted { attempts } => Self::HedgingExhausted { attempts: *attempts },
            Self::Cancelled { reason } => Self::Cancelled { reason: reason.clone() },
            Self::Inner(e) => Self::Inner(e.clone()),
        }
    }
}

impl<E: PartialEq> PartialEq for ResilienceError<E> {
    fn eq(&self, other: &Self) -> bool {
        use ResilienceError::*;
        match (self, other) {
            (Timeout { elapsed: a1, timeout: b1 }, Timeout { elapsed: a2, timeout: b2 }) => {
                a1 == a2 && b1 == b2
            }
            (
                CircuitOpen { circuit: c1, retry_after: r1 },
                CircuitOpen { circuit: c2, retry_after: r2 },
            ) => c1 == c2 && r1 == r2,
            (
                RetryExhausted { attempts: a1, failures: f1 },
                RetryExhausted { attempts: a2, failures: f2 },
            ) => a1 == a2 && f1 == f2,
            (
                BulkheadRejected { max_concurrency: c1, max_queue_depth: q1, reason: r1 },
                BulkheadRejected { max_concurrency: c2, max_queue_depth: q2, reason: r2 },
            ) => c1 == c2 && q1 == q2 && r1 == r2,
            (HedgingExhausted { attempts: a1 }, HedgingExhausted { attempts: a2 }) => a1 == a2,
            (Cancelled { reason: r1 }, Cancelled { reason: r2 }) => r1 == r2,
            (Inner(e1), Inner(e2)) => e1 == e2,
            _ => false,
        }
    }
}

impl<E: Eq> Eq for ResilienceError<E> {}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { elapsed, timeout } => {
                write!(f, "operation timed out after {:?} (limit: {:?})", elapsed, timeout)
            }
            Self::CircuitOpen { circuit, retry_after } => match retry_after {
                Some(after) => {
                    write!(f, "circuit '{}' is open (retry after {:?})", circuit, after)
                }
                None => write!(f, "circuit '{}' is open", circuit),
            },
            Self::RetryExhausted { attempts, failures } => {
                let last = failures.last().map(|e| e.to_string()).unwrap_or_default();
                write!(f, "retry exhausted after {} attempts, last error: {}", attempts, last)
            }
            Self::BulkheadRejected { max_concurrency, max_queue_depth, reason } => {
                write!(
                    f,
                    "bulkhead rejected request ({}; max {} concurrent, queue depth {})",
                    reason, max_concurrency, max_queue_depth
                )
            }
            Self::HedgingExhausted { attempts } => {
                write!(f, "hedging exhausted after {} attempts without a winner", attempts)
            }
            Self::Cancelled { reason } => match reason {
                Some(reason) => write!(f, "operation cancelled: {}", reason),
                None => write!(f, "operation cancelled"),
            },
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ResilienceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RetryExhausted { failures, .. } => {
                failures.last().map(|e| e as &dyn std::error::Error)
            }
            _ => None,
        }
    }
}

impl<E> ResilienceError<E> {
    /// Check if this error is due to a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if this error is due to an open circuit.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Check if this error is due to a bulkhead rejection.
    pub fn is_bulkhead_rejected(&self) -> bool {
        matches!(self, Self::BulkheadRejected { .. })
    }

    /// Check if this error is due to retry exhaustion.
    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }

    /// Check if this error is due to hedging exhaustion.
    pub fn is_hedging_exhausted(&self) -> bool {
        matches!(self, Self::HedgingExhausted { .. })
    }

    /// Check if this error is due to cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Check if this error wraps an application error.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// Extract the application error if this is an `Inner` variant.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the application error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Access the recorded failures for `RetryExhausted`, if present.
    pub fn failures(&self) -> Option<&[E]> {
        match self {
            Self::RetryExhausted { failures, .. } => Some(failures.as_slice()),
            _ => None,
        }
    }

    /// The bulkhead rejection reason, if present.
    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            Self::BulkheadRejected { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use std::fmt;
    use std::io;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct DummyError(&'static str);

    impl fmt::Display for DummyError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl std::error::Error for DummyError {}

    #[test]
    fn timeout_display_includes_durations() {
        let err: ResilienceError<io::Error> = ResilienceError::Timeout {
            elapsed: Duration::from_millis(5100),
            timeout: Duration::from_secs(5),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("timed out"));
        assert!(msg.contains("5.1"));
    }

    #[test]
    fn circuit_open_display_names_circuit() {
        let err: ResilienceError<io::Error> = ResilienceError::CircuitOpen {
            circuit: "payments".to_string(),
            retry_after: Some(Duration::from_secs(3)),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("payments"));
        assert!(msg.contains("3"));
    }

    #[test]
    fn bulkhead_display_includes_reason() {
        let err: ResilienceError<io::Error> = ResilienceError::BulkheadRejected {
            max_concurrency: 4,
            max_queue_depth: 8,
            reason: RejectReason::QueueTimeout,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("queue timeout"));
        assert!(msg.contains("4"));
    }

    #[test]
    fn retry_exhausted_display_includes_last_error() {
        let err: ResilienceError<DummyError> = ResilienceError::RetryExhausted {
            attempts: 3,
            failures: vec![DummyError("first"), DummyError("last")],
        };
        let msg = format!("{}", err);
        assert!(msg.contains("3"));
        assert!(msg.contains("last"));
    }

    #[test]
    fn source_returns_last_failure_for_retry_exhausted() {
        let err: ResilienceError<DummyError> = ResilienceError::RetryExhausted {
            attempts: 3,
            failures: vec![DummyError("a"), DummyError("b")],
        };
        let src = err.source().unwrap();
        assert_eq!(src.to_string(), "b");
    }

    #[test]
    fn source_is_none_for_cancelled() {
        let err: ResilienceError<DummyError> = ResilienceError::Cancelled { reason: None };
        assert!(err.source().is_none());
    }

    #[test]
    fn predicates_cover_all_variants() {
        let timeout: ResilienceError<DummyError> = ResilienceError::Timeout {
            elapsed: Duration::from_secs(1),
            timeout: Duration::from_secs(2),
        };
        assert!(timeout.is_timeout());
        assert!(!timeout.is_circuit_open());

        let circuit: ResilienceError<DummyError> =
            ResilienceError::CircuitOpen { circuit: "c".into(), retry_after: None };
        assert!(circuit.is_circuit_open());

        let bulkhead: ResilienceError<DummyError> = ResilienceError::BulkheadRejected {
            max_concurrency: 1,
            max_queue_depth: 0,
            reason: RejectReason::QueueFull,
        };
        assert!(bulkhead.is_bulkhead_rejected());
        assert_eq!(bulkhead.reject_reason(), Some(RejectReason::QueueFull));

        let retry: ResilienceError<DummyError> =
            ResilienceError::RetryExhausted { attempts: 2, failures: vec![] };
        assert!(retry.is_retry_exhausted());

        let hedging: ResilienceError<DummyError> =
            ResilienceError::HedgingExhausted { attempts: 3 };
        assert!(hedging.is_hedging_exhausted());

        let cancelled: ResilienceError<DummyError> =
            ResilienceError::Cancelled { reason: Some("shutdown".into()) };
        assert!(cancelled.is_cancelled());
    }

    #[test]
    fn into_inner_extracts_application_error() {
        let io_err = io::Error::new(io::ErrorKind::Other, "boom");
        let err = ResilienceError::Inner(io_err);
        assert!(err.is_inner());
        let extracted = err.into_inner().unwrap();
        assert_eq!(extracted.to_string(), "boom");
    }

    #[test]
    fn clone_and_eq_agree() {
        let err: ResilienceError<DummyError> = ResilienceError::CircuitOpen {
            circuit: "svc".into(),
            retry_after: Some(Duration::from_millis(250)),
        };
        assert_eq!(err.clone(), err);
    }
}
