//! Outcome classification.
//!
//! Classifiers unify result-based and error-based decisions: retry and
//! fallback policies ask a classifier whether an outcome is a success, a
//! transient failure worth retrying, or a permanent failure to surface.
//!
//! The core never assumes a concrete response type. Responses that expose an
//! HTTP status code implement [`ResponseStatus`]; everything else supplies a
//! custom classifier and the response dimension is ignored.

use crate::ResilienceError;
use std::sync::Arc;

/// Verdict a classifier assigns to a single outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Success,
    TransientFailure,
    PermanentFailure,
}

impl Classification {
    pub fn is_success(&self) -> bool {
        matches!(self, Classification::Success)
    }

    /// Only transient failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Classification::TransientFailure)
    }

    pub fn is_failure(&self) -> bool {
        !self.is_success()
    }
}

/// A response that carries an HTTP status code.
pub trait ResponseStatus {
    fn status_code(&self) -> u16;
}

/// Assigns a [`Classification`] to responses and errors.
///
/// `classify_error` defaults to `TransientFailure`: unless a classifier says
/// otherwise, an error is worth retrying.
pub trait OutcomeClassifier<T, E>: Send + Sync {
    fn classify_response(&self, response: &T) -> Classification;

    fn classify_error(&self, _error: &ResilienceError<E>) -> Classification {
        Classification::TransientFailure
    }
}

/// Helper over a whole `Result` outcome.
pub(crate) fn classify_outcome<T, E>(
    classifier: &dyn OutcomeClassifier<T, E>,
    outcome: &Result<T, ResilienceError<E>>,
) -> Classification {
    match outcome {
        Ok(response) => classifier.classify_response(response),
        Err(error) => classifier.classify_error(error),
    }
}

/// Default HTTP classification: 2xx is success, 5xx is transient, any other
/// status is permanent, and any error is transient.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpOutcomeClassifier;

impl<T: ResponseStatus, E> OutcomeClassifier<T, E> for HttpOutcomeClassifier {
    fn classify_response(&self, response: &T) -> Classification {
        match response.status_code() {
            200..=299 => Classification::Success,
            500..=599 => Classification::TransientFailure,
            _ => Classification::PermanentFailure,
        }
    }
}

/// Chains classifiers; the first non-success verdict wins.
///
/// With an empty chain, responses classify as success and errors fall back to
/// the transient default.
pub struct CompositeClassifier<T, E> {
    chain: Vec<Arc<dyn OutcomeClassifier<T, E>>>,
}

impl<T, E> CompositeClassifier<T, E> {
    pub fn new(chain: Vec<Arc<dyn OutcomeClassifier<T, E>>>) -> Self {
        Self { chain }
    }
}

impl<T, E> OutcomeClassifier<T, E> for CompositeClassifier<T, E>
where
    T: Send + Sync,
    E: Send + Sync,
{
    fn classify_response(&self, response: &T) -> Classification {
        for classifier in &self.chain {
            let verdict = classifier.classify_response(response);
            if !verdict.is_success() {
                return verdict;
            }
        }
        Classification::Success
    }

    fn classify_error(&self, error: &ResilienceError<E>) -> Classification {
        for classifier in &self.chain {
            let verdict = classifier.classify_error(error);
            if !verdict.is_success() {
                return verdict;
            }
        }
        if self.chain.is_empty() {
            Classification::TransientFailure
        } else {
            Classification::Success
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy)]
    struct FakeResponse(u16);

    impl ResponseStatus for FakeResponse {
        fn status_code(&self) -> u16 {
            self.0
        }
    }

    #[derive(Debug)]
    struct TestError;

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "TestError")
        }
    }

    impl std::error::Error for TestError {}

    #[test]
    fn classification_predicates() {
        assert!(Classification::Success.is_success());
        assert!(!Classification::Success.is_failure());
        assert!(Classification::TransientFailure.is_retryable());
        assert!(Classification::TransientFailure.is_failure());
        assert!(!Classification::PermanentFailure.is_retryable());
        assert!(Classification::PermanentFailure.is_failure());
    }

    #[test]
    fn http_classifier_maps_status_families() {
        let classifier = HttpOutcomeClassifier;
        let classify = |status| {
            OutcomeClassifier::<FakeResponse, TestError>::classify_response(
                &classifier,
                &FakeResponse(status),
            )
        };
        assert_eq!(classify(200), Classification::Success);
        assert_eq!(classify(204), Classification::Success);
        assert_eq!(classify(500), Classification::TransientFailure);
        assert_eq!(classify(503), Classification::TransientFailure);
        assert_eq!(classify(404), Classification::PermanentFailure);
        assert_eq!(classify(301), Classification::PermanentFailure);
    }

    #[test]
    fn errors_default_to_transient() {
        let classifier = HttpOutcomeClassifier;
        let verdict = OutcomeClassifier::<FakeResponse, TestError>::classify_error(
            &classifier,
            &ResilienceError::Inner(TestError),
        );
        assert_eq!(verdict, Classification::TransientFailure);
    }

    struct TeapotClassifier;

    impl OutcomeClassifier<FakeResponse, TestError> for TeapotClassifier {
        fn classify_response(&self, response: &FakeResponse) -> Classification {
            if response.0 == 418 {
                Classification::TransientFailure
            } else {
                Classification::Success
            }
        }

        fn classify_error(&self, _: &ResilienceError<TestError>) -> Classification {
            Classification::Success
        }
    }

    #[test]
    fn composite_first_non_success_wins() {
        let composite: CompositeClassifier<FakeResponse, TestError> =
            CompositeClassifier::new(vec![Arc::new(TeapotClassifier), Arc::new(HttpOutcomeClassifier)]);

        // The teapot classifier flags 418 before the HTTP classifier would
        // call it permanent.
        assert_eq!(
            composite.classify_response(&FakeResponse(418)),
            Classification::TransientFailure
        );
        // Teapot passes 503 through; the HTTP classifier flags it.
        assert_eq!(
            composite.classify_response(&FakeResponse(503)),
            Classification::TransientFailure
        );
        assert_eq!(composite.classify_response(&FakeResponse(200)), Classification::Success);
    }

    #[test]
    fn empty_composite_defaults() {
        let composite: CompositeClassifier<FakeResponse, TestError> =
            CompositeClassifier::new(Vec::new());
        assert_eq!(composite.classify_response(&FakeResponse(500)), Classification::Success);
        assert_eq!(
            composite.classify_error(&ResilienceError::Inner(TestError)),
            Classification::TransientFailure
        );
    }
}
