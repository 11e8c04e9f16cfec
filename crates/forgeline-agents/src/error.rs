//! Step error taxonomy.
//!
//! Every failure inside a step is one of these classes. The class alone
//! decides whether the retry unit may try again.

use std::time::Duration;

use thiserror::Error;

use forgeline_core::validation::ValidationError;
use forgeline_providers::ProviderError;

/// Errors raised while executing a single workflow step.
#[derive(Error, Debug)]
pub enum StepError {
    /// Cooperative cancellation. Never reclassified as a failure by default.
    #[error("Step cancelled")]
    Cancelled,

    /// Bad input or configuration.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Temporary unavailability (rate limits, overload, connection resets).
    #[error("Transient error: {0}")]
    Transient(String),

    /// Outbound HTTP call failed with a status code.
    #[error("HTTP {status}: {message}")]
    Http {
        /// Response status.
        status: u16,
        /// Response body or summary.
        message: String,
    },

    /// An outbound call or tool exceeded its time limit.
    #[error("{operation} timed out after {duration:?}")]
    Timeout {
        /// What timed out (tool or provider name).
        operation: String,
        /// Configured limit.
        duration: Duration,
    },

    /// Tenant mismatch, path containment breach, or disallowed command.
    #[error("Security violation: {0}")]
    SecurityViolation(String),

    /// Anything else.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StepError {
    /// Whether the retry unit may re-invoke the step.
    ///
    /// Request timeout (408), too-many-requests (429) and 5xx statuses are
    /// retryable; every other status is not. Security violations and
    /// cancellation are never retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Transient(_) | Self::Timeout { .. } => true,
            Self::Http { status, .. } => is_retryable_status(*status),
            Self::Cancelled
            | Self::Validation(_)
            | Self::SecurityViolation(_)
            | Self::Internal(_) => false,
        }
    }

    /// Whether this is a security violation.
    #[must_use]
    pub const fn is_security_violation(&self) -> bool {
        matches!(self, Self::SecurityViolation(_))
    }

    /// Short class name for logs and span fields.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Validation(_) => "validation",
            Self::Transient(_) => "transient",
            Self::Http { .. } => "http",
            Self::Timeout { .. } => "timeout",
            Self::SecurityViolation(_) => "security_violation",
            Self::Internal(_) => "internal",
        }
    }
}

/// HTTP statuses worth retrying.
#[must_use]
pub const fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500..=599)
}

impl From<ProviderError> for StepError {
    fn from(error: ProviderError) -> Self {
        match error {
            ProviderError::Api { status, message } => Self::Http { status, message },
            ProviderError::RateLimited { retry_after_secs } => {
                Self::Transient(format!("Rate limited, retry after {retry_after_secs}s"))
            }
            ProviderError::Network(e) => match e.status() {
                Some(status) => Self::Http {
                    status: status.as_u16(),
                    message: e.to_string(),
                },
                None => Self::Transient(e.to_string()),
            },
            ProviderError::Timeout(duration) => Self::Timeout {
                operation: "provider call".to_string(),
                duration,
            },
            ProviderError::Cancelled => Self::Cancelled,
            e @ (ProviderError::Spawn { .. } | ProviderError::Config(_)) => {
                Self::Validation(e.to_string())
            }
            ProviderError::Serialization(e) => Self::Internal(e.to_string()),
        }
    }
}

impl From<ValidationError> for StepError {
    fn from(error: ValidationError) -> Self {
        if error.is_security_violation() {
            Self::SecurityViolation(error.to_string())
        } else {
            Self::Validation(error.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(StepError::Transient("overloaded".into()).is_retryable());
        assert!(
            StepError::Timeout {
                operation: "run_tests".into(),
                duration: Duration::from_secs(5)
            }
            .is_retryable()
        );
        assert!(!StepError::Validation("missing path".into()).is_retryable());
        assert!(!StepError::SecurityViolation("tenant".into()).is_retryable());
        assert!(!StepError::Cancelled.is_retryable());
        assert!(!StepError::Internal("boom".into()).is_retryable());
    }

    #[test]
    fn test_http_status_classes() {
        for status in [408, 429, 500, 502, 503, 599] {
            assert!(is_retryable_status(status), "{status}");
        }
        for status in [400, 401, 403, 404, 409, 422] {
            assert!(!is_retryable_status(status), "{status}");
        }
    }

    #[test]
    fn test_provider_error_mapping() {
        let err: StepError = ProviderError::Api {
            status: 503,
            message: "overloaded".into(),
        }
        .into();
        assert!(matches!(err, StepError::Http { status: 503, .. }));
        assert!(err.is_retryable());

        let err: StepError = ProviderError::Cancelled.into();
        assert!(matches!(err, StepError::Cancelled));

        let err: StepError = ProviderError::Config("no key".into()).into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_validation_error_mapping() {
        let err: StepError = ValidationError::PathTraversal("../x".into()).into();
        assert!(err.is_security_violation());

        let err: StepError = ValidationError::DisallowedChars.into();
        assert_eq!(err.kind(), "validation");
    }
}
