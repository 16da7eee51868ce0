//! Error types for the signal processing controller
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the signal or resource it concerns so log lines
//! can be correlated without a surrounding span.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for signal processing operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for SignalRecord specs
    #[error("validation error for {signal}: {message}")]
    Validation {
        /// Name of the signal record with invalid input
        signal: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.targetResource.kind")
        field: Option<String>,
    },

    /// Optimistic-concurrency status write kept conflicting
    #[error("status conflict for {signal} after {attempts} attempts")]
    Conflict {
        /// Name of the signal record
        signal: String,
        /// Number of write attempts made
        attempts: u32,
    },

    /// An external call exceeded its deadline
    #[error("timeout after {timeout_ms}ms during {operation}")]
    Timeout {
        /// The operation that timed out (e.g., "get pod")
        operation: String,
        /// Deadline that was exceeded, in milliseconds
        timeout_ms: u64,
    },

    /// A referenced object does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Object kind
        kind: String,
        /// Object name (namespace-qualified where relevant)
        name: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "audit")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            signal: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with signal context and field path
    pub fn validation_for_field(
        signal: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            signal: signal.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a conflict-exhaustion error
    pub fn conflict(signal: impl Into<String>, attempts: u32) -> Self {
        Self::Conflict {
            signal: signal.into(),
            attempts,
        }
    }

    /// Create a timeout error for the named operation
    pub fn timeout(operation: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors need a spec fix and are terminal.
    /// Kubernetes errors are retryable unless they are 4xx responses, except
    /// 409 conflicts and 429 throttling which clear on their own.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) => {
                    ae.code == 409 || ae.code == 429 || !(400..500).contains(&ae.code)
                }
                _ => true,
            },
            Error::Validation { .. } => false,
            Error::Conflict { .. } => true,
            Error::Timeout { .. } => true,
            Error::NotFound { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// True for an HTTP 409 from the API server or an exhausted conflict loop
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409,
            Error::Conflict { .. } => true,
            _ => false,
        }
    }

    /// True for an HTTP 404 from the API server or an explicit not-found
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            Error::NotFound { .. } => true,
            _ => false,
        }
    }

    /// Short, low-cardinality label for metrics (`error_type`)
    pub fn kind_label(&self) -> &'static str {
        match self {
            Error::Kube { .. } if self.is_not_found() => "not_found",
            Error::Kube {
                source: kube::Error::Api(ae),
            } if ae.code == 403 => "forbidden",
            Error::Kube { .. } => "api",
            Error::Validation { .. } => "validation",
            Error::Conflict { .. } => "conflict",
            Error::Timeout { .. } => "timeout",
            Error::NotFound { .. } => "not_found",
            Error::Serialization { .. } => "serialization",
            Error::Internal { .. } => "internal",
        }
    }
}

/// Build a `kube::Error::Api` with the given status code (test helper)
#[cfg(test)]
pub(crate) fn api_error(code: u16) -> kube::Error {
    kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("status {code}"),
        reason: "Test".to_string(),
        code,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    // ==========================================================================
    // Story Tests: Error Classification During Signal Processing
    // ==========================================================================

    /// Story: A malformed signal is rejected with a clear, non-retryable error
    #[test]
    fn story_invalid_signal_is_not_retried() {
        let err = Error::validation_for_field("sig-1", "spec.fingerprint", "must not be empty");
        assert!(err.to_string().contains("sig-1"));
        assert!(err.to_string().contains("must not be empty"));
        assert!(!err.is_retryable());

        match err {
            Error::Validation { field, .. } => {
                assert_eq!(field.as_deref(), Some("spec.fingerprint"));
            }
            _ => panic!("Expected Validation variant"),
        }
    }

    /// Story: Status write conflicts are transient and are detected both as
    /// raw API errors and as an exhausted retry loop
    #[test]
    fn story_conflicts_are_detected_and_retryable() {
        let raw = Error::from(api_error(409));
        assert!(raw.is_conflict());
        assert!(raw.is_retryable());

        let exhausted = Error::conflict("sig-1", 5);
        assert!(exhausted.is_conflict());
        assert!(exhausted.to_string().contains("5 attempts"));
    }

    #[rstest]
    #[case::not_found(404, false, "not_found")]
    #[case::forbidden(403, false, "forbidden")]
    #[case::bad_request(400, false, "api")]
    #[case::throttled(429, true, "api")]
    #[case::server_error(500, true, "api")]
    #[case::unavailable(503, true, "api")]
    fn test_kube_error_classification(
        #[case] code: u16,
        #[case] retryable: bool,
        #[case] label: &str,
    ) {
        let err = Error::from(api_error(code));
        assert_eq!(err.is_retryable(), retryable);
        assert_eq!(err.kind_label(), label);
    }

    #[test]
    fn test_not_found_detection() {
        assert!(Error::from(api_error(404)).is_not_found());
        assert!(Error::not_found("Pod", "default/web-0").is_not_found());
        assert!(!Error::internal("boom").is_not_found());
    }

    #[test]
    fn test_timeout_message_includes_operation() {
        let err = Error::timeout("get pod", std::time::Duration::from_secs(5));
        assert_eq!(err.to_string(), "timeout after 5000ms during get pod");
        assert!(err.is_retryable());
        assert_eq!(err.kind_label(), "timeout");
    }

    #[test]
    fn test_internal_error_context() {
        let err = Error::internal_with_context("audit", "channel closed");
        assert!(err.to_string().contains("[audit]"));
        assert!(Error::internal("x").to_string().contains(UNKNOWN_CONTEXT));
    }
}
