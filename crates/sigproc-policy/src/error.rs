//! Error types for the rule evaluation engine

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result alias for policy operations
pub type Result<T> = std::result::Result<T, PolicyError>;

/// Rule evaluation engine error types
#[derive(Debug, Error)]
pub enum PolicyError {
    /// Policy document is not valid YAML or contains an invalid expression
    #[error("policy parse error for {policy}: {message}")]
    Parse {
        /// Policy (engine) name
        policy: String,
        /// Error message
        message: String,
    },

    /// Policy parsed but violates a structural or schema rule
    #[error("policy validation error for {policy}: {message}")]
    Validation {
        /// Policy (engine) name
        policy: String,
        /// Error message
        message: String,
    },

    /// Evaluation failed (type error, step budget, panic)
    #[error("policy evaluation error for {policy}: {message}")]
    Evaluation {
        /// Policy (engine) name
        policy: String,
        /// Error message
        message: String,
    },

    /// Evaluation did not finish before its deadline
    #[error("policy evaluation for {policy} timed out after {timeout_ms}ms")]
    Timeout {
        /// Policy (engine) name
        policy: String,
        /// Deadline in milliseconds
        timeout_ms: u64,
    },

    /// No rule matched and the policy has no default
    #[error("no rule matched in policy {policy} and no default is defined")]
    NoMatch {
        /// Policy (engine) name
        policy: String,
    },

    /// Reading the policy file failed
    #[error("failed to read policy file {path}: {source}")]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// Setting up the filesystem watch failed
    #[error("failed to watch policy file {path}: {message}")]
    Watch {
        /// File path
        path: PathBuf,
        /// Error message
        message: String,
    },
}

impl PolicyError {
    /// Create a parse error
    pub fn parse(policy: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Parse {
            policy: policy.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error
    pub fn validation(policy: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            policy: policy.into(),
            message: msg.into(),
        }
    }

    /// Create an evaluation error
    pub fn evaluation(policy: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Evaluation {
            policy: policy.into(),
            message: msg.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(policy: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            policy: policy.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Create a no-match error
    pub fn no_match(policy: impl Into<String>) -> Self {
        Self::NoMatch {
            policy: policy.into(),
        }
    }

    /// Create a watch setup error
    pub fn watch(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::Watch {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Whether the error concerns the policy text itself (rejected on load)
    pub fn is_invalid_policy(&self) -> bool {
        matches!(self, Self::Parse { .. } | Self::Validation { .. })
    }

    /// Short, low-cardinality label for metrics
    pub fn kind_label(&self) -> &'static str {
        match self {
            Self::Parse { .. } => "parse",
            Self::Validation { .. } => "validation",
            Self::Evaluation { .. } => "evaluation",
            Self::Timeout { .. } => "timeout",
            Self::NoMatch { .. } => "no_match",
            Self::Io { .. } => "io",
            Self::Watch { .. } => "watch",
        }
    }
}
