use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a failure, used for retry filtering and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed graph or node configuration.
    Validation,
    /// Expression syntax error, unresolved identifier or type mismatch.
    Evaluation,
    /// A node behavior failed.
    Invocation,
    /// HTTP transport failure or unsuccessful status.
    Http,
    /// A deadline expired.
    Timeout,
    /// Iteration ceiling exceeded or a backing store is unavailable.
    Resource,
    /// Work was abandoned through a cancellation signal.
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Evaluation => "evaluation",
            Self::Invocation => "invocation",
            Self::Http => "http",
            Self::Timeout => "timeout",
            Self::Resource => "resource",
            Self::Cancelled => "cancelled",
        }
    }

    /// Kinds a retry node re-attempts when `retry_on_errors` is empty.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Invocation | Self::Http | Self::Timeout)
    }

    /// Kinds a try/catch only catches when explicitly configured to.
    pub fn is_resource(self) -> bool {
        matches!(self, Self::Resource | Self::Cancelled)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure raised by a node behavior.
///
/// `expression` is set for evaluation errors so the run report can point at
/// the offending source text.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind} error: {message}")]
pub struct NodeError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
}

impl NodeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            expression: None,
        }
    }

    pub fn evaluation(message: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Evaluation,
            message: message.into(),
            expression: Some(expression.into()),
        }
    }

    pub fn invocation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Invocation, message)
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Resource, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "cancelled")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::Resource).unwrap();
        assert_eq!(json, "\"resource\"");
        assert_eq!(ErrorKind::Http.to_string(), "http");
    }

    #[test]
    fn retryable_kinds() {
        assert!(ErrorKind::Http.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(!ErrorKind::Evaluation.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
    }

    #[test]
    fn node_error_display_includes_kind() {
        let err = NodeError::evaluation("unresolved identifier 'age'", "age > 3");
        assert_eq!(err.to_string(), "evaluation error: unresolved identifier 'age'");
        assert_eq!(err.expression.as_deref(), Some("age > 3"));
    }
}
