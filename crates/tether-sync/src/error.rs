//! Structured errors for the sync engine.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error category for structured handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncErrorKind {
    /// Connection-level failure (DNS, refused, reset, bad URL).
    Transport,
    /// Non-success HTTP status from the server.
    HttpStatus,
    /// A request or attempt exceeded its time budget.
    Timeout,
    /// Response or stream payload could not be decoded.
    Parse,
    /// The operation was aborted via the cancellation token. Not a
    /// failure; callers absorb it silently.
    Cancelled,
    /// The liveness gate exhausted its wait ceiling.
    HealthCheck,
}

impl fmt::Display for SyncErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncErrorKind::Transport => write!(f, "transport"),
            SyncErrorKind::HttpStatus => write!(f, "http_status"),
            SyncErrorKind::Timeout => write!(f, "timeout"),
            SyncErrorKind::Parse => write!(f, "parse"),
            SyncErrorKind::Cancelled => write!(f, "cancelled"),
            SyncErrorKind::HealthCheck => write!(f, "health_check"),
        }
    }
}

/// Structured engine error with kind and optional details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncError {
    /// Error category
    pub kind: SyncErrorKind,
    /// One-line summary suitable for display
    pub message: String,
    /// Optional additional details (e.g., raw response body)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl SyncError {
    /// Creates a new sync error.
    pub fn new(kind: SyncErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    /// Attaches details to the error.
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Creates an HTTP status error, extracting a cleaner message from a
    /// JSON error body when one is present.
    pub fn http_status(status: u16, body: &str) -> Self {
        if !body.is_empty()
            && let Ok(json) = serde_json::from_str::<Value>(body)
            && let Some(msg) = json
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|v| v.as_str())
        {
            return Self {
                kind: SyncErrorKind::HttpStatus,
                message: format!("HTTP {status}: {msg}"),
                details: Some(body.to_string()),
            };
        }
        Self {
            kind: SyncErrorKind::HttpStatus,
            message: format!("HTTP {status}"),
            details: (!body.is_empty()).then(|| body.to_string()),
        }
    }

    /// Creates a timeout error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::Timeout, message)
    }

    /// Creates a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::Transport, message)
    }

    /// Creates a cancellation marker for the named operation.
    pub fn cancelled(operation: &str) -> Self {
        Self::new(SyncErrorKind::Cancelled, format!("{operation} cancelled"))
    }

    /// Whether this is an explicit cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        self.kind == SyncErrorKind::Cancelled
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for SyncError {}

pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_extracts_json_message() {
        let err = SyncError::http_status(500, r#"{"error":{"message":"instance busy"}}"#);
        assert_eq!(err.kind, SyncErrorKind::HttpStatus);
        assert_eq!(err.message, "HTTP 500: instance busy");
        assert!(err.details.is_some());
    }

    #[test]
    fn http_status_plain_body() {
        let err = SyncError::http_status(404, "not found");
        assert_eq!(err.message, "HTTP 404");
        assert_eq!(err.details.as_deref(), Some("not found"));
    }

    #[test]
    fn cancellation_is_not_a_failure() {
        let err = SyncError::cancelled("event stream");
        assert!(err.is_cancelled());
        assert_eq!(err.to_string(), "event stream cancelled");
    }
}
