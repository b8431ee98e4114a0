//! Protocol error taxonomy.
//!
//! Every failure a client can observe maps 1:1 onto an [`ErrorKind`] carried
//! in the `code` field of an `error` frame. The set is closed — handlers pick
//! from it, they never invent codes.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Closed set of wire error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ParseError,
    InvalidRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    RateLimited,
    UnknownOperation,
    RulesNotAvailable,
    InternalError,
    ValidationError,
    Conflict,
    Timeout,
    BackpressureDropped,
    SessionExpired,
    BufferOverflow,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ParseError => "PARSE_ERROR",
            ErrorKind::InvalidRequest => "INVALID_REQUEST",
            ErrorKind::Unauthorized => "UNAUTHORIZED",
            ErrorKind::Forbidden => "FORBIDDEN",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::RateLimited => "RATE_LIMITED",
            ErrorKind::UnknownOperation => "UNKNOWN_OPERATION",
            ErrorKind::RulesNotAvailable => "RULES_NOT_AVAILABLE",
            ErrorKind::InternalError => "INTERNAL_ERROR",
            ErrorKind::ValidationError => "VALIDATION_ERROR",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::BackpressureDropped => "BACKPRESSURE_DROPPED",
            ErrorKind::SessionExpired => "SESSION_EXPIRED",
            ErrorKind::BufferOverflow => "BUFFER_OVERFLOW",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed request, ready to be serialized as an `error` frame.
///
/// `message` is what the client sees. `internal` carries the unredacted
/// cause for `INTERNAL_ERROR` responses — it goes to the audit log and the
/// server log, never onto the wire.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct RequestError {
    pub kind: ErrorKind,
    pub message: String,
    pub details: Option<Value>,
    pub internal: Option<String>,
}

impl RequestError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
            internal: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    /// Wrap an unexpected dispatch failure. The client gets a generic
    /// message; the real cause is preserved for the audit trail.
    pub fn internal(cause: impl std::fmt::Display) -> Self {
        Self {
            kind: ErrorKind::InternalError,
            message: "Internal server error".to_string(),
            details: None,
            internal: Some(cause.to_string()),
        }
    }

    /// The message the audit log should record: the internal cause when one
    /// exists, the client-visible message otherwise.
    pub fn audit_message(&self) -> &str {
        self.internal.as_deref().unwrap_or(&self.message)
    }
}

/// Failures surfaced by the external store and rules collaborators.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    UnknownOperation(String),
    #[error("operation timed out")]
    Timeout,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for RequestError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(msg) => RequestError::new(ErrorKind::NotFound, msg),
            StoreError::Validation(msg) => RequestError::new(ErrorKind::ValidationError, msg),
            StoreError::Conflict(msg) => RequestError::new(ErrorKind::Conflict, msg),
            StoreError::UnknownOperation(msg) => {
                RequestError::new(ErrorKind::UnknownOperation, msg)
            }
            StoreError::Timeout => RequestError::new(ErrorKind::Timeout, "operation timed out"),
            StoreError::Internal(cause) => RequestError::internal(cause),
        }
    }
}
