//! Error types for the WarpGrid state store adapter.
//!
//! Backend drivers report failures as plain strings (see
//! [`Session`](crate::pool::Session)); [`classify`] sorts those messages into
//! transient failures worth retrying and permanent ones that are surfaced
//! immediately.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("etag mismatch for key {key}: expected {expected}, found {actual}")]
    EtagMismatch {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("state store is not initialized")]
    Uninitialized,

    #[error("state store is already initialized")]
    AlreadyInitialized,

    #[error("state store is closed")]
    Closed,

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation deadline exceeded")]
    DeadlineExceeded,

    #[error("transient backend error: {0}")]
    Transient(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("malformed row: {0}")]
    Decode(String),

    #[error("gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<StoreError>,
    },

    #[error("{op} {key}: {source}")]
    Op {
        op: &'static str,
        key: String,
        #[source]
        source: Box<StoreError>,
    },
}

/// Whether a backend failure is worth retrying.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

/// Message fragments (lowercase) that mark a backend failure as transient.
const TRANSIENT_PATTERNS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection aborted",
    "connection closed",
    "timeout",
    "timed out",
    "no such host",
    "dns",
    "failed to lookup address",
    "host unreachable",
    "network unreachable",
    "pool exhausted",
    "broken pipe",
    "liveness probe failed",
    "unexpected eof",
];

/// Classify a backend error message.
pub fn classify(message: &str) -> ErrorClass {
    let lower = message.to_ascii_lowercase();
    if TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p)) {
        ErrorClass::Transient
    } else {
        ErrorClass::Permanent
    }
}

impl StoreError {
    /// Build a backend error from a driver message, classifying it.
    pub fn from_backend(message: impl Into<String>) -> Self {
        let message = message.into();
        match classify(&message) {
            ErrorClass::Transient => StoreError::Transient(message),
            ErrorClass::Permanent => StoreError::Backend(message),
        }
    }

    /// True if retrying the operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Transient(_) => true,
            StoreError::Op { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// True if this is (or wraps) an optimistic concurrency conflict.
    pub fn is_etag_mismatch(&self) -> bool {
        match self {
            StoreError::EtagMismatch { .. } => true,
            StoreError::Op { source, .. } => source.is_etag_mismatch(),
            _ => false,
        }
    }

    /// True if the operation was abandoned because its context ended.
    pub fn is_cancelled(&self) -> bool {
        match self {
            StoreError::Cancelled | StoreError::DeadlineExceeded => true,
            StoreError::Op { source, .. } | StoreError::RetriesExhausted { source, .. } => {
                source.is_cancelled()
            }
            _ => false,
        }
    }

    /// Attach operation context (op name and key) to backend-originated errors.
    ///
    /// Validation, conflict, lifecycle and cancellation errors are returned
    /// unchanged so callers can match on them directly.
    pub fn context(self, op: &'static str, key: &str) -> Self {
        match self {
            StoreError::Transient(_)
            | StoreError::Backend(_)
            | StoreError::Decode(_)
            | StoreError::RetriesExhausted { .. } => StoreError::Op {
                op,
                key: key.to_string(),
                source: Box::new(self),
            },
            other => other,
        }
    }
}
