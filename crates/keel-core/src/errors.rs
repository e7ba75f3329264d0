//! Error types for the repository layer.
//!
//! [`RepositoryError`] is the single error type returned by every repository
//! operation. Store-originated failures travel as [`StoreError`], a
//! structured value carrying the driver's result code, its message verbatim,
//! and an [`ErrorClass`] computed once at construction — the retry policy
//! matches on the class instead of downcasting driver error types.

use std::fmt;

use thiserror::Error;
use uuid::Uuid;

/// `SQLite` result codes treated as concurrency conflicts.
///
/// Matched against both the extended result code and its primary part, so
/// `SQLITE_BUSY_RECOVERY` (261) and friends classify through their primary
/// code. Non-empty and fixed for the lifetime of the process.
///
/// - 5 — `SQLITE_BUSY`: another connection holds a conflicting lock
/// - 6 — `SQLITE_LOCKED`: a table is locked within this connection's cache
/// - 517 — `SQLITE_BUSY_SNAPSHOT`: write conflict against a stale WAL snapshot
pub const CONCURRENCY_CODES: &[i32] = &[5, 6, 517];

/// Message fragments that mark a retryable lock-contention failure when the
/// result code alone is not conclusive.
const LOCK_CONTENTION_INDICATORS: &[&str] =
    &["deadlock", "database is locked", "database table is locked"];

// ─────────────────────────────────────────────────────────────────────────────
// Classification
// ─────────────────────────────────────────────────────────────────────────────

/// How a store failure behaves under retry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Concurrency conflict recognized by result code. Retried on the
    /// stretched backoff schedule (`N * 3` units before the Nth retry).
    Concurrency,
    /// Transient contention recognized by message only. Retried on the
    /// plain linear schedule (`N` units before the Nth retry).
    Transient,
    /// Everything else. Never retried.
    Fatal,
}

impl ErrorClass {
    /// Whether a failure of this class may be retried.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Concurrency | Self::Transient)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Concurrency => write!(f, "concurrency"),
            Self::Transient => write!(f, "transient"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

/// Classify a driver failure from its extended result code and message.
///
/// A code in [`CONCURRENCY_CODES`] (extended or primary part) classifies as
/// [`ErrorClass::Concurrency`]. Otherwise a message naming a lock-contention
/// condition classifies as [`ErrorClass::Transient`]. Everything else is
/// [`ErrorClass::Fatal`] and propagates unretried.
#[must_use]
pub fn classify(code: Option<i32>, message: &str) -> ErrorClass {
    if let Some(code) = code {
        let primary = code & 0xff;
        if CONCURRENCY_CODES.contains(&code) || CONCURRENCY_CODES.contains(&primary) {
            return ErrorClass::Concurrency;
        }
    }
    if message_indicates_lock_contention(message) {
        return ErrorClass::Transient;
    }
    ErrorClass::Fatal
}

/// Whether a driver message names a deadlock or lock-contention condition.
#[must_use]
pub fn message_indicates_lock_contention(message: &str) -> bool {
    let lower = message.to_lowercase();
    LOCK_CONTENTION_INDICATORS
        .iter()
        .any(|indicator| lower.contains(indicator))
}

// ─────────────────────────────────────────────────────────────────────────────
// Store errors
// ─────────────────────────────────────────────────────────────────────────────

/// A store-originated failure as a structured value.
///
/// Carries the driver's extended result code (when one exists), the driver
/// message verbatim, and the retry classification computed at construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreError {
    /// Extended result code reported by the driver, if any.
    pub code: Option<i32>,
    /// Driver message, preserved verbatim.
    pub message: String,
    /// Retry classification, fixed at construction.
    pub class: ErrorClass,
}

impl StoreError {
    /// Build a store error from a raw code and message, classifying it.
    #[must_use]
    pub fn new(code: Option<i32>, message: impl Into<String>) -> Self {
        let message = message.into();
        let class = classify(code, &message);
        Self {
            code,
            message,
            class,
        }
    }

    /// A fatal store error with no driver code (internal failures).
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            class: ErrorClass::Fatal,
        }
    }

    /// Whether the retry policy may re-execute after this failure.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.class.is_retryable()
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "store error (code {code}): {}", self.message),
            None => write!(f, "store error: {}", self.message),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(ffi, message) => {
                let message = message.unwrap_or_else(|| ffi.to_string());
                Self::new(Some(ffi.extended_code), message)
            }
            other => Self::new(None, other.to_string()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Repository errors
// ─────────────────────────────────────────────────────────────────────────────

/// Errors returned by repository operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The connection factory could not open a connection to the store.
    #[error("failed to open store connection: {source}")]
    Connection {
        /// The underlying cause (filesystem, pool, driver).
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A lookup that must match exactly one row matched none.
    #[error("no {table} row with id {id}")]
    NotFound {
        /// Backing table that was queried.
        table: String,
        /// The id that matched nothing.
        id: Uuid,
    },

    /// The outer timeout elapsed before the wrapped operation completed.
    #[error("store operation timed out after {timeout_secs}s for {repository}")]
    Timeout {
        /// Label of the repository whose operation timed out.
        repository: String,
        /// The configured timeout in seconds.
        timeout_secs: u64,
    },

    /// The retry ceiling was reached with the operation still failing.
    #[error("retries exhausted after {attempts} attempts")]
    RetriesExhausted {
        /// Number of executions performed.
        attempts: u32,
        /// The last store failure observed.
        #[source]
        source: StoreError,
    },

    /// A store-originated failure, propagated verbatim.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The operation was cancelled before completion.
    #[error("operation cancelled")]
    Cancelled,
}

impl RepositoryError {
    /// Wrap a connection-acquisition failure, preserving the cause.
    #[must_use]
    pub fn connection(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Connection {
            source: Box::new(source),
        }
    }
}

impl From<rusqlite::Error> for RepositoryError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(StoreError::from(err))
    }
}

/// Convenience type alias for repository results.
pub type Result<T> = std::result::Result<T, RepositoryError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
