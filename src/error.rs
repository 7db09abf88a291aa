//! Error types for Chapterflow
//!
//! This module defines the error taxonomy shared by every store and by the
//! generation pipeline, using `thiserror` for ergonomic error handling.
//!
//! Every variant maps onto one [`ErrorKind`]. Callers receive errors as
//! `anyhow::Error` and recover the taxonomy with [`error_kind`] or
//! `downcast_ref::<ChapterflowError>()`.

use rusqlite::ErrorCode;
use thiserror::Error;

/// Coarse classification used by callers to decide how to react
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Session, record or job absent
    NotFound,
    /// Stale lock version or duplicate message/chunk sequence
    Conflict,
    /// Position out of range or a missing required field
    Validation,
    /// Database connectivity, lock contention or a step deadline
    Transient,
    /// Schema or constraint violation indicating a logic bug
    Fatal,
}

/// Main error type for Chapterflow operations
#[derive(Error, Debug)]
pub enum ChapterflowError {
    /// A session, record or job does not exist
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of entity that was looked up
        entity: &'static str,
        /// Identifier that was looked up
        id: String,
    },

    /// A concurrent writer won the race
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The request itself is invalid
    #[error("Validation error: {0}")]
    Validation(String),

    /// Temporary failure; retrying may succeed
    #[error("Transient error: {0}")]
    Transient(String),

    /// Internal failure that indicates a bug or a corrupted schema
    #[error("Fatal storage error: {0}")]
    Fatal(String),

    /// A generation step exceeded its deadline
    #[error("Step '{step}' timed out after {seconds}s")]
    StepTimeout {
        /// Name of the step that timed out
        step: String,
        /// Deadline that elapsed
        seconds: u64,
    },

    /// Work stopped because its cancellation token fired
    #[error("Canceled: {0}")]
    Canceled(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl ChapterflowError {
    /// Shorthand for [`ChapterflowError::NotFound`]
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Classify a SQLite failure
    ///
    /// Busy/locked databases are transient, uniqueness violations are
    /// conflicts, and any other constraint or schema failure is fatal.
    pub fn from_sqlite(err: rusqlite::Error, context: &str) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::CannotOpen => {
                    Self::Transient(format!("{}: {}", context, err))
                }
                ErrorCode::ConstraintViolation if is_unique_violation(&err) => {
                    Self::Conflict(format!("{}: {}", context, err))
                }
                _ => Self::fatal(err, context),
            },
            _ => Self::fatal(err, context),
        }
    }

    fn fatal(err: rusqlite::Error, context: &str) -> Self {
        tracing::error!(context, error = %err, "Fatal storage failure");
        Self::Fatal(format!("{}: {}", context, err))
    }

    /// Taxonomy bucket of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Validation(_) | Self::Config(_) => ErrorKind::Validation,
            Self::Transient(_) | Self::StepTimeout { .. } | Self::Canceled(_) => {
                ErrorKind::Transient
            }
            Self::Io(_) => ErrorKind::Transient,
            Self::Fatal(_) | Self::Serialization(_) | Self::Yaml(_) => ErrorKind::Fatal,
        }
    }

    /// Whether the caller may retry the operation
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Conflict | ErrorKind::Transient)
    }

    /// Message safe to show outside the process
    ///
    /// Fatal errors collapse to a generic text; everything else is reported
    /// as-is since it only names caller-supplied identifiers.
    pub fn public_message(&self) -> String {
        match self.kind() {
            ErrorKind::Fatal => "internal storage failure".to_string(),
            _ => self.to_string(),
        }
    }
}

/// Whether a rusqlite error is a UNIQUE or PRIMARY KEY violation
pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(failure, _) => {
            failure.code == ErrorCode::ConstraintViolation
                && matches!(
                    failure.extended_code,
                    rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                        | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                )
        }
        _ => false,
    }
}

/// Recover the taxonomy bucket of an `anyhow` error
///
/// Errors that did not originate from this crate are treated as fatal.
pub fn error_kind(err: &anyhow::Error) -> ErrorKind {
    err.downcast_ref::<ChapterflowError>()
        .map(ChapterflowError::kind)
        .unwrap_or(ErrorKind::Fatal)
}

/// Result type alias for Chapterflow operations
///
/// This is a convenience alias that uses `anyhow::Error` as the error type,
/// allowing for rich error context and easy error propagation.
pub type Result<T> = anyhow::Result<T>;
