use std::fmt;

use thiserror::Error;

use blockvault_format::FormatError;

/// The taxonomy a caller is expected to match on (§7.1). Every [`Error`]
/// variant maps to exactly one kind; [`Error::kind`] recovers it without the
/// caller needing to pattern-match on variant-specific payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Non-fatal; bubbles up through layers unchanged.
    NotFound,
    /// Fatal for the call; caller misused the transaction API.
    TransactionState,
    /// Fatal; parse error or size mismatch. Surfaced without rolling back
    /// already-durable state.
    Corruption,
    /// Fatal and archive-level: a possible rollback or tampering attempt.
    Integrity,
    /// An I/O failure that is worth retrying.
    Transient,
    /// `Start` saw the WAL over capacity and the caller's cancellation
    /// handle fired before it drained.
    BackPressure,
    /// The ORAM layer is dirty and refusing further operations until
    /// `Rollback`.
    OramFailure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::TransactionState => "transaction_state",
            ErrorKind::Corruption => "corruption",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Transient => "transient",
            ErrorKind::BackPressure => "back_pressure",
            ErrorKind::OramFailure => "oram_failure",
        };
        f.write_str(s)
    }
}

/// Crate-wide error type. Lower layers annotate corruption/integrity errors
/// with the offending block pointer and propagate them unchanged; upper
/// layers never re-wrap a `Corruption` or `Integrity` error into a different
/// kind (§7.1).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("transaction not active")]
    TransactionNotActive,

    #[error("transaction already active (Start called twice)")]
    TransactionAlreadyActive,

    #[error("block {ptr} is corrupt: {reason}")]
    Corruption { ptr: u64, reason: String },

    #[error("block format error at {ptr}: {source}")]
    Format {
        ptr: u64,
        #[source]
        source: FormatError,
    },

    #[error("integrity violation at {context}: {reason}")]
    Integrity { context: String, reason: String },

    #[error("transient I/O failure: {0}")]
    Transient(String),

    #[error("WAL back-pressure: Start cancelled while waiting for the drainer")]
    BackPressure,

    #[error("ORAM layer is dirty and refusing operations until Rollback")]
    OramDirty,

    #[error("operation cancelled")]
    Cancelled,

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("local WAL store error: {0}")]
    Wal(String),

    #[error("cryptographic operation failed: {0}")]
    Crypto(String),

    #[error("remote transport error: {0}")]
    Remote(String),

    #[error("other: {0}")]
    Other(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::TransactionNotActive | Error::TransactionAlreadyActive => {
                ErrorKind::TransactionState
            }
            Error::Corruption { .. } | Error::Format { .. } => ErrorKind::Corruption,
            Error::Integrity { .. } => ErrorKind::Integrity,
            Error::Transient(_) | Error::Io(_) | Error::Remote(_) => ErrorKind::Transient,
            Error::BackPressure | Error::Cancelled => ErrorKind::BackPressure,
            Error::OramDirty => ErrorKind::OramFailure,
            Error::Wal(_) | Error::Crypto(_) | Error::Other(_) => ErrorKind::Transient,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn corruption(ptr: u64, reason: impl Into<String>) -> Self {
        Error::Corruption {
            ptr,
            reason: reason.into(),
        }
    }

    pub fn integrity(context: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Integrity {
            context: context.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
