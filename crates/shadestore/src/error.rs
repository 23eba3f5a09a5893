//! Error types for shadestore

use std::fmt;
use std::io;

use thiserror::Error;

use crate::page::PageId;

/// Result type alias for shadestore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for database operations
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error while reading, writing, growing or syncing the file
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Key longer than [`MAX_KEY_LEN`](crate::MAX_KEY_LEN)
    #[error("key too large: {0} bytes (max {max})", max = crate::MAX_KEY_LEN)]
    KeyTooLarge(usize),

    /// Value longer than [`MAX_VALUE_LEN`](crate::MAX_VALUE_LEN)
    #[error("value too large: {0} bytes (max {max})", max = crate::MAX_VALUE_LEN)]
    ValueTooLarge(usize),

    /// Open-time option out of range
    #[error("invalid option: {0}")]
    InvalidOption(String),

    /// The file is not a shadestore database, or its meta pages fail validation
    #[error("unexpected database file: {0}")]
    FileUnexpected(String),

    /// A structural invariant is violated by the data on disk
    #[error("database corrupted at page {page}: {reason}")]
    Corrupted {
        /// Page where the violation was detected
        page: PageId,
        /// What was wrong with it
        reason: String,
    },

    /// Invariant violation that is not explained by the file contents
    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse error classification reported across the binding boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// File read/write/sync failure
    Io,
    /// Malformed or oversized input; nothing was changed
    InputInvalid,
    /// Unknown file format, version or checksum mismatch
    FileUnexpected,
    /// Data problem found while traversing the tree
    DatabaseCorrupted,
    /// Unexpected failure
    Internal,
}

impl Error {
    /// Classify the error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Io(_) => ErrorCode::Io,
            Error::KeyTooLarge(_) | Error::ValueTooLarge(_) | Error::InvalidOption(_) => {
                ErrorCode::InputInvalid
            }
            Error::FileUnexpected(_) => ErrorCode::FileUnexpected,
            Error::Corrupted { .. } => ErrorCode::DatabaseCorrupted,
            Error::Internal(_) => ErrorCode::Internal,
        }
    }

    pub(crate) fn corrupted(page: PageId, reason: impl Into<String>) -> Self {
        Error::Corrupted {
            page,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorCode::Io => "I/O error",
            ErrorCode::InputInvalid => "invalid input",
            ErrorCode::FileUnexpected => "unexpected database file",
            ErrorCode::DatabaseCorrupted => "database is corrupted",
            ErrorCode::Internal => "internal error",
        })
    }
}

impl From<nom::Err<nom::error::Error<&[u8]>>> for Error {
    fn from(err: nom::Err<nom::error::Error<&[u8]>>) -> Self {
        Error::FileUnexpected(format!("{:?}", err.map_input(|input| input.len())))
    }
}
