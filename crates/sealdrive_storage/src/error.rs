//! Error types for journal operations.

use std::io;
use thiserror::Error;

/// Result type for journal operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during journal operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A frame in the middle of the journal is damaged.
    #[error("journal corrupted at offset {offset}: {message}")]
    Corrupted {
        /// Byte offset of the damaged frame.
        offset: u64,
        /// Description of the damage.
        message: String,
    },

    /// A record is too large to be framed.
    #[error("record too large: {size} bytes exceeds maximum of {max} bytes")]
    RecordTooLarge {
        /// Size of the rejected record.
        size: usize,
        /// Maximum frame payload size.
        max: usize,
    },

    /// Another process holds the journal lock.
    #[error("journal locked: another process has exclusive access")]
    Locked,
}

impl StorageError {
    /// Creates a corruption error.
    pub fn corrupted(offset: u64, message: impl Into<String>) -> Self {
        Self::Corrupted {
            offset,
            message: message.into(),
        }
    }
}
