//! Journal backend trait definition.

use crate::error::StorageResult;

/// An append-only journal of opaque records.
///
/// Backends own framing and durability. Callers own record interpretation.
///
/// # Invariants
///
/// - `append` writes exactly one frame; a crash leaves either the whole
///   frame or a torn tail that `replay` ignores
/// - `replay` returns records in append order
/// - `rewrite` atomically replaces the whole journal: after a crash either
///   the old or the new contents are observed, never a mix
/// - Backends must be `Send + Sync` for concurrent access
pub trait JournalBackend: Send + Sync {
    /// Appends one record to the journal.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is too large or an I/O error occurs.
    fn append(&mut self, record: &[u8]) -> StorageResult<()>;

    /// Makes all previously appended records durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush operation fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Reads back every intact record in append order.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::Corrupted`] if a frame before the tail
    /// is damaged.
    fn replay(&self) -> StorageResult<Vec<Vec<u8>>>;

    /// Atomically replaces the journal contents with `records`.
    ///
    /// Used for compaction once most records are superseded.
    ///
    /// # Errors
    ///
    /// Returns an error if the new journal cannot be written.
    fn rewrite(&mut self, records: &[Vec<u8>]) -> StorageResult<()>;

    /// Returns the journal size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;
}
