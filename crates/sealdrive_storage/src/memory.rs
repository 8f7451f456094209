//! In-memory journal for testing.

use crate::backend::JournalBackend;
use crate::error::StorageResult;
use crate::frame::{decode_frames, encode_frame};
use parking_lot::RwLock;

/// An in-memory journal.
///
/// Frames are encoded exactly as on disk, so crash scenarios can be
/// reproduced by truncating or corrupting the image returned by
/// [`MemoryJournal::image`] and reopening it with
/// [`MemoryJournal::from_image`].
///
/// # Example
///
/// ```rust
/// use sealdrive_storage::{JournalBackend, MemoryJournal};
///
/// let mut journal = MemoryJournal::new();
/// journal.append(b"record").unwrap();
///
/// let reopened = MemoryJournal::from_image(journal.image());
/// assert_eq!(reopened.replay().unwrap().len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct MemoryJournal {
    image: RwLock<Vec<u8>>,
}

impl MemoryJournal {
    /// Creates a new empty journal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a journal over a pre-existing image.
    #[must_use]
    pub fn from_image(image: Vec<u8>) -> Self {
        Self {
            image: RwLock::new(image),
        }
    }

    /// Returns a copy of the raw journal image.
    #[must_use]
    pub fn image(&self) -> Vec<u8> {
        self.image.read().clone()
    }
}

impl JournalBackend for MemoryJournal {
    fn append(&mut self, record: &[u8]) -> StorageResult<()> {
        let frame = encode_frame(record)?;
        self.image.write().extend_from_slice(&frame);
        Ok(())
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn replay(&self) -> StorageResult<Vec<Vec<u8>>> {
        Ok(decode_frames(&self.image.read())?.records)
    }

    fn rewrite(&mut self, records: &[Vec<u8>]) -> StorageResult<()> {
        let mut fresh = Vec::new();
        for record in records {
            fresh.extend_from_slice(&encode_frame(record)?);
        }
        *self.image.write() = fresh;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.image.read().len() as u64)
    }
}
