//! File-backed journal for persistent caches.

use crate::backend::JournalBackend;
use crate::error::{StorageError, StorageResult};
use crate::frame::{decode_frames, encode_frame};
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// A journal stored in a single file.
///
/// # Durability
///
/// - `append` writes the frame with one `write_all` at the end of the file
/// - `flush` calls `File::sync_data` so appended frames survive power loss
/// - `rewrite` writes a sibling file, syncs it and renames it over the
///   journal, so compaction is atomic
///
/// # Locking
///
/// The journal holds an exclusive advisory lock for its whole lifetime; a
/// second open of the same path fails with [`StorageError::Locked`].
///
/// # Example
///
/// ```no_run
/// use sealdrive_storage::{FileJournal, JournalBackend};
/// use std::path::Path;
///
/// let mut journal = FileJournal::open(Path::new("cache.journal")).unwrap();
/// journal.append(b"entry").unwrap();
/// journal.flush().unwrap();
/// ```
#[derive(Debug)]
pub struct FileJournal {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileJournal {
    /// Opens or creates a journal at the given path.
    ///
    /// A torn tail left by a crash is cut off so later appends start on a
    /// frame boundary.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened, is locked by another
    /// process, or is corrupted before its tail.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let mut file = Self::open_locked(path)?;

        let mut image = Vec::new();
        file.read_to_end(&mut image)?;
        let replay = decode_frames(&image)?;

        if replay.has_torn_tail(image.len()) {
            warn!(
                path = %path.display(),
                valid_len = replay.valid_len,
                image_len = image.len(),
                "discarding torn journal tail"
            );
            file.set_len(replay.valid_len)?;
            file.sync_all()?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    /// Opens or creates a journal, creating parent directories if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be created or the journal
    /// cannot be opened.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    /// Returns the journal path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_locked(path: &Path) -> StorageResult<File> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked);
        }
        Ok(file)
    }

    fn compaction_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".compact");
        PathBuf::from(name)
    }
}

impl JournalBackend for FileJournal {
    fn append(&mut self, record: &[u8]) -> StorageResult<()> {
        let frame = encode_frame(record)?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::End(0))?;
        file.write_all(&frame)?;
        Ok(())
    }

    fn flush(&mut self) -> StorageResult<()> {
        let mut file = self.file.lock();
        file.flush()?;
        file.sync_data()?;
        Ok(())
    }

    fn replay(&self) -> StorageResult<Vec<Vec<u8>>> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        let mut image = Vec::new();
        file.read_to_end(&mut image)?;
        Ok(decode_frames(&image)?.records)
    }

    fn rewrite(&mut self, records: &[Vec<u8>]) -> StorageResult<()> {
        let tmp_path = self.compaction_path();
        {
            let mut tmp = File::create(&tmp_path)?;
            for record in records {
                tmp.write_all(&encode_frame(record)?)?;
            }
            tmp.sync_all()?;
        }

        fs::rename(&tmp_path, &self.path)?;

        let fresh = Self::open_locked(&self.path)?;
        *self.file.lock() = fresh;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.file.lock().metadata()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_create_new() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.journal");

        let journal = FileJournal::open(&path).unwrap();
        assert_eq!(journal.size().unwrap(), 0);
        assert!(path.exists());
        assert_eq!(journal.path(), path);
    }

    #[test]
    fn file_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.journal");

        {
            let mut journal = FileJournal::open(&path).unwrap();
            journal.append(b"persistent").unwrap();
            journal.append(b"records").unwrap();
            journal.flush().unwrap();
        }

        let journal = FileJournal::open(&path).unwrap();
        assert_eq!(
            journal.replay().unwrap(),
            vec![b"persistent".to_vec(), b"records".to_vec()]
        );
    }

    #[test]
    fn file_second_open_is_locked() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.journal");

        let _first = FileJournal::open(&path).unwrap();
        let second = FileJournal::open(&path);
        assert!(matches!(second, Err(StorageError::Locked)));
    }

    #[test]
    fn file_torn_tail_is_truncated_on_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.journal");

        {
            let mut journal = FileJournal::open(&path).unwrap();
            journal.append(b"complete").unwrap();
            journal.flush().unwrap();
        }
        let intact = fs::metadata(&path).unwrap().len();

        {
            let mut raw = OpenOptions::new().append(true).open(&path).unwrap();
            let frame = encode_frame(b"half-written").unwrap();
            raw.write_all(&frame[..frame.len() / 2]).unwrap();
        }

        let mut journal = FileJournal::open(&path).unwrap();
        assert_eq!(journal.size().unwrap(), intact);

        journal.append(b"after").unwrap();
        assert_eq!(
            journal.replay().unwrap(),
            vec![b"complete".to_vec(), b"after".to_vec()]
        );
    }

    #[test]
    fn file_rewrite_compacts_and_keeps_lock() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.journal");

        let mut journal = FileJournal::open(&path).unwrap();
        for i in 0..20u8 {
            journal.append(&[i; 16]).unwrap();
        }
        journal.rewrite(&[vec![19; 16]]).unwrap();

        assert_eq!(journal.replay().unwrap(), vec![vec![19; 16]]);
        assert!(!journal.compaction_path().exists());
        assert!(matches!(
            FileJournal::open(&path),
            Err(StorageError::Locked)
        ));

        journal.append(b"tail").unwrap();
        assert_eq!(journal.replay().unwrap().len(), 2);
    }

    #[test]
    fn file_create_with_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.journal");

        let journal = FileJournal::open_with_create_dirs(&path).unwrap();
        assert_eq!(journal.size().unwrap(), 0);
    }
}
