//! Journal records of the local cache.
//!
//! Every record is a full snapshot of one key, so replay keeps the last
//! record per key and a single append is the unit of atomicity.

use super::entry::VersionedEntry;
use crate::codec::{from_cbor, to_cbor};
use crate::error::CoreResult;
use crate::types::{BlockId, EntryId};
use sealdrive_storage::JournalBackend;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum RecordKey {
    Entry(EntryId),
    Block(BlockId),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum Record {
    Entry {
        id: EntryId,
        entry: VersionedEntry,
    },
    Block {
        id: BlockId,
        data: Vec<u8>,
        dirty: bool,
    },
}

impl Record {
    pub(crate) fn key(&self) -> RecordKey {
        match self {
            Self::Entry { id, .. } => RecordKey::Entry(*id),
            Self::Block { id, .. } => RecordKey::Block(*id),
        }
    }
}

/// A journal backend plus the latest encoded record of every key.
pub(crate) struct Journal {
    backend: Box<dyn JournalBackend>,
    latest: BTreeMap<RecordKey, Vec<u8>>,
    superseded: usize,
    sync_on_write: bool,
}

impl Journal {
    /// Replays a backend, returning the journal and the surviving records.
    pub(crate) fn open(
        backend: Box<dyn JournalBackend>,
        sync_on_write: bool,
    ) -> CoreResult<(Self, Vec<Record>)> {
        let raw = backend.replay()?;
        let total = raw.len();

        let mut latest = BTreeMap::new();
        let mut records = BTreeMap::new();
        for bytes in raw {
            let record: Record = from_cbor(&bytes)?;
            let key = record.key();
            latest.insert(key, bytes);
            records.insert(key, record);
        }

        let journal = Self {
            backend,
            superseded: total - latest.len(),
            latest,
            sync_on_write,
        };
        Ok((journal, records.into_values().collect()))
    }

    /// Durably appends one record.
    pub(crate) fn write(&mut self, record: &Record) -> CoreResult<()> {
        let bytes = to_cbor(record)?;
        self.backend.append(&bytes)?;
        if self.sync_on_write {
            self.backend.flush()?;
        }
        if self.latest.insert(record.key(), bytes).is_some() {
            self.superseded += 1;
        }
        Ok(())
    }

    pub(crate) fn flush(&mut self) -> CoreResult<()> {
        Ok(self.backend.flush()?)
    }

    pub(crate) fn superseded(&self) -> usize {
        self.superseded
    }

    /// Rewrites the backend with one record per key.
    pub(crate) fn compact(&mut self) -> CoreResult<()> {
        let records: Vec<Vec<u8>> = self.latest.values().cloned().collect();
        self.backend.rewrite(&records)?;
        self.superseded = 0;
        Ok(())
    }

    pub(crate) fn size(&self) -> CoreResult<u64> {
        Ok(self.backend.size()?)
    }

    #[cfg(test)]
    pub(crate) fn latest_records(&self) -> Vec<Vec<u8>> {
        self.latest.values().cloned().collect()
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("records", &self.latest.len())
            .field("superseded", &self.superseded)
            .finish()
    }
}
