//! The local cache: authoritative local replica of the tree.
//!
//! Holds one [`VersionedEntry`] per entry and the content blocks known
//! locally. Mutations of one entry are serialized by a per-entry lock;
//! different entries proceed independently.
//!
//! When a journal is attached, every mutation is appended to it before
//! it becomes visible in memory. A failed write leaves memory untouched,
//! and a crash leaves the previous valid state on disk.

mod entry;
mod journal;

pub use entry::VersionedEntry;

use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult, CoreResult};
use crate::manifest::Manifest;
use crate::types::{BlockId, EntryId, Version};
use journal::{Journal, Record};
use parking_lot::{Mutex, RwLock};
use sealdrive_storage::JournalBackend;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct StoredBlock {
    data: Arc<Vec<u8>>,
    dirty: bool,
}

/// Local replica of the tree.
#[derive(Debug)]
pub struct LocalCache {
    entries: RwLock<HashMap<EntryId, Arc<Mutex<VersionedEntry>>>>,
    blocks: RwLock<HashMap<BlockId, StoredBlock>>,
    journal: Option<Mutex<Journal>>,
    config: CacheConfig,
}

impl Default for LocalCache {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl LocalCache {
    /// Creates a cache that is not persisted.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            blocks: RwLock::new(HashMap::new()),
            journal: None,
            config: CacheConfig::default(),
        }
    }

    /// Opens a cache persisted to `backend`, replaying its contents.
    ///
    /// # Errors
    ///
    /// Fails if the journal is corrupted or holds undecodable records.
    pub fn open(backend: Box<dyn JournalBackend>, config: CacheConfig) -> CoreResult<Self> {
        let (journal, records) = Journal::open(backend, config.sync_on_write)?;

        let mut entries = HashMap::new();
        let mut blocks = HashMap::new();
        for record in records {
            match record {
                Record::Entry { id, entry } => {
                    entries.insert(id, Arc::new(Mutex::new(entry)));
                }
                Record::Block { id, data, dirty } => {
                    blocks.insert(
                        id,
                        StoredBlock {
                            data: Arc::new(data),
                            dirty,
                        },
                    );
                }
            }
        }

        info!(
            entries = entries.len(),
            blocks = blocks.len(),
            superseded = journal.superseded(),
            "local cache loaded"
        );

        Ok(Self {
            entries: RwLock::new(entries),
            blocks: RwLock::new(blocks),
            journal: Some(Mutex::new(journal)),
            config,
        })
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn slot(&self, id: EntryId) -> Option<Arc<Mutex<VersionedEntry>>> {
        self.entries.read().get(&id).cloned()
    }

    fn slot_or_create(&self, id: EntryId) -> Arc<Mutex<VersionedEntry>> {
        if let Some(slot) = self.slot(id) {
            return slot;
        }
        self.entries.write().entry(id).or_default().clone()
    }

    fn persist(&self, record: &Record) -> CoreResult<()> {
        match &self.journal {
            Some(journal) => journal.lock().write(record),
            None => Ok(()),
        }
    }

    /// Runs `f` on the entry under its lock and commits the returned state.
    fn update<R>(
        &self,
        id: EntryId,
        f: impl FnOnce(&VersionedEntry) -> CacheResult<(VersionedEntry, R)>,
    ) -> CacheResult<R> {
        let slot = self.slot_or_create(id);
        let mut guard = slot.lock();
        let (next, result) = f(&guard)?;
        debug_assert!(next.holds_invariants(), "cache invariant broken for {id}");

        self.persist(&Record::Entry {
            id,
            entry: next.clone(),
        })?;
        *guard = next;
        Ok(result)
    }

    /// Returns a snapshot of an entry.
    #[must_use]
    pub fn get_entry(&self, id: EntryId) -> Option<VersionedEntry> {
        let slot = self.slot(id)?;
        let entry = slot.lock().clone();
        (!entry.is_empty()).then_some(entry)
    }

    /// Returns the confirmed manifest of an entry.
    #[must_use]
    pub fn get_confirmed(&self, id: EntryId) -> Option<Manifest> {
        self.slot(id)?.lock().confirmed.clone()
    }

    /// Returns what the local user sees: the pending edit, else confirmed.
    #[must_use]
    pub fn read_manifest(&self, id: EntryId) -> Option<Manifest> {
        self.slot(id)?.lock().current().cloned()
    }

    /// Returns the confirmed version of an entry, 0 if none.
    #[must_use]
    pub fn confirmed_version(&self, id: EntryId) -> Version {
        self.slot(id)
            .map_or(0, |slot| slot.lock().confirmed_version())
    }

    /// Returns every known entry.
    #[must_use]
    pub fn entry_ids(&self) -> Vec<EntryId> {
        self.collect_ids(|entry| !entry.is_empty())
    }

    /// Returns every entry with a pending edit.
    #[must_use]
    pub fn pending_ids(&self) -> Vec<EntryId> {
        self.collect_ids(VersionedEntry::has_pending)
    }

    fn collect_ids(&self, keep: impl Fn(&VersionedEntry) -> bool) -> Vec<EntryId> {
        let slots: Vec<_> = self
            .entries
            .read()
            .iter()
            .map(|(id, slot)| (*id, Arc::clone(slot)))
            .collect();
        let mut ids: Vec<EntryId> = slots
            .into_iter()
            .filter(|(_, slot)| keep(&slot.lock()))
            .map(|(id, _)| id)
            .collect();
        ids.sort();
        ids
    }

    /// Returns `(entry, confirmed version)` for every confirmed entry.
    #[must_use]
    pub fn confirmed_versions(&self) -> Vec<(EntryId, Version)> {
        let mut versions: Vec<_> = self
            .entries
            .read()
            .iter()
            .map(|(id, slot)| (*id, slot.lock().confirmed_version()))
            .filter(|(_, version)| *version > 0)
            .collect();
        versions.sort();
        versions
    }

    /// Stages a local edit derived from `base_version`.
    ///
    /// A second edit before synchronization replaces the first one; both
    /// extend the same base.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::StaleBase`] if `base_version` is not the
    /// confirmed version, and [`CacheError::NotNextVersion`] if the manifest
    /// is not at `base_version + 1`.
    pub fn stage_edit(
        &self,
        id: EntryId,
        base_version: Version,
        manifest: Manifest,
    ) -> CacheResult<()> {
        check_entry(id, &manifest)?;
        self.update(id, |entry| {
            let confirmed = entry.confirmed_version();
            if base_version != confirmed {
                return Err(CacheError::StaleBase {
                    entry_id: id,
                    claimed: base_version,
                    confirmed,
                });
            }
            check_next(id, confirmed, &manifest)?;

            debug!(entry = %id, base = base_version, "staged local edit");
            Ok((
                VersionedEntry {
                    confirmed: entry.confirmed.clone(),
                    pending: Some(manifest),
                    base_version,
                },
                (),
            ))
        })
    }

    /// Stages an edit computed from the snapshot `seen`, failing instead of
    /// overwriting if the entry moved on since.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::StaleBase`] if a newer version was confirmed,
    /// [`CacheError::PendingChanged`] if the pending edit was replaced, and
    /// [`CacheError::NotNextVersion`] if the manifest is out of sequence.
    pub fn revise_pending(
        &self,
        id: EntryId,
        seen: &VersionedEntry,
        manifest: Manifest,
    ) -> CacheResult<()> {
        check_entry(id, &manifest)?;
        self.update(id, |entry| {
            let confirmed = entry.confirmed_version();
            if seen.base_version != confirmed {
                return Err(CacheError::StaleBase {
                    entry_id: id,
                    claimed: seen.base_version,
                    confirmed,
                });
            }
            if entry.pending != seen.pending {
                return Err(CacheError::PendingChanged(id));
            }
            check_next(id, confirmed, &manifest)?;

            debug!(entry = %id, base = confirmed, "revised local edit");
            Ok((
                VersionedEntry {
                    confirmed: entry.confirmed.clone(),
                    pending: Some(manifest),
                    base_version: confirmed,
                },
                (),
            ))
        })
    }

    /// Records that the remote accepted `manifest`.
    ///
    /// Clears the pending edit if it is the accepted manifest. A pending
    /// edit staged while the push was in flight is kept and rebased onto
    /// the new confirmed version. Returns true if the pending edit was
    /// cleared.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::NotNextVersion`] unless the manifest is exactly
    /// one version past the confirmed one.
    pub fn mark_confirmed(&self, id: EntryId, manifest: Manifest) -> CacheResult<bool> {
        check_entry(id, &manifest)?;
        self.update(id, |entry| {
            check_next(id, entry.confirmed_version(), &manifest)?;

            let (pending, cleared) = match &entry.pending {
                Some(p) if *p == manifest => (None, true),
                Some(p) => (
                    Some(manifest.successor(
                        p.parent,
                        p.content.clone(),
                        p.author.clone(),
                        p.timestamp,
                    )?),
                    false,
                ),
                None => (None, false),
            };

            info!(entry = %id, version = manifest.version, "confirmed");
            Ok((
                VersionedEntry {
                    base_version: manifest.version,
                    confirmed: Some(manifest),
                    pending,
                },
                cleared,
            ))
        })
    }

    /// Adopts a verified remote version for an entry without local edits.
    ///
    /// The first observation of an entry may start at any version; later
    /// ones must be contiguous.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::PendingExists`] if a local edit is staged and
    /// [`CacheError::NotNextVersion`] on a gap or regression.
    pub fn adopt_remote(&self, id: EntryId, manifest: Manifest) -> CacheResult<()> {
        check_entry(id, &manifest)?;
        self.update(id, |entry| {
            if entry.has_pending() {
                return Err(CacheError::PendingExists(id));
            }
            if entry.confirmed.is_some() {
                check_next(id, entry.confirmed_version(), &manifest)?;
            }

            debug!(entry = %id, version = manifest.version, "adopted remote version");
            Ok((
                VersionedEntry {
                    base_version: manifest.version,
                    confirmed: Some(manifest),
                    pending: None,
                },
                (),
            ))
        })
    }

    /// Atomically applies a merge: adopts the verified remote `chain` and
    /// replaces the pending edit with `merged`.
    ///
    /// Nothing changes unless the pending edit is still `expected_pending`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::PendingChanged`] if the pending edit was
    /// replaced meanwhile, and [`CacheError::NotNextVersion`] if the chain
    /// or the merged manifest is out of sequence.
    pub fn apply_merge(
        &self,
        id: EntryId,
        expected_pending: &Manifest,
        chain: &[Manifest],
        merged: Option<Manifest>,
    ) -> CacheResult<()> {
        for manifest in chain.iter().chain(merged.as_ref()) {
            check_entry(id, manifest)?;
        }
        self.update(id, |entry| {
            if entry.pending.as_ref() != Some(expected_pending) {
                return Err(CacheError::PendingChanged(id));
            }

            let mut version = entry.confirmed_version();
            for manifest in chain {
                check_next(id, version, manifest)?;
                version = manifest.version;
            }
            if let Some(merged) = &merged {
                check_next(id, version, merged)?;
            }

            let confirmed = chain.last().cloned().or_else(|| entry.confirmed.clone());
            info!(
                entry = %id,
                confirmed = version,
                has_pending = merged.is_some(),
                "applied merge"
            );
            Ok((
                VersionedEntry {
                    confirmed,
                    pending: merged,
                    base_version: version,
                },
                (),
            ))
        })
    }

    /// Forgets a placeholder that was never pushed, as long as its pending
    /// edit is still `expected`. Returns false if the entry moved on.
    ///
    /// # Errors
    ///
    /// Fails if the change cannot be persisted.
    pub fn discard_placeholder(&self, id: EntryId, expected: &Manifest) -> CacheResult<bool> {
        self.update(id, |entry| {
            if !entry.is_placeholder() || entry.pending.as_ref() != Some(expected) {
                return Ok((entry.clone(), false));
            }
            debug!(entry = %id, "discarded placeholder");
            Ok((VersionedEntry::default(), true))
        })
    }

    /// Stores a block written locally; it stays dirty until uploaded.
    ///
    /// # Errors
    ///
    /// Fails if the block cannot be persisted.
    pub fn put_dirty_block(&self, id: BlockId, data: Vec<u8>) -> CacheResult<()> {
        self.put_block(id, Arc::new(data), true)
    }

    /// Stores a block downloaded from the remote.
    ///
    /// # Errors
    ///
    /// Fails if the block cannot be persisted.
    pub fn put_clean_block(&self, id: BlockId, data: Vec<u8>) -> CacheResult<()> {
        self.put_block(id, Arc::new(data), false)
    }

    fn put_block(&self, id: BlockId, data: Arc<Vec<u8>>, dirty: bool) -> CacheResult<()> {
        let mut blocks = self.blocks.write();
        if let Some(existing) = blocks.get(&id) {
            // A clean block never becomes dirty again.
            if !existing.dirty || dirty {
                return Ok(());
            }
        }
        self.persist(&Record::Block {
            id,
            data: data.as_ref().clone(),
            dirty,
        })?;
        blocks.insert(id, StoredBlock { data, dirty });
        Ok(())
    }

    /// Returns the sealed bytes of a block.
    #[must_use]
    pub fn get_block(&self, id: BlockId) -> Option<Arc<Vec<u8>>> {
        self.blocks.read().get(&id).map(|b| Arc::clone(&b.data))
    }

    /// Returns true if the block is stored locally and not yet uploaded.
    #[must_use]
    pub fn is_dirty(&self, id: BlockId) -> bool {
        self.blocks.read().get(&id).is_some_and(|b| b.dirty)
    }

    /// Returns every block not yet uploaded.
    #[must_use]
    pub fn dirty_blocks(&self) -> Vec<BlockId> {
        let mut ids: Vec<_> = self
            .blocks
            .read()
            .iter()
            .filter(|(_, b)| b.dirty)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Records that a block was uploaded.
    ///
    /// # Errors
    ///
    /// Fails if the change cannot be persisted.
    pub fn mark_block_clean(&self, id: BlockId) -> CacheResult<()> {
        let data = match self.blocks.read().get(&id) {
            Some(block) if block.dirty => Arc::clone(&block.data),
            _ => return Ok(()),
        };
        self.put_block(id, data, false)
    }

    /// Flushes the journal to stable storage.
    ///
    /// # Errors
    ///
    /// Fails if the backend cannot flush.
    pub fn flush(&self) -> CoreResult<()> {
        match &self.journal {
            Some(journal) => journal.lock().flush(),
            None => Ok(()),
        }
    }

    /// Rewrites the journal to one record per key.
    ///
    /// # Errors
    ///
    /// Fails if the rewrite fails; the old journal stays valid.
    pub fn compact(&self) -> CoreResult<()> {
        if let Some(journal) = &self.journal {
            let mut journal = journal.lock();
            let before = journal.size()?;
            journal.compact()?;
            info!(before, after = journal.size()?, "compacted cache journal");
        }
        Ok(())
    }

    /// Compacts when more than `compact_threshold` records are superseded.
    /// Returns true if a compaction ran.
    ///
    /// # Errors
    ///
    /// Fails if the rewrite fails.
    pub fn compact_if_needed(&self) -> CoreResult<bool> {
        let due = self
            .journal
            .as_ref()
            .is_some_and(|j| j.lock().superseded() > self.config.compact_threshold);
        if due {
            self.compact()?;
        }
        Ok(due)
    }
}

fn check_entry(id: EntryId, manifest: &Manifest) -> CacheResult<()> {
    if manifest.entry_id != id {
        return Err(CacheError::EntryMismatch {
            expected: id,
            actual: manifest.entry_id,
        });
    }
    Ok(())
}

fn check_next(id: EntryId, current: Version, manifest: &Manifest) -> CacheResult<()> {
    match current.checked_add(1) {
        Some(next) if next == manifest.version => Ok(()),
        next => Err(CacheError::NotNextVersion {
            entry_id: id,
            expected: next.unwrap_or(current),
            actual: manifest.version,
        }),
    }
}
