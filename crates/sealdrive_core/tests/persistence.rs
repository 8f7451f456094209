//! Restart tests for the file-backed local cache.

use sealdrive_core::{
    AuthorId, CacheConfig, CacheError, Chunker, EntryId, FolderManifest, LocalCache, Manifest,
    ManifestContent, SecretKey, Timestamp,
};
use sealdrive_storage::{FileJournal, StorageError};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tempfile::tempdir;

fn open(path: &Path) -> LocalCache {
    let journal = FileJournal::open(path).unwrap();
    LocalCache::open(Box::new(journal), CacheConfig::default()).unwrap()
}

fn folder(id: EntryId, version: u64, names: &[(&str, EntryId)]) -> Manifest {
    let mut f = FolderManifest::new();
    for (name, child) in names {
        f.children.insert((*name).to_string(), *child);
    }
    Manifest {
        entry_id: id,
        version,
        author: AuthorId::new("alice@laptop"),
        timestamp: Timestamp::from_micros(1_000 + version as i64),
        parent: None,
        content: ManifestContent::Folder(f),
    }
}

#[test]
fn versioned_entries_survive_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cache.journal");
    let (root, child) = (EntryId::new(), EntryId::new());

    {
        let cache = open(&path);
        cache.adopt_remote(root, folder(root, 1, &[])).unwrap();
        cache.adopt_remote(root, folder(root, 2, &[])).unwrap();
        cache
            .stage_edit(root, 2, folder(root, 3, &[("docs", child)]))
            .unwrap();
        cache.stage_edit(child, 0, folder(child, 1, &[])).unwrap();
    }

    let cache = open(&path);
    let entry = cache.get_entry(root).unwrap();
    assert_eq!(entry.confirmed.as_ref().map(|m| m.version), Some(2));
    assert_eq!(entry.base_version, 2);
    assert_eq!(
        entry.pending.unwrap().as_folder().unwrap().get("docs"),
        Some(child)
    );

    let placeholder = cache.get_entry(child).unwrap();
    assert!(placeholder.is_placeholder());
    assert_eq!(placeholder.base_version, 0);

    let mut pending = cache.pending_ids();
    pending.sort();
    let mut expected = vec![root, child];
    expected.sort();
    assert_eq!(pending, expected);
}

#[test]
fn crash_during_append_keeps_previous_state() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cache.journal");
    let root = EntryId::new();

    {
        let cache = open(&path);
        cache.adopt_remote(root, folder(root, 1, &[])).unwrap();
    }

    // Half a frame: what a crash in the middle of the next write leaves.
    {
        let mut raw = OpenOptions::new().append(true).open(&path).unwrap();
        raw.write_all(b"SDJ1\x40\x00\x00\x00partial").unwrap();
    }

    let cache = open(&path);
    assert_eq!(cache.confirmed_version(root), 1);
    cache.adopt_remote(root, folder(root, 2, &[])).unwrap();
    drop(cache);

    assert_eq!(open(&path).confirmed_version(root), 2);
}

#[test]
fn dirty_blocks_survive_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cache.journal");
    let key = SecretKey::generate();
    let (file, blocks) = Chunker::new(4).unwrap().split(b"0123456789", &key).unwrap();

    {
        let cache = open(&path);
        for block in &blocks {
            cache.put_dirty_block(block.id, block.data.clone()).unwrap();
        }
        cache.mark_block_clean(blocks[0].id).unwrap();
    }

    let cache = open(&path);
    assert_eq!(cache.dirty_blocks().len(), 2);
    assert!(!cache.is_dirty(file.blocks[0].id));
    let stored = cache.get_block(file.blocks[2].id).unwrap();
    assert_eq!(
        sealdrive_core::open_block(&file.blocks[2], &stored, &key).unwrap(),
        b"89"
    );
}

#[test]
fn compaction_survives_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cache.journal");
    let root = EntryId::new();

    {
        let journal = FileJournal::open(&path).unwrap();
        let cache =
            LocalCache::open(Box::new(journal), CacheConfig::new().compact_threshold(3)).unwrap();
        for version in 1..=10 {
            cache.adopt_remote(root, folder(root, version, &[])).unwrap();
        }
        assert!(cache.compact_if_needed().unwrap());
    }

    let size = std::fs::metadata(&path).unwrap().len();
    let cache = open(&path);
    assert_eq!(cache.confirmed_version(root), 10);
    assert!(size < 512, "journal not compacted: {size} bytes");
}

#[test]
fn second_cache_on_same_journal_is_locked() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cache.journal");
    let _cache = open(&path);
    assert!(matches!(FileJournal::open(&path), Err(StorageError::Locked)));
}

#[test]
fn stale_base_is_reported_after_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cache.journal");
    let root = EntryId::new();

    {
        let cache = open(&path);
        cache.adopt_remote(root, folder(root, 5, &[])).unwrap();
    }

    let cache = open(&path);
    let result = cache.stage_edit(root, 4, folder(root, 5, &[]));
    assert!(matches!(
        result,
        Err(CacheError::StaleBase {
            claimed: 4,
            confirmed: 5,
            ..
        })
    ));
}
