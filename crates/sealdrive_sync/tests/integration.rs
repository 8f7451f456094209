//! Multi-device scenarios against a shared in-memory remote.

use sealdrive_core::crypto::seal_manifest;
use sealdrive_core::{
    conflict_name, AuthorId, CacheConfig, EntryId, FolderManifest, LocalCache, Manifest, ManifestContent,
    Resolution, SecretKey, SigningIdentity, Timestamp,
};
use sealdrive_storage::FileJournal;
use sealdrive_sync::{
    Credentials, Drive, InMemoryRemote, Keyring, RemoteError, RemoteHistoryClient, RemoteStore,
    RetryConfig, SyncConfig, SyncError, SyncEvent, SyncState, Synchronizer,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tracing_subscriber::EnvFilter;

const WORKSPACE_KEY: [u8; 32] = [42; 32];

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Workspace {
    remote: Arc<InMemoryRemote>,
    keyring: Arc<Keyring>,
    root: EntryId,
}

impl Workspace {
    fn new() -> Self {
        init_tracing();
        Self {
            remote: Arc::new(InMemoryRemote::new()),
            keyring: Arc::new(Keyring::new()),
            root: EntryId::new(),
        }
    }

    fn identity(name: &str, seed: u8) -> SigningIdentity {
        SigningIdentity::from_seed(AuthorId::new(name), &[seed; 32])
    }

    fn join(&self, name: &str, seed: u8) -> Drive {
        self.join_with_cache(name, seed, LocalCache::in_memory())
    }

    fn join_with_cache(&self, name: &str, seed: u8, cache: LocalCache) -> Drive {
        let identity = Self::identity(name, seed);
        self.keyring
            .register(identity.author().clone(), identity.verifying_key());
        let credentials = Credentials::new(
            identity,
            SecretKey::from_bytes(&WORKSPACE_KEY).unwrap(),
        );
        let client =
            RemoteHistoryClient::new(self.remote.clone(), self.keyring.clone(), credentials);
        let config = SyncConfig::new()
            .with_block_size(8)
            .with_max_merge_rounds(64)
            .with_retry(
                RetryConfig::new(3)
                    .with_initial_delay(Duration::from_millis(1))
                    .with_jitter(false),
            );
        let sync = Arc::new(Synchronizer::new(config, Arc::new(cache), client));
        Drive::new(sync, self.root).unwrap()
    }
}

fn open_cache(path: &Path) -> LocalCache {
    let journal = FileJournal::open(path).unwrap();
    LocalCache::open(Box::new(journal), CacheConfig::default()).unwrap()
}

fn children(drive: &Drive, folder: EntryId) -> BTreeMap<String, EntryId> {
    drive.list(folder).unwrap().into_iter().collect()
}

async fn settle(drives: &[&Drive]) {
    for _ in 0..3 {
        for drive in drives {
            let report = drive.sync().await.unwrap();
            assert!(report.is_success(), "{:?}", report.failed);
        }
    }
}

#[tokio::test]
async fn concurrent_rename_and_add_merge_into_next_version() {
    let ws = Workspace::new();
    let alice = ws.join("alice@laptop", 1);
    let bob = ws.join("bob@desktop", 2);

    alice.create_workspace().unwrap();
    let e = alice.create_folder(ws.root, "E").unwrap();
    alice.sync().await.unwrap();
    let x = alice.create_folder(e, "a").unwrap();
    alice.sync().await.unwrap();
    let y = alice.create_folder(e, "b").unwrap();
    alice.sync().await.unwrap();
    assert_eq!(ws.remote.latest_version(e), 3);

    assert!(bob.sync_tree().await.is_success());
    assert_eq!(bob.read_manifest(e).unwrap().version, 3);

    // Alice renames offline; Bob adds a child and gets v4 in first.
    alice.rename(e, "a", "a2").unwrap();
    assert_eq!(alice.read_manifest(e).unwrap().version, 4);
    let z = bob.create_folder(e, "c").unwrap();
    bob.sync_entry(e).await.unwrap();
    assert_eq!(ws.remote.latest_version(e), 4);

    let outcome = alice.sync_entry(e).await.unwrap();
    assert!(outcome.pushed);
    assert_eq!(outcome.confirmed_version, 5);
    assert_eq!(ws.remote.latest_version(e), 5);

    let expected = BTreeMap::from([
        ("a2".to_string(), x),
        ("b".to_string(), y),
        ("c".to_string(), z),
    ]);
    assert_eq!(children(&alice, e), expected);
    assert!(alice
        .read_manifest(e)
        .unwrap()
        .as_folder()
        .unwrap()
        .tombstones
        .contains("a"));

    bob.sync_entry(e).await.unwrap();
    assert_eq!(children(&bob, e), expected);
    assert_eq!(bob.read_manifest(e), alice.read_manifest(e));
}

#[tokio::test]
async fn colliding_names_keep_the_later_entry() {
    let ws = Workspace::new();
    let alice = ws.join("alice@laptop", 1);
    let bob = ws.join("bob@desktop", 2);
    alice.create_workspace().unwrap();
    alice.sync().await.unwrap();
    assert!(bob.sync_tree().await.is_success());

    let early = alice.create_folder(ws.root, "report").unwrap();
    let t1 = alice.read_manifest(ws.root).unwrap().timestamp;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let late = bob.create_folder(ws.root, "report").unwrap();

    let mut conflicts = bob.subscribe();
    alice.sync().await.unwrap();
    bob.sync().await.unwrap();
    settle(&[&alice, &bob]).await;

    let names = children(&alice, ws.root);
    assert_eq!(names.len(), 2);
    assert_eq!(names.get("report"), Some(&late));
    let renamed = conflict_name("report", &AuthorId::new("alice@laptop"), t1);
    assert_eq!(names.get(&renamed), Some(&early), "{names:?}");
    assert_eq!(children(&bob, ws.root), names);

    let mut saw_conflict = false;
    while let Ok(event) = conflicts.try_recv() {
        if let SyncEvent::Conflict(record) = event {
            assert_eq!(record.entry_id, ws.root);
            saw_conflict = true;
        }
    }
    assert!(saw_conflict);
}

#[tokio::test]
async fn concurrent_file_edits_lose_nothing() {
    let ws = Workspace::new();
    let alice = ws.join("alice@laptop", 1);
    let bob = ws.join("bob@desktop", 2);
    alice.create_workspace().unwrap();
    let file = alice
        .create_file(ws.root, "notes.txt", b"shared base content")
        .unwrap();
    alice.sync().await.unwrap();
    assert!(bob.sync_tree().await.is_success());

    alice.write_file(file, b"alice rewrote the notes").unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    bob.write_file(file, b"bob's version").unwrap();

    alice.sync().await.unwrap();
    bob.sync().await.unwrap();
    settle(&[&alice, &bob]).await;

    for drive in [&alice, &bob] {
        let names = children(drive, ws.root);
        assert_eq!(names.len(), 2, "{names:?}");
        assert_eq!(drive.read_file(file).await.unwrap(), b"bob's version");

        let (sibling_name, sibling) = names
            .iter()
            .find(|(_, id)| **id != file)
            .map(|(name, id)| (name.clone(), *id))
            .unwrap();
        assert!(
            sibling_name.starts_with("notes.txt (conflict - alice@laptop - "),
            "{sibling_name}"
        );
        assert_eq!(
            drive.read_file(sibling).await.unwrap(),
            b"alice rewrote the notes"
        );
    }
}

#[tokio::test]
async fn forged_and_foreign_objects_are_rejected() {
    let ws = Workspace::new();
    let alice = ws.join("alice@laptop", 1);
    let bob = ws.join("bob@desktop", 2);
    alice.create_workspace().unwrap();
    let docs = alice.create_folder(ws.root, "docs").unwrap();
    let notes = alice.create_folder(ws.root, "notes").unwrap();
    alice.sync().await.unwrap();
    assert!(bob.sync_tree().await.is_success());
    let mut events = bob.subscribe();

    // Someone outside the workspace appends to `docs`.
    let mallory = Workspace::identity("mallory@pc", 9);
    let key = SecretKey::from_bytes(&WORKSPACE_KEY).unwrap();
    let intruder = Manifest {
        entry_id: docs,
        version: 2,
        author: mallory.author().clone(),
        timestamp: Timestamp::now(),
        parent: Some(ws.root),
        content: ManifestContent::Folder(FolderManifest::new()),
    };
    ws.remote
        .inject(docs, seal_manifest(&intruder, &mallory, &key).unwrap());

    let err = bob.sync_entry(docs).await.unwrap_err();
    assert!(!err.is_security_incident());
    assert_ne!(bob.synchronizer().state(docs), SyncState::Blocked);
    assert_eq!(bob.read_manifest(docs).unwrap().version, 1);

    // Mallory signs with her own key but the envelope names Alice.
    let impostor = Workspace::identity("alice@laptoq", 9);
    let forged = Manifest {
        entry_id: notes,
        version: 2,
        author: impostor.author().clone(),
        timestamp: Timestamp::now(),
        parent: Some(ws.root),
        content: ManifestContent::Folder(FolderManifest::new()),
    };
    let mut blob = seal_manifest(&forged, &impostor, &key).unwrap();
    let (from, to) = (b"alice@laptoq".as_slice(), b"alice@laptop".as_slice());
    let at = blob.windows(from.len()).position(|w| w == from).unwrap();
    blob[at..at + to.len()].copy_from_slice(to);
    ws.remote.inject(notes, blob);

    let err = bob.sync_entry(notes).await.unwrap_err();
    assert!(err.is_security_incident(), "{err:?}");
    assert_eq!(bob.synchronizer().state(notes), SyncState::Blocked);
    assert_eq!(bob.read_manifest(notes).unwrap().version, 1);
    assert!(matches!(
        bob.sync_entry(notes).await,
        Err(SyncError::Blocked(_))
    ));

    let mut incidents = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::SecurityIncident {
            entry_id, blocked, ..
        } = event
        {
            incidents.push((entry_id, blocked));
        }
    }
    assert_eq!(incidents, vec![(docs, false), (notes, true)]);
}

#[tokio::test]
async fn repeated_append_is_refused_not_duplicated() {
    let ws = Workspace::new();
    let alice = ws.join("alice@laptop", 1);
    alice.create_workspace().unwrap();
    alice.sync().await.unwrap();

    let identity = Workspace::identity("alice@laptop", 1);
    let key = SecretKey::from_bytes(&WORKSPACE_KEY).unwrap();
    let v1 = ws.remote.fetch_latest(ws.root).await.unwrap();
    assert_eq!(v1.version, 1);

    let next = Manifest {
        entry_id: ws.root,
        version: 2,
        author: identity.author().clone(),
        timestamp: Timestamp::now(),
        parent: None,
        content: ManifestContent::Folder(FolderManifest::new()),
    };
    let blob = seal_manifest(&next, &identity, &key).unwrap();
    ws.remote.append(ws.root, blob.clone(), 1).await.unwrap();
    let appends = ws.remote.append_count();

    for _ in 0..3 {
        assert_eq!(
            ws.remote.append(ws.root, blob.clone(), 1).await,
            Err(RemoteError::VersionConflict {
                entry_id: ws.root,
                actual_latest: 2
            })
        );
    }
    assert_eq!(ws.remote.append_count(), appends);
    assert_eq!(ws.remote.latest_version(ws.root), 2);
}

#[tokio::test]
async fn push_that_landed_before_a_crash_is_recognized() {
    let ws = Workspace::new();
    let alice = ws.join("alice@laptop", 1);
    alice.create_workspace().unwrap();
    alice.sync().await.unwrap();
    alice.create_folder(ws.root, "docs").unwrap();
    alice.sync().await.unwrap();

    alice.rename(ws.root, "docs", "papers").unwrap();
    let pending = alice.read_manifest(ws.root).unwrap();
    // The append reaches the remote but the confirmation is never recorded.
    alice
        .synchronizer()
        .remote()
        .append(&pending)
        .await
        .unwrap();

    let outcome = alice.sync_entry(ws.root).await.unwrap();
    assert!(outcome.pushed);
    assert_eq!(outcome.confirmed_version, pending.version);
    assert_eq!(ws.remote.latest_version(ws.root), pending.version);
    let entry = alice.synchronizer().cache().get_entry(ws.root).unwrap();
    assert!(!entry.has_pending());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn versions_only_move_forward_under_contention() {
    let ws = Workspace::new();
    let founder = ws.join("alice@laptop", 1);
    founder.create_workspace().unwrap();
    founder.sync().await.unwrap();

    let drives: Vec<Arc<Drive>> = [("bob@desktop", 2), ("carol@tablet", 3), ("dave@phone", 4)]
        .into_iter()
        .map(|(name, seed)| Arc::new(ws.join(name, seed)))
        .collect();

    let mut tasks = Vec::new();
    for (i, drive) in drives.iter().enumerate() {
        let drive = Arc::clone(drive);
        let root = ws.root;
        tasks.push(tokio::spawn(async move {
            drive.sync_tree().await;
            let mut events = drive.subscribe();
            for n in 0..5 {
                drive.create_folder(root, &format!("d{i}-{n}")).unwrap();
                loop {
                    match drive.sync_entry(root).await {
                        Ok(_) => break,
                        Err(e) if e.is_retryable() => continue,
                        Err(e) => panic!("sync failed: {e}"),
                    }
                }
            }
            let mut last = 0;
            while let Ok(event) = events.try_recv() {
                if let SyncEvent::Confirmed { entry_id, manifest } = event {
                    if entry_id == root {
                        assert!(manifest.version > last, "went back to v{}", manifest.version);
                        last = manifest.version;
                    }
                }
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    for drive in &drives {
        drive.sync_entry(ws.root).await.unwrap();
    }
    let expected = children(&drives[0], ws.root);
    assert_eq!(expected.len(), 15);
    for drive in &drives {
        assert_eq!(children(drive, ws.root), expected);
        assert_eq!(
            drive.read_manifest(ws.root).unwrap().version,
            ws.remote.latest_version(ws.root)
        );
    }
}

#[tokio::test]
async fn offline_edits_survive_restart_and_push_later() {
    let ws = Workspace::new();
    let dir = tempdir().unwrap();
    let path = dir.path().join("alice.journal");

    {
        let alice = ws.join_with_cache("alice@laptop", 1, open_cache(&path));
        alice.create_workspace().unwrap();
        alice.sync().await.unwrap();

        ws.remote.set_unavailable(true);
        let docs = alice.create_folder(ws.root, "docs").unwrap();
        alice.create_file(docs, "todo.txt", b"buy milk, fix sync").unwrap();
        let err = alice.sync_entry(ws.root).await.unwrap_err();
        assert!(err.is_retryable());
    }

    ws.remote.set_unavailable(false);
    let alice = ws.join_with_cache("alice@laptop", 1, open_cache(&path));
    let todo = alice.resolve_path("/docs/todo.txt").unwrap();
    assert!(alice.synchronizer().cache().pending_ids().len() >= 3);

    let report = alice.sync().await.unwrap();
    assert!(report.is_success(), "{:?}", report.failed);
    assert!(alice.synchronizer().cache().pending_ids().is_empty());
    assert!(alice.synchronizer().cache().dirty_blocks().is_empty());

    let bob = ws.join("bob@desktop", 2);
    assert!(bob.sync_tree().await.is_success());
    assert_eq!(
        bob.read_file(bob.resolve_path("/docs/todo.txt").unwrap())
            .await
            .unwrap(),
        b"buy milk, fix sync"
    );
    assert_eq!(bob.resolve_path("/docs/todo.txt").unwrap(), todo);
}

#[tokio::test]
async fn past_versions_stay_readable() {
    let ws = Workspace::new();
    let alice = ws.join("alice@laptop", 1);
    alice.create_workspace().unwrap();
    let file = alice.create_file(ws.root, "draft.md", b"first").unwrap();
    alice.sync().await.unwrap();
    alice.write_file(file, b"second").unwrap();
    alice.sync().await.unwrap();

    let v1 = alice.synchronizer().load_version(file, 1).await.unwrap();
    let v2 = alice.synchronizer().load_version(file, 2).await.unwrap();
    assert_eq!(v1.as_file().unwrap().size, 5);
    assert_eq!(v2.as_file().unwrap().size, 6);
    assert!(alice.synchronizer().load_version(file, 3).await.is_err());
}

#[tokio::test]
async fn fork_after_move_into_new_folder_keeps_both_edits() {
    let ws = Workspace::new();
    let alice = ws.join("alice@laptop", 1);
    let bob = ws.join("bob@desktop", 2);
    alice.create_workspace().unwrap();
    let file = alice.create_file(ws.root, "notes.txt", b"base").unwrap();
    alice.sync().await.unwrap();
    assert!(bob.sync_tree().await.is_success());

    alice.write_file(file, b"alice edit").unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let archive = bob.create_folder(ws.root, "archive").unwrap();
    bob.move_entry(file, archive, "notes.txt").unwrap();
    bob.write_file(file, b"bob edit").unwrap();
    let report = bob.sync().await.unwrap();
    assert!(report.is_success(), "{:?}", report.failed);

    // Alice has never seen `archive` when the fork is merged.
    let report = alice.sync().await.unwrap();
    assert!(report.is_success(), "{:?}", report.failed);
    settle(&[&alice, &bob]).await;

    for drive in [&alice, &bob] {
        assert_eq!(
            children(drive, ws.root),
            BTreeMap::from([("archive".to_string(), archive)])
        );
        let names = children(drive, archive);
        assert_eq!(names.len(), 2, "{names:?}");
        assert_eq!(names.get("notes.txt"), Some(&file));
        assert_eq!(drive.read_file(file).await.unwrap(), b"bob edit");

        let (name, sibling) = names.iter().find(|(_, id)| **id != file).unwrap();
        assert!(
            name.starts_with("notes.txt (conflict - alice@laptop - "),
            "{name}"
        );
        assert_eq!(drive.read_file(*sibling).await.unwrap(), b"alice edit");
        assert_eq!(drive.read_manifest(*sibling).unwrap().parent, Some(archive));
    }
}

#[tokio::test]
async fn concurrent_moves_settle_on_the_later_destination() {
    let ws = Workspace::new();
    let alice = ws.join("alice@laptop", 1);
    let bob = ws.join("bob@desktop", 2);
    alice.create_workspace().unwrap();
    let a = alice.create_folder(ws.root, "A").unwrap();
    let b = alice.create_folder(ws.root, "B").unwrap();
    let x = alice.create_folder(ws.root, "x").unwrap();
    alice.sync().await.unwrap();
    assert!(bob.sync_tree().await.is_success());

    alice.move_entry(x, a, "x").unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    bob.move_entry(x, b, "x").unwrap();

    alice.sync().await.unwrap();
    bob.sync().await.unwrap();
    settle(&[&alice, &bob]).await;

    for drive in [&alice, &bob] {
        assert_eq!(
            children(drive, ws.root),
            BTreeMap::from([("A".to_string(), a), ("B".to_string(), b)])
        );
        assert!(children(drive, a).is_empty());
        assert_eq!(children(drive, b), BTreeMap::from([("x".to_string(), x)]));
        assert_eq!(drive.read_manifest(x).unwrap().parent, Some(b));
    }
    assert_eq!(alice.read_manifest(a), bob.read_manifest(a));
    assert_eq!(alice.read_manifest(x), bob.read_manifest(x));
}

#[tokio::test]
async fn edit_survives_concurrent_delete() {
    let ws = Workspace::new();
    let alice = ws.join("alice@laptop", 1);
    let bob = ws.join("bob@desktop", 2);
    alice.create_workspace().unwrap();
    let doc = alice.create_file(ws.root, "doc.txt", b"draft").unwrap();
    alice.sync().await.unwrap();
    assert!(bob.sync_tree().await.is_success());

    assert_eq!(alice.delete(ws.root, "doc.txt").unwrap(), doc);
    alice.sync().await.unwrap();

    bob.write_file(doc, b"final text").unwrap();
    let extra = bob.create_folder(ws.root, "extra").unwrap();
    let mut events = bob.subscribe();
    let report = bob.sync().await.unwrap();
    assert!(report.is_success(), "{:?}", report.failed);
    let mut kept = false;
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::Conflict(record) = event {
            kept |= record.entry_id == ws.root
                && record.resolutions.contains(&Resolution::KeptEditedChild {
                    name: "doc.txt".to_string(),
                    entry_id: doc,
                });
        }
    }
    assert!(kept);
    settle(&[&alice, &bob]).await;

    let expected = BTreeMap::from([
        ("doc.txt".to_string(), doc),
        ("extra".to_string(), extra),
    ]);
    for drive in [&alice, &bob] {
        assert_eq!(children(drive, ws.root), expected);
        assert_eq!(drive.read_file(doc).await.unwrap(), b"final text");
    }
}
