//! The drive: path-level operations over the synchronized tree.
//!
//! Every mutation is staged in the local cache first and returns without
//! touching the network. A background worker (see
//! [`Drive::spawn_worker`]) or an explicit [`Drive::sync`] pushes it.

use crate::edit::{update_entry, update_folder};
use crate::engine::Synchronizer;
use crate::error::{SyncError, SyncResult};
use crate::events::SyncEvent;
use crate::state::{SyncOutcome, SyncReport};
use parking_lot::Mutex;
use sealdrive_core::{
    open_block, validate_name, Chunker, CoreError, EntryId, FileManifest, FolderManifest,
    LocalCache, Manifest, ManifestContent, Timestamp, Version,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Interval;
use tracing::{debug, info, warn};

/// Shortest wait before the worker retries an entry.
const MIN_REQUEUE_DELAY: Duration = Duration::from_millis(10);

struct Worker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<mpsc::UnboundedReceiver<EntryId>>,
}

/// A synchronized tree rooted at one folder.
pub struct Drive {
    root: EntryId,
    sync: Arc<Synchronizer>,
    chunker: Chunker,
    notify: mpsc::UnboundedSender<EntryId>,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<EntryId>>>,
    worker: Mutex<Option<Worker>>,
}

impl Drive {
    /// Opens the drive rooted at `root`.
    ///
    /// # Errors
    ///
    /// Fails if the configured block size is zero.
    pub fn new(sync: Arc<Synchronizer>, root: EntryId) -> SyncResult<Self> {
        let chunker = Chunker::new(sync.config().block_size)?;
        let (notify, inbox) = mpsc::unbounded_channel();
        Ok(Self {
            root,
            sync,
            chunker,
            notify,
            inbox: Mutex::new(Some(inbox)),
            worker: Mutex::new(None),
        })
    }

    /// Stages a new, empty root folder unless one is known already.
    /// Returns true if it was created.
    pub fn create_workspace(&self) -> SyncResult<bool> {
        if self.cache().get_entry(self.root).is_some() {
            return Ok(false);
        }
        let root = Manifest::new(
            self.root,
            None,
            ManifestContent::Folder(FolderManifest::new()),
            self.sync.credentials().author().clone(),
            Timestamp::now(),
        );
        self.cache().stage_edit(self.root, 0, root)?;
        info!(root = %self.root, "created workspace");
        self.notify(self.root);
        Ok(true)
    }

    /// The root folder.
    pub fn root(&self) -> EntryId {
        self.root
    }

    /// The synchronizer behind this drive.
    pub fn synchronizer(&self) -> &Arc<Synchronizer> {
        &self.sync
    }

    /// Subscribes to sync events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sync.subscribe()
    }

    /// The current state of an entry as the local user sees it.
    pub fn read_manifest(&self, id: EntryId) -> Option<Manifest> {
        self.cache().read_manifest(id)
    }

    /// Stages a new version of `id` on top of `base_version`.
    ///
    /// # Errors
    ///
    /// Returns a stale-base cache error if `base_version` is no longer
    /// the confirmed version; re-read and try again.
    pub fn propose_edit(
        &self,
        id: EntryId,
        base_version: Version,
        parent: Option<EntryId>,
        content: ManifestContent,
    ) -> SyncResult<Manifest> {
        let version = base_version.checked_add(1).ok_or_else(|| {
            CoreError::invalid_operation(format!("no version after v{base_version} of {id}"))
        })?;
        let manifest = Manifest {
            entry_id: id,
            version,
            author: self.sync.credentials().author().clone(),
            timestamp: Timestamp::now(),
            parent,
            content,
        };
        manifest.validate()?;
        self.cache().stage_edit(id, base_version, manifest.clone())?;
        self.notify(id);
        Ok(manifest)
    }

    /// Resolves a `/`-separated path from the root.
    pub fn resolve_path(&self, path: &str) -> SyncResult<EntryId> {
        path.split('/')
            .filter(|segment| !segment.is_empty())
            .try_fold(self.root, |current, segment| {
                self.read_manifest(current)
                    .and_then(|m| m.as_folder().and_then(|f| f.get(segment)))
                    .ok_or_else(|| SyncError::InvalidPath(path.to_string()))
            })
    }

    /// Lists a folder, sorted by name.
    pub fn list(&self, folder: EntryId) -> SyncResult<Vec<(String, EntryId)>> {
        let manifest = self.read_manifest(folder).ok_or(SyncError::NotFound(folder))?;
        let folder_content = manifest.as_folder().ok_or(SyncError::NotAFolder(folder))?;
        Ok(folder_content
            .children
            .iter()
            .map(|(name, id)| (name.clone(), *id))
            .collect())
    }

    /// Creates an empty folder under `parent`.
    pub fn create_folder(&self, parent: EntryId, name: &str) -> SyncResult<EntryId> {
        self.create_child(
            parent,
            name,
            ManifestContent::Folder(FolderManifest::new()),
        )
    }

    /// Creates a file under `parent` holding `data`.
    pub fn create_file(&self, parent: EntryId, name: &str, data: &[u8]) -> SyncResult<EntryId> {
        let content = self.store_content(data)?;
        self.create_child(parent, name, ManifestContent::File(content))
    }

    /// Replaces the content of a file.
    pub fn write_file(&self, id: EntryId, data: &[u8]) -> SyncResult<()> {
        let content = self.store_content(data)?;
        update_entry(self.cache(), self.sync.credentials().author(), id, |current| {
            if current.as_file().is_none() {
                return Err(SyncError::NotAFile(id));
            }
            Ok((current.parent, ManifestContent::File(content.clone()), ()))
        })?;
        debug!(entry = %id, size = data.len(), "staged file write");
        self.notify(id);
        Ok(())
    }

    /// Reads a file, fetching missing blocks from the remote.
    pub async fn read_file(&self, id: EntryId) -> SyncResult<Vec<u8>> {
        let manifest = self.read_manifest(id).ok_or(SyncError::NotFound(id))?;
        let file = manifest.as_file().ok_or(SyncError::NotAFile(id))?;
        let key = self.sync.credentials().workspace_key();

        let mut data = Vec::with_capacity(usize::try_from(file.size).unwrap_or(0));
        for block in &file.blocks {
            let plaintext = match self.cache().get_block(block.id) {
                Some(sealed) => open_block(block, &sealed, key)?,
                None => {
                    let sealed = self.sync.remote().fetch_block(block.id).await?;
                    let plaintext = open_block(block, &sealed, key)?;
                    self.cache().put_clean_block(block.id, sealed)?;
                    plaintext
                }
            };
            data.extend_from_slice(&plaintext);
        }
        Ok(data)
    }

    /// Renames a child of `parent`.
    pub fn rename(&self, parent: EntryId, from: &str, to: &str) -> SyncResult<()> {
        validate_name(to)?;
        update_folder(self.cache(), self.sync.credentials().author(), parent, |folder| {
            Ok((folder.renamed(from, to)?, ()))
        })?;
        info!(folder = %parent, from, to, "renamed");
        self.notify(parent);
        Ok(())
    }

    /// Moves `id` into `destination` under `name`.
    pub fn move_entry(&self, id: EntryId, destination: EntryId, name: &str) -> SyncResult<()> {
        validate_name(name)?;
        let current = self.read_manifest(id).ok_or(SyncError::NotFound(id))?;
        let source = current.parent.ok_or_else(|| {
            CoreError::invalid_operation(format!("cannot move root folder {id}"))
        })?;
        if self.is_ancestor_or_self(id, destination) {
            return Err(CoreError::invalid_operation(format!(
                "cannot move {id} into its own subtree"
            ))
            .into());
        }
        let author = self.sync.credentials().author();

        if source == destination {
            update_folder(self.cache(), author, source, |folder| {
                let old = folder.name_of(id).ok_or(SyncError::NotFound(id))?;
                Ok((folder.renamed(old, name)?, ()))
            })?;
            self.notify(source);
            return Ok(());
        }

        // Linked in the destination before it leaves the source.
        update_folder(self.cache(), author, destination, |folder| {
            Ok((folder.with_child(name, id)?, ()))
        })?;
        update_entry(self.cache(), author, id, |current| {
            Ok((Some(destination), current.content.clone(), ()))
        })?;
        update_folder(self.cache(), author, source, |folder| match folder.name_of(id) {
            Some(old) => Ok((folder.without_child(old)?.0, ())),
            None => Ok((folder.clone(), ())),
        })?;

        info!(entry = %id, from = %source, to = %destination, name, "moved");
        self.notify(id);
        self.notify(destination);
        self.notify(source);
        Ok(())
    }

    /// Unlinks `name` from `parent`, leaving a tombstone. Returns the
    /// removed entry.
    pub fn delete(&self, parent: EntryId, name: &str) -> SyncResult<EntryId> {
        let (_, removed) =
            update_folder(self.cache(), self.sync.credentials().author(), parent, |folder| {
                folder.without_child(name).map_err(SyncError::from)
            })?;
        info!(folder = %parent, name, entry = %removed, "deleted");
        self.notify(parent);
        Ok(removed)
    }

    /// Synchronizes one entry now.
    pub async fn sync_entry(&self, id: EntryId) -> SyncResult<SyncOutcome> {
        self.sync.sync_entry(id).await
    }

    /// Synchronizes everything now.
    pub async fn sync(&self) -> SyncResult<SyncReport> {
        self.sync.full_sync().await
    }

    /// Synchronizes the whole tree from the root, fetching what is not
    /// known locally yet.
    pub async fn sync_tree(&self) -> SyncReport {
        self.sync.sync_tree(self.root).await
    }

    /// Starts syncing in the background: entries are pushed as they are
    /// edited, and a full sync runs every configured interval. Entries
    /// that fail while the remote is unreachable are retried with backoff.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::WorkerStopped`] if a worker is already running.
    pub fn spawn_worker(&self) -> SyncResult<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Err(SyncError::WorkerStopped);
        }
        let mut inbox = self.inbox.lock().take().ok_or(SyncError::WorkerStopped)?;
        let (shutdown, mut stop) = watch::channel(false);
        let sync = Arc::clone(&self.sync);
        let requeue = self.notify.clone();
        let mut failures: HashMap<EntryId, u32> = HashMap::new();
        let mut ticker = sync
            .config()
            .sync_interval
            .filter(|period| !period.is_zero())
            .map(tokio::time::interval);

        let handle = tokio::spawn(async move {
            info!("sync worker started");
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    Some(first) = inbox.recv() => {
                        let mut due = BTreeSet::from([first]);
                        while let Ok(next) = inbox.try_recv() {
                            due.insert(next);
                        }
                        for id in due {
                            match sync.sync_entry(id).await {
                                Ok(_) => {
                                    failures.remove(&id);
                                }
                                Err(e) if e.is_retryable() => {
                                    let attempt = failures.entry(id).or_insert(0);
                                    *attempt = attempt.saturating_add(1);
                                    let delay = sync
                                        .config()
                                        .retry
                                        .delay_for_attempt(*attempt)
                                        .max(MIN_REQUEUE_DELAY);
                                    warn!(
                                        entry = %id,
                                        error = %e,
                                        attempt = *attempt,
                                        retry_in = ?delay,
                                        "background sync failed, will retry"
                                    );
                                    requeue_after(requeue.clone(), id, delay);
                                }
                                Err(e) => {
                                    failures.remove(&id);
                                    warn!(entry = %id, error = %e, "background sync failed");
                                }
                            }
                        }
                    }
                    () = tick(&mut ticker) => {
                        match sync.full_sync().await {
                            Ok(report) if !report.is_success() => {
                                warn!(failed = report.failed.len(), "background full sync incomplete");
                            }
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "background full sync failed"),
                        }
                    }
                }
            }
            info!("sync worker stopped");
            inbox
        });

        *worker = Some(Worker { shutdown, handle });
        Ok(())
    }

    /// Stops the background worker, waiting up to `timeout` for the
    /// current sync to finish.
    pub async fn shutdown(&self, timeout: Duration) -> SyncResult<()> {
        let worker = self.worker.lock().take().ok_or(SyncError::WorkerStopped)?;
        let _ = worker.shutdown.send(true);
        match tokio::time::timeout(timeout, worker.handle).await {
            Ok(Ok(inbox)) => {
                *self.inbox.lock() = Some(inbox);
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(error = %e, "sync worker panicked");
                Err(SyncError::WorkerStopped)
            }
            Err(_) => {
                warn!("sync worker did not stop in time");
                Err(SyncError::WorkerStopped)
            }
        }
    }

    fn cache(&self) -> &LocalCache {
        self.sync.cache()
    }

    fn notify(&self, id: EntryId) {
        // Only fails once the drive is gone.
        let _ = self.notify.send(id);
    }

    fn create_child(
        &self,
        parent: EntryId,
        name: &str,
        content: ManifestContent,
    ) -> SyncResult<EntryId> {
        validate_name(name)?;
        let folder = self.read_manifest(parent).ok_or(SyncError::NotFound(parent))?;
        let existing = folder.as_folder().ok_or(SyncError::NotAFolder(parent))?;
        if existing.get(name).is_some() {
            return Err(CoreError::invalid_operation(format!("name already exists: {name}")).into());
        }

        let id = EntryId::new();
        let author = self.sync.credentials().author().clone();
        let manifest = Manifest::new(id, Some(parent), content, author.clone(), Timestamp::now());
        // The child exists before the folder names it.
        self.cache().stage_edit(id, 0, manifest)?;
        update_folder(self.cache(), &author, parent, |folder| {
            Ok((folder.with_child(name, id)?, ()))
        })?;

        info!(entry = %id, folder = %parent, name, "created");
        self.notify(parent);
        Ok(id)
    }

    /// Chunks and seals `data`, storing the blocks as dirty.
    fn store_content(&self, data: &[u8]) -> SyncResult<FileManifest> {
        let (content, blocks) = self
            .chunker
            .split(data, self.sync.credentials().workspace_key())?;
        for block in blocks {
            self.cache().put_dirty_block(block.id, block.data)?;
        }
        Ok(content)
    }

    fn is_ancestor_or_self(&self, ancestor: EntryId, mut id: EntryId) -> bool {
        for _ in 0..256 {
            if id == ancestor {
                return true;
            }
            match self.read_manifest(id).and_then(|m| m.parent) {
                Some(parent) => id = parent,
                None => return false,
            }
        }
        false
    }
}

impl std::fmt::Debug for Drive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Drive")
            .field("root", &self.root)
            .field("worker_running", &self.worker.lock().is_some())
            .finish_non_exhaustive()
    }
}

fn requeue_after(notify: mpsc::UnboundedSender<EntryId>, id: EntryId, delay: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = notify.send(id);
    });
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
