//! The synchronizer: pull, verify, merge and push, one entry at a time.
//!
//! Each entry goes through [`SyncState`]s under its own async lock, so
//! one entry never has two syncs in flight while different entries sync
//! in parallel up to [`SyncConfig::max_concurrent_syncs`].
//!
//! Ordering rules kept here:
//! - a placeholder child is pushed before any folder version linking it,
//! - dirty blocks are uploaded before the file version referencing them,
//! - the local pending edit is replaced only through compare-and-swap.

use crate::config::SyncConfig;
use crate::edit::{unique_name, update_folder};
use crate::error::{RemoteError, SyncError, SyncResult};
use crate::events::{EventBus, SyncEvent};
use crate::keys::Credentials;
use crate::remote::RemoteHistoryClient;
use crate::state::{SyncOutcome, SyncReport, SyncState, SyncStats};
use parking_lot::{Mutex, RwLock};
use sealdrive_core::{
    merge, CacheError, ConflictRecord, EntryId, LocalCache, Manifest, ManifestContent,
    MergeContext, PreservedContent, Timestamp, Version, VersionedEntry,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Deepest parent chain followed when ordering entries.
const MAX_DEPTH: usize = 256;

/// Rounds of fetching entries referenced but not yet known locally.
const MAX_DISCOVERY_ROUNDS: usize = 64;

type BoxedSync<'a> = Pin<Box<dyn Future<Output = SyncResult<SyncOutcome>> + Send + 'a>>;
type BoxedReport = Pin<Box<dyn Future<Output = SyncReport> + Send>>;

/// A preserved sibling staged during a merge.
struct Sibling {
    id: EntryId,
    folder: EntryId,
    name: String,
    manifest: Manifest,
}

/// What to do after integrating the pulled versions.
enum Step {
    /// Push this pending version.
    Push(Manifest),
    /// Nothing left to push.
    Done,
    /// Local state moved meanwhile; pull again.
    Again,
}

/// Synchronizes local entries with the remote history.
pub struct Synchronizer {
    config: SyncConfig,
    cache: Arc<LocalCache>,
    remote: RemoteHistoryClient,
    events: EventBus,
    states: RwLock<HashMap<EntryId, SyncState>>,
    locks: Mutex<HashMap<EntryId, Arc<tokio::sync::Mutex<()>>>>,
    limiter: Semaphore,
    cancelled: AtomicBool,
    stats: RwLock<SyncStats>,
}

impl Synchronizer {
    /// Creates a synchronizer over a local cache and a remote.
    pub fn new(config: SyncConfig, cache: Arc<LocalCache>, remote: RemoteHistoryClient) -> Self {
        let events = EventBus::new(config.event_capacity);
        let limiter = Semaphore::new(config.max_concurrent_syncs.max(1));
        Self {
            config,
            cache,
            remote,
            events,
            states: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            limiter,
            cancelled: AtomicBool::new(false),
            stats: RwLock::new(SyncStats::default()),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Returns the local cache.
    pub fn cache(&self) -> &Arc<LocalCache> {
        &self.cache
    }

    /// Returns the local credentials.
    pub fn credentials(&self) -> &Credentials {
        self.remote.credentials()
    }

    /// Returns the remote client.
    pub fn remote(&self) -> &RemoteHistoryClient {
        &self.remote
    }

    /// Subscribes to sync events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Returns the state of one entry.
    pub fn state(&self, id: EntryId) -> SyncState {
        self.states.read().get(&id).copied().unwrap_or_default()
    }

    /// Entries blocked after a security incident.
    pub fn blocked(&self) -> Vec<EntryId> {
        let mut ids: Vec<_> = self
            .states
            .read()
            .iter()
            .filter(|(_, s)| **s == SyncState::Blocked)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Lifts a block set after a security incident. Returns false if the
    /// entry was not blocked.
    pub fn unblock(&self, id: EntryId) -> bool {
        let mut states = self.states.write();
        if states.get(&id) == Some(&SyncState::Blocked) {
            states.remove(&id);
            warn!(target: "sealdrive::security", entry = %id, "entry unblocked by operator");
            true
        } else {
            false
        }
    }

    /// Returns sync statistics.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Cancels in-flight syncs at their next checkpoint.
    pub fn cancel(&self) {
        info!("sync cancelled");
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Allows syncs to run again after [`cancel`](Self::cancel).
    pub fn reset_cancel(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    /// Returns true if cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Fetches and verifies a historical version, without caching it.
    pub async fn load_version(&self, id: EntryId, version: Version) -> SyncResult<Manifest> {
        let result = self
            .with_retry(Some(id), || self.remote.fetch_at(id, version))
            .await;
        if let Err(e) = &result {
            self.note_failure(e);
        }
        result
    }

    /// Synchronizes one entry: pulls and verifies newer remote versions,
    /// merges them with any local edit, and pushes the result.
    ///
    /// Returns [`SyncError::Blocked`] without touching the remote if the
    /// entry is blocked.
    pub async fn sync_entry(&self, id: EntryId) -> SyncResult<SyncOutcome> {
        let lock = self.entry_lock(id);
        let _guard = lock.lock().await;

        if self.state(id) == SyncState::Blocked {
            return Err(SyncError::Blocked(id));
        }

        let result = self.run(id).await;
        self.set_state(id, SyncState::Idle);
        match &result {
            Ok(outcome) => {
                let mut stats = self.stats.write();
                stats.syncs_completed += 1;
                stats.last_sync_time = Some(Instant::now());
                debug!(entry = %id, version = outcome.confirmed_version, "sync done");
            }
            Err(e) => {
                warn!(entry = %id, error = %e, "sync failed");
                self.note_failure(e);
            }
        }
        result
    }

    /// Synchronizes `root` and everything below it, parents first.
    pub async fn sync_tree(self: &Arc<Self>, root: EntryId) -> SyncReport {
        let visited = Arc::new(Mutex::new(HashSet::new()));
        Arc::clone(self).sync_subtree(root, visited).await
    }

    /// Synchronizes every entry that changed remotely or has a local
    /// edit, then fetches entries referenced by folders but not yet known.
    pub async fn full_sync(self: &Arc<Self>) -> SyncResult<SyncReport> {
        self.check_cancelled()?;
        let known = self.cache.confirmed_versions();
        let changed = self
            .with_retry(None, || self.remote.check_versions(&known))
            .await?;

        let mut ids: BTreeSet<EntryId> = changed.into_iter().collect();
        ids.extend(self.cache.pending_ids());
        let mut tried: HashSet<EntryId> = ids.iter().copied().collect();
        info!(entries = ids.len(), "full sync");

        let mut report = self.sync_in_depth_order(ids).await;

        for _ in 0..MAX_DISCOVERY_ROUNDS {
            let missing: BTreeSet<_> = self
                .missing_children()
                .into_iter()
                .filter(|id| tried.insert(*id))
                .collect();
            if missing.is_empty() {
                break;
            }
            debug!(entries = missing.len(), "fetching newly referenced entries");
            report.absorb(self.sync_in_depth_order(missing).await);
        }

        info!(
            synced = report.synced.len(),
            failed = report.failed.len(),
            "full sync done"
        );
        Ok(report)
    }

    fn sync_boxed(&self, id: EntryId) -> BoxedSync<'_> {
        Box::pin(self.sync_entry(id))
    }

    fn sync_subtree(
        self: Arc<Self>,
        id: EntryId,
        visited: Arc<Mutex<HashSet<EntryId>>>,
    ) -> BoxedReport {
        Box::pin(async move {
            let mut report = SyncReport::default();
            if !visited.lock().insert(id) {
                return report;
            }

            let result = self.sync_limited(id).await;
            let synced = result.is_ok();
            report.record(id, result);
            if !synced {
                return report;
            }

            let children: Vec<EntryId> = self
                .cache
                .read_manifest(id)
                .and_then(|m| m.as_folder().map(|f| f.children.values().copied().collect()))
                .unwrap_or_default();

            let mut tasks = JoinSet::new();
            for child in children {
                tasks.spawn(Arc::clone(&self).sync_subtree(child, Arc::clone(&visited)));
            }
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(sub) => report.absorb(sub),
                    Err(e) => error!(error = %e, "sync task failed"),
                }
            }
            report
        })
    }

    async fn sync_limited(&self, id: EntryId) -> SyncResult<SyncOutcome> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| SyncError::Cancelled)?;
        self.sync_entry(id).await
    }

    async fn sync_in_depth_order(self: &Arc<Self>, ids: BTreeSet<EntryId>) -> SyncReport {
        let mut levels: BTreeMap<usize, Vec<EntryId>> = BTreeMap::new();
        for id in ids {
            levels.entry(self.depth(id)).or_default().push(id);
        }

        let mut report = SyncReport::default();
        for (_, level) in levels {
            let mut tasks = JoinSet::new();
            for id in level {
                let this = Arc::clone(self);
                tasks.spawn(async move { (id, this.sync_limited(id).await) });
            }
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((id, result)) => report.record(id, result),
                    Err(e) => error!(error = %e, "sync task failed"),
                }
            }
        }
        report
    }

    /// Number of known ancestors; unknown entries sort last.
    fn depth(&self, id: EntryId) -> usize {
        let mut depth = 0;
        let mut current = match self.cache.read_manifest(id) {
            Some(m) => m.parent,
            None => return MAX_DEPTH,
        };
        while let Some(parent) = current {
            depth += 1;
            if depth >= MAX_DEPTH {
                break;
            }
            current = self.cache.read_manifest(parent).and_then(|m| m.parent);
        }
        depth
    }

    fn missing_children(&self) -> Vec<EntryId> {
        let mut missing = BTreeSet::new();
        for id in self.cache.entry_ids() {
            if let Some(folder) = self.cache.read_manifest(id).and_then(|m| match m.content {
                ManifestContent::Folder(f) => Some(f),
                ManifestContent::File(_) => None,
            }) {
                missing.extend(
                    folder
                        .children
                        .into_values()
                        .filter(|child| self.cache.get_entry(*child).is_none()),
                );
            }
        }
        missing.into_iter().collect()
    }

    async fn run(&self, id: EntryId) -> SyncResult<SyncOutcome> {
        let mut outcome = SyncOutcome::new(id);
        let mut rounds = 0u32;

        loop {
            self.check_cancelled()?;
            self.set_state(id, SyncState::Pulling);
            let entry = self.cache.get_entry(id);
            let chain = self
                .with_retry(Some(id), || self.pull(id, entry.as_ref()))
                .await?;

            self.check_cancelled()?;
            self.set_state(id, SyncState::Merging);
            let pending = match self.integrate(id, chain, &mut outcome).await? {
                Step::Push(pending) => pending,
                Step::Done => break,
                Step::Again => continue,
            };

            self.check_cancelled()?;
            self.set_state(id, SyncState::Pushing);
            self.prepare_push(id, &pending).await?;

            match self
                .with_retry(Some(id), || self.remote.append(&pending))
                .await
            {
                Ok(()) => {
                    let cleared = self.cache.mark_confirmed(id, pending.clone())?;
                    self.stats.write().versions_pushed += 1;
                    outcome.pushed = true;
                    self.confirmed(pending);
                    if cleared {
                        break;
                    }
                    debug!(entry = %id, "newer local edit staged during push");
                }
                Err(SyncError::Remote(RemoteError::VersionConflict { actual_latest, .. })) => {
                    rounds += 1;
                    self.stats.write().lost_races += 1;
                    debug!(
                        entry = %id,
                        attempted = pending.version,
                        remote = actual_latest,
                        rounds,
                        "lost append race"
                    );
                    if rounds >= self.config.max_merge_rounds {
                        return Err(SyncError::MergeRoundsExhausted {
                            entry_id: id,
                            rounds,
                        });
                    }
                    self.set_state(id, SyncState::Retrying);
                }
                Err(e) => return Err(e),
            }
        }

        outcome.confirmed_version = self.cache.confirmed_version(id);
        Ok(outcome)
    }

    /// Fetches and verifies every remote version newer than the confirmed
    /// one, oldest first.
    async fn pull(&self, id: EntryId, entry: Option<&VersionedEntry>) -> SyncResult<Vec<Manifest>> {
        let local = entry.map_or(0, VersionedEntry::confirmed_version);

        let Some(latest) = self.remote.fetch_latest(id).await? else {
            if local > 0 {
                return Err(SyncError::RemoteRegressed {
                    entry_id: id,
                    local,
                    remote: 0,
                });
            }
            return Ok(Vec::new());
        };

        if latest.version < local {
            return Err(SyncError::RemoteRegressed {
                entry_id: id,
                local,
                remote: latest.version,
            });
        }
        if latest.version == local {
            if entry.and_then(|e| e.confirmed.as_ref()) != Some(&latest) {
                return Err(SyncError::HistoryDiverged {
                    entry_id: id,
                    version: local,
                });
            }
            return Ok(Vec::new());
        }

        // First sight of an entry: its latest version is enough.
        if entry.is_none() {
            return Ok(vec![latest]);
        }

        let mut chain = Vec::new();
        for version in local + 1..latest.version {
            self.check_cancelled()?;
            chain.push(self.remote.fetch_at(id, version).await?);
        }
        chain.push(latest);
        Ok(chain)
    }

    async fn integrate(
        &self,
        id: EntryId,
        chain: Vec<Manifest>,
        outcome: &mut SyncOutcome,
    ) -> SyncResult<Step> {
        let Some(entry) = self.cache.get_entry(id) else {
            if chain.is_empty() {
                return Err(SyncError::NotFound(id));
            }
            return self.adopt(id, chain, outcome);
        };

        let Some(pending) = entry.pending.clone() else {
            return self.adopt(id, chain, outcome);
        };

        if chain.is_empty() {
            return Ok(Step::Push(pending));
        }
        if chain.first() == Some(&pending) {
            // An earlier push landed without being recorded.
            info!(entry = %id, version = pending.version, "found own version on remote");
            self.cache.mark_confirmed(id, pending.clone())?;
            self.stats.write().versions_pushed += 1;
            outcome.pushed = true;
            self.confirmed(pending);
            return Ok(Step::Again);
        }
        self.merge_into(id, &entry, pending, chain, outcome).await
    }

    fn adopt(
        &self,
        id: EntryId,
        chain: Vec<Manifest>,
        outcome: &mut SyncOutcome,
    ) -> SyncResult<Step> {
        for manifest in chain {
            match self.cache.adopt_remote(id, manifest.clone()) {
                Ok(()) => {}
                // A local edit raced in; merge it on the next round.
                Err(CacheError::PendingExists(_)) => return Ok(Step::Again),
                Err(e) => return Err(e.into()),
            }
            self.stats.write().versions_pulled += 1;
            outcome.pulled += 1;
            self.confirmed(manifest);
        }
        Ok(Step::Done)
    }

    async fn merge_into(
        &self,
        id: EntryId,
        entry: &VersionedEntry,
        pending: Manifest,
        chain: Vec<Manifest>,
        outcome: &mut SyncOutcome,
    ) -> SyncResult<Step> {
        let Some(remote) = chain.last().cloned() else {
            return Ok(Step::Push(pending));
        };
        let base = entry.confirmed.as_ref();
        let ctx = self.merge_context(id, base, &pending, &remote).await?;
        let merged = merge(base, &pending, &remote, &ctx);

        let author = self.credentials().author().clone();
        let next = remote.successor(
            merged.parent,
            merged.content.clone(),
            author,
            Timestamp::now(),
        )?;
        let next = (!next.same_state(&remote)).then_some(next);

        // The losing content is linked before the merge drops the pending edit.
        let preserved = match &merged.preserved {
            Some(content) => {
                let homes = [merged.parent, pending.parent, base.and_then(|m| m.parent)];
                Some(self.preserve(id, &homes, content).await?)
            }
            None => None,
        };

        if let Err(e) = self.cache.apply_merge(id, &pending, &chain, next.clone()) {
            if let Some(sibling) = &preserved {
                self.withdraw(sibling)?;
            }
            return match e {
                CacheError::PendingChanged(_) => Ok(Step::Again),
                e => Err(e.into()),
            };
        }
        {
            let mut stats = self.stats.write();
            stats.versions_pulled += chain.len() as u64;
        }
        outcome.pulled += chain.len() as u64;
        for manifest in chain {
            self.confirmed(manifest);
        }

        let base_parent = base.map(|m| m.parent);
        self.unlink_lost_moves(id, base_parent, &[pending.parent, remote.parent], merged.parent)?;

        let preserved_as = preserved.map(|sibling| (sibling.name, sibling.id));

        if !merged.is_clean() {
            let mut record = ConflictRecord::new(
                entry.confirmed_version(),
                pending,
                remote,
                merged.resolutions,
            );
            record.preserved_as = preserved_as;
            info!(
                entry = %id,
                base = record.base_version,
                decisions = record.resolutions.len(),
                forked = record.is_content_fork(),
                "merged concurrent edits"
            );
            self.stats.write().conflicts += 1;
            outcome.conflicts += 1;
            self.events.emit(SyncEvent::Conflict(record));
        }

        Ok(match next {
            Some(next) => Step::Push(next),
            None => Step::Done,
        })
    }

    /// Children deleted by one side of a folder merge that were changed
    /// elsewhere while staying in the folder.
    async fn merge_context(
        &self,
        folder_id: EntryId,
        base: Option<&Manifest>,
        local: &Manifest,
        remote: &Manifest,
    ) -> SyncResult<MergeContext> {
        let mut ctx = MergeContext::new();
        let (Some(base), Some(local_f), Some(remote_f)) = (
            base.and_then(Manifest::as_folder),
            local.as_folder(),
            remote.as_folder(),
        ) else {
            return Ok(ctx);
        };

        let candidates = base.children.values().copied().filter(|child| {
            local_f.name_of(*child).is_none() != remote_f.name_of(*child).is_none()
        });

        for child in candidates {
            let Some(known) = self.cache.get_entry(child) else {
                continue;
            };
            if let Some(pending) = &known.pending {
                if pending.parent == Some(folder_id) {
                    ctx.mark_edited(child);
                }
                continue;
            }
            let latest = self
                .with_retry(Some(folder_id), || self.remote.fetch_latest(child))
                .await
                .map_err(|e| SyncError::DependencyFailed {
                    entry_id: folder_id,
                    child,
                    source: Box::new(e),
                })?;
            if let Some(latest) = latest {
                if latest.version != known.confirmed_version() && latest.parent == Some(folder_id)
                {
                    ctx.mark_edited(child);
                }
            }
        }
        Ok(ctx)
    }

    /// After concurrent moves of `id`, removes it from the destination that
    /// lost.
    fn unlink_lost_moves(
        &self,
        id: EntryId,
        base_parent: Option<Option<EntryId>>,
        sides: &[Option<EntryId>],
        kept: Option<EntryId>,
    ) -> SyncResult<()> {
        let losers: BTreeSet<EntryId> = sides
            .iter()
            .filter(|side| Some(**side) != base_parent && **side != kept)
            .filter_map(|side| *side)
            .collect();

        for folder in losers {
            let linked = self
                .cache
                .read_manifest(folder)
                .and_then(|m| m.as_folder().map(|f| f.name_of(id).is_some()));
            if linked != Some(true) {
                debug!(entry = %id, folder = %folder, "losing move destination not linked locally");
                continue;
            }
            update_folder(&self.cache, self.credentials().author(), folder, |f| {
                match f.name_of(id) {
                    Some(name) => Ok((f.without_child(name)?.0, ())),
                    None => Ok((f.clone(), ())),
                }
            })?;
            info!(entry = %id, folder = %folder, "unlinked from losing move destination");
        }
        Ok(())
    }

    /// Stages the losing side of a file fork as a new sibling and links
    /// it into the first folder of `homes` known locally.
    ///
    /// A winning parent not known yet is fetched first, so the sibling
    /// lands next to the file.
    async fn preserve(
        &self,
        file_id: EntryId,
        homes: &[Option<EntryId>],
        preserved: &PreservedContent,
    ) -> SyncResult<Sibling> {
        let homes: Vec<EntryId> = homes.iter().flatten().copied().collect();
        if let Some(&wanted) = homes.first() {
            if self.cache.get_entry(wanted).is_none() {
                if let Err(e) = self.sync_boxed(wanted).await {
                    warn!(
                        entry = %file_id,
                        folder = %wanted,
                        error = %e,
                        "parent of forked file unavailable"
                    );
                }
            }
        }

        let known = |folder: &EntryId| {
            self.cache
                .read_manifest(*folder)
                .and_then(|m| m.as_folder().cloned())
        };
        let Some((folder_id, _)) = homes
            .iter()
            .find_map(|folder| known(folder).map(|f| (*folder, f)))
        else {
            return Err(SyncError::NotFound(homes.first().copied().unwrap_or(file_id)));
        };
        let original = homes
            .iter()
            .find_map(|folder| {
                known(folder).and_then(|f| f.name_of(file_id).map(str::to_string))
            })
            .unwrap_or_else(|| "recovered".to_string());

        let author = self.credentials().author().clone();
        let sibling_id = EntryId::new();
        let manifest = Manifest::new(
            sibling_id,
            Some(folder_id),
            ManifestContent::File(preserved.content.clone()),
            author.clone(),
            Timestamp::now(),
        );
        // The sibling exists before any folder version names it.
        self.cache.stage_edit(sibling_id, 0, manifest.clone())?;

        let wanted = preserved.sibling_name(&original);
        let linked = update_folder(&self.cache, &author, folder_id, |folder| {
            let name = unique_name(folder, &wanted);
            Ok((folder.with_child(&name, sibling_id)?, name))
        });
        let name = match linked {
            Ok((_, name)) => name,
            Err(e) => {
                self.cache.discard_placeholder(sibling_id, &manifest)?;
                return Err(e);
            }
        };

        info!(
            entry = %file_id,
            sibling = %sibling_id,
            folder = %folder_id,
            name = %name,
            "preserved concurrent file content"
        );
        Ok(Sibling {
            id: sibling_id,
            folder: folder_id,
            name,
            manifest,
        })
    }

    /// Undoes [`preserve`](Self::preserve) when the merge it belonged to
    /// did not apply.
    fn withdraw(&self, sibling: &Sibling) -> SyncResult<()> {
        update_folder(&self.cache, self.credentials().author(), sibling.folder, |folder| {
            let mut next = folder.clone();
            if next.get(&sibling.name) == Some(sibling.id) {
                next.children.remove(&sibling.name);
            }
            Ok((next, ()))
        })?;
        self.cache.discard_placeholder(sibling.id, &sibling.manifest)?;
        debug!(sibling = %sibling.id, "withdrew preserved sibling");
        Ok(())
    }

    /// Makes sure everything `pending` references exists remotely.
    async fn prepare_push(&self, id: EntryId, pending: &Manifest) -> SyncResult<()> {
        match &pending.content {
            ManifestContent::Folder(folder) => {
                for child in folder.children.values().copied() {
                    let placeholder = self
                        .cache
                        .get_entry(child)
                        .is_some_and(|e| e.is_placeholder());
                    if !placeholder {
                        continue;
                    }
                    debug!(entry = %id, child = %child, "pushing new child first");
                    self.sync_boxed(child)
                        .await
                        .map_err(|e| SyncError::DependencyFailed {
                            entry_id: id,
                            child,
                            source: Box::new(e),
                        })?;
                }
            }
            ManifestContent::File(file) => {
                for block in &file.blocks {
                    if !self.cache.is_dirty(block.id) {
                        continue;
                    }
                    let Some(data) = self.cache.get_block(block.id) else {
                        continue;
                    };
                    self.with_retry(Some(id), || {
                        self.remote.upload_block(block.id, data.as_ref().clone())
                    })
                    .await?;
                    self.cache.mark_block_clean(block.id)?;
                    debug!(entry = %id, block = %block.id, "uploaded block");
                }
            }
        }
        Ok(())
    }

    async fn with_retry<T, F, Fut>(&self, id: Option<EntryId>, mut op: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match op().await {
                Err(SyncError::Remote(e)) if e.is_retryable() && attempt + 1 < max_attempts => {
                    attempt += 1;
                    if let Some(id) = id {
                        self.set_state(id, SyncState::Retrying);
                    }
                    self.stats.write().retries += 1;
                    let delay = self.config.retry.delay_for_attempt(attempt);
                    warn!(attempt, ?delay, error = %e, "remote unavailable, retrying");
                    tokio::time::sleep(delay).await;
                    self.check_cancelled()?;
                }
                result => return result,
            }
        }
    }

    fn confirmed(&self, manifest: Manifest) {
        self.events.emit(SyncEvent::Confirmed {
            entry_id: manifest.entry_id,
            manifest,
        });
    }

    fn note_failure(&self, e: &SyncError) {
        if let SyncError::Verification {
            entry_id,
            author,
            error: cause,
            ..
        } = e
        {
            let blocked = e.is_security_incident();
            self.stats.write().rejected_objects += 1;
            if blocked {
                self.set_state(*entry_id, SyncState::Blocked);
                error!(
                    target: "sealdrive::security",
                    entry = %entry_id,
                    author = ?author,
                    error = %cause,
                    "verification failed for a trusted author; entry blocked"
                );
            }
            self.events.emit(SyncEvent::SecurityIncident {
                entry_id: *entry_id,
                author: author.clone(),
                error: cause.clone(),
                blocked,
            });
        }
        self.stats.write().last_error = Some(e.to_string());
    }

    fn entry_lock(&self, id: EntryId) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.locks.lock().entry(id).or_default())
    }

    fn set_state(&self, id: EntryId, state: SyncState) {
        let mut states = self.states.write();
        if states.get(&id) == Some(&SyncState::Blocked) {
            return;
        }
        if state == SyncState::Idle {
            states.remove(&id);
        } else {
            states.insert(id, state);
        }
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for Synchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synchronizer")
            .field("author", self.credentials().author())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
