//! Remote history storage and the verifying client in front of it.
//!
//! The remote holds, per entry, an append-only list of sealed manifests
//! and a flat set of sealed blocks. It sees ciphertext only and is not
//! trusted: everything read back goes through [`RemoteHistoryClient`],
//! which verifies it before the rest of the engine sees it.

use crate::error::{RemoteError, RemoteResult, SyncError, SyncResult};
use crate::keys::{Credentials, KeyProvider};
use async_trait::async_trait;
use parking_lot::RwLock;
use sealdrive_core::crypto::{claimed_author, seal_manifest, verify_and_decrypt};
use sealdrive_core::{BlockId, EntryId, Manifest, VerificationError, Version};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// One stored version of an entry, as the remote returns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    /// Position of the object in the entry's history.
    pub version: Version,
    /// Sealed manifest envelope.
    pub blob: Vec<u8>,
}

/// Versioned, append-only object storage.
///
/// Implementations must make [`append`](RemoteStore::append) atomic: at
/// most one append per `(entry, version)` ever succeeds.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Returns the latest version of an entry.
    async fn fetch_latest(&self, entry_id: EntryId) -> RemoteResult<RemoteObject>;

    /// Returns a specific version of an entry.
    async fn fetch_at(&self, entry_id: EntryId, version: Version) -> RemoteResult<RemoteObject>;

    /// Appends version `expected_prior + 1`, failing with
    /// [`RemoteError::VersionConflict`] unless the latest version is
    /// `expected_prior` (0 for a new entry).
    async fn append(
        &self,
        entry_id: EntryId,
        blob: Vec<u8>,
        expected_prior: Version,
    ) -> RemoteResult<Version>;

    /// Returns the entries whose latest remote version differs from the
    /// given one.
    async fn check_versions(&self, known: &[(EntryId, Version)]) -> RemoteResult<Vec<EntryId>>;

    /// Stores a sealed block. Uploading an existing block is a no-op.
    async fn upload_block(&self, id: BlockId, data: Vec<u8>) -> RemoteResult<()>;

    /// Returns a sealed block.
    async fn fetch_block(&self, id: BlockId) -> RemoteResult<Vec<u8>>;
}

/// Seals outgoing manifests and verifies incoming ones.
#[derive(Clone)]
pub struct RemoteHistoryClient {
    store: Arc<dyn RemoteStore>,
    keys: Arc<dyn KeyProvider>,
    credentials: Credentials,
}

impl RemoteHistoryClient {
    /// Creates a client.
    pub fn new(
        store: Arc<dyn RemoteStore>,
        keys: Arc<dyn KeyProvider>,
        credentials: Credentials,
    ) -> Self {
        Self {
            store,
            keys,
            credentials,
        }
    }

    /// The local credentials.
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Fetches and verifies the latest version. `None` if the entry does
    /// not exist remotely.
    pub async fn fetch_latest(&self, entry_id: EntryId) -> SyncResult<Option<Manifest>> {
        match self.store.fetch_latest(entry_id).await {
            Ok(object) => self.open(entry_id, &object).map(Some),
            Err(RemoteError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Fetches and verifies one version.
    pub async fn fetch_at(&self, entry_id: EntryId, version: Version) -> SyncResult<Manifest> {
        let object = self.store.fetch_at(entry_id, version).await?;
        if object.version != version {
            return Err(self.rejected(
                entry_id,
                None,
                false,
                VerificationError::VersionMismatch {
                    entry_id,
                    expected: version,
                    actual: object.version,
                },
            ));
        }
        self.open(entry_id, &object)
    }

    /// Signs, seals and appends `manifest` as the version after
    /// `manifest.version - 1`.
    pub async fn append(&self, manifest: &Manifest) -> SyncResult<()> {
        let blob = seal_manifest(
            manifest,
            self.credentials.identity(),
            self.credentials.workspace_key(),
        )?;
        let expected_prior = manifest.version.saturating_sub(1);
        let version = self
            .store
            .append(manifest.entry_id, blob, expected_prior)
            .await?;
        debug!(entry = %manifest.entry_id, version, "appended");
        Ok(())
    }

    /// Entries that changed remotely relative to `known`.
    pub async fn check_versions(&self, known: &[(EntryId, Version)]) -> SyncResult<Vec<EntryId>> {
        Ok(self.store.check_versions(known).await?)
    }

    /// Uploads a sealed block.
    pub async fn upload_block(&self, id: BlockId, data: Vec<u8>) -> SyncResult<()> {
        Ok(self.store.upload_block(id, data).await?)
    }

    /// Downloads a sealed block. The caller checks it against its
    /// reference.
    pub async fn fetch_block(&self, id: BlockId) -> SyncResult<Vec<u8>> {
        Ok(self.store.fetch_block(id).await?)
    }

    fn open(&self, entry_id: EntryId, object: &RemoteObject) -> SyncResult<Manifest> {
        let author = claimed_author(&object.blob)
            .map_err(|error| self.rejected(entry_id, None, false, error))?;

        let Some(author_key) = self.keys.author_key(&author) else {
            let error = VerificationError::UnknownAuthor {
                author: author.clone(),
            };
            return Err(self.rejected(entry_id, Some(author), false, error));
        };

        let manifest = verify_and_decrypt(
            &object.blob,
            &author,
            &author_key.key,
            self.credentials.workspace_key(),
            entry_id,
            Some(object.version),
        )
        .map_err(|error| self.rejected(entry_id, Some(author.clone()), true, error))?;

        if !author_key.accepts(manifest.timestamp) {
            let error = VerificationError::UnknownAuthor {
                author: author.clone(),
            };
            return Err(self.rejected(entry_id, Some(author), false, error));
        }

        Ok(manifest)
    }

    fn rejected(
        &self,
        entry_id: EntryId,
        author: Option<sealdrive_core::AuthorId>,
        trusted_author: bool,
        error: VerificationError,
    ) -> SyncError {
        warn!(
            target: "sealdrive::security",
            entry = %entry_id,
            author = ?author,
            %error,
            "rejected remote object"
        );
        SyncError::Verification {
            entry_id,
            author,
            trusted_author,
            error,
        }
    }
}

impl std::fmt::Debug for RemoteHistoryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteHistoryClient")
            .field("author", self.credentials.author())
            .finish_non_exhaustive()
    }
}

/// A remote store held in memory, with fault injection for tests.
#[derive(Debug, Default)]
pub struct InMemoryRemote {
    history: RwLock<HashMap<EntryId, Vec<Vec<u8>>>>,
    blocks: RwLock<HashMap<BlockId, Vec<u8>>>,
    unavailable: AtomicBool,
    appends: AtomicU64,
}

impl InMemoryRemote {
    /// Creates an empty remote.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail with [`RemoteError::Unavailable`] while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of successful appends so far.
    pub fn append_count(&self) -> u64 {
        self.appends.load(Ordering::SeqCst)
    }

    /// Latest version of an entry, 0 if absent.
    pub fn latest_version(&self, entry_id: EntryId) -> Version {
        self.history
            .read()
            .get(&entry_id)
            .map_or(0, |h| h.len() as Version)
    }

    /// Number of stored blocks.
    pub fn block_count(&self) -> usize {
        self.blocks.read().len()
    }

    /// Rewrites a stored version in place. Returns false if it does not
    /// exist.
    pub fn tamper(&self, entry_id: EntryId, version: Version, f: impl FnOnce(&mut Vec<u8>)) -> bool {
        let mut history = self.history.write();
        let slot = history
            .get_mut(&entry_id)
            .and_then(|h| h.get_mut(index(version)?));
        match slot {
            Some(blob) => {
                f(blob);
                true
            }
            None => false,
        }
    }

    /// Appends a raw blob without any check, as a misbehaving writer
    /// could.
    pub fn inject(&self, entry_id: EntryId, blob: Vec<u8>) -> Version {
        let mut history = self.history.write();
        let entries = history.entry(entry_id).or_default();
        entries.push(blob);
        entries.len() as Version
    }

    /// Rewrites a stored block in place.
    pub fn tamper_block(&self, id: BlockId, f: impl FnOnce(&mut Vec<u8>)) -> bool {
        match self.blocks.write().get_mut(&id) {
            Some(data) => {
                f(data);
                true
            }
            None => false,
        }
    }

    fn check_available(&self) -> RemoteResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(RemoteError::Unavailable("remote offline".into()))
        } else {
            Ok(())
        }
    }
}

fn index(version: Version) -> Option<usize> {
    usize::try_from(version.checked_sub(1)?).ok()
}

#[async_trait]
impl RemoteStore for InMemoryRemote {
    async fn fetch_latest(&self, entry_id: EntryId) -> RemoteResult<RemoteObject> {
        self.check_available()?;
        let history = self.history.read();
        let versions = history
            .get(&entry_id)
            .filter(|h| !h.is_empty())
            .ok_or(RemoteError::NotFound(entry_id))?;
        Ok(RemoteObject {
            version: versions.len() as Version,
            blob: versions[versions.len() - 1].clone(),
        })
    }

    async fn fetch_at(&self, entry_id: EntryId, version: Version) -> RemoteResult<RemoteObject> {
        self.check_available()?;
        let history = self.history.read();
        history
            .get(&entry_id)
            .and_then(|h| h.get(index(version)?))
            .map(|blob| RemoteObject {
                version,
                blob: blob.clone(),
            })
            .ok_or(RemoteError::VersionNotFound { entry_id, version })
    }

    async fn append(
        &self,
        entry_id: EntryId,
        blob: Vec<u8>,
        expected_prior: Version,
    ) -> RemoteResult<Version> {
        self.check_available()?;
        let mut history = self.history.write();
        let versions = history.entry(entry_id).or_default();
        let latest = versions.len() as Version;
        if latest != expected_prior {
            return Err(RemoteError::VersionConflict {
                entry_id,
                actual_latest: latest,
            });
        }
        versions.push(blob);
        self.appends.fetch_add(1, Ordering::SeqCst);
        Ok(latest + 1)
    }

    async fn check_versions(&self, known: &[(EntryId, Version)]) -> RemoteResult<Vec<EntryId>> {
        self.check_available()?;
        let history = self.history.read();
        Ok(known
            .iter()
            .filter(|(id, version)| {
                history.get(id).map_or(0, |h| h.len() as Version) != *version
            })
            .map(|(id, _)| *id)
            .collect())
    }

    async fn upload_block(&self, id: BlockId, data: Vec<u8>) -> RemoteResult<()> {
        self.check_available()?;
        self.blocks.write().entry(id).or_insert(data);
        Ok(())
    }

    async fn fetch_block(&self, id: BlockId) -> RemoteResult<Vec<u8>> {
        self.check_available()?;
        self.blocks
            .read()
            .get(&id)
            .cloned()
            .ok_or(RemoteError::BlockNotFound(id))
    }
}
