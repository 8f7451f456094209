//! Error types for the sync engine.

use sealdrive_core::{
    AuthorId, BlockError, BlockId, CacheError, CoreError, EntryId, VerificationError, Version,
};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Result type for remote store calls.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Errors reported by a remote store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The entry has no version on the remote.
    #[error("entry {0} not found on remote")]
    NotFound(EntryId),

    /// The requested version does not exist.
    #[error("version {version} of {entry_id} not found on remote")]
    VersionNotFound {
        /// Entry requested.
        entry_id: EntryId,
        /// Version requested.
        version: Version,
    },

    /// The block is not stored on the remote.
    #[error("block {0} not found on remote")]
    BlockNotFound(BlockId),

    /// A conditional append lost the race.
    #[error("version conflict on {entry_id}: remote is at v{actual_latest}")]
    VersionConflict {
        /// Entry appended to.
        entry_id: EntryId,
        /// Latest version on the remote.
        actual_latest: Version,
    },

    /// The remote could not be reached.
    #[error("remote unavailable: {0}")]
    Unavailable(String),
}

impl RemoteError {
    /// Returns true if the call can be retried as is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Unavailable(_))
    }
}

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Remote store error.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// A remote object failed verification and was rejected.
    #[error("rejected object for {entry_id}: {error}")]
    Verification {
        /// Entry the object was fetched for.
        entry_id: EntryId,
        /// Author the object claims, if it could be read.
        author: Option<AuthorId>,
        /// Whether the author is trusted; failures from trusted authors
        /// block the entry.
        trusted_author: bool,
        /// What failed.
        error: VerificationError,
    },

    /// The entry is blocked after a security incident.
    #[error("entry {0} is blocked after a verification failure")]
    Blocked(EntryId),

    /// Local cache error.
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// Core error.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// A content block failed its checks.
    #[error("block error: {0}")]
    Block(#[from] BlockError),

    /// The remote reports an older history than already confirmed.
    #[error("remote history of {entry_id} regressed: local v{local}, remote v{remote}")]
    RemoteRegressed {
        /// Entry concerned.
        entry_id: EntryId,
        /// Locally confirmed version.
        local: Version,
        /// Latest version on the remote.
        remote: Version,
    },

    /// The remote serves a different manifest for an already confirmed
    /// version.
    #[error("remote history of {entry_id} diverged at v{version}")]
    HistoryDiverged {
        /// Entry concerned.
        entry_id: EntryId,
        /// Version concerned.
        version: Version,
    },

    /// Too many append races lost in one sync.
    #[error("gave up on {entry_id} after {rounds} merge rounds")]
    MergeRoundsExhausted {
        /// Entry concerned.
        entry_id: EntryId,
        /// Rounds attempted.
        rounds: u32,
    },

    /// An entry this sync depends on failed to sync first.
    #[error("cannot sync {entry_id}: {child} failed: {source}")]
    DependencyFailed {
        /// Entry being synchronized.
        entry_id: EntryId,
        /// Entry that had to sync first.
        child: EntryId,
        /// Why it failed.
        source: Box<SyncError>,
    },

    /// Entry unknown locally.
    #[error("entry {0} not found")]
    NotFound(EntryId),

    /// Path did not resolve.
    #[error("no such path: {0}")]
    InvalidPath(String),

    /// Expected a folder.
    #[error("entry {0} is not a folder")]
    NotAFolder(EntryId),

    /// Expected a file.
    #[error("entry {0} is not a file")]
    NotAFile(EntryId),

    /// A local edit kept racing with incoming changes.
    #[error("local edit of {0} kept going stale")]
    EditContended(EntryId),

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// The background worker is not running.
    #[error("sync worker not running")]
    WorkerStopped,
}

impl SyncError {
    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Remote(e) => e.is_retryable(),
            SyncError::DependencyFailed { source, .. } => source.is_retryable(),
            SyncError::MergeRoundsExhausted { .. } | SyncError::EditContended(_) => true,
            SyncError::Cache(CacheError::PendingChanged(_) | CacheError::StaleBase { .. }) => {
                true
            }
            _ => false,
        }
    }

    /// Returns true if the error must block the entry.
    pub fn is_security_incident(&self) -> bool {
        matches!(
            self,
            SyncError::Verification {
                trusted_author: true,
                error,
                ..
            } if error.is_security_incident()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::from(RemoteError::Unavailable("timeout".into())).is_retryable());
        assert!(!SyncError::from(RemoteError::VersionConflict {
            entry_id: EntryId::new(),
            actual_latest: 4
        })
        .is_retryable());
        assert!(SyncError::MergeRoundsExhausted {
            entry_id: EntryId::new(),
            rounds: 8
        }
        .is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
        assert!(!SyncError::Blocked(EntryId::new()).is_retryable());
    }

    #[test]
    fn only_trusted_authors_raise_incidents() {
        let verification = |trusted_author, error| SyncError::Verification {
            entry_id: EntryId::new(),
            author: Some(AuthorId::new("bob@pc")),
            trusted_author,
            error,
        };
        let bad = VerificationError::BadSignature {
            author: AuthorId::new("bob@pc"),
        };
        assert!(verification(true, bad.clone()).is_security_incident());
        assert!(!verification(false, bad).is_security_incident());
        assert!(!verification(
            true,
            VerificationError::UnknownAuthor {
                author: AuthorId::new("bob@pc")
            }
        )
        .is_security_incident());
    }

    #[test]
    fn error_display() {
        let err = SyncError::RemoteRegressed {
            entry_id: EntryId::from_bytes([0; 16]),
            local: 5,
            remote: 3,
        };
        assert!(err.to_string().contains("v5"));
        assert!(err.to_string().contains("v3"));
        assert_eq!(SyncError::Cancelled.to_string(), "sync cancelled");
    }
}
