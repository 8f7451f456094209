//! Author keys and the local device's credentials.

use parking_lot::RwLock;
use sealdrive_core::{AuthorId, SecretKey, SigningIdentity, Timestamp, VerifyingKey};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Public key of an author, with its revocation time if revoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthorKey {
    /// Key manifests by this author must verify under.
    pub key: VerifyingKey,
    /// Manifests timestamped at or after this are rejected.
    pub revoked_at: Option<Timestamp>,
}

impl AuthorKey {
    /// Returns true if a manifest with `timestamp` is still acceptable.
    pub fn accepts(&self, timestamp: Timestamp) -> bool {
        self.revoked_at.is_none_or(|revoked| timestamp < revoked)
    }
}

/// Looks up the verifying key of an author.
///
/// The synchronizer never trusts the key bytes embedded in remote data;
/// every lookup goes through this trait.
pub trait KeyProvider: Send + Sync {
    /// Returns the key of `author`, or `None` if the author is unknown.
    fn author_key(&self, author: &AuthorId) -> Option<AuthorKey>;
}

/// In-process registry of workspace members.
#[derive(Debug, Default)]
pub struct Keyring {
    keys: RwLock<HashMap<AuthorId, AuthorKey>>,
}

impl Keyring {
    /// Creates an empty keyring.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or replaces the key of an author.
    pub fn register(&self, author: AuthorId, key: VerifyingKey) {
        info!(author = %author, "registered author key");
        self.keys.write().insert(
            author,
            AuthorKey {
                key,
                revoked_at: None,
            },
        );
    }

    /// Revokes an author from `at` onwards. Returns false if the author is
    /// unknown.
    pub fn revoke(&self, author: &AuthorId, at: Timestamp) -> bool {
        match self.keys.write().get_mut(author) {
            Some(entry) => {
                info!(author = %author, revoked_at = %at, "revoked author key");
                entry.revoked_at = Some(at);
                true
            }
            None => false,
        }
    }

    /// Lists registered authors.
    pub fn authors(&self) -> Vec<AuthorId> {
        let mut authors: Vec<_> = self.keys.read().keys().cloned().collect();
        authors.sort();
        authors
    }
}

impl KeyProvider for Keyring {
    fn author_key(&self, author: &AuthorId) -> Option<AuthorKey> {
        self.keys.read().get(author).copied()
    }
}

/// What this device signs and encrypts with.
#[derive(Debug, Clone)]
pub struct Credentials {
    identity: Arc<SigningIdentity>,
    workspace_key: Arc<SecretKey>,
}

impl Credentials {
    /// Bundles a signing identity with the workspace key.
    pub fn new(identity: SigningIdentity, workspace_key: SecretKey) -> Self {
        Self {
            identity: Arc::new(identity),
            workspace_key: Arc::new(workspace_key),
        }
    }

    /// The local author.
    pub fn author(&self) -> &AuthorId {
        self.identity.author()
    }

    /// The signing identity.
    pub fn identity(&self) -> &SigningIdentity {
        &self.identity
    }

    /// The workspace key.
    pub fn workspace_key(&self) -> &SecretKey {
        &self.workspace_key
    }
}
