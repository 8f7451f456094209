//! Per-entry record of the local cache.

use crate::manifest::{Manifest, ManifestContent};
use crate::types::{AuthorId, EntryId, Timestamp, Version};
use serde::{Deserialize, Serialize};

/// Confirmed and pending state of one entry.
///
/// # Invariants
///
/// - `base_version == confirmed.version` (0 when nothing is confirmed)
/// - `pending.version == base_version + 1` when a pending edit exists
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedEntry {
    /// Highest version accepted by the remote.
    pub confirmed: Option<Manifest>,
    /// Local edit not yet accepted by the remote.
    pub pending: Option<Manifest>,
    /// Version `pending` was derived from.
    pub base_version: Version,
}

impl VersionedEntry {
    /// Version of the confirmed manifest, 0 if none.
    #[must_use]
    pub fn confirmed_version(&self) -> Version {
        self.confirmed.as_ref().map_or(0, |m| m.version)
    }

    /// Returns true if the remote has never accepted this entry.
    #[must_use]
    pub fn is_placeholder(&self) -> bool {
        self.confirmed.is_none()
    }

    /// Returns true if a local edit awaits synchronization.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// The state the local user sees: pending if any, else confirmed.
    #[must_use]
    pub fn current(&self) -> Option<&Manifest> {
        self.pending.as_ref().or(self.confirmed.as_ref())
    }

    /// Builds the pending manifest for a new local edit on top of the
    /// current state. Repeated edits before a sync collapse into one
    /// pending version.
    #[must_use]
    pub fn derive_pending(
        &self,
        parent: Option<EntryId>,
        content: ManifestContent,
        author: AuthorId,
        timestamp: Timestamp,
    ) -> Option<Manifest> {
        let current = self.current()?;
        Some(Manifest {
            entry_id: current.entry_id,
            version: self.base_version.checked_add(1)?,
            author,
            timestamp,
            parent,
            content,
        })
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.confirmed.is_none() && self.pending.is_none()
    }

    pub(crate) fn holds_invariants(&self) -> bool {
        self.base_version == self.confirmed_version()
            && self
                .pending
                .as_ref()
                .is_none_or(|p| self.base_version.checked_add(1) == Some(p.version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::FolderManifest;

    fn manifest(version: Version) -> Manifest {
        Manifest {
            entry_id: EntryId::from_bytes([5; 16]),
            version,
            author: AuthorId::new("alice@laptop"),
            timestamp: Timestamp::from_micros(version as i64),
            parent: None,
            content: ManifestContent::Folder(FolderManifest::new()),
        }
    }

    #[test]
    fn placeholder_state() {
        let entry = VersionedEntry {
            confirmed: None,
            pending: Some(manifest(1)),
            base_version: 0,
        };
        assert!(entry.is_placeholder());
        assert!(entry.has_pending());
        assert_eq!(entry.confirmed_version(), 0);
        assert!(entry.holds_invariants());
    }

    #[test]
    fn derive_pending_collapses_edits() {
        let entry = VersionedEntry {
            confirmed: Some(manifest(3)),
            pending: Some(manifest(4)),
            base_version: 3,
        };
        let next = entry
            .derive_pending(
                None,
                ManifestContent::Folder(FolderManifest::new()),
                AuthorId::new("alice@laptop"),
                Timestamp::from_micros(99),
            )
            .unwrap();
        assert_eq!(next.version, 4);
        assert_eq!(entry.current().unwrap().version, 4);
    }

    #[test]
    fn broken_invariants_detected() {
        let entry = VersionedEntry {
            confirmed: Some(manifest(3)),
            pending: Some(manifest(6)),
            base_version: 3,
        };
        assert!(!entry.holds_invariants());
        assert!(VersionedEntry::default().is_empty());
    }
}
