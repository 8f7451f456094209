//! Conflict records.

use crate::codec::{from_cbor, to_cbor};
use crate::error::CoreResult;
use crate::manifest::Manifest;
use crate::types::{AuthorId, EntryId, Timestamp, Version};
use serde::{Deserialize, Serialize};

/// One deterministic decision taken while merging concurrent versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    /// Both sides changed file content; the newer content was kept and the
    /// older one preserved as a sibling.
    KeptNewerContent {
        /// Author of the kept content.
        kept_author: AuthorId,
        /// Timestamp of the kept content.
        kept_timestamp: Timestamp,
        /// Author of the preserved content.
        preserved_author: AuthorId,
        /// Timestamp of the preserved content.
        preserved_timestamp: Timestamp,
    },
    /// Both sides moved the entry; the newer destination won.
    ChoseParent {
        /// Parent kept.
        parent: Option<EntryId>,
    },
    /// Two entries claimed one name; the older one was renamed.
    RenamedChild {
        /// Contested name.
        name: String,
        /// Entry that was renamed.
        entry_id: EntryId,
        /// New name.
        renamed_to: String,
    },
    /// One side deleted a child the other side edited; the child was kept.
    KeptEditedChild {
        /// Name of the child.
        name: String,
        /// The child.
        entry_id: EntryId,
    },
    /// An entry was linked under two names; one link was dropped.
    DroppedDuplicateLink {
        /// Dropped name.
        name: String,
        /// The entry.
        entry_id: EntryId,
    },
}

/// Two versions of one entry that extended the same base, and what was done.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// Entry concerned.
    pub entry_id: EntryId,
    /// Version both candidates extended.
    pub base_version: Version,
    /// The local pending candidate.
    pub local: Manifest,
    /// The remote candidate.
    pub remote: Manifest,
    /// Decisions taken, in a deterministic order.
    pub resolutions: Vec<Resolution>,
    /// Sibling created to hold preserved file content, as `(name, entry)`.
    pub preserved_as: Option<(String, EntryId)>,
}

impl ConflictRecord {
    /// Creates a record.
    #[must_use]
    pub fn new(
        base_version: Version,
        local: Manifest,
        remote: Manifest,
        resolutions: Vec<Resolution>,
    ) -> Self {
        Self {
            entry_id: remote.entry_id,
            base_version,
            local,
            remote,
            resolutions,
            preserved_as: None,
        }
    }

    /// Returns true if concurrent file contents were forked into a sibling.
    #[must_use]
    pub fn is_content_fork(&self) -> bool {
        self.resolutions
            .iter()
            .any(|r| matches!(r, Resolution::KeptNewerContent { .. }))
    }

    /// Encodes to CBOR.
    ///
    /// # Errors
    ///
    /// Fails if serialization fails.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    ///
    /// # Errors
    ///
    /// Fails if the bytes are not a valid record.
    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        from_cbor(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{FileManifest, ManifestContent};

    fn file(author: &str, micros: i64, size: u64) -> Manifest {
        Manifest::new(
            EntryId::from_bytes([3; 16]),
            None,
            ManifestContent::File(FileManifest {
                blocks: Vec::new(),
                size,
                block_size: 16,
            }),
            AuthorId::new(author),
            Timestamp::from_micros(micros),
        )
    }

    #[test]
    fn record_encode_decode() {
        let mut record = ConflictRecord::new(
            3,
            file("alice@laptop", 1, 0),
            file("bob@pc", 2, 0),
            vec![Resolution::KeptNewerContent {
                kept_author: AuthorId::new("bob@pc"),
                kept_timestamp: Timestamp::from_micros(2),
                preserved_author: AuthorId::new("alice@laptop"),
                preserved_timestamp: Timestamp::from_micros(1),
            }],
        );
        record.preserved_as = Some(("x (conflict)".into(), EntryId::new()));

        let decoded = ConflictRecord::decode(&record.encode().unwrap()).unwrap();
        assert_eq!(decoded, record);
        assert!(decoded.is_content_fork());
    }

    #[test]
    fn structural_record_is_not_a_fork() {
        let record = ConflictRecord::new(
            1,
            file("alice@laptop", 1, 0),
            file("bob@pc", 2, 0),
            vec![Resolution::ChoseParent { parent: None }],
        );
        assert!(!record.is_content_fork());
        assert_eq!(record.entry_id, EntryId::from_bytes([3; 16]));
    }
}
