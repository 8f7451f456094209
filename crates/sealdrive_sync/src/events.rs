//! Notifications for whoever renders the tree.

use sealdrive_core::{AuthorId, ConflictRecord, EntryId, Manifest, VerificationError};
use tokio::sync::broadcast;

/// Something the synchronizer did that observers may react to.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A version became confirmed locally, pushed or pulled.
    Confirmed {
        /// Entry concerned.
        entry_id: EntryId,
        /// The confirmed manifest.
        manifest: Manifest,
    },
    /// Concurrent edits were merged with at least one decision.
    Conflict(ConflictRecord),
    /// A remote object failed verification.
    SecurityIncident {
        /// Entry concerned.
        entry_id: EntryId,
        /// Claimed author, if readable.
        author: Option<AuthorId>,
        /// What failed.
        error: VerificationError,
        /// Whether the entry is now blocked.
        blocked: bool,
    },
}

/// Fan-out of [`SyncEvent`]s. Sending never blocks; slow subscribers
/// lag and miss events.
#[derive(Debug, Clone)]
pub(crate) struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}
