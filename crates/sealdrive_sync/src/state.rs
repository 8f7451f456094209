//! Per-entry sync state and statistics.

use sealdrive_core::{EntryId, Version};
use std::time::Instant;

/// Where one entry is in its synchronization cycle.
///
/// ```text
/// Idle -> Pulling -> Merging -> Pushing -> Idle
///            ^                     |
///            +----- Retrying <-----+   (lost append race, remote down)
/// any state -> Blocked                 (trusted author failed verification)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    /// Nothing in flight.
    #[default]
    Idle,
    /// Fetching and verifying remote versions.
    Pulling,
    /// Combining local and remote changes.
    Merging,
    /// Appending the pending version.
    Pushing,
    /// Waiting before another round.
    Retrying,
    /// Stopped after a security incident; needs an operator.
    Blocked,
}

impl SyncState {
    /// Returns true while a sync is in flight.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncState::Pulling | SyncState::Merging | SyncState::Pushing | SyncState::Retrying
        )
    }

    /// Returns true if a new sync may start.
    pub fn can_start_sync(&self) -> bool {
        matches!(self, SyncState::Idle)
    }
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Entry syncs that completed.
    pub syncs_completed: u64,
    /// Remote versions verified and adopted.
    pub versions_pulled: u64,
    /// Local versions accepted by the remote.
    pub versions_pushed: u64,
    /// Merges that needed a decision.
    pub conflicts: u64,
    /// Append races lost.
    pub lost_races: u64,
    /// Retries after an unavailable remote.
    pub retries: u64,
    /// Objects rejected by verification.
    pub rejected_objects: u64,
    /// Last successful sync.
    pub last_sync_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Result of synchronizing one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Entry synchronized.
    pub entry_id: EntryId,
    /// Confirmed version afterwards, 0 if the entry exists nowhere yet.
    pub confirmed_version: Version,
    /// Remote versions adopted.
    pub pulled: u64,
    /// Whether a local version was pushed.
    pub pushed: bool,
    /// Merges that needed a decision.
    pub conflicts: u64,
}

impl SyncOutcome {
    pub(crate) fn new(entry_id: EntryId) -> Self {
        Self {
            entry_id,
            confirmed_version: 0,
            pulled: 0,
            pushed: false,
            conflicts: 0,
        }
    }

    /// Returns true if nothing changed.
    pub fn is_noop(&self) -> bool {
        self.pulled == 0 && !self.pushed
    }
}

/// Result of synchronizing many entries.
#[derive(Debug, Default)]
pub struct SyncReport {
    /// Entries that synchronized.
    pub synced: Vec<SyncOutcome>,
    /// Entries that failed, with the error.
    pub failed: Vec<(EntryId, crate::error::SyncError)>,
}

impl SyncReport {
    /// Returns true if nothing failed.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub(crate) fn record(&mut self, id: EntryId, result: crate::error::SyncResult<SyncOutcome>) {
        match result {
            Ok(outcome) => self.synced.push(outcome),
            Err(e) => self.failed.push((id, e)),
        }
    }

    pub(crate) fn absorb(&mut self, other: SyncReport) {
        self.synced.extend(other.synced);
        self.failed.extend(other.failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions() {
        assert!(SyncState::Idle.can_start_sync());
        assert!(!SyncState::Idle.is_active());
        assert!(SyncState::Pulling.is_active());
        assert!(SyncState::Retrying.is_active());
        assert!(!SyncState::Blocked.is_active());
        assert!(!SyncState::Blocked.can_start_sync());
    }

    #[test]
    fn report_records_results() {
        let mut report = SyncReport::default();
        let id = EntryId::new();
        report.record(id, Ok(SyncOutcome::new(id)));
        assert!(report.is_success());
        report.record(id, Err(crate::error::SyncError::Cancelled));
        assert!(!report.is_success());
        assert!(report.synced[0].is_noop());
    }
}
