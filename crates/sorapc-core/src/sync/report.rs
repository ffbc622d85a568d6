//! Sync run results and errors.

use thiserror::Error;

use crate::cache::UpsertOutcome;
use crate::error::RemoteError;
use crate::model::{MessageId, Revision, SyncCursor};

/// Errors that stop a sync run.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Credentials were rejected. Sync halts until the user signs in again.
    #[error("Re-authentication required: {0}")]
    Auth(String),

    /// The endpoint stayed unreachable after all retries.
    #[error("Network unavailable after {attempts} attempts: {message}")]
    TransientNetwork {
        /// Attempts made.
        attempts: u32,
        /// Last error message.
        message: String,
    },

    /// The endpoint returned data we cannot use.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The run was cancelled (account signed out).
    #[error("Sync cancelled")]
    Cancelled,

    /// The message is not in the cache.
    #[error("Message not found: {0}")]
    MessageNotFound(MessageId),

    /// The message kept changing while a local edit was applied.
    #[error("Message changed concurrently: {0}")]
    Contended(MessageId),

    /// Local cache failure.
    #[error("Cache error: {0}")]
    Cache(#[from] crate::Error),
}

impl SyncError {
    /// Converts a remote error that is not retried any further.
    pub(crate) fn from_remote(err: RemoteError, attempts: u32) -> Self {
        match err {
            RemoteError::Auth(message) => Self::Auth(message),
            RemoteError::TransientNetwork(message) => Self::TransientNetwork { attempts, message },
            RemoteError::Protocol(message) => Self::Protocol(message),
        }
    }

    /// Whether this error has to abort the whole run, as opposed to failing
    /// only the item being processed.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::TransientNetwork { .. } | Self::Protocol(_))
    }
}

/// An item that could not be synced in this run.
///
/// Non-fatal: the item stays queued and is retried on the next run, while the
/// cache keeps its last known good state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFailure {
    /// Message that failed.
    pub id: MessageId,
    /// Revision that could not be propagated.
    pub revision: Revision,
    /// Why it failed.
    pub reason: String,
}

impl std::fmt::Display for SyncFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sync failed for {} at {}: {}", self.id, self.revision, self.reason)
    }
}

/// Counters and notices of one completed run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Changes that modified the cache.
    pub applied: usize,
    /// Changes already present at the same revision.
    pub duplicates: usize,
    /// Changes older than the cached state.
    pub stale: usize,
    /// Local changes stored in the document store.
    pub pushed: usize,
    /// Local changes dropped because the document store held a newer revision.
    pub superseded: usize,
    /// Items left for the next run.
    pub failures: Vec<SyncFailure>,
    /// Outgoing mail accepted by the server.
    pub mail_sent: usize,
    /// Outgoing mail still queued after the run.
    pub mail_deferred: usize,
    /// Remote cursor after the run.
    pub remote_cursor: SyncCursor,
    /// Cloud cursor after the run.
    pub cloud_cursor: SyncCursor,
}

impl SyncReport {
    pub(crate) fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted | UpsertOutcome::Updated => self.applied += 1,
            UpsertOutcome::Duplicate => self.duplicates += 1,
            UpsertOutcome::Stale => self.stale += 1,
        }
    }

    /// Whether every item was resolved.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Result of a sync trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// A run completed.
    Completed(SyncReport),
    /// Another run for the account was already in flight; this trigger was
    /// folded into it.
    Coalesced,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_mapping() {
        assert!(matches!(
            SyncError::from_remote(RemoteError::Auth("x".into()), 1),
            SyncError::Auth(_)
        ));
        let err = SyncError::from_remote(RemoteError::TransientNetwork("down".into()), 4);
        assert!(matches!(err, SyncError::TransientNetwork { attempts: 4, .. }));
        assert!(!err.is_fatal());
        assert!(SyncError::Cancelled.is_fatal());
    }

    #[test]
    fn test_report_counts() {
        let mut report = SyncReport::default();
        report.record(UpsertOutcome::Inserted);
        report.record(UpsertOutcome::Updated);
        report.record(UpsertOutcome::Duplicate);
        report.record(UpsertOutcome::Stale);
        assert_eq!(report.applied, 2);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.stale, 1);
        assert!(report.is_clean());
    }

    #[test]
    fn test_failure_display() {
        let failure = SyncFailure {
            id: MessageId::new("m1"),
            revision: Revision(3),
            reason: "conflict".to_string(),
        };
        assert_eq!(failure.to_string(), "sync failed for m1 at r3: conflict");
    }
}
