//! Cache data models.

use chrono::{DateTime, Utc};

use crate::model::{Message, MessageChange, Revision};
use crate::outgoing::OutgoingMail;

/// Result of merging one message state into the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The message did not exist and was created.
    Inserted,
    /// A lower revision was replaced.
    Updated,
    /// The same revision is already stored; nothing changed.
    Duplicate,
    /// A higher revision is already stored; nothing changed.
    Stale,
}

impl UpsertOutcome {
    /// Whether the cache changed.
    #[must_use]
    pub const fn is_applied(self) -> bool {
        matches!(self, Self::Inserted | Self::Updated)
    }
}

/// One page of the message list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Page {
    /// Messages on this page, newest first.
    pub messages: Vec<Message>,
    /// Number of visible messages in the account at snapshot time.
    pub total: u64,
    /// Offset this page starts at.
    pub offset: u64,
}

impl Page {
    /// Whether more messages follow this page.
    #[must_use]
    pub fn has_more(&self) -> bool {
        self.offset + (self.messages.len() as u64) < self.total
    }
}

/// A locally made change waiting to reach the document store.
#[derive(Debug, Clone)]
pub struct OutboxEntry {
    /// The change to propagate.
    pub change: MessageChange,
    /// Revision the change was made on top of.
    pub base_revision: Option<Revision>,
    /// Number of failed propagation attempts so far.
    pub attempts: u32,
    /// Error of the last failed attempt.
    pub last_error: Option<String>,
    /// When the entry was queued.
    pub queued_at: DateTime<Utc>,
}

/// An outgoing mail waiting in the send queue.
#[derive(Debug, Clone)]
pub struct QueuedMail {
    /// Queue position; also identifies the entry.
    pub seq: i64,
    /// The mail to send.
    pub mail: OutgoingMail,
    /// Number of failed delivery attempts so far.
    pub attempts: u32,
    /// Error of the last failed attempt.
    pub last_error: Option<String>,
    /// When the mail was queued.
    pub queued_at: DateTime<Utc>,
}
