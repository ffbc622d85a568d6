//! Cloud document store.
//!
//! One document per message, in a collection per account. Writes use
//! optimistic concurrency: the caller states the revision it expects the
//! store to hold and gets the actual one back on conflict.

mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::account::Account;
use crate::error::RemoteError;
use crate::model::{ChangeOp, ChangeOrigin, Message, MessageChange, MessageId, Revision, SyncCursor};

pub use http::HttpDocumentStore;

/// Stored representation of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    /// Document key.
    pub id: MessageId,
    /// Revision of the document.
    pub revision: Revision,
    /// Whether the document is a deletion marker.
    #[serde(default)]
    pub deleted: bool,
    /// Message state; absent for deletion markers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    /// Commit sequence assigned by the store.
    #[serde(default)]
    pub sequence: u64,
}

impl DocumentRecord {
    /// Builds the document to write for a change.
    #[must_use]
    pub fn from_change(change: &MessageChange) -> Self {
        match &change.op {
            ChangeOp::Upsert { message } => Self {
                id: message.id.clone(),
                revision: message.revision,
                deleted: false,
                message: Some(message.clone()),
                sequence: 0,
            },
            ChangeOp::Delete { id, revision } => Self {
                id: id.clone(),
                revision: *revision,
                deleted: true,
                message: None,
                sequence: 0,
            },
        }
    }

    /// Converts the document into a change to merge into the cache.
    ///
    /// Returns `None` for a live document without message state.
    #[must_use]
    pub fn to_change(&self) -> Option<MessageChange> {
        let position = SyncCursor(self.sequence);
        if self.deleted {
            return Some(MessageChange::delete(
                self.id.clone(),
                self.revision,
                ChangeOrigin::Remote,
                position,
            ));
        }
        self.message.as_ref().map(|message| {
            let mut message = message.clone();
            message.revision = self.revision;
            MessageChange::upsert(message, ChangeOrigin::Remote, position)
        })
    }
}

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The document was stored.
    Ack,
    /// The store holds another revision than expected.
    Conflict(Revision),
}

/// Remote document database.
#[async_trait]
pub trait CloudDocumentStore: Send + Sync {
    /// Documents committed after `cursor`, in sequence order.
    ///
    /// # Errors
    ///
    /// Returns a [`RemoteError`] if the store cannot be read.
    async fn read_since(
        &self,
        account: &Account,
        cursor: SyncCursor,
    ) -> Result<Vec<DocumentRecord>, RemoteError>;

    /// Fetch one document.
    ///
    /// # Errors
    ///
    /// Returns a [`RemoteError`] if the store cannot be read.
    async fn fetch(
        &self,
        account: &Account,
        id: &MessageId,
    ) -> Result<Option<DocumentRecord>, RemoteError>;

    /// Write a document if the store still holds `expected`
    /// (`None` = the document must not exist yet).
    ///
    /// # Errors
    ///
    /// Returns a [`RemoteError`] if the write could not be performed.
    async fn write(
        &self,
        account: &Account,
        record: &DocumentRecord,
        expected: Option<Revision>,
    ) -> Result<WriteOutcome, RemoteError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::DateTime;

    use super::*;

    fn message() -> Message {
        Message {
            id: MessageId::new("m1"),
            sender: "a@example.com".to_string(),
            recipients: vec![],
            subject: "Hi".to_string(),
            body_ref: String::new(),
            timestamp: DateTime::from_timestamp(1_769_248_800, 0).unwrap(),
            is_read: true,
            revision: Revision(4),
        }
    }

    #[test]
    fn test_record_from_upsert_and_back() {
        let change = MessageChange::upsert(message(), ChangeOrigin::Local, SyncCursor(0));
        let mut record = DocumentRecord::from_change(&change);
        assert!(!record.deleted);
        assert_eq!(record.revision, Revision(4));

        record.sequence = 12;
        let back = record.to_change().unwrap();
        assert_eq!(back.origin, ChangeOrigin::Remote);
        assert_eq!(back.position, SyncCursor(12));
        assert_eq!(back.revision(), Revision(4));
    }

    #[test]
    fn test_deletion_marker() {
        let change = MessageChange::delete(
            MessageId::new("m1"),
            Revision(9),
            ChangeOrigin::Local,
            SyncCursor(0),
        );
        let record = DocumentRecord::from_change(&change);
        assert!(record.deleted);
        assert!(record.message.is_none());
        assert!(record.to_change().unwrap().is_delete());
    }

    #[test]
    fn test_live_record_without_message_is_skipped() {
        let record = DocumentRecord {
            id: MessageId::new("m1"),
            revision: Revision(1),
            deleted: false,
            message: None,
            sequence: 1,
        };
        assert!(record.to_change().is_none());
    }
}
