//! Merge rule and local edits.
//!
//! Every change carries a [`Revision`]; the cache keeps the highest revision
//! seen per message, deletions included. That makes merging idempotent and
//! independent of delivery order.

use crate::Result;
use crate::account::AccountId;
use crate::cache::{LocalCache, UpsertOutcome};
use crate::model::{ChangeOp, ChangeOrigin, Message, MessageChange, MessageId, SyncCursor};

/// Merge one change into the cache.
pub(crate) async fn apply_change(
    cache: &LocalCache,
    account_id: &AccountId,
    change: &MessageChange,
) -> Result<UpsertOutcome> {
    match &change.op {
        ChangeOp::Upsert { message } => cache.upsert(account_id, message).await,
        ChangeOp::Delete { id, revision } => cache.delete(account_id, id, *revision).await,
    }
}

/// A user action on a cached message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEdit {
    /// Mark the message as read.
    MarkRead(MessageId),
    /// Mark the message as unread.
    MarkUnread(MessageId),
    /// Delete the message.
    Delete(MessageId),
}

impl LocalEdit {
    /// Message the edit applies to.
    #[must_use]
    pub const fn id(&self) -> &MessageId {
        match self {
            Self::MarkRead(id) | Self::MarkUnread(id) | Self::Delete(id) => id,
        }
    }

    /// The change this edit makes on top of `current`, or `None` when it
    /// would not change anything.
    pub(crate) fn to_change(&self, current: &Message) -> Option<MessageChange> {
        let revision = current.revision.next();
        let read_state = |is_read: bool| {
            (current.is_read != is_read).then(|| {
                let mut message = current.clone();
                message.is_read = is_read;
                message.revision = revision;
                MessageChange::upsert(message, ChangeOrigin::Local, SyncCursor::START)
            })
        };

        match self {
            Self::MarkRead(_) => read_state(true),
            Self::MarkUnread(_) => read_state(false),
            Self::Delete(id) => Some(MessageChange::delete(
                id.clone(),
                revision,
                ChangeOrigin::Local,
                SyncCursor::START,
            )),
        }
    }
}
