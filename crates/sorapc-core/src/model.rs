//! Domain models shared by the cache, the remote endpoints and the sync engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable message identifier, unique per account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    /// Create a new message ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic version marker of a message.
///
/// Conflicting writes are ordered by revision, never by wall-clock time.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Revision(pub u64);

impl Revision {
    /// Returns the revision that follows this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Opaque bookmark of sync progress for one source.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SyncCursor(pub u64);

impl SyncCursor {
    /// Cursor of an account that has never synced.
    pub const START: Self = Self(0);
}

impl std::fmt::Display for SyncCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Source a cursor belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CursorSource {
    /// The remote message source.
    Remote,
    /// The cloud document store.
    Cloud,
}

impl CursorSource {
    /// Stable name used in persisted state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Remote => "remote",
            Self::Cloud => "cloud",
        }
    }
}

/// A message as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier.
    pub id: MessageId,
    /// Sender address.
    pub sender: String,
    /// Recipient addresses.
    #[serde(default)]
    pub recipients: Vec<String>,
    /// Message subject.
    #[serde(default)]
    pub subject: String,
    /// Reference to the message body (fetched on demand).
    #[serde(default)]
    pub body_ref: String,
    /// When the message was sent.
    pub timestamp: DateTime<Utc>,
    /// Whether the message has been read.
    #[serde(default)]
    pub is_read: bool,
    /// Revision of this state.
    pub revision: Revision,
}

/// Where a change was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOrigin {
    /// Made on the server or by another device.
    #[default]
    Remote,
    /// Made on this device; must be propagated to the document store.
    Local,
}

/// What a change does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ChangeOp {
    /// Create or replace a message.
    Upsert {
        /// New message state.
        message: Message,
    },
    /// Remove a message.
    Delete {
        /// Message being removed.
        id: MessageId,
        /// Revision of the deletion.
        revision: Revision,
    },
}

/// One entry of a delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageChange {
    /// The change itself.
    #[serde(flatten)]
    pub op: ChangeOp,
    /// Where the change was made.
    #[serde(default)]
    pub origin: ChangeOrigin,
    /// Source position reached once this change is merged.
    pub position: SyncCursor,
}

impl MessageChange {
    /// Creates an upsert change.
    #[must_use]
    pub const fn upsert(message: Message, origin: ChangeOrigin, position: SyncCursor) -> Self {
        Self {
            op: ChangeOp::Upsert { message },
            origin,
            position,
        }
    }

    /// Creates a deletion change.
    #[must_use]
    pub const fn delete(
        id: MessageId,
        revision: Revision,
        origin: ChangeOrigin,
        position: SyncCursor,
    ) -> Self {
        Self {
            op: ChangeOp::Delete { id, revision },
            origin,
            position,
        }
    }

    /// Identifier of the message this change applies to.
    #[must_use]
    pub const fn id(&self) -> &MessageId {
        match &self.op {
            ChangeOp::Upsert { message } => &message.id,
            ChangeOp::Delete { id, .. } => id,
        }
    }

    /// Revision carried by this change.
    #[must_use]
    pub const fn revision(&self) -> Revision {
        match &self.op {
            ChangeOp::Upsert { message } => message.revision,
            ChangeOp::Delete { revision, .. } => *revision,
        }
    }

    /// Whether this change removes the message.
    #[must_use]
    pub const fn is_delete(&self) -> bool {
        matches!(self.op, ChangeOp::Delete { .. })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_revision_ordering() {
        assert!(Revision(3) > Revision(2));
        assert_eq!(Revision(2).next(), Revision(3));
        assert_eq!(Revision(u64::MAX).next(), Revision(u64::MAX));
    }

    #[test]
    fn test_change_wire_format() {
        let json = r#"{
            "op": "delete",
            "id": "m-1",
            "revision": 4,
            "origin": "local",
            "position": 17
        }"#;
        let change: MessageChange = serde_json::from_str(json).unwrap();
        assert_eq!(change.id(), &MessageId::new("m-1"));
        assert_eq!(change.revision(), Revision(4));
        assert_eq!(change.origin, ChangeOrigin::Local);
        assert_eq!(change.position, SyncCursor(17));
        assert!(change.is_delete());
    }

    #[test]
    fn test_origin_defaults_to_remote() {
        let json = r#"{
            "op": "upsert",
            "message": {
                "id": "m-2",
                "sender": "a@example.com",
                "timestamp": "2026-01-24T10:00:00Z",
                "revision": 1
            },
            "position": 3
        }"#;
        let change: MessageChange = serde_json::from_str(json).unwrap();
        assert_eq!(change.origin, ChangeOrigin::Remote);
        assert!(!change.is_delete());
    }
}
