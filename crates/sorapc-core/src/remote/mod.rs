//! Remote message source.
//!
//! Bridges the mail endpoint to the sync engine. Implementations only perform
//! network I/O; merging into the cache is the coordinator's job.

pub(crate) mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::account::Account;
use crate::error::RemoteError;
use crate::model::{MessageChange, SyncCursor};

pub use http::HttpMessageSource;

/// Changes since a cursor, in source order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    /// Ordered changes.
    #[serde(default)]
    pub changes: Vec<MessageChange>,
    /// Cursor reached once every change is merged.
    pub cursor: SyncCursor,
}

/// Source of message changes (mail server side).
#[async_trait]
pub trait RemoteMessageSource: Send + Sync {
    /// Fetch the changes recorded after `cursor`.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::TransientNetwork`] for failures worth retrying
    /// and [`RemoteError::Auth`] when the account must sign in again.
    async fn fetch_delta(
        &self,
        account: &Account,
        cursor: SyncCursor,
    ) -> Result<Delta, RemoteError>;
}
