//! # sorapc-core
//!
//! Synchronization and caching core for the `sorapc` mail client.
//!
//! This crate provides:
//! - Account context and secure token storage
//! - Remote message source and cloud document store abstractions (with HTTP clients)
//! - Local cache (`SQLite`) of messages, sync cursors and the outbox
//! - Outgoing mail queue delivered over SMTP
//! - **Sync Coordinator** - revision-ordered, two-way reconciliation with bounded conflict retry
//! - **Image Asset Loader** - memory LRU + disk cache for remote images

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod account;
pub mod assets;
pub mod cache;
pub mod cloud;
pub mod config;
mod error;
pub mod model;
pub mod outgoing;
pub mod remote;
pub mod sync;

#[cfg(test)]
mod test_support;

pub use account::credentials;
pub use account::{Account, AccountId, CredentialError, CredentialResult, Endpoint};
pub use assets::{
    DecodedImage, HttpImageFetcher, ImageAssetLoader, ImageFetcher, ImageLoad, PendingImage,
    VisibleImage,
};
pub use cache::{LocalCache, OutboxEntry, Page, QueuedMail, UpsertOutcome};
pub use cloud::{CloudDocumentStore, DocumentRecord, HttpDocumentStore, WriteOutcome};
pub use config::{ImageCacheConfig, RetryPolicy, Settings, SyncConfig};
pub use error::{Error, RemoteError, Result};
pub use model::{
    ChangeOp, ChangeOrigin, CursorSource, Message, MessageChange, MessageId, Revision, SyncCursor,
};
pub use outgoing::{
    MailAttachment, MailBody, MailTransport, OutgoingMail, SmtpConfig, SmtpMailTransport,
    SmtpSecurity,
};
pub use remote::{Delta, HttpMessageSource, RemoteMessageSource};
pub use sync::{
    LocalEdit, SyncCoordinator, SyncError, SyncFailure, SyncOutcome, SyncReport,
};
