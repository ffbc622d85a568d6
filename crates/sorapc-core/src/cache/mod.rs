//! Local message cache.
//!
//! The cache is the source of truth for the UI. It stores message state,
//! one sync cursor per `(account, source)` pair, the outbox of local
//! changes and the queue of outgoing mail. Only the sync coordinator writes
//! to it.

mod model;
mod repository;

pub use model::{OutboxEntry, Page, QueuedMail, UpsertOutcome};
pub use repository::LocalCache;
