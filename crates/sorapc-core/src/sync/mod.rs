//! Sync engine.
//!
//! Reconciles the remote message source, the cloud document store and the
//! local cache. See [`SyncCoordinator`].

mod coordinator;
mod merge;
mod report;
mod retry;

pub use coordinator::SyncCoordinator;
pub use merge::LocalEdit;
pub use report::{SyncError, SyncFailure, SyncOutcome, SyncReport};
