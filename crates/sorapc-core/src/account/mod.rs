//! Account context.
//!
//! An account binds an authenticated identity to one message source and one
//! document store. It is passed explicitly to every operation.

pub mod credentials;
mod model;

pub use credentials::{CredentialError, CredentialResult};
pub use model::{Account, AccountId, Endpoint};
