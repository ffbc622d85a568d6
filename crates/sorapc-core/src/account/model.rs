//! Account model types.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::RemoteError;

/// Unique identifier for an account, as issued by the identity provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub String);

impl AccountId {
    /// Create a new account ID.
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

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection parameters for a remote endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Base URL of the service (e.g. `https://mail.example.com/api`).
    pub base_url: String,
    /// Request timeout in seconds.
    #[serde(default = "Endpoint::default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Endpoint {
    /// Creates an endpoint with the default timeout.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout_secs: Self::default_timeout_secs(),
        }
    }

    const fn default_timeout_secs() -> u64 {
        30
    }

    /// Request timeout, falling back to the default when unset.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        if self.timeout_secs == 0 {
            Duration::from_secs(Self::default_timeout_secs())
        } else {
            Duration::from_secs(self.timeout_secs)
        }
    }

    /// Builds a URL below the base URL from percent-encoded path segments.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Protocol`] if the base URL is invalid.
    pub fn url_for(&self, segments: &[&str]) -> Result<Url, RemoteError> {
        let mut url = Url::parse(&self.base_url).map_err(|e| {
            RemoteError::Protocol(format!("invalid base URL {}: {e}", self.base_url))
        })?;
        url.path_segments_mut()
            .map_err(|()| RemoteError::Protocol(format!("base URL cannot be a base: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

/// An authenticated account.
///
/// The access token is never serialized; it is loaded from the system
/// keyring at sign-in (see [`credentials`](super::credentials)).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Account {
    /// Identity provider user id.
    pub id: AccountId,
    /// Email address.
    pub email: String,
    /// Display name for the account.
    #[serde(default)]
    pub display_name: String,
    /// Remote message source endpoint.
    pub mail: Endpoint,
    /// Cloud document store endpoint.
    pub cloud: Endpoint,
    /// Bearer token for the current session.
    #[serde(skip)]
    pub access_token: Option<String>,
}

impl Account {
    /// Create an account bound to the given endpoints.
    #[must_use]
    pub fn new(id: AccountId, email: impl Into<String>, mail: Endpoint, cloud: Endpoint) -> Self {
        Self {
            id,
            email: email.into(),
            display_name: String::new(),
            mail,
            cloud,
            access_token: None,
        }
    }

    /// Returns a copy of this account carrying the given session token.
    #[must_use]
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Whether the account currently holds a session token.
    #[must_use]
    pub const fn is_signed_in(&self) -> bool {
        self.access_token.is_some()
    }

    /// Name to show in the UI, falling back to the email address.
    #[must_use]
    pub fn label(&self) -> &str {
        if self.display_name.is_empty() {
            &self.email
        } else {
            &self.display_name
        }
    }
}
