//! HTTP/JSON message source.

use async_trait::async_trait;
use tracing::debug;

use super::{Delta, RemoteMessageSource};
use crate::account::Account;
use crate::error::RemoteError;
use crate::model::SyncCursor;

/// Reads message deltas from `GET {base}/accounts/{id}/changes?cursor=N`.
#[derive(Debug, Clone, Default)]
pub struct HttpMessageSource {
    client: reqwest::Client,
}

impl HttpMessageSource {
    /// Create a source sharing the given HTTP client.
    #[must_use]
    pub const fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

/// Bearer token of a signed-in account.
pub(crate) fn bearer(account: &Account) -> Result<&str, RemoteError> {
    account
        .access_token
        .as_deref()
        .ok_or_else(|| RemoteError::Auth(format!("account {} is not signed in", account.id)))
}

/// Turns a non-success response into a classified error.
pub(crate) async fn error_for(response: reqwest::Response) -> RemoteError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    RemoteError::from_status(status, body)
}

#[async_trait]
impl RemoteMessageSource for HttpMessageSource {
    async fn fetch_delta(
        &self,
        account: &Account,
        cursor: SyncCursor,
    ) -> Result<Delta, RemoteError> {
        let token = bearer(account)?;
        let mut url = account
            .mail
            .url_for(&["accounts", account.id.as_str(), "changes"])?;
        url.query_pairs_mut()
            .append_pair("cursor", &cursor.to_string());

        debug!(account = %account.id, %cursor, "Fetching message delta");

        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .timeout(account.mail.timeout())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_for(response).await);
        }

        let delta: Delta = response.json().await?;
        if delta.cursor < cursor {
            return Err(RemoteError::Protocol(format!(
                "delta cursor {} is behind requested cursor {cursor}",
                delta.cursor
            )));
        }

        debug!(
            account = %account.id,
            changes = delta.changes.len(),
            cursor = %delta.cursor,
            "Fetched message delta"
        );
        Ok(delta)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::account::{AccountId, Endpoint};
    use crate::test_support::{client, serve_once};

    fn account(base_url: &str) -> Account {
        Account::new(
            AccountId::new("uid-1"),
            "user@example.com",
            Endpoint::new(base_url),
            Endpoint::new(base_url),
        )
        .with_access_token("token-abc")
    }

    #[tokio::test]
    async fn test_fetch_delta_parses_changes() {
        let body = r#"{
            "changes": [
                {"op": "delete", "id": "m-1", "revision": 2, "position": 11}
            ],
            "cursor": 11
        }"#;
        let (base, request) = serve_once(200, body).await;

        let source = HttpMessageSource::new(client());
        let delta = source
            .fetch_delta(&account(&base), SyncCursor(10))
            .await
            .unwrap();

        assert_eq!(delta.cursor, SyncCursor(11));
        assert_eq!(delta.changes.len(), 1);

        let request = request.await.unwrap();
        assert!(request.starts_with("GET /accounts/uid-1/changes?cursor=10 "));
        assert!(request.to_lowercase().contains("authorization: bearer token-abc"));
    }

    #[tokio::test]
    async fn test_unauthorized_maps_to_auth() {
        let (base, _request) = serve_once(401, r#"{"error":"expired"}"#).await;

        let result = HttpMessageSource::new(client())
            .fetch_delta(&account(&base), SyncCursor::START)
            .await;
        assert!(matches!(result, Err(RemoteError::Auth(_))));
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let (base, _request) = serve_once(503, "{}").await;

        let result = HttpMessageSource::new(client())
            .fetch_delta(&account(&base), SyncCursor::START)
            .await;
        assert!(result.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn test_cursor_going_backwards_is_rejected() {
        let (base, _request) = serve_once(200, r#"{"changes": [], "cursor": 3}"#).await;

        let result = HttpMessageSource::new(client())
            .fetch_delta(&account(&base), SyncCursor(8))
            .await;
        assert!(matches!(result, Err(RemoteError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_signed_out_account_is_auth_error() {
        let mut account = account("http://127.0.0.1:9");
        account.access_token = None;

        let result = HttpMessageSource::new(client())
            .fetch_delta(&account, SyncCursor::START)
            .await;
        assert!(matches!(result, Err(RemoteError::Auth(_))));
    }
}
