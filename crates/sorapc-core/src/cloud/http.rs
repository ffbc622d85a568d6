//! HTTP/JSON document store client.

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{IF_MATCH, IF_NONE_MATCH};
use serde::Deserialize;
use tracing::debug;

use super::{CloudDocumentStore, DocumentRecord, WriteOutcome};
use crate::account::Account;
use crate::error::RemoteError;
use crate::model::{MessageId, Revision, SyncCursor};
use crate::remote::http::{bearer, error_for};

/// Documents live at `{base}/accounts/{account}/messages/{id}`.
#[derive(Debug, Clone, Default)]
pub struct HttpDocumentStore {
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct DocumentList {
    #[serde(default)]
    documents: Vec<DocumentRecord>,
}

#[derive(Debug, Deserialize)]
struct ConflictBody {
    revision: Revision,
}

impl HttpDocumentStore {
    /// Create a store client sharing the given HTTP client.
    #[must_use]
    pub const fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CloudDocumentStore for HttpDocumentStore {
    async fn read_since(
        &self,
        account: &Account,
        cursor: SyncCursor,
    ) -> Result<Vec<DocumentRecord>, RemoteError> {
        let token = bearer(account)?;
        let mut url = account
            .cloud
            .url_for(&["accounts", account.id.as_str(), "messages"])?;
        url.query_pairs_mut().append_pair("since", &cursor.to_string());

        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .timeout(account.cloud.timeout())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_for(response).await);
        }

        let mut list: DocumentList = response.json().await?;
        list.documents.sort_by_key(|record| record.sequence);
        debug!(
            account = %account.id,
            %cursor,
            documents = list.documents.len(),
            "Read documents"
        );
        Ok(list.documents)
    }

    async fn fetch(
        &self,
        account: &Account,
        id: &MessageId,
    ) -> Result<Option<DocumentRecord>, RemoteError> {
        let token = bearer(account)?;
        let url = account
            .cloud
            .url_for(&["accounts", account.id.as_str(), "messages", id.as_str()])?;

        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .timeout(account.cloud.timeout())
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(error_for(response).await);
        }

        Ok(Some(response.json().await?))
    }

    async fn write(
        &self,
        account: &Account,
        record: &DocumentRecord,
        expected: Option<Revision>,
    ) -> Result<WriteOutcome, RemoteError> {
        let token = bearer(account)?;
        let url = account.cloud.url_for(&[
            "accounts",
            account.id.as_str(),
            "messages",
            record.id.as_str(),
        ])?;

        let request = self
            .client
            .put(url)
            .bearer_auth(token)
            .timeout(account.cloud.timeout())
            .json(record);
        let request = match expected {
            Some(revision) => request.header(IF_MATCH, format!("\"{}\"", revision.0)),
            None => request.header(IF_NONE_MATCH, "*"),
        };

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::CONFLICT || status == StatusCode::PRECONDITION_FAILED {
            let body: ConflictBody = response.json().await?;
            debug!(
                account = %account.id,
                id = %record.id,
                existing = %body.revision,
                "Document write conflict"
            );
            return Ok(WriteOutcome::Conflict(body.revision));
        }
        if !status.is_success() {
            return Err(error_for(response).await);
        }

        Ok(WriteOutcome::Ack)
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

    fn tombstone() -> DocumentRecord {
        DocumentRecord {
            id: MessageId::new("m1"),
            revision: Revision(5),
            deleted: true,
            message: None,
            sequence: 0,
        }
    }

    #[tokio::test]
    async fn test_read_since_sorts_by_sequence() {
        let body = r#"{"documents": [
            {"id": "b", "revision": 2, "deleted": true, "sequence": 9},
            {"id": "a", "revision": 1, "deleted": true, "sequence": 7}
        ]}"#;
        let (base, request) = serve_once(200, body).await;

        let records = HttpDocumentStore::new(client())
            .read_since(&account(&base), SyncCursor(6))
            .await
            .unwrap();

        let sequences: Vec<_> = records.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![7, 9]);
        assert!(
            request
                .await
                .unwrap()
                .starts_with("GET /accounts/uid-1/messages?since=6 ")
        );
    }

    #[tokio::test]
    async fn test_fetch_missing_document() {
        let (base, _request) = serve_once(404, "{}").await;

        let record = HttpDocumentStore::new(client())
            .fetch(&account(&base), &MessageId::new("m1"))
            .await
            .unwrap();
        assert!(record.is_none());
    }

    #[tokio::test]
    async fn test_write_sends_if_match() {
        let (base, request) = serve_once(200, "{}").await;

        let outcome = HttpDocumentStore::new(client())
            .write(&account(&base), &tombstone(), Some(Revision(4)))
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Ack);

        let request = request.await.unwrap().to_lowercase();
        assert!(request.starts_with("put /accounts/uid-1/messages/m1 "));
        assert!(request.contains("if-match: \"4\""));
    }

    #[tokio::test]
    async fn test_write_conflict_returns_existing_revision() {
        let (base, _request) = serve_once(412, r#"{"revision": 7}"#).await;

        let outcome = HttpDocumentStore::new(client())
            .write(&account(&base), &tombstone(), None)
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Conflict(Revision(7)));
    }
}
