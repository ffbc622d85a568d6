//! End-to-end sync flow across two devices sharing one document store.

#![allow(clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use sorapc_core::{
    Account, AccountId, ChangeOrigin, CloudDocumentStore, Delta, DocumentRecord, Endpoint,
    LocalCache, LocalEdit, Message, MessageChange, MessageId, RemoteError, RemoteMessageSource,
    RetryPolicy, Revision, SyncConfig, SyncCoordinator, SyncCursor, SyncError, SyncOutcome,
    WriteOutcome,
};
use tokio_test::{assert_err, assert_ok};

/// Mail server log: every change ever made, served from a cursor.
#[derive(Default)]
struct ServerLog {
    changes: Mutex<Vec<MessageChange>>,
    revoked: Mutex<bool>,
}

impl ServerLog {
    fn deliver(&self, message: Message) {
        let mut changes = self.changes.lock().unwrap();
        let position = SyncCursor(changes.len() as u64 + 1);
        changes.push(MessageChange::upsert(message, ChangeOrigin::Remote, position));
    }
}

#[async_trait]
impl RemoteMessageSource for ServerLog {
    async fn fetch_delta(
        &self,
        _account: &Account,
        cursor: SyncCursor,
    ) -> Result<Delta, RemoteError> {
        if *self.revoked.lock().unwrap() {
            return Err(RemoteError::Auth("token revoked".into()));
        }
        let changes = self.changes.lock().unwrap();
        let pending: Vec<_> = changes
            .iter()
            .filter(|change| change.position > cursor)
            .cloned()
            .collect();
        Ok(Delta {
            changes: pending,
            cursor: SyncCursor(changes.len() as u64),
        })
    }
}

/// Shared document store with compare-and-set writes.
#[derive(Default)]
struct SharedStore {
    docs: Mutex<(u64, HashMap<MessageId, DocumentRecord>)>,
}

#[async_trait]
impl CloudDocumentStore for SharedStore {
    async fn read_since(
        &self,
        _account: &Account,
        cursor: SyncCursor,
    ) -> Result<Vec<DocumentRecord>, RemoteError> {
        let docs = self.docs.lock().unwrap();
        let mut records: Vec<_> = docs
            .1
            .values()
            .filter(|doc| doc.sequence > cursor.0)
            .cloned()
            .collect();
        records.sort_by_key(|doc| doc.sequence);
        Ok(records)
    }

    async fn fetch(
        &self,
        _account: &Account,
        id: &MessageId,
    ) -> Result<Option<DocumentRecord>, RemoteError> {
        Ok(self.docs.lock().unwrap().1.get(id).cloned())
    }

    async fn write(
        &self,
        _account: &Account,
        record: &DocumentRecord,
        expected: Option<Revision>,
    ) -> Result<WriteOutcome, RemoteError> {
        let mut docs = self.docs.lock().unwrap();
        let current = docs.1.get(&record.id).map(|doc| doc.revision);
        if current != expected {
            return Ok(WriteOutcome::Conflict(current.unwrap_or_default()));
        }
        docs.0 += 1;
        let mut stored = record.clone();
        stored.sequence = docs.0;
        docs.1.insert(stored.id.clone(), stored);
        Ok(WriteOutcome::Ack)
    }
}

fn account() -> Account {
    Account::new(
        AccountId::new("shopper"),
        "shopper@example.com",
        Endpoint::new("http://mail.invalid"),
        Endpoint::new("http://cloud.invalid"),
    )
    .with_access_token("token")
}

fn receipt(id: &str, minute: u32) -> Message {
    Message {
        id: MessageId::new(id),
        sender: "orders@pcshop.example".to_string(),
        recipients: vec!["shopper@example.com".to_string()],
        subject: format!("Order {id} confirmed"),
        body_ref: format!("bodies/{id}"),
        timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap(),
        is_read: false,
        revision: Revision(1),
    }
}

fn config() -> SyncConfig {
    SyncConfig {
        retry: RetryPolicy {
            max_attempts: 2,
            base_backoff_ms: 1,
            max_backoff_ms: 2,
        },
        ..SyncConfig::default()
    }
}

async fn device(server: &Arc<ServerLog>, store: &Arc<SharedStore>) -> SyncCoordinator {
    let cache = Arc::new(LocalCache::in_memory().await.unwrap());
    SyncCoordinator::new(cache, server.clone(), store.clone(), config())
}

async fn sync(device: &SyncCoordinator, account: &Account) {
    let outcome = assert_ok!(device.sync(account).await);
    assert!(matches!(outcome, SyncOutcome::Completed(report) if report.is_clean()));
}

#[tokio::test]
async fn edits_on_one_device_reach_the_other() {
    let server = Arc::new(ServerLog::default());
    let store = Arc::new(SharedStore::default());
    let account = account();
    server.deliver(receipt("o-1", 0));
    server.deliver(receipt("o-2", 5));

    let laptop = device(&server, &store).await;
    let phone = device(&server, &store).await;
    sync(&laptop, &account).await;
    sync(&phone, &account).await;

    let page = assert_ok!(laptop.request_page(&account, 0, 10).await);
    assert_eq!(page.total, 2);
    assert_eq!(page.messages[0].id, MessageId::new("o-2"));

    assert_ok!(
        laptop
            .apply_local_change(&account, &LocalEdit::MarkRead(MessageId::new("o-1")))
            .await
    );
    assert_ok!(
        laptop
            .apply_local_change(&account, &LocalEdit::Delete(MessageId::new("o-2")))
            .await
    );
    sync(&laptop, &account).await;
    sync(&phone, &account).await;

    let on_phone = phone.cache().get(&account.id, &MessageId::new("o-1")).await.unwrap().unwrap();
    assert!(on_phone.is_read);
    assert_eq!(on_phone.revision, Revision(2));
    assert!(phone.cache().get(&account.id, &MessageId::new("o-2")).await.unwrap().is_none());

    // The server redelivering an old state must not undo the edits.
    server.deliver(receipt("o-1", 0));
    sync(&phone, &account).await;
    let on_phone = phone.cache().get(&account.id, &MessageId::new("o-1")).await.unwrap().unwrap();
    assert!(on_phone.is_read);
}

#[tokio::test]
async fn revoked_token_halts_sync_but_keeps_cache() {
    let server = Arc::new(ServerLog::default());
    let store = Arc::new(SharedStore::default());
    let account = account();
    server.deliver(receipt("o-1", 0));

    let laptop = device(&server, &store).await;
    sync(&laptop, &account).await;

    *server.revoked.lock().unwrap() = true;
    let err = assert_err!(laptop.sync(&account).await);
    assert!(matches!(err, SyncError::Auth(_)));

    let page = assert_ok!(laptop.cache().list_page(&account.id, 0, 10).await);
    assert_eq!(page.total, 1);
}

#[tokio::test]
async fn sign_out_forgets_the_account() {
    let server = Arc::new(ServerLog::default());
    let store = Arc::new(SharedStore::default());
    let account = account();
    server.deliver(receipt("o-1", 0));

    let laptop = device(&server, &store).await;
    sync(&laptop, &account).await;
    assert_ok!(laptop.sign_out(&account).await);

    let page = assert_ok!(laptop.cache().list_page(&account.id, 0, 10).await);
    assert_eq!(page.total, 0);
    assert!(assert_ok!(laptop.cache().last_synced_at(&account.id).await).is_none());
}
