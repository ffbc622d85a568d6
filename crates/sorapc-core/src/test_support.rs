//! Minimal HTTP responder for client tests.
//!
//! Accepts a single connection, captures the request head and answers with a
//! canned response.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// HTTP client that never goes through a proxy.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .build()
        .expect("build test client")
}

/// Serves one response and returns the base URL plus a handle resolving to the
/// raw request (head and body).
pub async fn serve_once(status: u16, body: &str) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("listener address");
    let response = format!(
        "HTTP/1.1 {status} Test\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    );

    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut request = Vec::new();
        let mut buf = [0_u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.expect("read request");
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
            if request_complete(&request) {
                break;
            }
        }
        socket
            .write_all(response.as_bytes())
            .await
            .expect("write response");
        socket.shutdown().await.ok();
        String::from_utf8_lossy(&request).into_owned()
    });

    (format!("http://{addr}"), handle)
}

fn request_complete(request: &[u8]) -> bool {
    let Some(head_end) = request.windows(4).position(|w| w == b"\r\n\r\n") else {
        return false;
    };
    let head = String::from_utf8_lossy(&request[..head_end]).to_lowercase();
    let content_length = head
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    request.len() >= head_end + 4 + content_length
}

/// Scripted remote source and in-memory document store used by the sync tests.
pub mod fakes {
    #![allow(clippy::unwrap_used)]

    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use tokio::sync::Notify;

    use crate::account::{Account, AccountId, Endpoint};
    use crate::cloud::{CloudDocumentStore, DocumentRecord, WriteOutcome};
    use crate::error::RemoteError;
    use crate::model::{ChangeOrigin, Message, MessageChange, MessageId, Revision, SyncCursor};
    use crate::outgoing::{MailTransport, OutgoingMail};
    use crate::remote::{Delta, RemoteMessageSource};

    pub fn account() -> Account {
        Account::new(
            AccountId::new("acc-1"),
            "me@example.com",
            Endpoint::new("http://mail.invalid"),
            Endpoint::new("http://cloud.invalid"),
        )
        .with_access_token("token")
    }

    pub fn message(id: &str, revision: u64) -> Message {
        Message {
            id: MessageId::new(id),
            sender: "orders@pcshop.example".to_string(),
            recipients: vec!["me@example.com".to_string()],
            subject: format!("{id} r{revision}"),
            body_ref: format!("bodies/{id}"),
            timestamp: Utc.timestamp_opt(1_700_000_000 + i64::try_from(revision).unwrap(), 0).unwrap(),
            is_read: false,
            revision: Revision(revision),
        }
    }

    pub fn remote_upsert(id: &str, revision: u64, position: u64) -> MessageChange {
        MessageChange::upsert(message(id, revision), ChangeOrigin::Remote, SyncCursor(position))
    }

    pub fn local_upsert(id: &str, revision: u64, position: u64) -> MessageChange {
        MessageChange::upsert(message(id, revision), ChangeOrigin::Local, SyncCursor(position))
    }

    /// Remote source answering with queued results, then empty deltas.
    #[derive(Default)]
    pub struct FakeRemote {
        responses: Mutex<VecDeque<Result<Delta, RemoteError>>>,
        pub calls: AtomicUsize,
        pub hold: Option<std::sync::Arc<Notify>>,
    }

    impl FakeRemote {
        pub fn with(responses: Vec<Result<Delta, RemoteError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                ..Self::default()
            }
        }

        /// A source whose every fetch waits for `hold` to be notified.
        pub fn held(hold: std::sync::Arc<Notify>) -> Self {
            Self {
                hold: Some(hold),
                ..Self::default()
            }
        }

        pub fn push(&self, response: Result<Delta, RemoteError>) {
            self.responses.lock().unwrap().push_back(response);
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RemoteMessageSource for FakeRemote {
        async fn fetch_delta(
            &self,
            _account: &Account,
            cursor: SyncCursor,
        ) -> Result<Delta, RemoteError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(hold) = &self.hold {
                hold.notified().await;
            }
            let next = self.responses.lock().unwrap().pop_front();
            next.unwrap_or(Ok(Delta {
                changes: Vec::new(),
                cursor,
            }))
        }
    }

    /// Document store with compare-and-set writes.
    #[derive(Default)]
    pub struct FakeCloud {
        docs: Mutex<HashMap<MessageId, DocumentRecord>>,
        sequence: Mutex<u64>,
        failing: Mutex<HashMap<MessageId, RemoteError>>,
        pub writes: AtomicUsize,
    }

    impl FakeCloud {
        /// Store a document as if another device had written it.
        pub fn insert(&self, mut record: DocumentRecord) {
            let mut sequence = self.sequence.lock().unwrap();
            *sequence += 1;
            record.sequence = *sequence;
            self.docs.lock().unwrap().insert(record.id.clone(), record);
        }

        pub fn get(&self, id: &str) -> Option<DocumentRecord> {
            self.docs.lock().unwrap().get(&MessageId::new(id)).cloned()
        }

        pub fn fail_writes(&self, id: &str, error: RemoteError) {
            self.failing.lock().unwrap().insert(MessageId::new(id), error);
        }

        pub fn heal(&self, id: &str) {
            self.failing.lock().unwrap().remove(&MessageId::new(id));
        }

        pub fn writes(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CloudDocumentStore for FakeCloud {
        async fn read_since(
            &self,
            _account: &Account,
            cursor: SyncCursor,
        ) -> Result<Vec<DocumentRecord>, RemoteError> {
            let mut docs: Vec<_> = self
                .docs
                .lock()
                .unwrap()
                .values()
                .filter(|doc| doc.sequence > cursor.0)
                .cloned()
                .collect();
            docs.sort_by_key(|doc| doc.sequence);
            Ok(docs)
        }

        async fn fetch(
            &self,
            _account: &Account,
            id: &MessageId,
        ) -> Result<Option<DocumentRecord>, RemoteError> {
            Ok(self.docs.lock().unwrap().get(id).cloned())
        }

        async fn write(
            &self,
            _account: &Account,
            record: &DocumentRecord,
            expected: Option<Revision>,
        ) -> Result<WriteOutcome, RemoteError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            if let Some(error) = self.failing.lock().unwrap().get(&record.id) {
                return Err(error.clone());
            }

            let current = self.docs.lock().unwrap().get(&record.id).map(|doc| doc.revision);
            if current != expected {
                return Ok(WriteOutcome::Conflict(current.unwrap_or_default()));
            }
            self.insert(record.clone());
            Ok(WriteOutcome::Ack)
        }
    }

    /// Mail transport that records what it was asked to send.
    #[derive(Default)]
    pub struct FakeMailer {
        pub sent: Mutex<Vec<OutgoingMail>>,
        failure: Mutex<Option<RemoteError>>,
    }

    impl FakeMailer {
        pub fn failing(error: RemoteError) -> Self {
            Self {
                failure: Mutex::new(Some(error)),
                ..Self::default()
            }
        }

        pub fn sent(&self) -> Vec<OutgoingMail> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MailTransport for FakeMailer {
        async fn send(&self, mail: &OutgoingMail) -> Result<(), RemoteError> {
            if let Some(error) = self.failure.lock().unwrap().clone() {
                return Err(error);
            }
            self.sent.lock().unwrap().push(mail.clone());
            Ok(())
        }
    }
}
