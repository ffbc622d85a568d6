//! Local cache storage repository.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};

use super::model::{OutboxEntry, Page, QueuedMail, UpsertOutcome};
use crate::model::{CursorSource, Message, MessageChange, MessageId, Revision, SyncCursor};
use crate::outgoing::{MailAttachment, MailBody, OutgoingMail};
use crate::{AccountId, Error, Result};

/// `SQLite` stores signed 64-bit integers; revisions and cursors are unsigned.
fn to_db(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_db(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

/// How long a writer waits for another connection's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Classifies a merge from the revision seen before it and whether the
/// guarded write changed a row.
fn classify(
    before: Option<Revision>,
    written: bool,
    after: Option<Revision>,
    incoming: Revision,
) -> UpsertOutcome {
    match (written, before) {
        (true, None) => UpsertOutcome::Inserted,
        (true, Some(_)) => UpsertOutcome::Updated,
        (false, _) if after == Some(incoming) => UpsertOutcome::Duplicate,
        (false, _) => UpsertOutcome::Stale,
    }
}

/// Repository for cached messages, sync cursors and the outbox.
///
/// Reads are public; every write is reserved to the sync coordinator.
pub struct LocalCache {
    pool: SqlitePool,
}

impl LocalCache {
    /// Open the cache database at the given path.
    ///
    /// Creates the database and tables if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn new(database_path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let cache = Self { pool };
        cache.initialize().await?;
        Ok(cache)
    }

    /// Create an in-memory cache for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let cache = Self { pool };
        cache.initialize().await?;
        Ok(cache)
    }

    /// Initialize database schema.
    async fn initialize(&self) -> Result<()> {
        // Tombstones (deleted = 1) keep the revision of a deletion so that
        // older upserts arriving later cannot resurrect the message.
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS messages (
                account_id TEXT NOT NULL,
                id TEXT NOT NULL,
                sender TEXT NOT NULL DEFAULT '',
                recipients TEXT NOT NULL DEFAULT '[]',
                subject TEXT NOT NULL DEFAULT '',
                body_ref TEXT NOT NULL DEFAULT '',
                timestamp_ms INTEGER NOT NULL DEFAULT 0,
                is_read INTEGER NOT NULL DEFAULT 0,
                revision INTEGER NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0,
                cached_at TEXT NOT NULL,
                PRIMARY KEY(account_id, id)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_messages_list
            ON messages(account_id, deleted, timestamp_ms DESC, id)
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS sync_cursors (
                account_id TEXT NOT NULL,
                source TEXT NOT NULL,
                position INTEGER NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY(account_id, source)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS sync_state (
                account_id TEXT PRIMARY KEY,
                last_synced_at TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS outbox (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT NOT NULL,
                message_id TEXT NOT NULL,
                revision INTEGER NOT NULL,
                change_json TEXT NOT NULL,
                base_revision INTEGER,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                queued_at TEXT NOT NULL,
                UNIQUE(account_id, message_id)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS outgoing_mail (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT NOT NULL,
                recipients TEXT NOT NULL,
                subject TEXT NOT NULL,
                body_kind TEXT NOT NULL,
                body TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                queued_at TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS outgoing_attachments (
                mail_seq INTEGER NOT NULL REFERENCES outgoing_mail(seq) ON DELETE CASCADE,
                position INTEGER NOT NULL,
                file_name TEXT NOT NULL,
                content_type TEXT NOT NULL,
                data BLOB NOT NULL,
                PRIMARY KEY(mail_seq, position)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn message_from_row(row: &SqliteRow) -> Result<Message> {
        let recipients: String = row.get("recipients");
        let timestamp_ms = row.get::<i64, _>("timestamp_ms");
        let timestamp = DateTime::from_timestamp_millis(timestamp_ms).ok_or_else(|| {
            Error::CorruptRow(format!("timestamp {timestamp_ms} out of range"))
        })?;

        Ok(Message {
            id: MessageId(row.get("id")),
            sender: row.get("sender"),
            recipients: serde_json::from_str(&recipients)?,
            subject: row.get("subject"),
            body_ref: row.get("body_ref"),
            timestamp,
            is_read: row.get::<bool, _>("is_read"),
            revision: Revision(from_db(row.get::<i64, _>("revision"))),
        })
    }

    /// Get a visible message by id.
    ///
    /// Returns `None` if the message is unknown or was deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails or the row cannot be
    /// decoded.
    pub async fn get(&self, account_id: &AccountId, id: &MessageId) -> Result<Option<Message>> {
        let row = sqlx::query(
            r"
            SELECT id, sender, recipients, subject, body_ref, timestamp_ms, is_read, revision
            FROM messages
            WHERE account_id = ? AND id = ? AND deleted = 0
            ",
        )
        .bind(account_id.as_str())
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::message_from_row).transpose()
    }

    /// Revision stored for a message, including deleted ones.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn stored_revision(
        &self,
        account_id: &AccountId,
        id: &MessageId,
    ) -> Result<Option<Revision>> {
        let row = sqlx::query(r"SELECT revision FROM messages WHERE account_id = ? AND id = ?")
            .bind(account_id.as_str())
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| Revision(from_db(row.get::<i64, _>("revision")))))
    }

    /// List one page of visible messages, newest first.
    ///
    /// The count and the rows are read in a single transaction so the page
    /// is consistent even while sync writes are running.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn list_page(
        &self,
        account_id: &AccountId,
        offset: u64,
        limit: u64,
    ) -> Result<Page> {
        let mut tx = self.pool.begin().await?;

        let total: i64 = sqlx::query(
            r"SELECT COUNT(*) AS count FROM messages WHERE account_id = ? AND deleted = 0",
        )
        .bind(account_id.as_str())
        .fetch_one(&mut *tx)
        .await?
        .get("count");

        let rows = sqlx::query(
            r"
            SELECT id, sender, recipients, subject, body_ref, timestamp_ms, is_read, revision
            FROM messages
            WHERE account_id = ? AND deleted = 0
            ORDER BY timestamp_ms DESC, id ASC
            LIMIT ? OFFSET ?
            ",
        )
        .bind(account_id.as_str())
        .bind(to_db(limit))
        .bind(to_db(offset))
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Page {
            messages: rows
                .iter()
                .map(Self::message_from_row)
                .collect::<Result<_>>()?,
            total: from_db(total),
            offset,
        })
    }

    /// Merge a message state into the cache.
    ///
    /// Higher revisions win. Re-applying a stored revision is a no-op and
    /// lower revisions are ignored. The revision check and the write are a
    /// single statement, so concurrent writers never interleave between
    /// them.
    pub(crate) async fn upsert(
        &self,
        account_id: &AccountId,
        message: &Message,
    ) -> Result<UpsertOutcome> {
        let before = self.stored_revision(account_id, &message.id).await?;

        let written = sqlx::query(
            r"
            INSERT INTO messages
                (account_id, id, sender, recipients, subject, body_ref, timestamp_ms,
                 is_read, revision, deleted, cached_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?)
            ON CONFLICT(account_id, id) DO UPDATE SET
                sender = excluded.sender,
                recipients = excluded.recipients,
                subject = excluded.subject,
                body_ref = excluded.body_ref,
                timestamp_ms = excluded.timestamp_ms,
                is_read = excluded.is_read,
                revision = excluded.revision,
                deleted = 0,
                cached_at = excluded.cached_at
            WHERE excluded.revision > messages.revision
            ",
        )
        .bind(account_id.as_str())
        .bind(message.id.as_str())
        .bind(&message.sender)
        .bind(serde_json::to_string(&message.recipients)?)
        .bind(&message.subject)
        .bind(&message.body_ref)
        .bind(message.timestamp.timestamp_millis())
        .bind(message.is_read)
        .bind(to_db(message.revision.0))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?
        .rows_affected()
            > 0;

        self.outcome(account_id, &message.id, before, written, message.revision)
            .await
    }

    /// Record a deletion as a tombstone, following the same revision rule as
    /// [`upsert`](Self::upsert).
    pub(crate) async fn delete(
        &self,
        account_id: &AccountId,
        id: &MessageId,
        revision: Revision,
    ) -> Result<UpsertOutcome> {
        let before = self.stored_revision(account_id, id).await?;

        let written = sqlx::query(
            r"
            INSERT INTO messages (account_id, id, revision, deleted, cached_at)
            VALUES (?, ?, ?, 1, ?)
            ON CONFLICT(account_id, id) DO UPDATE SET
                revision = excluded.revision,
                deleted = 1,
                cached_at = excluded.cached_at
            WHERE excluded.revision > messages.revision
            ",
        )
        .bind(account_id.as_str())
        .bind(id.as_str())
        .bind(to_db(revision.0))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?
        .rows_affected()
            > 0;

        self.outcome(account_id, id, before, written, revision).await
    }

    async fn outcome(
        &self,
        account_id: &AccountId,
        id: &MessageId,
        before: Option<Revision>,
        written: bool,
        incoming: Revision,
    ) -> Result<UpsertOutcome> {
        let after = if written {
            None
        } else {
            self.stored_revision(account_id, id).await?
        };
        Ok(classify(before, written, after, incoming))
    }

    /// Current cursor for a source, or [`SyncCursor::START`].
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn cursor(&self, account_id: &AccountId, source: CursorSource) -> Result<SyncCursor> {
        let row = sqlx::query(
            r"SELECT position FROM sync_cursors WHERE account_id = ? AND source = ?",
        )
        .bind(account_id.as_str())
        .bind(source.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map_or(SyncCursor::START, |row| {
            SyncCursor(from_db(row.get::<i64, _>("position")))
        }))
    }

    /// Move a cursor forward. A cursor never moves backwards.
    pub(crate) async fn advance_cursor(
        &self,
        account_id: &AccountId,
        source: CursorSource,
        cursor: SyncCursor,
    ) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO sync_cursors (account_id, source, position, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(account_id, source) DO UPDATE SET
                position = MAX(position, excluded.position),
                updated_at = excluded.updated_at
            ",
        )
        .bind(account_id.as_str())
        .bind(source.as_str())
        .bind(to_db(cursor.0))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// When the last sync run for the account completed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn last_synced_at(&self, account_id: &AccountId) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(r"SELECT last_synced_at FROM sync_state WHERE account_id = ?")
            .bind(account_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.and_then(|row| {
            let value: String = row.get("last_synced_at");
            DateTime::parse_from_rfc3339(&value)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        }))
    }

    pub(crate) async fn mark_synced(&self, account_id: &AccountId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO sync_state (account_id, last_synced_at) VALUES (?, ?)
            ON CONFLICT(account_id) DO UPDATE SET last_synced_at = excluded.last_synced_at
            ",
        )
        .bind(account_id.as_str())
        .bind(at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Queue a local change for propagation.
    ///
    /// One entry is kept per message. A newer change replaces the queued one
    /// but keeps its base revision, which is what the document store still
    /// holds.
    pub(crate) async fn enqueue_outbox(
        &self,
        account_id: &AccountId,
        change: &MessageChange,
        base_revision: Option<Revision>,
    ) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO outbox
                (account_id, message_id, revision, change_json, base_revision, attempts, queued_at)
            VALUES (?, ?, ?, ?, ?, 0, ?)
            ON CONFLICT(account_id, message_id) DO UPDATE SET
                revision = excluded.revision,
                change_json = excluded.change_json,
                attempts = 0,
                last_error = NULL
            WHERE excluded.revision > outbox.revision
            ",
        )
        .bind(account_id.as_str())
        .bind(change.id().as_str())
        .bind(to_db(change.revision().0))
        .bind(serde_json::to_string(change)?)
        .bind(base_revision.map(|r| to_db(r.0)))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Outbox entries of an account, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails or a stored change
    /// cannot be decoded.
    pub async fn pending_outbox(&self, account_id: &AccountId) -> Result<Vec<OutboxEntry>> {
        let rows = sqlx::query(
            r"
            SELECT change_json, base_revision, attempts, last_error, queued_at
            FROM outbox
            WHERE account_id = ?
            ORDER BY seq ASC
            ",
        )
        .bind(account_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            let change_json: String = row.get("change_json");
            let queued_at: String = row.get("queued_at");
            entries.push(OutboxEntry {
                change: serde_json::from_str(&change_json)?,
                base_revision: row
                    .get::<Option<i64>, _>("base_revision")
                    .map(|r| Revision(from_db(r))),
                attempts: row.get::<u32, _>("attempts"),
                last_error: row.get("last_error"),
                queued_at: DateTime::parse_from_rfc3339(&queued_at)
                    .map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc)),
            });
        }

        Ok(entries)
    }

    /// Remove an outbox entry once its change reached the document store.
    ///
    /// Entries replaced by a newer change in the meantime are kept.
    pub(crate) async fn remove_outbox(
        &self,
        account_id: &AccountId,
        id: &MessageId,
        revision: Revision,
    ) -> Result<()> {
        sqlx::query(
            r"DELETE FROM outbox WHERE account_id = ? AND message_id = ? AND revision <= ?",
        )
        .bind(account_id.as_str())
        .bind(id.as_str())
        .bind(to_db(revision.0))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record a failed propagation attempt.
    pub(crate) async fn record_outbox_failure(
        &self,
        account_id: &AccountId,
        id: &MessageId,
        error: &str,
    ) -> Result<()> {
        sqlx::query(
            r"
            UPDATE outbox SET attempts = attempts + 1, last_error = ?
            WHERE account_id = ? AND message_id = ?
            ",
        )
        .bind(error)
        .bind(account_id.as_str())
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Queue a mail for delivery. Returns its queue position.
    pub(crate) async fn enqueue_mail(
        &self,
        account_id: &AccountId,
        mail: &OutgoingMail,
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let seq = sqlx::query(
            r"
            INSERT INTO outgoing_mail (account_id, recipients, subject, body_kind, body, queued_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(account_id.as_str())
        .bind(serde_json::to_string(&mail.to)?)
        .bind(&mail.subject)
        .bind(mail.body.kind())
        .bind(mail.body.content())
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        for (position, attachment) in (0_i64..).zip(&mail.attachments) {
            sqlx::query(
                r"
                INSERT INTO outgoing_attachments
                    (mail_seq, position, file_name, content_type, data)
                VALUES (?, ?, ?, ?, ?)
                ",
            )
            .bind(seq)
            .bind(position)
            .bind(&attachment.file_name)
            .bind(&attachment.content_type)
            .bind(&attachment.data)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(seq)
    }

    /// Mail waiting to be sent for an account, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails or a stored mail cannot
    /// be decoded.
    pub async fn pending_mail(&self, account_id: &AccountId) -> Result<Vec<QueuedMail>> {
        let rows = sqlx::query(
            r"
            SELECT seq, recipients, subject, body_kind, body, attempts, last_error, queued_at
            FROM outgoing_mail
            WHERE account_id = ?
            ORDER BY seq ASC
            ",
        )
        .bind(account_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut queued = Vec::with_capacity(rows.len());
        for row in &rows {
            let seq: i64 = row.get("seq");
            let recipients: String = row.get("recipients");
            let body_kind: String = row.get("body_kind");
            let queued_at: String = row.get("queued_at");

            let attachments = sqlx::query(
                r"
                SELECT file_name, content_type, data
                FROM outgoing_attachments
                WHERE mail_seq = ?
                ORDER BY position ASC
                ",
            )
            .bind(seq)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|row| MailAttachment {
                file_name: row.get("file_name"),
                content_type: row.get("content_type"),
                data: row.get("data"),
            })
            .collect();

            queued.push(QueuedMail {
                seq,
                mail: OutgoingMail {
                    to: serde_json::from_str(&recipients)?,
                    subject: row.get("subject"),
                    body: MailBody::from_parts(&body_kind, row.get("body")),
                    attachments,
                },
                attempts: row.get::<u32, _>("attempts"),
                last_error: row.get("last_error"),
                queued_at: DateTime::parse_from_rfc3339(&queued_at)
                    .map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc)),
            });
        }

        Ok(queued)
    }

    /// Drop a mail once the server accepted it.
    pub(crate) async fn remove_mail(&self, seq: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(r"DELETE FROM outgoing_attachments WHERE mail_seq = ?")
            .bind(seq)
            .execute(&mut *tx)
            .await?;
        sqlx::query(r"DELETE FROM outgoing_mail WHERE seq = ?")
            .bind(seq)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Record a failed delivery attempt.
    pub(crate) async fn record_mail_failure(&self, seq: i64, error: &str) -> Result<()> {
        sqlx::query(
            r"UPDATE outgoing_mail SET attempts = attempts + 1, last_error = ? WHERE seq = ?",
        )
        .bind(error)
        .bind(seq)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Remove everything stored for an account.
    pub(crate) async fn purge_account(&self, account_id: &AccountId) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r"
            DELETE FROM outgoing_attachments
            WHERE mail_seq IN (SELECT seq FROM outgoing_mail WHERE account_id = ?)
            ",
        )
        .bind(account_id.as_str())
        .execute(&mut *tx)
        .await?;

        for table in ["messages", "sync_cursors", "sync_state", "outbox", "outgoing_mail"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE account_id = ?"))
                .bind(account_id.as_str())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}
