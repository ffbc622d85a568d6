//! Sync coordinator.
//!
//! One run per account at a time. A run:
//!
//! 1. pushes queued local changes to the document store and hands queued
//!    outgoing mail to the mail transport,
//! 2. fetches the remote delta after the stored remote cursor and merges it,
//!    propagating local-origin changes to the document store,
//! 3. advances the remote cursor up to the first unresolved item,
//! 4. merges documents committed to the store since the cloud cursor,
//! 5. stamps the account as synced.
//!
//! The coordinator is the only writer of the cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::merge::{LocalEdit, apply_change};
use super::report::{SyncError, SyncFailure, SyncOutcome, SyncReport};
use super::retry::with_retry;
use crate::account::{Account, AccountId};
use crate::cache::{LocalCache, Page};
use crate::cloud::{CloudDocumentStore, DocumentRecord, WriteOutcome};
use crate::config::SyncConfig;
use crate::model::{ChangeOrigin, CursorSource, MessageChange, Revision, SyncCursor};
use crate::outgoing::{MailTransport, OutgoingMail};
use crate::remote::{Delta, RemoteMessageSource};

/// Attempts for a local edit racing with a concurrent merge.
const LOCAL_EDIT_ATTEMPTS: usize = 3;

/// Lower bound of the background interval.
const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Per-account run state.
#[derive(Debug, Default)]
struct AccountSlot {
    run_lock: tokio::sync::Mutex<()>,
    /// Shared by local edits, exclusive for sign-out.
    edit_lock: tokio::sync::RwLock<()>,
    cancel: Mutex<CancellationToken>,
}

impl AccountSlot {
    fn token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Cancels the current token and installs a fresh one for later runs.
    fn cancel_current(&self) {
        let mut token = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        token.cancel();
        *token = CancellationToken::new();
    }
}

/// What happened to a local change sent to the document store.
#[derive(Debug)]
enum Propagation {
    /// Stored at the given revision.
    Stored(Revision),
    /// The store held a newer revision, which was merged instead.
    Superseded,
    /// Not resolved in this run.
    Failed(String),
}

/// Reconciles the remote source, the document store and the local cache.
pub struct SyncCoordinator {
    cache: Arc<LocalCache>,
    remote: Arc<dyn RemoteMessageSource>,
    cloud: Arc<dyn CloudDocumentStore>,
    mail: Option<Arc<dyn MailTransport>>,
    config: SyncConfig,
    slots: Mutex<HashMap<AccountId, Arc<AccountSlot>>>,
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("config", &self.config)
            .field("mail", &self.mail.is_some())
            .finish_non_exhaustive()
    }
}

impl SyncCoordinator {
    /// Creates a coordinator over the given cache and endpoints.
    #[must_use]
    pub fn new(
        cache: Arc<LocalCache>,
        remote: Arc<dyn RemoteMessageSource>,
        cloud: Arc<dyn CloudDocumentStore>,
        config: SyncConfig,
    ) -> Self {
        Self {
            cache,
            remote,
            cloud,
            mail: None,
            config,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Deliver queued outgoing mail through `transport` during sync runs.
    ///
    /// Without a transport, queued mail stays in the cache.
    #[must_use]
    pub fn with_mail_transport(mut self, transport: Arc<dyn MailTransport>) -> Self {
        self.mail = Some(transport);
        self
    }

    /// The cache this coordinator writes to.
    #[must_use]
    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    fn slot(&self, account_id: &AccountId) -> Arc<AccountSlot> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(account_id.clone()).or_default())
    }

    /// Run a sync for the account.
    ///
    /// If a run for the account is already in flight, returns
    /// [`SyncOutcome::Coalesced`] without starting another one.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Auth`] when credentials are rejected,
    /// [`SyncError::TransientNetwork`] when an endpoint stays unreachable,
    /// [`SyncError::Cancelled`] when the account signs out mid-run. Progress
    /// made before the error is kept.
    pub async fn sync(&self, account: &Account) -> Result<SyncOutcome, SyncError> {
        let slot = self.slot(&account.id);
        let Ok(_guard) = slot.run_lock.try_lock() else {
            debug!(account = %account.id, "Sync already running, coalescing trigger");
            return Ok(SyncOutcome::Coalesced);
        };
        let cancel = slot.token();

        let started = Instant::now();
        match self.run(account, &cancel).await {
            Ok(report) => {
                info!(
                    account = %account.id,
                    applied = report.applied,
                    duplicates = report.duplicates,
                    stale = report.stale,
                    pushed = report.pushed,
                    mail_sent = report.mail_sent,
                    failures = report.failures.len(),
                    elapsed_ms = started.elapsed().as_millis(),
                    "Sync completed"
                );
                for failure in &report.failures {
                    warn!(account = %account.id, "{failure}");
                }
                Ok(SyncOutcome::Completed(report))
            }
            Err(e) => {
                warn!(account = %account.id, "Sync aborted: {e}");
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        account: &Account,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::default();

        self.push_outbox(account, cancel, &mut report).await?;
        ensure_active(cancel)?;
        self.send_outgoing(account, cancel, &mut report).await?;
        ensure_active(cancel)?;
        report.remote_cursor = self.pull_remote(account, cancel, &mut report).await?;
        ensure_active(cancel)?;
        report.cloud_cursor = self.pull_cloud(account, cancel, &mut report).await?;

        self.cache.mark_synced(&account.id, Utc::now()).await?;
        Ok(report)
    }

    /// Retry local changes left over from earlier runs.
    async fn push_outbox(
        &self,
        account: &Account,
        cancel: &CancellationToken,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let entries = self.cache.pending_outbox(&account.id).await?;
        if !entries.is_empty() {
            debug!(account = %account.id, queued = entries.len(), "Draining outbox");
        }

        for entry in entries {
            ensure_active(cancel)?;
            let id = entry.change.id().clone();
            let revision = entry.change.revision();

            match self
                .propagate(account, &entry.change, entry.base_revision, cancel)
                .await?
            {
                Propagation::Stored(stored) => {
                    self.cache.remove_outbox(&account.id, &id, stored).await?;
                    report.pushed += 1;
                }
                Propagation::Superseded => {
                    self.cache.remove_outbox(&account.id, &id, revision).await?;
                    report.superseded += 1;
                }
                Propagation::Failed(reason) => {
                    self.cache
                        .record_outbox_failure(&account.id, &id, &reason)
                        .await?;
                    report.failures.push(SyncFailure {
                        id,
                        revision,
                        reason,
                    });
                }
            }
        }

        Ok(())
    }

    /// Hand queued mail to the transport.
    ///
    /// Delivery failures, a rejected SMTP login included, leave the mail
    /// queued and never abort the run.
    async fn send_outgoing(
        &self,
        account: &Account,
        cancel: &CancellationToken,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let queued = self.cache.pending_mail(&account.id).await?;
        if queued.is_empty() {
            return Ok(());
        }
        let Some(transport) = &self.mail else {
            debug!(
                account = %account.id,
                queued = queued.len(),
                "No mail transport, mail stays queued"
            );
            report.mail_deferred += queued.len();
            return Ok(());
        };

        for entry in queued {
            ensure_active(cancel)?;
            match with_retry(&self.config.retry, cancel, || transport.send(&entry.mail)).await {
                Ok(()) => {
                    self.cache.remove_mail(entry.seq).await?;
                    report.mail_sent += 1;
                }
                Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
                Err(e) => {
                    warn!(account = %account.id, seq = entry.seq, "Mail not sent: {e}");
                    self.cache.record_mail_failure(entry.seq, &e.to_string()).await?;
                    report.mail_deferred += 1;
                }
            }
        }

        Ok(())
    }

    /// Fetch and merge the remote delta. Returns the cursor reached.
    async fn pull_remote(
        &self,
        account: &Account,
        cancel: &CancellationToken,
        report: &mut SyncReport,
    ) -> Result<SyncCursor, SyncError> {
        let cursor = self.cache.cursor(&account.id, CursorSource::Remote).await?;
        let delta = with_retry(&self.config.retry, cancel, || {
            self.remote.fetch_delta(account, cursor)
        })
        .await?;
        debug!(
            account = %account.id,
            %cursor,
            changes = delta.changes.len(),
            "Fetched remote delta"
        );

        let mut progress = cursor;
        let merged = self
            .merge_delta(account, &delta, cancel, &mut progress, report)
            .await;

        // Persist what was reached even when the run stops here.
        if progress > cursor {
            self.cache
                .advance_cursor(&account.id, CursorSource::Remote, progress)
                .await?;
        }
        merged?;
        Ok(progress)
    }

    async fn merge_delta(
        &self,
        account: &Account,
        delta: &Delta,
        cancel: &CancellationToken,
        progress: &mut SyncCursor,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let mut blocked = false;

        for change in &delta.changes {
            ensure_active(cancel)?;
            let resolved = self.merge_remote_change(account, change, cancel, report).await?;

            if !resolved && !blocked {
                debug!(
                    account = %account.id,
                    id = %change.id(),
                    position = %change.position,
                    "Holding remote cursor before unresolved change"
                );
                blocked = true;
            }
            if !blocked {
                *progress = (*progress).max(change.position);
            }
        }

        if !blocked {
            *progress = (*progress).max(delta.cursor);
        }
        Ok(())
    }

    /// Merge one delta entry. Returns whether it is fully resolved.
    async fn merge_remote_change(
        &self,
        account: &Account,
        change: &MessageChange,
        cancel: &CancellationToken,
        report: &mut SyncReport,
    ) -> Result<bool, SyncError> {
        let base = self.cache.stored_revision(&account.id, change.id()).await?;
        let outcome = apply_change(&self.cache, &account.id, change).await?;
        report.record(outcome);

        if change.origin != ChangeOrigin::Local || !outcome.is_applied() {
            return Ok(true);
        }

        match self.propagate(account, change, base, cancel).await? {
            Propagation::Stored(stored) => {
                self.cache
                    .remove_outbox(&account.id, change.id(), stored)
                    .await?;
                report.pushed += 1;
                Ok(true)
            }
            Propagation::Superseded => {
                report.superseded += 1;
                Ok(true)
            }
            Propagation::Failed(reason) => {
                self.cache.enqueue_outbox(&account.id, change, base).await?;
                self.cache
                    .record_outbox_failure(&account.id, change.id(), &reason)
                    .await?;
                report.failures.push(SyncFailure {
                    id: change.id().clone(),
                    revision: change.revision(),
                    reason,
                });
                Ok(false)
            }
        }
    }

    /// Merge documents committed to the store since the cloud cursor.
    async fn pull_cloud(
        &self,
        account: &Account,
        cancel: &CancellationToken,
        report: &mut SyncReport,
    ) -> Result<SyncCursor, SyncError> {
        let cursor = self.cache.cursor(&account.id, CursorSource::Cloud).await?;
        let mut records = with_retry(&self.config.retry, cancel, || {
            self.cloud.read_since(account, cursor)
        })
        .await?;
        records.sort_by_key(|record| record.sequence);

        let mut progress = cursor;
        let mut merged = Ok(());
        for record in records.iter().filter(|r| r.sequence > cursor.0) {
            if let Err(e) = ensure_active(cancel) {
                merged = Err(e);
                break;
            }
            if let Some(change) = record.to_change() {
                let outcome = apply_change(&self.cache, &account.id, &change).await?;
                report.record(outcome);
            }
            progress = progress.max(SyncCursor(record.sequence));
        }

        if progress > cursor {
            self.cache
                .advance_cursor(&account.id, CursorSource::Cloud, progress)
                .await?;
        }
        merged.map(|()| progress)
    }

    /// Write a local change to the document store.
    ///
    /// On conflict the stored document is fetched. A higher stored revision
    /// wins and is merged into the cache. A tie with different content
    /// rebases our change onto the next revision. Otherwise the write is
    /// retried against the stored revision, up to `max_conflict_attempts`
    /// writes in total.
    async fn propagate(
        &self,
        account: &Account,
        change: &MessageChange,
        base: Option<Revision>,
        cancel: &CancellationToken,
    ) -> Result<Propagation, SyncError> {
        let mut record = DocumentRecord::from_change(change);
        let mut expected = base;
        let attempts = self.config.max_conflict_attempts.max(1);

        for attempt in 1..=attempts {
            let written = with_retry(&self.config.retry, cancel, || {
                self.cloud.write(account, &record, expected)
            })
            .await;
            let existing = match written {
                Ok(WriteOutcome::Ack) => {
                    debug!(id = %record.id, revision = %record.revision, "Stored local change");
                    return Ok(Propagation::Stored(record.revision));
                }
                Ok(WriteOutcome::Conflict(existing)) => existing,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => return Ok(Propagation::Failed(e.to_string())),
            };
            debug!(
                id = %record.id,
                attempt,
                ours = %record.revision,
                theirs = %existing,
                "Write conflict"
            );

            let current = match with_retry(&self.config.retry, cancel, || {
                self.cloud.fetch(account, &record.id)
            })
            .await
            {
                Ok(current) => current,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => return Ok(Propagation::Failed(e.to_string())),
            };

            let Some(current) = current else {
                expected = None;
                continue;
            };

            if current.revision > record.revision {
                if let Some(theirs) = current.to_change() {
                    apply_change(&self.cache, &account.id, &theirs).await?;
                }
                return Ok(Propagation::Superseded);
            }

            if current.revision == record.revision {
                if same_content(&current, &record) {
                    return Ok(Propagation::Stored(record.revision));
                }
                rebase(&mut record, current.revision.next());
                if let Some(rebased) = record.to_change() {
                    apply_change(&self.cache, &account.id, &rebased).await?;
                }
            }
            expected = Some(current.revision);
        }

        Ok(Propagation::Failed(format!(
            "write conflict unresolved after {attempts} attempts"
        )))
    }

    /// Apply a user edit to the cache and queue it for the document store.
    ///
    /// Returns the change made, or `None` if the edit changed nothing. The
    /// change reaches the store on the next sync run.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::MessageNotFound`] if the message is not cached.
    pub async fn apply_local_change(
        &self,
        account: &Account,
        edit: &LocalEdit,
    ) -> Result<Option<MessageChange>, SyncError> {
        let slot = self.slot(&account.id);
        let _edit = slot.edit_lock.read().await;

        for _ in 0..LOCAL_EDIT_ATTEMPTS {
            let Some(current) = self.cache.get(&account.id, edit.id()).await? else {
                return Err(SyncError::MessageNotFound(edit.id().clone()));
            };
            let Some(change) = edit.to_change(&current) else {
                return Ok(None);
            };

            let outcome = apply_change(&self.cache, &account.id, &change).await?;
            if outcome.is_applied() {
                self.cache
                    .enqueue_outbox(&account.id, &change, Some(current.revision))
                    .await?;
                debug!(
                    account = %account.id,
                    id = %edit.id(),
                    revision = %change.revision(),
                    "Queued local edit"
                );
                return Ok(Some(change));
            }
        }

        Err(SyncError::Contended(edit.id().clone()))
    }

    /// Queue a mail for delivery on the next sync run.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Cache`] if the mail cannot be stored.
    pub async fn queue_mail(
        &self,
        account: &Account,
        mail: &OutgoingMail,
    ) -> Result<(), SyncError> {
        let slot = self.slot(&account.id);
        let _edit = slot.edit_lock.read().await;

        let seq = self.cache.enqueue_mail(&account.id, mail).await?;
        debug!(account = %account.id, seq, to = ?mail.to, "Queued outgoing mail");
        Ok(())
    }

    /// A page of the account's messages, newest first.
    ///
    /// Cached data older than the staleness threshold triggers a sync first.
    /// If that sync fails for a transient reason the cached page is served.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Auth`] if the account must sign in again.
    pub async fn request_page(
        &self,
        account: &Account,
        offset: u64,
        limit: u64,
    ) -> Result<Page, SyncError> {
        let stale = self
            .cache
            .last_synced_at(&account.id)
            .await?
            .is_none_or(|at| {
                Utc::now()
                    .signed_duration_since(at)
                    .to_std()
                    .map_or(true, |age| age >= self.config.staleness())
            });

        if stale {
            match self.sync(account).await {
                Ok(_) => {}
                Err(e @ (SyncError::Auth(_) | SyncError::Cancelled)) => return Err(e),
                Err(e) => warn!(account = %account.id, "Serving cached page: {e}"),
            }
        }

        Ok(self.cache.list_page(&account.id, offset, limit).await?)
    }

    /// Cancel the in-flight run and the periodic task of an account.
    ///
    /// Later triggers start fresh runs.
    pub fn cancel(&self, account_id: &AccountId) {
        self.slot(account_id).cancel_current();
        debug!(account = %account_id, "Sync cancelled");
    }

    /// Stop any run for the account and drop everything cached for it.
    ///
    /// Waits for the in-flight run and local edits to finish, so nothing
    /// they write survives the purge. The stored credential is owned by the caller and removed there.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be purged.
    pub async fn sign_out(&self, account: &Account) -> Result<(), SyncError> {
        self.cancel(&account.id);
        let slot = self.slot(&account.id);
        let _run = slot.run_lock.lock().await;
        let _edits = slot.edit_lock.write().await;

        self.cache.purge_account(&account.id).await?;
        info!(account = %account.id, "Signed out, cache purged");
        Ok(())
    }

    /// Sync the account every `interval_secs` until it signs out or
    /// re-authentication is required.
    pub fn spawn_periodic(self: &Arc<Self>, account: Account) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let cancel = self.slot(&account.id).token();
        let interval = self.config.interval().max(MIN_INTERVAL);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        info!(account = %account.id, "Periodic sync stopped");
                        break;
                    }
                    _ = ticker.tick() => match this.sync(&account).await {
                        Ok(outcome) => debug!(account = %account.id, ?outcome, "Periodic sync tick"),
                        Err(SyncError::Auth(reason)) => {
                            warn!(
                                account = %account.id,
                                "Re-authentication required, stopping periodic sync: {reason}"
                            );
                            break;
                        }
                        Err(SyncError::Cancelled) => break,
                        Err(e) => warn!(account = %account.id, "Periodic sync failed: {e}"),
                    },
                }
            }
        })
    }
}

fn ensure_active(cancel: &CancellationToken) -> Result<(), SyncError> {
    if cancel.is_cancelled() {
        Err(SyncError::Cancelled)
    } else {
        Ok(())
    }
}

fn same_content(a: &DocumentRecord, b: &DocumentRecord) -> bool {
    a.to_change().map(|c| c.op) == b.to_change().map(|c| c.op)
}

fn rebase(record: &mut DocumentRecord, revision: Revision) {
    record.revision = revision;
    if let Some(message) = record.message.as_mut() {
        message.revision = revision;
    }
}
