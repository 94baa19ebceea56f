//! Transaction ledger.
//!
//! The ledger is the single source of truth for transaction state. It keeps
//! the most recent records (newest first, bounded by capacity) under one
//! namespace key of a [`StorageBackend`], plus a scratch namespace for the
//! shopper's in-progress cart.
//!
//! ```text
//!   create / update_status / mark_redeemed / record_pass_issued
//!                          │
//!                          ▼
//!   ┌──────────────────────────────────────────────┐
//!   │ read "transactions" @ revision r             │◀──┐
//!   │ apply change in memory                       │   │ Conflict or
//!   │ write "transactions" if revision still == r  │───┘ transient error
//!   └──────────────────────┬───────────────────────┘   (backoff, re-read)
//!                          │ applied
//!                          ▼
//!                notify subscribers with the full record set
//! ```
//!
//! Every mutation re-reads and re-applies on retry, so concurrent writers on
//! different devices converge: the first terminal status wins and later
//! attempts observe it and become no-ops.

mod retry;
mod store;

pub use retry::{retry_transient, RetryPolicy};
pub use store::{FileStore, MemoryStore, StorageBackend, Versioned};

use crate::clock::SharedClock;
use crate::error::{Error, Result};
use crate::record::{CheckoutSession, TransactionRecord, TransactionStatus};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Namespace key holding the record collection.
pub const TRANSACTIONS_KEY: &str = "transactions";

/// Namespace key holding the in-progress checkout session.
pub const SESSION_KEY: &str = "current_session";

/// Default number of records retained.
pub const DEFAULT_LEDGER_CAPACITY: usize = 100;

/// Result of a ledger mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The change was written. Carries the record after the change.
    Applied(TransactionRecord),
    /// Nothing to change (already terminal or already set). Carries the
    /// record as stored.
    Unchanged(TransactionRecord),
    /// No record with that id.
    NotFound,
}

impl WriteOutcome {
    /// The record after the operation, if it exists.
    #[must_use]
    pub fn record(&self) -> Option<&TransactionRecord> {
        match self {
            Self::Applied(record) | Self::Unchanged(record) => Some(record),
            Self::NotFound => None,
        }
    }

    /// Returns true if the ledger was modified.
    #[must_use]
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    /// Returns true if the record did not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

/// Whether a mutation closure changed the record set.
enum Mutation<T> {
    Changed(T),
    Unchanged(T),
}

type Listener = Arc<dyn Fn(&[TransactionRecord]) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(u64, Listener)>,
}

/// Handle for a ledger subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    listeners: Weak<Mutex<Listeners>>,
}

impl Subscription {
    /// Stop receiving updates.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.lock().entries.retain(|(id, _)| *id != self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Durable, concurrency-safe store of transaction records.
pub struct TransactionLedger {
    store: Arc<dyn StorageBackend>,
    clock: SharedClock,
    capacity: usize,
    retry: RetryPolicy,
    write_lock: tokio::sync::Mutex<()>,
    listeners: Arc<Mutex<Listeners>>,
}

impl TransactionLedger {
    /// Create a ledger over a storage backend.
    #[must_use]
    pub fn new(store: Arc<dyn StorageBackend>, clock: SharedClock) -> Self {
        Self {
            store,
            clock,
            capacity: DEFAULT_LEDGER_CAPACITY,
            retry: RetryPolicy::default(),
            write_lock: tokio::sync::Mutex::new(()),
            listeners: Arc::new(Mutex::new(Listeners::default())),
        }
    }

    /// Set the number of records retained. Values below 1 are raised to 1.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Replace the retry policy for transient storage failures.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Maximum number of records retained.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// True if records written here are shared with other devices.
    #[must_use]
    pub fn is_remote(&self) -> bool {
        self.store.is_remote()
    }

    /// Insert a new `Paid` record at the head of the ledger.
    ///
    /// Re-submitting a record identical to one already stored succeeds and
    /// returns the stored copy, so a checkout whose acknowledgement was lost
    /// can be retried safely. When the ledger is full the oldest record is
    /// evicted.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidRecord`] if the record fails validation
    /// - [`Error::DuplicateId`] if a different record already uses the id
    /// - storage errors once retries are exhausted
    pub async fn create(&self, record: TransactionRecord) -> Result<TransactionRecord> {
        record.validate_new()?;

        let mut record = record;
        record.synced_to_cloud = self.store.is_remote();
        record.version = 1;
        let capacity = self.capacity;

        let stored = self
            .mutate("create", |records, _now| {
                if let Some(existing) = records.iter().find(|r| r.id == record.id) {
                    if same_purchase(existing, &record) {
                        debug!("Transaction {} already stored, create is a no-op", record.id);
                        return Ok(Mutation::Unchanged(existing.clone()));
                    }
                    return Err(Error::DuplicateId(record.id.clone()));
                }

                records.insert(0, record.clone());
                if records.len() > capacity {
                    let evicted = records.split_off(capacity);
                    debug!("Evicted {} oldest transactions", evicted.len());
                }
                Ok(Mutation::Changed(record.clone()))
            })
            .await?;

        info!(
            "Recorded transaction {} (total {}, risk {}, synced {})",
            stored.id, stored.total, stored.risk_score, stored.synced_to_cloud
        );
        Ok(stored)
    }

    /// Fetch a record by id.
    ///
    /// # Errors
    ///
    /// Returns storage errors once retries are exhausted.
    pub async fn lookup(&self, id: &str) -> Result<Option<TransactionRecord>> {
        let records = self.records().await?;
        Ok(records.into_iter().find(|r| r.id == id))
    }

    /// Fetch a pickup order by its human-readable code (case-insensitive).
    ///
    /// # Errors
    ///
    /// Returns storage errors once retries are exhausted.
    pub async fn lookup_by_pickup_code(&self, code: &str) -> Result<Option<TransactionRecord>> {
        let code = code.trim();
        let records = self.records().await?;
        Ok(records.into_iter().find(|r| {
            r.pickup_code
                .as_deref()
                .is_some_and(|c| c.eq_ignore_ascii_case(code))
        }))
    }

    /// All retained records, newest first.
    ///
    /// # Errors
    ///
    /// Returns storage errors once retries are exhausted.
    pub async fn records(&self) -> Result<Vec<TransactionRecord>> {
        let (records, _) = self.load_with_retry("records").await?;
        Ok(records)
    }

    /// Move a `Paid` record to `Verified` or `Flagged`.
    ///
    /// Terminal records are never changed: a second update (a double tap,
    /// or a second device) returns [`WriteOutcome::Unchanged`] with the
    /// original `verified_by` and `verified_at`. Requesting `Paid` is also a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns storage errors once retries are exhausted.
    pub async fn update_status(
        &self,
        id: &str,
        status: TransactionStatus,
        verified_by: &str,
        notes: Option<&str>,
    ) -> Result<WriteOutcome> {
        let outcome = self
            .mutate("update_status", |records, now| {
                let Some(record) = records.iter_mut().find(|r| r.id == id) else {
                    return Ok(Mutation::Unchanged(WriteOutcome::NotFound));
                };
                if record.status.is_terminal() || !status.is_terminal() {
                    return Ok(Mutation::Unchanged(WriteOutcome::Unchanged(record.clone())));
                }

                record.status = status;
                record.verified_by = Some(verified_by.to_string());
                record.verified_at = Some(now);
                record.audit_notes = notes.map(str::to_string);
                record.version += 1;
                Ok(Mutation::Changed(WriteOutcome::Applied(record.clone())))
            })
            .await?;

        match &outcome {
            WriteOutcome::Applied(_) => info!("Transaction {id} -> {status} by {verified_by}"),
            WriteOutcome::Unchanged(record) => debug!(
                "Transaction {id} already {}, ignoring update to {status}",
                record.status
            ),
            WriteOutcome::NotFound => warn!("Status update for unknown transaction {id}"),
        }
        Ok(outcome)
    }

    /// Mark the pass for a record as consumed.
    ///
    /// The first call sets `pass_redeemed` and `redeemed_at`; later calls
    /// return [`WriteOutcome::Unchanged`].
    ///
    /// # Errors
    ///
    /// Returns storage errors once retries are exhausted.
    pub async fn mark_redeemed(&self, id: &str) -> Result<WriteOutcome> {
        let outcome = self
            .mutate("mark_redeemed", |records, now| {
                let Some(record) = records.iter_mut().find(|r| r.id == id) else {
                    return Ok(Mutation::Unchanged(WriteOutcome::NotFound));
                };
                if record.pass_redeemed {
                    return Ok(Mutation::Unchanged(WriteOutcome::Unchanged(record.clone())));
                }

                record.pass_redeemed = true;
                record.redeemed_at = Some(now);
                record.version += 1;
                Ok(Mutation::Changed(WriteOutcome::Applied(record.clone())))
            })
            .await?;

        if outcome.is_applied() {
            info!("Pass for transaction {id} redeemed");
        }
        Ok(outcome)
    }

    /// Record the expiry of the most recently issued pass for display.
    ///
    /// # Errors
    ///
    /// Returns storage errors once retries are exhausted.
    pub async fn record_pass_issued(&self, id: &str, expiry: DateTime<Utc>) -> Result<WriteOutcome> {
        self.mutate("record_pass_issued", |records, _now| {
            let Some(record) = records.iter_mut().find(|r| r.id == id) else {
                return Ok(Mutation::Unchanged(WriteOutcome::NotFound));
            };
            if record.pass_expiry == Some(expiry) {
                return Ok(Mutation::Unchanged(WriteOutcome::Unchanged(record.clone())));
            }

            record.pass_expiry = Some(expiry);
            record.version += 1;
            Ok(Mutation::Changed(WriteOutcome::Applied(record.clone())))
        })
        .await
    }

    /// Register a callback for record changes.
    ///
    /// The callback runs once immediately with the current record set, then
    /// after every applied mutation made through this ledger instance.
    /// Notifications are delivered in mutation order.
    ///
    /// # Errors
    ///
    /// Returns storage errors if the initial record set cannot be read.
    pub async fn subscribe<F>(&self, callback: F) -> Result<Subscription>
    where
        F: Fn(&[TransactionRecord]) + Send + Sync + 'static,
    {
        let _guard = self.write_lock.lock().await;
        let (records, _) = self.load_with_retry("subscribe").await?;

        let listener: Listener = Arc::new(callback);
        let id = {
            let mut listeners = self.listeners.lock();
            listeners.next_id += 1;
            let id = listeners.next_id;
            listeners.entries.push((id, Arc::clone(&listener)));
            id
        };
        debug!("Ledger subscriber {id} registered");

        listener(&records);
        Ok(Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        })
    }

    /// Number of active subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.listeners.lock().entries.len()
    }

    /// Persist the in-progress checkout session, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns storage errors once retries are exhausted.
    pub async fn save_session(&self, session: &CheckoutSession) -> Result<()> {
        let bytes = Bytes::from(serde_json::to_vec(session)?);
        let bytes = &bytes;
        let store = &self.store;
        retry_transient(&self.retry, "save_session", move || async move {
            let revision = store.read(SESSION_KEY).await?.map(|v| v.revision);
            store.write(SESSION_KEY, bytes.clone(), revision).await?;
            Ok(())
        })
        .await
    }

    /// Load the saved checkout session, if any.
    ///
    /// # Errors
    ///
    /// Returns storage errors once retries are exhausted.
    pub async fn load_session(&self) -> Result<Option<CheckoutSession>> {
        let store = &self.store;
        let stored =
            retry_transient(&self.retry, "load_session", move || store.read(SESSION_KEY)).await?;
        stored
            .map(|v| serde_json::from_slice(&v.value).map_err(Error::from))
            .transpose()
    }

    /// Discard the saved checkout session.
    ///
    /// # Errors
    ///
    /// Returns storage errors once retries are exhausted.
    pub async fn clear_session(&self) -> Result<()> {
        let store = &self.store;
        retry_transient(&self.retry, "clear_session", move || store.remove(SESSION_KEY)).await
    }

    async fn load(&self) -> Result<(Vec<TransactionRecord>, Option<u64>)> {
        match self.store.read(TRANSACTIONS_KEY).await? {
            Some(stored) => Ok((serde_json::from_slice(&stored.value)?, Some(stored.revision))),
            None => Ok((Vec::new(), None)),
        }
    }

    async fn load_with_retry(
        &self,
        operation: &str,
    ) -> Result<(Vec<TransactionRecord>, Option<u64>)> {
        retry_transient(&self.retry, operation, move || self.load()).await
    }

    /// Read-modify-write the record collection under CAS, retrying on
    /// conflicts and transient failures.
    async fn mutate<T, F>(&self, operation: &str, apply: F) -> Result<T>
    where
        F: Fn(&mut Vec<TransactionRecord>, DateTime<Utc>) -> Result<Mutation<T>> + Send + Sync,
        T: Send,
    {
        let _guard = self.write_lock.lock().await;
        let apply = &apply;
        let (value, written) =
            retry_transient(&self.retry, operation, move || self.try_mutate(apply)).await?;

        if let Some(records) = written {
            self.notify(&records);
        }
        Ok(value)
    }

    async fn try_mutate<T, F>(&self, apply: &F) -> Result<(T, Option<Vec<TransactionRecord>>)>
    where
        F: Fn(&mut Vec<TransactionRecord>, DateTime<Utc>) -> Result<Mutation<T>> + Send + Sync,
        T: Send,
    {
        let (mut records, revision) = self.load().await?;
        match apply(&mut records, self.clock.now())? {
            Mutation::Unchanged(value) => Ok((value, None)),
            Mutation::Changed(value) => {
                let bytes = Bytes::from(serde_json::to_vec(&records)?);
                self.store.write(TRANSACTIONS_KEY, bytes, revision).await?;
                Ok((value, Some(records)))
            }
        }
    }

    fn notify(&self, records: &[TransactionRecord]) {
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .entries
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(records);
        }
    }
}

/// True if two records describe the same purchase, ignoring gate state.
fn same_purchase(a: &TransactionRecord, b: &TransactionRecord) -> bool {
    a.id == b.id
        && a.owner_id == b.owner_id
        && a.items == b.items
        && a.subtotal == b.subtotal
        && a.tax == b.tax
        && a.total == b.total
        && a.risk_score == b.risk_score
        && a.created_at == b.created_at
        && a.pickup_code == b.pickup_code
}
