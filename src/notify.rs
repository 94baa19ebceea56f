//! Customer-facing notifications.
//!
//! When staff act on a transaction at the gate, the customer's device learns
//! about it through a [`NotificationChannel`]. Two transports exist:
//!
//! - [`PushChannel`] rides on ledger subscriptions: events arrive as soon as
//!   a mutation is applied through the same ledger instance.
//! - [`PollingChannel`] re-reads the record on an interval, for when the
//!   customer device and the gate share only the storage backend.
//!
//! Both are at-least-once. Consumers feed events through a
//! [`NotificationInbox`] to react exactly once per `(transaction, kind)`.

use crate::config::MAX_POLL_INTERVAL_MS;
use crate::error::Result;
use crate::ledger::{Subscription, TransactionLedger};
use crate::record::{TransactionRecord, TransactionStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// What happened to the customer's transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// Released at the exit gate.
    GateReleased,
    /// Sent for a full audit.
    Flagged,
    /// Pre-ordered items handed over.
    PickupCollected,
}

impl NotificationKind {
    /// Wire name of the kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GateReleased => "gate_released",
            Self::Flagged => "flagged",
            Self::PickupCollected => "pickup_collected",
        }
    }
}

/// A notification delivered to the customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    /// Event kind.
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    /// Transaction the event is about.
    pub transaction_id: String,
    /// Human-readable message.
    pub message: String,
    /// When the gate action happened.
    pub timestamp: DateTime<Utc>,
}

impl NotificationEvent {
    /// Derive the customer notification for a record's current state.
    ///
    /// Returns `None` while the record is still `Paid`, or `Verified` but not
    /// yet redeemed.
    #[must_use]
    pub fn from_record(record: &TransactionRecord) -> Option<Self> {
        let (kind, message, timestamp) = match record.status {
            TransactionStatus::Paid => return None,
            TransactionStatus::Flagged => (
                NotificationKind::Flagged,
                "Please wait for a quick receipt check at the exit.".to_string(),
                record.verified_at?,
            ),
            TransactionStatus::Verified if !record.pass_redeemed => return None,
            TransactionStatus::Verified => match &record.pickup_code {
                Some(code) => (
                    NotificationKind::PickupCollected,
                    format!("Order {code} collected. Enjoy!"),
                    record.redeemed_at.or(record.verified_at)?,
                ),
                None => (
                    NotificationKind::GateReleased,
                    "Exit approved. Thanks for shopping with us!".to_string(),
                    record.redeemed_at.or(record.verified_at)?,
                ),
            },
        };

        Some(Self {
            kind,
            transaction_id: record.id.clone(),
            message,
            timestamp,
        })
    }
}

/// A transport delivering notifications for one transaction.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Start watching a transaction.
    ///
    /// If the transaction already reached a notifiable state, the event is
    /// delivered right away.
    ///
    /// # Errors
    ///
    /// Returns storage errors if the subscription cannot be established.
    async fn subscribe(&self, transaction_id: &str) -> Result<NotificationSubscription>;

    /// Short transport name for logs.
    fn name(&self) -> &'static str;
}

/// Cancels a polling task when dropped.
struct PollerGuard {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Drop for PollerGuard {
    fn drop(&mut self) {
        let _ = self.cancel.send(true);
        self.task.abort();
    }
}

/// Live notification feed for one transaction.
///
/// Dropping the subscription stops delivery immediately and releases the
/// underlying ledger subscription or polling task.
pub struct NotificationSubscription {
    transaction_id: String,
    events: mpsc::UnboundedReceiver<NotificationEvent>,
    _ledger_subscription: Option<Subscription>,
    _poller: Option<PollerGuard>,
}

impl NotificationSubscription {
    /// Transaction being watched.
    #[must_use]
    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    /// Wait for the next event. `None` once the transport has finished.
    pub async fn recv(&mut self) -> Option<NotificationEvent> {
        self.events.recv().await
    }

    /// Take an already delivered event without waiting.
    pub fn try_recv(&mut self) -> Option<NotificationEvent> {
        self.events.try_recv().ok()
    }

    /// Stop delivery.
    pub fn unsubscribe(self) {
        debug!("Notification subscription for {} closed", self.transaction_id);
    }
}

impl Stream for NotificationSubscription {
    type Item = NotificationEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

/// Notifications pushed from ledger subscriptions.
#[derive(Clone)]
pub struct PushChannel {
    ledger: Arc<TransactionLedger>,
}

impl PushChannel {
    /// Create a push channel over a ledger.
    #[must_use]
    pub fn new(ledger: Arc<TransactionLedger>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl NotificationChannel for PushChannel {
    async fn subscribe(&self, transaction_id: &str) -> Result<NotificationSubscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let watched = transaction_id.to_string();
        let last = Mutex::new(None::<NotificationEvent>);

        let subscription = self
            .ledger
            .subscribe(move |records| {
                let Some(event) = records
                    .iter()
                    .find(|r| r.id == watched)
                    .and_then(NotificationEvent::from_record)
                else {
                    return;
                };
                let mut last = last.lock();
                if last.as_ref() == Some(&event) {
                    return;
                }
                if tx.send(event.clone()).is_err() {
                    debug!("Notification receiver for {watched} is gone");
                }
                *last = Some(event);
            })
            .await?;

        Ok(NotificationSubscription {
            transaction_id: transaction_id.to_string(),
            events: rx,
            _ledger_subscription: Some(subscription),
            _poller: None,
        })
    }

    fn name(&self) -> &'static str {
        "push"
    }
}

/// Notifications discovered by polling the ledger.
#[derive(Clone)]
pub struct PollingChannel {
    ledger: Arc<TransactionLedger>,
    interval: Duration,
}

impl PollingChannel {
    /// Create a polling channel. The interval is kept within 1ms and
    /// [`MAX_POLL_INTERVAL_MS`].
    #[must_use]
    pub fn new(ledger: Arc<TransactionLedger>, interval: Duration) -> Self {
        Self {
            ledger,
            interval: interval.clamp(
                Duration::from_millis(1),
                Duration::from_millis(MAX_POLL_INTERVAL_MS),
            ),
        }
    }

    /// Time between polls.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

#[async_trait]
impl NotificationChannel for PollingChannel {
    async fn subscribe(&self, transaction_id: &str) -> Result<NotificationSubscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let ledger = Arc::clone(&self.ledger);
        let interval = self.interval;
        let watched = transaction_id.to_string();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel_rx.changed() => {
                        if *cancel_rx.borrow() {
                            debug!("Polling for {watched} cancelled");
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        match ledger.lookup(&watched).await {
                            Ok(Some(record)) => {
                                if let Some(event) = NotificationEvent::from_record(&record) {
                                    if tx.send(event).is_err() {
                                        debug!("Notification receiver for {watched} is gone");
                                    }
                                    // Terminal states never change again.
                                    break;
                                }
                            }
                            Ok(None) => debug!("Transaction {watched} not in ledger yet"),
                            Err(e) => warn!("Polling {watched} failed: {e}"),
                        }
                    }
                }
            }
        });

        Ok(NotificationSubscription {
            transaction_id: transaction_id.to_string(),
            events: rx,
            _ledger_subscription: None,
            _poller: Some(PollerGuard {
                cancel: cancel_tx,
                task,
            }),
        })
    }

    fn name(&self) -> &'static str {
        "polling"
    }
}

/// Consumer-side deduplication of notifications.
#[derive(Debug, Default)]
pub struct NotificationInbox {
    seen: HashSet<(String, NotificationKind)>,
    accepted: Vec<NotificationEvent>,
}

impl NotificationInbox {
    /// Create an empty inbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept an event. Returns false if the same `(transaction, kind)` was
    /// already accepted.
    pub fn accept(&mut self, event: NotificationEvent) -> bool {
        let key = (event.transaction_id.clone(), event.kind);
        if !self.seen.insert(key) {
            debug!(
                "Duplicate {} notification for {}",
                event.kind.as_str(),
                event.transaction_id
            );
            return false;
        }
        self.accepted.push(event);
        true
    }

    /// Accepted events in arrival order.
    #[must_use]
    pub fn events(&self) -> &[NotificationEvent] {
        &self.accepted
    }

    /// Most recent accepted event for a transaction.
    #[must_use]
    pub fn latest_for(&self, transaction_id: &str) -> Option<&NotificationEvent> {
        self.accepted
            .iter()
            .rev()
            .find(|e| e.transaction_id == transaction_id)
    }
}
