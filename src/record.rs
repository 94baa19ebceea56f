//! Transaction record types.
//!
//! A [`TransactionRecord`] is the durable unit of truth for one completed
//! checkout. The ledger owns the authoritative copy; everything else works
//! on clones.

use crate::error::{Error, Result};
use crate::risk::MAX_RISK_SCORE;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Monetary amount in minor currency units.
pub type Amount = u64;

/// Prefix of every generated transaction id.
pub const TRANSACTION_ID_PREFIX: &str = "TXN-";

/// Prefix of every generated pickup code.
pub const PICKUP_CODE_PREFIX: &str = "PK-";

/// Unambiguous characters for human-readable pickup codes.
const PICKUP_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

const PICKUP_CODE_LEN: usize = 6;

/// Lifecycle status of a transaction.
///
/// `Paid` is the only non-terminal state. Once `Verified` or `Flagged`, the
/// status never changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    /// Payment succeeded; not yet checked at a gate.
    Paid,
    /// Released at the gate.
    Verified,
    /// Sent for a full audit.
    Flagged,
}

impl TransactionStatus {
    /// Returns true for `Verified` and `Flagged`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Paid)
    }

    /// Wire name of the status.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Paid => "PAID",
            Self::Verified => "VERIFIED",
            Self::Flagged => "FLAGGED",
        }
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of a purchase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    /// Catalog identifier.
    pub product_id: String,
    /// Display name at time of purchase.
    pub name: String,
    /// Price of one unit.
    pub unit_price: Amount,
    /// Number of units.
    pub quantity: u32,
}

impl LineItem {
    /// Create a line item.
    #[must_use]
    pub fn new(
        product_id: impl Into<String>,
        name: impl Into<String>,
        unit_price: Amount,
        quantity: u32,
    ) -> Self {
        Self {
            product_id: product_id.into(),
            name: name.into(),
            unit_price,
            quantity,
        }
    }

    /// `unit_price * quantity`, or `None` on overflow.
    #[must_use]
    pub fn line_total(&self) -> Option<Amount> {
        self.unit_price.checked_mul(Amount::from(self.quantity))
    }
}

/// Durable record of one completed checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    /// Opaque unique id, immutable.
    pub id: String,
    /// Paying party.
    pub owner_id: String,
    /// Purchased items, immutable once paid.
    pub items: Vec<LineItem>,
    /// Sum of line totals.
    pub subtotal: Amount,
    /// Tax charged on the subtotal.
    pub tax: Amount,
    /// `subtotal + tax`.
    pub total: Amount,
    /// Risk score assigned at creation, immutable.
    pub risk_score: u8,
    /// Gate status.
    pub status: TransactionStatus,
    /// When payment completed.
    pub created_at: DateTime<Utc>,
    /// Expiry of the most recently issued pass, for display only.
    #[serde(default)]
    pub pass_expiry: Option<DateTime<Utc>>,
    /// Set once a pass for this record has been consumed at a gate.
    #[serde(default)]
    pub pass_redeemed: bool,
    /// When the pass was consumed.
    #[serde(default)]
    pub redeemed_at: Option<DateTime<Utc>>,
    /// Staff member that moved the record out of `Paid`.
    #[serde(default)]
    pub verified_by: Option<String>,
    /// When the record left `Paid`.
    #[serde(default)]
    pub verified_at: Option<DateTime<Utc>>,
    /// Free-form staff notes.
    #[serde(default)]
    pub audit_notes: Option<String>,
    /// Human-readable code for pre-order pickups.
    #[serde(default)]
    pub pickup_code: Option<String>,
    /// False when the record was written to local-only storage.
    #[serde(default)]
    pub synced_to_cloud: bool,
    /// Incremented on every applied mutation.
    #[serde(default)]
    pub version: u64,
}

impl TransactionRecord {
    /// Build a freshly paid record with a generated id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRecord`] if the items are empty, amounts
    /// overflow, or the risk score is out of range.
    pub fn new(
        owner_id: impl Into<String>,
        items: Vec<LineItem>,
        tax: Amount,
        risk_score: u8,
        created_at: DateTime<Utc>,
    ) -> Result<Self> {
        Self::with_id(
            generate_transaction_id(),
            owner_id,
            items,
            tax,
            risk_score,
            created_at,
        )
    }

    /// Build a freshly paid record with an explicit id.
    ///
    /// # Errors
    ///
    /// Same as [`TransactionRecord::new`].
    pub fn with_id(
        id: impl Into<String>,
        owner_id: impl Into<String>,
        items: Vec<LineItem>,
        tax: Amount,
        risk_score: u8,
        created_at: DateTime<Utc>,
    ) -> Result<Self> {
        let subtotal = subtotal_of(&items)?;
        let total = subtotal
            .checked_add(tax)
            .ok_or_else(|| Error::InvalidRecord("total overflows".to_string()))?;

        let record = Self {
            id: id.into(),
            owner_id: owner_id.into(),
            items,
            subtotal,
            tax,
            total,
            risk_score,
            status: TransactionStatus::Paid,
            created_at,
            pass_expiry: None,
            pass_redeemed: false,
            redeemed_at: None,
            verified_by: None,
            verified_at: None,
            audit_notes: None,
            pickup_code: None,
            synced_to_cloud: false,
            version: 0,
        };
        record.validate_new()?;
        Ok(record)
    }

    /// Attach a pickup code, marking this as a pre-order pickup.
    #[must_use]
    pub fn with_pickup_code(mut self, code: impl Into<String>) -> Self {
        self.pickup_code = Some(code.into());
        self
    }

    /// Total number of units across all lines.
    #[must_use]
    pub fn item_count(&self) -> u32 {
        self.items
            .iter()
            .fold(0u32, |acc, item| acc.saturating_add(item.quantity))
    }

    /// Returns true if this is a pre-order pickup.
    #[must_use]
    pub fn is_pickup(&self) -> bool {
        self.pickup_code.is_some()
    }

    /// Check every invariant a record must satisfy when it enters the ledger.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRecord`] describing the first violated invariant.
    pub fn validate_new(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::InvalidRecord("id must not be empty".to_string()));
        }
        if self.owner_id.trim().is_empty() {
            return Err(Error::InvalidRecord("ownerId must not be empty".to_string()));
        }
        if self.items.is_empty() {
            return Err(Error::InvalidRecord("items must not be empty".to_string()));
        }
        if subtotal_of(&self.items)? != self.subtotal {
            return Err(Error::InvalidRecord(format!(
                "subtotal {} does not match line totals",
                self.subtotal
            )));
        }
        if self.subtotal.checked_add(self.tax) != Some(self.total) {
            return Err(Error::InvalidRecord(format!(
                "total {} != subtotal {} + tax {}",
                self.total, self.subtotal, self.tax
            )));
        }
        if self.risk_score > MAX_RISK_SCORE {
            return Err(Error::InvalidRecord(format!(
                "riskScore {} exceeds {MAX_RISK_SCORE}",
                self.risk_score
            )));
        }
        if self.status != TransactionStatus::Paid {
            return Err(Error::InvalidRecord(format!(
                "new records must be PAID, got {}",
                self.status
            )));
        }
        if self.pass_redeemed
            || self.redeemed_at.is_some()
            || self.verified_by.is_some()
            || self.verified_at.is_some()
        {
            return Err(Error::InvalidRecord(
                "new records must not carry redemption or verification fields".to_string(),
            ));
        }
        Ok(())
    }
}

fn subtotal_of(items: &[LineItem]) -> Result<Amount> {
    items.iter().try_fold(0, |acc: Amount, item| {
        item.line_total()
            .and_then(|line| acc.checked_add(line))
            .ok_or_else(|| Error::InvalidRecord("subtotal overflows".to_string()))
    })
}

/// Generate a compact transaction id (`TXN-` + 12 hex characters).
#[must_use]
pub fn generate_transaction_id() -> String {
    let hex = Uuid::new_v4().simple().to_string().to_uppercase();
    format!("{TRANSACTION_ID_PREFIX}{}", &hex[..12])
}

/// Generate a human-readable pickup code (`PK-` + 6 characters).
#[must_use]
pub fn generate_pickup_code() -> String {
    let mut rng = rand::thread_rng();
    let code: String = (0..PICKUP_CODE_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..PICKUP_CODE_ALPHABET.len());
            char::from(PICKUP_CODE_ALPHABET[idx])
        })
        .collect();
    format!("{PICKUP_CODE_PREFIX}{code}")
}

/// Cart in progress, held in the ledger's session namespace until payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutSession {
    /// Shopper.
    pub owner_id: String,
    /// Items scanned so far.
    pub items: Vec<LineItem>,
    /// When the shopper started scanning.
    pub started_at: DateTime<Utc>,
}

impl CheckoutSession {
    /// Start an empty session.
    #[must_use]
    pub fn start(owner_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            owner_id: owner_id.into(),
            items: Vec::new(),
            started_at,
        }
    }

    /// Add units of a product, merging with an existing line for the same product.
    pub fn add_item(&mut self, item: LineItem) {
        if let Some(line) = self
            .items
            .iter_mut()
            .find(|line| line.product_id == item.product_id)
        {
            line.quantity = line.quantity.saturating_add(item.quantity);
        } else {
            self.items.push(item);
        }
    }
}
