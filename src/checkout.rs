//! Customer-side checkout.
//!
//! Control flow for one purchase:
//!
//! ```text
//! cart ─▶ charge (PaymentGateway) ─▶ score (RiskScorer) ─▶ ledger.create
//!                                                              │
//!            pickup pass (pre-orders) ◀── record_pass_issued ◀─┴─ issue exit pass
//! ```

use crate::clock::SharedClock;
use crate::error::{Error, Result};
use crate::ledger::TransactionLedger;
use crate::record::{
    generate_pickup_code, Amount, CheckoutSession, LineItem, TransactionRecord,
};
use crate::risk::{RiskScorer, SessionFeatures};
use crate::token::{pickup, ExitTokenService, IssuedPass};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Default tax rate in basis points.
pub const DEFAULT_TAX_RATE_BPS: u32 = 500;

const BPS_DENOMINATOR: u128 = 10_000;

/// Payment confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentReceipt {
    /// Gateway reference.
    pub reference: String,
    /// Amount charged.
    pub amount: Amount,
}

/// Charges the customer.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Charge `amount` to `owner_id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Payment`] if the charge is declined.
    async fn charge(&self, owner_id: &str, amount: Amount) -> Result<PaymentReceipt>;
}

/// Gateway that approves every charge.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApprovingGateway;

#[async_trait]
impl PaymentGateway for ApprovingGateway {
    async fn charge(&self, owner_id: &str, amount: Amount) -> Result<PaymentReceipt> {
        debug!("Approved charge of {amount} for {owner_id}");
        Ok(PaymentReceipt {
            reference: format!("PAY-{}", Uuid::new_v4().simple()),
            amount,
        })
    }
}

/// How the customer leaves with the goods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fulfillment {
    /// Walk out through the exit gate.
    #[default]
    Exit,
    /// Collect a pre-order at the counter.
    Pickup,
}

/// Everything needed to complete one purchase.
#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    /// Paying party.
    pub owner_id: String,
    /// Cart contents.
    pub items: Vec<LineItem>,
    /// When the shopper started.
    pub session_started_at: DateTime<Utc>,
    /// Exit or pickup.
    pub fulfillment: Fulfillment,
    /// Behavioural noise for the scorer; random when `None`.
    pub entropy: Option<u8>,
}

/// A paid purchase with its credentials.
#[derive(Debug, Clone)]
pub struct CompletedCheckout {
    /// Stored record.
    pub record: TransactionRecord,
    /// Exit pass.
    pub pass: IssuedPass,
    /// Pickup pass for pre-orders.
    pub pickup_pass: Option<String>,
    /// Payment confirmation.
    pub receipt: PaymentReceipt,
}

/// Tax on `subtotal` at `rate_bps`, rounded half up.
///
/// # Errors
///
/// Returns [`Error::InvalidRecord`] if the tax does not fit in an amount.
pub fn compute_tax(subtotal: Amount, rate_bps: u32) -> Result<Amount> {
    let scaled = u128::from(subtotal) * u128::from(rate_bps);
    let tax = (scaled + BPS_DENOMINATOR / 2) / BPS_DENOMINATOR;
    Amount::try_from(tax).map_err(|_| Error::InvalidRecord("tax overflows".to_string()))
}

/// Completes purchases and issues passes.
pub struct CheckoutService {
    ledger: Arc<TransactionLedger>,
    tokens: Arc<ExitTokenService>,
    scorer: Arc<dyn RiskScorer>,
    gateway: Arc<dyn PaymentGateway>,
    clock: SharedClock,
    tax_rate_bps: u32,
    store_name: String,
}

impl CheckoutService {
    /// Create a checkout service.
    #[must_use]
    pub fn new(
        ledger: Arc<TransactionLedger>,
        tokens: Arc<ExitTokenService>,
        scorer: Arc<dyn RiskScorer>,
        gateway: Arc<dyn PaymentGateway>,
        clock: SharedClock,
    ) -> Self {
        Self {
            ledger,
            tokens,
            scorer,
            gateway,
            clock,
            tax_rate_bps: DEFAULT_TAX_RATE_BPS,
            store_name: "Main Store".to_string(),
        }
    }

    /// Set the tax rate in basis points.
    #[must_use]
    pub fn with_tax_rate_bps(mut self, bps: u32) -> Self {
        self.tax_rate_bps = bps;
        self
    }

    /// Set the store name embedded in pickup passes.
    #[must_use]
    pub fn with_store_name(mut self, name: impl Into<String>) -> Self {
        self.store_name = name.into();
        self
    }

    /// Charge, score, record and issue passes for one purchase.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidRecord`] for an empty or overflowing cart
    /// - [`Error::Payment`] if the charge is declined
    /// - storage errors from the ledger
    pub async fn complete_checkout(&self, request: CheckoutRequest) -> Result<CompletedCheckout> {
        let now = self.clock.now();
        let mut record = TransactionRecord::new(
            request.owner_id.clone(),
            request.items,
            0,
            0,
            now,
        )?;
        record.tax = compute_tax(record.subtotal, self.tax_rate_bps)?;
        record.total = record
            .subtotal
            .checked_add(record.tax)
            .ok_or_else(|| Error::InvalidRecord("total overflows".to_string()))?;

        let receipt = self.gateway.charge(&record.owner_id, record.total).await?;

        let features = SessionFeatures {
            item_count: record.item_count(),
            session_duration: (now - request.session_started_at)
                .to_std()
                .unwrap_or_default(),
            total: record.total,
            entropy: request.entropy.unwrap_or_else(rand::random),
        };
        record.risk_score = self.scorer.score(&features);

        if request.fulfillment == Fulfillment::Pickup {
            record = record.with_pickup_code(generate_pickup_code());
        }

        let record = self.ledger.create(record).await?;
        let pass = self.issue(&record).await?;
        let pickup_pass = record
            .is_pickup()
            .then(|| pickup::encode(&record, &self.store_name, now))
            .transpose()?;

        info!(
            "Checkout complete: {} for {} (total {}, risk {})",
            record.id, record.owner_id, record.total, record.risk_score
        );
        Ok(CompletedCheckout {
            record,
            pass,
            pickup_pass,
            receipt,
        })
    }

    /// Complete the purchase held in the saved session, then clear it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no session is saved, otherwise the
    /// errors of [`CheckoutService::complete_checkout`].
    pub async fn checkout_session(
        &self,
        fulfillment: Fulfillment,
        entropy: Option<u8>,
    ) -> Result<CompletedCheckout> {
        let session: CheckoutSession = self
            .ledger
            .load_session()
            .await?
            .ok_or_else(|| Error::NotFound("no checkout session in progress".to_string()))?;

        let completed = self
            .complete_checkout(CheckoutRequest {
                owner_id: session.owner_id,
                items: session.items,
                session_started_at: session.started_at,
                fulfillment,
                entropy,
            })
            .await?;
        self.ledger.clear_session().await?;
        Ok(completed)
    }

    /// Issue a fresh exit pass for an unredeemed transaction.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the transaction is unknown
    /// - [`Error::PassRedeemed`] once the pass has been used
    pub async fn refresh_pass(&self, transaction_id: &str) -> Result<IssuedPass> {
        let record = self
            .ledger
            .lookup(transaction_id)
            .await?
            .ok_or_else(|| Error::NotFound(transaction_id.to_string()))?;
        if record.pass_redeemed {
            return Err(Error::PassRedeemed(transaction_id.to_string()));
        }
        self.issue(&record).await
    }

    /// Encode the pickup pass for a pre-order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for unknown transactions and
    /// [`Error::InvalidRecord`] if it is not a pickup order.
    pub async fn issue_pickup_pass(&self, transaction_id: &str) -> Result<String> {
        let record = self
            .ledger
            .lookup(transaction_id)
            .await?
            .ok_or_else(|| Error::NotFound(transaction_id.to_string()))?;
        pickup::encode(&record, &self.store_name, self.clock.now())
    }

    async fn issue(&self, record: &TransactionRecord) -> Result<IssuedPass> {
        let pass = self.tokens.issue(record)?;
        self.ledger
            .record_pass_issued(&record.id, pass.expires_at)
            .await?;
        Ok(pass)
    }
}
