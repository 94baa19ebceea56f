//! Test harness that wires a customer side and a staff side together.
//!
//! The `TestHarness` builds two independent [`Gate`]s over one shared
//! in-memory "remote" store. Each side has its own ledger instance, so
//! anything the staff side writes reaches the customer only through
//! storage, exactly as it would across two devices.

use chrono::Duration;
use exit_pass::checkout::{CheckoutRequest, CompletedCheckout, Fulfillment};
use exit_pass::ledger::MemoryStore;
use exit_pass::record::{LineItem, TransactionRecord};
use exit_pass::token::IssuedPass;
use exit_pass::{Clock, Gate, GateBuilder, GateConfig, ManualClock};
use std::sync::Arc;
use tracing::info;

/// Shared secret used by both sides, hex encoded.
pub const TEST_SECRET_HEX: &str = "5e1f0c7d2a9b4e6f8011223344556677";

/// Error type for test harness operations.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// Library error.
    #[error("exit-pass error: {0}")]
    Gate(#[from] exit_pass::Error),
}

/// Result type for harness operations.
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Customer device plus staff terminal over one shared store.
pub struct TestHarness {
    clock: ManualClock,
    store: MemoryStore,
    customer: Gate,
    staff: Gate,
}

impl TestHarness {
    /// Create both sides with default configuration and a remote store.
    ///
    /// # Errors
    ///
    /// Returns an error if either side fails to build.
    pub fn setup() -> Result<Self> {
        Self::setup_with_config(GateConfig::default())
    }

    /// Create both sides with custom configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if either side fails to build.
    pub fn setup_with_config(config: GateConfig) -> Result<Self> {
        let config = GateConfig {
            signing_secret: Some(TEST_SECRET_HEX.to_string()),
            ..config
        };
        let clock = ManualClock::starting_now();
        let store = MemoryStore::remote();

        let customer = Self::side(&config, &store, &clock)?;
        let staff = Self::side(&config, &store, &clock)?;
        info!("Test harness ready");

        Ok(Self {
            clock,
            store,
            customer,
            staff,
        })
    }

    fn side(config: &GateConfig, store: &MemoryStore, clock: &ManualClock) -> Result<Gate> {
        Ok(GateBuilder::new(config.clone())
            .with_store(Arc::new(store.clone()))
            .with_clock(Arc::new(clock.clone()))
            .build()?)
    }

    /// Another independent device over the same store (a second terminal).
    ///
    /// # Errors
    ///
    /// Returns an error if the gate fails to build.
    pub fn another_device(&self) -> Result<Gate> {
        Self::side(self.staff.config(), &self.store, &self.clock)
    }

    /// The shopper's device.
    #[must_use]
    pub fn customer(&self) -> &Gate {
        &self.customer
    }

    /// The staff side.
    #[must_use]
    pub fn staff(&self) -> &Gate {
        &self.staff
    }

    /// Shared clock.
    #[must_use]
    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    /// Move time forward for both sides.
    pub fn advance(&self, secs: i64) {
        self.clock.advance(Duration::seconds(secs));
    }

    /// Write a paid record with a fixed risk score on the customer side and
    /// issue its exit pass.
    ///
    /// Items are two coffees at 150 and one milk at 100, with tax 50, so the
    /// total is 450 over 3 units.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger write or issuance fails.
    pub async fn paid_with_risk(&self, id: &str, risk: u8) -> Result<(TransactionRecord, IssuedPass)> {
        let record = TransactionRecord::with_id(
            id,
            "customer-001",
            vec![
                LineItem::new("SKU-COFFEE", "Coffee", 150, 2),
                LineItem::new("SKU-MILK", "Milk", 100, 1),
            ],
            50,
            risk,
            self.clock.now(),
        )?;
        let record = self.customer.ledger().create(record).await?;
        let pass = self.customer.tokens().issue(&record)?;
        self.customer
            .ledger()
            .record_pass_issued(&record.id, pass.expires_at)
            .await?;
        Ok((record, pass))
    }

    /// Run a full checkout on the customer side.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkout fails.
    pub async fn checkout(&self, fulfillment: Fulfillment) -> Result<CompletedCheckout> {
        Ok(self
            .customer
            .checkout()
            .complete_checkout(CheckoutRequest {
                owner_id: "customer-002".to_string(),
                items: vec![LineItem::new("SKU-CAKE", "Cake", 1_200, 1)],
                session_started_at: self.clock.now() - Duration::minutes(5),
                fulfillment,
                entropy: Some(0),
            })
            .await?)
    }
}
