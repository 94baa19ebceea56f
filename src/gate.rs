//! Assembly of a store deployment from configuration.

use crate::checkout::{ApprovingGateway, CheckoutService, PaymentGateway};
use crate::clock::{SharedClock, SystemClock};
use crate::config::GateConfig;
use crate::error::Result;
use crate::ledger::{FileStore, StorageBackend, TransactionLedger};
use crate::notify::{PollingChannel, PushChannel};
use crate::risk::{HeuristicRiskScorer, RiskScorer};
use crate::token::{ExitTokenService, SigningKey};
use crate::verification::VerificationStateMachine;
use std::sync::Arc;
use tracing::info;

/// Builder for a [`Gate`].
pub struct GateBuilder {
    config: GateConfig,
    store: Option<Arc<dyn StorageBackend>>,
    clock: Option<SharedClock>,
    scorer: Option<Arc<dyn RiskScorer>>,
    gateway: Option<Arc<dyn PaymentGateway>>,
}

impl GateBuilder {
    /// Create a new builder with the given configuration.
    #[must_use]
    pub fn new(config: GateConfig) -> Self {
        Self {
            config,
            store: None,
            clock: None,
            scorer: None,
            gateway: None,
        }
    }

    /// Use a storage backend instead of the file store under `data_dir`.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn StorageBackend>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use a clock other than the system clock.
    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use a risk scorer other than [`HeuristicRiskScorer`].
    #[must_use]
    pub fn with_scorer(mut self, scorer: Arc<dyn RiskScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    /// Use a payment gateway other than [`ApprovingGateway`].
    #[must_use]
    pub fn with_gateway(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Validate the configuration and wire the components.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the signing secret
    /// is malformed, or the data directory cannot be created.
    pub fn build(self) -> Result<Gate> {
        self.config.validate()?;
        info!("Building gate for {}", self.config.store_name);

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = match self.store {
            Some(store) => store,
            None => Arc::new(FileStore::open(&self.config.data_dir)?),
        };

        let ledger = Arc::new(
            TransactionLedger::new(store, Arc::clone(&clock))
                .with_capacity(self.config.ledger_capacity),
        );
        let tokens = Arc::new(
            ExitTokenService::new(SigningKey::from_config(&self.config)?, Arc::clone(&clock))
                .with_default_ttl(self.config.pass_ttl()),
        );
        let checkout = CheckoutService::new(
            Arc::clone(&ledger),
            Arc::clone(&tokens),
            self.scorer
                .unwrap_or_else(|| Arc::new(HeuristicRiskScorer::default())),
            self.gateway.unwrap_or_else(|| Arc::new(ApprovingGateway)),
            clock,
        )
        .with_tax_rate_bps(self.config.tax_rate_bps)
        .with_store_name(self.config.store_name.clone());

        if !ledger.is_remote() {
            info!("Ledger is local-only; records will be marked unsynced");
        }

        Ok(Gate {
            config: self.config,
            ledger,
            tokens,
            checkout,
        })
    }
}

/// A configured deployment: one ledger, one signing key, and the services
/// over them.
pub struct Gate {
    config: GateConfig,
    ledger: Arc<TransactionLedger>,
    tokens: Arc<ExitTokenService>,
    checkout: CheckoutService,
}

impl Gate {
    /// Configuration in force.
    #[must_use]
    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Shared ledger.
    #[must_use]
    pub fn ledger(&self) -> &Arc<TransactionLedger> {
        &self.ledger
    }

    /// Exit pass issuer and verifier.
    #[must_use]
    pub fn tokens(&self) -> &Arc<ExitTokenService> {
        &self.tokens
    }

    /// Customer checkout.
    #[must_use]
    pub fn checkout(&self) -> &CheckoutService {
        &self.checkout
    }

    /// A new staff terminal. Each physical terminal gets its own.
    #[must_use]
    pub fn terminal(&self) -> VerificationStateMachine {
        VerificationStateMachine::new(Arc::clone(&self.tokens), Arc::clone(&self.ledger))
            .with_flag_threshold(self.config.flag_threshold)
    }

    /// Push notifications over this ledger.
    #[must_use]
    pub fn push_channel(&self) -> PushChannel {
        PushChannel::new(Arc::clone(&self.ledger))
    }

    /// Polling notifications at the configured interval.
    #[must_use]
    pub fn polling_channel(&self) -> PollingChannel {
        PollingChannel::new(Arc::clone(&self.ledger), self.config.poll_interval())
    }
}
