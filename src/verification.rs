//! Staff-side gate verification.
//!
//! One [`VerificationStateMachine`] drives one staff terminal:
//!
//! ```text
//!            scan                       decision
//!   IDLE ──────────▶ VERIFYING ──────────────────▶ SUCCESS ─┐
//!    ▲                    │                        FLAGGED ─┤ release /
//!    │                    │ second scan: dropped   EXPIRED  │ full audit /
//!    │                    ▼                        NOT_FOUND│ reset
//!    └──────────────────────────────────────────────────────┘
//! ```
//!
//! A scan may be an exit pass, a pickup pass, or a typed pickup code. The
//! decision combines the credential with the ledger record: a record is
//! flagged when it was flagged before, when its risk score is above the
//! threshold, or when its pass was already redeemed. Release and full audit
//! write the status and the redemption to the ledger and return to idle.

use crate::error::{Error, Result};
use crate::event::{create_event_channel, GateEvent, GateEventsChannel, GateEventsSender};
use crate::ledger::{TransactionLedger, WriteOutcome};
use crate::record::{TransactionRecord, TransactionStatus, PICKUP_CODE_PREFIX};
use crate::token::{pickup, ExitPassClaims, ExitTokenService, PassVerification, TokenError};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default risk threshold: scores strictly above it force a check.
pub const DEFAULT_FLAG_THRESHOLD: u8 = 65;

/// Which credential the customer presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    /// Signed exit pass.
    ExitPass,
    /// Checksummed pickup pass.
    PickupPass,
    /// Pickup code typed in by staff.
    PickupCode,
}

/// Where the record behind a decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordSource {
    /// The ledger reachable from this terminal.
    Ledger,
    /// Rebuilt from the signed pass because the ledger had no record.
    PassFallback,
}

/// Why a scan was flagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagReason {
    /// Risk score above the threshold.
    HighRisk {
        /// Record's score.
        score: u8,
        /// Threshold in force.
        threshold: u8,
    },
    /// Record was already `Flagged`.
    PreviouslyFlagged,
    /// The pass has already been used at a gate.
    AlreadyRedeemed,
    /// The ledger could not be read, so redemption is unknown.
    LedgerUnavailable,
}

/// Outcome of a successful lookup, shown to staff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateDecision {
    /// Record the decision is about.
    pub record: TransactionRecord,
    /// Where the record came from.
    pub source: RecordSource,
    /// Credential presented.
    pub credential: CredentialKind,
    /// Units purchased.
    pub item_count: u32,
    /// Empty for a clean pass.
    pub reasons: Vec<FlagReason>,
}

/// State of a gate terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationState {
    /// Waiting for a scan.
    Idle,
    /// A scan or staff action is in flight.
    Verifying,
    /// Clean pass; staff may release.
    Success(GateDecision),
    /// Staff must check the bag, or override with release.
    Flagged(GateDecision),
    /// Authentic pass past its expiry.
    Expired {
        /// Transaction the pass was issued for.
        transaction_id: String,
        /// When it expired.
        expired_at: Option<DateTime<Utc>>,
    },
    /// Credential rejected or no matching transaction.
    NotFound {
        /// Failure kind.
        error: TokenError,
    },
}

impl VerificationState {
    /// Upper-case state name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Verifying => "VERIFYING",
            Self::Success(_) => "SUCCESS",
            Self::Flagged(_) => "FLAGGED",
            Self::Expired { .. } => "EXPIRED",
            Self::NotFound { .. } => "NOT_FOUND",
        }
    }

    /// The decision, for `Success` and `Flagged`.
    #[must_use]
    pub fn decision(&self) -> Option<&GateDecision> {
        match self {
            Self::Success(decision) | Self::Flagged(decision) => Some(decision),
            _ => None,
        }
    }

    fn transaction_id(&self) -> Option<String> {
        match self {
            Self::Success(d) | Self::Flagged(d) => Some(d.record.id.clone()),
            Self::Expired { transaction_id, .. } => Some(transaction_id.clone()),
            _ => None,
        }
    }
}

/// Result of feeding a scan to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Verification ran to a decision.
    Completed(VerificationState),
    /// Another scan was in flight; this one was ignored.
    Dropped,
}

/// Staff action on a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaffAction {
    /// Let the customer leave.
    Release,
    /// Check the bag.
    FullAudit,
}

impl std::fmt::Display for StaffAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Release => f.write_str("Release"),
            Self::FullAudit => f.write_str("Full Audit"),
        }
    }
}

/// What a staff action wrote to the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutcome {
    /// Action taken.
    pub action: StaffAction,
    /// Transaction acted on.
    pub transaction_id: String,
    /// Result of the status update.
    pub status_update: WriteOutcome,
    /// Result of marking the pass redeemed.
    pub redemption: WriteOutcome,
}

impl ActionOutcome {
    /// False when the record lives only in the pass (fallback decision) and
    /// nothing could be written.
    #[must_use]
    pub fn ledger_updated(&self) -> bool {
        !self.status_update.is_not_found()
    }
}

/// Holds a terminal in `Verifying` for the length of a scan or staff action.
///
/// If the owning future is dropped before [`InFlight::finish`], the terminal
/// goes back to the state it had before, so a cancelled scan never leaves it
/// stuck.
struct InFlight<'a> {
    state: &'a Mutex<VerificationState>,
    restore: Option<VerificationState>,
}

impl<'a> InFlight<'a> {
    fn new(state: &'a Mutex<VerificationState>, restore: VerificationState) -> Self {
        Self {
            state,
            restore: Some(restore),
        }
    }

    fn finish(mut self, next: VerificationState) {
        self.restore = None;
        *self.state.lock() = next;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let Some(restore) = self.restore.take() else {
            return;
        };
        let mut state = self.state.lock();
        if *state == VerificationState::Verifying {
            debug!("Verification abandoned, back to {}", restore.name());
            *state = restore;
        }
    }
}

/// Gate terminal state machine.
pub struct VerificationStateMachine {
    tokens: Arc<ExitTokenService>,
    ledger: Arc<TransactionLedger>,
    flag_threshold: u8,
    state: Mutex<VerificationState>,
    events_tx: GateEventsSender,
}

impl VerificationStateMachine {
    /// Create an idle terminal.
    #[must_use]
    pub fn new(tokens: Arc<ExitTokenService>, ledger: Arc<TransactionLedger>) -> Self {
        let (events_tx, _) = create_event_channel();
        Self {
            tokens,
            ledger,
            flag_threshold: DEFAULT_FLAG_THRESHOLD,
            state: Mutex::new(VerificationState::Idle),
            events_tx,
        }
    }

    /// Override the risk threshold.
    #[must_use]
    pub fn with_flag_threshold(mut self, threshold: u8) -> Self {
        self.flag_threshold = threshold;
        self
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> VerificationState {
        self.state.lock().clone()
    }

    /// Subscribe to gate events.
    #[must_use]
    pub fn subscribe_events(&self) -> GateEventsChannel {
        self.events_tx.subscribe()
    }

    /// Verify a scanned credential.
    ///
    /// Scans arriving while another is in flight return
    /// [`ScanOutcome::Dropped`]. An exit pass whose record is missing from
    /// the ledger is decided from the pass itself; if the ledger cannot be
    /// read at all the decision is always flagged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] while a flagged decision awaits
    /// release, full audit, or reset.
    pub async fn handle(&self, scanned: &str) -> Result<ScanOutcome> {
        {
            let mut state = self.state.lock();
            match &*state {
                VerificationState::Verifying => {
                    debug!("Scan dropped: verification already in flight");
                    let _ = self.events_tx.send(GateEvent::ScanDropped);
                    return Ok(ScanOutcome::Dropped);
                }
                VerificationState::Flagged(decision) => {
                    return Err(Error::InvalidTransition(format!(
                        "transaction {} is flagged; release, audit or reset first",
                        decision.record.id
                    )));
                }
                _ => *state = VerificationState::Verifying,
            }
        }
        let in_flight = InFlight::new(&self.state, VerificationState::Idle);
        let _ = self.events_tx.send(GateEvent::ScanAccepted);

        let next = self.evaluate(scanned.trim()).await;
        info!("Gate decision: {}", next.name());

        in_flight.finish(next.clone());
        let _ = self.events_tx.send(GateEvent::Decision {
            transaction_id: next.transaction_id(),
            state: next.name(),
        });
        Ok(ScanOutcome::Completed(next))
    }

    /// Release the customer: status `Verified`, pass redeemed, back to idle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] unless the state is `Success` or
    /// `Flagged`, or storage errors (the decision is kept so staff can retry).
    pub async fn release(&self, staff_id: &str) -> Result<ActionOutcome> {
        self.act(StaffAction::Release, staff_id, None).await
    }

    /// Send the customer for a full audit: status `Flagged`, pass redeemed,
    /// back to idle.
    ///
    /// # Errors
    ///
    /// Same as [`VerificationStateMachine::release`].
    pub async fn full_audit(&self, staff_id: &str, notes: &str) -> Result<ActionOutcome> {
        self.act(StaffAction::FullAudit, staff_id, Some(notes)).await
    }

    /// Return to idle from any decided state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] while verifying.
    pub fn reset(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state == VerificationState::Verifying {
            return Err(Error::InvalidTransition(
                "cannot reset while verifying".to_string(),
            ));
        }
        if *state != VerificationState::Idle {
            debug!("Gate reset from {}", state.name());
            *state = VerificationState::Idle;
            let _ = self.events_tx.send(GateEvent::Reset);
        }
        Ok(())
    }

    async fn act(
        &self,
        action: StaffAction,
        staff_id: &str,
        notes: Option<&str>,
    ) -> Result<ActionOutcome> {
        let (decision, previous) = {
            let mut state = self.state.lock();
            let Some(decision) = state.decision().cloned() else {
                return Err(Error::InvalidTransition(format!(
                    "{action} needs a SUCCESS or FLAGGED decision, state is {}",
                    state.name()
                )));
            };
            let previous = std::mem::replace(&mut *state, VerificationState::Verifying);
            (decision, previous)
        };
        let in_flight = InFlight::new(&self.state, previous);

        let id = decision.record.id.clone();
        let status = match action {
            StaffAction::Release => TransactionStatus::Verified,
            StaffAction::FullAudit => TransactionStatus::Flagged,
        };

        let written = async {
            let status_update = self
                .ledger
                .update_status(&id, status, staff_id, notes)
                .await?;
            let redemption = self.ledger.mark_redeemed(&id).await?;
            Ok::<_, Error>((status_update, redemption))
        }
        .await;

        let (status_update, redemption) = match written {
            Ok(written) => written,
            Err(e) => {
                warn!("{action} for {id} failed: {e}");
                return Err(e);
            }
        };

        if status_update.is_not_found() {
            warn!("{action} for {id}: no ledger record reachable, nothing written");
        }
        info!("{action} for {id} by {staff_id}");

        in_flight.finish(VerificationState::Idle);
        let event = match action {
            StaffAction::Release => GateEvent::Released {
                transaction_id: id.clone(),
                staff_id: staff_id.to_string(),
            },
            StaffAction::FullAudit => GateEvent::Audited {
                transaction_id: id.clone(),
                staff_id: staff_id.to_string(),
            },
        };
        let _ = self.events_tx.send(event);

        Ok(ActionOutcome {
            action,
            transaction_id: id,
            status_update,
            redemption,
        })
    }

    async fn evaluate(&self, scanned: &str) -> VerificationState {
        if pickup::is_pickup_pass(scanned) {
            return self.evaluate_pickup_pass(scanned).await;
        }
        if scanned.to_ascii_uppercase().starts_with(PICKUP_CODE_PREFIX) {
            return self.evaluate_pickup_code(scanned).await;
        }

        match self.tokens.verify(scanned) {
            PassVerification::Invalid(error) => {
                debug!("Exit pass rejected: {error}");
                VerificationState::NotFound { error }
            }
            PassVerification::Expired(claims) => VerificationState::Expired {
                expired_at: claims.expires_at(),
                transaction_id: claims.id,
            },
            PassVerification::Valid(claims) => match self.ledger.lookup(&claims.id).await {
                Ok(Some(record)) => self.decide(record, RecordSource::Ledger, CredentialKind::ExitPass),
                Ok(None) => {
                    warn!("Transaction {} not in ledger, using pass contents", claims.id);
                    self.decide_from_claims(&claims)
                }
                Err(e) => {
                    warn!("Ledger lookup for {} failed ({e}), staff must check", claims.id);
                    self.decide_unverified(&claims)
                }
            },
        }
    }

    async fn evaluate_pickup_pass(&self, scanned: &str) -> VerificationState {
        let pass = match pickup::decode(scanned) {
            PassVerification::Valid(pass) => pass,
            other => {
                return VerificationState::NotFound {
                    error: other.error().unwrap_or(TokenError::NotFound),
                }
            }
        };

        match self.ledger.lookup(&pass.tx_id).await {
            Ok(Some(record))
                if record.pickup_code.as_deref() == Some(pass.pickup_code.as_str())
                    && record.total == pass.total =>
            {
                self.decide(record, RecordSource::Ledger, CredentialKind::PickupPass)
            }
            Ok(Some(_)) => VerificationState::NotFound {
                error: TokenError::MalformedInput(
                    "pickup pass does not match its order".to_string(),
                ),
            },
            Ok(None) => VerificationState::NotFound {
                error: TokenError::NotFound,
            },
            Err(e) => {
                warn!("Ledger lookup for pickup {} failed: {e}", pass.tx_id);
                VerificationState::NotFound {
                    error: TokenError::NotFound,
                }
            }
        }
    }

    async fn evaluate_pickup_code(&self, code: &str) -> VerificationState {
        match self.ledger.lookup_by_pickup_code(code).await {
            Ok(Some(record)) => self.decide(record, RecordSource::Ledger, CredentialKind::PickupCode),
            Ok(None) => VerificationState::NotFound {
                error: TokenError::NotFound,
            },
            Err(e) => {
                warn!("Ledger lookup for pickup code failed: {e}");
                VerificationState::NotFound {
                    error: TokenError::NotFound,
                }
            }
        }
    }

    fn decide(
        &self,
        record: TransactionRecord,
        source: RecordSource,
        credential: CredentialKind,
    ) -> VerificationState {
        let item_count = record.item_count();
        self.decide_with_count(record, source, credential, item_count, Vec::new())
    }

    fn decide_from_claims(&self, claims: &ExitPassClaims) -> VerificationState {
        self.decide_with_count(
            record_from_claims(claims),
            RecordSource::PassFallback,
            CredentialKind::ExitPass,
            claims.item_count,
            Vec::new(),
        )
    }

    fn decide_unverified(&self, claims: &ExitPassClaims) -> VerificationState {
        self.decide_with_count(
            record_from_claims(claims),
            RecordSource::PassFallback,
            CredentialKind::ExitPass,
            claims.item_count,
            vec![FlagReason::LedgerUnavailable],
        )
    }

    fn decide_with_count(
        &self,
        record: TransactionRecord,
        source: RecordSource,
        credential: CredentialKind,
        item_count: u32,
        mut reasons: Vec<FlagReason>,
    ) -> VerificationState {
        if record.pass_redeemed {
            reasons.push(FlagReason::AlreadyRedeemed);
        }
        if record.status == TransactionStatus::Flagged {
            reasons.push(FlagReason::PreviouslyFlagged);
        }
        if record.risk_score > self.flag_threshold {
            reasons.push(FlagReason::HighRisk {
                score: record.risk_score,
                threshold: self.flag_threshold,
            });
        }

        let decision = GateDecision {
            record,
            source,
            credential,
            item_count,
            reasons,
        };
        if decision.reasons.is_empty() {
            VerificationState::Success(decision)
        } else {
            VerificationState::Flagged(decision)
        }
    }
}

/// Minimal record rebuilt from signed pass claims. Line items are unknown.
fn record_from_claims(claims: &ExitPassClaims) -> TransactionRecord {
    let created_at = Utc
        .timestamp_opt(claims.timestamp, 0)
        .single()
        .unwrap_or_default();

    TransactionRecord {
        id: claims.id.clone(),
        owner_id: claims.owner_id.clone(),
        items: Vec::new(),
        subtotal: claims.total,
        tax: 0,
        total: claims.total,
        risk_score: claims.risk_score,
        status: claims.status,
        created_at,
        pass_expiry: claims.expires_at(),
        pass_redeemed: false,
        redeemed_at: None,
        verified_by: None,
        verified_at: None,
        audit_notes: None,
        pickup_code: None,
        synced_to_cloud: false,
        version: 0,
    }
}
