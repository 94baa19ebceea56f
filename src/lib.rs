//! # exit-pass
//!
//! Transaction ledger, signed exit passes and gate verification for
//! in-store self-checkout.
//!
//! ## Architecture
//!
//! The customer side and the staff side never share memory. They meet in
//! the ledger's storage backend and in the shared signing key:
//!
//! ```text
//! ┌──────────────────────────┐                 ┌──────────────────────────┐
//! │ customer device          │                 │ staff terminal           │
//! │                          │   exit pass     │                          │
//! │ CheckoutService ─────────┼────────────────▶│ VerificationStateMachine │
//! │   charge, score, create, │  (QR / string)  │   verify, lookup, decide │
//! │   issue pass             │                 │   release / full audit   │
//! │                          │                 │                          │
//! │ NotificationChannel ◀────┼──── ledger ◀────┼── update_status,         │
//! │   push or polling        │    (shared      │   mark_redeemed          │
//! │                          │     storage)    │                          │
//! └──────────────────────────┘                 └──────────────────────────┘
//! ```
//!
//! ## Trust model
//!
//! Exit passes are HMAC-SHA256 tokens: a pass cannot be forged without the
//! shared key, and expiry is checked offline. Redemption state lives in the
//! ledger, so reuse is caught when the gate can reach the ledger. Pickup
//! passes only carry a checksum and are a lookup convenience.
//!
//! ## Example
//!
//! ```rust,ignore
//! use exit_pass::{GateBuilder, GateConfig};
//!
//! let gate = GateBuilder::new(GateConfig::default()).build()?;
//! let done = gate.checkout().complete_checkout(request).await?;
//! let terminal = gate.terminal();
//! terminal.handle(&done.pass.token).await?;
//! terminal.release("staff-1").await?;
//! ```

pub mod checkout;
pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod gate;
pub mod ledger;
pub mod notify;
pub mod record;
pub mod risk;
pub mod token;
pub mod verification;

pub use checkout::{CheckoutRequest, CheckoutService, CompletedCheckout, Fulfillment};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::GateConfig;
pub use error::{Error, Result};
pub use event::{GateEvent, GateEventsChannel};
pub use gate::{Gate, GateBuilder};
pub use ledger::{TransactionLedger, WriteOutcome};
pub use notify::{NotificationChannel, NotificationEvent, NotificationInbox, NotificationKind};
pub use record::{LineItem, TransactionRecord, TransactionStatus};
pub use token::{ExitTokenService, PassVerification, TokenError};
pub use verification::{ScanOutcome, VerificationState, VerificationStateMachine};
