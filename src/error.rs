//! Error types for exit-pass.

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by ledger, storage, configuration and checkout operations.
///
/// Pass verification never produces this type: it reports failures through
/// [`crate::token::PassVerification`] so callers can branch on the failure kind.
#[derive(Debug, Error)]
pub enum Error {
    /// Filesystem or OS error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be read or is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON encoding or decoding failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The storage backend failed in a way that may succeed on retry.
    #[error("Transient storage error: {0}")]
    StorageUnavailable(String),

    /// A compare-and-swap write lost a race with another writer.
    #[error("Storage conflict on '{key}': expected revision {expected:?}, found {found:?}")]
    Conflict {
        /// Namespace key being written.
        key: String,
        /// Revision the writer read.
        expected: Option<u64>,
        /// Revision currently stored.
        found: Option<u64>,
    },

    /// A record failed validation before entering the ledger.
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// A different record already exists under this id.
    #[error("Duplicate transaction id: {0}")]
    DuplicateId(String),

    /// A state machine action was requested from a state that does not allow it.
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// The pass for this transaction has already been consumed at a gate.
    #[error("Pass already redeemed for transaction {0}")]
    PassRedeemed(String),

    /// The transaction is not present in the ledger.
    #[error("Transaction not found: {0}")]
    NotFound(String),

    /// Key material is missing or malformed.
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Payment gateway declined or failed.
    #[error("Payment error: {0}")]
    Payment(String),
}

impl Error {
    /// Returns true if the operation may succeed when retried unchanged.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_) | Self::Conflict { .. })
    }
}
