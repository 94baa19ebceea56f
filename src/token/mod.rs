//! Pass credentials shown by the customer and scanned by staff.
//!
//! Two credential kinds exist:
//!
//! - **Exit pass** ([`ExitTokenService`]): three dot-separated base64url
//!   segments (header, claims, HMAC-SHA256 signature) with issued-at and
//!   expiry claims. Signature and expiry are checked offline with the shared
//!   key and the clock; redemption state is checked afterwards in the ledger.
//! - **Pickup pass** ([`pickup`]): an ASCII prefix followed by base64 JSON
//!   with an embedded checksum. It detects accidental corruption only and is
//!   a lookup convenience, not proof of payment.
//!
//! ```text
//! scanned string
//!        │
//!        ▼
//! ┌─────────────────────┐
//! │ three segments?     │── no ──▶ Invalid(MalformedInput)
//! └─────────┬───────────┘
//!           ▼
//! ┌─────────────────────┐
//! │ HMAC matches?       │── no ──▶ Invalid(SignatureInvalid)
//! └─────────┬───────────┘
//!           ▼
//! ┌─────────────────────┐
//! │ now < exp?          │── no ──▶ Expired(claims)
//! └─────────┬───────────┘
//!           ▼
//!      Valid(claims)
//! ```

mod exit;
pub mod pickup;

pub use exit::{
    ExitPassClaims, ExitTokenService, IssuedPass, SigningKey, DEFAULT_PASS_TTL_SECS,
    SIGNING_ALGORITHM,
};
pub use pickup::{PickupPass, PICKUP_PASS_PREFIX};

use thiserror::Error;

/// Why a scanned credential was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    /// Wrong shape: not three segments, bad base64, or bad JSON.
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// Signature does not match: tampered or signed with another key.
    #[error("Signature invalid")]
    SignatureInvalid,

    /// Signature is good but the pass is past its expiry.
    #[error("Pass expired")]
    Expired,

    /// Credential is valid but no matching transaction exists.
    #[error("Transaction not found")]
    NotFound,

    /// Pickup pass checksum does not match its contents.
    #[error("Checksum mismatch")]
    ChecksumMismatch,
}

/// Tagged outcome of decoding a credential.
///
/// Verification never fails with an `Err`: every path lands in one of these
/// variants so the caller can pick the right recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassVerification<C> {
    /// Structurally sound, authentic and within its lifetime.
    Valid(C),
    /// Authentic but past expiry.
    Expired(C),
    /// Rejected.
    Invalid(TokenError),
}

impl<C> PassVerification<C> {
    /// Returns true only for [`PassVerification::Valid`].
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }

    /// Returns true only for [`PassVerification::Expired`].
    #[must_use]
    pub fn is_expired(&self) -> bool {
        matches!(self, Self::Expired(_))
    }

    /// Decoded claims, present for valid and expired credentials.
    #[must_use]
    pub fn payload(&self) -> Option<&C> {
        match self {
            Self::Valid(claims) | Self::Expired(claims) => Some(claims),
            Self::Invalid(_) => None,
        }
    }

    /// Consume and return the claims, if any.
    #[must_use]
    pub fn into_payload(self) -> Option<C> {
        match self {
            Self::Valid(claims) | Self::Expired(claims) => Some(claims),
            Self::Invalid(_) => None,
        }
    }

    /// The error kind, if the credential is not valid.
    #[must_use]
    pub fn error(&self) -> Option<TokenError> {
        match self {
            Self::Valid(_) => None,
            Self::Expired(_) => Some(TokenError::Expired),
            Self::Invalid(err) => Some(err.clone()),
        }
    }
}
