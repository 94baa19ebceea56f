//! HMAC-SHA256 exit passes.
//!
//! Wire format: `base64url(header).base64url(claims).base64url(signature)`,
//! unpadded, where the signature is HMAC-SHA256 over the first two segments
//! joined by a dot. The MAC key is derived from the shared secret with
//! HKDF-SHA256 under [`SIGNING_CONTEXT`].

use super::{PassVerification, TokenError};
use crate::clock::SharedClock;
use crate::config::GateConfig;
use crate::error::{Error, Result};
use crate::record::{Amount, TransactionRecord, TransactionStatus};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, TimeZone, Utc};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

/// Signing context for key derivation (domain separation from other uses of the secret).
pub const SIGNING_CONTEXT: &[u8] = b"exit-pass-v1";

/// Algorithm name carried in the header.
pub const SIGNING_ALGORITHM: &str = "HS256";

/// Default exit pass lifetime.
pub const DEFAULT_PASS_TTL_SECS: i64 = 300;

/// Demo secret used when no secret is configured.
///
/// Issuer and verifier run on untrusted devices in the demo deployment, so
/// anyone holding the binary holds this key. Production deployments must
/// configure `signing_secret` and keep signing behind a trusted service.
const DEMO_SECRET: &[u8] = b"exit-pass-demo-shared-secret-do-not-ship";

/// Symmetric key shared by the issuing and verifying sides.
#[derive(Clone)]
pub struct SigningKey([u8; 32]);

impl SigningKey {
    /// Derive a signing key from raw secret bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Crypto`] if the secret is empty.
    pub fn derive(secret: &[u8]) -> Result<Self> {
        if secret.is_empty() {
            return Err(Error::Crypto("signing secret must not be empty".to_string()));
        }
        Ok(Self(expand_key(secret)))
    }

    /// Derive a signing key from a hex-encoded secret.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Crypto`] if the string is not hex or is empty.
    pub fn from_hex(secret: &str) -> Result<Self> {
        let bytes = hex::decode(secret.trim())
            .map_err(|e| Error::Crypto(format!("signing secret is not hex: {e}")))?;
        Self::derive(&bytes)
    }

    /// Key derived from the built-in demo secret.
    #[must_use]
    pub fn demo() -> Self {
        Self(expand_key(DEMO_SECRET))
    }

    /// Key from configuration, falling back to the demo secret.
    ///
    /// # Errors
    ///
    /// Returns an error if a configured secret is malformed.
    pub fn from_config(config: &GateConfig) -> Result<Self> {
        match config.signing_secret {
            Some(ref secret) => Self::from_hex(secret),
            None => {
                warn!("No signing_secret configured - using the built-in demo secret");
                Ok(Self::demo())
            }
        }
    }

    fn mac(&self) -> Result<HmacSha256> {
        <HmacSha256 as Mac>::new_from_slice(&self.0)
            .map_err(|e| Error::Crypto(format!("invalid HMAC key: {e}")))
    }
}

fn expand_key(secret: &[u8]) -> [u8; 32] {
    let mut okm = [0u8; 32];
    // 32 bytes is well within the HKDF-SHA256 output limit, so expand cannot fail.
    let _ = Hkdf::<Sha256>::new(None, secret).expand(SIGNING_CONTEXT, &mut okm);
    okm
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SigningKey(<redacted>)")
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
}

/// Claims carried by an exit pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitPassClaims {
    /// Transaction id.
    pub id: String,
    /// Paying party.
    pub owner_id: String,
    /// Purchase total in minor units.
    pub total: Amount,
    /// Number of units purchased.
    pub item_count: u32,
    /// Risk score at creation.
    pub risk_score: u8,
    /// Status when the pass was issued.
    pub status: TransactionStatus,
    /// Record creation time, unix seconds.
    pub timestamp: i64,
    /// Issued at, unix seconds.
    pub iat: i64,
    /// Expiry, unix seconds. The pass is expired once `now >= exp`.
    pub exp: i64,
}

impl ExitPassClaims {
    /// Expiry as a timestamp.
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.exp, 0).single()
    }
}

/// A freshly signed pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedPass {
    /// The encoded token to render as a scannable code.
    pub token: String,
    /// Transaction the pass belongs to.
    pub transaction_id: String,
    /// Issue time.
    pub issued_at: DateTime<Utc>,
    /// Expiry time.
    pub expires_at: DateTime<Utc>,
}

/// Issues and verifies exit passes.
pub struct ExitTokenService {
    key: SigningKey,
    clock: SharedClock,
    default_ttl: Duration,
}

impl ExitTokenService {
    /// Create a service with the default five minute lifetime.
    #[must_use]
    pub fn new(key: SigningKey, clock: SharedClock) -> Self {
        Self {
            key,
            clock,
            default_ttl: Duration::seconds(DEFAULT_PASS_TTL_SECS),
        }
    }

    /// Override the default lifetime.
    #[must_use]
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Default lifetime used by [`ExitTokenService::issue`].
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Issue a pass with the default lifetime.
    ///
    /// # Errors
    ///
    /// See [`ExitTokenService::issue_with_ttl`].
    pub fn issue(&self, record: &TransactionRecord) -> Result<IssuedPass> {
        self.issue_with_ttl(record, self.default_ttl)
    }

    /// Sign a snapshot of `record` valid for `ttl`.
    ///
    /// Issuing again for the same record yields an independent pass with a
    /// fresh expiry. Nothing is written to the ledger.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `ttl` is not positive or pushes the expiry
    /// past the representable range, or a serialization
    /// error if the claims cannot be encoded.
    pub fn issue_with_ttl(&self, record: &TransactionRecord, ttl: Duration) -> Result<IssuedPass> {
        if ttl <= Duration::zero() {
            return Err(Error::Config("pass ttl must be positive".to_string()));
        }

        let issued_at = self.clock.now();
        let expires_at = issued_at
            .checked_add_signed(ttl)
            .ok_or_else(|| Error::Config(format!("pass ttl of {ttl} is out of range")))?;
        let claims = ExitPassClaims {
            id: record.id.clone(),
            owner_id: record.owner_id.clone(),
            total: record.total,
            item_count: record.item_count(),
            risk_score: record.risk_score,
            status: record.status,
            timestamp: record.created_at.timestamp(),
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
        };

        let header = Header {
            alg: SIGNING_ALGORITHM.to_string(),
            typ: "JWT".to_string(),
        };
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?),
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?)
        );

        let mut mac = self.key.mac()?;
        mac.update(signing_input.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        let token = format!("{signing_input}.{signature}");

        debug!(
            "Issued exit pass for {} ({} bytes, expires {})",
            record.id,
            token.len(),
            expires_at
        );

        Ok(IssuedPass {
            token,
            transaction_id: record.id.clone(),
            issued_at,
            expires_at,
        })
    }

    /// Check structure, signature and expiry of a scanned string.
    ///
    /// Never panics and never returns an error: every failure is reported as
    /// [`PassVerification::Invalid`] with a specific [`TokenError`].
    #[must_use]
    pub fn verify(&self, token: &str) -> PassVerification<ExitPassClaims> {
        let mut segments = token.trim().splitn(3, '.');
        let (Some(header_b64), Some(claims_b64), Some(signature_b64)) =
            (segments.next(), segments.next(), segments.next())
        else {
            return malformed("expected three dot-separated segments");
        };
        if header_b64.is_empty() || claims_b64.is_empty() || signature_b64.is_empty() {
            return malformed("empty segment");
        }

        let header: Header = match decode_json(header_b64) {
            Some(header) => header,
            None => return malformed("header is not base64url JSON"),
        };
        if header.alg != SIGNING_ALGORITHM {
            return malformed("unsupported signing algorithm");
        }

        let Ok(signature) = URL_SAFE_NO_PAD.decode(signature_b64) else {
            return PassVerification::Invalid(TokenError::SignatureInvalid);
        };

        let Ok(mut mac) = self.key.mac() else {
            return PassVerification::Invalid(TokenError::SignatureInvalid);
        };
        mac.update(header_b64.as_bytes());
        mac.update(b".");
        mac.update(claims_b64.as_bytes());
        if mac.verify_slice(&signature).is_err() {
            debug!("Exit pass signature mismatch");
            return PassVerification::Invalid(TokenError::SignatureInvalid);
        }

        let claims: ExitPassClaims = match decode_json(claims_b64) {
            Some(claims) => claims,
            None => return malformed("claims are not base64url JSON"),
        };

        if self.clock.now().timestamp() >= claims.exp {
            debug!("Exit pass for {} expired at {}", claims.id, claims.exp);
            return PassVerification::Expired(claims);
        }

        PassVerification::Valid(claims)
    }
}

fn malformed<C>(reason: &str) -> PassVerification<C> {
    PassVerification::Invalid(TokenError::MalformedInput(reason.to_string()))
}

fn decode_json<T: for<'de> Deserialize<'de>>(segment: &str) -> Option<T> {
    let bytes = URL_SAFE_NO_PAD.decode(segment).ok()?;
    serde_json::from_slice(&bytes).ok()
}
