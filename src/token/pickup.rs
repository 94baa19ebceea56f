//! Pickup passes for pre-ordered collections.
//!
//! Format: [`PICKUP_PASS_PREFIX`] followed by standard base64 of a JSON
//! object. The embedded checksum is a 32-bit rolling hash of the transaction
//! id and total. It catches accidental corruption only; anyone can recompute
//! it, so a pickup pass is never accepted as proof of payment on its own.

use super::{PassVerification, TokenError};
use crate::error::{Error, Result};
use crate::record::{Amount, TransactionRecord};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Scheme prefix identifying a pickup pass.
pub const PICKUP_PASS_PREFIX: &str = "PICKUP1:";

/// Value of the `type` field.
pub const PICKUP_PASS_TYPE: &str = "pickup";

/// Current format version.
pub const PICKUP_PASS_VERSION: u8 = 1;

/// Decoded pickup pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PickupPass {
    /// Always [`PICKUP_PASS_TYPE`].
    #[serde(rename = "type")]
    pub kind: String,
    /// Format version.
    pub version: u8,
    /// Transaction id.
    pub tx_id: String,
    /// Human-readable fallback code.
    pub pickup_code: String,
    /// Purchase total in minor units.
    pub total: Amount,
    /// Number of units.
    pub item_count: u32,
    /// Store the order is collected from.
    pub mall: String,
    /// Issue time, unix milliseconds.
    pub timestamp: i64,
    /// `checksum(tx_id, total)` as 8 lowercase hex characters.
    pub checksum: String,
}

/// Rolling hash over `"{tx_id}:{total}"`, rendered as 8 hex characters.
#[must_use]
pub fn checksum(tx_id: &str, total: Amount) -> String {
    let hash = format!("{tx_id}:{total}")
        .chars()
        .fold(0u32, |hash, c| hash.wrapping_mul(31).wrapping_add(u32::from(c)));
    format!("{hash:08x}")
}

/// Returns true if the string uses the pickup pass scheme.
#[must_use]
pub fn is_pickup_pass(scanned: &str) -> bool {
    scanned.trim_start().starts_with(PICKUP_PASS_PREFIX)
}

/// Encode a pickup pass for a record that carries a pickup code.
///
/// # Errors
///
/// Returns [`Error::InvalidRecord`] if the record has no pickup code.
pub fn encode(record: &TransactionRecord, mall: &str, issued_at: DateTime<Utc>) -> Result<String> {
    let pickup_code = record.pickup_code.clone().ok_or_else(|| {
        Error::InvalidRecord(format!("{} is not a pickup order", record.id))
    })?;

    let pass = PickupPass {
        kind: PICKUP_PASS_TYPE.to_string(),
        version: PICKUP_PASS_VERSION,
        tx_id: record.id.clone(),
        pickup_code,
        total: record.total,
        item_count: record.item_count(),
        mall: mall.to_string(),
        timestamp: issued_at.timestamp_millis(),
        checksum: checksum(&record.id, record.total),
    };

    let json = serde_json::to_vec(&pass)?;
    Ok(format!("{PICKUP_PASS_PREFIX}{}", STANDARD.encode(json)))
}

/// Decode and check a scanned pickup pass. Pickup passes do not expire.
#[must_use]
pub fn decode(scanned: &str) -> PassVerification<PickupPass> {
    let Some(body) = scanned.trim().strip_prefix(PICKUP_PASS_PREFIX) else {
        return malformed("missing pickup pass prefix");
    };
    let Ok(bytes) = STANDARD.decode(body) else {
        return malformed("pickup pass is not base64");
    };
    let Ok(pass) = serde_json::from_slice::<PickupPass>(&bytes) else {
        return malformed("pickup pass is not valid JSON");
    };
    if pass.kind != PICKUP_PASS_TYPE || pass.version != PICKUP_PASS_VERSION {
        return malformed("unsupported pickup pass type or version");
    }
    if pass.checksum != checksum(&pass.tx_id, pass.total) {
        return PassVerification::Invalid(TokenError::ChecksumMismatch);
    }
    PassVerification::Valid(pass)
}

fn malformed(reason: &str) -> PassVerification<PickupPass> {
    PassVerification::Invalid(TokenError::MalformedInput(reason.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::record::LineItem;

    fn pickup_record() -> TransactionRecord {
        TransactionRecord::with_id(
            "TXN-00AA11BB22CC",
            "customer-002",
            vec![LineItem::new("SKU-9", "Cake", 1_200, 1)],
            60,
            15,
            Utc::now(),
        )
        .expect("valid")
        .with_pickup_code("PK-ABC234")
    }

    #[test]
    fn test_encode_decode() {
        let token = encode(&pickup_record(), "Main Store", Utc::now()).expect("encode");
        assert!(is_pickup_pass(&token));

        let verification = decode(&token);
        let pass = verification.payload().expect("valid");
        assert_eq!(pass.tx_id, "TXN-00AA11BB22CC");
        assert_eq!(pass.pickup_code, "PK-ABC234");
        assert_eq!(pass.total, 1_260);
        assert_eq!(pass.mall, "Main Store");
        assert_eq!(pass.checksum.len(), 8);
    }

    #[test]
    fn test_corrupted_checksum() {
        let token = encode(&pickup_record(), "Main Store", Utc::now()).expect("encode");
        let body = token.strip_prefix(PICKUP_PASS_PREFIX).expect("prefix");
        let mut pass: PickupPass =
            serde_json::from_slice(&STANDARD.decode(body).expect("b64")).expect("json");
        pass.checksum = "deadbeef".to_string();
        let corrupted = format!(
            "{PICKUP_PASS_PREFIX}{}",
            STANDARD.encode(serde_json::to_vec(&pass).expect("json"))
        );

        let verification = decode(&corrupted);
        assert!(!verification.is_valid());
        assert_eq!(verification.error(), Some(TokenError::ChecksumMismatch));
        assert_eq!(
            verification.error().map(|e| e.to_string()).as_deref(),
            Some("Checksum mismatch")
        );
    }

    #[test]
    fn test_altered_total_detected() {
        let token = encode(&pickup_record(), "Main Store", Utc::now()).expect("encode");
        let body = token.strip_prefix(PICKUP_PASS_PREFIX).expect("prefix");
        let mut pass: PickupPass =
            serde_json::from_slice(&STANDARD.decode(body).expect("b64")).expect("json");
        pass.total = 1;
        let altered = format!(
            "{PICKUP_PASS_PREFIX}{}",
            STANDARD.encode(serde_json::to_vec(&pass).expect("json"))
        );

        assert_eq!(decode(&altered).error(), Some(TokenError::ChecksumMismatch));
    }

    #[test]
    fn test_malformed_inputs() {
        for input in ["", "PICKUP1:", "PICKUP1:!!!", "OTHER:e30=", "PICKUP1:e30="] {
            assert!(
                matches!(decode(input).error(), Some(TokenError::MalformedInput(_))),
                "{input:?}"
            );
        }
    }

    #[test]
    fn test_non_pickup_record_refused() {
        let record = TransactionRecord::with_id(
            "TXN-1",
            "c",
            vec![LineItem::new("SKU", "Tea", 10, 1)],
            0,
            0,
            Utc::now(),
        )
        .expect("valid");
        assert!(encode(&record, "Main Store", Utc::now()).is_err());
    }

    #[test]
    fn test_checksum_is_deterministic() {
        assert_eq!(checksum("TXN-1", 450), checksum("TXN-1", 450));
        assert_ne!(checksum("TXN-1", 450), checksum("TXN-1", 451));
        assert_ne!(checksum("TXN-1", 450), checksum("TXN-2", 450));
    }
}
