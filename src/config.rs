//! Configuration for exit-pass.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Lower bound for the polling notification interval.
const MIN_POLL_INTERVAL_MS: u64 = 50;

/// Upper bound for the polling notification interval (keeps it sub-second).
pub const MAX_POLL_INTERVAL_MS: u64 = 1_000;

/// Longest exit pass lifetime accepted, one day.
pub const MAX_PASS_TTL_SECS: u64 = 86_400;

/// Gate configuration shared by the customer and staff sides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Directory holding the file-backed ledger.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Store name embedded in pickup passes.
    #[serde(default = "default_store_name")]
    pub store_name: String,

    /// Hex-encoded shared signing secret. `None` falls back to the demo secret.
    #[serde(default)]
    pub signing_secret: Option<String>,

    /// Exit pass time to live in seconds.
    #[serde(default = "default_pass_ttl")]
    pub pass_ttl_secs: u64,

    /// Maximum number of records kept in the ledger.
    #[serde(default = "default_ledger_capacity")]
    pub ledger_capacity: usize,

    /// Polling notification interval in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Risk scores strictly above this value force a manual check.
    #[serde(default = "default_flag_threshold")]
    pub flag_threshold: u8,

    /// Tax rate applied to the subtotal, in basis points.
    #[serde(default = "default_tax_rate")]
    pub tax_rate_bps: u32,

    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            store_name: default_store_name(),
            signing_secret: None,
            pass_ttl_secs: default_pass_ttl(),
            ledger_capacity: default_ledger_capacity(),
            poll_interval_ms: default_poll_interval(),
            flag_threshold: default_flag_threshold(),
            tax_rate_bps: default_tax_rate(),
            log_level: default_log_level(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "exit-pass")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".exit-pass"))
}

fn default_store_name() -> String {
    "Main Store".to_string()
}

const fn default_pass_ttl() -> u64 {
    300 // 5 minutes
}

const fn default_ledger_capacity() -> usize {
    100
}

const fn default_poll_interval() -> u64 {
    250
}

const fn default_flag_threshold() -> u8 {
    65
}

const fn default_tax_rate() -> u32 {
    500 // 5%
}

fn default_log_level() -> String {
    "info".to_string()
}

impl GateConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| crate::Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn to_file(&self, path: &std::path::Path) -> crate::Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| crate::Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] naming the first invalid field.
    pub fn validate(&self) -> crate::Result<()> {
        if self.pass_ttl_secs == 0 {
            return Err(crate::Error::Config(
                "pass_ttl_secs must be greater than zero".to_string(),
            ));
        }
        if self.pass_ttl_secs > MAX_PASS_TTL_SECS {
            return Err(crate::Error::Config(format!(
                "pass_ttl_secs must be at most {MAX_PASS_TTL_SECS}, got {}",
                self.pass_ttl_secs
            )));
        }
        if self.ledger_capacity == 0 {
            return Err(crate::Error::Config(
                "ledger_capacity must be greater than zero".to_string(),
            ));
        }
        if self.flag_threshold > 100 {
            return Err(crate::Error::Config(format!(
                "flag_threshold must be within 0..=100, got {}",
                self.flag_threshold
            )));
        }
        if let Some(ref secret) = self.signing_secret {
            hex::decode(secret)
                .map_err(|e| crate::Error::Config(format!("signing_secret is not hex: {e}")))?;
        }
        Ok(())
    }

    /// Exit pass time to live, capped at [`MAX_PASS_TTL_SECS`].
    #[must_use]
    pub fn pass_ttl(&self) -> chrono::Duration {
        let secs = self.pass_ttl_secs.min(MAX_PASS_TTL_SECS);
        i64::try_from(secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or_else(|| chrono::Duration::days(1))
    }

    /// Polling interval, clamped so the loop stays sub-second without spinning.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(
            self.poll_interval_ms
                .clamp(MIN_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS),
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GateConfig::default();
        assert_eq!(config.pass_ttl_secs, 300);
        assert_eq!(config.ledger_capacity, 100);
        assert_eq!(config.flag_threshold, 65);
        assert!(config.signing_secret.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: GateConfig = toml::from_str("pass_ttl_secs = 60\nstore_name = \"Dock 4\"")
            .expect("should parse");
        assert_eq!(config.pass_ttl_secs, 60);
        assert_eq!(config.store_name, "Dock 4");
        assert_eq!(config.ledger_capacity, 100);
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("gate.toml");

        let config = GateConfig {
            signing_secret: Some("00ff".repeat(16)),
            poll_interval_ms: 100,
            ..GateConfig::default()
        };
        config.to_file(&path).expect("write");

        let loaded = GateConfig::from_file(&path).expect("read");
        assert_eq!(loaded.signing_secret, config.signing_secret);
        assert_eq!(loaded.poll_interval_ms, 100);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let zero_ttl = GateConfig {
            pass_ttl_secs: 0,
            ..GateConfig::default()
        };
        assert!(zero_ttl.validate().is_err());

        let bad_secret = GateConfig {
            signing_secret: Some("not-hex".to_string()),
            ..GateConfig::default()
        };
        assert!(bad_secret.validate().is_err());
    }

    #[test]
    fn test_pass_ttl_bounded() {
        let huge = GateConfig {
            pass_ttl_secs: 100_000_000_000_000_000,
            ..GateConfig::default()
        };
        assert!(matches!(huge.validate(), Err(crate::Error::Config(_))));
        assert_eq!(
            huge.pass_ttl(),
            chrono::Duration::seconds(86_400),
            "unvalidated configs are capped rather than overflowing"
        );

        let day = GateConfig {
            pass_ttl_secs: MAX_PASS_TTL_SECS,
            ..GateConfig::default()
        };
        assert!(day.validate().is_ok());
        assert_eq!(day.pass_ttl(), chrono::Duration::days(1));
    }

    #[test]
    fn test_poll_interval_clamped() {
        let fast = GateConfig {
            poll_interval_ms: 1,
            ..GateConfig::default()
        };
        assert_eq!(fast.poll_interval(), Duration::from_millis(50));

        let slow = GateConfig {
            poll_interval_ms: 10_000,
            ..GateConfig::default()
        };
        assert_eq!(slow.poll_interval(), Duration::from_millis(1_000));
    }
}
