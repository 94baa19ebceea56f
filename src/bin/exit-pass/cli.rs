//! Command-line interface definition.

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use exit_pass::record::{Amount, LineItem};
use exit_pass::GateConfig;
use std::path::PathBuf;
use std::str::FromStr;

/// Self-checkout exit passes: checkout, pass issue and gate verification.
#[derive(Parser, Debug)]
#[command(name = "exit-pass")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Directory holding the file-backed ledger.
    #[arg(long, env = "EXIT_PASS_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Store name embedded in pickup passes.
    #[arg(long, env = "EXIT_PASS_STORE_NAME")]
    pub store_name: Option<String>,

    /// Hex-encoded shared signing secret.
    #[arg(long, env = "EXIT_PASS_SIGNING_SECRET", hide_env_values = true)]
    pub signing_secret: Option<String>,

    /// Exit pass time to live in seconds.
    #[arg(long, env = "EXIT_PASS_PASS_TTL_SECS")]
    pub pass_ttl_secs: Option<u64>,

    /// Risk scores strictly above this value force a manual check.
    #[arg(long, env = "EXIT_PASS_FLAG_THRESHOLD")]
    pub flag_threshold: Option<u8>,

    /// Polling notification interval in milliseconds.
    #[arg(long, env = "EXIT_PASS_POLL_INTERVAL_MS")]
    pub poll_interval_ms: Option<u64>,

    /// Log level.
    #[arg(long, env = "RUST_LOG")]
    pub log_level: Option<String>,

    /// Log output format.
    #[arg(long, value_enum, default_value = "text", env = "EXIT_PASS_LOG_FORMAT")]
    pub log_format: CliLogFormat,

    /// Path to configuration file.
    #[arg(long, short, env = "EXIT_PASS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Command to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Log format CLI enum.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CliLogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per line.
    Json,
}

/// Subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Pay for a cart in one go and print the exit pass.
    Checkout {
        /// Paying customer.
        #[arg(long)]
        owner: String,
        /// Line item as `SKU:NAME:PRICE[:QTY]` (price in minor units).
        #[arg(long = "item", required = true)]
        items: Vec<ItemArg>,
        /// Pre-order for pickup instead of walking out.
        #[arg(long)]
        pickup: bool,
        /// Seconds the shopper spent before paying (at most one day).
        #[arg(long, default_value = "300", value_parser = clap::value_parser!(u64).range(..=86_400))]
        session_secs: u64,
    },

    /// Manage the cart in progress.
    Session {
        /// Session action.
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Issue a fresh exit pass for an unredeemed transaction.
    Refresh {
        /// Transaction id.
        transaction_id: String,
    },

    /// Print the pickup pass for a pre-order.
    PickupPass {
        /// Transaction id.
        transaction_id: String,
    },

    /// Check a pass offline (signature and expiry only).
    Verify {
        /// Scanned pass.
        pass: String,
    },

    /// Scan a credential at the gate and optionally act on the decision.
    Scan {
        /// Exit pass, pickup pass, or pickup code.
        input: String,
        /// Staff member operating the terminal.
        #[arg(long, default_value = "staff")]
        staff: String,
        /// Release the customer if the scan produced a decision.
        #[arg(long, conflicts_with = "audit")]
        release: bool,
        /// Send the customer for a full audit with these notes.
        #[arg(long)]
        audit: Option<String>,
    },

    /// List the most recent transactions.
    List {
        /// Maximum number of rows.
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Wait for the gate outcome of a transaction.
    Watch {
        /// Transaction id.
        transaction_id: String,
        /// Use ledger subscriptions instead of polling.
        #[arg(long)]
        push: bool,
    },

    /// Write the effective configuration to a TOML file.
    InitConfig {
        /// Destination path.
        path: PathBuf,
    },
}

/// Cart session subcommands.
#[derive(Subcommand, Debug)]
pub enum SessionAction {
    /// Start a new cart, replacing any saved one.
    Start {
        /// Shopper.
        #[arg(long)]
        owner: String,
    },
    /// Add items to the saved cart.
    Add {
        /// Line item as `SKU:NAME:PRICE[:QTY]`.
        #[arg(long = "item", required = true)]
        items: Vec<ItemArg>,
    },
    /// Print the saved cart.
    Show,
    /// Pay for the saved cart.
    Pay {
        /// Pre-order for pickup instead of walking out.
        #[arg(long)]
        pickup: bool,
    },
    /// Discard the saved cart.
    Clear,
}

/// Line item parsed from `SKU:NAME:PRICE[:QTY]`.
#[derive(Debug, Clone)]
pub struct ItemArg(pub LineItem);

impl FromStr for ItemArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let (sku, name, price, quantity) = match parts.as_slice() {
            [sku, name, price] => (*sku, *name, *price, "1"),
            [sku, name, price, quantity] => (*sku, *name, *price, *quantity),
            _ => return Err(format!("expected SKU:NAME:PRICE[:QTY], got '{s}'")),
        };
        if sku.is_empty() || name.is_empty() {
            return Err("SKU and NAME must not be empty".to_string());
        }
        let price: Amount = price
            .parse()
            .map_err(|e| format!("invalid price '{price}': {e}"))?;
        let quantity: u32 = quantity
            .parse()
            .map_err(|e| format!("invalid quantity '{quantity}': {e}"))?;
        if quantity == 0 {
            return Err("quantity must be at least 1".to_string());
        }
        Ok(Self(LineItem::new(sku, name, price, quantity)))
    }
}

impl Cli {
    /// Convert CLI arguments into a `GateConfig`.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file is specified but cannot be loaded.
    pub fn to_config(&self) -> color_eyre::Result<GateConfig> {
        // Start with default config or load from file
        let mut config = if let Some(ref path) = self.config {
            GateConfig::from_file(path)?
        } else {
            GateConfig::default()
        };

        // Override with CLI arguments
        if let Some(ref data_dir) = self.data_dir {
            config.data_dir.clone_from(data_dir);
        }
        if let Some(ref store_name) = self.store_name {
            config.store_name.clone_from(store_name);
        }
        if self.signing_secret.is_some() {
            config.signing_secret.clone_from(&self.signing_secret);
        }
        if let Some(ttl) = self.pass_ttl_secs {
            config.pass_ttl_secs = ttl;
        }
        if let Some(threshold) = self.flag_threshold {
            config.flag_threshold = threshold;
        }
        if let Some(interval) = self.poll_interval_ms {
            config.poll_interval_ms = interval;
        }
        if let Some(ref level) = self.log_level {
            config.log_level.clone_from(level);
        }

        config.validate()?;
        Ok(config)
    }
}

/// Start of a shopping session that lasted `secs` seconds up to `now`.
///
/// Returns `None` if the offset does not fit the calendar.
pub fn session_start(now: DateTime<Utc>, secs: u64) -> Option<DateTime<Utc>> {
    let secs = i64::try_from(secs).ok()?;
    now.checked_sub_signed(chrono::Duration::try_seconds(secs)?)
}
