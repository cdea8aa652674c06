use std::fs;
use std::time::Duration;

use anyhow::Context;
use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    #[serde(default)]
    pub ledger: LedgerConfig,
    /// PostgreSQL connection URL; in-memory stores are used when absent
    #[serde(default)]
    pub postgres_url: Option<String>,
    /// JSON-lines audit file; in-memory log when absent
    #[serde(default)]
    pub transaction_log_path: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: "./logs".to_string(),
            log_file: "ledger.log".to_string(),
            use_json: false,
            rotation: "daily".to_string(),
            ledger: LedgerConfig::default(),
            postgres_url: None,
            transaction_log_path: None,
        }
    }
}

/// Ledger engine tuning
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct LedgerConfig {
    /// Fixed UTC offset (minutes) that defines calendar days for daily limits
    pub timezone_offset_minutes: i32,
    pub max_deposit_count: u32,
    pub max_withdrawal_count: u32,
    /// Daily amount caps copied into every new wallet
    pub default_max_deposit: u64,
    pub default_max_withdrawal: u64,
    /// Compare-and-swap attempts before surfacing `Busy`
    pub max_commit_attempts: u32,
    pub retry_base_delay_ms: u64,
    /// An unfinished idempotency claim older than this may be recovered
    pub idempotency_claim_ttl_secs: u64,
    /// Keyed commits remembered on the wallet for claim recovery
    pub idempotency_window: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            timezone_offset_minutes: 0,
            max_deposit_count: 10,
            max_withdrawal_count: 5,
            default_max_deposit: 100_000_000,
            default_max_withdrawal: 50_000_000,
            max_commit_attempts: 5,
            retry_base_delay_ms: 5,
            idempotency_claim_ttl_secs: 30,
            idempotency_window: 128,
        }
    }
}

impl LedgerConfig {
    /// Offset used for day boundaries; out-of-range values fall back to UTC
    pub fn day_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.timezone_offset_minutes.saturating_mul(60))
            .unwrap_or_else(|| {
                tracing::warn!(
                    offset_minutes = self.timezone_offset_minutes,
                    "Invalid timezone offset, using UTC"
                );
                Utc.fix()
            })
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    /// Saturates at chrono's maximum duration
    pub fn claim_ttl(&self) -> chrono::Duration {
        let secs = i64::try_from(self.idempotency_claim_ttl_secs).unwrap_or(i64::MAX);
        chrono::Duration::try_seconds(secs).unwrap_or(chrono::Duration::MAX)
    }
}

impl AppConfig {
    pub fn load(env: &str) -> anyhow::Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        Self::from_yaml(&content).with_context(|| format!("Failed to parse {}", config_path))
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }
}
