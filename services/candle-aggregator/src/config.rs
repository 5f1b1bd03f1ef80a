//! Candle aggregator configuration

use crate::Timeframe;
use crate::storage::RetryPolicy;
use crate::storage::cache::DEFAULT_CACHE_KEY_PREFIX;
use crate::storage::postgres::DEFAULT_CANDLE_TABLE;
use crate::storage::table::DEFAULT_TABLE_KEY_PREFIX;
use anyhow::{Result, anyhow, bail};
use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Default idle delay between ticks
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
/// Default raw entry count that triggers backup and trim
pub const DEFAULT_TRIM_THRESHOLD: usize = 60;

/// Candle aggregator configuration
///
/// `Debug` output masks credentials in the store URLs.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Cache host
    pub valkey_host: String,

    /// Cache port
    pub valkey_port: u16,

    /// Connect to the cache over TLS
    pub valkey_tls: bool,

    /// List key prefix for pending one-minute candles
    pub cache_key_prefix: String,

    /// Key-value table endpoint, disabled when unset
    pub kv_store_url: Option<String>,

    /// Key prefix inside the key-value table
    pub kv_key_prefix: String,

    /// Relational store URL, disabled when unset
    pub database_url: Option<String>,

    /// Relational candle table
    pub pg_candle_table: String,

    /// Relational pool size
    pub pg_max_connections: u32,

    /// Object-store backup root, disabled when unset
    pub backup_dir: Option<String>,

    /// Idle delay between ticks in milliseconds
    pub poll_interval_ms: u64,

    /// Raw entries consumed before backup and trim
    pub trim_threshold: usize,

    /// Per-call timeout in milliseconds
    pub call_timeout_ms: u64,

    /// Attempts for idempotent collaborator calls
    pub retry_attempts: u32,

    /// First backoff delay in milliseconds
    pub retry_base_delay_ms: u64,

    /// Enabled timeframe labels
    pub timeframes: Vec<String>,

    /// Offset of the label time zone from UTC in minutes
    pub tz_offset_minutes: i32,

    /// Default log level
    pub log_level: String,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            valkey_host: "localhost".to_string(),
            valkey_port: 6379,
            valkey_tls: false,
            cache_key_prefix: DEFAULT_CACHE_KEY_PREFIX.to_string(),
            kv_store_url: None,
            kv_key_prefix: DEFAULT_TABLE_KEY_PREFIX.to_string(),
            database_url: None,
            pg_candle_table: DEFAULT_CANDLE_TABLE.to_string(),
            pg_max_connections: 5,
            backup_dir: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            trim_threshold: DEFAULT_TRIM_THRESHOLD,
            call_timeout_ms: 5000,
            retry_attempts: 3,
            retry_base_delay_ms: 1000,
            timeframes: Timeframe::ALL.iter().map(|tf| tf.label().to_string()).collect(),
            tz_offset_minutes: 0,
            log_level: "info".to_string(),
        }
    }
}

fn parse_var<T>(name: &str, value: Option<String>, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("Invalid {}: {}", name, e)),
        _ => Ok(default),
    }
}

fn parse_flag(name: &str, value: Option<String>, default: bool) -> Result<bool> {
    match value.as_deref().map(str::trim) {
        None | Some("") => Ok(default),
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => bail!("Invalid {}: expected a boolean, got {:?}", name, raw),
        },
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Mask the userinfo and query of a connection URL
fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return "***".to_string();
    };
    let (rest, query) = match rest.split_once('?') {
        Some((head, _)) => (head, "?***"),
        None => (rest, ""),
    };
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => format!("{scheme}://***@{}{query}", &rest[at + 1..]),
        None => format!("{scheme}://{rest}{query}"),
    }
}

impl fmt::Debug for AggregatorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregatorConfig")
            .field("valkey_host", &self.valkey_host)
            .field("valkey_port", &self.valkey_port)
            .field("valkey_tls", &self.valkey_tls)
            .field("cache_key_prefix", &self.cache_key_prefix)
            .field("kv_store_url", &self.kv_store_url.as_deref().map(redact_url))
            .field("kv_key_prefix", &self.kv_key_prefix)
            .field("database_url", &self.database_url.as_deref().map(redact_url))
            .field("pg_candle_table", &self.pg_candle_table)
            .field("pg_max_connections", &self.pg_max_connections)
            .field("backup_dir", &self.backup_dir)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("trim_threshold", &self.trim_threshold)
            .field("call_timeout_ms", &self.call_timeout_ms)
            .field("retry_attempts", &self.retry_attempts)
            .field("retry_base_delay_ms", &self.retry_base_delay_ms)
            .field("timeframes", &self.timeframes)
            .field("tz_offset_minutes", &self.tz_offset_minutes)
            .field("log_level", &self.log_level)
            .finish()
    }
}

impl AggregatorConfig {
    /// Load and validate from the process environment
    pub fn from_env() -> Result<Self> {
        Self::load(|key| std::env::var(key).ok(), &[])
    }

    /// Load from `lookup` with `overrides` taking precedence, then validate
    ///
    /// Overridden keys are never parsed from `lookup`, so a bad value there
    /// does not block startup when the override replaces it.
    pub fn load(lookup: impl Fn(&str) -> Option<String>, overrides: &[(&str, String)]) -> Result<Self> {
        let config = Self::from_lookup(|key| {
            overrides
                .iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| value.clone())
                .or_else(|| lookup(key))
        })?;
        config.validate()?;
        debug!("Loaded configuration: {:?}", config);
        Ok(config)
    }

    /// Parse from any key lookup, falling back to defaults for unset keys
    ///
    /// Does not validate.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let timeframes = match non_empty(lookup("TIMEFRAMES")) {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|label| !label.is_empty())
                .map(str::to_string)
                .collect(),
            None => defaults.timeframes.clone(),
        };

        let config = Self {
            valkey_host: non_empty(lookup("VALKEY_HOST")).unwrap_or(defaults.valkey_host),
            valkey_port: parse_var("VALKEY_PORT", lookup("VALKEY_PORT"), defaults.valkey_port)?,
            valkey_tls: parse_flag("VALKEY_TLS", lookup("VALKEY_TLS"), defaults.valkey_tls)?,
            cache_key_prefix: non_empty(lookup("CACHE_KEY_PREFIX")).unwrap_or(defaults.cache_key_prefix),
            kv_store_url: non_empty(lookup("KV_STORE_URL")),
            kv_key_prefix: non_empty(lookup("KV_KEY_PREFIX")).unwrap_or(defaults.kv_key_prefix),
            database_url: non_empty(lookup("DATABASE_URL")),
            pg_candle_table: non_empty(lookup("PG_CANDLE_TABLE")).unwrap_or(defaults.pg_candle_table),
            pg_max_connections: parse_var(
                "PG_MAX_CONNECTIONS",
                lookup("PG_MAX_CONNECTIONS"),
                defaults.pg_max_connections,
            )?,
            backup_dir: non_empty(lookup("BACKUP_DIR")),
            poll_interval_ms: parse_var(
                "POLL_INTERVAL_MS",
                lookup("POLL_INTERVAL_MS"),
                defaults.poll_interval_ms,
            )?,
            trim_threshold: parse_var("TRIM_THRESHOLD", lookup("TRIM_THRESHOLD"), defaults.trim_threshold)?,
            call_timeout_ms: parse_var("CALL_TIMEOUT_MS", lookup("CALL_TIMEOUT_MS"), defaults.call_timeout_ms)?,
            retry_attempts: parse_var("RETRY_ATTEMPTS", lookup("RETRY_ATTEMPTS"), defaults.retry_attempts)?,
            retry_base_delay_ms: parse_var(
                "RETRY_BASE_DELAY_MS",
                lookup("RETRY_BASE_DELAY_MS"),
                defaults.retry_base_delay_ms,
            )?,
            timeframes,
            tz_offset_minutes: parse_var(
                "TZ_OFFSET_MINUTES",
                lookup("TZ_OFFSET_MINUTES"),
                defaults.tz_offset_minutes,
            )?,
            log_level: non_empty(lookup("LOG_LEVEL")).unwrap_or(defaults.log_level),
        };

        Ok(config)
    }

    /// Reject configurations the service cannot start with
    pub fn validate(&self) -> Result<()> {
        if self.kv_store_url.is_none() && self.database_url.is_none() {
            bail!("No candle sink configured: set KV_STORE_URL and/or DATABASE_URL");
        }
        if self.trim_threshold == 0 {
            bail!("TRIM_THRESHOLD must be at least 1");
        }
        if self.poll_interval_ms == 0 {
            bail!("POLL_INTERVAL_MS must be at least 1");
        }
        if self.call_timeout_ms == 0 {
            bail!("CALL_TIMEOUT_MS must be at least 1");
        }
        if self.retry_attempts == 0 {
            bail!("RETRY_ATTEMPTS must be at least 1");
        }
        if self.pg_max_connections == 0 {
            bail!("PG_MAX_CONNECTIONS must be at least 1");
        }
        self.enabled_timeframes()?;
        self.time_zone()?;
        Ok(())
    }

    /// Parsed, deduplicated timeframes, shortest first
    pub fn enabled_timeframes(&self) -> Result<Vec<Timeframe>> {
        let mut timeframes = self
            .timeframes
            .iter()
            .map(|label| label.parse::<Timeframe>())
            .collect::<Result<Vec<_>, _>>()?;
        timeframes.sort_unstable();
        timeframes.dedup();
        if timeframes.is_empty() {
            bail!("TIMEFRAMES must name at least one timeframe");
        }
        Ok(timeframes)
    }

    /// Fixed offset the labels are written in
    pub fn time_zone(&self) -> Result<FixedOffset> {
        self.tz_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| anyhow!("Invalid TZ_OFFSET_MINUTES: {}", self.tz_offset_minutes))
    }

    /// Cache connection URL
    #[must_use]
    pub fn cache_url(&self) -> String {
        let scheme = if self.valkey_tls { "rediss" } else { "redis" };
        format!("{}://{}:{}", scheme, self.valkey_host, self.valkey_port)
    }

    /// Idle delay between ticks
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Per-call timeout
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Timeout and backoff for collaborator calls
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            call_timeout: self.call_timeout(),
        }
    }
}
