//! Candle Aggregator Service
//!
//! Rolls closed one-minute candles held in a fast cache up into coarser
//! timeframes and writes them through to durable storage:
//! - OHLCV roll-ups (1m, 3m, 5m, 15m, 30m, 1h, 4h, 1d, 1w)
//! - Upserts into key-value and relational candle tables
//! - Immutable raw one-minute snapshots in object storage
//! - Cache trimming once a batch has been persisted

pub mod aggregators;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod storage;

use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use aggregators::{CandleAggregator, align_to_timeframe, is_timeframe_boundary};
pub use config::AggregatorConfig;
pub use error::{AggregationError, RecordError};
pub use orchestrator::{OrchestratorSettings, PollingOrchestrator, Shutdown, SymbolPhase, TickReport};
pub use storage::{BackupOutcome, BackupSink, CandleCache, CandleSink, PendingBatch};

/// Timeframe for aggregation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    /// 1 minute bars
    #[serde(rename = "1m")]
    M1,
    /// 3 minute bars
    #[serde(rename = "3m")]
    M3,
    /// 5 minute bars
    #[serde(rename = "5m")]
    M5,
    /// 15 minute bars
    #[serde(rename = "15m")]
    M15,
    /// 30 minute bars
    #[serde(rename = "30m")]
    M30,
    /// 1 hour bars
    #[serde(rename = "1h")]
    H1,
    /// 4 hour bars
    #[serde(rename = "4h")]
    H4,
    /// Daily bars
    #[serde(rename = "1d")]
    D1,
    /// Weekly bars, starting Monday
    #[serde(rename = "1w")]
    W1,
}

impl Timeframe {
    /// Every supported timeframe, shortest first
    pub const ALL: [Self; 9] = [
        Self::M1,
        Self::M3,
        Self::M5,
        Self::M15,
        Self::M30,
        Self::H1,
        Self::H4,
        Self::D1,
        Self::W1,
    ];

    /// Canonical interval label
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M3 => "3m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
            Self::W1 => "1w",
        }
    }

    /// Number of one-minute candles in one bucket
    #[must_use]
    pub const fn duration_minutes(&self) -> u32 {
        match self {
            Self::M1 => 1,
            Self::M3 => 3,
            Self::M5 => 5,
            Self::M15 => 15,
            Self::M30 => 30,
            Self::H1 => 60,
            Self::H4 => 240,
            Self::D1 => 1440,
            Self::W1 => 10080,
        }
    }

    /// Get duration in seconds
    #[must_use]
    pub const fn duration_seconds(&self) -> i64 {
        self.duration_minutes() as i64 * 60
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Timeframe {
    type Err = AggregationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|tf| tf.label() == s.trim())
            .ok_or_else(|| AggregationError::UnknownTimeframe(s.to_string()))
    }
}

/// OHLCV candle for one symbol, labelled by its start minute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Symbol
    pub symbol: String,
    /// Start time as `YYYYMMDDHHmm`
    pub time: String,
    /// Open price
    pub open: f64,
    /// High price
    pub high: f64,
    /// Low price
    pub low: f64,
    /// Close price
    pub close: f64,
    /// Volume
    pub volume: f64,
}

impl Candle {
    /// Start time in seconds since the Unix epoch, reading the label in `offset`
    ///
    /// Only used for storage sort keys.
    pub fn epoch(&self, offset: FixedOffset) -> Result<i64, AggregationError> {
        aggregators::time_label::label_epoch(&self.time, offset)
    }
}

/// Candle produced by the aggregation engine for one bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedCandle {
    /// Timeframe of the bucket
    pub timeframe: Timeframe,
    /// Materialized candle; `time` is the aligned bucket start
    pub candle: Candle,
    /// Number of one-minute candles folded in
    pub count: u32,
}

impl AggregatedCandle {
    /// Bucket is missing constituent minutes and may be overwritten later
    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.count < self.timeframe.duration_minutes()
    }
}
