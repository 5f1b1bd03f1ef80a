//! Error types for the aggregation engine and cache record decoding

use thiserror::Error;

/// Errors raised by the aggregation engine and time label helpers
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AggregationError {
    /// Time label is not a valid `YYYYMMDDHHmm` value
    #[error("Invalid time label {label:?}: {reason}")]
    InvalidTimeLabel {
        /// Offending label
        label: String,
        /// What is wrong with it
        reason: &'static str,
    },

    /// A candle handed to `aggregate` carries an invalid time label
    #[error("Malformed candle #{index} for {symbol}: time label {label:?} {reason}")]
    MalformedCandle {
        /// Symbol of the batch
        symbol: String,
        /// Position of the candle in the input slice
        index: usize,
        /// Offending label
        label: String,
        /// What is wrong with it
        reason: &'static str,
    },

    /// Input batch mixes candles of different symbols
    #[error("Mixed symbols in one batch: expected {expected}, found {found} at #{index}")]
    MixedSymbols {
        /// Symbol of the first candle
        expected: String,
        /// Symbol that does not match
        found: String,
        /// Position of the mismatching candle
        index: usize,
    },

    /// Unknown timeframe label
    #[error("Unknown timeframe: {0}")]
    UnknownTimeframe(String),
}

/// Errors raised while decoding a compact cache record
#[derive(Debug, Error)]
pub enum RecordError {
    /// Record is not valid JSON or has the wrong shape
    #[error("Invalid record JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Time label is missing or invalid
    #[error("Invalid record time: {0}")]
    Time(#[from] AggregationError),

    /// Numeric field could not be parsed
    #[error("Invalid value for field {field}: {value:?}")]
    InvalidNumber {
        /// Field name (`o`, `h`, `l`, `c` or `v`)
        field: &'static str,
        /// Raw value
        value: String,
    },
}
