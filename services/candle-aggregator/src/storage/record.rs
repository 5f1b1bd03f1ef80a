//! Compact `{t,o,h,l,c,v}` candle records as stored in the cache
//!
//! Producers write prices either as decimal strings or as JSON numbers.

use crate::aggregators::parse_time_label;
use crate::{Candle, RecordError};
use serde::{Deserialize, Serialize};

/// Numeric field that may arrive as a string or a number
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordValue {
    /// JSON number
    Number(f64),
    /// Decimal string
    Text(String),
}

impl RecordValue {
    fn parse(&self, field: &'static str) -> Result<f64, RecordError> {
        match self {
            Self::Number(value) => Ok(*value),
            Self::Text(text) => text.trim().parse::<f64>().map_err(|_| RecordError::InvalidNumber {
                field,
                value: text.clone(),
            }),
        }
    }
}

/// Wire shape of one closed one-minute candle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleRecord {
    /// Start time `YYYYMMDDHHmm`
    pub t: String,
    /// Open
    pub o: RecordValue,
    /// High
    pub h: RecordValue,
    /// Low
    pub l: RecordValue,
    /// Close
    pub c: RecordValue,
    /// Volume, treated as zero when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<RecordValue>,
}

impl CandleRecord {
    /// Convert into a candle for `symbol`, validating the time label
    pub fn into_candle(self, symbol: &str) -> Result<Candle, RecordError> {
        parse_time_label(&self.t)?;
        let volume = match &self.v {
            Some(v) => v.parse("v")?,
            None => 0.0,
        };
        Ok(Candle {
            symbol: symbol.to_string(),
            open: self.o.parse("o")?,
            high: self.h.parse("h")?,
            low: self.l.parse("l")?,
            close: self.c.parse("c")?,
            volume,
            time: self.t,
        })
    }
}

/// Decode one raw cache entry
pub fn decode_record(symbol: &str, raw: &str) -> Result<Candle, RecordError> {
    let record: CandleRecord = serde_json::from_str(raw)?;
    record.into_candle(symbol)
}

/// Encode a candle in the compact record shape, values as decimal strings
#[must_use]
pub fn encode_record(candle: &Candle) -> CandleRecord {
    CandleRecord {
        t: candle.time.clone(),
        o: RecordValue::Text(candle.open.to_string()),
        h: RecordValue::Text(candle.high.to_string()),
        l: RecordValue::Text(candle.low.to_string()),
        c: RecordValue::Text(candle.close.to_string()),
        v: Some(RecordValue::Text(candle.volume.to_string())),
    }
}
