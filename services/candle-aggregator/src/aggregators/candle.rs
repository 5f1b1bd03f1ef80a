//! Candle aggregator implementation

use super::time_label::{align_time, format_time_label, parse_time_label};
use crate::{AggregatedCandle, AggregationError, Candle, Timeframe};
use chrono::NaiveDateTime;
use std::collections::BTreeMap;

/// Per-timeframe aggregation output, keyed by timeframe
pub type AggregatedSeries = BTreeMap<Timeframe, Vec<AggregatedCandle>>;

/// Accumulator for one bucket during a single `aggregate` call
#[derive(Debug, Clone, Copy)]
struct Bucket {
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    count: u32,
}

impl Bucket {
    fn start(candle: &Candle) -> Self {
        Self {
            open: candle.open,
            high: candle.high,
            low: candle.low,
            close: candle.close,
            volume: candle.volume,
            count: 1,
        }
    }

    fn fold(&mut self, candle: &Candle) {
        if candle.high > self.high {
            self.high = candle.high;
        }
        if candle.low < self.low {
            self.low = candle.low;
        }
        self.close = candle.close;
        self.volume += candle.volume;
        self.count += 1;
    }

    fn into_candle(self, symbol: &str, start: NaiveDateTime, timeframe: Timeframe) -> AggregatedCandle {
        AggregatedCandle {
            timeframe,
            candle: Candle {
                symbol: symbol.to_string(),
                time: format_time_label(start),
                open: self.open,
                high: self.high,
                low: self.low,
                close: self.close,
                volume: self.volume,
            },
            count: self.count,
        }
    }
}

/// Rolls one-minute candles of a single symbol up into coarser timeframes
#[derive(Debug, Clone)]
pub struct CandleAggregator {
    timeframes: Vec<Timeframe>,
}

impl Default for CandleAggregator {
    fn default() -> Self {
        Self::new(Timeframe::ALL.to_vec())
    }
}

impl CandleAggregator {
    /// Create a new candle aggregator for the given timeframes
    #[must_use]
    pub fn new(mut timeframes: Vec<Timeframe>) -> Self {
        timeframes.sort_unstable();
        timeframes.dedup();
        Self { timeframes }
    }

    /// Enabled timeframes, shortest first
    #[must_use]
    pub fn timeframes(&self) -> &[Timeframe] {
        &self.timeframes
    }

    /// Aggregate one symbol's one-minute candles into every enabled timeframe
    ///
    /// Input order does not matter: candles are put in chronological order
    /// first, keeping encounter order between equal labels. Every bucket
    /// implied by the input is emitted, including partial ones. "1m" is the
    /// identity frame and comes back with one candle per distinct minute.
    pub fn aggregate(&self, candles: &[Candle]) -> Result<AggregatedSeries, AggregationError> {
        let mut series = AggregatedSeries::new();
        let Some(first) = candles.first() else {
            return Ok(series);
        };
        let symbol = first.symbol.as_str();

        let mut timeline = Vec::with_capacity(candles.len());
        for (index, candle) in candles.iter().enumerate() {
            if candle.symbol != symbol {
                return Err(AggregationError::MixedSymbols {
                    expected: symbol.to_string(),
                    found: candle.symbol.clone(),
                    index,
                });
            }
            let time = parse_time_label(&candle.time).map_err(|e| match e {
                AggregationError::InvalidTimeLabel { label, reason } => {
                    AggregationError::MalformedCandle { symbol: symbol.to_string(), index, label, reason }
                }
                other => other,
            })?;
            timeline.push((time, candle));
        }

        // Stable: equal labels keep encounter order for open/close
        timeline.sort_by_key(|(time, _)| *time);

        for &timeframe in &self.timeframes {
            let mut buckets: BTreeMap<NaiveDateTime, Bucket> = BTreeMap::new();
            for (time, candle) in &timeline {
                buckets
                    .entry(align_time(*time, timeframe))
                    .and_modify(|bucket| bucket.fold(candle))
                    .or_insert_with(|| Bucket::start(candle));
            }

            let aggregated = buckets
                .into_iter()
                .map(|(start, bucket)| bucket.into_candle(symbol, start, timeframe))
                .collect();
            series.insert(timeframe, aggregated);
        }

        Ok(series)
    }
}
