//! Cache and storage backends for candle data

pub mod cache;
pub mod memory;
pub mod object;
pub mod postgres;
pub mod record;
pub mod retry;
pub mod table;

use crate::{AggregatedCandle, Candle, Timeframe};
use anyhow::Result;
use async_trait::async_trait;
use tracing::warn;

// Re-export commonly used types
pub use cache::RedisCandleCache;
pub use memory::{MemoryCandleCache, MemoryCandleSink};
pub use object::FileObjectBackup;
pub use postgres::PostgresCandleStore;
pub use record::{CandleRecord, decode_record, encode_record};
pub use retry::RetryPolicy;
pub use table::RedisCandleStore;

/// Closed one-minute candles read from the cache for one symbol
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingBatch {
    /// Candles that decoded cleanly, in cache order
    pub candles: Vec<Candle>,
    /// Number of raw cache entries read, rejected ones included
    pub raw_len: usize,
    /// Number of entries excluded as malformed
    pub rejected: usize,
}

/// Fast ephemeral cache holding closed one-minute candles per symbol
#[async_trait]
pub trait CandleCache: Send + Sync {
    /// Symbols holding at least one closed candle
    async fn list_symbols_with_pending(&self) -> Result<Vec<String>>;

    /// Number of raw entries pending for a symbol
    async fn pending_count(&self, symbol: &str) -> Result<usize>;

    /// Read every pending entry for a symbol
    async fn read_pending(&self, symbol: &str) -> Result<PendingBatch>;

    /// Remove the oldest `count` entries for a symbol
    async fn trim_pending(&self, symbol: &str, count: usize) -> Result<()>;
}

/// Durable store for aggregated candles keyed by `(symbol, interval, time)`
///
/// Writes are upserts: repeating one replaces the stored values.
#[async_trait]
pub trait CandleSink: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &str;

    /// Upsert one candle
    async fn upsert(&self, symbol: &str, timeframe: Timeframe, candle: &AggregatedCandle) -> Result<()>;

    /// Upsert a batch, returning how many candles were stored
    async fn upsert_batch(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        candles: &[AggregatedCandle],
    ) -> Result<usize> {
        let mut stored = 0;
        for candle in candles {
            match self.upsert(symbol, timeframe, candle).await {
                Ok(()) => stored += 1,
                Err(e) => warn!(
                    sink = self.name(),
                    symbol,
                    interval = timeframe.label(),
                    time = %candle.candle.time,
                    "Upsert failed: {e:#}"
                ),
            }
        }
        Ok(stored)
    }
}

/// Result of archiving a raw batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupOutcome {
    /// A new object was written at this key
    Written(String),
    /// An object already exists at this key and was left untouched
    AlreadyPresent(String),
    /// Nothing to archive
    Empty,
}

/// Append-only archive of raw one-minute candles
#[async_trait]
pub trait BackupSink: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &str;

    /// Write an immutable snapshot of a symbol's raw candles
    async fn put_raw(&self, symbol: &str, candles: &[Candle]) -> Result<BackupOutcome>;
}
