//! Key-value candle table on Redis
//!
//! Items are addressed by partition key `CANDLE#{symbol}#{interval}` and sort
//! key `epoch`. Each partition is a hash `{prefix}{pk}` mapping the bucket
//! label to the JSON item, plus a sorted set `{prefix}{pk}:idx` scoring the
//! label by its epoch for range scans. Re-writing a label overwrites the item.

use super::CandleSink;
use crate::{AggregatedCandle, Timeframe};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

/// Maximum items per pipelined write
pub const TABLE_BATCH_SIZE: usize = 25;

/// Default key prefix for the candle table
pub const DEFAULT_TABLE_KEY_PREFIX: &str = "candle_history:";

/// One stored item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableItem {
    /// Partition key
    pub pk: String,
    /// Sort key, bucket start in epoch seconds
    pub sk: i64,
    /// Bucket start label
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
    /// Symbol
    pub symbol: String,
    /// Interval label
    pub interval: String,
    /// One-minute candles folded in
    pub count: u32,
}

impl TableItem {
    /// Build the item for an aggregated candle
    pub fn new(symbol: &str, timeframe: Timeframe, candle: &AggregatedCandle, offset: FixedOffset) -> Result<Self> {
        Ok(Self {
            pk: partition_key(symbol, timeframe),
            sk: candle.candle.epoch(offset)?,
            time: candle.candle.time.clone(),
            open: candle.candle.open,
            high: candle.candle.high,
            low: candle.candle.low,
            close: candle.candle.close,
            volume: candle.candle.volume,
            symbol: symbol.to_string(),
            interval: timeframe.label().to_string(),
            count: candle.count,
        })
    }
}

/// Partition key for a symbol and interval
#[must_use]
pub fn partition_key(symbol: &str, timeframe: Timeframe) -> String {
    format!("CANDLE#{symbol}#{}", timeframe.label())
}

/// Key-value candle table sink
#[derive(Clone)]
pub struct RedisCandleStore {
    client: redis::aio::ConnectionManager,
    key_prefix: String,
    offset: FixedOffset,
}

impl RedisCandleStore {
    /// Connect to the table's Redis endpoint
    pub async fn connect(url: &str, key_prefix: impl Into<String>, offset: FixedOffset) -> Result<Self> {
        let client = redis::Client::open(url).context("Invalid key-value store URL")?;
        let mut connection = client
            .get_connection_manager()
            .await
            .context("Failed to connect to key-value store")?;
        let _pong: String = redis::cmd("PING").query_async(&mut connection).await?;

        info!("Connected to key-value candle table");
        Ok(Self { client: connection, key_prefix: key_prefix.into(), offset })
    }

    fn hash_key(&self, pk: &str) -> String {
        format!("{}{}", self.key_prefix, pk)
    }

    fn index_key(&self, pk: &str) -> String {
        format!("{}{}:idx", self.key_prefix, pk)
    }

    fn queue_item(&self, pipe: &mut redis::Pipeline, item: &TableItem) -> Result<()> {
        let value = serde_json::to_string(item)?;
        pipe.hset(self.hash_key(&item.pk), &item.time, value)
            .ignore()
            .zadd(self.index_key(&item.pk), &item.time, item.sk)
            .ignore();
        Ok(())
    }
}

#[async_trait]
impl CandleSink for RedisCandleStore {
    fn name(&self) -> &str {
        "kv-table"
    }

    async fn upsert(&self, symbol: &str, timeframe: Timeframe, candle: &AggregatedCandle) -> Result<()> {
        let item = TableItem::new(symbol, timeframe, candle, self.offset)?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        self.queue_item(&mut pipe, &item)?;

        let mut connection = self.client.clone();
        let (): () = pipe.query_async(&mut connection).await?;
        Ok(())
    }

    async fn upsert_batch(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        candles: &[AggregatedCandle],
    ) -> Result<usize> {
        let mut connection = self.client.clone();
        let mut stored = 0;

        for chunk in candles.chunks(TABLE_BATCH_SIZE) {
            let mut pipe = redis::pipe();
            pipe.atomic();
            for candle in chunk {
                let item = TableItem::new(symbol, timeframe, candle, self.offset)?;
                self.queue_item(&mut pipe, &item)?;
            }

            let written: redis::RedisResult<()> = pipe.query_async(&mut connection).await;
            match written {
                Ok(()) => stored += chunk.len(),
                Err(e) => error!(symbol, interval = timeframe.label(), "Table batch write failed: {}", e),
            }
        }

        debug!(symbol, interval = timeframe.label(), stored, "Table batch upserted");
        Ok(stored)
    }
}
