//! Redis/Valkey cache of closed one-minute candles
//!
//! Upstream appends each closed candle as a compact JSON record to the list
//! `{prefix}{symbol}` (by default `candle:closed:1m:{symbol}`), oldest first.

use super::{CandleCache, PendingBatch, decode_record};
use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::{debug, info, warn};

/// Default list key prefix for closed one-minute candles
pub const DEFAULT_CACHE_KEY_PREFIX: &str = "candle:closed:1m:";

/// Cache reader/writer backed by Redis lists
#[derive(Clone)]
pub struct RedisCandleCache {
    client: redis::aio::ConnectionManager,
    key_prefix: String,
}

impl RedisCandleCache {
    /// Connect and verify the server answers `PING`
    pub async fn connect(url: &str, key_prefix: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url).context("Invalid cache URL")?;
        let mut connection = client
            .get_connection_manager()
            .await
            .context("Failed to connect to cache")?;
        let pong: String = redis::cmd("PING").query_async(&mut connection).await?;
        debug!("Cache answered {}", pong);

        let key_prefix = key_prefix.into();
        info!("Connected to cache, watching {}*", key_prefix);
        Ok(Self { client: connection, key_prefix })
    }

    fn key(&self, symbol: &str) -> String {
        format!("{}{}", self.key_prefix, symbol)
    }
}

/// Symbol encoded in a pending-list key, if it carries the prefix
pub fn symbol_from_key<'a>(key: &'a str, prefix: &str) -> Option<&'a str> {
    key.strip_prefix(prefix).filter(|symbol| !symbol.is_empty())
}

/// Decode raw list entries, excluding and reporting malformed ones
pub fn decode_batch(symbol: &str, raw: &[String]) -> PendingBatch {
    let mut batch = PendingBatch { candles: Vec::with_capacity(raw.len()), raw_len: raw.len(), rejected: 0 };
    for (index, entry) in raw.iter().enumerate() {
        match decode_record(symbol, entry) {
            Ok(candle) => batch.candles.push(candle),
            Err(e) => {
                batch.rejected += 1;
                warn!(symbol, index, "Skipping malformed candle record: {}", e);
            }
        }
    }
    batch
}

#[async_trait]
impl CandleCache for RedisCandleCache {
    async fn list_symbols_with_pending(&self) -> Result<Vec<String>> {
        let mut connection = self.client.clone();
        let keys: Vec<String> = connection.keys(format!("{}*", self.key_prefix)).await?;

        let mut symbols: Vec<String> = keys
            .iter()
            .filter_map(|key| symbol_from_key(key, &self.key_prefix))
            .map(str::to_string)
            .collect();
        symbols.sort_unstable();
        symbols.dedup();
        Ok(symbols)
    }

    async fn pending_count(&self, symbol: &str) -> Result<usize> {
        let mut connection = self.client.clone();
        let len: usize = connection.llen(self.key(symbol)).await?;
        Ok(len)
    }

    async fn read_pending(&self, symbol: &str) -> Result<PendingBatch> {
        let mut connection = self.client.clone();
        let raw: Vec<String> = connection.lrange(self.key(symbol), 0, -1).await?;
        Ok(decode_batch(symbol, &raw))
    }

    async fn trim_pending(&self, symbol: &str, count: usize) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let start = isize::try_from(count).context("Trim count out of range")?;
        let mut connection = self.client.clone();
        // Keeps entries appended after the batch was read
        let (): () = connection.ltrim(self.key(symbol), start, -1).await?;
        debug!(symbol, count, "Trimmed consumed candles from cache");
        Ok(())
    }
}
