//! In-process cache and sink test fixtures
//!
//! Not wired into the binary. Both support failure injection so tests can
//! exercise error isolation without a live backend.

use super::{CandleCache, CandleSink, PendingBatch, encode_record};
use super::cache::decode_batch;
use crate::{AggregatedCandle, Candle, Timeframe};
use anyhow::{Result, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// In-memory cache of raw one-minute records per symbol
#[derive(Debug, Default)]
pub struct MemoryCandleCache {
    lists: Mutex<BTreeMap<String, Vec<String>>>,
    reads: Mutex<FxHashMap<String, usize>>,
    failing: Mutex<FxHashSet<String>>,
}

impl MemoryCandleCache {
    /// Create an empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a raw record for `symbol`
    pub fn push_raw(&self, symbol: &str, raw: impl Into<String>) {
        self.lists.lock().entry(symbol.to_string()).or_default().push(raw.into());
    }

    /// Append a candle in the compact record shape
    pub fn push_candle(&self, candle: &Candle) -> Result<()> {
        let raw = serde_json::to_string(&encode_record(candle))?;
        self.push_raw(&candle.symbol, raw);
        Ok(())
    }

    /// Raw records still pending for `symbol`
    #[must_use]
    pub fn pending(&self, symbol: &str) -> Vec<String> {
        self.lists.lock().get(symbol).cloned().unwrap_or_default()
    }

    /// How many times the pending list of `symbol` was read
    #[must_use]
    pub fn read_count(&self, symbol: &str) -> usize {
        self.reads.lock().get(symbol).copied().unwrap_or(0)
    }

    /// Make every call for `symbol` fail
    pub fn set_failing(&self, symbol: &str, failing: bool) {
        let mut set = self.failing.lock();
        if failing {
            set.insert(symbol.to_string());
        } else {
            set.remove(symbol);
        }
    }

    fn check(&self, symbol: &str) -> Result<()> {
        if self.failing.lock().contains(symbol) {
            bail!("cache unavailable for {symbol}");
        }
        Ok(())
    }
}

#[async_trait]
impl CandleCache for MemoryCandleCache {
    async fn list_symbols_with_pending(&self) -> Result<Vec<String>> {
        Ok(self
            .lists
            .lock()
            .iter()
            .filter(|(_, list)| !list.is_empty())
            .map(|(symbol, _)| symbol.clone())
            .collect())
    }

    async fn pending_count(&self, symbol: &str) -> Result<usize> {
        self.check(symbol)?;
        Ok(self.lists.lock().get(symbol).map_or(0, Vec::len))
    }

    async fn read_pending(&self, symbol: &str) -> Result<PendingBatch> {
        self.check(symbol)?;
        *self.reads.lock().entry(symbol.to_string()).or_insert(0) += 1;
        let raw = self.pending(symbol);
        Ok(decode_batch(symbol, &raw))
    }

    async fn trim_pending(&self, symbol: &str, count: usize) -> Result<()> {
        self.check(symbol)?;
        let mut lists = self.lists.lock();
        if let Some(list) = lists.get_mut(symbol) {
            let count = count.min(list.len());
            list.drain(..count);
            if list.is_empty() {
                lists.remove(symbol);
            }
        }
        Ok(())
    }
}

type RowKey = (String, Timeframe, String);

/// In-memory candle table keyed by `(symbol, interval, time)`
#[derive(Debug)]
pub struct MemoryCandleSink {
    name: String,
    rows: Mutex<BTreeMap<RowKey, AggregatedCandle>>,
    writes: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryCandleSink {
    /// Create an empty sink
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: Mutex::new(BTreeMap::new()),
            writes: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        }
    }

    /// Stored candle for a key
    #[must_use]
    pub fn get(&self, symbol: &str, timeframe: Timeframe, time: &str) -> Option<AggregatedCandle> {
        self.rows
            .lock()
            .get(&(symbol.to_string(), timeframe, time.to_string()))
            .cloned()
    }

    /// Stored candles for a symbol and timeframe, oldest first
    #[must_use]
    pub fn series(&self, symbol: &str, timeframe: Timeframe) -> Vec<AggregatedCandle> {
        self.rows
            .lock()
            .iter()
            .filter(|((s, tf, _), _)| s == symbol && *tf == timeframe)
            .map(|(_, candle)| candle.clone())
            .collect()
    }

    /// Number of distinct rows
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    /// No rows stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }

    /// Number of successful upserts, repeats included
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// Make every upsert fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }
}

#[async_trait]
impl CandleSink for MemoryCandleSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn upsert(&self, symbol: &str, timeframe: Timeframe, candle: &AggregatedCandle) -> Result<()> {
        if self.failing.load(Ordering::Relaxed) {
            bail!("{} rejected write", self.name);
        }
        self.rows
            .lock()
            .insert((symbol.to_string(), timeframe, candle.candle.time.clone()), candle.clone());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
