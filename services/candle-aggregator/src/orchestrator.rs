//! Polling loop driving the cache -> aggregate -> persist -> trim cycle
//!
//! One worker, one tick at a time. Symbols in a tick are handled in order and
//! a failing symbol never stops the others.

use crate::aggregators::{CandleAggregator, is_bucket_closed};
use crate::config::{AggregatorConfig, DEFAULT_POLL_INTERVAL_MS, DEFAULT_TRIM_THRESHOLD};
use crate::storage::{BackupOutcome, BackupSink, CandleCache, CandleSink, RetryPolicy};
use crate::{AggregatedCandle, Timeframe};
use anyhow::{Result, bail};
use chrono::{FixedOffset, Offset, Utc};
use futures::future::join_all;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tracing::{debug, error, info, warn};

/// Where a symbol is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SymbolPhase {
    /// Nothing in flight
    #[default]
    Idle,
    /// New pending candles detected
    HasPending,
    /// Rolling up the fetched batch
    Aggregating,
    /// Writing to the sinks
    Persisting,
    /// Archiving and trimming the cache
    Trimming,
}

#[derive(Debug, Clone, Copy, Default)]
struct SymbolState {
    phase: SymbolPhase,
    /// Raw entries consumed by the last successful cycle without a trim
    last_pending: usize,
}

enum SymbolOutcome {
    Drained,
    Unchanged,
    Processed { written: usize, provisional: usize, trimmed: bool },
}

/// Summary of one tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Symbols listed by the cache
    pub symbols_seen: usize,
    /// Symbols aggregated and persisted
    pub processed: usize,
    /// Symbols skipped because their pending count did not change
    pub skipped_unchanged: usize,
    /// Symbols with nothing pending
    pub drained: usize,
    /// Symbols whose cycle failed
    pub failed: usize,
    /// Symbols trimmed from the cache
    pub trimmed: usize,
    /// Aggregated candles written to every sink
    pub candles_written: usize,
    /// Written candles whose bucket has not elapsed yet
    pub provisional_buckets: usize,
    /// Symbol discovery failed, nothing else was attempted
    pub discovery_failed: bool,
    /// Shutdown was observed before every symbol was visited
    pub interrupted: bool,
}

impl TickReport {
    fn is_quiet(&self) -> bool {
        self.processed == 0 && self.failed == 0 && self.trimmed == 0 && !self.discovery_failed
    }
}

/// Cooperative shutdown flag fed by a broadcast channel
#[derive(Debug)]
pub struct Shutdown {
    receiver: broadcast::Receiver<()>,
    requested: bool,
}

impl Shutdown {
    /// Wrap a receiver; a message or a closed channel means stop
    pub fn new(receiver: broadcast::Receiver<()>) -> Self {
        Self { receiver, requested: false }
    }

    /// Check without waiting
    pub fn is_requested(&mut self) -> bool {
        if !self.requested {
            self.requested = !matches!(self.receiver.try_recv(), Err(TryRecvError::Empty));
        }
        self.requested
    }

    /// Wait until shutdown is requested
    pub async fn recv(&mut self) {
        if !self.requested {
            let _ = self.receiver.recv().await;
            self.requested = true;
        }
    }
}

/// Loop tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorSettings {
    /// Idle delay between ticks
    pub poll_interval: Duration,
    /// Raw entries consumed before backup and trim
    pub trim_threshold: usize,
    /// Timeout and backoff for collaborator calls
    pub retry: RetryPolicy,
    /// Time zone the labels are written in
    pub offset: FixedOffset,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            trim_threshold: DEFAULT_TRIM_THRESHOLD,
            retry: RetryPolicy::default(),
            offset: Utc.fix(),
        }
    }
}

impl OrchestratorSettings {
    /// Settings from a validated configuration
    pub fn from_config(config: &AggregatorConfig) -> Result<Self> {
        Ok(Self {
            poll_interval: config.poll_interval(),
            trim_threshold: config.trim_threshold,
            retry: config.retry_policy(),
            offset: config.time_zone()?,
        })
    }
}

/// Cache poller feeding the aggregation engine and the sinks
pub struct PollingOrchestrator {
    cache: Arc<dyn CandleCache>,
    sinks: Vec<Arc<dyn CandleSink>>,
    backup: Option<Arc<dyn BackupSink>>,
    aggregator: CandleAggregator,
    settings: OrchestratorSettings,
    symbols: FxHashMap<String, SymbolState>,
}

impl PollingOrchestrator {
    /// Create an orchestrator with no tracked state
    ///
    /// At least one sink is required, otherwise trimming would discard
    /// candles that were never persisted.
    pub fn new(
        cache: Arc<dyn CandleCache>,
        sinks: Vec<Arc<dyn CandleSink>>,
        aggregator: CandleAggregator,
        settings: OrchestratorSettings,
    ) -> Result<Self> {
        if sinks.is_empty() {
            bail!("No candle sink configured");
        }
        Ok(Self { cache, sinks, backup: None, aggregator, settings, symbols: FxHashMap::default() })
    }

    /// Archive raw batches before they are trimmed
    #[must_use]
    pub fn with_backup(mut self, backup: Arc<dyn BackupSink>) -> Self {
        self.backup = Some(backup);
        self
    }

    /// Loop settings
    #[must_use]
    pub const fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Pending count remembered for `symbol`, if tracked
    #[must_use]
    pub fn tracked_pending(&self, symbol: &str) -> Option<usize> {
        self.symbols.get(symbol).map(|state| state.last_pending)
    }

    /// Current phase of `symbol`
    #[must_use]
    pub fn phase(&self, symbol: &str) -> SymbolPhase {
        self.symbols.get(symbol).map(|state| state.phase).unwrap_or_default()
    }

    /// Run ticks until shutdown is requested
    pub async fn run(&mut self, mut shutdown: Shutdown) -> Result<()> {
        info!(
            sinks = self.sinks.len(),
            backup = self.backup.is_some(),
            timeframes = ?self.aggregator.timeframes(),
            "Polling orchestrator started, tick every {:?}",
            self.settings.poll_interval
        );

        while !shutdown.is_requested() {
            let report = self.tick(&mut shutdown).await;
            log_report(&report);

            tokio::select! {
                () = shutdown.recv() => {}
                () = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }

        info!("Polling orchestrator stopped");
        Ok(())
    }

    /// Run exactly one tick
    pub async fn run_once(&mut self) -> TickReport {
        let (_keep_open, receiver) = broadcast::channel(1);
        let mut shutdown = Shutdown::new(receiver);
        let report = self.tick(&mut shutdown).await;
        log_report(&report);
        report
    }

    /// Visit every symbol with pending candles once
    pub async fn tick(&mut self, shutdown: &mut Shutdown) -> TickReport {
        let mut report = TickReport::default();
        let retry = self.settings.retry;
        let cache = Arc::clone(&self.cache);

        let symbols = match retry.run("list_symbols_with_pending", || cache.list_symbols_with_pending()).await {
            Ok(symbols) => symbols,
            Err(e) => {
                error!("Symbol discovery failed: {e:#}");
                report.discovery_failed = true;
                return report;
            }
        };
        report.symbols_seen = symbols.len();

        let listed: FxHashSet<&str> = symbols.iter().map(String::as_str).collect();
        self.symbols.retain(|symbol, _| listed.contains(symbol.as_str()));

        for symbol in &symbols {
            if shutdown.is_requested() {
                info!("Shutdown requested, ending tick early");
                report.interrupted = true;
                break;
            }

            match self.process_symbol(symbol).await {
                Ok(SymbolOutcome::Drained) => report.drained += 1,
                Ok(SymbolOutcome::Unchanged) => report.skipped_unchanged += 1,
                Ok(SymbolOutcome::Processed { written, provisional, trimmed }) => {
                    report.processed += 1;
                    report.candles_written += written;
                    report.provisional_buckets += provisional;
                    if trimmed {
                        report.trimmed += 1;
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    error!(symbol = %symbol, "Symbol cycle failed: {e:#}");
                    if let Some(state) = self.symbols.get_mut(symbol) {
                        state.phase = SymbolPhase::Idle;
                    }
                }
            }
        }

        report
    }

    fn set_phase(&mut self, symbol: &str, phase: SymbolPhase) {
        self.symbols.entry(symbol.to_string()).or_default().phase = phase;
    }

    async fn process_symbol(&mut self, symbol: &str) -> Result<SymbolOutcome> {
        let retry = self.settings.retry;
        let cache = Arc::clone(&self.cache);

        let pending = retry.run("pending_count", || cache.pending_count(symbol)).await?;
        if pending == 0 {
            self.symbols.remove(symbol);
            return Ok(SymbolOutcome::Drained);
        }
        if self.tracked_pending(symbol) == Some(pending) {
            debug!(symbol, pending, "Pending count unchanged, skipping");
            return Ok(SymbolOutcome::Unchanged);
        }

        self.set_phase(symbol, SymbolPhase::HasPending);
        let batch = retry.run("read_pending", || cache.read_pending(symbol)).await?;
        if batch.rejected > 0 {
            warn!(symbol, rejected = batch.rejected, read = batch.raw_len, "Excluded malformed candles");
        }

        self.set_phase(symbol, SymbolPhase::Aggregating);
        let series = self.aggregator.aggregate(&batch.candles)?;

        self.set_phase(symbol, SymbolPhase::Persisting);
        let now = Utc::now();
        let mut written = 0;
        let mut provisional = 0;
        for (timeframe, candles) in &series {
            if candles.is_empty() {
                continue;
            }
            written += self.persist(symbol, *timeframe, candles).await?;
            for candle in candles {
                if !is_bucket_closed(&candle.candle.time, *timeframe, self.settings.offset, now)? {
                    provisional += 1;
                }
            }
        }

        let trimmed = batch.raw_len >= self.settings.trim_threshold;
        if trimmed {
            self.set_phase(symbol, SymbolPhase::Trimming);
            if let Some(backup) = &self.backup {
                match retry.run("put_raw", || backup.put_raw(symbol, &batch.candles)).await? {
                    BackupOutcome::Written(key) => info!(symbol, key = %key, "Raw candles archived"),
                    BackupOutcome::AlreadyPresent(key) => {
                        debug!(symbol, key = %key, "Raw candles already archived");
                    }
                    BackupOutcome::Empty => debug!(symbol, "No valid candles to archive"),
                }
            }
            // Not retried: repeating a trim would drop unread entries
            retry
                .timed("trim_pending", cache.trim_pending(symbol, batch.raw_len))
                .await?;
            info!(symbol, count = batch.raw_len, "Trimmed consumed candles");
        }

        let state = self.symbols.entry(symbol.to_string()).or_default();
        state.phase = SymbolPhase::Idle;
        state.last_pending = if trimmed { 0 } else { batch.raw_len };

        debug!(symbol, read = batch.raw_len, written, provisional, trimmed, "Symbol cycle complete");
        Ok(SymbolOutcome::Processed { written, provisional, trimmed })
    }

    /// Upsert one timeframe to every sink concurrently
    async fn persist(&self, symbol: &str, timeframe: Timeframe, candles: &[AggregatedCandle]) -> Result<usize> {
        let retry = self.settings.retry;
        let writes = self.sinks.iter().map(|sink| async move {
            let stored = retry.run("upsert_batch", || sink.upsert_batch(symbol, timeframe, candles)).await;
            (sink.name(), stored)
        });

        let mut failures = Vec::new();
        for (name, stored) in join_all(writes).await {
            match stored {
                Ok(stored) if stored == candles.len() => {}
                Ok(stored) => failures.push(format!("{name} stored {stored} of {}", candles.len())),
                Err(e) => failures.push(format!("{name}: {e:#}")),
            }
        }
        if !failures.is_empty() {
            bail!("Persisting {} {} failed: {}", symbol, timeframe, failures.join("; "));
        }

        debug!(symbol, interval = timeframe.label(), count = candles.len(), "Persisted");
        Ok(candles.len())
    }
}

fn log_report(report: &TickReport) {
    if report.is_quiet() {
        debug!(?report, "Tick complete");
    } else {
        info!(
            seen = report.symbols_seen,
            processed = report.processed,
            skipped = report.skipped_unchanged,
            failed = report.failed,
            trimmed = report.trimmed,
            written = report.candles_written,
            provisional = report.provisional_buckets,
            "Tick complete"
        );
    }
}
