//! End-to-end polling cycles against in-memory collaborators

use anyhow::Result;
use async_trait::async_trait;
use candle_aggregator::aggregators::format_time_label;
use candle_aggregator::storage::{
    FileObjectBackup, MemoryCandleCache, MemoryCandleSink, RetryPolicy, encode_record,
};
use candle_aggregator::{
    BackupSink, Candle, CandleAggregator, CandleCache, CandleSink, OrchestratorSettings, PendingBatch,
    PollingOrchestrator, Shutdown, SymbolPhase, Timeframe,
};
use chrono::{FixedOffset, Utc};
use parking_lot::Mutex;
use rstest::*;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

fn fast_settings(trim_threshold: usize) -> OrchestratorSettings {
    OrchestratorSettings {
        poll_interval: Duration::from_millis(5),
        trim_threshold,
        retry: RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            call_timeout: Duration::from_millis(500),
        },
        offset: FixedOffset::east_opt(0).unwrap(),
    }
}

fn minute(symbol: &str, index: u32) -> Candle {
    let price = 100.0 + f64::from(index);
    Candle {
        symbol: symbol.to_string(),
        time: format!("20250602{:02}{:02}", 9 + index / 60, index % 60),
        open: price,
        high: price + 1.0,
        low: price - 1.0,
        close: price + 0.5,
        volume: 10.0,
    }
}

fn fill(cache: &MemoryCandleCache, symbol: &str, range: std::ops::Range<u32>) {
    for index in range {
        cache.push_candle(&minute(symbol, index)).unwrap();
    }
}

struct Harness {
    cache: Arc<MemoryCandleCache>,
    primary: Arc<MemoryCandleSink>,
    secondary: Arc<MemoryCandleSink>,
}

impl Harness {
    fn orchestrator(&self, timeframes: Vec<Timeframe>, trim_threshold: usize) -> PollingOrchestrator {
        PollingOrchestrator::new(
            self.cache.clone(),
            vec![
                self.primary.clone() as Arc<dyn CandleSink>,
                self.secondary.clone() as Arc<dyn CandleSink>,
            ],
            CandleAggregator::new(timeframes),
            fast_settings(trim_threshold),
        )
        .unwrap()
    }
}

#[fixture]
fn harness() -> Harness {
    Harness {
        cache: Arc::new(MemoryCandleCache::new()),
        primary: Arc::new(MemoryCandleSink::new("primary")),
        secondary: Arc::new(MemoryCandleSink::new("secondary")),
    }
}

#[rstest]
#[tokio::test]
async fn test_tick_persists_every_timeframe_to_every_sink(harness: Harness) {
    fill(&harness.cache, "TEST", 0..10);
    let mut orchestrator = harness.orchestrator(Timeframe::ALL.to_vec(), 60);

    let report = orchestrator.run_once().await;

    assert_eq!(report.symbols_seen, 1);
    assert_eq!(report.processed, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(report.trimmed, 0);
    // 10 + 4 + 2 + 1 + 1 + 1 + 1 + 1 + 1
    assert_eq!(report.candles_written, 22);
    for sink in [&harness.primary, &harness.secondary] {
        assert_eq!(sink.len(), 22);
        let m5 = sink.series("TEST", Timeframe::M5);
        assert_eq!(m5.len(), 2);
        assert_eq!(m5[0].candle.open, 100.0);
        assert_eq!(m5[0].candle.close, 104.5);
        assert_eq!(m5[0].candle.volume, 50.0);
    }
    assert_eq!(orchestrator.tracked_pending("TEST"), Some(10));
    assert_eq!(harness.cache.pending("TEST").len(), 10);
}

#[rstest]
#[tokio::test]
async fn test_unchanged_pending_count_is_skipped(harness: Harness) {
    fill(&harness.cache, "TEST", 0..3);
    let mut orchestrator = harness.orchestrator(vec![Timeframe::M3], 60);

    orchestrator.run_once().await;
    let writes = harness.primary.write_count();
    let report = orchestrator.run_once().await;

    assert_eq!(report.skipped_unchanged, 1);
    assert_eq!(report.processed, 0);
    assert_eq!(harness.cache.read_count("TEST"), 1);
    assert_eq!(harness.primary.write_count(), writes);
}

#[rstest]
#[tokio::test]
async fn test_growing_bucket_is_overwritten_in_place(harness: Harness) {
    fill(&harness.cache, "TEST", 0..2);
    let mut orchestrator = harness.orchestrator(vec![Timeframe::M5], 60);

    orchestrator.run_once().await;
    let partial = harness.primary.get("TEST", Timeframe::M5, "202506020900").unwrap();
    assert_eq!(partial.count, 2);
    assert!(partial.is_partial());

    fill(&harness.cache, "TEST", 2..5);
    let report = orchestrator.run_once().await;

    assert_eq!(report.processed, 1);
    assert_eq!(harness.primary.len(), 1);
    let complete = harness.primary.get("TEST", Timeframe::M5, "202506020900").unwrap();
    assert_eq!(complete.count, 5);
    assert_eq!(complete.candle.close, 104.5);
    assert_eq!(complete.candle.high, 105.0);
}

#[rstest]
#[tokio::test]
async fn test_threshold_backs_up_and_trims(harness: Harness) {
    let backup_dir = TempDir::new().unwrap();
    fill(&harness.cache, "TEST", 0..60);
    let mut orchestrator = harness
        .orchestrator(vec![Timeframe::H1], 60)
        .with_backup(Arc::new(FileObjectBackup::new(backup_dir.path())));

    let report = orchestrator.run_once().await;

    assert_eq!(report.trimmed, 1);
    assert!(harness.cache.pending("TEST").is_empty());
    assert_eq!(orchestrator.tracked_pending("TEST"), Some(0));
    assert_eq!(orchestrator.phase("TEST"), SymbolPhase::Idle);
    let hour = harness.primary.get("TEST", Timeframe::H1, "202506020900").unwrap();
    assert_eq!(hour.count, 60);
    assert!(
        backup_dir
            .path()
            .join("candles/timeframe=1m/symbol=TEST/year=2025/month=06/day=02/0900_n60.json")
            .exists()
    );

    let report = orchestrator.run_once().await;
    assert_eq!(report.symbols_seen, 0);
    assert_eq!(orchestrator.tracked_pending("TEST"), None);
}

/// Cache that gets a new entry appended right after each read
struct AppendingCache {
    inner: MemoryCandleCache,
    late: Mutex<Vec<Candle>>,
}

#[async_trait]
impl CandleCache for AppendingCache {
    async fn list_symbols_with_pending(&self) -> Result<Vec<String>> {
        self.inner.list_symbols_with_pending().await
    }

    async fn pending_count(&self, symbol: &str) -> Result<usize> {
        self.inner.pending_count(symbol).await
    }

    async fn read_pending(&self, symbol: &str) -> Result<PendingBatch> {
        let batch = self.inner.read_pending(symbol).await?;
        let late = self.late.lock().pop();
        if let Some(candle) = late {
            self.inner.push_candle(&candle)?;
        }
        Ok(batch)
    }

    async fn trim_pending(&self, symbol: &str, count: usize) -> Result<()> {
        self.inner.trim_pending(symbol, count).await
    }
}

#[tokio::test]
async fn test_entries_appended_after_read_survive_trim() {
    let inner = MemoryCandleCache::new();
    fill(&inner, "TEST", 0..4);
    let cache = Arc::new(AppendingCache { inner, late: Mutex::new(vec![minute("TEST", 4)]) });
    let sink = Arc::new(MemoryCandleSink::new("memory"));
    let mut orchestrator = PollingOrchestrator::new(
        cache.clone(),
        vec![sink.clone() as Arc<dyn CandleSink>],
        CandleAggregator::new(vec![Timeframe::M1]),
        fast_settings(4),
    )
    .unwrap();

    let report = orchestrator.run_once().await;
    assert_eq!(report.trimmed, 1);
    assert_eq!(sink.len(), 4);

    let left = cache.inner.pending("TEST");
    assert_eq!(left, vec![serde_json::to_string(&encode_record(&minute("TEST", 4))).unwrap()]);

    let report = orchestrator.run_once().await;
    assert_eq!(report.processed, 1);
    assert_eq!(sink.len(), 5);
    assert_eq!(orchestrator.tracked_pending("TEST"), Some(1));
}

#[rstest]
#[tokio::test]
async fn test_failing_symbol_does_not_block_others(harness: Harness) {
    fill(&harness.cache, "AAA", 0..3);
    fill(&harness.cache, "BBB", 0..3);
    harness.cache.set_failing("AAA", true);
    let mut orchestrator = harness.orchestrator(vec![Timeframe::M1], 60);

    let report = orchestrator.run_once().await;

    assert_eq!(report.symbols_seen, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.processed, 1);
    assert!(harness.primary.series("AAA", Timeframe::M1).is_empty());
    assert_eq!(harness.primary.series("BBB", Timeframe::M1).len(), 3);
    assert_eq!(orchestrator.tracked_pending("AAA"), None);

    harness.cache.set_failing("AAA", false);
    let report = orchestrator.run_once().await;
    assert_eq!(report.processed, 1);
    assert_eq!(report.skipped_unchanged, 1);
    assert_eq!(harness.primary.series("AAA", Timeframe::M1).len(), 3);
}

#[rstest]
#[tokio::test]
async fn test_sink_failure_blocks_trim_and_retries_next_tick(harness: Harness) {
    fill(&harness.cache, "TEST", 0..5);
    harness.secondary.set_failing(true);
    let mut orchestrator = harness.orchestrator(vec![Timeframe::M5], 5);

    let report = orchestrator.run_once().await;
    assert_eq!(report.failed, 1);
    assert_eq!(report.trimmed, 0);
    assert_eq!(harness.cache.pending("TEST").len(), 5);
    assert_eq!(orchestrator.tracked_pending("TEST"), Some(0));
    assert_eq!(orchestrator.phase("TEST"), SymbolPhase::Idle);
    // The healthy sink keeps its idempotent write
    assert_eq!(harness.primary.len(), 1);

    harness.secondary.set_failing(false);
    let report = orchestrator.run_once().await;
    assert_eq!(report.processed, 1);
    assert_eq!(report.trimmed, 1);
    assert_eq!(harness.primary.len(), 1);
    assert_eq!(harness.secondary.len(), 1);
    assert!(harness.cache.pending("TEST").is_empty());
}

#[rstest]
#[tokio::test]
async fn test_malformed_records_are_skipped(harness: Harness) {
    fill(&harness.cache, "TEST", 0..2);
    harness.cache.push_raw("TEST", "{\"t\":\"bogus\"}");
    harness.cache.push_raw("TEST", "not json");
    let mut orchestrator = harness.orchestrator(vec![Timeframe::M1], 60);

    let report = orchestrator.run_once().await;

    assert_eq!(report.processed, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(harness.primary.len(), 2);
    assert_eq!(orchestrator.tracked_pending("TEST"), Some(4));
}

#[rstest]
#[tokio::test]
async fn test_current_buckets_reported_provisional(harness: Harness) {
    let label = format_time_label(Utc::now().naive_utc());
    harness
        .cache
        .push_candle(&Candle {
            symbol: "LIVE".to_string(),
            time: label,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 1.0,
        })
        .unwrap();
    let mut orchestrator = harness.orchestrator(vec![Timeframe::M1, Timeframe::D1], 60);

    let report = orchestrator.run_once().await;

    assert_eq!(report.candles_written, 2);
    assert_eq!(report.provisional_buckets, 2);
}

struct RecordingBackup {
    calls: Mutex<Vec<usize>>,
}

#[async_trait]
impl BackupSink for RecordingBackup {
    fn name(&self) -> &str {
        "recording"
    }

    async fn put_raw(&self, _symbol: &str, candles: &[Candle]) -> Result<candle_aggregator::BackupOutcome> {
        self.calls.lock().push(candles.len());
        anyhow::bail!("archive offline")
    }
}

#[rstest]
#[tokio::test]
async fn test_backup_failure_keeps_cache(harness: Harness) {
    fill(&harness.cache, "TEST", 0..3);
    let backup = Arc::new(RecordingBackup { calls: Mutex::new(Vec::new()) });
    let mut orchestrator = harness
        .orchestrator(vec![Timeframe::M1], 3)
        .with_backup(backup.clone());

    let report = orchestrator.run_once().await;

    assert_eq!(report.failed, 1);
    assert_eq!(harness.cache.pending("TEST").len(), 3);
    // Retried once under the fast policy
    assert_eq!(*backup.calls.lock(), vec![3, 3]);
}

#[rstest]
#[tokio::test]
async fn test_run_stops_on_shutdown(harness: Harness) {
    fill(&harness.cache, "TEST", 0..3);
    let mut orchestrator = harness.orchestrator(vec![Timeframe::M3], 60);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let task = tokio::spawn(async move {
        orchestrator.run(Shutdown::new(shutdown_rx)).await.unwrap();
        orchestrator
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown_tx.send(()).unwrap();

    let orchestrator = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("orchestrator stops after shutdown")
        .unwrap();
    assert_eq!(orchestrator.tracked_pending("TEST"), Some(3));
    assert_eq!(harness.primary.len(), 1);
    assert_eq!(harness.cache.read_count("TEST"), 1);
}

#[rstest]
#[tokio::test]
async fn test_unsafe_symbol_fails_backup_and_keeps_cache(harness: Harness) {
    let backup_dir = TempDir::new().unwrap();
    let root = backup_dir.path().join("bucket");
    fill(&harness.cache, "../../escaped", 0..3);
    let mut orchestrator = harness
        .orchestrator(vec![Timeframe::M1], 3)
        .with_backup(Arc::new(FileObjectBackup::connect(&root).await.unwrap()));

    let report = orchestrator.run_once().await;

    assert_eq!(report.failed, 1);
    assert_eq!(report.trimmed, 0);
    assert_eq!(harness.cache.pending("../../escaped").len(), 3);
    assert_eq!(std::fs::read_dir(&root).unwrap().count(), 0);
    assert_eq!(std::fs::read_dir(backup_dir.path()).unwrap().count(), 1);
}

/// Cache whose reported pending count can be pinned independently of its lists
struct PinnedCountCache {
    inner: MemoryCandleCache,
    count: Mutex<Option<usize>>,
}

#[async_trait]
impl CandleCache for PinnedCountCache {
    async fn list_symbols_with_pending(&self) -> Result<Vec<String>> {
        self.inner.list_symbols_with_pending().await
    }

    async fn pending_count(&self, symbol: &str) -> Result<usize> {
        let pinned = *self.count.lock();
        match pinned {
            Some(count) => Ok(count),
            None => self.inner.pending_count(symbol).await,
        }
    }

    async fn read_pending(&self, symbol: &str) -> Result<PendingBatch> {
        self.inner.read_pending(symbol).await
    }

    async fn trim_pending(&self, symbol: &str, count: usize) -> Result<()> {
        self.inner.trim_pending(symbol, count).await
    }
}

#[tokio::test]
async fn test_listed_symbol_with_zero_count_is_forgotten() {
    let inner = MemoryCandleCache::new();
    fill(&inner, "TEST", 0..3);
    let cache = Arc::new(PinnedCountCache { inner, count: Mutex::new(None) });
    let sink = Arc::new(MemoryCandleSink::new("memory"));
    let mut orchestrator = PollingOrchestrator::new(
        cache.clone(),
        vec![sink.clone() as Arc<dyn CandleSink>],
        CandleAggregator::new(vec![Timeframe::M3]),
        fast_settings(60),
    )
    .unwrap();

    let report = orchestrator.run_once().await;
    assert_eq!(report.processed, 1);
    assert_eq!(orchestrator.tracked_pending("TEST"), Some(3));

    *cache.count.lock() = Some(0);
    let report = orchestrator.run_once().await;
    assert_eq!(report.symbols_seen, 1);
    assert_eq!(report.drained, 1);
    assert_eq!(report.processed, 0);
    assert_eq!(orchestrator.tracked_pending("TEST"), None);
    assert_eq!(cache.inner.read_count("TEST"), 1);

    // Same count as before the drain, but the dedup entry is gone
    *cache.count.lock() = None;
    let report = orchestrator.run_once().await;
    assert_eq!(report.processed, 1);
    assert_eq!(report.skipped_unchanged, 0);
    assert_eq!(cache.inner.read_count("TEST"), 2);
    assert_eq!(orchestrator.tracked_pending("TEST"), Some(3));
}

#[rstest]
#[tokio::test]
async fn test_bucket_split_by_trim_keeps_latest_batch_only(harness: Harness) {
    fill(&harness.cache, "TEST", 0..3);
    let mut orchestrator = harness.orchestrator(vec![Timeframe::H1], 3);

    let report = orchestrator.run_once().await;
    assert_eq!(report.trimmed, 1);
    assert_eq!(harness.primary.get("TEST", Timeframe::H1, "202506020900").unwrap().count, 3);

    fill(&harness.cache, "TEST", 3..5);
    let report = orchestrator.run_once().await;
    assert_eq!(report.processed, 1);
    assert_eq!(report.trimmed, 0);

    // Upsert replaces the row with the post-trim minutes only
    let hour = harness.primary.get("TEST", Timeframe::H1, "202506020900").unwrap();
    assert_eq!(hour.count, 2);
    assert_eq!(hour.candle.open, 103.0);
    assert_eq!(hour.candle.volume, 20.0);
}
