//! Object-store backup of raw one-minute candles
//!
//! Snapshots are immutable: an object is written once under a key derived
//! from the symbol and the earliest candle, and never overwritten.

use super::{BackupOutcome, BackupSink, CandleRecord, encode_record};
use crate::aggregators::parse_time_label;
use crate::{Candle, Timeframe};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Object key for a raw one-minute snapshot
///
/// `candles/timeframe=1m/symbol={symbol}/year={YYYY}/month={MM}/day={DD}/{HHmm}_n{count}.json`
///
/// The symbol becomes one path segment, so separators and dot segments are
/// rejected rather than resolved.
pub fn backup_object_key(symbol: &str, first_time: &str, count: usize) -> Result<PathBuf> {
    if symbol.is_empty()
        || symbol == "."
        || symbol == ".."
        || symbol.contains(['/', '\\', '\0'])
    {
        bail!("Symbol {symbol:?} cannot be used in a backup key");
    }
    parse_time_label(first_time)?;
    let mut key = PathBuf::from("candles");
    key.push(format!("timeframe={}", Timeframe::M1.label()));
    key.push(format!("symbol={symbol}"));
    key.push(format!("year={}", &first_time[0..4]));
    key.push(format!("month={}", &first_time[4..6]));
    key.push(format!("day={}", &first_time[6..8]));
    key.push(format!("{}_n{count}.json", &first_time[8..12]));
    Ok(key)
}

#[derive(Serialize)]
struct Snapshot<'a> {
    symbol: &'a str,
    interval: &'static str,
    candles: Vec<CandleRecord>,
}

/// Object store rooted at a local directory or mounted bucket
#[derive(Debug, Clone)]
pub struct FileObjectBackup {
    root: PathBuf,
}

impl FileObjectBackup {
    /// Create a backup sink writing under `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Make sure the root exists and is writable
    pub async fn connect(root: impl Into<PathBuf>) -> Result<Self> {
        let backup = Self::new(root);
        tokio::fs::create_dir_all(&backup.root)
            .await
            .with_context(|| format!("Cannot create backup root {}", backup.root.display()))?;
        Ok(backup)
    }

    /// Root directory
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl BackupSink for FileObjectBackup {
    fn name(&self) -> &str {
        "object-backup"
    }

    async fn put_raw(&self, symbol: &str, candles: &[Candle]) -> Result<BackupOutcome> {
        let Some(first) = candles.iter().min_by(|a, b| a.time.cmp(&b.time)) else {
            return Ok(BackupOutcome::Empty);
        };

        let key = backup_object_key(symbol, &first.time, candles.len())?;
        let key_str = key.to_string_lossy().into_owned();
        let path = self.root.join(&key);

        if tokio::fs::try_exists(&path).await? {
            debug!(symbol, key = %key_str, "Backup object already present");
            return Ok(BackupOutcome::AlreadyPresent(key_str));
        }

        let mut records: Vec<&Candle> = candles.iter().collect();
        records.sort_by(|a, b| a.time.cmp(&b.time));
        let snapshot = Snapshot {
            symbol,
            interval: Timeframe::M1.label(),
            candles: records.into_iter().map(encode_record).collect(),
        };
        let body = serde_json::to_vec_pretty(&snapshot)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write aside and rename so readers never see a half-written object
        let staging = path.with_extension("json.partial");
        tokio::fs::write(&staging, &body).await?;
        tokio::fs::rename(&staging, &path)
            .await
            .with_context(|| format!("Failed to publish {key_str}"))?;

        debug!(symbol, key = %key_str, bytes = body.len(), "Backup object written");
        Ok(BackupOutcome::Written(key_str))
    }
}
