//! Candle persistence layer
//!
//! Relational candle table on `PostgreSQL`. Rows are keyed by
//! `(symbol, interval, time)` and written with `ON CONFLICT ... DO UPDATE`,
//! so a partial bucket written earlier is replaced by later passes.
//!
//! The table is provisioned outside this service:
//!
//! ```sql
//! CREATE TABLE candle_history (
//!     symbol   TEXT             NOT NULL,
//!     interval TEXT             NOT NULL,
//!     time     CHAR(12)         NOT NULL,
//!     epoch    BIGINT           NOT NULL,
//!     open     DOUBLE PRECISION NOT NULL,
//!     high     DOUBLE PRECISION NOT NULL,
//!     low      DOUBLE PRECISION NOT NULL,
//!     close    DOUBLE PRECISION NOT NULL,
//!     volume   DOUBLE PRECISION NOT NULL,
//!     minutes  INTEGER          NOT NULL,
//!     PRIMARY KEY (symbol, interval, time)
//! );
//! ```

use super::CandleSink;
use crate::{AggregatedCandle, Timeframe};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::FixedOffset;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use tracing::{debug, info};

/// Default table name
pub const DEFAULT_CANDLE_TABLE: &str = "candle_history";

/// Build the upsert statement for `table`
pub fn upsert_statement(table: &str) -> Result<String> {
    let valid = !table.is_empty()
        && table.len() <= 63
        && table.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        bail!("Invalid table name: {table:?}");
    }

    Ok(format!(
        r"
        INSERT INTO {table} (
            symbol, interval, time, epoch, open, high, low, close, volume, minutes
        ) VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10
        )
        ON CONFLICT (symbol, interval, time) DO UPDATE SET
            epoch = EXCLUDED.epoch,
            open = EXCLUDED.open,
            high = EXCLUDED.high,
            low = EXCLUDED.low,
            close = EXCLUDED.close,
            volume = EXCLUDED.volume,
            minutes = EXCLUDED.minutes
        "
    ))
}

/// Relational candle sink
#[derive(Debug, Clone)]
pub struct PostgresCandleStore {
    /// Database pool
    db_pool: PgPool,
    /// Prepared upsert SQL
    statement: String,
    /// Time zone the labels are written in
    offset: FixedOffset,
}

impl PostgresCandleStore {
    /// Create a sink on an existing pool
    pub fn new(db_pool: PgPool, table: &str, offset: FixedOffset) -> Result<Self> {
        Ok(Self { db_pool, statement: upsert_statement(table)?, offset })
    }

    /// Open a pool and verify the database answers
    pub async fn connect(
        url: &str,
        table: &str,
        max_connections: u32,
        acquire_timeout: Duration,
        offset: FixedOffset,
    ) -> Result<Self> {
        let db_pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await
            .context("Failed to connect to PostgreSQL")?;
        sqlx::query("SELECT 1").execute(&db_pool).await?;

        info!("Connected to PostgreSQL, writing to {}", table);
        Self::new(db_pool, table, offset)
    }

    fn bind<'q>(
        &'q self,
        symbol: &'q str,
        timeframe: Timeframe,
        candle: &'q AggregatedCandle,
    ) -> Result<sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>> {
        let epoch = candle.candle.epoch(self.offset)?;
        let minutes = i32::try_from(candle.count).context("Bucket count out of range")?;
        Ok(sqlx::query(&self.statement)
            .bind(symbol)
            .bind(timeframe.label())
            .bind(candle.candle.time.as_str())
            .bind(epoch)
            .bind(candle.candle.open)
            .bind(candle.candle.high)
            .bind(candle.candle.low)
            .bind(candle.candle.close)
            .bind(candle.candle.volume)
            .bind(minutes))
    }
}

#[async_trait]
impl CandleSink for PostgresCandleStore {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn upsert(&self, symbol: &str, timeframe: Timeframe, candle: &AggregatedCandle) -> Result<()> {
        self.bind(symbol, timeframe, candle)?.execute(&self.db_pool).await?;
        Ok(())
    }

    async fn upsert_batch(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        candles: &[AggregatedCandle],
    ) -> Result<usize> {
        if candles.is_empty() {
            return Ok(0);
        }

        let mut tx = self.db_pool.begin().await?;
        for candle in candles {
            self.bind(symbol, timeframe, candle)?.execute(&mut *tx).await?;
        }
        tx.commit().await?;

        debug!(symbol, interval = timeframe.label(), count = candles.len(), "Candles upserted");
        Ok(candles.len())
    }
}
