//! Candle Aggregator Service
//!
//! Polls the candle cache, rolls closed one-minute candles up into coarser
//! timeframes and writes them to the configured candle stores.

use anyhow::{Context, Result};
use candle_aggregator::storage::{
    FileObjectBackup, PostgresCandleStore, RedisCandleCache, RedisCandleStore,
};
use candle_aggregator::{
    AggregatorConfig, BackupSink, CandleAggregator, CandleCache, CandleSink, OrchestratorSettings,
    PollingOrchestrator, Shutdown,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SERVICE_NAME: &str = "candle-aggregator";

/// Candle aggregator command line
#[derive(Debug, Parser)]
#[command(name = SERVICE_NAME, version, about = "Roll cached one-minute candles up into coarser timeframes")]
struct Cli {
    /// Run a single tick and exit
    #[arg(long)]
    once: bool,

    /// Load environment variables from this file instead of `.env`
    #[arg(long, value_name = "PATH")]
    env_file: Option<PathBuf>,

    /// Override POLL_INTERVAL_MS
    #[arg(long, value_name = "MS")]
    poll_interval_ms: Option<u64>,

    /// Override LOG_LEVEL
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,
}

impl Cli {
    /// Environment keys replaced by command line flags
    fn overrides(&self) -> Vec<(&'static str, String)> {
        let mut overrides = Vec::new();
        if let Some(poll_interval_ms) = self.poll_interval_ms {
            overrides.push(("POLL_INTERVAL_MS", poll_interval_ms.to_string()));
        }
        if let Some(log_level) = &self.log_level {
            overrides.push(("LOG_LEVEL", log_level.clone()));
        }
        overrides
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.env_file {
        Some(path) => {
            dotenv::from_path(path).with_context(|| format!("Failed to load {}", path.display()))?;
        }
        None => {
            dotenv::dotenv().ok();
        }
    }

    let config = AggregatorConfig::load(|key| std::env::var(key).ok(), &cli.overrides())?;

    init_tracing(&config.log_level);
    info!("Starting Candle Aggregator Service v{}", env!("CARGO_PKG_VERSION"));

    let mut orchestrator = build_orchestrator(&config).await?;

    if cli.once {
        let report = orchestrator.run_once().await;
        if report.failed > 0 || report.discovery_failed {
            warn!(?report, "Single tick finished with failures");
        }
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(shutdown_signal(shutdown_tx));

    orchestrator.run(Shutdown::new(shutdown_rx)).await?;
    info!("Candle Aggregator Service stopped");
    Ok(())
}

/// Connect every collaborator; any failure here is fatal
async fn build_orchestrator(config: &AggregatorConfig) -> Result<PollingOrchestrator> {
    let offset = config.time_zone()?;

    let cache: Arc<dyn CandleCache> =
        Arc::new(RedisCandleCache::connect(&config.cache_url(), config.cache_key_prefix.clone()).await?);

    let mut sinks: Vec<Arc<dyn CandleSink>> = Vec::new();
    if let Some(url) = &config.kv_store_url {
        sinks.push(Arc::new(
            RedisCandleStore::connect(url, config.kv_key_prefix.clone(), offset).await?,
        ));
    }
    if let Some(url) = &config.database_url {
        sinks.push(Arc::new(
            PostgresCandleStore::connect(
                url,
                &config.pg_candle_table,
                config.pg_max_connections,
                config.call_timeout(),
                offset,
            )
            .await?,
        ));
    }
    info!(
        "Writing candles to: {}",
        sinks.iter().map(|sink| sink.name()).collect::<Vec<_>>().join(", ")
    );

    let aggregator = CandleAggregator::new(config.enabled_timeframes()?);
    let settings = OrchestratorSettings::from_config(config)?;
    let mut orchestrator = PollingOrchestrator::new(cache, sinks, aggregator, settings)?;

    if let Some(dir) = &config.backup_dir {
        let backup: Arc<dyn BackupSink> = Arc::new(FileObjectBackup::connect(dir).await?);
        info!("Archiving raw candles under {}", dir);
        orchestrator = orchestrator.with_backup(backup);
    }

    Ok(orchestrator)
}

/// Graceful shutdown signal handler
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        () = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }

    let _ = shutdown_tx.send(());
}

/// Initialize tracing with environment filter
fn init_tracing(log_level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}={}", SERVICE_NAME.replace('-', "_"), log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true).with_line_number(true))
        .init();
}
