//! Crashpoint server binary
//!
//! Loads configuration, opens the round store, starts the scheduler and
//! serves the HTTP/WebSocket API until shutdown.

use clap::Parser;
use crashpoint::{
    api::{ApiServer, AppState},
    config::{generate_sample_config, ConfigLoader},
    CrashEngine, EngineMetrics, RocksRoundStore, RoundScheduler, RoundStore, SystemClock,
};
use std::{path::PathBuf, sync::Arc};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "crashpoint")]
#[command(about = "Provably-fair crash round server", long_about = None)]
struct Args {
    /// Configuration file path (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write a sample configuration to this path and exit
    #[arg(long)]
    generate_config: Option<String>,

    /// Host to bind to
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// RocksDB directory for rounds and bets
    #[arg(long)]
    data_dir: Option<String>,

    /// Run without persistence
    #[arg(long)]
    no_persistence: bool,

    /// Keep one round open at all times
    #[arg(long)]
    auto_rounds: bool,

    /// Scheduler tick interval in milliseconds
    #[arg(long)]
    tick_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Some(path) = &args.generate_config {
        generate_sample_config(path)?;
        println!("Sample configuration written to {}", path);
        return Ok(());
    }

    let loader = match &args.config {
        Some(path) => ConfigLoader::new().with_path(path),
        None => ConfigLoader::new(),
    };
    let mut config = loader.load()?;

    if let Some(host) = args.host {
        config.api.host = host;
    }
    if let Some(port) = args.port {
        config.api.port = port;
    }
    if let Some(dir) = args.data_dir {
        config.storage.data_directory = dir;
    }
    if args.no_persistence {
        config.storage.enabled = false;
    }
    if args.auto_rounds {
        config.scheduler.auto_start_rounds = true;
    }
    if let Some(ms) = args.tick_ms {
        config.scheduler.tick_interval_ms = ms;
    }
    loader.validate(&config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.monitoring.log_filter)),
        )
        .init();

    let store: Option<Arc<dyn RoundStore>> = if config.storage.enabled {
        match RocksRoundStore::open(&config.storage.data_directory) {
            Ok(store) => {
                info!(path = %config.storage.data_directory, "Round store opened");
                Some(Arc::new(store) as Arc<dyn RoundStore>)
            }
            Err(e) => {
                warn!(
                    path = %config.storage.data_directory,
                    error = %e,
                    "Round store unavailable; running without persistence"
                );
                None
            }
        }
    } else {
        None
    };

    let engine = Arc::new(CrashEngine::new(
        config.engine.clone(),
        Arc::new(SystemClock),
        store,
        EngineMetrics::new()?,
    ));

    let scheduler = Arc::new(RoundScheduler::new(engine.clone(), config.scheduler.clone()));
    let scheduler_task = scheduler.clone().spawn();

    let state = Arc::new(AppState::new(engine.clone(), config.monitoring.enable_metrics));
    let served = ApiServer::new(config.api.clone(), state).run().await;

    scheduler.stop();
    if let Err(e) = scheduler_task.await {
        warn!("Scheduler task ended abnormally: {}", e);
    }
    served
}
