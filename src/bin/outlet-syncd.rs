use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use outletsync::{
    SyncConfig, SyncEngine, SyncError, persist::sqlite::SqliteStoreFactory,
    sync::http::HttpCentralStore,
};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "outlet-syncd")]
#[command(about = "Uploads outlet sales to the central store", long_about = None)]
struct Cli {
    /// JSON configuration file; defaults apply when omitted
    #[arg(short, long, env = "OUTLETSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding one database per outlet
    #[arg(long, env = "OUTLETSYNC_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Central store base URL
    #[arg(long, env = "OUTLETSYNC_ENDPOINT")]
    endpoint: Option<String>,

    /// Log level used when RUST_LOG is unset
    #[arg(short, long, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,

    /// Run a single pass over every outlet, print the report, and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<(), SyncError> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let mut config = match &cli.config {
        Some(path) => SyncConfig::from_path(path)?,
        None => SyncConfig::default(),
    };
    if let Some(endpoint) = cli.endpoint {
        config.central.endpoint = endpoint;
    }
    if let Some(dir) = cli.data_dir {
        config.data_dir = Some(dir);
    }
    config.validate()?;

    let data_dir = config
        .data_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("outlet-data"));
    let central = HttpCentralStore::new(
        &config.central,
        Duration::from_millis(config.transfer_timeout_ms),
    )?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        outlets = config.outlets.len(),
        "starting outlet-syncd"
    );

    let engine = SyncEngine::new(
        config,
        Arc::new(SqliteStoreFactory::new(data_dir)),
        Arc::new(central),
    )?;

    if cli.once {
        for (outlet_id, outcome) in engine.tick().await {
            info!(outlet_id = %outlet_id, outcome = ?outcome, "pass");
        }
        let report = engine.consolidated().await;
        match serde_json::to_string_pretty(&report) {
            Ok(text) => println!("{text}"),
            Err(err) => error!(error = %err, "could not render report"),
        }
        return engine.shutdown().await;
    }

    engine.start();
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "could not listen for interrupt");
    }
    info!("shutting down");
    engine.shutdown().await
}

fn init_logging(level: &str) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false))
        .init();
}
