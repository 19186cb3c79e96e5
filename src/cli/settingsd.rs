use anyhow::{Context, Result};
use clap::Parser;
use clap_derive::Parser;
use smart_home_settings::config::ServiceConfig;
use smart_home_settings::control::{ControlSync, LoggingEffector};
use smart_home_settings::logging::{
    LogConfig, LogGuard, RotationPeriod, setup_console_logging, setup_file_logging,
};
use smart_home_settings::restart::ProcessRestarter;
use smart_home_settings::store::{FileKvStore, KvBackend, MemoryKvStore, SettingsStore};
use smart_home_settings::web::SettingsServer;
use smart_home_settings::web::metrics::init_metrics;
use smart_home_settings::web::state::AppState;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser, Debug)]
pub struct Params {
    /// JSON configuration file (if not set, defaults are used)
    #[clap(long)]
    config: Option<PathBuf>,
    /// HTTP port, overrides the configuration file
    #[clap(long)]
    port: Option<u16>,
    /// Directory holding the persisted settings, overrides the configuration file
    #[clap(long)]
    data_dir: Option<PathBuf>,
    /// Keep settings in memory only (lost on exit)
    #[clap(long)]
    in_memory: bool,
    /// Directory for rotating log files (if not set, logs to stdout)
    #[clap(long)]
    log_dir: Option<PathBuf>,
    /// Log rotation period: minutely, hourly, daily or never
    #[clap(long, default_value = "daily")]
    log_rotation: RotationPeriod,
}

#[tokio::main]
async fn main() -> Result<()> {
    let params = Params::parse();
    let restarter = Arc::new(ProcessRestarter::new(setup_logging(&params)?));

    let mut config = match &params.config {
        Some(path) => ServiceConfig::load(path)?,
        None => ServiceConfig::default(),
    };
    if let Some(port) = params.port {
        config.port = port;
    }
    if let Some(data_dir) = params.data_dir {
        config.data_dir = data_dir;
    }

    let backend: Arc<dyn KvBackend> = if params.in_memory {
        warn!("Using in-memory storage, settings will not survive a restart");
        Arc::new(MemoryKvStore::new())
    } else {
        info!("Storing settings under {:?}", config.data_dir);
        Arc::new(
            FileKvStore::new(&config.data_dir)
                .with_context(|| format!("Cannot open data directory {:?}", config.data_dir))?,
        )
    };
    let store = Arc::new(SettingsStore::new(backend));

    let mut state = AppState::new(
        store.clone(),
        restarter.clone(),
        config.restart_delay(),
        config.poll_interval(),
    )?;
    if config.metrics {
        state = state.with_metrics(init_metrics()?);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let control = tokio::spawn(
        ControlSync::new(store, Arc::new(LoggingEffector)).run(config.poll_interval(), shutdown_rx),
    );

    let server = SettingsServer::new();
    server
        .start(SocketAddr::from(([0, 0, 0, 0], config.port)), state)
        .await
        .with_context(|| format!("Cannot listen on port {}", config.port))?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    let _ = shutdown_tx.send(true);
    server.shutdown().await;
    control.await?;
    // Flushes file logs once the server has released its handle.
    drop(restarter);

    Ok(())
}

fn setup_logging(params: &Params) -> Result<LogGuard> {
    match &params.log_dir {
        Some(log_dir) => Ok(setup_file_logging(&LogConfig::new(
            log_dir,
            params.log_rotation,
        ))?),
        None => Ok(setup_console_logging()),
    }
}
