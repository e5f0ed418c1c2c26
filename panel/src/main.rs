mod api;
mod config;
mod entity;
mod error;
mod store;

use anyhow::{Context, Result};
use clap::Parser;
use engine::{
    BroadcastHub, EngineAdapter, EngineManager, Monitor, SettingsStore, SingBoxAdapter,
    XrayAdapter,
};
use mimalloc::MiMalloc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "freegfw-panel")]
#[command(about = "Proxy engine control panel", long_about = None)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "panel.toml")]
    config: String,

    /// API listen address
    #[arg(long, env = "PANEL_API_ADDR")]
    api_addr: Option<String>,

    /// SQLite database path
    #[arg(long, env = "PANEL_DATABASE")]
    database: Option<String>,

    /// Log level, overridden by RUST_LOG
    #[arg(long, env = "PANEL_LOG_LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut cfg = config::PanelConfig::load_or_default(&args.config)?;
    if let Some(api_addr) = args.api_addr {
        cfg.api_addr = api_addr;
    }
    if let Some(database) = args.database {
        cfg.database_path = database;
    }
    if let Some(log_level) = args.log_level {
        cfg.log_level = log_level;
    }

    let _log_guard = common::init_tracing(cfg.log_dir.as_deref(), &cfg.log_file, &cfg.log_level)
        .context("Failed to initialise logging")?;
    info!("Starting panel with configuration: {:?}", cfg);

    let store = Arc::new(
        store::SqliteStore::open(&cfg.database_path)
            .await
            .with_context(|| format!("Failed to open database {}", cfg.database_path))?,
    );

    let shutdown = CancellationToken::new();
    let hub = BroadcastHub::spawn(&cfg.hub, shutdown.clone());

    let adapters: Vec<Arc<dyn EngineAdapter>> = vec![
        Arc::new(SingBoxAdapter::new(cfg.engine.clone(), &cfg.limits)),
        Arc::new(XrayAdapter::new(cfg.engine.clone(), &cfg.limits)),
    ];
    let manager = Arc::new(EngineManager::new(
        store.clone() as Arc<dyn SettingsStore>,
        adapters,
        cfg.engine.clone(),
        cfg.limits.clone(),
    ));

    let monitor = Monitor::new(
        store.clone(),
        hub.clone(),
        cfg.monitor.clone(),
        manager.subscribe(),
    )
    .spawn(shutdown.clone());

    if store.setting("inited").await?.is_some() {
        match manager.refresh().await {
            Ok(()) => {
                if let Err(e) = manager.start().await {
                    error!("Failed to start engine: {}", e);
                }
            }
            Err(e) => warn!("Not starting engine, settings are incomplete: {}", e),
        }
    } else {
        info!("Panel not initialised yet, engine stays stopped");
    }

    let state = api::AppState {
        manager: manager.clone(),
        store: store.clone(),
        hub,
    };
    let api_server = {
        let addr = cfg.api_addr.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = api::serve(&addr, state, shutdown).await {
                error!("API server error: {}", e);
            }
        })
    };

    tokio::select! {
        _ = api_server => {
            error!("API server stopped");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down panel");
    manager.kill().await;
    shutdown.cancel();
    if let Err(e) = monitor.await {
        warn!("Monitor task failed: {}", e);
    }
    Ok(())
}
