//! Collateral-vault liquidation bot.
//!
//! Per configured chain: discovers every vault the factory ever created,
//! keeps a live health estimate per vault on an adaptive cadence, and
//! simulates/submits liquidations when a vault becomes unhealthy or was
//! liquidated on its backing protocol.

mod http;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use liquidator_core::{config, configured_chain_ids, ChainManager};

#[tokio::main]
async fn main() -> Result<()> {
    print_banner();
    dotenvy::dotenv().ok();

    let config_path =
        PathBuf::from(std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.json".to_string()));

    init_tracing(&config_path)?;

    // Panics from spawned tasks land in the log file, not just stderr.
    std::panic::set_hook(Box::new(|info| {
        error!("Uncaught panic: {info}");
    }));

    let chain_ids = configured_chain_ids(&config_path)
        .with_context(|| format!("reading {}", config_path.display()))?;
    anyhow::ensure!(!chain_ids.is_empty(), "no chains configured");

    let notify = env_flag("NOTIFY", true);
    let execute_liquidation = env_flag("EXECUTE_LIQUIDATION", true);

    info!(?chain_ids, notify, execute_liquidation, "Starting liquidation bot");

    let manager =
        Arc::new(ChainManager::new(&config_path, chain_ids, notify, execute_liquidation).await?);

    // Snapshot HTTP surface.
    let bind = std::env::var("API_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    info!(bind, "Snapshot API listening");
    let app = http::router(manager.clone());
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "Snapshot API server failed");
        }
    });

    tokio::select! {
        result = manager.start() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    manager.stop().await;
    Ok(())
}

/// stdout layer plus a plain-text file layer under the configured logs
/// directory.
fn init_tracing(config_path: &PathBuf) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,liquidator_core=debug,liquidator_chain=debug")
    });

    let registry = tracing_subscriber::registry().with(fmt::layer()).with(filter);

    let log_file = std::fs::read_to_string(config_path)
        .ok()
        .and_then(|contents| config::parse_config(&contents).ok())
        .map(|raw| PathBuf::from(raw.global.logs_path).join("liquidator.log"));

    if let Some(path) = log_file {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
        registry
            .with(fmt::layer().with_ansi(false).with_writer(std::sync::Mutex::new(file)))
            .init();
    } else {
        registry.init();
    }

    Ok(())
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => !matches!(value.to_lowercase().as_str(), "0" | "false" | "no" | "off"),
        Err(_) => default,
    }
}

fn print_banner() {
    println!(
        r#"
    Collateral Vault Liquidator v{}
    "#,
        env!("CARGO_PKG_VERSION")
    );
}
