//! OnAir Server - standalone headless server for live broadcasts.
//!
//! Hosts the WebSocket control channel, mixes microphone, media and TTS audio
//! per broadcast, and fans the encoded frames out to network speakers.

mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use onair_core::protocol_constants::APP_NAME;
use onair_core::{bootstrap_services, start_server};
use tokio::signal;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;

/// OnAir Server - live broadcast session orchestration.
#[derive(Parser, Debug)]
#[command(name = "onair-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE", env = "ONAIR_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "ONAIR_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Bind port (overrides config file).
    #[arg(short = 'p', long, env = "ONAIR_BIND_PORT")]
    port: Option<u16>,

    /// Data directory for persistent broadcast state.
    #[arg(short = 'd', long, env = "ONAIR_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Directory containing media and TTS files.
    #[arg(short = 'm', long, env = "ONAIR_MEDIA_DIR")]
    media_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("{} v{}", APP_NAME, env!("CARGO_PKG_VERSION"));

    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    // CLI overrides
    if let Some(port) = args.port {
        config.bind_port = port;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = Some(data_dir);
    }
    if let Some(media_dir) = args.media_dir {
        config.media_dir = media_dir;
    }

    log::info!(
        "Configuration: bind_port={}, speaker_port={}, media_dir={}, data_dir={}",
        config.bind_port,
        config.speaker_port,
        config.media_dir.display(),
        config
            .data_dir
            .as_deref()
            .map_or_else(|| "<memory>".to_string(), |d| d.display().to_string())
    );
    log::info!(
        "Directory: {} speaker(s), {} group(s), {} channel(s)",
        config.directory.speakers.len(),
        config.directory.groups.len(),
        config.directory.channels.len()
    );

    let core_config = config.to_core_config();
    let services = bootstrap_services(core_config, config.into_bootstrap_options())
        .context("Failed to bootstrap services")?;

    log::info!("Services bootstrapped successfully");

    let app_state = services.app_state();
    let server_shutdown = CancellationToken::new();
    let server_token = server_shutdown.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(app_state, server_token).await {
            log::error!("Server error: {}", e);
        }
    });

    shutdown_signal().await;

    log::info!("Shutdown signal received, cleaning up...");

    // Close connections and end broadcasts before the listener stops.
    services.shutdown().await;
    server_shutdown.cancel();

    if let Err(e) = server_handle.await {
        log::warn!("Server task ended abnormally: {}", e);
    }

    log::info!("Shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
