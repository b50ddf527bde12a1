use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

mod config;
mod dify;
mod relay;

use convo_bridge::{ConnectionState, Orchestrator, event_channel};

use crate::config::{DEFAULT_CONFIG_FILE, FileConfig, bridge_config_from_file, load_config};
use crate::dify::{DifyClient, DifyConfig};
use crate::relay::{RelayConfig, RelayTransport};

#[derive(Parser)]
#[command(name = "aimbot")]
#[command(about = "Instant-messaging bot answering buddies through a Dify chat backend")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (missing file = defaults + env vars)
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and answer messages until interrupted (default)
    Run,

    /// Print the effective configuration with secrets masked
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let file_config: FileConfig = load_config(&cli.config)
        .extract()
        .with_context(|| format!("Invalid configuration ({})", cli.config.display()))?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Config => {
            let rendered = toml::to_string_pretty(&file_config.redacted())
                .context("Failed to render configuration")?;
            print!("{rendered}");
            Ok(())
        }
        Commands::Run => run_bot(file_config, cli.debug).await,
    }
}

fn init_logging(debug: bool, log_file: Option<&Path>) -> Result<()> {
    let default_directive = if debug {
        "aimbot=debug,convo_bridge=debug,info"
    } else {
        "aimbot=info,convo_bridge=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));

    let file_layer = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Arc::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .with(env_filter)
        .init();
    Ok(())
}

async fn run_bot(file_config: FileConfig, debug: bool) -> Result<()> {
    init_logging(debug, file_config.logging.file.as_deref())?;
    file_config.validate()?;

    info!(
        screen_name = %file_config.transport.screen_name,
        relay = %file_config.transport.url,
        backend = %file_config.backend.api_url,
        "Starting aimbot"
    );

    let (events_tx, events_rx) = event_channel(file_config.transport.event_capacity);
    let transport = Arc::new(RelayTransport::new(
        RelayConfig::from_file(&file_config.transport),
        events_tx,
    ));
    let backend = Arc::new(DifyClient::new(DifyConfig::from_file(&file_config.backend))?);

    let orchestrator = Orchestrator::new(
        bridge_config_from_file(&file_config.bridge, &file_config.reconnect),
        transport,
        backend,
    );

    let shutdown = orchestrator.shutdown_token();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Received shutdown signal, cleaning up...");
        shutdown.cancel();
    });

    let mut connection = orchestrator.subscribe_connection();
    tokio::spawn(async move {
        while connection.changed().await.is_ok() {
            match *connection.borrow() {
                ConnectionState::Connected => info!("Signed on"),
                ConnectionState::Reconnecting { attempt } => warn!(attempt, "Reconnecting"),
                ConnectionState::GivenUp => error!("Giving up on the connection"),
                _ => {}
            }
        }
    });

    let result = orchestrator.run(events_rx).await;
    orchestrator.shutdown().await;

    info!("Shutdown complete");
    result.context("Bot stopped")
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
