use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ipclink_core::AppConfig;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod probe;
mod relay;
mod server;
mod talk;

#[derive(Debug, Parser)]
#[command(name = "ipclink", version, about = "IP camera to WebRTC bridge")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the relay (`/ipc`) and talk (`/talk`) WebSocket endpoints.
    Serve {
        /// JSON config file.
        #[arg(long, env = "IPCLINK_CONFIG")]
        config: Option<PathBuf>,
        /// Overrides the configured listen address.
        #[arg(long)]
        listen: Option<String>,
    },
    /// Record a device's preview video to an H.264 Annex-B file.
    Probe {
        #[arg(long)]
        address: String,
        #[arg(long, default_value = "admin")]
        username: String,
        #[arg(long, env = "IPCLINK_DEVICE_PASSWORD", default_value = "")]
        password: String,
        #[arg(long, default_value = "preview.h264")]
        output: PathBuf,
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG=debug para mais detalhes
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_thread_ids(false)
        .init();

    info!("ipclink v{}", env!("CARGO_PKG_VERSION"));

    match run(Cli::parse()).await {
        Ok(()) => {
            info!("ipclink exited cleanly.");
            Ok(())
        }
        Err(e) => {
            error!("Fatal error: {:#}", e);
            Err(e)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Serve { config, listen } => {
            let mut cfg = AppConfig::load(config.as_deref()).context("loading configuration")?;
            if let Some(listen) = listen {
                cfg.listen_addr = listen;
                cfg.validate().context("validating configuration")?;
            }
            server::run(cfg).await
        }
        Command::Probe {
            address,
            username,
            password,
            output,
            timeout_ms,
        } => {
            probe::run(probe::ProbeArgs {
                address,
                username,
                password,
                output,
                timeout: Duration::from_millis(timeout_ms),
            })
            .await
        }
    }
}
