//! askd: the command-line assistant daemon.
//!
//! Serves the chat, history, and user endpoints over Unix sockets and
//! brokers queries to the configured inference backend. Designed to run
//! under systemd socket-style activation: it signals READY=1, exits after
//! the configured idle period, and is restarted by the next caller.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use askd::config::{AppConfig, DEFAULT_CONFIG_PATH};
use askd::daemon::Daemon;

#[derive(Debug, Parser)]
#[command(name = "askd", about = "Command-line assistant daemon", version)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long, value_name = "PATH", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the socket directory from the configuration.
    #[arg(long, value_name = "DIR")]
    socket_dir: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON.
    #[arg(long)]
    json_logs: bool,
}

fn init_logging(args: &Args, config: &AppConfig) {
    let level = if args.verbose {
        "debug"
    } else {
        &config.logging.level
    };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("askd={level}")));

    if args.json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .ok();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load(&args.config)?;
    if let Some(socket_dir) = &args.socket_dir {
        config.daemon.socket_dir = socket_dir.clone();
    }

    init_logging(&args, &config);
    info!(
        config = %args.config.display(),
        socket_dir = %config.daemon.socket_dir.display(),
        "starting askd"
    );

    let daemon = Arc::new(Daemon::new(config).await?);
    let shutdown = CancellationToken::new();

    {
        let shutdown = shutdown.clone();
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("received SIGINT");
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM");
                }
            }
            shutdown.cancel();
        });
    }

    daemon.run(shutdown).await
}
