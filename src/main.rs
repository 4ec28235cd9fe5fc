use std::path::{Path, PathBuf};

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use dhcp_server::api::{self, ApiState};
use dhcp_server::logstream::{LogStream, LogTee};
use dhcp_server::{Config, Lifecycle, Result};

#[derive(Parser)]
#[command(name = "dhcp-server")]
#[command(version, about = "A managed single-subnet DHCPv4 server", long_about = None)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if !nix::unistd::geteuid().is_root() {
        eprintln!("warning: not running as root, binding DHCP port 67 may fail");
    }

    let config = Config::load(&cli.config).await?;

    let logs = LogStream::new();
    init_logging(&config, &logs);

    info!("starting dhcp-server v{}", env!("CARGO_PKG_VERSION"));
    info!("configuration loaded from {}", cli.config.display());

    let lifecycle = Lifecycle::new(&cli.config, config)?;
    lifecycle.start().await;

    let api_cancel = CancellationToken::new();
    let api_state = ApiState {
        lifecycle: lifecycle.clone(),
        logs,
    };
    {
        let cancel = api_cancel.child_token();
        tokio::spawn(async move {
            if let Err(err) = api::serve(api_state, cancel).await {
                error!("management API error: {err}");
            }
        });
    }

    wait_for_shutdown().await;
    info!("shutdown signal received, stopping");

    api_cancel.cancel();
    lifecycle.shutdown().await;

    info!("server stopped");
    Ok(())
}

fn init_logging(config: &Config, logs: &LogStream) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.server.log_level));

    let tee = match LogTee::new(logs.clone(), Path::new(&config.server.log_file)) {
        Ok(tee) => tee,
        Err(err) => {
            eprintln!(
                "warning: cannot open log file {}: {err}",
                config.server.log_file
            );
            LogTee::memory_only(logs.clone())
        }
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(tee))
        .init();

    if config.server.debug {
        warn!("debug mode enabled");
    }
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(err) => {
                    error!("cannot install SIGTERM handler: {err}");
                    let _ = ctrl_c.await;
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
