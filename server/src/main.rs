use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use faktory::server::ShutdownHandle;
use faktory::{Server, telemetry};
use faktory_config::{CliOverrides, ServerOptions};

#[derive(Parser)]
#[command(name = "faktory")]
#[command(about = "Persistent background job server", long_about = None)]
#[command(disable_version_flag = true)]
struct Cli {
    /// Address to listen on
    #[arg(short = 'b', long)]
    binding: Option<String>,
    #[arg(short = 'e', long)]
    environment: Option<String>,
    #[arg(short = 'l', long)]
    log_level: Option<String>,
    #[arg(short = 'c', long)]
    config_dir: Option<PathBuf>,
    /// Directory holding the job database and backups
    #[arg(short = 'd', long)]
    storage_dir: Option<PathBuf>,
    /// Print the version and exit
    #[arg(short = 'v', long)]
    version: bool,
}

impl From<Cli> for CliOverrides {
    fn from(cli: Cli) -> Self {
        CliOverrides {
            binding: cli.binding,
            environment: cli.environment,
            log_level: cli.log_level,
            config_dir: cli.config_dir,
            storage_dir: cli.storage_dir,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.version {
        println!("faktory {}", faktory::VERSION);
        return Ok(());
    }

    let overrides = CliOverrides::from(cli);
    telemetry::init_tracing(overrides.log_level(), overrides.is_production());
    let options = ServerOptions::resolve(overrides)?;
    tracing::info!(
        version = faktory::VERSION,
        storage_dir = %options.storage_dir.display(),
        "starting faktory"
    );

    let server = Arc::new(Server::new(options)?);
    tokio::spawn(watch_signals(server.shutdown_handle()));
    server.run().await
}

async fn watch_signals(handle: ShutdownHandle) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let signals = (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
            signal(SignalKind::hangup()),
        );
        match signals {
            (Ok(mut sigint), Ok(mut sigterm), Ok(mut sighup)) => loop {
                tokio::select! {
                    _ = sigint.recv() => break,
                    _ = sigterm.recv() => break,
                    _ = sighup.recv() => tracing::info!("SIGHUP received, reload is not supported"),
                }
            },
            _ => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("shutdown requested");
    handle.shutdown();
}
