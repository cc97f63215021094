use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use containap::config::ConfigStore;
use containap::docker::{ContainerCtl, DockerCli};
use containap::events::EventBus;
use containap::proxy;

/// Wake-on-login proxy for containerized Minecraft servers
#[derive(Parser)]
#[command(name = "containap")]
struct Cli {
    /// Path to the proxy configuration file
    #[arg(long, default_value = "config/containap.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Front all configured servers, starting their containers on demand
    Run,
    /// Stop a managed server's container immediately
    Stop {
        /// Server id from the configuration file
        server_id: String,
    },
    /// Run a command inside a managed server's container
    Exec {
        /// Server id from the configuration file
        server_id: String,
        /// Command and arguments to run
        #[arg(num_args(1..))]
        argv: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let cli = Cli::parse();
    let store = Arc::new(ConfigStore::load(&cli.config)?);
    let ctl: Arc<dyn ContainerCtl> = Arc::new(DockerCli::new());

    match cli.command {
        Commands::Run => {
            let events = EventBus::new();
            let shutdown = CancellationToken::new();
            tokio::spawn({
                let shutdown = shutdown.clone();
                async move {
                    wait_for_shutdown_signal().await;
                    log::info!("Shutdown signal received");
                    shutdown.cancel();
                }
            });
            proxy::run(store, ctl, events, shutdown).await?;
            // short grace for in-flight sessions to notice the cancel
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        Commands::Stop { server_id } => {
            let cfg = find_server(&store, &server_id)?;
            ctl.stop(&cfg.container_name, Duration::from_secs(30)).await?;
        }
        Commands::Exec { server_id, argv } => {
            let cfg = find_server(&store, &server_id)?;
            let output = ctl.exec(&cfg.container_name, &argv).await?;
            print!("{}", output);
        }
    }
    Ok(())
}

fn find_server(store: &ConfigStore, server_id: &str) -> Result<containap::config::ServerConfig> {
    store
        .snapshot()
        .servers
        .iter()
        .find(|cfg| cfg.id == server_id)
        .cloned()
        .with_context(|| format!("no server '{}' in configuration", server_id))
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            log::error!("Cannot install SIGTERM handler: {}", err);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
