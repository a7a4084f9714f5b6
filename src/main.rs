mod api;
mod bridge;
mod config;
mod error;
mod eventlog;
mod flow;
mod integration;
mod loader;
mod pluggy;
mod sdk;
mod server;
mod status;
#[cfg(test)]
mod testing;
mod vendor;
mod widget;

use crate::config::AppConfig;
use crate::error::ConnectError;
use crate::server::AppState;
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "financefly-connector", version, about = "Pluggy Connect host for FinanceFly")]
struct Cli {
    /// TOML file applied before environment overrides.
    #[arg(long, env = "FINANCEFLY_CONFIG", global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the connect page (default).
    Serve,
    /// Validate configuration and exit.
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => AppConfig::from_file_and_env(path)?,
        None => AppConfig::from_env()?,
    };

    match cli.command.unwrap_or(Command::Serve) {
        Command::CheckConfig => {
            config.validate()?;
            tracing::info!(?config, "configuration ok");
            Ok(())
        }
        Command::Serve => serve(config).await,
    }
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let invalid = config.validate().err();
    let addr: SocketAddr = config.bind_addr;
    let state = AppState::from_config(config).context("failed to wire connector")?;
    if let Some(err) = invalid {
        // keep serving so the page can show what is wrong
        tracing::error!(%err, "starting with invalid configuration");
        let err = ConnectError::Config(err.to_string());
        state.log.error(err.to_string());
        state.status.error(err.user_label());
    }

    tracing::info!(%addr, "starting financefly-connector");
    server::run(addr, state)
        .await
        .context("connect server stopped")
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
