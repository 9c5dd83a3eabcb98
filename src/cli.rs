//! CLI surface (§10 ambient stack).
//!
//! Deliberately tiny: an operator of this one service needs a way to start
//! it and a way to probe it from a container liveness check, nothing more.
//! The subcommand and the env-var-backed settings are parsed together by
//! `Config` (see `config.rs`) so argv is only ever parsed once.

use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::{Commands, Config};

pub async fn run() -> Result<()> {
    let config = Config::load()?;
    match config.command.clone().unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Healthcheck => healthcheck(config).await,
    }
}

async fn serve(config: Config) -> Result<()> {
    crate::server::start(config).await
}

async fn healthcheck(config: Config) -> Result<()> {
    match tokio::time::timeout(Duration::from_secs(2), tokio::net::TcpStream::connect(&config.bind_addr)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => anyhow::bail!("healthcheck connect failed: {e}"),
        Err(_) => anyhow::bail!("healthcheck connect timed out"),
    }
    .context("healthcheck failed")
}
