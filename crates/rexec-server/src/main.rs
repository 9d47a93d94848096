use anyhow::{Context, Result};
use clap::Parser;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use rexec_server::config::{Cli, Command, ServerConfig};
use rexec_server::{AuditLog, Supervisor, issue_token};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ServerConfig::load(&cli)?;

    if let Some(Command::Token { subject, ttl_secs }) = &cli.command {
        let token = issue_token(&config.auth_secret, subject, Duration::from_secs(*ttl_secs))
            .context("failed to sign credential")?;
        println!("{token}");
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_filter.as_str().into()),
        )
        .init();

    tracing::debug!(?config, "configuration loaded");
    let server = Supervisor::start(&config, AuditLog::tracing()).await?;
    server.run_until_signal().await
}
