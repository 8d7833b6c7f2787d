//! Approval Daemon - multi-step approval workflows over REST
//!
//! The daemon provides:
//! - REST API for workflow definitions and approval instances
//! - Escalation sweeping for overdue steps
//! - A tamper-evident compliance log

use anyhow::Context;
use approval_daemon::{DaemonConfig, Server};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Approval Daemon CLI
#[derive(Parser)]
#[command(name = "approvald")]
#[command(about = "Approval Daemon - multi-step approval workflow service", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "APPROVALS_CONFIG")]
    config: Option<String>,

    /// Listen address, overrides the configuration file
    #[arg(short, long, env = "APPROVALS_LISTEN_ADDR")]
    listen: Option<String>,

    /// Identity seed document (JSON)
    #[arg(long, env = "APPROVALS_IDENTITY_SEED")]
    seed: Option<String>,

    /// Log level
    #[arg(long, env = "APPROVALS_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "APPROVALS_LOG_JSON")]
    json: bool,

    /// Run the escalation sweeper
    #[arg(long, env = "APPROVALS_SWEEP")]
    sweep: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config =
        DaemonConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    // Override with CLI args
    if let Some(listen) = &cli.listen {
        config.server.listen_addr = listen
            .parse()
            .with_context(|| format!("invalid listen address: {listen}"))?;
    }
    if let Some(seed) = cli.seed {
        config.identity.seed_path = Some(seed);
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    config.logging.json |= cli.json;
    config.escalation.enabled |= cli.sweep;

    // Initialize tracing
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into());

    if config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.server.listen_addr,
        sweeper = config.escalation.enabled,
        "Starting approval daemon"
    );

    let server = Server::new(config).await?;
    server.run().await?;
    Ok(())
}
