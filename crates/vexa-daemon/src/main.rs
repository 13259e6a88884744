//! vexa-daemon - HTTP API for Vexa integrations.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use vexa_core::config::VexaConfig;
use vexa_core::credentials::AdminSecret;
use vexa_core::db::Database;
use vexa_daemon::{AppState, router};

/// vexa-daemon - credit-metered HTTP API
#[derive(Parser, Debug)]
#[command(name = "vexa-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "vexa.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log file path (logs to stdout if not specified)
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Listen address, overriding the configuration file
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let mut config = if args.config.exists() {
        VexaConfig::from_file(&args.config).context("failed to load configuration")?
    } else {
        info!(path = %args.config.display(), "configuration file not found, using defaults");
        VexaConfig::default()
    };
    if let Some(listen) = args.listen {
        config.api.listen_addr = listen;
    }

    let admin_secret = AdminSecret::from_env(&config.api.admin_secret_env);
    if !admin_secret.is_configured() {
        warn!(
            env = %config.api.admin_secret_env,
            "administrative secret not set, admin routes are disabled"
        );
    }

    let db = Database::open(&config.database).context("failed to open database")?;
    let state = AppState::new(db, &config.api, admin_secret).context("failed to prepare schema")?;

    let listener = tokio::net::TcpListener::bind(&config.api.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.api.listen_addr))?;
    info!(addr = %config.api.listen_addr, db = %config.database.path.display(), "API server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server error")?;

    info!("API server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
