//! DBSentinel daemon entry point
//!
//! Polls the configured data source until SIGINT or SIGTERM, then flushes
//! lock history and prints a summary.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dbsentinel_monitor::{config::MonitorConfig, scheduler::Monitor};

/// DBSentinel database health monitor
#[derive(Parser)]
#[command(name = "dbsentinel")]
#[command(about = "Database health monitoring and alerting daemon")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level, overriding `logging.level`
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long)]
    json_logs: bool,

    /// Validate the configuration, print the effective settings and exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = match &cli.config {
        Some(path) => Some(path.clone()),
        None => MonitorConfig::default_config_path()
            .ok()
            .filter(|path| path.exists()),
    };
    let config = MonitorConfig::load(config_path.as_deref()).context("Failed to load configuration")?;

    initialize_logging(&cli, &config)?;

    if cli.check_config {
        let rendered = toml::to_string_pretty(&config).context("Failed to render configuration")?;
        println!("{}", rendered);
        return Ok(());
    }

    match &config_path {
        Some(path) => info!("Loaded configuration from: {}", path.display()),
        None => info!("Using default configuration"),
    }

    let monitor = Monitor::from_config(config);
    let token = CancellationToken::new();

    let shutdown = token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown().await {
            tracing::error!("Failed to install signal handlers: {}", e);
        }
        shutdown.cancel();
    });

    let summary = monitor.run(token).await.context("Monitor stopped with an error")?;
    println!("{}", summary);
    Ok(())
}

/// Initialize logging
fn initialize_logging(cli: &Cli, config: &MonitorConfig) -> Result<()> {
    let requested = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    let log_level = match requested.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("dbsentinel_monitor={}", log_level).parse()?)
        .add_directive(format!("dbsentinel={}", log_level).parse()?)
        .add_directive("hyper=warn".parse()?)
        .add_directive("reqwest=warn".parse()?);

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false))
            .init();
    }

    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn wait_for_shutdown() -> std::io::Result<()> {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }

    Ok(())
}
