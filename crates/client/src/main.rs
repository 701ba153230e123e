//! devshell
//!
//! Interactive remote shell to a device daemon.

use std::path::PathBuf;

use clap::Parser;
use client::config::Config;
use client::driver;
use tracing_subscriber::EnvFilter;

/// devshell - interactive shell on a remote device.
#[derive(Parser, Debug)]
#[command(name = "devshell")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Device host, overrides the configuration
    #[arg(long)]
    pub host: Option<String>,

    /// Device port, overrides the configuration
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Service to open, e.g. "shell:" or "shell:logcat"
    #[arg(short, long)]
    pub service: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let loaded = match &cli.config {
        Some(path) => Config::load(path),
        None => Config::load_default(),
    };
    let mut config = match loaded {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    };

    // Logs go to stderr so they never mix with relayed output.
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        std::env::var("DEVSHELL_LOG_LEVEL")
            .ok()
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| config.logging.log_level.clone())
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Some(path) = &cli.config {
        tracing::debug!("Using config file: {:?}", path);
    }
    config.apply_env_overrides();
    if let Some(host) = cli.host {
        config.remote.host = host;
    }
    if let Some(port) = cli.port {
        config.remote.port = port;
    }
    if let Some(service) = cli.service {
        config.relay.service = service;
    }

    let outcome = match driver::run(&config).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    std::process::exit(driver::exit_code(&outcome));
}
