#![forbid(unsafe_code)]

//! # Shellbridge gateway
//!
//! Serves the websocket gateway described by a TOML configuration file.
//!
//! ```bash
//! shellbridge --config shellbridge.toml
//! RUST_LOG=shellbridge=debug shellbridge --listen 127.0.0.1:3001 --log-format json
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use shellbridge::{GatewayAdapter, GatewayConfig, RusshConnector, StaticDeviceDirectory};

/// Websocket gateway to device shells and SFTP.
#[derive(Parser, Debug, Clone)]
#[command(name = "shellbridge", author, version, about)]
struct Cli {
    /// Path to the TOML configuration file
    ///
    /// Built-in defaults are used when omitted
    #[arg(long, short = 'c', env = "SHELLBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on, overriding the configuration
    #[arg(long, short = 'l', env = "SHELLBRIDGE_LISTEN")]
    listen: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", env = "SHELLBRIDGE_LOG_FORMAT")]
    log_format: LogFormat,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let mut config = match &cli.config {
        Some(path) => GatewayConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => GatewayConfig::default(),
    };
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    config.validate().context("invalid configuration")?;

    tracing::info!(
        listen = %config.listen,
        devices = config.devices.len(),
        staging_dir = %config.staging_dir.display(),
        "Starting shellbridge"
    );

    let directory = Arc::new(StaticDeviceDirectory::from_records(config.devices.clone()));
    let adapter = Arc::new(GatewayAdapter::from_config(
        &config,
        directory,
        Arc::new(RusshConnector::new()),
    ));

    shellbridge::gateway::serve(&config, adapter)
        .await
        .context("gateway server failed")?;
    Ok(())
}
