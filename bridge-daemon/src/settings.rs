//! Command line arguments and configuration loading.

use anyhow::{Context, Result};
use bridge_core::BridgeConfig;
use clap::Parser;
use std::path::{Path, PathBuf};

use crate::logging::LoggingMode;

/// Bridge a CoAP device registry to one or more MQTT brokers.
#[derive(Parser, Debug)]
#[command(name = "coap-bridge")]
#[command(about = "Bridge a CoAP device registry to MQTT brokers")]
#[command(version)]
pub struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "coap-bridge.toml")]
    pub config: PathBuf,

    /// Logging mode (silent, development, debug, json); BRIDGE_LOG_MODE when omitted
    #[arg(long)]
    pub log_mode: Option<LoggingMode>,

    /// Pin the webhook listener to a single port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Validate the configuration and exit
    #[arg(long)]
    pub check: bool,
}

/// Read and parse the configuration file.
pub fn load_config(path: &Path) -> Result<BridgeConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    parse_config(&text).with_context(|| format!("Invalid config file {}", path.display()))
}

pub fn parse_config(text: &str) -> Result<BridgeConfig> {
    toml::from_str(text).context("Failed to parse TOML")
}

/// Apply `BRIDGE_*` overrides on top of the file contents.
///
/// `lookup` is `std::env::var` in production; tests pass a map.
pub fn apply_env_overrides<F>(config: &mut BridgeConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(port) = lookup("BRIDGE_WEBHOOK_PORT") {
        let port: u16 = port
            .parse()
            .context("Invalid BRIDGE_WEBHOOK_PORT environment variable")?;
        config.webhook.port_range = (port, port);
    }

    if let Some(url) = lookup("BRIDGE_CALLBACK_URL") {
        config.webhook.callback_url = Some(url);
    }

    if let Some(key) = lookup("BRIDGE_API_KEY") {
        config.registry.api_key = Some(key);
    }

    if let Some(url) = lookup("BRIDGE_REGISTRY_URL") {
        config.registry.base_url = url;
    }

    Ok(())
}

/// Load, override and validate in one step.
pub fn resolve(args: &Args) -> Result<BridgeConfig> {
    let mut config = load_config(&args.config)?;
    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
    if let Some(port) = args.port {
        config.webhook.port_range = (port, port);
    }
    config.validate().context("Configuration rejected")?;
    Ok(config)
}
