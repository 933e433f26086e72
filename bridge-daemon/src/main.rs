use anyhow::{Context, Result};
use bridge_core::{BridgeConfig, Orchestrator, RouterBinding};
use clap::Parser;
use registry_client::HttpRegistryClient;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use webhook_server::{WebhookPayload, WebhookServer, WebhookServerConfig};

pub mod logging;
pub mod settings;

use logging::LoggingMode;
use settings::Args;

const FORWARDER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mode = match args.log_mode {
        Some(mode) => mode,
        None => logging::mode_from_env(LoggingMode::Development)?,
    };
    logging::init_logging(mode)?;

    let config = settings::resolve(&args)?;
    if args.check {
        info!(
            routers = config.routers.len(),
            "configuration {} is valid",
            args.config.display()
        );
        return Ok(());
    }

    run(config).await
}

/// Start the webhook listener and the orchestrator, then forward deliveries
/// until Ctrl+C.
async fn run(mut config: BridgeConfig) -> Result<()> {
    let (payload_tx, mut payload_rx) = mpsc::unbounded_channel::<WebhookPayload>();

    let bind_address: IpAddr = config
        .webhook
        .bind_address
        .parse()
        .with_context(|| format!("Invalid webhook.bind_address '{}'", config.webhook.bind_address))?;
    let server = WebhookServer::new(
        WebhookServerConfig {
            port_range: config.webhook.port_range,
            bind_address,
            advertised_base_url: config.webhook.advertised_base_url.clone(),
        },
        payload_tx,
    )
    .await
    .context("Failed to start webhook server")?;
    server.router().register(config.webhook.path.clone()).await;

    let callback_url = match &config.webhook.callback_url {
        Some(url) => url.clone(),
        None => server.callback_url(&config.webhook.path),
    };
    config.webhook.callback_url = Some(callback_url.clone());
    info!(port = server.port(), callback_url = %callback_url, "webhook listener ready");

    let client = HttpRegistryClient::new(config.registry.client_config())
        .context("Failed to build registry client")?;
    let bindings = config
        .routers
        .iter()
        .cloned()
        .map(|router| RouterBinding::from_config(router, &config.registry.default_domain))
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to set up routers")?;

    let orchestrator = Arc::new(
        Orchestrator::new(config, Arc::new(client), bindings)
            .context("Failed to build orchestrator")?,
    );
    orchestrator.start().await;
    info!(routers = orchestrator.routers().len(), "bridge running, press Ctrl+C to stop");

    let forwarder = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            while let Some(payload) = payload_rx.recv().await {
                let accepted = orchestrator
                    .handle_webhook(payload.authentication.as_deref(), &payload.body)
                    .await;
                if !accepted {
                    warn!(request_id = %payload.request_id, "webhook delivery rejected");
                }
            }
        })
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("shutdown requested");

    if let Err(e) = orchestrator.shutdown().await {
        error!("orchestrator shutdown failed: {}", e);
    }
    if let Err(e) = server.shutdown().await {
        warn!("webhook server shutdown failed: {}", e);
    }
    // The server owned the sender, so the forwarder ends once it drains.
    match tokio::time::timeout(FORWARDER_DRAIN_TIMEOUT, forwarder).await {
        Ok(Err(e)) => warn!("webhook forwarder ended abnormally: {}", e),
        Ok(Ok(())) => {}
        Err(_) => warn!("webhook forwarder did not drain in time"),
    }

    info!("bridge stopped");
    Ok(())
}
