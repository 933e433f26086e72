//! Fan-out hub wiring one webhook source to every configured router.

use registry_client::DeviceRegistryClient;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::api::RegistryApi;
use crate::backend::{build_backend, Backend};
use crate::batch::{Registration, ResourceInfo};
use crate::config::{BridgeConfig, RouterConfig};
use crate::correlator::AsyncResponseCorrelator;
use crate::error::{ConfigError, Result};
use crate::gateway::WebhookGateway;
use crate::registrar::{DeviceRegistrar, StaticRegistrar};
use crate::router::NotificationRouter;
use crate::subscriptions::SubscriptionRegistry;
use crate::transport::{MqttTransportFactory, TransportFactory};
use crate::validator::{ValidatorHandle, WebhookValidator};

/// Everything a router needs besides the shared registry API.
pub struct RouterBinding {
    pub config: RouterConfig,
    pub backend: Arc<dyn Backend>,
    pub registrar: Arc<dyn DeviceRegistrar>,
    pub factory: Arc<dyn TransportFactory>,
}

impl RouterBinding {
    /// Backend chosen by the config, a [`StaticRegistrar`] and MQTT transports.
    pub fn from_config(config: RouterConfig, default_domain: &str) -> Result<Self> {
        let backend = build_backend(&config, default_domain);
        let registrar = Arc::new(StaticRegistrar::from_config(&config.mqtt)?);
        let factory = Arc::new(MqttTransportFactory::new(config.mqtt.clone()));
        Ok(Self {
            config,
            backend,
            registrar,
            factory,
        })
    }
}

/// Owns the shared registry API, the webhook gateway, the validator and one
/// router per configured backend.
///
/// # Example
///
/// ```rust,no_run
/// use bridge_core::{BridgeConfig, Orchestrator, RouterBinding, RouterConfig};
/// use registry_client::HttpRegistryClient;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = BridgeConfig::new()
///     .with_registry("https://registry.example.com", "api-key")
///     .with_callback_url("http://203.0.113.7:28519/notify")
///     .with_router(RouterConfig::default());
///
/// let client = Arc::new(HttpRegistryClient::new(config.registry.client_config())?);
/// let bindings = config
///     .routers
///     .iter()
///     .cloned()
///     .map(|router| RouterBinding::from_config(router, &config.registry.default_domain))
///     .collect::<Result<Vec<_>, _>>()?;
///
/// let orchestrator = Orchestrator::new(config, client, bindings)?;
/// orchestrator.start().await;
/// # Ok(())
/// # }
/// ```
pub struct Orchestrator {
    config: BridgeConfig,
    api: Arc<RegistryApi>,
    gateway: Arc<WebhookGateway>,
    validator: Arc<WebhookValidator>,
    routers: Vec<Arc<NotificationRouter>>,
    validator_handle: Mutex<Option<ValidatorHandle>>,
}

impl Orchestrator {
    /// The configuration must carry the externally reachable callback URL.
    pub fn new(
        config: BridgeConfig,
        client: Arc<dyn DeviceRegistryClient>,
        bindings: Vec<RouterBinding>,
    ) -> Result<Self> {
        config.validate()?;
        let expected_url = config
            .webhook
            .callback_url
            .clone()
            .ok_or(ConfigError::Missing("webhook.callback_url"))?;

        let subscriptions = Arc::new(SubscriptionRegistry::new(
            config.registry.default_domain.clone(),
        ));
        let correlator = Arc::new(AsyncResponseCorrelator::new(
            config.validator.async_response_ttl(),
        ));
        let api = Arc::new(RegistryApi::new(client.clone(), subscriptions, correlator));
        let gateway = Arc::new(WebhookGateway::new(
            client,
            &config.registry,
            &config.webhook,
            expected_url,
        ));
        let validator = Arc::new(WebhookValidator::new(
            gateway.clone(),
            api.clone(),
            config.validator.clone(),
        ));

        let routers = bindings
            .into_iter()
            .map(|binding| {
                NotificationRouter::new(
                    &binding.config,
                    binding.backend,
                    binding.registrar,
                    binding.factory,
                    api.clone(),
                )
            })
            .collect();

        Ok(Self {
            config,
            api,
            gateway,
            validator,
            routers,
            validator_handle: Mutex::new(None),
        })
    }

    /// Install the webhook, open shared connections, sync already registered
    /// endpoints and start the validator.
    ///
    /// Failures here are not fatal; the validator repairs the webhook and
    /// subscriptions on its next cycle.
    pub async fn start(&self) {
        if !self.gateway.install(self.gateway.expected_url()).await {
            tracing::warn!("initial webhook install failed, validator will retry");
        }

        for router in &self.routers {
            if !router.start().await {
                tracing::error!(router = router.name(), "router could not open its broker connection");
            }
        }

        if self.config.registry.sync_on_start {
            let synced = self.sync_endpoints().await;
            tracing::info!(synced, "registered endpoints synced");
        }

        if self.config.validator.enabled {
            let handle = self.validator.clone().start();
            *self.validator_handle.lock().await = Some(handle);
            tracing::info!(
                interval_secs = self.config.validator.interval_secs,
                "webhook validator started"
            );
        }
    }

    /// Replay every endpoint already registered on the registry as a
    /// registration. Returns how many endpoints were found.
    pub async fn sync_endpoints(&self) -> usize {
        let endpoints = self.api.registered_endpoints(None).await;
        for (name, endpoint_type) in &endpoints {
            let resources: Vec<ResourceInfo> = self
                .api
                .endpoint_details(None, name)
                .await
                .and_then(|details| serde_json::from_value(details).ok())
                .unwrap_or_default();
            let registration = Registration {
                ep: name.clone(),
                ept: endpoint_type.clone(),
                resources,
            };
            for router in &self.routers {
                router
                    .process_registrations(std::slice::from_ref(&registration))
                    .await;
            }
        }
        endpoints.len()
    }

    /// Process one webhook delivery. Returns whether it was accepted.
    ///
    /// The HTTP layer acknowledges every delivery regardless of the result.
    pub async fn handle_webhook(&self, authentication: Option<&str>, body: &str) -> bool {
        if !self.gateway.validate_inbound(authentication) {
            return false;
        }
        let Some(batch) = self.gateway.decode_batch(body) else {
            return false;
        };
        if batch.is_empty() {
            tracing::debug!("empty webhook batch");
            return true;
        }

        for router in &self.routers {
            router.process_batch(&batch).await;
        }
        for event in &batch.async_responses {
            self.api.correlator().resolve(event).await;
        }
        true
    }

    /// Stop the validator and close every broker connection.
    pub async fn shutdown(&self) -> Result<()> {
        let handle = self.validator_handle.lock().await.take();
        let result = match handle {
            Some(handle) => handle.shutdown().await,
            None => Ok(()),
        };

        for router in &self.routers {
            router.shutdown().await;
        }
        result
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn api(&self) -> &Arc<RegistryApi> {
        &self.api
    }

    pub fn gateway(&self) -> &Arc<WebhookGateway> {
        &self.gateway
    }

    pub fn validator(&self) -> &Arc<WebhookValidator> {
        &self.validator
    }

    pub fn routers(&self) -> &[Arc<NotificationRouter>] {
        &self.routers
    }

    pub fn router(&self, name: &str) -> Option<&Arc<NotificationRouter>> {
        self.routers.iter().find(|r| r.name() == name)
    }
}
