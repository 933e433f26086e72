//! Registry-facing API shared by every router.
//!
//! Wraps a [`DeviceRegistryClient`] together with the bridge state that all
//! routers and the validator share: the tracked subscriptions and the async
//! response correlator. Transport failures are logged here and surface as
//! `None`/`false`, so callers simply try again on the next cycle.

use registry_client::{CoapVerb, DeviceRegistryClient, RegistryResponse};
use std::sync::Arc;

use crate::correlator::AsyncResponseCorrelator;
use crate::subscriptions::SubscriptionRegistry;

pub struct RegistryApi {
    client: Arc<dyn DeviceRegistryClient>,
    subscriptions: Arc<SubscriptionRegistry>,
    correlator: Arc<AsyncResponseCorrelator>,
}

impl RegistryApi {
    pub fn new(
        client: Arc<dyn DeviceRegistryClient>,
        subscriptions: Arc<SubscriptionRegistry>,
        correlator: Arc<AsyncResponseCorrelator>,
    ) -> Self {
        Self {
            client,
            subscriptions,
            correlator,
        }
    }

    pub fn client(&self) -> &Arc<dyn DeviceRegistryClient> {
        &self.client
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionRegistry> {
        &self.subscriptions
    }

    pub fn correlator(&self) -> &Arc<AsyncResponseCorrelator> {
        &self.correlator
    }

    pub fn default_domain(&self) -> &str {
        self.subscriptions.default_domain()
    }

    pub async fn subscribe(
        &self,
        domain: Option<&str>,
        endpoint: &str,
        uri: &str,
    ) -> Option<RegistryResponse> {
        let domain = self.subscriptions.resolve_domain(domain);
        match self.client.subscribe(domain, endpoint, uri).await {
            Ok(response) => {
                if !response.is_success() {
                    tracing::warn!(
                        domain,
                        endpoint,
                        uri,
                        status = response.status,
                        "subscribe rejected"
                    );
                }
                Some(response)
            }
            Err(e) => {
                tracing::error!(domain, endpoint, uri, error = %e, "subscribe failed");
                None
            }
        }
    }

    pub async fn unsubscribe(
        &self,
        domain: Option<&str>,
        endpoint: &str,
        uri: &str,
    ) -> Option<RegistryResponse> {
        let domain = self.subscriptions.resolve_domain(domain);
        match self.client.unsubscribe(domain, endpoint, uri).await {
            Ok(response) => Some(response),
            Err(e) => {
                tracing::error!(domain, endpoint, uri, error = %e, "unsubscribe failed");
                None
            }
        }
    }

    /// Whether the registry still holds the subscription. Errors count as no.
    pub async fn check_subscription(&self, domain: Option<&str>, endpoint: &str, uri: &str) -> bool {
        let domain = self.subscriptions.resolve_domain(domain);
        match self.client.check_subscription(domain, endpoint, uri).await {
            Ok(response) => response.is_success(),
            Err(e) => {
                tracing::warn!(domain, endpoint, uri, error = %e, "subscription check failed");
                false
            }
        }
    }

    pub async fn discover_devices(
        &self,
        domain: Option<&str>,
        endpoint_type: Option<&str>,
    ) -> Option<RegistryResponse> {
        let domain = self.subscriptions.resolve_domain(domain);
        match self.client.discover_devices(domain, endpoint_type).await {
            Ok(response) => Some(response),
            Err(e) => {
                tracing::error!(domain, error = %e, "endpoint discovery failed");
                None
            }
        }
    }

    pub async fn discover_resources(
        &self,
        domain: Option<&str>,
        endpoint: &str,
    ) -> Option<RegistryResponse> {
        let domain = self.subscriptions.resolve_domain(domain);
        match self.client.discover_resources(domain, endpoint).await {
            Ok(response) => Some(response),
            Err(e) => {
                tracing::error!(domain, endpoint, error = %e, "resource discovery failed");
                None
            }
        }
    }

    /// Resource discovery body of an endpoint as JSON, `None` when the call
    /// fails or the body is not JSON.
    pub async fn endpoint_details(
        &self,
        domain: Option<&str>,
        endpoint: &str,
    ) -> Option<serde_json::Value> {
        let response = self.discover_resources(domain, endpoint).await?;
        if !response.is_success() {
            tracing::debug!(endpoint, status = response.status, "no resource details");
            return None;
        }
        match serde_json::from_str(&response.body) {
            Ok(details) => Some(details),
            Err(e) => {
                tracing::warn!(endpoint, error = %e, "resource details could not be parsed");
                None
            }
        }
    }

    /// Names and types of all registered endpoints, used for the startup sync.
    pub async fn registered_endpoints(&self, domain: Option<&str>) -> Vec<(String, Option<String>)> {
        #[derive(serde::Deserialize)]
        struct Listed {
            name: String,
            #[serde(default, rename = "type")]
            endpoint_type: Option<String>,
        }

        let Some(response) = self.discover_devices(domain, None).await else {
            return Vec::new();
        };
        if !response.is_success() {
            tracing::warn!(status = response.status, "endpoint listing rejected");
            return Vec::new();
        }
        match serde_json::from_str::<Vec<Listed>>(&response.body) {
            Ok(listed) => listed
                .into_iter()
                .map(|l| (l.name, l.endpoint_type))
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "endpoint listing could not be parsed");
                Vec::new()
            }
        }
    }

    /// Perform a CoAP operation on a resource.
    pub async fn dispatch(
        &self,
        domain: Option<&str>,
        verb: CoapVerb,
        endpoint: &str,
        uri: &str,
        value: Option<&str>,
    ) -> Option<RegistryResponse> {
        let domain = self.subscriptions.resolve_domain(domain);
        match self
            .client
            .dispatch_operation(domain, verb, endpoint, uri, value)
            .await
        {
            Ok(response) => Some(response),
            Err(e) => {
                tracing::error!(domain, %verb, endpoint, uri, error = %e, "resource operation failed");
                None
            }
        }
    }
}
