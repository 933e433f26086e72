//! REST client for the CoAP device registry
//!
//! The device registry exposes managed endpoints and their CoAP resources over
//! REST and pushes events to a single webhook. This crate covers the calls the
//! bridge needs: resource subscriptions, discovery, resource operations and
//! webhook management.
//!
//! Two webhook schemes exist on the registry side:
//!
//! - [`AuthScheme::Basic`]: the legacy domain-scoped API, basic credentials and
//!   a `push-url` that can be overwritten but never deleted.
//! - [`AuthScheme::SharedSecretCallback`]: the `v2` API, bearer API key and a
//!   callback registration carrying an `Authentication` header that the registry
//!   echoes on every delivery.

mod error;
mod http;

pub use error::RegistryError;
pub use http::HttpRegistryClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Key the registry puts in a dispatch response when the result will arrive
/// later in an `async-responses` webhook batch.
pub const ASYNC_RESPONSE_MARKER: &str = "async-response-id";

/// Webhook scheme, which also selects the registry API flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthScheme {
    /// Legacy push-url with basic credentials
    Basic,
    /// v2 callback with an `Authentication` header
    SharedSecretCallback,
}

impl AuthScheme {
    /// Whether inbound deliveries carry a header that can be checked.
    pub fn is_validatable(&self) -> bool {
        matches!(self, AuthScheme::SharedSecretCallback)
    }

    /// Whether the callback must be re-created to refresh its header even when
    /// the URL is already correct.
    pub fn requires_header_refresh(&self) -> bool {
        matches!(self, AuthScheme::SharedSecretCallback)
    }
}

impl fmt::Display for AuthScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthScheme::Basic => write!(f, "basic"),
            AuthScheme::SharedSecretCallback => write!(f, "shared-secret-callback"),
        }
    }
}

/// CoAP verb of a resource operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoapVerb {
    Get,
    Put,
    Post,
    Delete,
}

impl CoapVerb {
    /// Parse a verb case-insensitively.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "get" => Some(CoapVerb::Get),
            "put" => Some(CoapVerb::Put),
            "post" => Some(CoapVerb::Post),
            "delete" | "del" => Some(CoapVerb::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CoapVerb::Get => "get",
            CoapVerb::Put => "put",
            CoapVerb::Post => "post",
            CoapVerb::Delete => "delete",
        }
    }
}

impl fmt::Display for CoapVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status and body of one registry call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryResponse {
    pub status: u16,
    pub body: String,
}

impl RegistryResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// 2xx status
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 429: the endpoint is in queue mode and not reachable right now.
    pub fn is_endpoint_unavailable(&self) -> bool {
        self.status == 429
    }

    /// Whether the body carries the async-response marker.
    ///
    /// Detection is a literal search for the quoted key, so it also matches
    /// bodies that are not otherwise valid JSON.
    pub fn has_async_marker(&self) -> bool {
        self.body.contains(&format!("\"{ASYNC_RESPONSE_MARKER}\""))
    }

    /// The async-response id, when the body is a JSON object carrying one.
    pub fn async_response_id(&self) -> Option<String> {
        if !self.has_async_marker() {
            return None;
        }
        let parsed: serde_json::Value = serde_json::from_str(&self.body).ok()?;
        parsed
            .get(ASYNC_RESPONSE_MARKER)
            .and_then(|id| id.as_str())
            .map(str::to_string)
    }
}

/// Connection settings for [`HttpRegistryClient`].
#[derive(Debug, Clone)]
pub struct RegistryClientConfig {
    /// Base URL of the registry, e.g. `https://api.registry.example.com`
    pub base_url: String,
    /// Webhook scheme and API flavour
    pub scheme: AuthScheme,
    /// API key, sent as a bearer token with the callback scheme
    pub api_key: Option<String>,
    /// Basic credentials for the legacy scheme
    pub username: Option<String>,
    pub password: Option<String>,
    /// Append `sync=true` to subscription and operation URLs. The registry
    /// interprets this flag; the client only passes it through.
    pub use_sync_param: bool,
    /// Per-request timeout
    pub request_timeout: Duration,
}

impl Default for RegistryClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.connector.mbed.com".to_string(),
            scheme: AuthScheme::SharedSecretCallback,
            api_key: None,
            username: None,
            password: None,
            use_sync_param: false,
            request_timeout: Duration::from_secs(15),
        }
    }
}

/// Operations the bridge performs against the device registry.
///
/// Every method returns the raw status and body on any HTTP answer, including
/// non-2xx ones; `Err` is reserved for transport failures and answers that
/// cannot be read at all.
#[async_trait]
pub trait DeviceRegistryClient: Send + Sync {
    /// Start observing `uri` on `endpoint`.
    async fn subscribe(
        &self,
        domain: &str,
        endpoint: &str,
        uri: &str,
    ) -> Result<RegistryResponse, RegistryError>;

    /// Stop observing `uri` on `endpoint`.
    async fn unsubscribe(
        &self,
        domain: &str,
        endpoint: &str,
        uri: &str,
    ) -> Result<RegistryResponse, RegistryError>;

    /// Ask whether the registry still holds the subscription (2xx means yes).
    async fn check_subscription(
        &self,
        domain: &str,
        endpoint: &str,
        uri: &str,
    ) -> Result<RegistryResponse, RegistryError>;

    /// List registered endpoints, optionally filtered by endpoint type.
    async fn discover_devices(
        &self,
        domain: &str,
        endpoint_type: Option<&str>,
    ) -> Result<RegistryResponse, RegistryError>;

    /// List the resources of one endpoint.
    async fn discover_resources(
        &self,
        domain: &str,
        endpoint: &str,
    ) -> Result<RegistryResponse, RegistryError>;

    /// Perform a CoAP operation on a resource.
    async fn dispatch_operation(
        &self,
        domain: &str,
        verb: CoapVerb,
        endpoint: &str,
        uri: &str,
        value: Option<&str>,
    ) -> Result<RegistryResponse, RegistryError>;

    /// Install `url` as the webhook target, with the authentication header
    /// when the scheme carries one.
    async fn install_callback(
        &self,
        url: &str,
        authentication: Option<&str>,
    ) -> Result<RegistryResponse, RegistryError>;

    /// Delete the webhook registration.
    async fn reset_callback(&self) -> Result<RegistryResponse, RegistryError>;

    /// URL currently installed on the registry, `None` when nothing is.
    async fn get_callback(&self) -> Result<Option<String>, RegistryError>;
}
