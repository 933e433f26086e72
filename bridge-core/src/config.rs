//! Configuration types for the bridge
//!
//! [`BridgeConfig`] is the root of everything the bridge reads at startup: how
//! to reach the device registry, where the webhook lives, how often the
//! validator runs, and one [`RouterConfig`] per broker backend. Every struct
//! deserializes from TOML with all fields optional.

use registry_client::{AuthScheme, RegistryClientConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigError;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub registry: RegistryConfig,
    pub webhook: WebhookConfig,
    pub validator: ValidatorConfig,
    #[serde(rename = "router")]
    pub routers: Vec<RouterConfig>,
}

/// Device registry connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Base URL of the registry REST API
    pub base_url: String,

    /// Webhook scheme (`basic` or `shared-secret-callback`)
    /// Default: shared-secret-callback
    pub scheme: AuthScheme,

    /// API key; also the input of the webhook authentication hash
    pub api_key: Option<String>,

    /// Basic credentials for the legacy scheme
    pub username: Option<String>,
    pub password: Option<String>,

    /// Domain used whenever an event or command names none
    /// Default: "domain"
    pub default_domain: String,

    /// Append `sync=true` to subscription and operation calls
    /// Default: false
    pub use_sync_param: bool,

    /// Per-request timeout in seconds
    /// Default: 15
    pub request_timeout_secs: u64,

    /// Discover already-registered endpoints at startup and set them up as if
    /// they had just registered
    /// Default: true
    pub sync_on_start: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.connector.mbed.com".to_string(),
            scheme: AuthScheme::SharedSecretCallback,
            api_key: None,
            username: None,
            password: None,
            default_domain: "domain".to_string(),
            use_sync_param: false,
            request_timeout_secs: 15,
            sync_on_start: true,
        }
    }
}

impl RegistryConfig {
    pub fn client_config(&self) -> RegistryClientConfig {
        RegistryClientConfig {
            base_url: self.base_url.clone(),
            scheme: self.scheme,
            api_key: self.api_key.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            use_sync_param: self.use_sync_param,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }
}

/// Webhook receiver and callback registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Port range for the webhook listener (inclusive)
    /// Default: (28519, 28619)
    pub port_range: (u16, u16),

    /// Listen address
    /// Default: "0.0.0.0"
    pub bind_address: String,

    /// Base URL the registry should call, when it differs from the detected
    /// local address (NAT, reverse proxy)
    pub advertised_base_url: Option<String>,

    /// Path deliveries are accepted on
    /// Default: "/notify"
    pub path: String,

    /// Full callback URL. Filled in at startup from the webhook listener when
    /// absent.
    pub callback_url: Option<String>,

    /// Accept deliveries whose authentication header does not match.
    /// Security relevant: leave off unless debugging a hash mismatch.
    /// Default: false
    pub skip_validation: bool,

    /// Extra input mixed into the authentication hash
    pub hash_salt: Option<String>,

    /// URL installed by `reset()` under the basic scheme, which cannot delete
    /// its push URL
    pub legacy_default_url: Option<String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            port_range: (28519, 28619),
            bind_address: "0.0.0.0".to_string(),
            advertised_base_url: None,
            path: "/notify".to_string(),
            callback_url: None,
            skip_validation: false,
            hash_salt: None,
            legacy_default_url: None,
        }
    }
}

/// Self-healing loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Run the validator at all
    /// Default: true
    pub enabled: bool,

    /// Seconds between validation passes
    /// Default: 60
    pub interval_secs: u64,

    /// Attempts per subscription while the endpoint answers 429
    /// Default: 5
    pub max_subscription_attempts: u32,

    /// Pause between 429 retries in milliseconds
    /// Default: 500
    pub subscription_retry_delay_ms: u64,

    /// Seconds a pending async response is kept before it is dropped
    /// Default: 300
    pub async_response_ttl_secs: u64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            max_subscription_attempts: 5,
            subscription_retry_delay_ms: 500,
            async_response_ttl_secs: 300,
        }
    }
}

impl ValidatorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn subscription_retry_delay(&self) -> Duration {
        Duration::from_millis(self.subscription_retry_delay_ms)
    }

    pub fn async_response_ttl(&self) -> Duration {
        Duration::from_secs(self.async_response_ttl_secs)
    }
}

/// One broker backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Name used in logs and shared connection identities
    pub name: String,

    /// Topic layout and connection mode
    pub backend: BackendConfig,

    /// Broker endpoint and credentials
    pub mqtt: MqttConfig,

    /// Subscribe observable resources when an endpoint registers
    /// Default: true
    pub auto_subscribe: bool,

    /// Value for `__DEVICE_TYPE__` when an endpoint's type is unknown
    /// Default: "coap-device"
    pub default_device_type: String,

    /// Pause after each received broker message in milliseconds
    /// Default: 10
    pub receive_loop_interval_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            name: "generic".to_string(),
            backend: BackendConfig::default(),
            mqtt: MqttConfig::default(),
            auto_subscribe: true,
            default_device_type: "coap-device".to_string(),
            receive_loop_interval_ms: 10,
        }
    }
}

impl RouterConfig {
    pub fn receive_loop_interval(&self) -> Duration {
        Duration::from_millis(self.receive_loop_interval_ms)
    }
}

/// Topic layout of a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BackendConfig {
    /// Plain MQTT broker, one shared connection for every endpoint
    Generic {
        /// First topic segment
        #[serde(default = "default_topic_root")]
        topic_root: String,
        /// Segment marking command topics
        #[serde(default = "default_request_tag")]
        request_tag: String,
        /// Observation topic template; derived from the root and default
        /// domain when absent
        #[serde(default)]
        observation_topic: Option<String>,
        /// Wrap published objects under this key
        #[serde(default)]
        envelope_key: Option<String>,
        /// Publish an announcement when an endpoint registers
        #[serde(default = "default_true")]
        announce_registrations: bool,
    },
    /// Cloud IoT broker where each endpoint is its own broker client
    Device {
        /// Command topic filter template
        #[serde(default = "default_device_command_topic")]
        command_topic: String,
        /// Observation topic template
        #[serde(default = "default_device_observation_topic")]
        observation_topic: String,
        /// Command response topic template (`__COMMAND_TYPE__` is the verb)
        #[serde(default = "default_device_response_topic")]
        response_topic: String,
        /// Where GET results go; the response topic when absent
        #[serde(default)]
        reply_topic: Option<String>,
        /// Wrap published objects under this key
        #[serde(default)]
        envelope_key: Option<String>,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Generic {
            topic_root: default_topic_root(),
            request_tag: default_request_tag(),
            observation_topic: None,
            envelope_key: None,
            announce_registrations: true,
        }
    }
}

fn default_topic_root() -> String {
    "mbed".to_string()
}

fn default_request_tag() -> String {
    "request".to_string()
}

fn default_true() -> bool {
    true
}

fn default_device_command_topic() -> String {
    "devices/__EPNAME__/commands/#".to_string()
}

fn default_device_observation_topic() -> String {
    "devices/__EPNAME__/events/__DEVICE_TYPE__".to_string()
}

fn default_device_response_topic() -> String {
    "devices/__EPNAME__/responses/__COMMAND_TYPE__".to_string()
}

/// Broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,

    /// Default: 1883
    pub port: u16,

    /// Client id template; `__EPNAME__` becomes the endpoint name. Shared
    /// connections get a generated id when absent; per-endpoint connections
    /// use the endpoint name.
    pub client_id: Option<String>,

    pub username: Option<String>,
    pub password: Option<String>,

    /// PEM files; a CA certificate switches the connection to TLS
    pub ca_cert_path: Option<String>,
    pub client_cert_path: Option<String>,
    pub client_key_path: Option<String>,

    /// Default: 60
    pub keep_alive_secs: u64,

    /// Seconds to wait for CONNACK
    /// Default: 10
    pub connect_timeout_secs: u64,

    /// Request channel capacity of the client
    /// Default: 10
    pub channel_capacity: usize,

    /// Largest packet accepted or sent, in bytes
    /// Default: 1 MiB
    pub max_packet_size: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: None,
            username: None,
            password: None,
            ca_cert_path: None,
            client_cert_path: None,
            client_key_path: None,
            keep_alive_secs: 60,
            connect_timeout_secs: 10,
            channel_capacity: 10,
            max_packet_size: 1024 * 1024,
        }
    }
}

impl MqttConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl BridgeConfig {
    /// Create a BridgeConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configuration and return the first problem found
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.registry.base_url.trim().is_empty() {
            return Err(ConfigError::Missing("registry.base_url"));
        }

        match self.registry.scheme {
            AuthScheme::SharedSecretCallback if self.registry.api_key.is_none() => {
                return Err(ConfigError::Missing("registry.api_key"));
            }
            AuthScheme::Basic if self.registry.username.is_none() => {
                return Err(ConfigError::Missing("registry.username"));
            }
            _ => {}
        }

        if self.registry.default_domain.trim().is_empty() {
            return Err(ConfigError::Missing("registry.default_domain"));
        }

        if self.webhook.port_range.0 > self.webhook.port_range.1 {
            return Err(ConfigError::invalid(
                "webhook.port_range",
                "start must not be greater than end",
            ));
        }

        if !self.webhook.path.starts_with('/') {
            return Err(ConfigError::invalid("webhook.path", "must start with '/'"));
        }

        if self.validator.enabled && self.validator.interval_secs == 0 {
            return Err(ConfigError::invalid(
                "validator.interval_secs",
                "must be greater than 0",
            ));
        }

        if self.validator.max_subscription_attempts == 0 {
            return Err(ConfigError::invalid(
                "validator.max_subscription_attempts",
                "must be greater than 0",
            ));
        }

        if self.routers.is_empty() {
            return Err(ConfigError::Missing("router"));
        }

        let mut names = std::collections::HashSet::new();
        for router in &self.routers {
            if !names.insert(router.name.as_str()) {
                return Err(ConfigError::invalid(
                    format!("router.{}", router.name),
                    "duplicate router name",
                ));
            }
            if router.mqtt.host.trim().is_empty() {
                return Err(ConfigError::invalid(
                    format!("router.{}.mqtt.host", router.name),
                    "must not be empty",
                ));
            }
            if router.mqtt.channel_capacity == 0 {
                return Err(ConfigError::invalid(
                    format!("router.{}.mqtt.channel_capacity", router.name),
                    "must be greater than 0",
                ));
            }
            if let BackendConfig::Device { command_topic, .. } = &router.backend {
                if !command_topic.contains("__EPNAME__") {
                    return Err(ConfigError::invalid(
                        format!("router.{}.backend.command_topic", router.name),
                        "must contain __EPNAME__",
                    ));
                }
            }
        }

        Ok(())
    }

    /// Builder pattern methods for fluent configuration

    pub fn with_registry(mut self, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        self.registry.base_url = base_url.into();
        self.registry.api_key = Some(api_key.into());
        self
    }

    pub fn with_default_domain(mut self, domain: impl Into<String>) -> Self {
        self.registry.default_domain = domain.into();
        self
    }

    pub fn with_callback_url(mut self, url: impl Into<String>) -> Self {
        self.webhook.callback_url = Some(url.into());
        self
    }

    pub fn with_webhook_ports(mut self, start: u16, end: u16) -> Self {
        self.webhook.port_range = (start, end);
        self
    }

    pub fn with_skip_validation(mut self, skip: bool) -> Self {
        self.webhook.skip_validation = skip;
        self
    }

    pub fn with_validation_interval(mut self, interval: Duration) -> Self {
        self.validator.interval_secs = interval.as_secs().max(1);
        self
    }

    pub fn with_router(mut self, router: RouterConfig) -> Self {
        self.routers.push(router);
        self
    }
}
