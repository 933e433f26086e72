//! Per-backend topic layout and message formats.
//!
//! A [`Backend`] answers every backend-specific question a router has: which
//! connection an endpoint uses, which topics carry its commands and telemetry,
//! how inbound commands are parsed and how replies are formatted. Shared
//! formatting lives in [`format`]; implementations only decide layout.

pub mod format;
mod device;
mod generic;

pub use device::DeviceMqttBackend;
pub use generic::GenericMqttBackend;

use registry_client::CoapVerb;
use std::sync::Arc;

use crate::batch::{Notification, Registration};
use crate::config::{BackendConfig, RouterConfig};
use crate::transport::InboundMessage;
use crate::types::ConnectionMode;

/// Which registry call a command maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// List endpoints
    EndpointDiscovery,
    /// Operate on one resource
    ResourceRequest,
    /// List one endpoint's resources
    ResourceDiscovery,
    /// Add or remove an observation
    SubscriptionManagement,
}

/// A broker command, reduced to what the registry needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub kind: CommandKind,
    /// Domain named by the topic, if any
    pub domain: Option<String>,
    pub endpoint: Option<String>,
    /// Endpoint type filter for discovery
    pub endpoint_type: Option<String>,
    pub resource_path: Option<String>,
    pub verb: CoapVerb,
    /// Value for PUT/POST
    pub value: Option<String>,
    /// Subscription management: remove instead of add
    pub unsubscribe: bool,
    /// Where the immediate result (or non-GET async result) goes
    pub response_topic: String,
    /// Where a GET result goes, when different from the response topic
    pub reply_topic: Option<String>,
    /// Payload as received
    pub raw_payload: String,
}

/// Result of a command, handed to [`Backend::format_reply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReply {
    pub verb: CoapVerb,
    pub endpoint: Option<String>,
    pub resource_path: Option<String>,
    /// Decoded result payload
    pub value: Option<String>,
    pub status: Option<u16>,
}

/// Backend capabilities, one implementation per broker flavour.
pub trait Backend: Send + Sync {
    /// Router name, used in logs and shared connection keys
    fn name(&self) -> &str;

    fn connection_mode(&self) -> ConnectionMode;

    /// Multiplexer key of the connection that carries `endpoint`.
    fn connection_key(&self, endpoint: &str) -> String {
        match self.connection_mode() {
            ConnectionMode::Shared => self.name().to_string(),
            ConnectionMode::PerEndpoint => endpoint.to_string(),
        }
    }

    /// Topic filters to subscribe for an endpoint's commands.
    fn command_topics(&self, endpoint: &str, endpoint_type: &str) -> Vec<String>;

    /// Topic a notification for `endpoint` is published to.
    fn observation_topic(&self, endpoint: &str, endpoint_type: &str) -> String;

    /// Wire payload for a telemetry notification.
    fn format_observation(
        &self,
        notification: &Notification,
        endpoint_type: &str,
        decoded: Option<&str>,
    ) -> Option<String>;

    /// Classify an inbound message received on connection `connection_key`.
    /// `endpoint_type` is the known type of the endpoint behind the key, or the
    /// router default.
    fn parse_command(
        &self,
        connection_key: &str,
        endpoint_type: &str,
        message: &InboundMessage,
    ) -> Option<ParsedCommand>;

    /// Wire payload for a command result. `None` means nothing to publish.
    fn format_reply(&self, reply: &CommandReply) -> Option<String>;

    /// Topic and payload announcing a new registration, if the backend has one.
    fn registration_announcement(
        &self,
        _registration: &Registration,
        _domain: &str,
    ) -> Option<(String, String)> {
        None
    }
}

/// Build the backend a router config selects.
pub fn build_backend(config: &RouterConfig, default_domain: &str) -> Arc<dyn Backend> {
    match &config.backend {
        BackendConfig::Generic {
            topic_root,
            request_tag,
            observation_topic,
            envelope_key,
            announce_registrations,
        } => Arc::new(GenericMqttBackend::new(
            &config.name,
            topic_root,
            request_tag,
            default_domain,
            observation_topic.clone(),
            envelope_key.clone(),
            *announce_registrations,
        )),
        BackendConfig::Device {
            command_topic,
            observation_topic,
            response_topic,
            reply_topic,
            envelope_key,
        } => Arc::new(DeviceMqttBackend::new(
            &config.name,
            command_topic,
            observation_topic,
            response_topic,
            reply_topic.clone(),
            envelope_key.clone(),
        )),
    }
}

/// Command payload fields shared by both backends.
#[derive(Debug, Default, serde::Deserialize)]
pub(crate) struct CommandPayload {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default, alias = "coap_verb")]
    pub verb: Option<String>,
    #[serde(default, deserialize_with = "value_as_text")]
    pub new_value: Option<String>,
    #[serde(default)]
    pub unsubscribe: Option<serde_json::Value>,
    #[serde(default)]
    pub reply_topic: Option<String>,
    #[serde(default)]
    pub ept: Option<String>,
}

impl CommandPayload {
    /// Parse a payload; empty or non-JSON payloads carry no fields.
    pub fn parse(payload: &str) -> Self {
        if payload.trim().is_empty() {
            return Self::default();
        }
        serde_json::from_str(payload).unwrap_or_else(|e| {
            tracing::debug!(error = %e, "command payload is not a JSON object");
            Self::default()
        })
    }

    /// Explicit verb wins; otherwise GET without a new value, PUT with one.
    pub fn resolve_verb(&self) -> CoapVerb {
        if let Some(verb) = self.verb.as_deref().and_then(CoapVerb::parse) {
            return verb;
        }
        if self.new_value.is_some() {
            CoapVerb::Put
        } else {
            CoapVerb::Get
        }
    }

    pub fn wants_unsubscribe(&self) -> bool {
        match &self.unsubscribe {
            Some(serde_json::Value::Bool(b)) => *b,
            Some(serde_json::Value::String(s)) => s.trim().eq_ignore_ascii_case("true"),
            _ => false,
        }
    }
}

/// `new_value` may be sent as a string or as any JSON scalar.
fn value_as_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize;
    Ok(match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("", CoapVerb::Get)]
    #[case(r#"{"path":"/1/0/1"}"#, CoapVerb::Get)]
    #[case(r#"{"new_value":"1"}"#, CoapVerb::Put)]
    #[case(r#"{"new_value":42}"#, CoapVerb::Put)]
    #[case(r#"{"verb":"post","new_value":"1"}"#, CoapVerb::Post)]
    #[case(r#"{"coap_verb":"DELETE"}"#, CoapVerb::Delete)]
    #[case(r#"{"verb":"bogus","new_value":"1"}"#, CoapVerb::Put)]
    #[case("not json", CoapVerb::Get)]
    fn test_resolve_verb(#[case] payload: &str, #[case] expected: CoapVerb) {
        assert_eq!(CommandPayload::parse(payload).resolve_verb(), expected);
    }

    #[rstest]
    #[case(r#"{"unsubscribe":true}"#, true)]
    #[case(r#"{"unsubscribe":"true"}"#, true)]
    #[case(r#"{"unsubscribe":false}"#, false)]
    #[case("{}", false)]
    fn test_wants_unsubscribe(#[case] payload: &str, #[case] expected: bool) {
        assert_eq!(CommandPayload::parse(payload).wants_unsubscribe(), expected);
    }

    #[test]
    fn test_numeric_new_value_becomes_text() {
        let payload = CommandPayload::parse(r#"{"new_value":42}"#);
        assert_eq!(payload.new_value.as_deref(), Some("42"));
    }

    #[test]
    fn test_build_backend_from_config() {
        let generic = build_backend(&RouterConfig::default(), "domain");
        assert_eq!(generic.connection_mode(), ConnectionMode::Shared);
        assert_eq!(generic.connection_key("dev1"), "generic");

        let device = build_backend(
            &RouterConfig {
                name: "cloud".into(),
                backend: BackendConfig::Device {
                    command_topic: "devices/__EPNAME__/commands/#".into(),
                    observation_topic: "devices/__EPNAME__/events".into(),
                    response_topic: "devices/__EPNAME__/responses/__COMMAND_TYPE__".into(),
                    reply_topic: None,
                    envelope_key: None,
                },
                ..Default::default()
            },
            "domain",
        );
        assert_eq!(device.connection_mode(), ConnectionMode::PerEndpoint);
        assert_eq!(device.connection_key("dev1"), "dev1");
    }
}
