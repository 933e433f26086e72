//! Plain MQTT broker backend.
//!
//! Topic layout, with `<root>` and `<tag>` from configuration:
//!
//! ```text
//! <root>/<tag>/<domain>/endpoints                      endpoint discovery
//! <root>/<tag>/<domain>/endpoints/<ep>                 resource discovery
//! <root>/<tag>/<domain>/endpoints/<ep><uri>            resource request
//! <root>/<tag>/<domain>/subscriptions/<ep><uri>        subscription management
//! <root>/<domain>/endpoints/new_registration           registration announcements
//! <root>/<domain>/endpoints/<ep>                       observations (default)
//! ```
//!
//! Results are published to the command topic with `<tag>/` removed. The
//! `<domain>` segment may be omitted; when present it must name the configured
//! domain, and commands for any other domain are ignored.

use serde_json::json;

use super::format::{encode_record, observation_record, reply_record, substitute_placeholders};
use super::{Backend, CommandKind, CommandPayload, CommandReply, ParsedCommand};
use crate::batch::{Notification, Registration};
use crate::transport::InboundMessage;
use crate::types::ConnectionMode;

const ENDPOINTS_SEGMENT: &str = "endpoints";
const SUBSCRIPTIONS_SEGMENT: &str = "subscriptions";

/// Backend for a plain MQTT broker sharing one connection.
pub struct GenericMqttBackend {
    name: String,
    topic_root: String,
    request_tag: String,
    domain: String,
    observation_template: String,
    envelope_key: Option<String>,
    announce_registrations: bool,
}

impl GenericMqttBackend {
    pub fn new(
        name: &str,
        topic_root: &str,
        request_tag: &str,
        domain: &str,
        observation_template: Option<String>,
        envelope_key: Option<String>,
        announce_registrations: bool,
    ) -> Self {
        let topic_root = topic_root.trim_matches('/').to_string();
        let observation_template = observation_template
            .unwrap_or_else(|| format!("{topic_root}/{domain}/{ENDPOINTS_SEGMENT}/__EPNAME__"));
        Self {
            name: name.to_string(),
            request_tag: request_tag.trim_matches('/').to_string(),
            domain: domain.to_string(),
            topic_root,
            observation_template,
            envelope_key,
            announce_registrations,
        }
    }

    fn request_prefix(&self) -> String {
        format!("{}/{}/", self.topic_root, self.request_tag)
    }
}

impl Backend for GenericMqttBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn connection_mode(&self) -> ConnectionMode {
        ConnectionMode::Shared
    }

    fn command_topics(&self, _endpoint: &str, _endpoint_type: &str) -> Vec<String> {
        vec![format!("{}#", self.request_prefix())]
    }

    fn observation_topic(&self, endpoint: &str, endpoint_type: &str) -> String {
        substitute_placeholders(&self.observation_template, endpoint, endpoint_type, "")
    }

    fn format_observation(
        &self,
        notification: &Notification,
        endpoint_type: &str,
        decoded: Option<&str>,
    ) -> Option<String> {
        encode_record(
            &observation_record(notification, endpoint_type, decoded),
            self.envelope_key.as_deref(),
        )
    }

    fn parse_command(
        &self,
        _connection_key: &str,
        _endpoint_type: &str,
        message: &InboundMessage,
    ) -> Option<ParsedCommand> {
        let rest = message
            .topic
            .strip_prefix(&self.request_prefix())?
            .trim_end_matches('/');
        let segments: Vec<&str> = rest.split('/').collect();

        // The domain segment is optional.
        let (domain, collection, tail) = match segments.as_slice() {
            [collection, tail @ ..]
                if *collection == ENDPOINTS_SEGMENT || *collection == SUBSCRIPTIONS_SEGMENT =>
            {
                (None, *collection, tail)
            }
            [domain, collection, tail @ ..] => (Some(domain.to_string()), *collection, tail),
            _ => return None,
        };
        if let Some(domain) = &domain {
            if !domain.eq_ignore_ascii_case(&self.domain) {
                tracing::debug!(topic = %message.topic, "command for a foreign domain ignored");
                return None;
            }
        }

        let payload = CommandPayload::parse(&message.payload);
        let endpoint = tail.first().map(|ep| ep.to_string());
        let resource_path = (tail.len() > 1).then(|| format!("/{}", tail[1..].join("/")));

        let kind = match (collection, tail.len()) {
            (ENDPOINTS_SEGMENT, 0) => CommandKind::EndpointDiscovery,
            (ENDPOINTS_SEGMENT, 1) => CommandKind::ResourceDiscovery,
            (ENDPOINTS_SEGMENT, _) => CommandKind::ResourceRequest,
            (SUBSCRIPTIONS_SEGMENT, n) if n > 1 => CommandKind::SubscriptionManagement,
            _ => {
                tracing::debug!(topic = %message.topic, "unrecognized command topic");
                return None;
            }
        };

        Some(ParsedCommand {
            kind,
            domain,
            endpoint,
            endpoint_type: payload.ept.clone(),
            resource_path,
            verb: payload.resolve_verb(),
            value: payload.new_value.clone(),
            unsubscribe: payload.wants_unsubscribe(),
            response_topic: format!("{}/{}", self.topic_root, rest),
            reply_topic: payload.reply_topic.clone(),
            raw_payload: message.payload.clone(),
        })
    }

    fn format_reply(&self, reply: &CommandReply) -> Option<String> {
        encode_record(&reply_record(reply), self.envelope_key.as_deref())
    }

    fn registration_announcement(
        &self,
        registration: &Registration,
        domain: &str,
    ) -> Option<(String, String)> {
        if !self.announce_registrations {
            return None;
        }
        let topic = format!(
            "{}/{}/{}/new_registration",
            self.topic_root, domain, ENDPOINTS_SEGMENT
        );
        let record = json!({
            "ep": registration.ep,
            "ept": registration.ept,
            "resources": registration.resources,
        });
        encode_record(&record, self.envelope_key.as_deref()).map(|payload| (topic, payload))
    }
}
