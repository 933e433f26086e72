//! Per-device cloud broker backend.
//!
//! Each endpoint connects as its own broker client and receives commands on
//! its own topic. The command payload names the resource:
//!
//! ```json
//! {"path": "/3311/0/5850", "verb": "put", "new_value": "1"}
//! ```
//!
//! A payload without `path` asks for resource discovery; one carrying an
//! `unsubscribe` flag manages the observation of `path`.

use super::format::{encode_record, observation_record, reply_record, substitute_placeholders};
use super::{Backend, CommandKind, CommandPayload, CommandReply, ParsedCommand};
use crate::batch::Notification;
use crate::transport::InboundMessage;
use crate::types::ConnectionMode;

/// `__COMMAND_TYPE__` in a subscription filter matches any command.
const ANY_COMMAND: &str = "+";

pub struct DeviceMqttBackend {
    name: String,
    command_template: String,
    observation_template: String,
    response_template: String,
    reply_template: Option<String>,
    envelope_key: Option<String>,
}

impl DeviceMqttBackend {
    pub fn new(
        name: &str,
        command_template: &str,
        observation_template: &str,
        response_template: &str,
        reply_template: Option<String>,
        envelope_key: Option<String>,
    ) -> Self {
        Self {
            name: name.to_string(),
            command_template: command_template.to_string(),
            observation_template: observation_template.to_string(),
            response_template: response_template.to_string(),
            reply_template,
            envelope_key,
        }
    }
}

impl Backend for DeviceMqttBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn connection_mode(&self) -> ConnectionMode {
        ConnectionMode::PerEndpoint
    }

    fn command_topics(&self, endpoint: &str, endpoint_type: &str) -> Vec<String> {
        vec![substitute_placeholders(
            &self.command_template,
            endpoint,
            endpoint_type,
            ANY_COMMAND,
        )]
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
        connection_key: &str,
        endpoint_type: &str,
        message: &InboundMessage,
    ) -> Option<ParsedCommand> {
        let endpoint = connection_key;
        let payload = CommandPayload::parse(&message.payload);
        let verb = payload.resolve_verb();

        let kind = match (&payload.path, &payload.unsubscribe) {
            (None, _) => CommandKind::ResourceDiscovery,
            (Some(_), Some(_)) => CommandKind::SubscriptionManagement,
            (Some(_), None) => CommandKind::ResourceRequest,
        };

        let response_topic =
            substitute_placeholders(&self.response_template, endpoint, endpoint_type, verb.as_str());
        let reply_topic = payload
            .reply_topic
            .clone()
            .or_else(|| {
                self.reply_template.as_deref().map(|template| {
                    substitute_placeholders(template, endpoint, endpoint_type, verb.as_str())
                })
            });

        Some(ParsedCommand {
            kind,
            domain: None,
            endpoint: Some(endpoint.to_string()),
            endpoint_type: Some(endpoint_type.to_string()),
            resource_path: payload
                .path
                .as_deref()
                .map(|p| format!("/{}", p.trim_start_matches('/'))),
            verb,
            value: payload.new_value.clone(),
            unsubscribe: payload.wants_unsubscribe(),
            response_topic,
            reply_topic,
            raw_payload: message.payload.clone(),
        })
    }

    fn format_reply(&self, reply: &CommandReply) -> Option<String> {
        encode_record(&reply_record(reply), self.envelope_key.as_deref())
    }
}
