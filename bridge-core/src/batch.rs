//! Webhook batch format.
//!
//! One delivery from the device registry is a JSON object that may carry any
//! combination of the event arrays below. An absent key means no events of
//! that kind in this delivery.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize};

/// Decoded webhook delivery.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotificationBatch {
    #[serde(default)]
    pub notifications: Vec<Notification>,
    #[serde(default)]
    pub registrations: Vec<Registration>,
    #[serde(default, rename = "reg-updates")]
    pub reg_updates: Vec<Registration>,
    #[serde(default, rename = "de-registrations")]
    pub de_registrations: Vec<String>,
    #[serde(default, rename = "registrations-expired")]
    pub registrations_expired: Vec<String>,
    #[serde(default, rename = "async-responses")]
    pub async_responses: Vec<AsyncResponse>,
}

impl NotificationBatch {
    /// Parse a webhook body. Failures are logged and yield `None`.
    pub fn decode(body: &str) -> Option<Self> {
        match serde_json::from_str(body) {
            Ok(batch) => Some(batch),
            Err(e) => {
                tracing::warn!(error = %e, bytes = body.len(), "unparseable webhook batch");
                None
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.notifications.is_empty()
            && self.registrations.is_empty()
            && self.reg_updates.is_empty()
            && self.de_registrations.is_empty()
            && self.registrations_expired.is_empty()
            && self.async_responses.is_empty()
    }

    /// Registrations and registration updates, in delivery order.
    pub fn all_registrations(&self) -> impl Iterator<Item = &Registration> {
        self.registrations.iter().chain(self.reg_updates.iter())
    }

    /// Endpoints that left, whether explicitly or by expiry.
    pub fn all_deregistrations(&self) -> impl Iterator<Item = &String> {
        self.de_registrations
            .iter()
            .chain(self.registrations_expired.iter())
    }
}

/// A resource value change on an observed resource.
#[derive(Debug, Clone, Deserialize)]
pub struct Notification {
    pub ep: String,
    pub path: String,
    /// Base64 CoAP payload
    #[serde(default)]
    pub payload: String,
    #[serde(default, rename = "max-age")]
    pub max_age: Option<u64>,
    #[serde(default)]
    pub ct: Option<String>,
}

/// An endpoint registering (or refreshing its registration).
#[derive(Debug, Clone, Deserialize)]
pub struct Registration {
    pub ep: String,
    #[serde(default)]
    pub ept: Option<String>,
    #[serde(default)]
    pub resources: Vec<ResourceInfo>,
}

/// A resource listed by a registration or by resource discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceInfo {
    #[serde(alias = "uri")]
    pub path: String,
    #[serde(default, deserialize_with = "flexible_bool")]
    pub obs: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ct: Option<String>,
}

/// Completion of an operation that was answered with an async-response id.
#[derive(Debug, Clone, Deserialize)]
pub struct AsyncResponse {
    pub id: String,
    #[serde(default)]
    pub status: Option<u16>,
    /// Base64 CoAP payload
    #[serde(default)]
    pub payload: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Decode a base64 CoAP payload into text.
///
/// Invalid base64 is logged and yields `None`; non-UTF-8 bytes are replaced.
pub fn decode_coap_payload(encoded: &str) -> Option<String> {
    match STANDARD.decode(encoded.trim()) {
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) => {
            tracing::warn!(error = %e, "payload is not valid base64");
            None
        }
    }
}

/// The registry sends `obs` either as a JSON bool or as the string "true".
fn flexible_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum BoolOrString {
        Bool(bool),
        Text(String),
    }

    Ok(match Option::<BoolOrString>::deserialize(deserializer)? {
        Some(BoolOrString::Bool(b)) => b,
        Some(BoolOrString::Text(s)) => s.trim().eq_ignore_ascii_case("true"),
        None => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_coap_payload() {
        assert_eq!(decode_coap_payload("MjkuNzU=").as_deref(), Some("29.75"));
        assert_eq!(decode_coap_payload("").as_deref(), Some(""));
        assert_eq!(decode_coap_payload("not base64!!"), None);
    }

    #[test]
    fn test_decode_full_batch() {
        let body = r#"{
            "notifications":[{"ep":"dev1","path":"/3303/0/5700","payload":"MjkuNzU=","max-age":60}],
            "registrations":[{"ep":"dev1","ept":"sensor","resources":[{"path":"/3303/0/5700","obs":"true"},{"path":"/3/0/0","obs":false}]}],
            "reg-updates":[{"ep":"dev2","resources":[]}],
            "de-registrations":["dev3"],
            "registrations-expired":["dev4"],
            "async-responses":[{"id":"abc123","status":200,"payload":"MjkuNzU="}]
        }"#;

        let batch = NotificationBatch::decode(body).unwrap();
        assert_eq!(batch.notifications[0].max_age, Some(60));
        assert!(batch.registrations[0].resources[0].obs);
        assert!(!batch.registrations[0].resources[1].obs);
        assert_eq!(batch.all_registrations().count(), 2);
        assert_eq!(
            batch.all_deregistrations().cloned().collect::<Vec<_>>(),
            vec!["dev3".to_string(), "dev4".to_string()]
        );
        assert_eq!(batch.async_responses[0].id, "abc123");
        assert!(!batch.is_empty());
    }

    #[test]
    fn test_absent_keys_are_empty() {
        let batch = NotificationBatch::decode("{}").unwrap();
        assert!(batch.is_empty());
    }

    #[test]
    fn test_invalid_body_is_none() {
        assert!(NotificationBatch::decode("this is not json").is_none());
        assert!(NotificationBatch::decode(r#"{"notifications":"oops"}"#).is_none());
    }

    #[test]
    fn test_discovery_resources_use_uri_key() {
        let resources: Vec<ResourceInfo> =
            serde_json::from_str(r#"[{"uri":"/3303/0/5700","obs":true,"rt":"temperature"}]"#)
                .unwrap();
        assert_eq!(resources[0].path, "/3303/0/5700");
        assert!(resources[0].obs);
    }
}
