//! Formatting helpers shared by every backend.

use serde_json::{json, Map, Value};

use super::CommandReply;
use crate::batch::Notification;

pub const ENDPOINT_PLACEHOLDER: &str = "__EPNAME__";
pub const DEVICE_TYPE_PLACEHOLDER: &str = "__DEVICE_TYPE__";
pub const COMMAND_TYPE_PLACEHOLDER: &str = "__COMMAND_TYPE__";

/// Fill the topic/identity placeholders of a template.
pub fn substitute_placeholders(
    template: &str,
    endpoint: &str,
    device_type: &str,
    command_type: &str,
) -> String {
    template
        .replace(ENDPOINT_PLACEHOLDER, endpoint)
        .replace(DEVICE_TYPE_PLACEHOLDER, device_type)
        .replace(COMMAND_TYPE_PLACEHOLDER, command_type)
}

/// Remove one pair of enclosing `[` `]`, if present.
pub fn strip_array_brackets(text: &str) -> &str {
    let trimmed = text.trim();
    match trimmed.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
        Some(inner) => inner.trim(),
        None => trimmed,
    }
}

/// Wrap a serialized object under `key`.
pub fn wrap_envelope(body: String, key: Option<&str>) -> String {
    let Some(key) = key else {
        return body;
    };
    let inner = serde_json::from_str::<Value>(&body).unwrap_or(Value::String(body));
    json!({ key: inner }).to_string()
}

/// The value to embed for a decoded CoAP payload: a non-empty JSON object or
/// array stays structured, anything else is kept as the raw text.
pub fn observation_value(decoded: &str) -> Value {
    match serde_json::from_str::<Value>(decoded) {
        Ok(Value::Object(map)) if !map.is_empty() => Value::Object(map),
        Ok(Value::Array(items)) if !items.is_empty() => Value::Array(items),
        _ => Value::String(decoded.to_string()),
    }
}

/// Serialize a record for the wire: bare object, optional envelope.
pub fn encode_record(record: &Value, envelope: Option<&str>) -> Option<String> {
    match serde_json::to_string(record) {
        Ok(text) => Some(wrap_envelope(
            strip_array_brackets(&text).to_string(),
            envelope,
        )),
        Err(e) => {
            tracing::warn!(error = %e, "record not serializable");
            None
        }
    }
}

/// Observation record for a telemetry notification.
pub fn observation_record(
    notification: &Notification,
    endpoint_type: &str,
    decoded: Option<&str>,
) -> Value {
    let mut record = Map::new();
    record.insert("ep".into(), Value::String(notification.ep.clone()));
    record.insert("ept".into(), Value::String(endpoint_type.to_string()));
    record.insert("path".into(), Value::String(notification.path.clone()));
    record.insert(
        "value".into(),
        decoded.map(observation_value).unwrap_or(Value::Null),
    );
    if let Some(max_age) = notification.max_age {
        record.insert("max-age".into(), json!(max_age));
    }
    if let Some(ct) = &notification.ct {
        record.insert("ct".into(), Value::String(ct.clone()));
    }
    Value::Object(record)
}

/// Reply record for a completed command.
pub fn reply_record(reply: &CommandReply) -> Value {
    let mut record = Map::new();
    if let Some(ep) = &reply.endpoint {
        record.insert("ep".into(), Value::String(ep.clone()));
    }
    if let Some(path) = &reply.resource_path {
        record.insert("path".into(), Value::String(path.clone()));
    }
    record.insert("verb".into(), Value::String(reply.verb.as_str().to_string()));
    record.insert(
        "value".into(),
        reply
            .value
            .as_deref()
            .map(observation_value)
            .unwrap_or(Value::Null),
    );
    if let Some(status) = reply.status {
        record.insert("status".into(), json!(status));
    }
    Value::Object(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use registry_client::CoapVerb;
    use rstest::rstest;

    #[test]
    fn test_substitute_placeholders() {
        assert_eq!(
            substitute_placeholders(
                "devices/__EPNAME__/__DEVICE_TYPE__/__COMMAND_TYPE__",
                "dev1",
                "sensor",
                "get"
            ),
            "devices/dev1/sensor/get"
        );
        assert_eq!(substitute_placeholders("plain/topic", "dev1", "", ""), "plain/topic");
    }

    #[rstest]
    #[case(r#"[{"a":1}]"#, r#"{"a":1}"#)]
    #[case(r#" [ {"a":1} ] "#, r#"{"a":1}"#)]
    #[case(r#"{"a":1}"#, r#"{"a":1}"#)]
    #[case("[]", "")]
    fn test_strip_array_brackets(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(strip_array_brackets(input), expected);
    }

    #[rstest]
    #[case("29.75", Value::String("29.75".into()))]
    #[case("{}", Value::String("{}".into()))]
    #[case("[]", Value::String("[]".into()))]
    #[case("hello", Value::String("hello".into()))]
    #[case(r#"{"t":21}"#, json!({"t": 21}))]
    #[case("[1,2]", json!([1, 2]))]
    fn test_observation_value(#[case] decoded: &str, #[case] expected: Value) {
        assert_eq!(observation_value(decoded), expected);
    }

    #[test]
    fn test_wrap_envelope() {
        assert_eq!(wrap_envelope(r#"{"a":1}"#.into(), None), r#"{"a":1}"#);
        assert_eq!(
            wrap_envelope(r#"{"a":1}"#.into(), Some("d")),
            r#"{"d":{"a":1}}"#
        );
    }

    #[test]
    fn test_observation_record() {
        let notification = Notification {
            ep: "dev1".into(),
            path: "/3303/0/5700".into(),
            payload: "MjkuNzU=".into(),
            max_age: Some(60),
            ct: None,
        };
        let record = observation_record(&notification, "sensor", Some("29.75"));
        assert_eq!(record["value"], "29.75");
        assert_eq!(record["max-age"], 60);

        let text = encode_record(&Value::Array(vec![record]), Some("d")).unwrap();
        let parsed: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["d"]["ep"], "dev1");
        assert_eq!(parsed["d"]["path"], "/3303/0/5700");
    }

    #[test]
    fn test_reply_record() {
        let reply = CommandReply {
            verb: CoapVerb::Get,
            endpoint: Some("dev1".into()),
            resource_path: Some("/3303/0/5700".into()),
            value: Some("29.75".into()),
            status: Some(200),
        };
        let record = reply_record(&reply);
        assert_eq!(record["verb"], "get");
        assert_eq!(record["value"], "29.75");
        assert_eq!(record["status"], 200);
    }
}
