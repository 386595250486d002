//! Hub topic names and property bags.
//!
//! Telemetry and cloud-to-device topics end in a property bag: URL-encoded
//! `key=value` pairs joined by `&`. System properties use `$.`-prefixed keys:
//!
//! | key    | message field      |
//! |--------|--------------------|
//! | `$.mid`| `message_id`       |
//! | `$.cid`| `correlation_id`   |
//! | `$.ct` | `content_type`     |
//! | `$.ce` | `content_encoding` |

use std::fmt;

use crate::message::{IncomingRequest, Message, MethodRequest};

pub const METHODS_FILTER: &str = "$iothub/methods/POST/#";
pub const TWIN_RESPONSE_FILTER: &str = "$iothub/twin/res/#";
pub const TWIN_DESIRED_FILTER: &str = "$iothub/twin/PATCH/properties/desired/#";

const METHODS_PREFIX: &str = "$iothub/methods/POST/";
const TWIN_RESPONSE_PREFIX: &str = "$iothub/twin/res/";
const TWIN_DESIRED_PREFIX: &str = "$iothub/twin/PATCH/properties/desired/";

/// Device (and optional module) the session speaks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub module_id: Option<String>,
}

impl DeviceIdentity {
    pub fn new(device_id: impl Into<String>, module_id: Option<String>) -> Self {
        Self {
            device_id: device_id.into(),
            module_id,
        }
    }

    fn base(&self) -> String {
        match &self.module_id {
            Some(module) => format!("devices/{}/modules/{}", self.device_id, module),
            None => format!("devices/{}", self.device_id),
        }
    }

    pub fn telemetry_topic(&self, message: &Message) -> String {
        format!("{}/messages/events/{}", self.base(), encode_property_bag(message))
    }

    pub fn c2d_filter(&self) -> String {
        format!("devices/{}/messages/devicebound/#", self.device_id)
    }

    /// Module input filter; `None` for a plain device identity.
    pub fn inputs_filter(&self) -> Option<String> {
        self.module_id
            .as_ref()
            .map(|module| format!("devices/{}/modules/{}/inputs/#", self.device_id, module))
    }

    /// Parses a cloud-to-device topic into a message carrying `payload`.
    pub fn parse_c2d(&self, topic: &str, payload: bytes::Bytes) -> Option<Message> {
        let prefix = format!("devices/{}/messages/devicebound/", self.device_id);
        let bag = topic.strip_prefix(&prefix)?;
        let mut message = Message::new(payload);
        apply_property_bag(&mut message, bag);
        Some(message)
    }

    /// Parses `devices/{d}/modules/{m}/inputs/{input}/{bag}`.
    pub fn parse_module_input(&self, topic: &str, payload: bytes::Bytes) -> Option<IncomingRequest> {
        let module = self.module_id.as_ref()?;
        let prefix = format!("devices/{}/modules/{}/inputs/", self.device_id, module);
        let rest = topic.strip_prefix(&prefix)?;
        let (input, bag) = rest.split_once('/').unwrap_or((rest, ""));
        if input.is_empty() {
            return None;
        }

        let mut message = Message::new(payload);
        apply_property_bag(&mut message, bag);
        message.input_name = Some(input.to_string());
        Some(IncomingRequest::ModuleInput {
            input: input.to_string(),
            message,
        })
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.module_id {
            Some(module) => write!(f, "{}/{}", self.device_id, module),
            None => write!(f, "{}", self.device_id),
        }
    }
}

pub fn method_response_topic(status: u16, request_id: &str) -> String {
    format!("$iothub/methods/res/{status}/?$rid={request_id}")
}

pub fn twin_get_topic(request_id: &str) -> String {
    format!("$iothub/twin/GET/?$rid={request_id}")
}

pub fn twin_patch_topic(request_id: &str) -> String {
    format!("$iothub/twin/PATCH/properties/reported/?$rid={request_id}")
}

/// Parses `$iothub/methods/POST/{name}/?$rid={rid}`.
pub fn parse_method(topic: &str, payload: bytes::Bytes) -> Option<MethodRequest> {
    let rest = topic.strip_prefix(METHODS_PREFIX)?;
    let (name, query) = rest.split_once("/?")?;
    let request_id = query_value(query, "$rid")?;
    if name.is_empty() {
        return None;
    }
    Some(MethodRequest {
        name: name.to_string(),
        request_id,
        payload,
    })
}

/// A reply on the twin response topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TwinResponse {
    pub status: u16,
    pub request_id: String,
    pub version: Option<i64>,
}

/// Parses `$iothub/twin/res/{status}/?$rid={rid}[&$version={v}]`.
pub fn parse_twin_response(topic: &str) -> Option<TwinResponse> {
    let rest = topic.strip_prefix(TWIN_RESPONSE_PREFIX)?;
    let (status, query) = rest.split_once("/?")?;
    Some(TwinResponse {
        status: status.parse().ok()?,
        request_id: query_value(query, "$rid")?,
        version: query_value(query, "$version").and_then(|v| v.parse().ok()),
    })
}

/// Parses `$iothub/twin/PATCH/properties/desired/?$version={v}` and returns the version.
pub fn parse_desired_patch(topic: &str) -> Option<Option<i64>> {
    let rest = topic.strip_prefix(TWIN_DESIRED_PREFIX)?;
    let query = rest.strip_prefix('?').unwrap_or(rest);
    Some(query_value(query, "$version").and_then(|v| v.parse().ok()))
}

fn query_value(query: &str, key: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v.to_string())
}

/// Encodes system and application properties of `message`.
pub fn encode_property_bag(message: &Message) -> String {
    let system = [
        ("$.mid", &message.message_id),
        ("$.cid", &message.correlation_id),
        ("$.ct", &message.content_type),
        ("$.ce", &message.content_encoding),
    ];

    let mut pairs: Vec<String> = system
        .iter()
        .filter_map(|(key, value)| value.as_ref().map(|v| encode_pair(key, v)))
        .collect();
    pairs.extend(message.properties.iter().map(|(k, v)| encode_pair(k, v)));
    pairs.join("&")
}

fn encode_pair(key: &str, value: &str) -> String {
    format!("{}={}", urlencoding::encode(key), urlencoding::encode(value))
}

/// Copies the properties of a received bag onto `message`.
///
/// Unknown `$.` system keys are dropped; undecodable pairs are skipped.
pub fn apply_property_bag(message: &mut Message, bag: &str) {
    for pair in bag.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let (Ok(key), Ok(value)) = (urlencoding::decode(key), urlencoding::decode(value)) else {
            continue;
        };
        let value = value.into_owned();
        match key.as_ref() {
            "$.mid" => message.message_id = Some(value),
            "$.cid" => message.correlation_id = Some(value),
            "$.ct" => message.content_type = Some(value),
            "$.ce" => message.content_encoding = Some(value),
            k if k.starts_with("$.") => {}
            k => {
                message.properties.insert(k.to_string(), value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn device() -> DeviceIdentity {
        DeviceIdentity::new("dev-1", None)
    }

    fn module() -> DeviceIdentity {
        DeviceIdentity::new("dev-1", Some("filter".into()))
    }

    #[test]
    fn test_telemetry_topic() {
        let message = Message::new("x")
            .with_message_id("m 1")
            .with_content_type("application/json")
            .with_property("temperatureAlert", "true");

        assert_eq!(
            device().telemetry_topic(&message),
            "devices/dev-1/messages/events/%24.mid=m%201&%24.ct=application%2Fjson&temperatureAlert=true"
        );
        assert!(module()
            .telemetry_topic(&Message::new("x"))
            .starts_with("devices/dev-1/modules/filter/messages/events/"));
    }

    #[test]
    fn test_property_bag_is_restored() {
        let original = Message::new("x")
            .with_message_id("id&1")
            .with_correlation_id("c=2")
            .with_content_encoding("utf-8")
            .with_property("unit", "°C");

        let mut restored = Message::new("x");
        apply_property_bag(&mut restored, &encode_property_bag(&original));
        assert_eq!(restored, original);
    }

    #[test]
    fn test_parse_c2d() {
        let message = device()
            .parse_c2d(
                "devices/dev-1/messages/devicebound/%24.mid=abc&%24.to=%2Fdevices%2Fdev-1&color=red",
                Bytes::from("hi"),
            )
            .unwrap();
        assert_eq!(message.message_id.as_deref(), Some("abc"));
        assert_eq!(message.property("color"), Some("red"));
        assert_eq!(message.properties.len(), 1);

        assert!(device()
            .parse_c2d("devices/other/messages/devicebound/", Bytes::new())
            .is_none());
    }

    #[test]
    fn test_parse_module_input() {
        let request = module()
            .parse_module_input("devices/dev-1/modules/filter/inputs/input1/k=v", Bytes::from("p"))
            .unwrap();
        match request {
            IncomingRequest::ModuleInput { input, message } => {
                assert_eq!(input, "input1");
                assert_eq!(message.input_name.as_deref(), Some("input1"));
                assert_eq!(message.property("k"), Some("v"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(device().inputs_filter().is_none());
    }

    #[test]
    fn test_parse_method() {
        let request = parse_method(
            "$iothub/methods/POST/SetTelemetryInterval/?$rid=7",
            Bytes::from("10"),
        )
        .unwrap();
        assert_eq!(request.name, "SetTelemetryInterval");
        assert_eq!(request.request_id, "7");
        assert!(parse_method("$iothub/methods/POST//?$rid=7", Bytes::new()).is_none());
        assert_eq!(method_response_topic(200, "7"), "$iothub/methods/res/200/?$rid=7");
    }

    #[test]
    fn test_parse_twin_response() {
        assert_eq!(
            parse_twin_response("$iothub/twin/res/204/?$rid=abc&$version=12"),
            Some(TwinResponse {
                status: 204,
                request_id: "abc".into(),
                version: Some(12),
            })
        );
        assert_eq!(
            parse_twin_response("$iothub/twin/res/200/?$rid=abc").map(|r| r.version),
            Some(None)
        );
        assert!(parse_twin_response("$iothub/twin/res/xyz/?$rid=abc").is_none());
    }

    #[test]
    fn test_parse_desired_patch() {
        assert_eq!(
            parse_desired_patch("$iothub/twin/PATCH/properties/desired/?$version=5"),
            Some(Some(5))
        );
        assert_eq!(parse_desired_patch("$iothub/twin/res/200/?$rid=1"), None);
    }
}
