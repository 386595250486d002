//! Data exchanged with the hub.
//!
//! - [`Message`]: telemetry sent by the device and cloud-to-device messages it receives
//! - [`MethodRequest`] / [`MethodResponse`]: direct method invocation and its answer
//! - [`Twin`] / [`TwinCollection`]: device twin documents and property patches
//! - [`IncomingRequest`]: anything the hub pushes that the application must handle

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ClientError, Result};

/// A device-to-cloud or cloud-to-device message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    /// Raw body.
    pub payload: Bytes,

    /// Application properties, routed on by the hub.
    pub properties: BTreeMap<String, String>,

    pub message_id: Option<String>,
    pub correlation_id: Option<String>,

    /// MIME type of the payload, e.g. `application/json`.
    pub content_type: Option<String>,

    /// Encoding of the payload, e.g. `utf-8` or `gzip`.
    pub content_encoding: Option<String>,

    /// Set on received messages by transports that lock them until completed.
    pub lock_token: Option<String>,

    /// Input the message arrived on (edge module routing only).
    pub input_name: Option<String>,
}

impl Message {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            ..Default::default()
        }
    }

    /// Builds a UTF-8 JSON message from a serializable value.
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        let body =
            serde_json::to_vec(value).map_err(|e| ClientError::Serialization(e.to_string()))?;
        Ok(Self::new(body)
            .with_content_type("application/json")
            .with_content_encoding("utf-8"))
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_content_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.content_encoding = Some(encoding.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// A direct method call received from the cloud.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodRequest {
    pub name: String,
    /// Correlates the response; must be echoed in [`MethodResponse`].
    pub request_id: String,
    pub payload: Bytes,
}

impl MethodRequest {
    /// Parses the payload as JSON.
    pub fn payload_json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.payload).map_err(|e| ClientError::Deserialization(e.to_string()))
    }
}

/// Answer to a [`MethodRequest`].
#[derive(Debug, Clone, PartialEq)]
pub struct MethodResponse {
    pub request_id: String,
    /// Application status code, echoed to the caller in the cloud.
    pub status: u16,
    pub payload: Bytes,
}

impl MethodResponse {
    pub fn new(request_id: impl Into<String>, status: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            request_id: request_id.into(),
            status,
            payload: payload.into(),
        }
    }

    /// Response carrying a JSON body.
    pub fn json<T: Serialize>(request_id: impl Into<String>, status: u16, body: &T) -> Result<Self> {
        let payload =
            serde_json::to_vec(body).map_err(|e| ClientError::Serialization(e.to_string()))?;
        Ok(Self::new(request_id, status, payload))
    }
}

/// A set of twin properties (desired or reported).
pub type TwinCollection = serde_json::Map<String, Value>;

/// The device twin as returned by the hub.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Twin {
    #[serde(default)]
    pub desired: TwinCollection,
    #[serde(default)]
    pub reported: TwinCollection,
}

impl Twin {
    /// Version of the desired properties (`$version`), if present.
    pub fn desired_version(&self) -> Option<i64> {
        self.desired.get("$version").and_then(Value::as_i64)
    }

    /// Version of the reported properties (`$version`), if present.
    pub fn reported_version(&self) -> Option<i64> {
        self.reported.get("$version").and_then(Value::as_i64)
    }
}

/// Something the hub pushed to the device.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingRequest {
    /// A direct method invocation awaiting a response.
    Method(MethodRequest),

    /// A desired-property patch.
    DesiredProperties {
        version: Option<i64>,
        patch: TwinCollection,
    },

    /// A message routed to one of the module's inputs.
    ModuleInput { input: String, message: Message },
}
