//! JSON envelopes exchanged over the tunnel connection.
//!
//! The relay sends two kinds of text frames on the same channel: control
//! notifications tagged with `type`, and HTTP-shaped requests carrying an `id`
//! and a `method`. The client answers every accepted request with exactly one
//! response envelope echoing that `id`.

use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// Control tag announcing an authenticated tunnel.
pub const CONTROL_CONNECTED: &str = "connected";

/// Request header naming the transport encoding of `body`.
pub const BODY_ENCODING_HEADER: &str = "x-body-encoding";

/// Marker value for [`BODY_ENCODING_HEADER`]: `body` is base64 of raw bytes.
pub const BODY_ENCODING_BASE64: &str = "base64";

/// Opaque token pairing a request with its response.
///
/// Any JSON value is accepted and echoed back without reinterpretation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Value);

impl CorrelationId {
    pub fn new(value: impl Into<Value>) -> Self {
        Self(value.into())
    }

    pub const fn as_value(&self) -> &Value {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Value::String(s) => f.write_str(s),
            other => write!(f, "{other}"),
        }
    }
}

/// Ordered HTTP header list with ASCII case-insensitive lookup.
///
/// Serialized as a JSON object in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// First value stored under `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replace every value stored under `name` with a single `value`.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(&name));
        self.0.push((name, value.into()));
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl Serialize for Headers {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in &self.0 {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Headers {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HeadersVisitor;

        impl<'de> Visitor<'de> for HeadersVisitor {
            type Value = Headers;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an object of string header values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Headers, A::Error> {
                let mut headers = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((name, value)) = access.next_entry::<String, String>()? {
                    headers.push((name, value));
                }
                Ok(Headers(headers))
            }
        }

        deserializer.deserialize_map(HeadersVisitor)
    }
}

/// Known control tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    Connected,
}

impl ControlKind {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            CONTROL_CONNECTED => Some(Self::Connected),
            _ => None,
        }
    }

    pub const fn as_tag(self) -> &'static str {
        match self {
            Self::Connected => CONTROL_CONNECTED,
        }
    }
}

/// Relay-to-client notification. Never answered.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlMessage {
    pub kind: ControlKind,
    /// Every field of the frame except `type`.
    pub fields: Map<String, Value>,
}

impl ControlMessage {
    /// Authenticated user reported by the relay (`userId`), string or number.
    pub fn user_id(&self) -> Option<String> {
        match self.fields.get("userId")? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_path() -> String {
    "/".to_string()
}

/// HTTP-shaped request forwarded by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: CorrelationId,
    #[serde(default = "default_method")]
    pub method: String,
    /// Route plus query string.
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub body: Option<String>,
}

impl RequestEnvelope {
    /// Whether `body` carries base64 of raw bytes rather than text.
    pub fn has_binary_body(&self) -> bool {
        self.headers
            .get(BODY_ENCODING_HEADER)
            .is_some_and(|v| v.trim().eq_ignore_ascii_case(BODY_ENCODING_BASE64))
    }
}

/// Client-to-relay answer to a [`RequestEnvelope`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: CorrelationId,
    pub status: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub body: String,
}

impl ResponseEnvelope {
    /// Status-500 envelope carrying `{"error": message}`.
    pub fn internal_error(id: CorrelationId, message: &str) -> Self {
        let mut headers = Headers::new();
        headers.insert("content-type", "application/json");
        Self {
            id,
            status: 500,
            headers,
            body: serde_json::json!({ "error": message }).to_string(),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Classification of one inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Control(ControlMessage),
    Request(RequestEnvelope),
    /// Carries `id` and `method` but some field is ill-typed. The id is known,
    /// so the frame still gets an error response.
    Rejected { id: CorrelationId, reason: String },
    /// Not a protocol message. Dropped without a reply.
    Malformed { reason: String },
}

/// Classify a raw text frame.
pub fn decode(raw: &str) -> InboundFrame {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            return InboundFrame::Malformed {
                reason: format!("invalid JSON: {e}"),
            };
        }
    };
    let Value::Object(mut object) = value else {
        return InboundFrame::Malformed {
            reason: "frame is not a JSON object".into(),
        };
    };

    if let Some(kind) = object
        .get("type")
        .and_then(Value::as_str)
        .and_then(ControlKind::from_tag)
    {
        object.remove("type");
        return InboundFrame::Control(ControlMessage {
            kind,
            fields: object,
        });
    }

    let Some(id) = object.get("id").cloned() else {
        return InboundFrame::Malformed {
            reason: unrecognized_reason(&object, "id"),
        };
    };
    if !object.contains_key("method") {
        return InboundFrame::Malformed {
            reason: unrecognized_reason(&object, "method"),
        };
    }

    match serde_json::from_value::<RequestEnvelope>(Value::Object(object)) {
        Ok(request) => InboundFrame::Request(request),
        Err(e) => InboundFrame::Rejected {
            id: CorrelationId(id),
            reason: format!("invalid request envelope: {e}"),
        },
    }
}

fn unrecognized_reason(object: &Map<String, Value>, missing: &str) -> String {
    match object.get("type") {
        Some(Value::String(tag)) => format!("unknown control type {tag:?}"),
        _ => format!("missing `{missing}` field"),
    }
}
