//! CloudEvents envelope as received from (or handed to) a backend component.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{Map, Value};

pub const ID_FIELD: &str = "id";
pub const SOURCE_FIELD: &str = "source";
pub const TYPE_FIELD: &str = "type";
pub const SPEC_VERSION_FIELD: &str = "specversion";
pub const DATA_CONTENT_TYPE_FIELD: &str = "datacontenttype";
pub const DATA_FIELD: &str = "data";
pub const DATA_BASE64_FIELD: &str = "data_base64";
pub const TOPIC_FIELD: &str = "topic";
pub const PUBSUB_FIELD: &str = "pubsubname";
pub const TRACE_PARENT_FIELD: &str = "traceparent";
pub const TRACE_ID_FIELD: &str = "traceid";

/// Content type used for every delivery to the app.
pub const CLOUD_EVENT_CONTENT_TYPE: &str = "application/cloudevents+json";

const DEFAULT_EVENT_TYPE: &str = "sidecar.event.sent";
const DEFAULT_SPEC_VERSION: &str = "1.0";

/// A parsed CloudEvents envelope. Unknown extension fields are kept.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CloudEvent {
    fields: Map<String, Value>,
}

impl CloudEvent {
    /// Build a fresh envelope around `data`.
    ///
    /// JSON content types embed the payload as a JSON value when it parses,
    /// UTF-8 payloads are embedded as a string, anything else goes to
    /// `data_base64`.
    pub fn wrap(
        id: impl Into<String>,
        source: impl Into<String>,
        pubsub: &str,
        topic: &str,
        content_type: &str,
        data: &[u8],
    ) -> Self {
        let mut fields = Map::new();
        fields.insert(ID_FIELD.into(), Value::String(id.into()));
        fields.insert(SOURCE_FIELD.into(), Value::String(source.into()));
        fields.insert(TYPE_FIELD.into(), Value::String(DEFAULT_EVENT_TYPE.into()));
        fields.insert(SPEC_VERSION_FIELD.into(), Value::String(DEFAULT_SPEC_VERSION.into()));
        fields.insert(DATA_CONTENT_TYPE_FIELD.into(), Value::String(content_type.into()));
        fields.insert(TOPIC_FIELD.into(), Value::String(topic.into()));
        fields.insert(PUBSUB_FIELD.into(), Value::String(pubsub.into()));

        let json = content_type.contains("json")
            .then(|| serde_json::from_slice::<Value>(data).ok())
            .flatten();
        match (json, std::str::from_utf8(data)) {
            (Some(value), _) => {
                fields.insert(DATA_FIELD.into(), value);
            }
            (None, Ok(text)) => {
                fields.insert(DATA_FIELD.into(), Value::String(text.to_string()));
            }
            (None, Err(_)) => {
                fields.insert(DATA_BASE64_FIELD.into(), Value::String(STANDARD.encode(data)));
            }
        }
        Self { fields }
    }

    /// Parse an envelope; the payload must be a JSON object.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let fields = serde_json::from_slice::<Map<String, Value>>(bytes)?;
        Ok(Self { fields })
    }

    pub fn to_vec(&self) -> Vec<u8> {
        // A map of `Value`s always serializes.
        serde_json::to_vec(&self.fields).unwrap_or_default()
    }

    pub fn set(&mut self, field: &str, value: impl Into<Value>) {
        self.fields.insert(field.to_string(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// A string field; non-string values are ignored.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    /// Event id, or `""` when absent (for log lines).
    pub fn id(&self) -> &str {
        self.get_str(ID_FIELD).unwrap_or_default()
    }

    pub fn topic(&self) -> Option<&str> {
        self.get_str(TOPIC_FIELD)
    }

    /// W3C trace context: `traceparent`, falling back to `traceid`.
    pub fn trace_parent(&self) -> Option<&str> {
        self.get_str(TRACE_PARENT_FIELD)
            .or_else(|| self.get_str(TRACE_ID_FIELD))
    }

    /// The event payload as bytes.
    ///
    /// `data_base64` is decoded; string `data` is taken verbatim; any other
    /// JSON `data` is serialized. Missing data yields an empty payload.
    pub fn data_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        if let Some(encoded) = self.get_str(DATA_BASE64_FIELD) {
            return STANDARD.decode(encoded);
        }
        Ok(match self.fields.get(DATA_FIELD) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::String(text)) => text.clone().into_bytes(),
            Some(other) => serde_json::to_vec(other).unwrap_or_default(),
        })
    }
}
