//! Application-level message unit carried over the mesh transport.
//!
//! Modeled on `strata-common::protocol::Envelope`'s shape (string id,
//! flexible JSON payload) but widened to the four envelope kinds and the
//! request/response correlation fields the transport needs.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Default envelope priority (§3 Data Model). Lower values sort first.
pub const DEFAULT_PRIORITY: i32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeType {
    Request,
    Response,
    Error,
    Ack,
}

impl EnvelopeType {
    pub fn is_ack(self) -> bool {
        matches!(self, EnvelopeType::Ack)
    }
}

/// The application-visible message unit (§3 Data Model).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    #[serde(rename = "type")]
    pub ty: EnvelopeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub meta: Map<String, Value>,
}

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

impl Envelope {
    /// Build a new `request` envelope with a freshly generated id.
    pub fn request(command: impl Into<String>, data: impl Serialize) -> Self {
        Envelope {
            id: Uuid::now_v7().to_string(),
            ty: EnvelopeType::Request,
            command: Some(command.into()),
            priority: DEFAULT_PRIORITY,
            correlation_id: None,
            data: serde_json::to_value(data).unwrap_or(Value::Null),
            meta: Map::new(),
        }
    }

    /// Build the `response` envelope answering `request_id`.
    pub fn response(request_id: impl Into<String>, data: impl Serialize) -> Self {
        Envelope {
            id: Uuid::now_v7().to_string(),
            ty: EnvelopeType::Response,
            command: None,
            priority: DEFAULT_PRIORITY,
            correlation_id: Some(request_id.into()),
            data: serde_json::to_value(data).unwrap_or(Value::Null),
            meta: Map::new(),
        }
    }

    /// Build an `error` envelope answering `request_id`.
    pub fn error(request_id: impl Into<String>, message: impl Into<String>) -> Self {
        Envelope {
            id: Uuid::now_v7().to_string(),
            ty: EnvelopeType::Error,
            command: None,
            priority: DEFAULT_PRIORITY,
            correlation_id: Some(request_id.into()),
            data: Value::String(message.into()),
            meta: Map::new(),
        }
    }

    /// Build the end-to-end `ack` envelope for a delivered envelope.
    ///
    /// `ack` envelopes carry only `correlation_id`; this invariant is
    /// enforced by construction rather than left to callers.
    pub fn ack(correlation_id: impl Into<String>) -> Self {
        Envelope {
            id: Uuid::now_v7().to_string(),
            ty: EnvelopeType::Ack,
            command: None,
            priority: DEFAULT_PRIORITY,
            correlation_id: Some(correlation_id.into()),
            data: Value::Null,
            meta: Map::new(),
        }
    }

    /// Deserialize `data` into `T`.
    pub fn parse_data<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }

    /// A stable fingerprint of `command` + canonicalized `data`, used by the
    /// gateway dedupe cache's optional semantic-fingerprint lease (§4.6).
    pub fn semantic_fingerprint(&self) -> String {
        let canon = canonicalize(&self.data);
        format!("{}:{}", self.command.as_deref().unwrap_or(""), canon)
    }
}

/// Canonical JSON string: object keys sorted, no whitespace. Used only for
/// fingerprinting, not for wire transmission.
fn canonicalize(value: &Value) -> String {
    fn sort(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut sorted = Map::new();
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                for k in keys {
                    sorted.insert(k.clone(), sort(&map[k]));
                }
                Value::Object(sorted)
            }
            Value::Array(items) => Value::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    sort(value).to_string()
}
