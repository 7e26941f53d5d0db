//! The message unit exchanged between host and plugins.
//!
//! The wire shape must be preserved by any transport:
//!
//! ```json
//! { "type": "...", "meta": { "originEvent": <token> }, "payload": <opaque> }
//! { "type": "...", "meta": { "originEvent": <token> }, "error": "..." }
//! ```
//!
//! Exactly one of `payload`/`error` is present. In memory the body is a
//! variant, so an envelope cannot even represent "both" or "neither";
//! on the way in, deserialization goes through a wire mirror that rejects
//! such documents.

use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Metadata copied verbatim from the triggering request. The broker never
/// inspects the token; consumers use it to correlate a response with its
/// request, since arrival order carries no meaning.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct EnvelopeMeta {
    #[serde(rename = "originEvent")]
    pub origin_event: Value,
}

/// Success or failure body of an envelope.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeBody {
    Payload(Value),
    Error(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(try_from = "EnvelopeWire", into = "EnvelopeWire")]
pub struct Envelope {
    /// Semantic kind of the message, e.g. `"completion-provider"`. An open
    /// string: the broker relays it without interpreting it.
    #[serde(rename = "type")]
    pub kind: String,
    pub meta: EnvelopeMeta,
    #[serde(flatten)]
    pub body: EnvelopeBody,
}

impl Envelope {
    pub fn message(kind: impl Into<String>, origin_event: Value, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            meta: EnvelopeMeta { origin_event },
            body: EnvelopeBody::Payload(payload),
        }
    }

    pub fn error(kind: impl Into<String>, origin_event: Value, error: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            meta: EnvelopeMeta { origin_event },
            body: EnvelopeBody::Error(error.into()),
        }
    }

    pub fn origin_event(&self) -> &Value {
        &self.meta.origin_event
    }

    pub fn payload(&self) -> Option<&Value> {
        match &self.body {
            EnvelopeBody::Payload(payload) => Some(payload),
            EnvelopeBody::Error(_) => None,
        }
    }

    pub fn error_text(&self) -> Option<&str> {
        match &self.body {
            EnvelopeBody::Error(error) => Some(error),
            EnvelopeBody::Payload(_) => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.body, EnvelopeBody::Error(_))
    }
}

/// Serde-facing mirror of [`Envelope`] in which `payload` and `error` are
/// independent optional fields, exactly as they sit on the wire. `TryFrom`
/// is where a document with both fields, or neither, gets rejected.
#[derive(Serialize, Deserialize, JsonSchema)]
struct EnvelopeWire {
    #[serde(rename = "type")]
    kind: String,
    meta: EnvelopeMeta,
    // `deserialize_with` keeps an explicit `"payload": null` distinct from an
    // absent field: null is a legal opaque payload.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_value"
    )]
    payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl TryFrom<EnvelopeWire> for Envelope {
    type Error = String;

    fn try_from(wire: EnvelopeWire) -> Result<Self, String> {
        let body = match (wire.payload, wire.error) {
            (Some(payload), None) => EnvelopeBody::Payload(payload),
            (None, Some(error)) => EnvelopeBody::Error(error),
            (Some(_), Some(_)) => return Err("envelope carries both payload and error".into()),
            (None, None) => return Err("envelope carries neither payload nor error".into()),
        };
        Ok(Envelope {
            kind: wire.kind,
            meta: wire.meta,
            body,
        })
    }
}

impl From<Envelope> for EnvelopeWire {
    fn from(envelope: Envelope) -> Self {
        let (payload, error) = match envelope.body {
            EnvelopeBody::Payload(payload) => (Some(payload), None),
            EnvelopeBody::Error(error) => (None, Some(error)),
        };
        Self {
            kind: envelope.kind,
            meta: envelope.meta,
            payload,
            error,
        }
    }
}
