//! Event envelope exchanged over the broker.
//!
//! ## Wire Format
//!
//! A flat JSON object. The subject identifier travels as `user_id` (`subject_id`
//! is accepted on input), the event-specific fields sit next to it, and the
//! bookkeeping fields are optional camelCase keys:
//!
//! ```json
//! {
//!   "user_id": "6d1f...",
//!   "username": "alice",
//!   "eventId": "0b8e...",
//!   "traceId": "93aa...",
//!   "createdAt": "2024-05-01T12:00:00Z"
//! }
//! ```
//!
//! Consumers tolerate missing optional keys. An envelope that arrives without
//! `eventId` gets a UUIDv5 derived from the message body, so every redelivery of
//! the same bytes maps to the same id. A `traceId` or `createdAt` of the wrong
//! shape is logged and dropped; it never rejects the event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;
use uuid::Uuid;

/// Name of the durable queue carrying [`UserRegistered`] events.
pub const USER_REGISTERED: &str = "UserRegistered";

/// Namespace for event ids derived from message bodies.
const DERIVED_EVENT_ID_NAMESPACE: Uuid = Uuid::from_u128(0x5c1f_7a2e_90b4_4d5e_8f11_c3a9_d07e_6b42);

/// Errors raised while encoding or decoding envelopes.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Missing subject id")]
    MissingSubject,

    #[error("Conflicting subject ids: user_id '{user_id}', subject_id '{subject_id}'")]
    ConflictingSubject { user_id: String, subject_id: String },

    #[error("Missing payload field '{0}'")]
    MissingField(&'static str),
}

/// The unit of communication between services.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Assigned once by the publisher; stable across redeliveries.
    pub event_id: String,
    /// Entity the event is about.
    pub subject_id: String,
    /// Event-specific fields.
    pub payload: Map<String, Value>,
    /// Correlation id of the originating request. Logging only.
    pub trace_id: Option<String>,
    /// Publication time. Advisory only.
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct WireEnvelope<'a> {
    user_id: &'a str,
    #[serde(rename = "eventId")]
    event_id: &'a str,
    #[serde(rename = "traceId", skip_serializing_if = "Option::is_none")]
    trace_id: Option<&'a str>,
    #[serde(rename = "createdAt", skip_serializing_if = "Option::is_none")]
    created_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    payload: &'a Map<String, Value>,
}

/// Inbound shape: bookkeeping keys are taken as raw JSON and checked by hand.
#[derive(Deserialize)]
struct InboundEnvelope {
    #[serde(default)]
    user_id: Option<Value>,
    #[serde(default)]
    subject_id: Option<Value>,
    #[serde(rename = "eventId", default)]
    event_id: Option<Value>,
    #[serde(rename = "traceId", default)]
    trace_id: Option<Value>,
    #[serde(rename = "createdAt", default)]
    created_at: Option<Value>,
    #[serde(flatten)]
    payload: Map<String, Value>,
}

/// Non-empty string value of an inbound key; anything else is logged and ignored.
fn string_field(key: &'static str, value: Option<Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s),
        Value::String(_) => None,
        other => {
            warn!(key, value = %other, "Ignoring envelope field with non-string value");
            None
        }
    }
}

fn subject_field(
    user_id: Option<Value>,
    subject_id: Option<Value>,
) -> Result<String, EnvelopeError> {
    match (
        string_field("user_id", user_id),
        string_field("subject_id", subject_id),
    ) {
        (Some(user_id), Some(subject_id)) if user_id != subject_id => {
            Err(EnvelopeError::ConflictingSubject {
                user_id,
                subject_id,
            })
        }
        (Some(id), _) | (None, Some(id)) => Ok(id),
        (None, None) => Err(EnvelopeError::MissingSubject),
    }
}

fn created_at_field(value: Option<Value>) -> Option<DateTime<Utc>> {
    let raw = string_field("createdAt", value)?;
    match DateTime::parse_from_rfc3339(&raw) {
        Ok(at) => Some(at.with_timezone(&Utc)),
        Err(e) => {
            warn!(value = %raw, error = %e, "Ignoring unparseable createdAt");
            None
        }
    }
}

impl Envelope {
    /// Create a fresh envelope with a new event id, stamped now.
    pub fn new(subject_id: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            subject_id: subject_id.into(),
            payload,
            trace_id: None,
            created_at: Some(Utc::now()),
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = event_id.into();
        self
    }

    /// String value of a payload field, if present.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.payload.get(name).and_then(Value::as_str)
    }

    /// Serialize to the JSON wire format.
    pub fn to_vec(&self) -> Result<Vec<u8>, EnvelopeError> {
        let wire = WireEnvelope {
            user_id: &self.subject_id,
            event_id: &self.event_id,
            trace_id: self.trace_id.as_deref(),
            created_at: self.created_at,
            payload: &self.payload,
        };
        Ok(serde_json::to_vec(&wire)?)
    }

    /// Decode from the JSON wire format.
    ///
    /// Only a missing or ambiguous subject rejects the body. `user_id` and
    /// `subject_id` may both appear as long as they agree.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let wire: InboundEnvelope = serde_json::from_slice(bytes)?;
        let subject_id = subject_field(wire.user_id, wire.subject_id)?;
        let event_id = string_field("eventId", wire.event_id)
            .unwrap_or_else(|| derived_event_id(bytes));

        Ok(Self {
            event_id,
            subject_id,
            payload: wire.payload,
            trace_id: string_field("traceId", wire.trace_id),
            created_at: created_at_field(wire.created_at),
        })
    }
}

/// Deterministic event id for a message body that carries none.
pub fn derived_event_id(bytes: &[u8]) -> String {
    Uuid::new_v5(&DERIVED_EVENT_ID_NAMESPACE, bytes).to_string()
}

/// A new account was created by the registration service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRegistered {
    pub user_id: String,
    pub username: String,
}

impl UserRegistered {
    pub fn into_envelope(self, trace_id: Option<String>) -> Envelope {
        let mut payload = Map::new();
        payload.insert("username".to_string(), Value::String(self.username));
        let envelope = Envelope::new(self.user_id, payload);
        match trace_id {
            Some(trace_id) => envelope.with_trace_id(trace_id),
            None => envelope,
        }
    }
}

impl TryFrom<&Envelope> for UserRegistered {
    type Error = EnvelopeError;

    fn try_from(envelope: &Envelope) -> Result<Self, Self::Error> {
        let username = envelope
            .field("username")
            .ok_or(EnvelopeError::MissingField("username"))?;
        Ok(Self {
            user_id: envelope.subject_id.clone(),
            username: username.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_original_wire_format() {
        let body = br#"{"user_id":"u1","username":"alice"}"#;
        let envelope = Envelope::from_slice(body).unwrap();

        assert_eq!(envelope.subject_id, "u1");
        assert_eq!(envelope.field("username"), Some("alice"));
        assert!(envelope.trace_id.is_none());
        assert!(envelope.created_at.is_none());
    }

    #[test]
    fn test_missing_event_id_is_derived_from_body() {
        let body = br#"{"user_id":"u1","username":"alice"}"#;
        let first = Envelope::from_slice(body).unwrap();
        let second = Envelope::from_slice(body).unwrap();
        let other = Envelope::from_slice(br#"{"user_id":"u2","username":"bob"}"#).unwrap();

        assert_eq!(first.event_id, second.event_id);
        assert_ne!(first.event_id, other.event_id);
    }

    #[test]
    fn test_subject_id_alias_accepted() {
        let body = br#"{"subject_id":"u9","eventId":"e9","username":"zed"}"#;
        let envelope = Envelope::from_slice(body).unwrap();
        assert_eq!(envelope.subject_id, "u9");
        assert_eq!(envelope.event_id, "e9");
    }

    #[test]
    fn test_encoded_envelope_is_flat() {
        let envelope = UserRegistered {
            user_id: "u1".to_string(),
            username: "alice".to_string(),
        }
        .into_envelope(Some("t1".to_string()))
        .with_event_id("e1");

        let value: Value = serde_json::from_slice(&envelope.to_vec().unwrap()).unwrap();
        assert_eq!(value["user_id"], "u1");
        assert_eq!(value["username"], "alice");
        assert_eq!(value["eventId"], "e1");
        assert_eq!(value["traceId"], "t1");
        assert!(value["createdAt"].is_string());
    }

    #[test]
    fn test_event_id_survives_reencoding() {
        let envelope = UserRegistered {
            user_id: "u1".to_string(),
            username: "alice".to_string(),
        }
        .into_envelope(None);

        let decoded = Envelope::from_slice(&envelope.to_vec().unwrap()).unwrap();
        assert_eq!(decoded.event_id, envelope.event_id);
        assert_eq!(decoded.created_at, envelope.created_at);
    }

    #[test]
    fn test_missing_subject_rejected() {
        let result = Envelope::from_slice(br#"{"username":"alice"}"#);
        assert!(matches!(result, Err(EnvelopeError::MissingSubject)));
    }

    #[test]
    fn test_unparseable_created_at_is_dropped() {
        let body = br#"{"user_id":"u1","username":"alice","createdAt":"yesterday"}"#;
        let envelope = Envelope::from_slice(body).unwrap();

        assert_eq!(envelope.subject_id, "u1");
        assert!(envelope.created_at.is_none());
        assert!(!envelope.payload.contains_key("createdAt"));
    }

    #[test]
    fn test_created_at_with_offset_normalized_to_utc() {
        let body = br#"{"user_id":"u1","username":"alice","createdAt":"2024-05-01T14:00:00+02:00"}"#;
        let envelope = Envelope::from_slice(body).unwrap();

        let expected: DateTime<Utc> = "2024-05-01T12:00:00Z".parse().unwrap();
        assert_eq!(envelope.created_at, Some(expected));
    }

    #[test]
    fn test_non_string_trace_id_is_dropped() {
        let body = br#"{"user_id":"u1","username":"alice","traceId":12345}"#;
        let envelope = Envelope::from_slice(body).unwrap();

        assert!(envelope.trace_id.is_none());
        assert!(!envelope.payload.contains_key("traceId"));
        assert_eq!(envelope.field("username"), Some("alice"));
    }

    #[test]
    fn test_non_string_event_id_falls_back_to_derived() {
        let body = br#"{"user_id":"u1","username":"alice","eventId":7}"#;
        let envelope = Envelope::from_slice(body).unwrap();
        assert_eq!(envelope.event_id, derived_event_id(body));
    }

    #[test]
    fn test_agreeing_subject_keys_accepted() {
        let body = br#"{"user_id":"u1","subject_id":"u1","username":"alice"}"#;
        let envelope = Envelope::from_slice(body).unwrap();

        assert_eq!(envelope.subject_id, "u1");
        assert!(!envelope.payload.contains_key("subject_id"));
        assert!(!envelope.payload.contains_key("user_id"));
    }

    #[test]
    fn test_conflicting_subject_keys_rejected() {
        let body = br#"{"user_id":"u1","subject_id":"u2","username":"alice"}"#;
        let result = Envelope::from_slice(body);
        assert!(matches!(
            result,
            Err(EnvelopeError::ConflictingSubject { ref user_id, ref subject_id })
                if user_id == "u1" && subject_id == "u2"
        ));
    }

    #[test]
    fn test_garbage_rejected() {
        let result = Envelope::from_slice(b"not json");
        assert!(matches!(result, Err(EnvelopeError::Malformed(_))));
    }

    #[test]
    fn test_user_registered_requires_username() {
        let envelope = Envelope::new("u1", Map::new());
        let result = UserRegistered::try_from(&envelope);
        assert!(matches!(result, Err(EnvelopeError::MissingField("username"))));
    }
}
