use serde_json::{Map, Value};
use thiserror::Error;

use crate::{CanonicalEvent, DeltaPayload};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("message is not a json object")]
    NotAnObject,
    #[error("`events` field is not an array")]
    EventsNotArray,
}

/// The envelope shapes the agent service has used over time. Classifying a
/// message is a single step; consumers only ever see [`CanonicalEvent`]s.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    /// `{"type":"connection","message":...}` sent once when the feed opens.
    ConnectionAck { message: Option<String> },
    /// `{"events":[...]}`
    Batch(Vec<Value>),
    /// `{"type":"event","data":{"data":{"batch":true,"events":[...]}}}`
    LegacyBatch(Vec<Value>),
    /// A bare event object.
    Single(Map<String, Value>),
}

impl WireMessage {
    pub fn parse(raw: &str) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_str(raw)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        let Value::Object(mut object) = value else {
            return Err(DecodeError::NotAnObject);
        };

        let message_type = object
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string);
        if message_type.as_deref() == Some("connection") {
            let message = object
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string);
            return Ok(Self::ConnectionAck { message });
        }

        if let Some(events) = object.remove("events") {
            return match events {
                Value::Array(events) => Ok(Self::Batch(events)),
                _ => Err(DecodeError::EventsNotArray),
            };
        }

        if message_type.as_deref() == Some("event") {
            let inner = object
                .get("data")
                .and_then(|data| data.get("data"))
                .filter(|inner| inner.get("batch").and_then(Value::as_bool) == Some(true));
            if let Some(inner) = inner {
                let events = inner
                    .get("events")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                return Ok(Self::LegacyBatch(events));
            }
        }

        Ok(Self::Single(object))
    }

    pub fn into_events(self) -> Vec<CanonicalEvent> {
        match self {
            Self::ConnectionAck { message } => {
                tracing::info!(message = ?message, "upstream: connection acknowledged");
                Vec::new()
            }
            Self::Batch(events) | Self::LegacyBatch(events) => {
                let total = events.len();
                events
                    .into_iter()
                    .enumerate()
                    .filter_map(|(index, event)| match event {
                        Value::Object(object) => Some(normalize_event(&object)),
                        other => {
                            tracing::warn!(
                                index = index,
                                total = total,
                                kind = value_kind(&other),
                                "upstream: skipping non-object batch element"
                            );
                            None
                        }
                    })
                    .collect()
            }
            Self::Single(object) => vec![normalize_event(&object)],
        }
    }
}

/// Decodes one `data:` payload into canonical events.
pub fn decode_message(raw: &str) -> Result<Vec<CanonicalEvent>, DecodeError> {
    Ok(WireMessage::parse(raw)?.into_events())
}

/// Reads the event fields from the top level, falling back to a nested
/// `data` object for every field that is missing.
pub fn normalize_event(object: &Map<String, Value>) -> CanonicalEvent {
    let nested = object.get("data").and_then(Value::as_object);
    let field = |key: &str| {
        string_field(object, key).or_else(|| nested.and_then(|data| string_field(data, key)))
    };

    let payload = object
        .get("payload")
        .and_then(Value::as_object)
        .or_else(|| {
            nested
                .and_then(|data| data.get("payload"))
                .and_then(Value::as_object)
        })
        .and_then(|payload| string_field(payload, "delta"))
        .map(|delta| DeltaPayload { delta });

    CanonicalEvent {
        event_type: field("event").unwrap_or_default(),
        session_id: field("session_id"),
        user_id: field("user_id"),
        tool: field("tool"),
        payload,
    }
}

fn string_field(object: &Map<String, Value>, key: &str) -> Option<String> {
    match object.get(key)? {
        Value::String(value) => Some(value.clone()),
        Value::Number(value) => Some(value.to_string()),
        _ => None,
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
