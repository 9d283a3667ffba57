//! Canonical upstream agent events and the text filtering applied to their deltas.

use serde::{Deserialize, Serialize};

pub mod decode;
pub mod filter;

pub use decode::{decode_message, DecodeError, WireMessage};
pub use filter::{DeltaFilter, DEFAULT_MAX_BUFFER};

/// Event type carrying an incremental text fragment of the reply.
pub const CHUNK_EVENT: &str = "llm_tool.chunk";
/// Event type marking the end of one generation loop.
pub const LOOP_END_EVENT: &str = "agent.loop_end";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<DeltaPayload>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaPayload {
    pub delta: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// End of generation; nothing after it belongs to the current reply.
    LoopEnd,
    /// A content chunk whose delta is relayed downstream.
    Chunk,
    Other,
}

impl CanonicalEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            session_id: None,
            user_id: None,
            tool: None,
            payload: None,
        }
    }

    pub fn chunk(session_id: impl Into<String>, delta: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            payload: Some(DeltaPayload {
                delta: delta.into(),
            }),
            ..Self::new(CHUNK_EVENT)
        }
    }

    pub fn loop_end(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Self::new(LOOP_END_EVENT)
        }
    }

    pub fn kind(&self) -> EventKind {
        match self.event_type.as_str() {
            LOOP_END_EVENT => EventKind::LoopEnd,
            CHUNK_EVENT => EventKind::Chunk,
            _ => EventKind::Other,
        }
    }

    pub fn delta(&self) -> Option<&str> {
        self.payload.as_ref().map(|payload| payload.delta.as_str())
    }

    /// Events without a session id are attributed to whichever session is
    /// reading the feed.
    pub fn belongs_to(&self, session_id: &str) -> bool {
        self.session_id
            .as_deref()
            .map_or(true, |own| own == session_id)
    }
}
