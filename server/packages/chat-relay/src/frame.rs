use axum::response::sse::Event;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// One downstream push. Serialized as the SSE `data` payload; the variant
/// also names the SSE event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Start {
        message: String,
    },
    Delta {
        content: String,
    },
    Complete {
        message: String,
        #[serde(rename = "recordId")]
        record_id: i64,
    },
    Error {
        message: String,
    },
    Connection {
        message: String,
        #[serde(rename = "sessionId")]
        session_id: i64,
        #[serde(rename = "userId")]
        user_id: i64,
    },
}

impl Frame {
    pub fn start(message: impl Into<String>) -> Self {
        Self::Start {
            message: message.into(),
        }
    }

    pub fn delta(content: impl Into<String>) -> Self {
        Self::Delta {
            content: content.into(),
        }
    }

    pub fn complete(message: impl Into<String>, record_id: i64) -> Self {
        Self::Complete {
            message: message.into(),
            record_id,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn connection(session_id: i64, user_id: i64) -> Self {
        Self::Connection {
            message: "session stream established".to_string(),
            session_id,
            user_id,
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Delta { .. } => "delta",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
            Self::Connection { .. } => "connection",
        }
    }

    pub fn to_sse_event(&self) -> Event {
        Event::default()
            .event(self.event_name())
            .json_data(self)
            .unwrap_or_else(|_| Event::default().event(self.event_name()).data("{}"))
    }
}
