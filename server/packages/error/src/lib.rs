use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    SubmissionRejected,
    DecodeFailure,
    TransportError,
    ConnectionClosed,
    Timeout,
    PersistenceFailed,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:chat-relay:error:invalid_request",
            Self::SubmissionRejected => "urn:chat-relay:error:submission_rejected",
            Self::DecodeFailure => "urn:chat-relay:error:decode_failure",
            Self::TransportError => "urn:chat-relay:error:transport_error",
            Self::ConnectionClosed => "urn:chat-relay:error:connection_closed",
            Self::Timeout => "urn:chat-relay:error:timeout",
            Self::PersistenceFailed => "urn:chat-relay:error:persistence_failed",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::SubmissionRejected => "Submission Rejected",
            Self::DecodeFailure => "Decode Failure",
            Self::TransportError => "Transport Error",
            Self::ConnectionClosed => "Connection Closed",
            Self::Timeout => "Timeout",
            Self::PersistenceFailed => "Persistence Failed",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::SubmissionRejected => 502,
            Self::DecodeFailure => 502,
            Self::TransportError => 502,
            Self::ConnectionClosed => 410,
            Self::Timeout => 504,
            Self::PersistenceFailed => 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

/// Failures of the relay. Every variant is scoped to one session or turn;
/// none of them is fatal to the process.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    /// The agent service refused the submitted input.
    #[error("submission rejected: {message}")]
    SubmissionRejected { message: String },
    /// A single upstream message could not be decoded.
    #[error("decode failure: {message}")]
    Decode { message: String },
    /// Connecting to or reading from the upstream feed failed.
    #[error("transport error: {message}")]
    Transport { message: String },
    #[error("connection {connection_id} already closed")]
    ConnectionAlreadyClosed { connection_id: u64 },
    #[error("timeout")]
    Timeout { message: Option<String> },
    #[error("persistence failed: {message}")]
    Persistence { message: String },
}

impl RelayError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::SubmissionRejected { .. } => ErrorType::SubmissionRejected,
            Self::Decode { .. } => ErrorType::DecodeFailure,
            Self::Transport { .. } => ErrorType::TransportError,
            Self::ConnectionAlreadyClosed { .. } => ErrorType::ConnectionClosed,
            Self::Timeout { .. } => ErrorType::Timeout,
            Self::Persistence { .. } => ErrorType::PersistenceFailed,
        }
    }

    /// Whether the failure terminates the current turn. Decode failures and
    /// sends on closed connections are recovered where they happen.
    pub fn is_fatal_for_turn(&self) -> bool {
        !matches!(
            self,
            Self::Decode { .. } | Self::ConnectionAlreadyClosed { .. }
        )
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));

        let mut extensions = Map::new();
        match self {
            Self::ConnectionAlreadyClosed { connection_id } => {
                extensions.insert(
                    "connectionId".to_string(),
                    Value::Number(serde_json::Number::from(*connection_id)),
                );
            }
            Self::Timeout {
                message: Some(message),
            } => {
                let mut details = Map::new();
                details.insert("message".to_string(), Value::String(message.clone()));
                extensions.insert("details".to_string(), Value::Object(details));
            }
            _ => {}
        }
        problem.extensions = extensions;
        problem
    }
}

impl From<RelayError> for ProblemDetails {
    fn from(value: RelayError) -> Self {
        value.to_problem_details()
    }
}

impl From<&RelayError> for ProblemDetails {
    fn from(value: &RelayError) -> Self {
        value.to_problem_details()
    }
}
