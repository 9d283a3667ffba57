//! Relays incrementally generated agent replies to per-session SSE streams.

pub mod cli;
pub mod config;
pub mod connection;
pub mod frame;
pub mod orchestrator;
pub mod registry;
pub mod router;
pub mod store;
pub mod supervisor;
pub mod upstream;

pub use config::{LlmDefaults, LlmOverrides, RelayConfig};
pub use frame::Frame;
pub use orchestrator::{ChatRelay, ConfigOutcome, StreamOutcome, TurnRequest};
pub use upstream::{AgentUpstream, HttpAgentClient, SubmitInput};
