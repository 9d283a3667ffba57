use std::time::Duration;

use chat_relay_agent_events::DEFAULT_MAX_BUFFER;
use serde_json::{json, Map, Value};

pub const DEFAULT_AGENT_URL: &str = "http://localhost:8000";
pub const DEFAULT_AGENT_TYPE: &str = "orchestrator";
pub const DEFAULT_INPUT_TYPE: &str = "question";

const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 120;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_READ_TIMEOUT_SECS: u64 = 60;
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Runtime settings of the relay.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Base url of the agent service, without a trailing slash.
    pub agent_url: String,
    pub idle_timeout: Duration,
    pub poll_interval: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub filter_max_buffer: usize,
    pub agent_type: String,
    pub input_type: String,
    /// Frames buffered per connection before sends wait on the client.
    pub channel_capacity: usize,
    pub llm: LlmDefaults,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            agent_url: DEFAULT_AGENT_URL.to_string(),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS),
            filter_max_buffer: DEFAULT_MAX_BUFFER,
            agent_type: DEFAULT_AGENT_TYPE.to_string(),
            input_type: DEFAULT_INPUT_TYPE.to_string(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            llm: LlmDefaults::default(),
        }
    }
}

impl RelayConfig {
    pub fn with_agent_url(mut self, agent_url: impl Into<String>) -> Self {
        self.agent_url = agent_url.into().trim_end_matches('/').to_string();
        self
    }
}

/// Model settings forwarded to the agent service with `config` inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmDefaults {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub execution_model: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

impl Default for LlmDefaults {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o".to_string(),
            execution_model: "gpt-4o".to_string(),
            temperature: 0.7,
            max_tokens: 4000,
        }
    }
}

/// Per-request replacements for the connection part of [`LlmDefaults`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LlmOverrides {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
}

impl LlmDefaults {
    pub fn effective_model<'a>(&'a self, overrides: &'a LlmOverrides) -> &'a str {
        overrides.model.as_deref().unwrap_or(&self.model)
    }

    /// Builds the `metadata` object of a submission carrying model settings.
    pub fn metadata(&self, agent_type: &str, overrides: &LlmOverrides) -> Map<String, Value> {
        let mut metadata = Map::new();
        metadata.insert("agent_type".to_string(), json!(agent_type));
        metadata.insert(
            "llm_config".to_string(),
            json!({
                "api_key": overrides.api_key.as_deref().unwrap_or(&self.api_key),
                "base_url": overrides.base_url.as_deref().unwrap_or(&self.base_url),
                "model": self.effective_model(overrides),
            }),
        );
        metadata.insert("execution_model".to_string(), json!(self.execution_model));
        metadata.insert("temperature".to_string(), json!(self.temperature));
        metadata.insert("max_tokens".to_string(), json!(self.max_tokens));
        metadata
    }
}
