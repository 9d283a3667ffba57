use std::sync::Arc;
use std::time::Duration;

use chat_relay_error::RelayError;
use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use axum::http::{header, HeaderName, HeaderValue, Method};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{
    LlmDefaults, RelayConfig, DEFAULT_AGENT_TYPE, DEFAULT_AGENT_URL, DEFAULT_INPUT_TYPE,
};
use crate::orchestrator::ChatRelay;
use crate::router::{build_router_with_state, shutdown_relay, AppState};
use crate::upstream::HttpAgentClient;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 2480;

#[derive(Parser, Debug)]
#[command(name = "chat-relay", bin_name = "chat-relay")]
#[command(about = "Session-scoped SSE relay for agent replies", version)]
#[command(arg_required_else_help = true)]
pub struct ChatRelayCli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay HTTP server.
    Server(ServerArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', env = "CHAT_RELAY_HOST", default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', env = "CHAT_RELAY_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Base url of the agent service.
    #[arg(long, short = 'u', env = "CHAT_RELAY_AGENT_URL", default_value = DEFAULT_AGENT_URL)]
    agent_url: String,

    /// Seconds without a sent frame before a session connection is closed.
    #[arg(long, env = "CHAT_RELAY_IDLE_TIMEOUT_SECS", default_value_t = 120)]
    idle_timeout_secs: u64,

    #[arg(long, env = "CHAT_RELAY_POLL_INTERVAL_SECS", default_value_t = 5)]
    poll_interval_secs: u64,

    #[arg(long, env = "CHAT_RELAY_CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    connect_timeout_secs: u64,

    #[arg(long, env = "CHAT_RELAY_READ_TIMEOUT_SECS", default_value_t = 60)]
    read_timeout_secs: u64,

    /// Characters the delta filter may hold back while waiting for a tag to close.
    #[arg(long, env = "CHAT_RELAY_FILTER_MAX_BUFFER", default_value_t = 50)]
    filter_max_buffer: usize,

    #[arg(long, env = "CHAT_RELAY_AGENT_TYPE", default_value = DEFAULT_AGENT_TYPE)]
    agent_type: String,

    #[arg(long, env = "CHAT_RELAY_INPUT_TYPE", default_value = DEFAULT_INPUT_TYPE)]
    input_type: String,

    #[arg(long, env = "CHAT_RELAY_LLM_API_KEY", hide_env_values = true)]
    llm_api_key: Option<String>,

    #[arg(long, env = "CHAT_RELAY_LLM_BASE_URL")]
    llm_base_url: Option<String>,

    #[arg(long, env = "CHAT_RELAY_LLM_MODEL")]
    llm_model: Option<String>,

    /// Browser origins allowed to open session streams. `*` allows any origin.
    #[arg(
        long = "cors-allow-origin",
        short = 'O',
        env = "CHAT_RELAY_CORS_ORIGINS",
        value_delimiter = ','
    )]
    cors_allow_origin: Vec<String>,
}

impl ServerArgs {
    pub fn relay_config(&self) -> RelayConfig {
        let defaults = LlmDefaults::default();
        let llm = LlmDefaults {
            api_key: self.llm_api_key.clone().unwrap_or(defaults.api_key),
            base_url: self.llm_base_url.clone().unwrap_or(defaults.base_url),
            model: self.llm_model.clone().unwrap_or(defaults.model),
            ..defaults
        };
        RelayConfig {
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            filter_max_buffer: self.filter_max_buffer,
            agent_type: self.agent_type.clone(),
            input_type: self.input_type.clone(),
            llm,
            ..RelayConfig::default()
        }
        .with_agent_url(self.agent_url.clone())
    }
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("relay error: {0}")]
    Relay(#[from] RelayError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run_chat_relay() -> Result<(), CliError> {
    let cli = ChatRelayCli::parse();
    if let Err(err) = init_logging() {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }
    run_command(&cli.command)
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .try_init()
        .map_err(|err| CliError::Server(err.to_string()))
}

pub fn run_command(command: &Command) -> Result<(), CliError> {
    match command {
        Command::Server(args) => run_server(args),
    }
}

fn run_server(server: &ServerArgs) -> Result<(), CliError> {
    let config = server.relay_config();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let upstream = HttpAgentClient::new(
            config.agent_url.clone(),
            config.connect_timeout,
            config.read_timeout,
        )?;
        tracing::info!(
            agent_url = %config.agent_url,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            filter_max_buffer = config.filter_max_buffer,
            "relay configured"
        );
        let (relay, _store) = ChatRelay::with_memory_store(config, Arc::new(upstream));
        let state = Arc::new(AppState::new(relay));
        let (mut router, state) = build_router_with_state(state);
        router = router.layer(build_cors_layer(&server.cors_allow_origin)?);

        let addr = format!("{}:{}", server.host, server.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "server listening");

        let shutdown_state = state.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                shutdown_relay(&shutdown_state).await;
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

/// Session streams are opened with GET and turns are posted as JSON, so only
/// the allowed origins vary. With none configured, cross-origin requests get
/// no CORS headers.
fn build_cors_layer(origins: &[String]) -> Result<CorsLayer, CliError> {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            header::CONTENT_TYPE,
            header::ACCEPT,
            HeaderName::from_static("last-event-id"),
        ]);

    if origins.iter().any(|origin| origin == "*") {
        return Ok(cors.allow_origin(Any));
    }
    let origins = origins
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin).map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(cors.allow_origin(AllowOrigin::list(origins)))
}
