use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{Request, StatusCode};
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use chat_relay_error::{ErrorType, ProblemDetails, RelayError};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{Modify, OpenApi, ToSchema};

use crate::config::LlmOverrides;
use crate::connection::{frame_stream, FrameReceiver};
use crate::frame::Frame;
use crate::orchestrator::{ChatRelay, StreamOutcome, TurnRequest};
use crate::store::{MessageType, Record};

const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

#[derive(Debug)]
pub struct AppState {
    relay: ChatRelay,
}

impl AppState {
    pub fn new(relay: ChatRelay) -> Self {
        Self { relay }
    }

    pub fn relay(&self) -> &ChatRelay {
        &self.relay
    }
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let v1_router = Router::new()
        .route("/health", get(get_health))
        .route("/openapi.json", get(get_openapi))
        .route("/sessions/:session_id/stream", get(open_stream))
        .route(
            "/sessions/:session_id/messages/stream",
            post(post_message_stream),
        )
        .route("/sessions/:session_id/messages/input", post(post_input))
        .route("/sessions/:session_id/config", post(post_config))
        .route("/sessions/:session_id/records", get(get_records))
        .route("/sessions/:session_id/timeout/stop", post(stop_timeout))
        .route(
            "/sessions/:session_id/timeout/restart",
            post(restart_timeout),
        )
        .with_state(shared.clone());

    let mut router = Router::new()
        .route("/", get(get_root))
        .nest("/v1", v1_router)
        .fallback(not_found);

    let http_logging = match std::env::var("CHAT_RELAY_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|req: &Request<_>| {
                tracing::info_span!(
                    "http.request",
                    method = %req.method(),
                    uri = %req.uri()
                )
            })
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::info!(parent: span, "request");
            })
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    (router, shared)
}

/// Stops idle watchdogs and closes every open session stream.
pub async fn shutdown_relay(state: &Arc<AppState>) {
    state.relay.shutdown().await;
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_health,
        open_stream,
        post_message_stream,
        post_input,
        post_config,
        get_records,
        stop_timeout,
        restart_timeout
    ),
    components(
        schemas(
            HealthResponse,
            StreamQuery,
            MessageRequest,
            TurnAcceptedResponse,
            InputRequest,
            InputResponse,
            ConfigRequest,
            ConfigResponse,
            RecordsResponse,
            TimeoutResponse,
            Record,
            MessageType,
            Frame,
            ProblemDetails,
            ErrorType
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "sessions", description = "Session streams and messages")
    ),
    modifiers(&ServerAddon)
)]
pub struct ApiDoc;

struct ServerAddon;

impl Modify for ServerAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        openapi.servers = Some(vec![utoipa::openapi::Server::new("http://localhost:2480")]);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Relay(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StreamQuery {
    #[serde(alias = "userId")]
    pub uid: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MessageRequest {
    pub user_id: i64,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_references: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TurnAcceptedResponse {
    pub session_id: i64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InputRequest {
    pub user_id: i64,
    #[serde(default)]
    pub content: String,
    pub input_type: String,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InputResponse {
    pub accepted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigRequest {
    pub user_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigResponse {
    pub record: Record,
    pub applied: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RecordsResponse {
    pub records: Vec<Record>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutResponse {
    pub session_id: i64,
    pub ok: bool,
}

const SERVER_INFO: &str = "\
This is a Chat Relay server. Available endpoints:\n\
  - GET  /                               - Server info\n\
  - GET  /v1/health                      - Health check\n\
  - GET  /v1/sessions/:id/stream         - Session event stream\n\
  - POST /v1/sessions/:id/messages/stream - Send a message and stream the reply\n\
  - GET  /v1/openapi.json                - OpenAPI document";

async fn get_root() -> &'static str {
    SERVER_INFO
}

async fn not_found() -> (StatusCode, String) {
    (
        StatusCode::NOT_FOUND,
        format!("404 Not Found\n\n{SERVER_INFO}"),
    )
}

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

fn sse_response(
    receiver: FrameReceiver,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    Sse::new(frame_stream(receiver)).keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE))
}

#[utoipa::path(
    get,
    path = "/v1/health",
    responses((status = 200, body = HealthResponse)),
    tag = "meta"
)]
async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

#[utoipa::path(
    get,
    path = "/v1/sessions/{session_id}/stream",
    params(
        ("session_id" = i64, Path, description = "Session id"),
        ("uid" = i64, Query, description = "User id")
    ),
    responses((status = 200, description = "SSE frame stream")),
    tag = "sessions"
)]
async fn open_stream(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<i64>,
    Query(query): Query<StreamQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.relay.open_connection(query.uid, session_id).await;
    sse_response(receiver)
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}/messages/stream",
    request_body = MessageRequest,
    params(("session_id" = i64, Path, description = "Session id")),
    responses(
        (status = 200, description = "SSE frame stream on a new connection"),
        (status = 202, body = TurnAcceptedResponse, description = "Reply streams on the existing connection"),
        (status = 400, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn post_message_stream(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<i64>,
    Json(request): Json<MessageRequest>,
) -> Result<Response, ApiError> {
    let outcome = state
        .relay
        .send_message(
            session_id,
            TurnRequest {
                user_id: request.user_id,
                content: request.content,
                agent_type: request.agent_type,
                input_type: request.input_type,
                file_references: request.file_references,
            },
        )
        .await?;

    Ok(match outcome {
        StreamOutcome::Opened(receiver) => sse_response(receiver).into_response(),
        StreamOutcome::Reused => (
            StatusCode::ACCEPTED,
            Json(TurnAcceptedResponse {
                session_id,
                message: "reply streams on the existing session connection".to_string(),
            }),
        )
            .into_response(),
    })
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}/messages/input",
    request_body = InputRequest,
    params(("session_id" = i64, Path, description = "Session id")),
    responses((status = 200, body = InputResponse)),
    tag = "sessions"
)]
async fn post_input(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<i64>,
    Json(request): Json<InputRequest>,
) -> Json<InputResponse> {
    let accepted = state
        .relay
        .send_input(
            session_id,
            request.user_id,
            &request.content,
            request.metadata,
            &request.input_type,
        )
        .await;
    Json(InputResponse { accepted })
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}/config",
    request_body = ConfigRequest,
    params(("session_id" = i64, Path, description = "Session id")),
    responses(
        (status = 200, body = ConfigResponse),
        (status = 500, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn post_config(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<i64>,
    Json(request): Json<ConfigRequest>,
) -> Result<Json<ConfigResponse>, ApiError> {
    let overrides = LlmOverrides {
        api_key: request.api_key,
        base_url: request.base_url,
        model: request.model,
    };
    let outcome = state
        .relay
        .send_config(request.user_id, session_id, request.agent_type, overrides)
        .await?;
    Ok(Json(ConfigResponse {
        record: outcome.record,
        applied: outcome.applied,
    }))
}

#[utoipa::path(
    get,
    path = "/v1/sessions/{session_id}/records",
    params(("session_id" = i64, Path, description = "Session id")),
    responses(
        (status = 200, body = RecordsResponse),
        (status = 500, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn get_records(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<i64>,
) -> Result<Json<RecordsResponse>, ApiError> {
    let records = state.relay.records(session_id).await?;
    Ok(Json(RecordsResponse { records }))
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}/timeout/stop",
    params(("session_id" = i64, Path, description = "Session id")),
    responses((status = 200, body = TimeoutResponse)),
    tag = "sessions"
)]
async fn stop_timeout(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<i64>,
) -> Json<TimeoutResponse> {
    let ok = state.relay.stop_timeout(session_id).await;
    Json(TimeoutResponse { session_id, ok })
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}/timeout/restart",
    params(("session_id" = i64, Path, description = "Session id")),
    responses((status = 200, body = TimeoutResponse)),
    tag = "sessions"
)]
async fn restart_timeout(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<i64>,
) -> Json<TimeoutResponse> {
    let ok = state.relay.restart_timeout(session_id).await;
    Json(TimeoutResponse { session_id, ok })
}
