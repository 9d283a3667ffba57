#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use chat_relay::router::{build_router, AppState};
use chat_relay::upstream::{UpstreamFeed, UpstreamFuture};
use chat_relay::{AgentUpstream, ChatRelay, RelayConfig, SubmitInput};
use chat_relay_agent_events::{CHUNK_EVENT, LOOP_END_EVENT};
use chat_relay_error::RelayError;
use futures::stream;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::util::ServiceExt;

/// Accepts every input except the text `reject` and answers each feed with
/// the configured deltas followed by a loop end.
pub struct CannedAgent {
    deltas: Vec<String>,
    submitted: Mutex<Vec<SubmitInput>>,
}

impl CannedAgent {
    pub fn new(deltas: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            deltas: deltas.iter().map(|delta| delta.to_string()).collect(),
            submitted: Mutex::new(Vec::new()),
        })
    }

    pub fn submitted(&self) -> Vec<SubmitInput> {
        self.submitted.lock().expect("submitted").clone()
    }
}

impl AgentUpstream for CannedAgent {
    fn submit<'a>(&'a self, input: &'a SubmitInput) -> UpstreamFuture<'a, ()> {
        Box::pin(async move {
            self.submitted.lock().expect("submitted").push(input.clone());
            if input.input_text == "reject" {
                return Err(RelayError::SubmissionRejected {
                    message: "status=error".to_string(),
                });
            }
            Ok(())
        })
    }

    fn open_feed(&self, session_id: i64) -> UpstreamFuture<'_, UpstreamFeed> {
        let session = session_id.to_string();
        let mut lines = self
            .deltas
            .iter()
            .map(|delta| {
                Ok(json!({
                    "event": CHUNK_EVENT,
                    "session_id": session,
                    "payload": {"delta": delta}
                })
                .to_string())
            })
            .collect::<Vec<_>>();
        lines.push(Ok(json!({"event": LOOP_END_EVENT, "session_id": session}).to_string()));
        Box::pin(async move { Ok(Box::pin(stream::iter(lines)) as UpstreamFeed) })
    }
}

pub struct TestApp {
    pub app: Router,
    pub agent: Arc<CannedAgent>,
}

impl TestApp {
    pub fn new(deltas: &[&str]) -> Self {
        let agent = CannedAgent::new(deltas);
        let (relay, _store) = ChatRelay::with_memory_store(RelayConfig::default(), agent.clone());
        Self {
            app: build_router(AppState::new(relay)),
            agent,
        }
    }
}

pub async fn send_json(
    app: &Router,
    method: Method,
    path: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(path);
    let body = if let Some(body) = body {
        builder = builder.header("content-type", "application/json");
        Body::from(body.to_string())
    } else {
        Body::empty()
    };
    let request = builder.body(body).expect("request");
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("request handled");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or(Value::String(String::from_utf8_lossy(&bytes).to_string()))
    };
    (status, value)
}
