use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chat_relay_error::RelayError;
use futures::{stream, Stream, StreamExt};
use reqwest::Client;
use serde::Serialize;
use serde_json::{Map, Value};

/// Raw `data:` payloads of the upstream generation feed, in arrival order.
pub type UpstreamFeed = Pin<Box<dyn Stream<Item = Result<String, RelayError>> + Send>>;

pub type UpstreamFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RelayError>> + Send + 'a>>;

/// Body of a user input submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitInput {
    pub session_id: String,
    pub user_id: String,
    pub input_text: String,
    pub input_type: String,
    pub metadata: Map<String, Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub file_references: Vec<String>,
}

/// The agent service the relay talks to.
pub trait AgentUpstream: Send + Sync + 'static {
    /// Hands user input to the agent. Anything but an explicit success is a rejection.
    fn submit<'a>(&'a self, input: &'a SubmitInput) -> UpstreamFuture<'a, ()>;

    /// Opens the generation feed of one session.
    fn open_feed(&self, session_id: i64) -> UpstreamFuture<'_, UpstreamFeed>;
}

#[derive(Debug, Clone)]
pub struct HttpAgentClient {
    client: Client,
    base_url: String,
    read_timeout: Duration,
}

impl HttpAgentClient {
    pub fn new(
        base_url: impl Into<String>,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self, RelayError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|err| RelayError::Transport {
                message: format!("failed to build http client: {err}"),
            })?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            read_timeout,
        })
    }

    fn input_url(&self) -> String {
        format!("{}/api/v1/user/input", self.base_url)
    }

    fn stream_url(&self) -> String {
        format!("{}/api/v1/stream", self.base_url)
    }
}

impl AgentUpstream for HttpAgentClient {
    fn submit<'a>(&'a self, input: &'a SubmitInput) -> UpstreamFuture<'a, ()> {
        Box::pin(async move {
            let start = std::time::Instant::now();
            let response = self
                .client
                .post(self.input_url())
                .timeout(self.read_timeout)
                .json(input)
                .send()
                .await
                .map_err(transport_error)?;

            let status = response.status();
            if !status.is_success() {
                return Err(RelayError::SubmissionRejected {
                    message: format!("agent responded with http {status}"),
                });
            }

            let body: Value = response.json().await.map_err(|err| {
                RelayError::SubmissionRejected {
                    message: format!("unreadable submission response: {err}"),
                }
            })?;
            match body.get("status").and_then(Value::as_str) {
                Some("success") => {
                    tracing::debug!(
                        session_id = %input.session_id,
                        input_type = %input.input_type,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "upstream: input accepted"
                    );
                    Ok(())
                }
                other => Err(RelayError::SubmissionRejected {
                    message: format!("status={}", other.unwrap_or("<missing>")),
                }),
            }
        })
    }

    fn open_feed(&self, session_id: i64) -> UpstreamFuture<'_, UpstreamFeed> {
        Box::pin(async move {
            let request = self
                .client
                .get(self.stream_url())
                .query(&[("session_id", session_id.to_string())])
                .header(reqwest::header::ACCEPT, "text/event-stream")
                .send();
            let response = tokio::time::timeout(self.read_timeout, request)
                .await
                .map_err(|_| RelayError::Timeout {
                    message: Some("agent stream did not respond".to_string()),
                })?
                .map_err(transport_error)?;

            let status = response.status();
            if !status.is_success() {
                return Err(RelayError::Transport {
                    message: format!("agent stream responded with http {status}"),
                });
            }

            tracing::debug!(session_id = session_id, "upstream: feed opened");
            Ok(data_feed(response.bytes_stream(), self.read_timeout))
        })
    }
}

fn transport_error(err: reqwest::Error) -> RelayError {
    if err.is_timeout() {
        return RelayError::Timeout {
            message: Some(err.to_string()),
        };
    }
    RelayError::Transport {
        message: err.to_string(),
    }
}

struct FeedState<S> {
    body: Pin<Box<S>>,
    lines: DataLines,
    pending: VecDeque<String>,
    read_timeout: Duration,
    done: bool,
}

/// Turns a byte body into `data:` payloads, bounding every read by `read_timeout`.
/// A failed or timed out read is yielded once and ends the feed.
pub fn data_feed<S, B, E>(body: S, read_timeout: Duration) -> UpstreamFeed
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let state = FeedState {
        body: Box::pin(body),
        lines: DataLines::default(),
        pending: VecDeque::new(),
        read_timeout,
        done: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(payload) = state.pending.pop_front() {
                return Some((Ok(payload), state));
            }
            if state.done {
                return None;
            }

            match tokio::time::timeout(state.read_timeout, state.body.next()).await {
                Err(_) => {
                    state.done = true;
                    let err = RelayError::Timeout {
                        message: Some(format!(
                            "no upstream data within {}s",
                            state.read_timeout.as_secs()
                        )),
                    };
                    return Some((Err(err), state));
                }
                Ok(None) => {
                    state.done = true;
                    state.pending.extend(state.lines.finish());
                }
                Ok(Some(Err(err))) => {
                    state.done = true;
                    let err = RelayError::Transport {
                        message: format!("upstream read failed: {err}"),
                    };
                    return Some((Err(err), state));
                }
                Ok(Some(Ok(chunk))) => {
                    let payloads = state.lines.push(chunk.as_ref());
                    state.pending.extend(payloads);
                }
            }
        }
    }))
}

/// Splits a byte stream into lines and keeps the payload of `data:` lines.
/// Every data line is one upstream message; blank lines and other SSE
/// fields are ignored.
#[derive(Debug, Default)]
pub struct DataLines {
    buffer: Vec<u8>,
}

impl DataLines {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line = self.buffer.drain(..=pos).collect::<Vec<_>>();
            payloads.extend(data_payload(&line[..line.len() - 1]));
        }
        payloads
    }

    /// Payload of a final line that was not newline terminated.
    pub fn finish(&mut self) -> Option<String> {
        let line = std::mem::take(&mut self.buffer);
        data_payload(&line)
    }
}

fn data_payload(line: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(line);
    let line = line.strip_suffix('\r').unwrap_or(&line);
    let data = line.strip_prefix("data:")?;
    let data = data.strip_prefix(' ').unwrap_or(data);
    if data.trim().is_empty() {
        return None;
    }
    Some(data.to_string())
}
