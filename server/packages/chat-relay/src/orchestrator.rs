use std::sync::Arc;

use chat_relay_agent_events::{decode_message, CanonicalEvent, DeltaFilter, EventKind};
use chat_relay_error::RelayError;
use futures::StreamExt;
use serde_json::{json, Map, Value};

use crate::config::{LlmOverrides, RelayConfig};
use crate::connection::{Connection, FrameReceiver};
use crate::frame::Frame;
use crate::registry::{ConnectionLease, ConnectionRegistry};
use crate::store::{FileCatalog, MemoryStore, MessageType, NewRecord, Record, RecordStore, SessionStore};
use crate::supervisor::IdleSupervisor;
use crate::upstream::{AgentUpstream, SubmitInput};

const CONFIG_INPUT_TYPE: &str = "config";
const THINKING_MESSAGE: &str = "AI is thinking...";
const REPLY_COMPLETE_MESSAGE: &str = "Reply complete";
const SUBMIT_FAILED_MESSAGE: &str = "Failed to submit user input";
const EMPTY_REPLY_PLACEHOLDER: &str = "AI reply was empty";
const CONFIG_START_MESSAGE: &str = "Configuring LLM parameters...";
const CONFIG_APPLIED_MESSAGE: &str = "LLM configuration updated";
const CONFIG_FAILED_MESSAGE: &str = "LLM configuration update failed";

/// One user message to relay.
#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub user_id: i64,
    pub content: String,
    pub agent_type: Option<String>,
    pub input_type: Option<String>,
    pub file_references: Vec<String>,
}

#[derive(Debug)]
pub enum StreamOutcome {
    /// A new connection was created for the session; the caller serves it.
    Opened(FrameReceiver),
    /// The session already had a live connection and the turn is relayed there.
    Reused,
}

#[derive(Debug, Clone)]
pub struct ConfigOutcome {
    pub record: Record,
    pub applied: bool,
}

#[derive(Debug)]
struct Turn {
    session_id: i64,
    user_id: i64,
    content: String,
    agent_type: String,
    input_type: String,
    file_references: Vec<String>,
    reply_sequence: i64,
}

/// Relays agent generations to session connections.
#[derive(Clone)]
pub struct ChatRelay {
    inner: Arc<ChatRelayInner>,
}

struct ChatRelayInner {
    config: RelayConfig,
    registry: Arc<ConnectionRegistry>,
    supervisor: IdleSupervisor,
    upstream: Arc<dyn AgentUpstream>,
    records: Arc<dyn RecordStore>,
    sessions: Arc<dyn SessionStore>,
    files: Arc<dyn FileCatalog>,
}

impl std::fmt::Debug for ChatRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatRelay")
            .field("agent_url", &self.inner.config.agent_url)
            .finish_non_exhaustive()
    }
}

impl ChatRelay {
    pub fn new(
        config: RelayConfig,
        upstream: Arc<dyn AgentUpstream>,
        records: Arc<dyn RecordStore>,
        sessions: Arc<dyn SessionStore>,
        files: Arc<dyn FileCatalog>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let supervisor =
            IdleSupervisor::new(registry.clone(), config.idle_timeout, config.poll_interval);
        Self {
            inner: Arc::new(ChatRelayInner {
                config,
                registry,
                supervisor,
                upstream,
                records,
                sessions,
                files,
            }),
        }
    }

    /// A relay backed by a single [`MemoryStore`] for every collaborator.
    pub fn with_memory_store(
        config: RelayConfig,
        upstream: Arc<dyn AgentUpstream>,
    ) -> (Self, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let relay = Self::new(config, upstream, store.clone(), store.clone(), store.clone());
        (relay, store)
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.inner.registry
    }

    /// Opens a fresh connection for the session, replacing any existing one.
    pub async fn open_connection(&self, user_id: i64, session_id: i64) -> FrameReceiver {
        let (connection, receiver) =
            Connection::open(session_id, self.inner.config.channel_capacity);
        self.inner
            .registry
            .register(session_id, connection.clone())
            .await;
        self.attach(&connection, user_id).await;
        tracing::info!(
            session_id = session_id,
            user_id = user_id,
            connection_id = connection.id(),
            "relay: connection opened"
        );
        receiver
    }

    /// Persists the user message and starts relaying the agent's reply.
    pub async fn send_message(
        &self,
        session_id: i64,
        request: TurnRequest,
    ) -> Result<StreamOutcome, RelayError> {
        if request.content.trim().is_empty() && request.file_references.is_empty() {
            return Err(RelayError::InvalidRequest {
                message: "message content must not be empty".to_string(),
            });
        }

        let capacity = self.inner.config.channel_capacity;
        let lease = self
            .inner
            .registry
            .get_or_create(session_id, || Connection::open(session_id, capacity))
            .await;
        match &lease {
            ConnectionLease::Created(connection, _) => {
                self.attach(connection, request.user_id).await;
            }
            ConnectionLease::Existing(connection) => {
                tracing::info!(
                    session_id = session_id,
                    connection_id = connection.id(),
                    "relay: reusing session connection"
                );
            }
        }

        if let Err(err) = self.inner.sessions.touch_updated_time(session_id).await {
            tracing::warn!(
                session_id = session_id,
                error = %err,
                "relay: failed to update session time"
            );
        }

        let file_references = self
            .owned_files(session_id, request.user_id, &request.file_references)
            .await;

        let sequence = self.next_sequence(session_id).await?;
        self.inner
            .records
            .save(NewRecord {
                sid: session_id,
                uid: request.user_id,
                direction: true,
                content: request.content.clone(),
                sequence,
                message_type: MessageType::User,
            })
            .await?;

        let turn = Turn {
            session_id,
            user_id: request.user_id,
            content: request.content,
            agent_type: request
                .agent_type
                .unwrap_or_else(|| self.inner.config.agent_type.clone()),
            input_type: request
                .input_type
                .unwrap_or_else(|| self.inner.config.input_type.clone()),
            file_references,
            reply_sequence: sequence + 1,
        };
        tokio::spawn(self.clone().run_turn(turn));

        Ok(match lease {
            ConnectionLease::Created(_, receiver) => StreamOutcome::Opened(receiver),
            ConnectionLease::Existing(_) => StreamOutcome::Reused,
        })
    }

    /// Submits input that produces no streamed reply (`config`, `delete`, `intervention`).
    pub async fn send_input(
        &self,
        session_id: i64,
        user_id: i64,
        content: &str,
        metadata: Map<String, Value>,
        input_type: &str,
    ) -> bool {
        let mut metadata = metadata;
        let agent_type = metadata
            .get("agent_type")
            .and_then(Value::as_str)
            .unwrap_or(self.inner.config.agent_type.as_str())
            .to_string();
        if input_type == CONFIG_INPUT_TYPE {
            let defaults = self
                .inner
                .config
                .llm
                .metadata(&agent_type, &LlmOverrides::default());
            for (key, value) in defaults {
                metadata.entry(key).or_insert(value);
            }
        } else {
            metadata
                .entry("agent_type".to_string())
                .or_insert_with(|| json!(agent_type));
        }

        let input = SubmitInput {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            input_text: content.to_string(),
            input_type: input_type.to_string(),
            metadata,
            file_references: Vec::new(),
        };
        match self.inner.upstream.submit(&input).await {
            Ok(()) => {
                tracing::info!(
                    session_id = session_id,
                    input_type = input_type,
                    "relay: input sent"
                );
                true
            }
            Err(err) => {
                tracing::warn!(
                    session_id = session_id,
                    input_type = input_type,
                    error = %err,
                    "relay: input rejected"
                );
                false
            }
        }
    }

    /// Records a model configuration change and forwards it to the agent.
    pub async fn send_config(
        &self,
        user_id: i64,
        session_id: i64,
        agent_type: Option<String>,
        overrides: LlmOverrides,
    ) -> Result<ConfigOutcome, RelayError> {
        let agent_type = agent_type.unwrap_or_else(|| self.inner.config.agent_type.clone());
        let llm = &self.inner.config.llm;
        self.emit(session_id, Frame::start(CONFIG_START_MESSAGE)).await;

        let sequence = self.next_sequence(session_id).await?;
        let record = self
            .inner
            .records
            .save(NewRecord {
                sid: session_id,
                uid: user_id,
                direction: true,
                content: format!(
                    "Configure LLM: {} (Agent: {agent_type})",
                    llm.effective_model(&overrides)
                ),
                sequence,
                message_type: MessageType::Config,
            })
            .await?;

        let input = SubmitInput {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            input_text: String::new(),
            input_type: CONFIG_INPUT_TYPE.to_string(),
            metadata: llm.metadata(&agent_type, &overrides),
            file_references: Vec::new(),
        };
        let applied = match self.inner.upstream.submit(&input).await {
            Ok(()) => {
                self.emit(
                    session_id,
                    Frame::complete(CONFIG_APPLIED_MESSAGE, record.rid),
                )
                .await;
                tracing::info!(
                    session_id = session_id,
                    model = llm.effective_model(&overrides),
                    "relay: llm configuration sent"
                );
                true
            }
            Err(err) => {
                self.emit(session_id, Frame::error(CONFIG_FAILED_MESSAGE))
                    .await;
                tracing::error!(
                    session_id = session_id,
                    error = %err,
                    "relay: llm configuration rejected"
                );
                false
            }
        };

        Ok(ConfigOutcome { record, applied })
    }

    pub async fn stop_timeout(&self, session_id: i64) -> bool {
        self.inner.supervisor.stop(session_id).await;
        let registered = self.inner.registry.get(session_id).await.is_some();
        tracing::info!(
            session_id = session_id,
            registered = registered,
            "relay: idle timeout stopped"
        );
        registered
    }

    pub async fn restart_timeout(&self, session_id: i64) -> bool {
        self.inner.supervisor.restart(session_id).await
    }

    pub async fn records(&self, session_id: i64) -> Result<Vec<Record>, RelayError> {
        self.inner.records.find_by_session_ordered(session_id).await
    }

    pub async fn shutdown(&self) {
        self.inner.supervisor.shutdown().await;
        let closed = self.inner.registry.close_all().await;
        tracing::info!(closed = closed, "relay: shut down");
    }

    async fn attach(&self, connection: &Arc<Connection>, user_id: i64) {
        let session_id = connection.session_id();
        if let Err(err) = connection
            .send(Frame::connection(session_id, user_id))
            .await
        {
            tracing::debug!(
                session_id = session_id,
                error = %err,
                "relay: connection ack dropped"
            );
        }
        self.inner.supervisor.watch(connection.clone()).await;
    }

    async fn owned_files(&self, session_id: i64, user_id: i64, file_ids: &[String]) -> Vec<String> {
        let mut owned = Vec::with_capacity(file_ids.len());
        for file_id in file_ids {
            match self.inner.files.owned_by(file_id, user_id, session_id).await {
                Ok(true) => owned.push(file_id.clone()),
                Ok(false) => {
                    tracing::warn!(
                        session_id = session_id,
                        file_id = %file_id,
                        "relay: dropping file reference not owned by the session"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        session_id = session_id,
                        file_id = %file_id,
                        error = %err,
                        "relay: file reference lookup failed"
                    );
                }
            }
        }
        owned
    }

    async fn next_sequence(&self, session_id: i64) -> Result<i64, RelayError> {
        let existing = self.inner.records.find_by_session_ordered(session_id).await?;
        Ok(existing.len() as i64 + 1)
    }

    fn turn_metadata(&self, turn: &Turn) -> Map<String, Value> {
        if turn.input_type == CONFIG_INPUT_TYPE {
            return self
                .inner
                .config
                .llm
                .metadata(&turn.agent_type, &LlmOverrides::default());
        }
        let mut metadata = Map::new();
        metadata.insert("agent_type".to_string(), json!(turn.agent_type));
        metadata
    }

    async fn run_turn(self, turn: Turn) {
        let start = std::time::Instant::now();
        let session_id = turn.session_id;
        let input = SubmitInput {
            session_id: session_id.to_string(),
            user_id: turn.user_id.to_string(),
            input_text: turn.content.clone(),
            input_type: turn.input_type.clone(),
            metadata: self.turn_metadata(&turn),
            file_references: turn.file_references.clone(),
        };

        if let Err(err) = self.inner.upstream.submit(&input).await {
            tracing::warn!(
                session_id = session_id,
                error = %err,
                "relay: submission rejected"
            );
            self.emit(session_id, Frame::error(SUBMIT_FAILED_MESSAGE))
                .await;
            return;
        }

        let start_message = if turn.file_references.is_empty() {
            THINKING_MESSAGE.to_string()
        } else {
            format!(
                "AI is thinking (processing {} files)...",
                turn.file_references.len()
            )
        };
        self.emit(session_id, Frame::start(start_message)).await;

        let mut filter = DeltaFilter::with_max_buffer(self.inner.config.filter_max_buffer);
        let mut reply = String::new();
        let relayed = self.relay_feed(session_id, &mut filter, &mut reply).await;
        let tail = filter.flush();
        self.relay_delta(session_id, &tail, &mut reply).await;

        match relayed {
            Ok(()) => {
                let content = if reply.trim().is_empty() {
                    EMPTY_REPLY_PLACEHOLDER.to_string()
                } else {
                    reply
                };
                match self.save_reply(&turn, content).await {
                    Ok(record) => {
                        self.emit(
                            session_id,
                            Frame::complete(REPLY_COMPLETE_MESSAGE, record.rid),
                        )
                        .await;
                        tracing::info!(
                            session_id = session_id,
                            record_id = record.rid,
                            reply_chars = record.content.chars().count(),
                            total_ms = start.elapsed().as_millis() as u64,
                            "relay: turn complete"
                        );
                    }
                    Err(err) => {
                        tracing::error!(
                            session_id = session_id,
                            error = %err,
                            "relay: failed to persist reply"
                        );
                        self.emit(session_id, Frame::error(format!("Failed to save reply: {err}")))
                            .await;
                    }
                }
            }
            Err(err) => {
                tracing::error!(
                    session_id = session_id,
                    error = %err,
                    partial_chars = reply.chars().count(),
                    total_ms = start.elapsed().as_millis() as u64,
                    "relay: turn failed"
                );
                let failure = format!("AI reply failed: {err}");
                let content = if reply.trim().is_empty() {
                    failure.clone()
                } else {
                    reply
                };
                if let Err(save_err) = self.save_reply(&turn, content).await {
                    tracing::error!(
                        session_id = session_id,
                        error = %save_err,
                        "relay: failed to persist partial reply"
                    );
                }
                self.emit(session_id, Frame::error(failure)).await;
            }
        }
    }

    /// Reads the feed until the loop ends, the feed ends or a fatal error.
    async fn relay_feed(
        &self,
        session_id: i64,
        filter: &mut DeltaFilter,
        reply: &mut String,
    ) -> Result<(), RelayError> {
        let mut feed = self.inner.upstream.open_feed(session_id).await?;
        let own_session = session_id.to_string();

        while let Some(item) = feed.next().await {
            let events = match item.and_then(|raw| decode_feed_message(&raw)) {
                Ok(events) => events,
                Err(err) if !err.is_fatal_for_turn() => {
                    tracing::warn!(session_id = session_id, error = %err, "relay: skipping message");
                    continue;
                }
                Err(err) => return Err(err),
            };

            for event in events {
                if !event.belongs_to(&own_session) {
                    tracing::debug!(
                        session_id = session_id,
                        event_session = ?event.session_id,
                        event_type = %event.event_type,
                        "relay: discarding event for another session"
                    );
                    continue;
                }
                match event.kind() {
                    EventKind::LoopEnd => {
                        tracing::debug!(session_id = session_id, "relay: generation loop ended");
                        return Ok(());
                    }
                    EventKind::Chunk => {
                        if let Some(delta) = event.delta() {
                            let clean = filter.push(delta);
                            self.relay_delta(session_id, &clean, reply).await;
                        }
                    }
                    EventKind::Other => {}
                }
            }
        }

        tracing::debug!(session_id = session_id, "relay: upstream feed ended");
        Ok(())
    }

    async fn relay_delta(&self, session_id: i64, clean: &str, reply: &mut String) {
        if clean.is_empty() {
            return;
        }
        reply.push_str(clean);
        self.emit(session_id, Frame::delta(clean)).await;
    }

    async fn save_reply(&self, turn: &Turn, content: String) -> Result<Record, RelayError> {
        self.inner
            .records
            .save(NewRecord {
                sid: turn.session_id,
                uid: turn.user_id,
                direction: false,
                content,
                sequence: turn.reply_sequence,
                message_type: MessageType::LlmGeneration,
            })
            .await
    }

    /// Sends on the session's current connection. Returns whether the frame was delivered.
    async fn emit(&self, session_id: i64, frame: Frame) -> bool {
        let Some(connection) = self.inner.registry.get(session_id).await else {
            tracing::debug!(
                session_id = session_id,
                frame = frame.event_name(),
                "relay: no connection, frame dropped"
            );
            return false;
        };

        match connection.send(frame).await {
            Ok(()) => {
                self.inner.supervisor.touch(&connection);
                true
            }
            Err(err) => {
                tracing::debug!(
                    session_id = session_id,
                    error = %err,
                    "relay: frame dropped"
                );
                self.inner.registry.remove(session_id, &connection).await;
                false
            }
        }
    }
}

fn decode_feed_message(raw: &str) -> Result<Vec<CanonicalEvent>, RelayError> {
    decode_message(raw).map_err(|err| RelayError::Decode {
        message: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use chat_relay_agent_events::{CHUNK_EVENT, LOOP_END_EVENT};
    use futures::stream;

    use super::*;
    use crate::upstream::{UpstreamFeed, UpstreamFuture};

    #[derive(Default)]
    struct ScriptedUpstream {
        reject: bool,
        feeds: Mutex<VecDeque<Vec<Result<String, RelayError>>>>,
        submitted: Mutex<Vec<SubmitInput>>,
    }

    impl ScriptedUpstream {
        fn with_feed(feed: Vec<Result<String, RelayError>>) -> Arc<Self> {
            Arc::new(Self {
                feeds: Mutex::new(VecDeque::from([feed])),
                ..Self::default()
            })
        }

        fn rejecting() -> Arc<Self> {
            Arc::new(Self {
                reject: true,
                ..Self::default()
            })
        }

        fn submitted(&self) -> Vec<SubmitInput> {
            self.submitted.lock().expect("submitted").clone()
        }
    }

    impl AgentUpstream for ScriptedUpstream {
        fn submit<'a>(&'a self, input: &'a SubmitInput) -> UpstreamFuture<'a, ()> {
            Box::pin(async move {
                self.submitted.lock().expect("submitted").push(input.clone());
                if self.reject {
                    return Err(RelayError::SubmissionRejected {
                        message: "status=failed".to_string(),
                    });
                }
                Ok(())
            })
        }

        fn open_feed(&self, _session_id: i64) -> UpstreamFuture<'_, UpstreamFeed> {
            Box::pin(async move {
                let script = self
                    .feeds
                    .lock()
                    .expect("feeds")
                    .pop_front()
                    .unwrap_or_default();
                Ok(Box::pin(stream::iter(script)) as UpstreamFeed)
            })
        }
    }

    fn chunk(session_id: &str, delta: &str) -> Result<String, RelayError> {
        Ok(json!({"event": CHUNK_EVENT, "session_id": session_id, "payload": {"delta": delta}})
            .to_string())
    }

    fn loop_end(session_id: &str) -> Result<String, RelayError> {
        Ok(json!({"event": LOOP_END_EVENT, "session_id": session_id}).to_string())
    }

    fn relay(upstream: Arc<ScriptedUpstream>) -> (ChatRelay, Arc<MemoryStore>) {
        ChatRelay::with_memory_store(RelayConfig::default(), upstream)
    }

    fn hello() -> TurnRequest {
        TurnRequest {
            user_id: 3,
            content: "Hello".to_string(),
            ..TurnRequest::default()
        }
    }

    /// Frames up to and including the first `complete` or `error`.
    async fn frames_until_done(receiver: &mut FrameReceiver) -> Vec<Frame> {
        let mut frames = Vec::new();
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
                .await
                .expect("frame in time")
                .expect("connection open");
            let done = matches!(frame, Frame::Complete { .. } | Frame::Error { .. });
            frames.push(frame);
            if done {
                return frames;
            }
        }
    }

    fn opened(outcome: StreamOutcome) -> FrameReceiver {
        match outcome {
            StreamOutcome::Opened(receiver) => receiver,
            StreamOutcome::Reused => panic!("expected a new connection"),
        }
    }

    #[tokio::test]
    async fn hello_turn_relays_deltas_and_persists_reply() {
        let upstream = ScriptedUpstream::with_feed(vec![
            Ok(json!({"type": "connection", "message": "ready"}).to_string()),
            chunk("7", "Hi"),
            Ok("{broken".to_string()),
            chunk("8", "leak"),
            chunk("7", " there"),
            loop_end("7"),
            chunk("7", "after end"),
        ]);
        let (relay, store) = relay(upstream.clone());

        let mut receiver = opened(relay.send_message(7, hello()).await.expect("send"));
        let frames = frames_until_done(&mut receiver).await;

        let records = relay.records(7).await.expect("records");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].content, "Hello");
        assert_eq!(records[0].sequence, 1);
        assert_eq!(records[0].message_type, MessageType::User);
        assert!(records[0].direction);
        assert_eq!(records[1].content, "Hi there");
        assert_eq!(records[1].sequence, 2);
        assert_eq!(records[1].message_type, MessageType::LlmGeneration);
        assert!(!records[1].direction);

        assert_eq!(
            frames,
            vec![
                Frame::connection(7, 3),
                Frame::start(THINKING_MESSAGE),
                Frame::delta("Hi"),
                Frame::delta(" there"),
                Frame::complete(REPLY_COMPLETE_MESSAGE, records[1].rid),
            ]
        );

        let submitted = upstream.submitted();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].session_id, "7");
        assert_eq!(submitted[0].input_text, "Hello");
        assert_eq!(submitted[0].input_type, "question");
        assert_eq!(submitted[0].metadata["agent_type"], "orchestrator");
        assert!(!submitted[0].metadata.contains_key("llm_config"));
        assert!(store.session_updated_at(7).await.is_some());
    }

    #[tokio::test]
    async fn finish_markers_never_reach_the_client() {
        let upstream = ScriptedUpstream::with_feed(vec![
            chunk("1", "<fin"),
            chunk("1", "ish>Answer</fin"),
            chunk("1", "ish>"),
            loop_end("1"),
        ]);
        let (relay, _store) = relay(upstream);
        let mut receiver = opened(relay.send_message(1, hello()).await.expect("send"));
        let frames = frames_until_done(&mut receiver).await;

        let deltas = frames
            .iter()
            .filter_map(|frame| match frame {
                Frame::Delta { content } => Some(content.as_str()),
                _ => None,
            })
            .collect::<String>();
        assert_eq!(deltas, "Answer");
        assert_eq!(relay.records(1).await.expect("records")[1].content, "Answer");
    }

    #[tokio::test]
    async fn trailing_angle_bracket_is_kept_at_end_of_reply() {
        let upstream = ScriptedUpstream::with_feed(vec![chunk("13", "is 3 <"), loop_end("13")]);
        let (relay, _store) = relay(upstream);
        let mut receiver = opened(relay.send_message(13, hello()).await.expect("send"));
        let frames = frames_until_done(&mut receiver).await;

        assert_eq!(frames[2], Frame::delta("is 3 "));
        assert_eq!(frames[3], Frame::delta("<"));
        assert_eq!(relay.records(13).await.expect("records")[1].content, "is 3 <");
    }

    #[tokio::test]
    async fn undecodable_messages_are_skipped() {
        let upstream = ScriptedUpstream::with_feed(vec![
            Ok("[1,2]".to_string()),
            chunk("12", "still"),
            Ok(r#"{"events": 5}"#.to_string()),
            Ok("{\"event\": ".to_string()),
            chunk("12", " here"),
            loop_end("12"),
        ]);
        let (relay, _store) = relay(upstream);
        let mut receiver = opened(relay.send_message(12, hello()).await.expect("send"));
        let frames = frames_until_done(&mut receiver).await;

        assert_eq!(frames[2], Frame::delta("still"));
        assert_eq!(frames[3], Frame::delta(" here"));
        assert!(matches!(frames.last(), Some(Frame::Complete { .. })));
        assert_eq!(relay.records(12).await.expect("records")[1].content, "still here");

        assert!(matches!(
            decode_feed_message("{broken"),
            Err(RelayError::Decode { .. })
        ));
    }

    #[tokio::test]
    async fn rejected_submission_reports_error_without_generation() {
        let (relay, _store) = relay(ScriptedUpstream::rejecting());
        let mut receiver = opened(relay.send_message(2, hello()).await.expect("send"));
        let frames = frames_until_done(&mut receiver).await;

        assert_eq!(
            frames,
            vec![Frame::connection(2, 3), Frame::error(SUBMIT_FAILED_MESSAGE)]
        );
        let records = relay.records(2).await.expect("records");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message_type, MessageType::User);
    }

    #[tokio::test]
    async fn transport_failure_keeps_partial_reply() {
        let upstream = ScriptedUpstream::with_feed(vec![
            chunk("4", "Part"),
            Err(RelayError::Transport {
                message: "connection reset".to_string(),
            }),
            chunk("4", "never"),
        ]);
        let (relay, _store) = relay(upstream);
        let mut receiver = opened(relay.send_message(4, hello()).await.expect("send"));
        let frames = frames_until_done(&mut receiver).await;

        assert_eq!(frames[2], Frame::delta("Part"));
        assert_eq!(
            frames.last(),
            Some(&Frame::error(
                "AI reply failed: transport error: connection reset"
            ))
        );
        let records = relay.records(4).await.expect("records");
        assert_eq!(records[1].content, "Part");
    }

    #[tokio::test]
    async fn transport_failure_without_output_records_failure() {
        let upstream = ScriptedUpstream::with_feed(vec![Err(RelayError::Timeout {
            message: Some("no upstream data within 60s".to_string()),
        })]);
        let (relay, _store) = relay(upstream);
        let mut receiver = opened(relay.send_message(5, hello()).await.expect("send"));
        let frames = frames_until_done(&mut receiver).await;

        assert!(matches!(frames.last(), Some(Frame::Error { .. })));
        let records = relay.records(5).await.expect("records");
        assert_eq!(records[1].content, "AI reply failed: timeout");
    }

    #[tokio::test]
    async fn empty_generation_stores_placeholder() {
        let upstream = ScriptedUpstream::with_feed(vec![loop_end("6")]);
        let (relay, _store) = relay(upstream);
        let mut receiver = opened(relay.send_message(6, hello()).await.expect("send"));
        let frames = frames_until_done(&mut receiver).await;

        let records = relay.records(6).await.expect("records");
        assert_eq!(records[1].content, EMPTY_REPLY_PLACEHOLDER);
        assert_eq!(
            frames.last(),
            Some(&Frame::complete(REPLY_COMPLETE_MESSAGE, records[1].rid))
        );
    }

    #[tokio::test]
    async fn second_turn_reuses_open_connection() {
        let upstream = ScriptedUpstream::with_feed(vec![chunk("9", "one"), loop_end("9")]);
        upstream
            .feeds
            .lock()
            .expect("feeds")
            .push_back(vec![chunk("9", "two"), loop_end("9")]);
        let (relay, _store) = relay(upstream);

        let mut receiver = relay.open_connection(3, 9).await;
        assert_eq!(receiver.recv().await, Some(Frame::connection(9, 3)));

        assert!(matches!(
            relay.send_message(9, hello()).await.expect("send"),
            StreamOutcome::Reused
        ));
        let first = frames_until_done(&mut receiver).await;
        assert_eq!(first[1], Frame::delta("one"));

        assert!(matches!(
            relay.send_message(9, hello()).await.expect("send"),
            StreamOutcome::Reused
        ));
        let second = frames_until_done(&mut receiver).await;
        assert_eq!(second[1], Frame::delta("two"));

        let sequences = relay
            .records(9)
            .await
            .expect("records")
            .iter()
            .map(|record| record.sequence)
            .collect::<Vec<_>>();
        assert_eq!(sequences, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn only_owned_files_are_forwarded() {
        let upstream = ScriptedUpstream::with_feed(vec![loop_end("3")]);
        let (relay, store) = relay(upstream.clone());
        store.add_file("mine", 3, 3).await;
        store.add_file("theirs", 4, 3).await;

        let request = TurnRequest {
            file_references: vec!["mine".to_string(), "theirs".to_string(), "gone".to_string()],
            ..hello()
        };
        let mut receiver = opened(relay.send_message(3, request).await.expect("send"));
        let frames = frames_until_done(&mut receiver).await;

        assert_eq!(frames[1], Frame::start("AI is thinking (processing 1 files)..."));
        assert_eq!(upstream.submitted()[0].file_references, vec!["mine".to_string()]);
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let (relay, _store) = relay(ScriptedUpstream::with_feed(Vec::new()));
        let request = TurnRequest {
            content: "   ".to_string(),
            ..hello()
        };
        assert!(matches!(
            relay.send_message(1, request).await,
            Err(RelayError::InvalidRequest { .. })
        ));
        assert!(relay.registry().get(1).await.is_none());
    }

    #[tokio::test]
    async fn config_message_is_recorded_and_acknowledged() {
        let upstream = ScriptedUpstream::with_feed(Vec::new());
        let (relay, _store) = relay(upstream.clone());
        let mut receiver = relay.open_connection(3, 11).await;
        receiver.recv().await;

        let outcome = relay
            .send_config(
                3,
                11,
                None,
                LlmOverrides {
                    model: Some("small-model".to_string()),
                    ..LlmOverrides::default()
                },
            )
            .await
            .expect("config");
        assert!(outcome.applied);
        assert_eq!(outcome.record.message_type, MessageType::Config);
        assert_eq!(
            outcome.record.content,
            "Configure LLM: small-model (Agent: orchestrator)"
        );

        let frames = frames_until_done(&mut receiver).await;
        assert_eq!(
            frames,
            vec![
                Frame::start(CONFIG_START_MESSAGE),
                Frame::complete(CONFIG_APPLIED_MESSAGE, outcome.record.rid),
            ]
        );

        let submitted = upstream.submitted();
        assert_eq!(submitted[0].input_type, "config");
        assert_eq!(submitted[0].input_text, "");
        assert_eq!(submitted[0].metadata["llm_config"]["model"], "small-model");
    }

    #[tokio::test]
    async fn rejected_config_sends_error() {
        let (relay, _store) = relay(ScriptedUpstream::rejecting());
        let mut receiver = relay.open_connection(3, 12).await;
        receiver.recv().await;

        let outcome = relay
            .send_config(3, 12, Some("writer".to_string()), LlmOverrides::default())
            .await
            .expect("config");
        assert!(!outcome.applied);
        let frames = frames_until_done(&mut receiver).await;
        assert_eq!(frames.last(), Some(&Frame::error(CONFIG_FAILED_MESSAGE)));
    }

    #[tokio::test]
    async fn send_input_merges_llm_defaults_for_config() {
        let upstream = ScriptedUpstream::with_feed(Vec::new());
        let (relay, _store) = relay(upstream.clone());

        let mut metadata = Map::new();
        metadata.insert("temperature".to_string(), json!(0.1));
        assert!(relay.send_input(1, 2, "", metadata, "config").await);
        assert!(relay.send_input(1, 2, "drop it", Map::new(), "delete").await);

        let submitted = upstream.submitted();
        assert_eq!(submitted[0].metadata["temperature"], 0.1);
        assert_eq!(submitted[0].metadata["llm_config"]["model"], "gpt-4o");
        assert_eq!(submitted[1].input_type, "delete");
        assert_eq!(submitted[1].metadata["agent_type"], "orchestrator");
        assert!(!submitted[1].metadata.contains_key("llm_config"));

        let (rejecting, _store) = relay_rejecting();
        assert!(!rejecting.send_input(1, 2, "x", Map::new(), "intervention").await);
    }

    fn relay_rejecting() -> (ChatRelay, Arc<MemoryStore>) {
        relay(ScriptedUpstream::rejecting())
    }

    #[tokio::test]
    async fn timeout_controls_follow_connection_presence() {
        let (relay, _store) = relay(ScriptedUpstream::with_feed(Vec::new()));
        assert!(!relay.stop_timeout(20).await);
        assert!(!relay.restart_timeout(20).await);

        let _receiver = relay.open_connection(1, 20).await;
        assert!(relay.stop_timeout(20).await);
        assert!(relay.stop_timeout(20).await);
        assert!(relay.restart_timeout(20).await);

        relay.shutdown().await;
        assert!(relay.registry().is_empty().await);
    }
}
