//! Persistence collaborators used by the relay, plus in-memory implementations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use chat_relay_error::RelayError;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    User,
    LlmGeneration,
    LlmToConfirm,
    ToolExecutionResult,
    Config,
}

/// One persisted chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub rid: i64,
    pub sid: i64,
    pub uid: i64,
    /// `true` when the message came from the user.
    pub direction: bool,
    pub content: String,
    pub sequence: i64,
    pub message_type: MessageType,
    #[schema(value_type = String)]
    pub create_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewRecord {
    pub sid: i64,
    pub uid: i64,
    pub direction: bool,
    pub content: String,
    pub sequence: i64,
    pub message_type: MessageType,
}

pub trait RecordStore: Send + Sync {
    /// Stores the record and returns it with its id and creation time assigned.
    fn save(&self, record: NewRecord) -> BoxFuture<'_, Result<Record, RelayError>>;

    /// Records of the session in ascending sequence order.
    fn find_by_session_ordered(&self, sid: i64) -> BoxFuture<'_, Result<Vec<Record>, RelayError>>;
}

pub trait SessionStore: Send + Sync {
    fn touch_updated_time(&self, sid: i64) -> BoxFuture<'_, Result<(), RelayError>>;
}

pub trait FileCatalog: Send + Sync {
    /// Whether `file_id` exists and belongs to this user and session.
    fn owned_by<'a>(
        &'a self,
        file_id: &'a str,
        uid: i64,
        sid: i64,
    ) -> BoxFuture<'a, Result<bool, RelayError>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileOwner {
    uid: i64,
    sid: i64,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<Vec<Record>>,
    next_rid: AtomicI64,
    sessions: RwLock<HashMap<i64, DateTime<Utc>>>,
    files: RwLock<HashMap<String, FileOwner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_file(&self, file_id: impl Into<String>, uid: i64, sid: i64) {
        self.files
            .write()
            .await
            .insert(file_id.into(), FileOwner { uid, sid });
    }

    pub async fn session_updated_at(&self, sid: i64) -> Option<DateTime<Utc>> {
        self.sessions.read().await.get(&sid).copied()
    }
}

impl RecordStore for MemoryStore {
    fn save(&self, record: NewRecord) -> BoxFuture<'_, Result<Record, RelayError>> {
        Box::pin(async move {
            let saved = Record {
                rid: self.next_rid.fetch_add(1, Ordering::Relaxed) + 1,
                sid: record.sid,
                uid: record.uid,
                direction: record.direction,
                content: record.content,
                sequence: record.sequence,
                message_type: record.message_type,
                create_time: Utc::now(),
            };
            self.records.write().await.push(saved.clone());
            Ok(saved)
        })
    }

    fn find_by_session_ordered(&self, sid: i64) -> BoxFuture<'_, Result<Vec<Record>, RelayError>> {
        Box::pin(async move {
            let mut records = self
                .records
                .read()
                .await
                .iter()
                .filter(|record| record.sid == sid)
                .cloned()
                .collect::<Vec<_>>();
            records.sort_by_key(|record| (record.sequence, record.rid));
            Ok(records)
        })
    }
}

impl SessionStore for MemoryStore {
    fn touch_updated_time(&self, sid: i64) -> BoxFuture<'_, Result<(), RelayError>> {
        Box::pin(async move {
            self.sessions.write().await.insert(sid, Utc::now());
            Ok(())
        })
    }
}

impl FileCatalog for MemoryStore {
    fn owned_by<'a>(
        &'a self,
        file_id: &'a str,
        uid: i64,
        sid: i64,
    ) -> BoxFuture<'a, Result<bool, RelayError>> {
        Box::pin(async move {
            Ok(self.files.read().await.get(file_id).copied() == Some(FileOwner { uid, sid }))
        })
    }
}
