use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::connection::Connection;

/// Result of [`ConnectionRegistry::get_or_create`].
#[derive(Debug)]
pub enum ConnectionLease<T> {
    Existing(Arc<Connection>),
    /// The factory ran; `T` is whatever it handed back next to the connection.
    Created(Arc<Connection>, T),
}

impl<T> ConnectionLease<T> {
    pub fn connection(&self) -> &Arc<Connection> {
        match self {
            Self::Existing(connection) | Self::Created(connection, _) => connection,
        }
    }
}

/// At most one live connection per session.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<i64, Arc<Connection>>>,
    creation_locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `connection` authoritative for `session_id`, closing whatever it replaces.
    pub async fn register(&self, session_id: i64, connection: Arc<Connection>) {
        let previous = self
            .connections
            .write()
            .await
            .insert(session_id, connection.clone());

        match previous {
            Some(previous) if !Arc::ptr_eq(&previous, &connection) => {
                tracing::info!(
                    session_id = session_id,
                    replaced = previous.id(),
                    connection_id = connection.id(),
                    "registry: replacing session connection"
                );
                if let Err(err) = previous.close() {
                    tracing::debug!(
                        session_id = session_id,
                        error = %err,
                        "registry: replaced connection was already closed"
                    );
                }
            }
            _ => {
                tracing::debug!(
                    session_id = session_id,
                    connection_id = connection.id(),
                    "registry: connection registered"
                );
            }
        }
    }

    pub async fn get(&self, session_id: i64) -> Option<Arc<Connection>> {
        self.connections.read().await.get(&session_id).cloned()
    }

    /// Removes the entry only while it still refers to `connection`.
    pub async fn remove(&self, session_id: i64, connection: &Arc<Connection>) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get(&session_id) {
            Some(current) if Arc::ptr_eq(current, connection) => {
                connections.remove(&session_id);
                tracing::debug!(
                    session_id = session_id,
                    connection_id = connection.id(),
                    "registry: connection removed"
                );
                true
            }
            _ => false,
        }
    }

    /// Returns the live connection of the session or registers the one built
    /// by `factory`. Concurrent callers for one session run the factory at
    /// most once between them.
    pub async fn get_or_create<T, F>(&self, session_id: i64, factory: F) -> ConnectionLease<T>
    where
        F: FnOnce() -> (Arc<Connection>, T),
    {
        if let Some(existing) = self.live(session_id).await {
            return ConnectionLease::Existing(existing);
        }

        let lock = {
            let mut locks = self.creation_locks.lock().await;
            locks
                .entry(session_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        let lease = {
            let _guard = lock.lock().await;
            match self.live(session_id).await {
                Some(existing) => ConnectionLease::Existing(existing),
                None => {
                    let (connection, extra) = factory();
                    self.register(session_id, connection.clone()).await;
                    ConnectionLease::Created(connection, extra)
                }
            }
        };
        self.release_creation_lock(session_id, lock).await;
        lease
    }

    /// Number of sessions with a creation lock outstanding.
    pub async fn pending_creations(&self) -> usize {
        self.creation_locks.lock().await.len()
    }

    /// Forgets the session's creation lock once no other caller holds or waits on it.
    async fn release_creation_lock(&self, session_id: i64, lock: Arc<Mutex<()>>) {
        let mut locks = self.creation_locks.lock().await;
        let last_user = locks
            .get(&session_id)
            .is_some_and(|entry| Arc::ptr_eq(entry, &lock) && Arc::strong_count(&lock) == 2);
        if last_user {
            locks.remove(&session_id);
        }
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    pub async fn session_ids(&self) -> Vec<i64> {
        let mut ids = self
            .connections
            .read()
            .await
            .keys()
            .copied()
            .collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }

    /// Closes and forgets every connection. Returns how many were open.
    pub async fn close_all(&self) -> usize {
        let drained = {
            let mut connections = self.connections.write().await;
            connections
                .drain()
                .map(|(_, connection)| connection)
                .collect::<Vec<_>>()
        };

        let mut closed = 0;
        for connection in drained {
            if connection.close().is_ok() {
                closed += 1;
            }
        }
        closed
    }

    /// A registered connection whose client is gone is not reused.
    async fn live(&self, session_id: i64) -> Option<Arc<Connection>> {
        let existing = self.get(session_id).await?;
        if existing.is_closed() {
            self.remove(session_id, &existing).await;
            return None;
        }
        Some(existing)
    }
}
