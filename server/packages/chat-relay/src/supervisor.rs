use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::connection::Connection;
use crate::registry::ConnectionRegistry;

type WatchTasks = Arc<Mutex<HashMap<i64, WatchTask>>>;

#[derive(Debug)]
struct WatchTask {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Closes session connections that have not sent anything for `idle_timeout`.
///
/// Each watched session owns one polling task. `stop` suspends enforcement for
/// a session without touching its connection; `restart` resumes it with a
/// fresh idle clock. A watchdog that ends on its own removes its entry.
#[derive(Debug)]
pub struct IdleSupervisor {
    registry: Arc<ConnectionRegistry>,
    tasks: WatchTasks,
    generations: AtomicU64,
    idle_timeout: Duration,
    poll_interval: Duration,
}

impl IdleSupervisor {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        idle_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            registry,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            generations: AtomicU64::new(0),
            idle_timeout,
            poll_interval,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Starts the watchdog for the connection's session, replacing any earlier one.
    pub async fn watch(&self, connection: Arc<Connection>) {
        let session_id = connection.session_id();
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let tasks = self.tasks.clone();
        let registry = self.registry.clone();
        let idle_timeout = self.idle_timeout;
        let poll_interval = self.poll_interval;

        // held across the spawn so the task cannot deregister before it is recorded
        let mut guard = self.tasks.lock().await;
        let handle = tokio::spawn(async move {
            watchdog(registry, connection, idle_timeout, poll_interval).await;
            let mut tasks = tasks.lock().await;
            if tasks
                .get(&session_id)
                .is_some_and(|task| task.generation == generation)
            {
                tasks.remove(&session_id);
            }
        });
        if let Some(previous) = guard.insert(session_id, WatchTask { generation, handle }) {
            previous.handle.abort();
        }
    }

    pub fn touch(&self, connection: &Connection) {
        connection.touch();
    }

    /// Cancels the watchdog of the session. Returns whether one was running.
    pub async fn stop(&self, session_id: i64) -> bool {
        match self.tasks.lock().await.remove(&session_id) {
            Some(WatchTask { handle, .. }) => {
                let running = !handle.is_finished();
                handle.abort();
                tracing::info!(
                    session_id = session_id,
                    running = running,
                    "idle_supervisor: watch stopped"
                );
                running
            }
            None => false,
        }
    }

    /// Resets the idle clock of the session's current connection and watches it again.
    pub async fn restart(&self, session_id: i64) -> bool {
        let Some(connection) = self.registry.get(session_id).await else {
            tracing::warn!(
                session_id = session_id,
                "idle_supervisor: restart requested without a connection"
            );
            return false;
        };
        connection.touch();
        self.watch(connection).await;
        tracing::info!(session_id = session_id, "idle_supervisor: watch restarted");
        true
    }

    pub async fn is_watching(&self, session_id: i64) -> bool {
        self.tasks
            .lock()
            .await
            .get(&session_id)
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Sessions with a watchdog entry.
    pub async fn watched_sessions(&self) -> usize {
        self.tasks.lock().await.len()
    }

    pub async fn shutdown(&self) {
        let mut tasks = self.tasks.lock().await;
        for (_, task) in tasks.drain() {
            task.handle.abort();
        }
    }
}

async fn watchdog(
    registry: Arc<ConnectionRegistry>,
    connection: Arc<Connection>,
    idle_timeout: Duration,
    poll_interval: Duration,
) {
    let session_id = connection.session_id();
    let mut ticker = interval_at(Instant::now() + poll_interval, poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        match registry.get(session_id).await {
            Some(current) if Arc::ptr_eq(&current, &connection) => {}
            _ => return,
        }

        if connection.is_closed() {
            registry.remove(session_id, &connection).await;
            return;
        }

        let idle = connection.idle_for();
        if idle >= idle_timeout {
            tracing::info!(
                session_id = session_id,
                connection_id = connection.id(),
                idle_ms = idle.as_millis() as u64,
                "idle_supervisor: closing idle connection"
            );
            if let Err(err) = connection.close() {
                tracing::debug!(
                    session_id = session_id,
                    error = %err,
                    "idle_supervisor: connection already closed"
                );
            }
            registry.remove(session_id, &connection).await;
            return;
        }
    }
}
