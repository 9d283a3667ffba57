use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use axum::response::sse::Event;
use chat_relay_error::RelayError;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;

use crate::frame::Frame;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub type FrameReceiver = mpsc::Receiver<Frame>;

/// The outbound side of one client stream for a session.
///
/// Frames are queued on a bounded channel whose receiver is the client's SSE
/// response. A connection is closed once its sender is dropped, either by
/// [`Connection::close`] or because the client went away.
#[derive(Debug)]
pub struct Connection {
    id: u64,
    session_id: i64,
    sender: Mutex<Option<mpsc::Sender<Frame>>>,
    last_activity: Mutex<Instant>,
}

impl Connection {
    pub fn open(session_id: i64, capacity: usize) -> (Arc<Self>, FrameReceiver) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let connection = Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            session_id,
            sender: Mutex::new(Some(sender)),
            last_activity: Mutex::new(Instant::now()),
        });
        (connection, receiver)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn session_id(&self) -> i64 {
        self.session_id
    }

    /// Queues a frame and refreshes the activity clock on success.
    pub async fn send(&self, frame: Frame) -> Result<(), RelayError> {
        let sender = lock(&self.sender).clone();
        let Some(sender) = sender else {
            return Err(self.already_closed());
        };
        if sender.send(frame).await.is_err() {
            lock(&self.sender).take();
            return Err(self.already_closed());
        }
        self.touch();
        Ok(())
    }

    /// Stops accepting frames. The client stream ends once queued frames are drained.
    pub fn close(&self) -> Result<(), RelayError> {
        match lock(&self.sender).take() {
            Some(_) => Ok(()),
            None => Err(self.already_closed()),
        }
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.sender)
            .as_ref()
            .map_or(true, |sender| sender.is_closed())
    }

    pub fn touch(&self) {
        *lock(&self.last_activity) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        lock(&self.last_activity).elapsed()
    }

    fn already_closed(&self) -> RelayError {
        RelayError::ConnectionAlreadyClosed {
            connection_id: self.id,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn frame_stream(receiver: FrameReceiver) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    ReceiverStream::new(receiver).map(|frame| Ok(frame.to_sse_event()))
}
