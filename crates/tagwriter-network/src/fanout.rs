//! Realtime fan-out of hub, session and command events.
//!
//! Every connected browser gets one [`ClientSubscription`]. On connect the
//! subscription starts with a snapshot of the readers and the live write
//! session; after that it yields every event published by the hardware hub,
//! the write coordinator and the command queue endpoints, in publication
//! order. Stages of sessions run by a remote agent arrive through the agent
//! endpoints and are published as the same `write-stage` frames.
//!
//! # Wire Format
//!
//! Every frame is a JSON object `{"type": ..., "data": ...}`:
//!
//! | type              | data                                   |
//! |-------------------|----------------------------------------|
//! | `snapshot`        | `{readers: [...], session: {...}|null}`|
//! | `reader-attached` | `{name}`                               |
//! | `reader-detached` | `{name}`                               |
//! | `card-present`    | `{reader, uid}`                        |
//! | `card-removed`    | `{reader, uid}`                        |
//! | `driver-error`    | `{reader?, message}`                   |
//! | `write-stage`     | `{stage, payload, reader?, uid?, message?}` |
//! | `command-updated` | command record                         |
//!
//! # Slow Clients
//!
//! Each client reads from its own broadcast receiver. A client that falls
//! more than the channel capacity behind loses the oldest frames; other
//! clients and the publishers are never blocked by it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tagwriter_core::constants::FANOUT_CAPACITY;
use tagwriter_hardware::Reader;
use tagwriter_session::{SessionEvent, WriteCoordinator, WriteSession};
use tagwriter_storage::Command;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Serialized `{"type", "data"}` frame, shared by every receiver.
pub type Frame = Arc<str>;

/// Frame type of session stage events.
pub const WRITE_STAGE_FRAME: &str = "write-stage";

/// Frame type of command updates.
pub const COMMAND_UPDATED_FRAME: &str = "command-updated";

/// Frame type of the connect-time snapshot.
pub const SNAPSHOT_FRAME: &str = "snapshot";

/// State replayed to a client when it connects.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub readers: Vec<Reader>,
    pub session: Option<WriteSession>,
}

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    #[serde(rename = "type")]
    kind: &'a str,
    data: &'a T,
}

/// Serialize `data` as a `{"type": kind, "data": data}` frame.
pub fn frame<T: Serialize>(kind: &str, data: &T) -> Option<Frame> {
    match serde_json::to_string(&Envelope { kind, data }) {
        Ok(json) => Some(Arc::from(json)),
        Err(e) => {
            error!(kind, error = %e, "Failed to serialize fan-out frame");
            None
        }
    }
}

struct FanoutInner {
    coordinator: Option<WriteCoordinator>,
    frames: broadcast::Sender<Frame>,
    clients: AtomicUsize,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
    closed: CancellationToken,
}

/// Realtime fan-out hub.
///
/// Cheap to clone; clones share the client set.
#[derive(Clone)]
pub struct FanoutHub {
    inner: Arc<FanoutInner>,
}

impl std::fmt::Debug for FanoutHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutHub")
            .field("clients", &self.client_count())
            .field("hardware", &self.inner.coordinator.is_some())
            .finish()
    }
}

impl FanoutHub {
    /// Create a fan-out hub with the default capacity.
    ///
    /// `coordinator` is `None` on a backend without hardware, where only
    /// command updates are published.
    pub fn new(coordinator: Option<WriteCoordinator>) -> Self {
        Self::with_capacity(coordinator, FANOUT_CAPACITY)
    }

    pub fn with_capacity(coordinator: Option<WriteCoordinator>, capacity: usize) -> Self {
        let (frames, _) = broadcast::channel(capacity.max(1));

        Self {
            inner: Arc::new(FanoutInner {
                coordinator,
                frames,
                clients: AtomicUsize::new(0),
                forwarders: Mutex::new(Vec::new()),
                closed: CancellationToken::new(),
            }),
        }
    }

    /// Start forwarding hub and session events.
    ///
    /// Must be called from within a Tokio runtime. Calling it twice is a
    /// no-op.
    pub fn start(&self) {
        let Some(coordinator) = &self.inner.coordinator else {
            return;
        };

        let mut forwarders = lock(&self.inner.forwarders);
        if !forwarders.is_empty() {
            return;
        }

        // Subscribe here rather than inside the tasks so that nothing
        // published after `start` returns is missed.
        let mut hub_events = coordinator.hub().subscribe();
        let frames = self.inner.frames.clone();
        forwarders.push(tokio::spawn(async move {
            loop {
                match hub_events.recv().await {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(json) => {
                            let _ = frames.send(Arc::from(json));
                        }
                        Err(e) => error!(kind = event.kind(), error = %e, "Failed to serialize hub event"),
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Fan-out fell behind hub events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Hub event forwarder stopped");
        }));

        let mut session_events = coordinator.subscribe();
        let frames = self.inner.frames.clone();
        forwarders.push(tokio::spawn(async move {
            loop {
                match session_events.recv().await {
                    Ok(event) => {
                        if let Some(frame) = frame(WRITE_STAGE_FRAME, &event) {
                            let _ = frames.send(frame);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Fan-out fell behind session events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Session event forwarder stopped");
        }));

        info!("Realtime fan-out started");
    }

    /// Stop the forwarders and end every client subscription.
    pub fn shutdown(&self) {
        for task in lock(&self.inner.forwarders).drain(..) {
            task.abort();
        }
        self.inner.closed.cancel();
    }

    /// Publish the stage of a write session running elsewhere, such as on
    /// a remote agent, to every client.
    pub fn publish_stage(&self, event: &SessionEvent) {
        if let Some(frame) = frame(WRITE_STAGE_FRAME, event) {
            self.publish(frame);
        }
    }

    /// Publish a command update to every client.
    pub fn publish_command(&self, command: &Command) {
        if let Some(frame) = frame(COMMAND_UPDATED_FRAME, command) {
            self.publish(frame);
        }
    }

    /// Publish a pre-built frame to every client.
    pub fn publish(&self, frame: Frame) {
        // No receivers is not an error: nobody is watching.
        let _ = self.inner.frames.send(frame);
    }

    /// Current readers and live session.
    pub fn snapshot(&self) -> Snapshot {
        match &self.inner.coordinator {
            Some(coordinator) => Snapshot {
                readers: coordinator.hub().list_readers(),
                session: coordinator.current_session(),
            },
            None => Snapshot {
                readers: Vec::new(),
                session: None,
            },
        }
    }

    /// Register a client.
    ///
    /// The subscription is taken before the snapshot, so no event is lost
    /// between the two; an event already reflected in the snapshot may be
    /// delivered once more. Dropping the subscription unregisters the
    /// client.
    pub fn on_connect(&self) -> ClientSubscription {
        let receiver = self.inner.frames.subscribe();
        let snapshot = frame(SNAPSHOT_FRAME, &self.snapshot());

        let clients = self.inner.clients.fetch_add(1, Ordering::SeqCst) + 1;
        info!(clients, "Realtime client connected");

        ClientSubscription {
            snapshot,
            receiver,
            hub: Arc::clone(&self.inner),
        }
    }

    /// Number of connected clients.
    pub fn client_count(&self) -> usize {
        self.inner.clients.load(Ordering::SeqCst)
    }
}

/// One connected client. Unregisters itself on drop.
pub struct ClientSubscription {
    snapshot: Option<Frame>,
    receiver: broadcast::Receiver<Frame>,
    hub: Arc<FanoutInner>,
}

impl ClientSubscription {
    /// Next frame for this client, starting with the snapshot.
    ///
    /// Frames lost to lag are skipped. Returns `None` once the hub is shut
    /// down.
    pub async fn recv(&mut self) -> Option<Frame> {
        if let Some(snapshot) = self.snapshot.take() {
            return Some(snapshot);
        }

        loop {
            let received = tokio::select! {
                _ = self.hub.closed.cancelled() => return None,
                received = self.receiver.recv() => received,
            };

            match received {
                Ok(frame) => return Some(frame),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Realtime client lagged, dropping frames");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for ClientSubscription {
    fn drop(&mut self) {
        let clients = self.hub.clients.fetch_sub(1, Ordering::SeqCst) - 1;
        info!(clients, "Realtime client disconnected");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
