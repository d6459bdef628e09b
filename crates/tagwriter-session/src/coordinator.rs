//! Write session coordinator.
//!
//! The [`WriteCoordinator`] runs one write at a time against whichever reader
//! the hardware hub reports a tap on:
//!
//! 1. acquire the writer lock (or fail with `SessionBusy`);
//! 2. `waiting` until the first `card-present` event, bounded by the timeout;
//! 3. `card-detected`, bound to that reader;
//! 4. write through the hub, then `writing` on acknowledgement;
//! 5. `verifying` while the tag is read back and compared byte for byte;
//! 6. `success` or `failed`, then release the lock.
//!
//! Every transition is published on the coordinator's broadcast channel.
//! The lock is held by an [`ActiveSession`] guard, so it is released on every
//! exit path, including the caller dropping the `write` future.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tagwriter_core::constants::{DEFAULT_WRITE_TIMEOUT_MS, SESSION_EVENT_CAPACITY};
use tagwriter_core::{TagPayload, WriteStage};
use tagwriter_hardware::{HardwareHub, HubEvent};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{WriteError, WriteErrorKind};
use crate::session::{SessionEvent, WriteSession};

/// Message recorded when the caller stops waiting for a running session.
const ABORTED_MESSAGE: &str = "Write aborted";

/// Outcome of a write session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResult {
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<WriteErrorKind>,
}

impl WriteResult {
    pub fn succeeded(uid: impl Into<String>) -> Self {
        Self {
            success: true,
            uid: Some(uid.into()),
            error_message: None,
            error_kind: None,
        }
    }

    pub fn failed(error: &WriteError) -> Self {
        Self {
            success: false,
            uid: None,
            error_message: Some(error.to_string()),
            error_kind: Some(error.kind()),
        }
    }
}

/// Configuration for the write coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Tag wait used when a request does not specify one.
    pub default_timeout: Duration,

    /// Capacity of the session event channel.
    pub event_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_millis(DEFAULT_WRITE_TIMEOUT_MS),
            event_capacity: SESSION_EVENT_CAPACITY,
        }
    }
}

impl CoordinatorConfig {
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}

struct CoordinatorInner {
    hub: HardwareHub,
    config: CoordinatorConfig,

    /// Writer lock.
    busy: AtomicBool,

    /// Live session, if any. Events are sent while this is held so that a
    /// snapshot never runs ahead of the stream.
    session: Mutex<Option<WriteSession>>,

    /// Cancellation handle of the live session.
    cancel: Mutex<Option<CancellationToken>>,

    events: broadcast::Sender<SessionEvent>,
}

/// Runs write sessions, one at a time.
///
/// Cheap to clone; clones share the lock and the event stream.
#[derive(Clone)]
pub struct WriteCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl std::fmt::Debug for WriteCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteCoordinator")
            .field("busy", &self.is_busy())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl WriteCoordinator {
    pub fn new(hub: HardwareHub, config: CoordinatorConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);

        Self {
            inner: Arc::new(CoordinatorInner {
                hub,
                config,
                busy: AtomicBool::new(false),
                session: Mutex::new(None),
                cancel: Mutex::new(None),
                events,
            }),
        }
    }

    /// The hub sessions run against.
    pub fn hub(&self) -> &HardwareHub {
        &self.inner.hub
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Returns `true` while a session holds the writer lock.
    pub fn is_busy(&self) -> bool {
        self.inner.busy.load(Ordering::SeqCst)
    }

    /// Snapshot of the live session.
    pub fn current_session(&self) -> Option<WriteSession> {
        lock(&self.inner.session).clone()
    }

    /// Subscribe to stage events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Cancel the live session.
    ///
    /// A session waiting for a tag fails immediately. A session inside a
    /// driver call fails at the next stage boundary; the driver call itself
    /// is never interrupted. Returns `false` if no session is active.
    pub fn cancel(&self) -> bool {
        match lock(&self.inner.cancel).as_ref() {
            Some(token) => {
                token.cancel();
                info!("Write session cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Write `payload` to the next tag presented to any reader.
    ///
    /// Never fails with `Err`: every outcome, including `SessionBusy`, is a
    /// [`WriteResult`]. A busy rejection leaves the running session and the
    /// event stream untouched.
    pub async fn write(&self, payload: &TagPayload, timeout: Duration) -> WriteResult {
        let Some(active) = ActiveSession::begin(self.inner.clone(), payload.as_str(), timeout)
        else {
            warn!(payload = %payload, "Write rejected, session already in progress");
            return WriteResult::failed(&WriteError::SessionBusy);
        };

        info!(
            payload = %payload,
            timeout_ms = timeout.as_millis() as u64,
            "Write session started"
        );

        let outcome = self.run(&active, payload, timeout).await;

        match &outcome {
            Ok(uid) => info!(payload = %payload, uid = %uid, "Tag written and verified"),
            Err(e) => warn!(payload = %payload, kind = %e.kind(), error = %e, "Write session failed"),
        }

        active.finish(outcome)
    }

    async fn run(
        &self,
        active: &ActiveSession,
        payload: &TagPayload,
        timeout: Duration,
    ) -> Result<String, WriteError> {
        let hub = &self.inner.hub;
        if !hub.is_ready() {
            return Err(WriteError::NoReaderAvailable);
        }

        // Subscribe before announcing `waiting` so no tap is missed.
        let mut hub_events = hub.subscribe();
        active.advance(WriteStage::Waiting)?;

        let (reader, uid) = wait_for_tag(active, &mut hub_events, timeout).await?;
        drop(hub_events);

        active.advance_with(WriteStage::CardDetected, |session| {
            session.bind(reader.as_str(), uid.as_str())
        })?;

        let bytes = payload.as_bytes();
        hub.write_payload(&reader, bytes)
            .await
            .map_err(|e| WriteError::driver(e.to_string()))?;
        active.advance(WriteStage::Writing)?;

        active.advance(WriteStage::Verifying)?;
        let stored = hub
            .read_payload(&reader)
            .await
            .map_err(|e| WriteError::driver(format!("read-back failed: {}", e)))?;

        if stored != bytes {
            return Err(WriteError::VerifyMismatch {
                written: bytes.len(),
                read: stored.len(),
            });
        }

        active.check_cancelled()?;
        Ok(uid)
    }
}

/// Wait for the first tap after `waiting` began.
async fn wait_for_tag(
    active: &ActiveSession,
    hub_events: &mut broadcast::Receiver<HubEvent>,
    timeout: Duration,
) -> Result<(String, String), WriteError> {
    let deadline = Instant::now() + timeout;

    loop {
        let received = tokio::select! {
            _ = active.token.cancelled() => return Err(WriteError::Cancelled),
            received = tokio::time::timeout_at(deadline, hub_events.recv()) => received,
        };

        match received {
            Err(_elapsed) => {
                return Err(WriteError::WriteTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            Ok(Ok(HubEvent::CardPresent { reader, uid })) => return Ok((reader, uid)),
            Ok(Ok(_)) => {}
            Ok(Err(RecvError::Lagged(skipped))) => {
                warn!(skipped, "Write session fell behind hub events");
            }
            Ok(Err(RecvError::Closed)) => return Err(WriteError::NoReaderAvailable),
        }
    }
}

/// Holder of the writer lock for one session.
struct ActiveSession {
    inner: Arc<CoordinatorInner>,
    token: CancellationToken,
    finished: bool,
}

impl ActiveSession {
    /// Take the writer lock and install a fresh session.
    fn begin(inner: Arc<CoordinatorInner>, payload: &str, timeout: Duration) -> Option<Self> {
        inner
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;

        let token = CancellationToken::new();
        *lock(&inner.cancel) = Some(token.clone());
        *lock(&inner.session) = Some(WriteSession::new(payload, timeout));

        Some(Self {
            inner,
            token,
            finished: false,
        })
    }

    fn check_cancelled(&self) -> Result<(), WriteError> {
        if self.token.is_cancelled() {
            Err(WriteError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn advance(&self, stage: WriteStage) -> Result<(), WriteError> {
        self.advance_with(stage, |_| {})
    }

    /// Apply `update`, move to `stage` and publish it, unless cancelled.
    fn advance_with(
        &self,
        stage: WriteStage,
        update: impl FnOnce(&mut WriteSession),
    ) -> Result<(), WriteError> {
        self.check_cancelled()?;
        self.transition(stage, update);
        Ok(())
    }

    fn transition(&self, stage: WriteStage, update: impl FnOnce(&mut WriteSession)) {
        let mut guard = lock(&self.inner.session);
        let Some(session) = guard.as_mut() else {
            return;
        };

        update(session);
        match session.transition_to(stage) {
            Ok(_) => {
                // No subscribers is not an error.
                let _ = self.inner.events.send(session.event());
            }
            Err(e) => error!(error = %e, "Write session stage out of order"),
        }
    }

    /// Publish the terminal stage and release the lock.
    fn finish(mut self, outcome: Result<String, WriteError>) -> WriteResult {
        let result = match outcome {
            Ok(uid) => {
                self.transition(WriteStage::Success, |session| {
                    session.uid = Some(uid.clone());
                });
                WriteResult::succeeded(uid)
            }
            Err(e) => {
                let message = e.to_string();
                self.transition(WriteStage::Failed, |session| {
                    session.message = Some(message);
                });
                WriteResult::failed(&e)
            }
        };

        self.finished = true;
        result
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        if !self.finished {
            warn!("Write session dropped before completion");
            self.transition(WriteStage::Failed, |session| {
                session.message = Some(ABORTED_MESSAGE.to_string());
            });
        }

        *lock(&self.inner.session) = None;
        *lock(&self.inner.cancel) = None;
        self.inner.busy.store(false, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tagwriter_hardware::HubConfig;
    use tagwriter_hardware::mock::{MockDriverHandle, MockReaderDriver};

    const READER: &str = "Mock Reader 00";
    const UID: [u8; 7] = [0x04, 0xA2, 0x3B, 0x1C, 0x5D, 0x6E, 0x80];

    fn payload() -> TagPayload {
        TagPayload::new("https://vet.example/pet/42").unwrap()
    }

    async fn coordinator(initialize: bool) -> (WriteCoordinator, MockDriverHandle) {
        let (driver, handle) = MockReaderDriver::new();
        let hub = HardwareHub::new(driver.into(), HubConfig::default());
        if initialize {
            hub.initialize().await.unwrap();
        }
        (
            WriteCoordinator::new(hub, CoordinatorConfig::default()),
            handle,
        )
    }

    async fn attach(coordinator: &WriteCoordinator, handle: &MockDriverHandle, name: &str) {
        let mut hub_events = coordinator.hub().subscribe();
        handle.attach_reader(name).await.unwrap();
        hub_events.recv().await.unwrap();
    }

    async fn wait_for_stage(events: &mut broadcast::Receiver<SessionEvent>, stage: WriteStage) {
        loop {
            if events.recv().await.unwrap().stage == stage {
                return;
            }
        }
    }

    fn spawn_write(
        coordinator: &WriteCoordinator,
        timeout: Duration,
    ) -> tokio::task::JoinHandle<WriteResult> {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.write(&payload(), timeout).await })
    }

    #[test]
    fn test_write_result_serialization() {
        let json = serde_json::to_value(WriteResult::succeeded("04ABCDEF")).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["uid"], "04ABCDEF");
        assert!(json.get("error_kind").is_none());

        let json = serde_json::to_value(WriteResult::failed(&WriteError::Cancelled)).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error_kind"], "cancelled");
        assert_eq!(json["error_message"], "Write cancelled");
    }

    #[tokio::test]
    async fn test_idle_coordinator() {
        let (coordinator, _handle) = coordinator(true).await;
        assert!(!coordinator.is_busy());
        assert!(coordinator.current_session().is_none());
        assert!(!coordinator.cancel());
    }

    #[tokio::test]
    async fn test_no_reader_available_when_hub_not_initialized() {
        let (coordinator, _handle) = coordinator(false).await;
        let mut events = coordinator.subscribe();

        let result = coordinator.write(&payload(), Duration::from_secs(5)).await;

        assert_eq!(result.error_kind, Some(WriteErrorKind::NoReaderAvailable));
        assert_eq!(events.recv().await.unwrap().stage, WriteStage::Failed);
        assert!(!coordinator.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_releases_lock() {
        let (coordinator, _handle) = coordinator(true).await;
        let mut events = coordinator.subscribe();
        let started = Instant::now();

        let result = coordinator.write(&payload(), Duration::from_millis(5000)).await;

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(5000));
        assert!(elapsed < Duration::from_millis(5100));
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(WriteErrorKind::WriteTimeout));
        assert!(!coordinator.is_busy());
        assert!(coordinator.current_session().is_none());

        assert_eq!(events.recv().await.unwrap().stage, WriteStage::Waiting);
        let failed = events.recv().await.unwrap();
        assert_eq!(failed.stage, WriteStage::Failed);
        assert_eq!(
            failed.message.as_deref(),
            Some("Timed out after 5000ms waiting for a tag")
        );
    }

    #[tokio::test]
    async fn test_busy_rejection_leaves_session_untouched() {
        let (coordinator, _handle) = coordinator(true).await;
        let mut events = coordinator.subscribe();

        let first = spawn_write(&coordinator, Duration::from_secs(60));
        wait_for_stage(&mut events, WriteStage::Waiting).await;
        assert!(coordinator.is_busy());

        let second = coordinator.write(&payload(), Duration::from_secs(1)).await;
        assert_eq!(second.error_kind, Some(WriteErrorKind::SessionBusy));
        assert!(coordinator.is_busy());
        assert_eq!(
            coordinator.current_session().unwrap().stage(),
            WriteStage::Waiting
        );
        assert!(events.try_recv().is_err());

        assert!(coordinator.cancel());
        let first = first.await.unwrap();
        assert_eq!(first.error_kind, Some(WriteErrorKind::Cancelled));
        assert!(!coordinator.is_busy());
    }

    #[tokio::test]
    async fn test_successful_write_emits_ordered_stages() {
        let (coordinator, handle) = coordinator(true).await;
        attach(&coordinator, &handle, READER).await;
        let mut events = coordinator.subscribe();

        let write = spawn_write(&coordinator, Duration::from_secs(60));
        wait_for_stage(&mut events, WriteStage::Waiting).await;
        handle.present_tag(READER, UID.to_vec()).await.unwrap();

        let result = write.await.unwrap();
        assert!(result.success, "{:?}", result);
        assert_eq!(result.uid.as_deref(), Some("04A23B1C5D6E80"));
        assert_eq!(
            handle.tag_memory(READER).unwrap(),
            b"https://vet.example/pet/42"
        );

        let mut stages = Vec::new();
        while let Ok(event) = events.try_recv() {
            stages.push(event.stage);
        }
        assert_eq!(
            stages,
            vec![
                WriteStage::CardDetected,
                WriteStage::Writing,
                WriteStage::Verifying,
                WriteStage::Success
            ]
        );
        assert!(!coordinator.is_busy());
    }

    #[tokio::test]
    async fn test_verify_mismatch() {
        let (coordinator, handle) = coordinator(true).await;
        attach(&coordinator, &handle, READER).await;
        let mut events = coordinator.subscribe();
        handle.corrupt_next_write();

        let write = spawn_write(&coordinator, Duration::from_secs(60));
        wait_for_stage(&mut events, WriteStage::Waiting).await;
        handle.present_tag(READER, UID.to_vec()).await.unwrap();

        let result = write.await.unwrap();
        assert_eq!(result.error_kind, Some(WriteErrorKind::VerifyMismatch));
        wait_for_stage(&mut events, WriteStage::Failed).await;
    }

    #[tokio::test]
    async fn test_driver_failure_is_not_retried() {
        let (coordinator, handle) = coordinator(true).await;
        attach(&coordinator, &handle, READER).await;
        let mut events = coordinator.subscribe();
        handle.fail_next_write("tag moved out of field");

        let write = spawn_write(&coordinator, Duration::from_secs(60));
        wait_for_stage(&mut events, WriteStage::Waiting).await;
        handle.present_tag(READER, UID.to_vec()).await.unwrap();

        let result = write.await.unwrap();
        assert_eq!(result.error_kind, Some(WriteErrorKind::DriverWriteFailed));
        assert!(
            result
                .error_message
                .unwrap()
                .contains("tag moved out of field")
        );
        assert_eq!(handle.write_count(), 0);

        let mut stages = Vec::new();
        while let Ok(event) = events.try_recv() {
            stages.push(event.stage);
        }
        assert_eq!(stages, vec![WriteStage::CardDetected, WriteStage::Failed]);
    }

    #[tokio::test]
    async fn test_binds_to_first_reader_tapped() {
        let (coordinator, handle) = coordinator(true).await;
        attach(&coordinator, &handle, "Reader A").await;
        attach(&coordinator, &handle, "Reader B").await;
        let mut events = coordinator.subscribe();

        let write = spawn_write(&coordinator, Duration::from_secs(60));
        wait_for_stage(&mut events, WriteStage::Waiting).await;
        handle.present_tag("Reader B", UID.to_vec()).await.unwrap();

        let detected = events.recv().await.unwrap();
        assert_eq!(detected.stage, WriteStage::CardDetected);
        assert_eq!(detected.reader.as_deref(), Some("Reader B"));

        assert!(write.await.unwrap().success);
        assert!(handle.tag_memory("Reader A").is_none());
        assert!(handle.tag_memory("Reader B").is_some());
    }

    #[tokio::test]
    async fn test_tag_present_before_waiting_is_ignored() {
        let (coordinator, handle) = coordinator(true).await;
        attach(&coordinator, &handle, READER).await;

        let mut hub_events = coordinator.hub().subscribe();
        handle.present_tag(READER, UID.to_vec()).await.unwrap();
        hub_events.recv().await.unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            coordinator.write(&payload(), Duration::from_millis(50)),
        )
        .await
        .unwrap();
        assert_eq!(result.error_kind, Some(WriteErrorKind::WriteTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_write_releases_lock() {
        let (coordinator, _handle) = coordinator(true).await;
        let mut events = coordinator.subscribe();

        let aborted = tokio::time::timeout(
            Duration::from_millis(100),
            coordinator.write(&payload(), Duration::from_secs(60)),
        )
        .await;
        assert!(aborted.is_err());
        assert!(!coordinator.is_busy());

        assert_eq!(events.recv().await.unwrap().stage, WriteStage::Waiting);
        let failed = events.recv().await.unwrap();
        assert_eq!(failed.stage, WriteStage::Failed);
        assert_eq!(failed.message.as_deref(), Some(ABORTED_MESSAGE));
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let (coordinator, _handle) = coordinator(true).await;
        let mut events = coordinator.subscribe();

        let write = spawn_write(&coordinator, Duration::from_secs(60));
        wait_for_stage(&mut events, WriteStage::Waiting).await;
        assert!(coordinator.cancel());

        let result = write.await.unwrap();
        assert_eq!(result.error_kind, Some(WriteErrorKind::Cancelled));
        let failed = events.recv().await.unwrap();
        assert_eq!(failed.stage, WriteStage::Failed);
        assert_eq!(failed.message.as_deref(), Some("Write cancelled"));
        assert!(!coordinator.cancel());
    }
}
