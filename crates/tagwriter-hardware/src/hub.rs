//! Hardware event hub.
//!
//! The [`HardwareHub`] owns the reader driver, turns its raw events into a
//! typed broadcast stream, and keeps the set of attached readers. It is the
//! only component that talks to the driver.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐  mpsc   ┌────────────┐  broadcast  ┌──────────────┐
//! │ Driver   │────────►│ Pump task  │────────────►│ Coordinator  │
//! │ (mock /  │         │ (apply to  │             ├──────────────┤
//! │  PC/SC)  │         │ reader set)│────────────►│ Fan-out hub  │
//! └──────────┘         └────────────┘             └──────────────┘
//!      ▲
//!      │ write_payload / read_payload (async mutex)
//! ```
//!
//! A single pump task applies each driver event to the reader set and only
//! then publishes it, so a subscriber that calls
//! [`list_readers`](HardwareHub::list_readers) after receiving an event
//! always sees that event reflected.
//!
//! # Examples
//!
//! ```no_run
//! use tagwriter_hardware::hub::{HardwareHub, HubConfig};
//! use tagwriter_hardware::mock::MockReaderDriver;
//!
//! #[tokio::main]
//! async fn main() {
//!     let (driver, handle) = MockReaderDriver::new();
//!     let hub = HardwareHub::new(driver.into(), HubConfig::default());
//!
//!     let mut events = hub.subscribe();
//!     hub.initialize().await.unwrap();
//!
//!     handle.attach_reader("Reader 1").await.unwrap();
//!     println!("{:?}", events.recv().await);
//!     println!("{:?}", hub.list_readers());
//! }
//! ```

use crate::devices::AnyReaderDriver;
use crate::traits::ReaderDriver;
use crate::types::{DriverEvent, Reader, ReaderState};
use crate::{HardwareError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tagwriter_core::constants::HUB_EVENT_CAPACITY;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Typed event published by the hub.
///
/// Serialized as `{"type": "card-present", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum HubEvent {
    /// A reader was plugged in.
    ReaderAttached { name: String },

    /// A reader was unplugged.
    ReaderDetached { name: String },

    /// A tag entered a reader's field.
    CardPresent { reader: String, uid: String },

    /// A tag left a reader's field.
    CardRemoved { reader: String, uid: String },

    /// The driver reported an error.
    DriverError {
        reader: Option<String>,
        message: String,
    },
}

impl HubEvent {
    /// Wire name of the event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ReaderAttached { .. } => "reader-attached",
            Self::ReaderDetached { .. } => "reader-detached",
            Self::CardPresent { .. } => "card-present",
            Self::CardRemoved { .. } => "card-removed",
            Self::DriverError { .. } => "driver-error",
        }
    }
}

/// Configuration for the hardware hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    /// Capacity of the broadcast channel. Subscribers further behind than
    /// this lose the oldest events.
    pub event_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            event_capacity: HUB_EVENT_CAPACITY,
        }
    }
}

impl HubConfig {
    /// Set the broadcast channel capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}

struct HubInner {
    /// Driver; the async mutex serializes card commands.
    driver: tokio::sync::Mutex<AnyReaderDriver>,

    /// Attached readers, keyed by name. Only the pump task writes.
    readers: RwLock<BTreeMap<String, Reader>>,

    events: broadcast::Sender<HubEvent>,

    ready: AtomicBool,

    pump: Mutex<Option<JoinHandle<()>>>,
}

/// Owner of the reader driver and the attached-reader set.
///
/// Cheap to clone; all clones share one driver.
#[derive(Clone)]
pub struct HardwareHub {
    inner: Arc<HubInner>,
}

impl std::fmt::Debug for HardwareHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardwareHub")
            .field("ready", &self.is_ready())
            .field("readers", &self.list_readers().len())
            .finish()
    }
}

impl HardwareHub {
    /// Create a hub around `driver`. Nothing happens until
    /// [`initialize`](Self::initialize) is called.
    pub fn new(driver: AnyReaderDriver, config: HubConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);

        Self {
            inner: Arc::new(HubInner {
                driver: tokio::sync::Mutex::new(driver),
                readers: RwLock::new(BTreeMap::new()),
                events,
                ready: AtomicBool::new(false),
                pump: Mutex::new(None),
            }),
        }
    }

    /// Start listening to the driver.
    ///
    /// Idempotent: once listening, further calls return `Ok` and do nothing.
    /// A driver that fails to start is published as a `driver-error` event
    /// and returned; the hub then stays not ready.
    pub async fn initialize(&self) -> Result<()> {
        if self.inner.ready.swap(true, Ordering::SeqCst) {
            debug!("Hardware hub already initialized");
            return Ok(());
        }

        let mut driver = self.inner.driver.lock().await;
        let driver_name = driver.name().to_string();

        match driver.listen() {
            Ok(driver_rx) => {
                let pump = tokio::spawn(Self::pump(self.inner.clone(), driver_rx));
                *self
                    .inner
                    .pump
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(pump);
                info!(driver = %driver_name, kind = driver.kind(), "Hardware hub initialized");
                Ok(())
            }
            Err(e) => {
                error!(driver = %driver_name, error = %e, "Reader driver failed to start");
                self.inner.ready.store(false, Ordering::SeqCst);
                let _ = self.inner.events.send(HubEvent::DriverError {
                    reader: None,
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Returns `true` once [`initialize`](Self::initialize) started the driver.
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    /// Snapshot of the attached readers, ordered by name.
    pub fn list_readers(&self) -> Vec<Reader> {
        self.inner
            .readers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Subscribe to hub events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.inner.events.subscribe()
    }

    /// Write `payload` to the tag on `reader`.
    pub async fn write_payload(&self, reader: &str, payload: &[u8]) -> Result<()> {
        self.ensure_ready()?;
        let mut driver = self.inner.driver.lock().await;
        driver.write_payload(reader, payload).await
    }

    /// Read back the payload stored on the tag on `reader`.
    pub async fn read_payload(&self, reader: &str) -> Result<Vec<u8>> {
        self.ensure_ready()?;
        let mut driver = self.inner.driver.lock().await;
        driver.read_payload(reader).await
    }

    /// Stop the pump task. Events still queued in the driver are dropped.
    pub fn shutdown(&self) {
        let pump = self
            .inner
            .pump
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        if let Some(pump) = pump {
            pump.abort();
            info!("Hardware hub stopped");
        }
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(HardwareError::initialization_failed(
                "hardware hub not initialized",
            ))
        }
    }

    async fn pump(inner: Arc<HubInner>, mut driver_rx: mpsc::Receiver<DriverEvent>) {
        while let Some(event) = driver_rx.recv().await {
            let event = Self::apply(&inner.readers, event);
            debug!(kind = event.kind(), "Hub event");
            // No subscribers is not an error.
            let _ = inner.events.send(event);
        }

        warn!("Reader driver event channel closed");
    }

    /// Update the reader set for `event` and translate it.
    fn apply(readers: &RwLock<BTreeMap<String, Reader>>, event: DriverEvent) -> HubEvent {
        let mut readers = readers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        match event {
            DriverEvent::ReaderAttached { name } => {
                info!(reader = %name, "Reader attached");
                readers.insert(name.clone(), Reader::attached(name.clone()));
                HubEvent::ReaderAttached { name }
            }
            DriverEvent::ReaderDetached { name } => {
                info!(reader = %name, "Reader detached");
                readers.remove(&name);
                HubEvent::ReaderDetached { name }
            }
            DriverEvent::CardPresent { reader, uid } => {
                let uid = uid.to_hex();
                match readers.get_mut(&reader) {
                    Some(entry) => {
                        entry.state = ReaderState::TagPresent { uid: uid.clone() };
                        info!(reader = %reader, uid = %uid, "Tag present");
                    }
                    None => warn!(reader = %reader, uid = %uid, "Tag on unknown reader"),
                }
                HubEvent::CardPresent { reader, uid }
            }
            DriverEvent::CardRemoved { reader, uid } => {
                if let Some(entry) = readers.get_mut(&reader) {
                    entry.state = ReaderState::Connected;
                }
                debug!(reader = %reader, "Tag removed");
                HubEvent::CardRemoved {
                    reader,
                    uid: uid.to_hex(),
                }
            }
            DriverEvent::Error { reader, message } => {
                warn!(reader = ?reader, error = %message, "Driver error");
                HubEvent::DriverError { reader, message }
            }
        }
    }
}
