//! Mock reader driver for testing and development.
//!
//! This module provides a simulated NFC driver that can be controlled
//! programmatically: readers are plugged in and out, tags are presented and
//! removed, and write/read faults can be injected, all without hardware.

use crate::{
    HardwareError, Result,
    traits::ReaderDriver,
    types::{DriverEvent, TagUid},
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tagwriter_core::constants::DRIVER_EVENT_CAPACITY;
use tokio::sync::mpsc;

/// Simulated tag sitting in a mock reader's field.
#[derive(Debug, Clone)]
struct MockTag {
    uid: TagUid,
    memory: Vec<u8>,
}

/// Shared state between the driver and its handle.
#[derive(Debug, Default)]
struct MockState {
    /// Attached readers and the tag in their field, if any.
    readers: HashMap<String, Option<MockTag>>,

    /// Error message returned by the next write.
    fail_next_write: Option<String>,

    /// Error message returned by the next read.
    fail_next_read: Option<String>,

    /// Flip the last stored byte of the next write.
    corrupt_next_write: bool,

    /// Successful writes so far.
    write_count: usize,
}

/// Mock NFC reader driver for testing and development.
///
/// # Examples
///
/// ```
/// use tagwriter_hardware::mock::MockReaderDriver;
/// use tagwriter_hardware::traits::ReaderDriver;
///
/// #[tokio::main]
/// async fn main() -> tagwriter_hardware::Result<()> {
///     let (mut driver, handle) = MockReaderDriver::new();
///
///     handle.attach_reader("Reader 1").await?;
///     handle.present_tag("Reader 1", vec![0x04, 0xAB, 0xCD, 0xEF]).await?;
///
///     driver.write_payload("Reader 1", b"https://vet.example/pet/1").await?;
///     assert_eq!(driver.read_payload("Reader 1").await?, b"https://vet.example/pet/1");
///
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct MockReaderDriver {
    /// Event receiver, taken by `listen()`
    event_rx: Option<mpsc::Receiver<DriverEvent>>,

    /// Shared simulated hardware state
    state: Arc<Mutex<MockState>>,

    /// Driver name
    name: String,
}

impl MockReaderDriver {
    /// Create a new mock driver with the default name.
    ///
    /// Returns a tuple of (MockReaderDriver, MockDriverHandle) where the handle
    /// simulates the physical world around the driver.
    pub fn new() -> (Self, MockDriverHandle) {
        Self::with_name("Mock NFC Driver")
    }

    /// Create a new mock driver with a custom name.
    pub fn with_name(name: impl Into<String>) -> (Self, MockDriverHandle) {
        let (event_tx, event_rx) = mpsc::channel(DRIVER_EVENT_CAPACITY);
        let state = Arc::new(Mutex::new(MockState::default()));

        let driver = Self {
            event_rx: Some(event_rx),
            state: state.clone(),
            name: name.into(),
        };

        let handle = MockDriverHandle { event_tx, state };

        (driver, handle)
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        lock(&self.state)
    }
}

impl ReaderDriver for MockReaderDriver {
    fn listen(&mut self) -> Result<mpsc::Receiver<DriverEvent>> {
        self.event_rx
            .take()
            .ok_or_else(|| HardwareError::initialization_failed("mock driver already listening"))
    }

    async fn write_payload(&mut self, reader: &str, payload: &[u8]) -> Result<()> {
        let mut state = self.state();

        if let Some(message) = state.fail_next_write.take() {
            return Err(HardwareError::write(message));
        }

        let corrupt = std::mem::take(&mut state.corrupt_next_write);

        let slot = state
            .readers
            .get_mut(reader)
            .ok_or_else(|| HardwareError::disconnected(reader))?;
        let tag = slot.as_mut().ok_or_else(|| HardwareError::no_tag(reader))?;

        tag.memory = payload.to_vec();
        if corrupt && let Some(last) = tag.memory.last_mut() {
            *last ^= 0xFF;
        }

        state.write_count += 1;
        Ok(())
    }

    async fn read_payload(&mut self, reader: &str) -> Result<Vec<u8>> {
        let mut state = self.state();

        if let Some(message) = state.fail_next_read.take() {
            return Err(HardwareError::read(message));
        }

        let slot = state
            .readers
            .get(reader)
            .ok_or_else(|| HardwareError::disconnected(reader))?;
        let tag = slot.as_ref().ok_or_else(|| HardwareError::no_tag(reader))?;

        Ok(tag.memory.clone())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Handle for controlling a mock driver.
///
/// Every method that changes the simulated world also emits the matching
/// driver event, in call order.
#[derive(Debug, Clone)]
pub struct MockDriverHandle {
    /// Channel sender for driver events
    event_tx: mpsc::Sender<DriverEvent>,

    /// Shared simulated hardware state
    state: Arc<Mutex<MockState>>,
}

impl MockDriverHandle {
    /// Plug in a reader.
    ///
    /// # Errors
    ///
    /// Returns an error if the driver has been dropped.
    pub async fn attach_reader(&self, name: &str) -> Result<()> {
        lock(&self.state).readers.insert(name.to_string(), None);
        self.emit(DriverEvent::ReaderAttached {
            name: name.to_string(),
        })
        .await
    }

    /// Unplug a reader, removing any tag in its field silently.
    pub async fn detach_reader(&self, name: &str) -> Result<()> {
        lock(&self.state).readers.remove(name);
        self.emit(DriverEvent::ReaderDetached {
            name: name.to_string(),
        })
        .await
    }

    /// Present a tag with the given UID and empty memory to a reader.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The UID is not 4-10 bytes long
    /// - The reader is not attached
    /// - The driver has been dropped
    pub async fn present_tag(&self, reader: &str, uid: Vec<u8>) -> Result<()> {
        let uid = TagUid::new(uid)?;
        {
            let mut state = lock(&self.state);
            let slot = state
                .readers
                .get_mut(reader)
                .ok_or_else(|| HardwareError::disconnected(reader))?;
            *slot = Some(MockTag {
                uid: uid.clone(),
                memory: Vec::new(),
            });
        }
        self.emit(DriverEvent::CardPresent {
            reader: reader.to_string(),
            uid,
        })
        .await
    }

    /// Take the tag out of a reader's field.
    ///
    /// Does nothing if the field is already empty.
    pub async fn remove_tag(&self, reader: &str) -> Result<()> {
        let removed = lock(&self.state)
            .readers
            .get_mut(reader)
            .and_then(Option::take);

        match removed {
            Some(tag) => {
                self.emit(DriverEvent::CardRemoved {
                    reader: reader.to_string(),
                    uid: tag.uid,
                })
                .await
            }
            None => Ok(()),
        }
    }

    /// Emit a driver error event.
    pub async fn emit_error(&self, reader: Option<&str>, message: &str) -> Result<()> {
        self.emit(DriverEvent::Error {
            reader: reader.map(str::to_string),
            message: message.to_string(),
        })
        .await
    }

    /// Make the next write fail with `message`.
    pub fn fail_next_write(&self, message: &str) {
        lock(&self.state).fail_next_write = Some(message.to_string());
    }

    /// Make the next read fail with `message`.
    pub fn fail_next_read(&self, message: &str) {
        lock(&self.state).fail_next_read = Some(message.to_string());
    }

    /// Store a corrupted copy of the next written payload.
    pub fn corrupt_next_write(&self) {
        lock(&self.state).corrupt_next_write = true;
    }

    /// Memory of the tag currently in `reader`'s field.
    pub fn tag_memory(&self, reader: &str) -> Option<Vec<u8>> {
        lock(&self.state)
            .readers
            .get(reader)
            .and_then(|slot| slot.as_ref().map(|tag| tag.memory.clone()))
    }

    /// Number of successful writes.
    pub fn write_count(&self) -> usize {
        lock(&self.state).write_count
    }

    async fn emit(&self, event: DriverEvent) -> Result<()> {
        self.event_tx
            .send(event)
            .await
            .map_err(|_| HardwareError::disconnected("mock driver event channel closed"))
    }
}

/// Lock the shared state, recovering from a poisoned mutex.
fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
