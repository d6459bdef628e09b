//! PC/SC reader driver.
//!
//! Talks to USB readers (ACR122U and compatible) through the platform PC/SC
//! service. Reader hot-plug and tag presence come from a monitor thread that
//! blocks in `SCardGetStatusChange`; card commands run on Tokio's blocking
//! pool because every PC/SC call is synchronous.
//!
//! Tags are treated as NTAG21x: user memory starts at page 4, four bytes per
//! page. The payload is stored inside a single TLV block (`0x03 len .. 0xFE`)
//! so it can be read back without knowing its length in advance.

use crate::{
    HardwareError, Result,
    traits::ReaderDriver,
    types::{DriverEvent, TagUid},
};
use pcsc::{Context, Protocols, ReaderState, Scope, ShareMode, State};
use std::collections::HashMap;
use std::ffi::CString;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tagwriter_core::constants::DRIVER_EVENT_CAPACITY;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// First user-memory page on NTAG21x tags.
const FIRST_USER_PAGE: u8 = 4;

/// Bytes per NTAG page.
const PAGE_SIZE: usize = 4;

/// User memory of an NTAG215 (pages 4..=129).
pub const DEFAULT_TAG_CAPACITY: usize = 504;

/// `SCardGetStatusChange` timeout; bounds how long shutdown waits.
const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Back-off after a PC/SC service error in the monitor loop.
const ERROR_BACKOFF: Duration = Duration::from_secs(2);

const APDU_GET_UID: [u8; 5] = [0xFF, 0xCA, 0x00, 0x00, 0x00];

const TLV_NDEF: u8 = 0x03;
const TLV_TERMINATOR: u8 = 0xFE;

/// Reader driver backed by the platform PC/SC service.
pub struct PcscReaderDriver {
    context: Context,
    capacity: usize,
    stop: Arc<AtomicBool>,
    monitor: Option<JoinHandle<()>>,
}

impl PcscReaderDriver {
    /// Establish a PC/SC context.
    ///
    /// # Errors
    ///
    /// Fails when the PC/SC service (pcscd on Linux) is not running.
    pub fn new() -> Result<Self> {
        let context = Context::establish(Scope::User).map_err(|e| {
            HardwareError::initialization_failed(format!("PC/SC context: {}", e))
        })?;

        Ok(Self {
            context,
            capacity: DEFAULT_TAG_CAPACITY,
            stop: Arc::new(AtomicBool::new(false)),
            monitor: None,
        })
    }

    /// Override the tag user-memory capacity (NTAG213: 144, NTAG216: 888).
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

impl std::fmt::Debug for PcscReaderDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PcscReaderDriver")
            .field("capacity", &self.capacity)
            .field("listening", &self.monitor.is_some())
            .finish()
    }
}

impl Drop for PcscReaderDriver {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.context.cancel();
        if let Some(monitor) = self.monitor.take() {
            let _ = monitor.join();
        }
    }
}

impl ReaderDriver for PcscReaderDriver {
    fn listen(&mut self) -> Result<mpsc::Receiver<DriverEvent>> {
        if self.monitor.is_some() {
            return Err(HardwareError::initialization_failed(
                "PC/SC driver already listening",
            ));
        }

        let (tx, rx) = mpsc::channel(DRIVER_EVENT_CAPACITY);
        let context = self.context.clone();
        let stop = self.stop.clone();

        let monitor = std::thread::Builder::new()
            .name("pcsc-monitor".to_string())
            .spawn(move || monitor_loop(context, stop, tx))
            .map_err(|e| HardwareError::initialization_failed(e.to_string()))?;

        self.monitor = Some(monitor);
        Ok(rx)
    }

    async fn write_payload(&mut self, reader: &str, payload: &[u8]) -> Result<()> {
        let block = encode_tlv(payload);
        if block.len() > self.capacity {
            return Err(HardwareError::CapacityExceeded {
                size: block.len(),
                capacity: self.capacity,
            });
        }

        let context = self.context.clone();
        let reader = reader.to_string();
        tokio::task::spawn_blocking(move || write_block(&context, &reader, &block))
            .await
            .map_err(|e| HardwareError::communication(e.to_string()))?
    }

    async fn read_payload(&mut self, reader: &str) -> Result<Vec<u8>> {
        let context = self.context.clone();
        let reader = reader.to_string();
        let capacity = self.capacity;
        tokio::task::spawn_blocking(move || read_block(&context, &reader, capacity))
            .await
            .map_err(|e| HardwareError::communication(e.to_string()))?
    }

    fn name(&self) -> &str {
        "PC/SC"
    }
}

/// Blocking monitor loop translating PC/SC state changes into driver events.
fn monitor_loop(context: Context, stop: Arc<AtomicBool>, tx: mpsc::Sender<DriverEvent>) {
    let mut states = vec![ReaderState::new(pcsc::PNP_NOTIFICATION(), State::UNAWARE)];
    let mut tags: HashMap<String, TagUid> = HashMap::new();

    info!("PC/SC monitor started");

    while !stop.load(Ordering::SeqCst) {
        // Drop readers the service no longer knows about.
        let mut detached = Vec::new();
        states.retain(|rs| {
            let dead = rs.name() != pcsc::PNP_NOTIFICATION()
                && rs.event_state().intersects(State::UNKNOWN | State::IGNORE);
            if dead {
                detached.push(rs.name().to_string_lossy().into_owned());
            }
            !dead
        });
        for name in detached {
            tags.remove(&name);
            if !emit(&tx, DriverEvent::ReaderDetached { name }) {
                return;
            }
        }

        let names = match context.list_readers_owned() {
            Ok(names) => names,
            Err(pcsc::Error::NoReadersAvailable) => Vec::new(),
            Err(e) => {
                warn!(error = %e, "Failed to list PC/SC readers");
                Vec::new()
            }
        };
        for name in names {
            if !states.iter().any(|rs| rs.name() == name.as_c_str()) {
                let display = name.to_string_lossy().into_owned();
                states.push(ReaderState::new(name, State::UNAWARE));
                if !emit(&tx, DriverEvent::ReaderAttached { name: display }) {
                    return;
                }
            }
        }

        for rs in &mut states {
            rs.sync_current_state();
        }

        match context.get_status_change(STATUS_POLL_INTERVAL, &mut states) {
            Ok(()) => {}
            Err(pcsc::Error::Timeout) => continue,
            Err(pcsc::Error::Cancelled) => break,
            Err(e) => {
                if !emit(
                    &tx,
                    DriverEvent::Error {
                        reader: None,
                        message: format!("PC/SC status change failed: {}", e),
                    },
                ) {
                    return;
                }
                std::thread::sleep(ERROR_BACKOFF);
                continue;
            }
        }

        for rs in states.iter().skip(1) {
            let reader = rs.name().to_string_lossy().into_owned();
            let present = rs.event_state().contains(State::PRESENT);

            let event = match (present, tags.contains_key(&reader)) {
                (true, false) => match read_uid(&context, &reader) {
                    Ok(uid) => {
                        tags.insert(reader.clone(), uid.clone());
                        Some(DriverEvent::CardPresent { reader, uid })
                    }
                    Err(e) => Some(DriverEvent::Error {
                        reader: Some(reader),
                        message: e.to_string(),
                    }),
                },
                (false, true) => tags
                    .remove(&reader)
                    .map(|uid| DriverEvent::CardRemoved { reader, uid }),
                _ => None,
            };

            if let Some(event) = event
                && !emit(&tx, event)
            {
                return;
            }
        }
    }

    info!("PC/SC monitor stopped");
}

/// Forward an event to the hub; `false` once the hub is gone.
fn emit(tx: &mpsc::Sender<DriverEvent>, event: DriverEvent) -> bool {
    debug!(?event, "PC/SC event");
    tx.blocking_send(event).is_ok()
}

fn connect(context: &Context, reader: &str) -> Result<pcsc::Card> {
    let name = CString::new(reader).map_err(|e| HardwareError::invalid_data(e.to_string()))?;
    context
        .connect(&name, ShareMode::Shared, Protocols::ANY)
        .map_err(|e| match e {
            pcsc::Error::NoSmartcard | pcsc::Error::RemovedCard => HardwareError::no_tag(reader),
            pcsc::Error::UnknownReader | pcsc::Error::ReaderUnavailable => {
                HardwareError::disconnected(reader)
            }
            other => HardwareError::communication(other.to_string()),
        })
}

/// Send one APDU and strip the `90 00` status word.
fn transmit(card: &pcsc::Card, reader: &str, apdu: &[u8]) -> Result<Vec<u8>> {
    let mut buffer = [0u8; pcsc::MAX_BUFFER_SIZE];
    let response = card.transmit(apdu, &mut buffer).map_err(|e| match e {
        pcsc::Error::RemovedCard | pcsc::Error::NoSmartcard => HardwareError::no_tag(reader),
        other => HardwareError::communication(other.to_string()),
    })?;

    match response {
        [data @ .., 0x90, 0x00] => Ok(data.to_vec()),
        [.., sw1, sw2] => Err(HardwareError::communication(format!(
            "APDU failed with status {:02X}{:02X}",
            sw1, sw2
        ))),
        _ => Err(HardwareError::invalid_data("short APDU response")),
    }
}

fn read_uid(context: &Context, reader: &str) -> Result<TagUid> {
    let card = connect(context, reader)?;
    TagUid::new(transmit(&card, reader, &APDU_GET_UID)?)
}

fn write_block(context: &Context, reader: &str, block: &[u8]) -> Result<()> {
    let card = connect(context, reader)?;

    for (index, chunk) in block.chunks(PAGE_SIZE).enumerate() {
        let page = page_number(index)?;
        let mut apdu = vec![0xFF, 0xD6, 0x00, page, PAGE_SIZE as u8];
        apdu.extend_from_slice(chunk);
        apdu.resize(5 + PAGE_SIZE, 0x00);

        transmit(&card, reader, &apdu).map_err(|e| match e {
            HardwareError::CommunicationError { message } => {
                HardwareError::write(format!("page {}: {}", page, message))
            }
            other => other,
        })?;
    }

    debug!(reader, bytes = block.len(), "Tag written");
    Ok(())
}

fn read_block(context: &Context, reader: &str, capacity: usize) -> Result<Vec<u8>> {
    let card = connect(context, reader)?;
    let mut memory = Vec::new();

    // READ BINARY returns four pages per call.
    while memory.len() < capacity {
        let page = page_number(memory.len() / PAGE_SIZE)?;
        let apdu = [0xFF, 0xB0, 0x00, page, (PAGE_SIZE * 4) as u8];
        let data = transmit(&card, reader, &apdu).map_err(|e| match e {
            HardwareError::CommunicationError { message } => {
                HardwareError::read(format!("page {}: {}", page, message))
            }
            other => other,
        })?;
        memory.extend_from_slice(&data);

        if let Some(payload) = decode_tlv(&memory)? {
            return Ok(payload);
        }
    }

    Err(HardwareError::read("no payload block found in tag memory"))
}

fn page_number(index: usize) -> Result<u8> {
    u8::try_from(index + FIRST_USER_PAGE as usize)
        .map_err(|_| HardwareError::invalid_data("page index out of range"))
}

/// Wrap `payload` in a TLV block padded to whole pages.
fn encode_tlv(payload: &[u8]) -> Vec<u8> {
    let mut block = Vec::with_capacity(payload.len() + 6);
    block.push(TLV_NDEF);
    if payload.len() < 0xFF {
        block.push(payload.len() as u8);
    } else {
        block.push(0xFF);
        block.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    }
    block.extend_from_slice(payload);
    block.push(TLV_TERMINATOR);

    let padded = block.len().div_ceil(PAGE_SIZE) * PAGE_SIZE;
    block.resize(padded, 0x00);
    block
}

/// Extract the payload of the first TLV block.
///
/// Returns `Ok(None)` while `memory` is too short to hold the whole block.
fn decode_tlv(memory: &[u8]) -> Result<Option<Vec<u8>>> {
    let (length, header) = match memory {
        [TLV_NDEF, 0xFF, hi, lo, ..] => (u16::from_be_bytes([*hi, *lo]) as usize, 4),
        [TLV_NDEF, 0xFF, ..] => return Ok(None),
        [TLV_NDEF, len, ..] => (*len as usize, 2),
        [_, _, ..] => {
            return Err(HardwareError::invalid_data(format!(
                "unexpected TLV type 0x{:02X}",
                memory[0]
            )));
        }
        _ => return Ok(None),
    };

    if memory.len() < header + length {
        return Ok(None);
    }
    Ok(Some(memory[header..header + length].to_vec()))
}
