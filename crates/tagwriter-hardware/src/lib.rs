//! Reader hardware layer for the tagwriter NFC write service.
//!
//! This crate wraps the platform NFC driver behind the [`ReaderDriver`] trait
//! and exposes it through the [`HardwareHub`], an explicitly constructed
//! service that multiplexes driver events into a typed broadcast stream and
//! keeps the set of attached readers.
//!
//! # Design Philosophy
//!
//! - **Async-first**: driver commands use native `async fn` in traits
//!   (Rust 1.90 + Edition 2024 RPITIT).
//! - **Enum dispatch**: [`AnyReaderDriver`] stands in for `Box<dyn ReaderDriver>`,
//!   which RPITIT traits cannot provide.
//! - **Errors are events**: driver failures reach subscribers as
//!   `driver-error` events; only explicit card commands return errors.
//! - **Testable without hardware**: [`mock::MockReaderDriver`] simulates
//!   readers, tags and faults.
//!
//! # Drivers
//!
//! | Driver | Feature | Notes |
//! |--------|---------|-------|
//! | [`mock::MockReaderDriver`] | always | controlled through a [`mock::MockDriverHandle`] |
//! | `pcsc::PcscReaderDriver` | `hardware-pcsc` | ACR122U and other PC/SC readers, NTAG21x tags |
//!
//! # Examples
//!
//! ```
//! use tagwriter_hardware::{HardwareHub, HubConfig, HubEvent};
//! use tagwriter_hardware::mock::MockReaderDriver;
//!
//! #[tokio::main]
//! async fn main() -> tagwriter_hardware::Result<()> {
//!     let (driver, handle) = MockReaderDriver::new();
//!     let hub = HardwareHub::new(driver.into(), HubConfig::default());
//!     let mut events = hub.subscribe();
//!     hub.initialize().await.unwrap();
//!
//!     handle.attach_reader("Reader 1").await?;
//!     handle.present_tag("Reader 1", vec![0x04, 0xAA, 0xBB, 0xCC]).await?;
//!
//!     assert!(matches!(events.recv().await, Ok(HubEvent::ReaderAttached { .. })));
//!     assert!(matches!(events.recv().await, Ok(HubEvent::CardPresent { .. })));
//!
//!     hub.write_payload("Reader 1", b"https://vet.example/pet/1").await?;
//!     Ok(())
//! }
//! ```
//!
//! [`ReaderDriver`]: traits::ReaderDriver

pub mod devices;
pub mod error;
pub mod hub;
pub mod mock;
#[cfg(feature = "hardware-pcsc")]
pub mod pcsc;
pub mod traits;
pub mod types;

// Re-export commonly used types for convenience
pub use devices::AnyReaderDriver;
pub use error::{HardwareError, Result};
pub use hub::{HardwareHub, HubConfig, HubEvent};
pub use traits::ReaderDriver;
pub use types::{DriverEvent, MAX_UID_LENGTH, MIN_UID_LENGTH, Reader, ReaderState, TagUid};
