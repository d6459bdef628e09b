//! Reader driver trait definition.
//!
//! This is the only seam where hardware-specific code lives. Everything above
//! it (the hub, the write coordinator, the agent) is exercised in tests
//! against [`MockReaderDriver`](crate::mock::MockReaderDriver), which
//! synthesizes the same events a PC/SC reader would.
//!
//! The trait uses native `async fn` methods (Rust 1.90 + Edition 2024 RPITIT),
//! eliminating the need for the `async_trait` macro.

#![allow(async_fn_in_trait)]

use crate::error::Result;
use crate::types::DriverEvent;
use tokio::sync::mpsc;

/// NFC reader driver abstraction.
///
/// A driver has two halves:
///
/// - an event half, handed out once by [`listen`](ReaderDriver::listen),
///   which delivers attach/detach, tag present/removed and error events;
/// - a command half, [`write_payload`](ReaderDriver::write_payload) and
///   [`read_payload`](ReaderDriver::read_payload), which the hub serializes
///   because drivers are not guaranteed to be re-entrant.
///
/// # Object Safety and Dynamic Dispatch
///
/// **NOTE**: This trait is NOT object-safe because `async fn` methods return
/// `impl Future`, which is an opaque type that cannot be used in trait objects
/// (Edition 2024 RPITIT). You cannot use `Box<dyn ReaderDriver>`.
///
/// For dynamic dispatch, use [`AnyReaderDriver`](crate::devices::AnyReaderDriver).
///
/// # Examples
///
/// ```no_run
/// use tagwriter_hardware::traits::ReaderDriver;
/// use tagwriter_hardware::error::Result;
///
/// async fn write_and_check<D: ReaderDriver>(driver: &mut D, reader: &str) -> Result<bool> {
///     driver.write_payload(reader, b"https://vet.example/pet/7").await?;
///     let stored = driver.read_payload(reader).await?;
///     Ok(stored == b"https://vet.example/pet/7")
/// }
/// ```
pub trait ReaderDriver: Send + Sync {
    /// Start listening for driver events.
    ///
    /// Returns the receiving end of the event channel. A driver hands out its
    /// receiver once; a second call fails with
    /// [`HardwareError::InitializationFailed`](crate::HardwareError::InitializationFailed).
    fn listen(&mut self) -> Result<mpsc::Receiver<DriverEvent>>;

    /// Write `payload` to the tag currently in `reader`'s field.
    ///
    /// Resolves once the driver acknowledged the write. Fails if the reader
    /// is gone, the field is empty, or the tag rejects the write.
    async fn write_payload(&mut self, reader: &str, payload: &[u8]) -> Result<()>;

    /// Read back the payload stored on the tag in `reader`'s field.
    async fn read_payload(&mut self, reader: &str) -> Result<Vec<u8>>;

    /// Human-readable driver name for logs.
    fn name(&self) -> &str;
}
