//! Enum wrapper for reader driver dispatch.
//!
//! Native `async fn` in traits (RPITIT, Edition 2024) is not object-safe, so
//! the hub cannot hold a `Box<dyn ReaderDriver>`. [`AnyReaderDriver`] gives it
//! a concrete type instead; real hardware variants only exist when their
//! feature flag is enabled.
//!
//! # Examples
//!
//! ```
//! use tagwriter_hardware::devices::AnyReaderDriver;
//! use tagwriter_hardware::mock::MockReaderDriver;
//!
//! let (driver, _handle) = MockReaderDriver::new();
//! let any_driver = AnyReaderDriver::Mock(driver);
//! assert_eq!(any_driver.kind(), "mock");
//! ```

use crate::Result;
use crate::mock::MockReaderDriver;
#[cfg(feature = "hardware-pcsc")]
use crate::pcsc::PcscReaderDriver;
use crate::traits::ReaderDriver;
use crate::types::DriverEvent;
use tokio::sync::mpsc;

/// Enum wrapper for reader driver dispatch.
#[derive(Debug)]
#[non_exhaustive]
pub enum AnyReaderDriver {
    /// Simulated driver for development and testing.
    Mock(MockReaderDriver),

    /// PC/SC readers (ACR122U and compatible).
    #[cfg(feature = "hardware-pcsc")]
    PcSc(PcscReaderDriver),
}

impl AnyReaderDriver {
    /// Short identifier of the active variant, used in logs and status output.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Mock(_) => "mock",
            #[cfg(feature = "hardware-pcsc")]
            Self::PcSc(_) => "pcsc",
        }
    }
}

impl From<MockReaderDriver> for AnyReaderDriver {
    fn from(driver: MockReaderDriver) -> Self {
        Self::Mock(driver)
    }
}

#[cfg(feature = "hardware-pcsc")]
impl From<PcscReaderDriver> for AnyReaderDriver {
    fn from(driver: PcscReaderDriver) -> Self {
        Self::PcSc(driver)
    }
}

impl ReaderDriver for AnyReaderDriver {
    fn listen(&mut self) -> Result<mpsc::Receiver<DriverEvent>> {
        match self {
            Self::Mock(driver) => driver.listen(),
            #[cfg(feature = "hardware-pcsc")]
            Self::PcSc(driver) => driver.listen(),
        }
    }

    async fn write_payload(&mut self, reader: &str, payload: &[u8]) -> Result<()> {
        match self {
            Self::Mock(driver) => driver.write_payload(reader, payload).await,
            #[cfg(feature = "hardware-pcsc")]
            Self::PcSc(driver) => driver.write_payload(reader, payload).await,
        }
    }

    async fn read_payload(&mut self, reader: &str) -> Result<Vec<u8>> {
        match self {
            Self::Mock(driver) => driver.read_payload(reader).await,
            #[cfg(feature = "hardware-pcsc")]
            Self::PcSc(driver) => driver.read_payload(reader).await,
        }
    }

    fn name(&self) -> &str {
        match self {
            Self::Mock(driver) => driver.name(),
            #[cfg(feature = "hardware-pcsc")]
            Self::PcSc(driver) => driver.name(),
        }
    }
}
