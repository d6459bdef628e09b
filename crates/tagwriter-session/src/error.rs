//! Write session failures.
//!
//! Every failure ends the session in the `failed` stage and is reported in
//! the [`WriteResult`](crate::WriteResult); none of them is raised to the
//! caller as an `Err`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a write session did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WriteError {
    /// The hardware hub was never initialized.
    #[error("No NFC reader available")]
    NoReaderAvailable,

    /// Another session holds the writer lock.
    #[error("A write session is already in progress")]
    SessionBusy,

    /// No tag was presented before the deadline.
    #[error("Timed out after {timeout_ms}ms waiting for a tag")]
    WriteTimeout { timeout_ms: u64 },

    /// The driver rejected the write or the read-back.
    #[error("Tag write failed: {message}")]
    DriverWriteFailed { message: String },

    /// The tag holds different bytes than were written.
    #[error("Verification failed: wrote {written} bytes, read back {read} bytes that differ")]
    VerifyMismatch { written: usize, read: usize },

    /// The session was cancelled.
    #[error("Write cancelled")]
    Cancelled,
}

impl WriteError {
    /// Create a new driver failure.
    pub fn driver(message: impl Into<String>) -> Self {
        Self::DriverWriteFailed {
            message: message.into(),
        }
    }

    /// Machine-readable kind of the failure.
    pub fn kind(&self) -> WriteErrorKind {
        match self {
            Self::NoReaderAvailable => WriteErrorKind::NoReaderAvailable,
            Self::SessionBusy => WriteErrorKind::SessionBusy,
            Self::WriteTimeout { .. } => WriteErrorKind::WriteTimeout,
            Self::DriverWriteFailed { .. } => WriteErrorKind::DriverWriteFailed,
            Self::VerifyMismatch { .. } => WriteErrorKind::VerifyMismatch,
            Self::Cancelled => WriteErrorKind::Cancelled,
        }
    }
}

/// Wire form of a [`WriteError`], carried in results and HTTP responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteErrorKind {
    NoReaderAvailable,
    SessionBusy,
    WriteTimeout,
    DriverWriteFailed,
    VerifyMismatch,
    Cancelled,
}

impl WriteErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoReaderAvailable => "no_reader_available",
            Self::SessionBusy => "session_busy",
            Self::WriteTimeout => "write_timeout",
            Self::DriverWriteFailed => "driver_write_failed",
            Self::VerifyMismatch => "verify_mismatch",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for WriteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
