//! Error types for reader driver operations.
//!
//! These errors never escape the hardware hub as panics: the hub turns them
//! into `driver-error` events, and the write coordinator turns them into a
//! failed session result.

/// Result type alias for hardware operations.
pub type Result<T> = std::result::Result<T, HardwareError>;

/// Errors that can occur during reader driver operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HardwareError {
    /// Reader is not attached or has been detached.
    #[error("Reader disconnected: {reader}")]
    Disconnected { reader: String },

    /// No tag is in the reader's field.
    #[error("No tag present on reader {reader}")]
    NoTag { reader: String },

    /// Operation timed out after specified duration.
    #[error("Operation timeout after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Driver communication error (transport, APDU status, PC/SC service).
    #[error("Communication error: {message}")]
    CommunicationError { message: String },

    /// Invalid data received from the tag or the driver.
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Driver initialization failed.
    #[error("Initialization failed: {message}")]
    InitializationFailed { message: String },

    /// Tag rejected a write.
    #[error("Tag write error: {message}")]
    WriteError { message: String },

    /// Tag read error.
    #[error("Tag read error: {message}")]
    ReadError { message: String },

    /// Payload does not fit in the tag's user memory.
    #[error("Payload of {size} bytes exceeds tag capacity of {capacity} bytes")]
    CapacityExceeded { size: usize, capacity: usize },
}

impl HardwareError {
    /// Create a new disconnected error.
    pub fn disconnected(reader: impl Into<String>) -> Self {
        Self::Disconnected {
            reader: reader.into(),
        }
    }

    /// Create a new no-tag error.
    pub fn no_tag(reader: impl Into<String>) -> Self {
        Self::NoTag {
            reader: reader.into(),
        }
    }

    /// Create a new timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Create a new communication error.
    pub fn communication(message: impl Into<String>) -> Self {
        Self::CommunicationError {
            message: message.into(),
        }
    }

    /// Create a new invalid data error.
    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    /// Create a new initialization failed error.
    pub fn initialization_failed(message: impl Into<String>) -> Self {
        Self::InitializationFailed {
            message: message.into(),
        }
    }

    /// Create a new tag write error.
    pub fn write(message: impl Into<String>) -> Self {
        Self::WriteError {
            message: message.into(),
        }
    }

    /// Create a new tag read error.
    pub fn read(message: impl Into<String>) -> Self {
        Self::ReadError {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnected_error() {
        let error = HardwareError::disconnected("ACR122U");
        assert!(matches!(error, HardwareError::Disconnected { .. }));
        assert_eq!(error.to_string(), "Reader disconnected: ACR122U");
    }

    #[test]
    fn test_no_tag_error() {
        let error = HardwareError::no_tag("ACR122U 00");
        assert_eq!(error.to_string(), "No tag present on reader ACR122U 00");
    }

    #[test]
    fn test_timeout_error() {
        let error = HardwareError::timeout(3000);
        assert_eq!(error.to_string(), "Operation timeout after 3000ms");
    }

    #[test]
    fn test_capacity_error() {
        let error = HardwareError::CapacityExceeded {
            size: 900,
            capacity: 496,
        };
        assert_eq!(
            error.to_string(),
            "Payload of 900 bytes exceeds tag capacity of 496 bytes"
        );
    }
}
