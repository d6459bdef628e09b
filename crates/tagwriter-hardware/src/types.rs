//! Common types shared by driver implementations and the hub.
//!
//! This module defines the tag identifier, the reader snapshot exposed by
//! the hub, and the raw events a driver emits.

use crate::{HardwareError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Minimum UID length in bytes (per ISO 14443 specification).
pub const MIN_UID_LENGTH: usize = 4;

/// Maximum UID length in bytes (per ISO 14443 specification).
pub const MAX_UID_LENGTH: usize = 10;

/// Tag unique identifier (4-10 bytes).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TagUid(Vec<u8>);

impl TagUid {
    /// Create a validated UID.
    ///
    /// # Errors
    ///
    /// Returns an error if the UID length is not within the valid range
    /// of 4-10 bytes as specified by ISO 14443.
    ///
    /// # Examples
    ///
    /// ```
    /// use tagwriter_hardware::TagUid;
    ///
    /// let uid = TagUid::new(vec![0x04, 0xAB, 0xCD, 0xEF]).unwrap();
    /// assert_eq!(uid.to_hex(), "04ABCDEF");
    ///
    /// assert!(TagUid::new(vec![0x01]).is_err());
    /// ```
    pub fn new(uid: Vec<u8>) -> Result<Self> {
        let len = uid.len();
        if !(MIN_UID_LENGTH..=MAX_UID_LENGTH).contains(&len) {
            return Err(HardwareError::invalid_data(format!(
                "Tag UID length must be between {} and {} bytes, got {}",
                MIN_UID_LENGTH, MAX_UID_LENGTH, len
            )));
        }
        Ok(Self(uid))
    }

    /// Raw UID bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Get the UID as an uppercase hexadecimal string.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02X}", b)).collect()
    }
}

impl fmt::Display for TagUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Connection state of an attached reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum ReaderState {
    /// Reader attached, field empty.
    Connected,

    /// A tag is in the reader's field.
    TagPresent {
        /// Hex UID of the tag.
        uid: String,
    },
}

/// Snapshot of one attached reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reader {
    /// Driver-assigned reader name (e.g., "ACS ACR122U PICC Interface 00 00").
    pub name: String,

    /// Current connection state.
    #[serde(flatten)]
    pub state: ReaderState,
}

impl Reader {
    /// A freshly attached reader with an empty field.
    pub fn attached(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: ReaderState::Connected,
        }
    }

    /// Returns `true` if a tag is in the field.
    pub fn has_tag(&self) -> bool {
        matches!(self.state, ReaderState::TagPresent { .. })
    }
}

/// Raw event produced by a reader driver.
///
/// Drivers must emit `ReaderAttached` before any tag event of that reader,
/// and `ReaderDetached` after all of them.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DriverEvent {
    /// A reader was plugged in.
    ReaderAttached { name: String },

    /// A reader was unplugged.
    ReaderDetached { name: String },

    /// A tag entered a reader's field.
    CardPresent { reader: String, uid: TagUid },

    /// A tag left a reader's field.
    CardRemoved { reader: String, uid: TagUid },

    /// The driver reported an error, optionally scoped to one reader.
    Error {
        reader: Option<String>,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uid_hex() {
        let uid = TagUid::new(vec![0x04, 0x1A, 0x2B, 0x3C, 0x4D, 0x5E, 0x80]).unwrap();
        assert_eq!(uid.to_hex(), "041A2B3C4D5E80");
        assert_eq!(uid.to_string(), "041A2B3C4D5E80");
    }

    #[test]
    fn test_uid_invalid_length() {
        assert!(TagUid::new(vec![]).is_err());
        assert!(TagUid::new(vec![0x01, 0x02, 0x03]).is_err());
        assert!(TagUid::new(vec![0u8; 11]).is_err());
        assert!(TagUid::new(vec![0u8; 10]).is_ok());
    }

    #[test]
    fn test_reader_serialization() {
        let reader = Reader {
            name: "ACR122U".to_string(),
            state: ReaderState::TagPresent {
                uid: "04ABCDEF".to_string(),
            },
        };
        let json = serde_json::to_value(&reader).unwrap();
        assert_eq!(json["name"], "ACR122U");
        assert_eq!(json["state"], "tag-present");
        assert_eq!(json["uid"], "04ABCDEF");

        let back: Reader = serde_json::from_value(json).unwrap();
        assert_eq!(back, reader);
    }

    #[test]
    fn test_reader_attached() {
        let reader = Reader::attached("Reader 1");
        assert_eq!(reader.state, ReaderState::Connected);
        assert!(!reader.has_tag());
    }
}
