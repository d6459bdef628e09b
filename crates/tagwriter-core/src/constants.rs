//! Core constants for the tag write orchestration subsystem.
//!
//! This module centralizes the timing, sizing and channel-capacity defaults
//! shared by the hardware hub, the write coordinator, the command queue and
//! the realtime fan-out. Every component accepts overrides through its own
//! config struct; these values are only the defaults.
//!
//! # Usage
//!
//! ```
//! use tagwriter_core::constants::*;
//! use std::time::Duration;
//!
//! let timeout = Duration::from_millis(DEFAULT_WRITE_TIMEOUT_MS);
//! assert_eq!(timeout.as_secs(), 60);
//! ```

// ============================================================================
// Write Session Timing
// ============================================================================

/// Default time a write session waits for a tag to be presented (milliseconds).
///
/// The timeout covers the wait-for-tap phase only. Once a tag has been bound,
/// the driver write and the verification read run to completion.
///
/// # Value: 60000ms (60 seconds)
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 60_000;

/// Minimum accepted write timeout (milliseconds).
///
/// # Value: 1000ms
pub const MIN_WRITE_TIMEOUT_MS: u64 = 1_000;

/// Maximum accepted write timeout (milliseconds).
///
/// # Value: 300000ms (5 minutes)
pub const MAX_WRITE_TIMEOUT_MS: u64 = 300_000;

// ============================================================================
// Remote Agent
// ============================================================================

/// Interval between two claim attempts of the polling agent (milliseconds).
///
/// # Value: 3000ms
pub const DEFAULT_AGENT_POLL_INTERVAL_MS: u64 = 3_000;

/// Attempts the agent makes to report one result before keeping it for
/// the next poll.
///
/// # Value: 5
pub const DEFAULT_REPORT_ATTEMPTS: u32 = 5;

/// First delay between two report attempts; doubled after every failure
/// (milliseconds).
///
/// # Value: 500ms
pub const DEFAULT_REPORT_BACKOFF_MS: u64 = 500;

/// Upper bound of the report retry delay (milliseconds).
///
/// # Value: 8000ms
pub const MAX_REPORT_BACKOFF_MS: u64 = 8_000;

/// Age after which a command nobody claimed is failed (seconds).
///
/// # Value: 900s (15 minutes)
pub const DEFAULT_PENDING_TTL_SECS: u64 = 900;

/// Interval of the server-side expiry sweep (seconds).
///
/// # Value: 30s
pub const DEFAULT_EXPIRY_SWEEP_SECS: u64 = 30;

/// Header carrying the agent's pre-shared secret.
pub const AGENT_SECRET_HEADER: &str = "x-agent-secret";

// ============================================================================
// Payload Constraints
// ============================================================================

/// Maximum payload length in bytes.
///
/// Sized for the user memory of an NTAG215 minus NDEF framing overhead.
///
/// # Value: 480 bytes
pub const MAX_PAYLOAD_LENGTH: usize = 480;

/// Maximum subject reference length (characters).
pub const MAX_SUBJECT_REF_LENGTH: usize = 128;

// ============================================================================
// Channel Capacities
// ============================================================================

/// Capacity of the driver → hub event channel.
pub const DRIVER_EVENT_CAPACITY: usize = 64;

/// Capacity of the hub's broadcast channel.
pub const HUB_EVENT_CAPACITY: usize = 256;

/// Capacity of the coordinator's stage broadcast channel.
pub const SESSION_EVENT_CAPACITY: usize = 64;

/// Capacity of the realtime fan-out broadcast channel.
///
/// A client lagging behind by more than this many messages loses the
/// oldest ones; nothing is re-sent.
pub const FANOUT_CAPACITY: usize = 256;

// ============================================================================
// Network Defaults
// ============================================================================

/// Default HTTP bind address of the backend.
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

/// Default base URL the agent polls.
pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8080";
