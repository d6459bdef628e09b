//! Write session protocol for the tagwriter NFC service.
//!
//! This crate contains the single-writer session state and the coordinator
//! that drives it: request → wait for tap → write → verify → result.

pub mod coordinator;
pub mod error;
pub mod session;

pub use coordinator::{CoordinatorConfig, WriteCoordinator, WriteResult};
pub use error::{WriteError, WriteErrorKind};
pub use session::{SessionEvent, StageTransition, WriteSession};
