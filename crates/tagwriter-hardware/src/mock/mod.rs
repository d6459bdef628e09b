//! Mock driver implementation for testing and development.
//!
//! This module provides a simulated reader driver that can be controlled
//! programmatically without requiring physical hardware.

pub mod reader;

pub use reader::{MockDriverHandle, MockReaderDriver};
