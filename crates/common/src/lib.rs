//! Common utilities for usb-passthrough
//!
//! Shared error handling and logging setup for the passthrough crate and its
//! binary, plus helpers that build fake sysfs trees and uevents for tests.

pub mod error;
pub mod logging;
pub mod test_utils;

pub use error::{Error, Result};
pub use logging::setup_logging;
