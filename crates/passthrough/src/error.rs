//! Passthrough error types

use thiserror::Error;

use crate::instance::InstanceKind;

/// Errors raised by the passthrough lifecycle
#[derive(Debug, Error)]
pub enum PassthroughError {
    /// A recognized config key carries a malformed value
    #[error("Invalid value for '{key}': '{value}' ({reason})")]
    Validation {
        key: String,
        value: String,
        reason: String,
    },

    /// The config carries a key this device type does not understand
    #[error("Invalid device option: {key}")]
    UnknownOption { key: String },

    /// USB passthrough needs device nodes, which only containers get
    #[error("Unsupported device type for {kind} instances")]
    UnsupportedDeviceType { kind: InstanceKind },

    /// `required` was set and nothing on the host matched
    #[error("Required USB device not found for device '{device}'")]
    RequiredDeviceNotFound { device: String },

    /// A device attribute could not be parsed
    #[error("Invalid device value in {entry}: {reason}")]
    DescriptorFormat { entry: String, reason: String },

    /// The device-node manager failed to set a device up
    #[error("Failed to setup device '{device}': {source}")]
    Setup {
        device: String,
        #[source]
        source: std::io::Error,
    },

    /// The device-node manager failed to remove a device path
    #[error("Failed to remove device '{device}': {source}")]
    Teardown {
        device: String,
        #[source]
        source: std::io::Error,
    },

    /// Host-side files could not be deleted after unmount
    #[error("Failed to delete files for device '{device}': {source}")]
    Cleanup {
        device: String,
        #[source]
        source: std::io::Error,
    },

    /// I/O error while reading the host metadata tree
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PassthroughError {
    pub(crate) fn validation(key: &str, value: &str, reason: impl Into<String>) -> Self {
        Self::Validation {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Type alias for passthrough results
pub type Result<T> = std::result::Result<T, PassthroughError>;
