//! USB device configuration and validation
//!
//! A device is declared as a flat map of string options. Recognized keys:
//!
//! | key         | format                     | default |
//! |-------------|----------------------------|---------|
//! | `vendorid`  | four hex digits            | any     |
//! | `productid` | four hex digits            | any     |
//! | `uid`       | unsigned 32-bit decimal    | 0       |
//! | `gid`       | unsigned 32-bit decimal    | 0       |
//! | `mode`      | octal file mode            | 0660    |
//! | `required`  | boolean                    | false   |

use crate::error::{PassthroughError, Result};
use crate::instance::InstanceKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default file mode for passed-through device nodes
pub const DEFAULT_MODE: u32 = 0o660;

/// Highest mode accepted (permission bits plus setuid/setgid/sticky)
const MAX_MODE: u32 = 0o7777;

/// Key the device type itself is declared under; carried but not interpreted
const TYPE_KEY: &str = "type";

type Rule = fn(&str, &str) -> Result<()>;

const RULES: &[(&str, Rule)] = &[
    ("vendorid", validate_device_id),
    ("productid", validate_device_id),
    ("uid", validate_unix_id),
    ("gid", validate_unix_id),
    ("mode", validate_octal_mode),
    ("required", validate_bool),
];

/// Immutable option map for one USB passthrough device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceConfig(BTreeMap<String, String>);

impl DeviceConfig {
    pub fn new(options: BTreeMap<String, String>) -> Self {
        Self(options)
    }

    /// Raw option lookup
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Configured vendor filter, if any
    pub fn vendor_id(&self) -> Option<&str> {
        self.get("vendorid").filter(|v| !v.is_empty())
    }

    /// Configured product filter, if any
    pub fn product_id(&self) -> Option<&str> {
        self.get("productid").filter(|v| !v.is_empty())
    }

    /// Owner of the device node inside the instance
    pub fn uid(&self) -> u32 {
        self.get("uid").and_then(|v| v.parse().ok()).unwrap_or(0)
    }

    /// Group of the device node inside the instance
    pub fn gid(&self) -> u32 {
        self.get("gid").and_then(|v| v.parse().ok()).unwrap_or(0)
    }

    /// File mode of the device node inside the instance
    pub fn mode(&self) -> u32 {
        self.get("mode")
            .and_then(|v| u32::from_str_radix(v, 8).ok())
            .unwrap_or(DEFAULT_MODE)
    }

    /// Whether a missing device at start is fatal
    pub fn required(&self) -> bool {
        self.get("required").is_some_and(is_true)
    }

    /// Check the options against the instance kind and per-key rules
    ///
    /// Runs before any side effect; the handler is unusable until this passes.
    pub fn validate(&self, kind: InstanceKind) -> Result<()> {
        if !kind.supports_device_nodes() {
            return Err(PassthroughError::UnsupportedDeviceType { kind });
        }

        for (key, value) in self.iter() {
            if key == TYPE_KEY {
                continue;
            }

            let rule = RULES
                .iter()
                .find(|(name, _)| *name == key)
                .map(|(_, rule)| rule)
                .ok_or_else(|| PassthroughError::UnknownOption {
                    key: key.to_string(),
                })?;

            // An empty value means the option is unset
            if value.is_empty() {
                continue;
            }

            rule(key, value)?;
        }

        Ok(())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for DeviceConfig {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Whether a boolean option string means "true"
pub fn is_true(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

fn is_false(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "false" | "0" | "no" | "off"
    )
}

/// Validate a USB vendor or product ID (four hex digits)
fn validate_device_id(key: &str, value: &str) -> Result<()> {
    if value.len() != 4 || !value.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(PassthroughError::validation(
            key,
            value,
            "must be four hex characters",
        ));
    }
    Ok(())
}

/// Validate a unix user or group ID
fn validate_unix_id(key: &str, value: &str) -> Result<()> {
    if value.is_empty() || !value.chars().all(|c| c.is_ascii_digit()) {
        return Err(PassthroughError::validation(key, value, "must be a number"));
    }

    value
        .parse::<u32>()
        .map_err(|_| PassthroughError::validation(key, value, "out of range for an id"))?;

    Ok(())
}

/// Validate an octal file mode such as "0660"
fn validate_octal_mode(key: &str, value: &str) -> Result<()> {
    let mode = u32::from_str_radix(value, 8)
        .map_err(|_| PassthroughError::validation(key, value, "must be an octal file mode"))?;

    if mode > MAX_MODE {
        return Err(PassthroughError::validation(
            key,
            value,
            format!("must not exceed {:o}", MAX_MODE),
        ));
    }

    Ok(())
}

fn validate_bool(key: &str, value: &str) -> Result<()> {
    if is_true(value) || is_false(value) {
        Ok(())
    } else {
        Err(PassthroughError::validation(key, value, "must be a boolean"))
    }
}
