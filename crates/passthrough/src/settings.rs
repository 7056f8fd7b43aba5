//! Host settings management
//!
//! # Example Configuration
//! ```toml
//! log_level = "info"
//! usb_dev_path = "/sys/bus/usb/devices"
//! devices_path = "/var/lib/usb-passthrough/devices"
//!
//! [devices.keyboard]
//! vendorid = "046d"
//! productid = "c52b"
//! mode = "0660"
//! required = "true"
//! ```

use crate::config::DeviceConfig;
use crate::descriptor::DEFAULT_USB_DEV_PATH;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "Settings::default_log_level")]
    pub log_level: String,
    /// Host device metadata root
    #[serde(default = "Settings::default_usb_dev_path")]
    pub usb_dev_path: PathBuf,
    /// Parent of the per-instance generated device directories
    #[serde(default = "Settings::default_devices_path")]
    pub devices_path: PathBuf,
    /// Declared passthrough devices by name
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            usb_dev_path: Self::default_usb_dev_path(),
            devices_path: Self::default_devices_path(),
            devices: BTreeMap::new(),
        }
    }
}

impl Settings {
    fn default_log_level() -> String {
        "info".to_string()
    }

    fn default_usb_dev_path() -> PathBuf {
        PathBuf::from(DEFAULT_USB_DEV_PATH)
    }

    fn default_devices_path() -> PathBuf {
        PathBuf::from("/var/lib/usb-passthrough/devices")
    }

    /// Load settings from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let settings_path = if let Some(p) = path {
            expand(&p)
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usb-passthrough/settings.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No settings file found, using defaults"))?
        };

        let content = fs::read_to_string(&settings_path)
            .with_context(|| format!("Failed to read settings file: {}", settings_path.display()))?;

        let mut settings = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse settings file: {}", settings_path.display()))?;
        settings.expand_paths();

        tracing::info!("Loaded settings from: {}", settings_path.display());
        Ok(settings)
    }

    /// Load settings or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!("Failed to load settings: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Parse and validate settings from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Get the default settings file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-passthrough").join("settings.toml")
        } else {
            PathBuf::from(".config/usb-passthrough/settings.toml")
        }
    }

    /// Generated device directory for one instance
    pub fn instance_devices_path(&self, instance: &str) -> PathBuf {
        self.devices_path.join(instance)
    }

    /// Look up a declared device
    pub fn device(&self, name: &str) -> Result<&DeviceConfig> {
        self.devices
            .get(name)
            .ok_or_else(|| anyhow!("Device '{}' is not declared in settings", name))
    }

    fn expand_paths(&mut self) {
        self.usb_dev_path = expand(&self.usb_dev_path);
        self.devices_path = expand(&self.devices_path);
    }

    /// Validate settings values
    fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            ));
        }

        for name in self.devices.keys() {
            if name.is_empty() || name.contains('/') {
                return Err(anyhow!("Invalid device name '{}'", name));
            }
        }

        Ok(())
    }
}

fn expand(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref())
}
