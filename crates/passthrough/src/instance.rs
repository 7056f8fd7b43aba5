//! Instance the device is attached to

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Kind of instance a device belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceKind {
    /// Shares the host kernel; device nodes can be passed through
    Container,
    /// Full virtual machine; has no host device nodes
    VirtualMachine,
}

impl InstanceKind {
    /// Whether host character devices can be mapped into this kind
    pub fn supports_device_nodes(self) -> bool {
        matches!(self, Self::Container)
    }
}

impl fmt::Display for InstanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Container => write!(f, "container"),
            Self::VirtualMachine => write!(f, "virtual-machine"),
        }
    }
}

/// The instance-level facts the passthrough device needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    name: String,
    kind: InstanceKind,
    devices_path: PathBuf,
}

impl Instance {
    pub fn new(name: impl Into<String>, kind: InstanceKind, devices_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            kind,
            devices_path: devices_path.into(),
        }
    }

    /// Stable name, used as the hotplug subscription key
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> InstanceKind {
        self.kind
    }

    /// Host directory holding generated device files for this instance
    pub fn devices_path(&self) -> &Path {
        &self.devices_path
    }
}
