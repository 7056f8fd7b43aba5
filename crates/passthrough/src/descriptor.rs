//! USB device descriptors
//!
//! A [`DeviceDescriptor`] is a snapshot of one physical device. Descriptors come
//! from two places: a static scan of the host device metadata root
//! (`/sys/bus/usb/devices` on Linux) at start, and raw kernel uevents delivered
//! by the hotplug bus while the instance runs.

use crate::error::{PassthroughError, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default host device metadata root
pub const DEFAULT_USB_DEV_PATH: &str = "/sys/bus/usb/devices";

/// Attribute files every device entry must carry
const ATTR_VENDOR: &str = "idVendor";
const ATTR_PRODUCT: &str = "idProduct";
const ATTR_DEV: &str = "dev";
const ATTR_BUSNUM: &str = "busnum";
const ATTR_DEVNUM: &str = "devnum";
const ATTR_DEVNAME: &str = "devname";

/// Hotplug action carried by a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UsbAction {
    Add,
    Remove,
}

impl UsbAction {
    fn parse(action: &str) -> Option<Self> {
        match action {
            "add" => Some(Self::Add),
            "remove" => Some(Self::Remove),
            _ => None,
        }
    }
}

impl fmt::Display for UsbAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => write!(f, "add"),
            Self::Remove => write!(f, "remove"),
        }
    }
}

/// One physical USB device at a point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceDescriptor {
    pub action: UsbAction,
    /// Lower-case four digit hex vendor ID
    pub vendor_id: String,
    /// Lower-case four digit hex product ID
    pub product_id: String,
    pub major: u32,
    pub minor: u32,
    pub bus_number: u32,
    pub device_number: u32,
    /// Host special file, e.g. `/dev/bus/usb/001/004`
    pub path: PathBuf,
    /// Raw `KEY=value` uevent lines (empty for enumerated devices)
    pub uevent: Vec<String>,
    /// Kernel sequence number (0 for enumerated devices)
    pub seqnum: u64,
}

/// Unparsed device fields, as read from sysfs or a uevent
struct RawDevice<'a> {
    vendor_id: &'a str,
    product_id: &'a str,
    major: &'a str,
    minor: &'a str,
    busnum: &'a str,
    devnum: &'a str,
    devname: Option<&'a str>,
}

impl DeviceDescriptor {
    fn build(
        entry: &str,
        action: UsbAction,
        raw: RawDevice<'_>,
        uevent: Vec<String>,
        seqnum: u64,
    ) -> Result<Self> {
        let bus_number = parse_number(entry, "bus number", raw.busnum)?;
        let device_number = parse_number(entry, "device number", raw.devnum)?;

        let path = match raw.devname.filter(|n| !n.is_empty()) {
            Some(devname) => Path::new("/dev").join(devname.trim_start_matches('/')),
            None => PathBuf::from(format!(
                "/dev/bus/usb/{:03}/{:03}",
                bus_number, device_number
            )),
        };

        Ok(Self {
            action,
            vendor_id: raw.vendor_id.to_ascii_lowercase(),
            product_id: raw.product_id.to_ascii_lowercase(),
            major: parse_number(entry, "major", raw.major)?,
            minor: parse_number(entry, "minor", raw.minor)?,
            bus_number,
            device_number,
            path,
            uevent,
            seqnum,
        })
    }

    /// Device numbers in `major:minor` form, as in the sysfs `dev` attribute
    pub fn dev(&self) -> String {
        format!("{}:{}", self.major, self.minor)
    }

    /// Device path relative to the filesystem root, as mapped inside the instance
    pub fn relative_path(&self) -> PathBuf {
        self.path
            .strip_prefix("/")
            .unwrap_or(self.path.as_path())
            .to_path_buf()
    }

    /// Parse a raw kernel uevent
    ///
    /// Returns `Ok(None)` for events that are not about a whole USB device
    /// (interfaces, other subsystems) or carry an action other than add/remove.
    pub fn from_uevent<S: AsRef<str>>(lines: &[S]) -> Result<Option<Self>> {
        let props: HashMap<&str, &str> = lines
            .iter()
            .filter_map(|line| line.as_ref().split_once('='))
            .collect();

        if props.get("SUBSYSTEM") != Some(&"usb") || props.get("DEVTYPE") != Some(&"usb_device")
        {
            return Ok(None);
        }

        let Some(action) = props.get("ACTION").and_then(|a| UsbAction::parse(a)) else {
            return Ok(None);
        };

        let entry = props.get("DEVPATH").copied().unwrap_or("uevent");
        let require = |key: &str| {
            props
                .get(key)
                .copied()
                .ok_or_else(|| PassthroughError::DescriptorFormat {
                    entry: entry.to_string(),
                    reason: format!("missing {}", key),
                })
        };

        // PRODUCT=vendor/product/bcdDevice, without leading zeros
        let product = require("PRODUCT")?;
        let ids: Vec<&str> = product.split('/').collect();
        if ids.len() < 2 || ids[0].is_empty() || ids[1].is_empty() {
            return Err(PassthroughError::DescriptorFormat {
                entry: entry.to_string(),
                reason: format!("invalid product value {}", product),
            });
        }
        let vendor_id = format!("{:0>4}", ids[0]);
        let product_id = format!("{:0>4}", ids[1]);

        let seqnum = match props.get("SEQNUM") {
            Some(seq) => parse_number(entry, "sequence number", seq)?,
            None => 0,
        };

        let raw = RawDevice {
            vendor_id: &vendor_id,
            product_id: &product_id,
            major: require("MAJOR")?,
            minor: require("MINOR")?,
            busnum: require("BUSNUM")?,
            devnum: require("DEVNUM")?,
            devname: props.get("DEVNAME").copied(),
        };

        let uevent = lines.iter().map(|l| l.as_ref().to_string()).collect();
        Self::build(entry, action, raw, uevent, seqnum).map(Some)
    }
}

fn parse_number<T: std::str::FromStr>(entry: &str, what: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| PassthroughError::DescriptorFormat {
            entry: entry.to_string(),
            reason: format!("invalid {} {}", what, value),
        })
}

fn is_not_found(err: &PassthroughError) -> bool {
    matches!(err, PassthroughError::Io(e) if e.kind() == io::ErrorKind::NotFound)
}

/// Scan the host metadata root for USB devices
///
/// A missing root means no USB devices. Entries that vanish mid-read, or lack
/// a device attribute (interfaces, for instance), are skipped. A malformed
/// `dev` attribute aborts the whole scan.
pub fn enumerate(root: &Path) -> Result<Vec<DeviceDescriptor>> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("USB metadata root {} does not exist", root.display());
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };

    let mut names = Vec::new();
    for entry in entries {
        names.push(entry?.file_name());
    }
    names.sort();

    let mut devices = Vec::new();
    for name in names {
        let path = root.join(&name);
        match load_sysfs_entry(&path) {
            Ok(device) => devices.push(device),
            Err(e) if is_not_found(&e) => {
                debug!("Skipping {}: {}", path.display(), e);
            }
            Err(e) => return Err(e),
        }
    }

    debug!("Enumerated {} USB devices under {}", devices.len(), root.display());
    Ok(devices)
}

/// Read one device entry's attribute files
pub fn load_sysfs_entry(path: &Path) -> Result<DeviceDescriptor> {
    let vendor_id = read_attr(path, ATTR_VENDOR)?;
    let product_id = read_attr(path, ATTR_PRODUCT)?;
    let dev = read_attr(path, ATTR_DEV)?;
    let busnum = read_attr(path, ATTR_BUSNUM)?;
    let devnum = read_attr(path, ATTR_DEVNUM)?;
    let devname = match read_attr(path, ATTR_DEVNAME) {
        Ok(name) => Some(name),
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => return Err(e.into()),
    };

    let entry = path.display().to_string();
    let parts: Vec<&str> = dev.split(':').collect();
    if parts.len() != 2 {
        return Err(PassthroughError::DescriptorFormat {
            entry,
            reason: format!("invalid device value {}", dev),
        });
    }

    let raw = RawDevice {
        vendor_id: &vendor_id,
        product_id: &product_id,
        major: parts[0],
        minor: parts[1],
        busnum: &busnum,
        devnum: &devnum,
        devname: devname.as_deref(),
    };

    DeviceDescriptor::build(&entry, UsbAction::Add, raw, Vec::new(), 0)
}

fn read_attr(dir: &Path, name: &str) -> io::Result<String> {
    fs::read_to_string(dir.join(name)).map(|v| v.trim().to_string())
}
