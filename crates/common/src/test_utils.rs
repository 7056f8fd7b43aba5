//! Test utilities for usb-passthrough
//!
//! Builds fake host device metadata trees (the layout of `/sys/bus/usb/devices`)
//! and raw kernel uevents so enumeration and hotplug handling can be exercised
//! without real hardware.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{create_mock_usb_device, write_sysfs_device};
//!
//! # fn main() -> std::io::Result<()> {
//! let root = std::env::temp_dir().join(format!("sysfs-doc-{}", std::process::id()));
//! let device = create_mock_usb_device(1, 4, "046d", "c52b");
//! let entry = write_sysfs_device(&root, &device)?;
//! assert!(entry.join("idVendor").exists());
//! # std::fs::remove_dir_all(&root)?;
//! # Ok(())
//! # }
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// USB character devices live on major 189
pub const USB_DEVICE_MAJOR: u32 = 189;

/// A USB device as it would appear under the host metadata root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeUsbDevice {
    /// Directory name under the metadata root (e.g. "1-4")
    pub entry: String,
    /// `idVendor` contents
    pub vendor_id: String,
    /// `idProduct` contents
    pub product_id: String,
    /// `dev` contents, normally "major:minor"
    pub dev: String,
    /// `busnum` contents
    pub busnum: u32,
    /// `devnum` contents
    pub devnum: u32,
    /// Optional `devname` contents (e.g. "bus/usb/001/004")
    pub devname: Option<String>,
}

impl FakeUsbDevice {
    /// Minor number the kernel would assign for this bus/device pair
    pub fn minor(&self) -> u32 {
        usb_minor(self.busnum, self.devnum)
    }

    /// Override the raw `dev` attribute
    pub fn with_dev(mut self, dev: &str) -> Self {
        self.dev = dev.to_string();
        self
    }

    /// Set the `devname` attribute
    pub fn with_devname(mut self, devname: &str) -> Self {
        self.devname = Some(devname.to_string());
        self
    }
}

/// Kernel minor for a bus/device pair; numbers below 1 clamp to the first slot
fn usb_minor(busnum: u32, devnum: u32) -> u32 {
    busnum.saturating_sub(1) * 128 + devnum.saturating_sub(1)
}

/// Create a mock USB device with kernel-style numbering
///
/// # Arguments
/// * `busnum` - Bus number (1-based)
/// * `devnum` - Device number on the bus (1-based)
/// * `vendor_id` - Four hex digit vendor ID
/// * `product_id` - Four hex digit product ID
pub fn create_mock_usb_device(
    busnum: u32,
    devnum: u32,
    vendor_id: &str,
    product_id: &str,
) -> FakeUsbDevice {
    let minor = usb_minor(busnum, devnum);
    FakeUsbDevice {
        entry: format!("{}-{}", busnum, devnum),
        vendor_id: vendor_id.to_string(),
        product_id: product_id.to_string(),
        dev: format!("{}:{}", USB_DEVICE_MAJOR, minor),
        busnum,
        devnum,
        devname: None,
    }
}

/// Write a device entry with its attribute files under `root`
///
/// Returns the path of the created entry directory.
pub fn write_sysfs_device(root: &Path, device: &FakeUsbDevice) -> io::Result<PathBuf> {
    let entry = root.join(&device.entry);
    fs::create_dir_all(&entry)?;

    fs::write(entry.join("idVendor"), format!("{}\n", device.vendor_id))?;
    fs::write(entry.join("idProduct"), format!("{}\n", device.product_id))?;
    fs::write(entry.join("dev"), format!("{}\n", device.dev))?;
    fs::write(entry.join("busnum"), format!("{}\n", device.busnum))?;
    fs::write(entry.join("devnum"), format!("{}\n", device.devnum))?;
    if let Some(devname) = &device.devname {
        fs::write(entry.join("devname"), format!("{}\n", devname))?;
    }

    Ok(entry)
}

/// Write an interface entry (e.g. "1-4:1.0") that carries no device attributes
pub fn write_sysfs_interface(root: &Path, name: &str) -> io::Result<PathBuf> {
    let entry = root.join(name);
    fs::create_dir_all(&entry)?;
    fs::write(entry.join("bInterfaceClass"), "03\n")?;
    Ok(entry)
}

/// Build the raw uevent lines the kernel emits for a USB device
///
/// # Arguments
/// * `action` - "add" or "remove"
/// * `device` - Device the event describes
/// * `seqnum` - Kernel sequence number
pub fn usb_uevent(action: &str, device: &FakeUsbDevice, seqnum: u64) -> Vec<String> {
    let devname = device
        .devname
        .clone()
        .unwrap_or_else(|| format!("bus/usb/{:03}/{:03}", device.busnum, device.devnum));

    vec![
        format!("ACTION={}", action),
        format!("DEVPATH=/devices/pci0000:00/usb{}/{}", device.busnum, device.entry),
        "SUBSYSTEM=usb".to_string(),
        format!("MAJOR={}", USB_DEVICE_MAJOR),
        format!("MINOR={}", device.minor()),
        format!("DEVNAME={}", devname),
        "DEVTYPE=usb_device".to_string(),
        format!(
            "PRODUCT={}/{}/100",
            strip_hex(&device.vendor_id),
            strip_hex(&device.product_id)
        ),
        format!("BUSNUM={:03}", device.busnum),
        format!("DEVNUM={:03}", device.devnum),
        format!("SEQNUM={}", seqnum),
    ]
}

/// The kernel prints PRODUCT ids without leading zeros
fn strip_hex(id: &str) -> String {
    let trimmed = id.trim_start_matches('0');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_lowercase()
    }
}
