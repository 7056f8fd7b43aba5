//! Device-node manager
//!
//! The passthrough device never creates or mounts special files itself. It asks
//! a [`DeviceNodeManager`] to describe the work in a [`RunConfig`], and the
//! executor applying that RunConfig does the mknod/mount.
//!
//! [`HostDeviceNodes`] keeps host-side files in the instance's devices
//! directory, named `<category>.<encoded device>.<encoded target path>`.

use crate::config::DeviceConfig;
use crate::run_config::{MountInstruction, RunConfig};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Category prefix for unix character/block devices
pub const UNIX_CATEGORY: &str = "unix";

/// Where a device's host-side files live
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceScope {
    pub devices_path: PathBuf,
    pub category: String,
    pub device_name: String,
}

impl DeviceScope {
    pub fn new(devices_path: &Path, category: &str, device_name: &str) -> Self {
        Self {
            devices_path: devices_path.to_path_buf(),
            category: category.to_string(),
            device_name: device_name.to_string(),
        }
    }

    /// Host file backing `relative_path` inside the instance
    pub fn host_file(&self, relative_path: &Path) -> PathBuf {
        self.devices_path.join(format!(
            "{}.{}.{}",
            self.category,
            encode_name(&self.device_name),
            encode_path(relative_path)
        ))
    }

    /// Target path of a host file name, if the file belongs to this device
    ///
    /// Names have the form `<category>.<encoded device>.<encoded path>`; the
    /// encoded device name never contains a dot.
    fn owned_target(&self, file_name: &str) -> Option<PathBuf> {
        let rest = file_name
            .strip_prefix(self.category.as_str())?
            .strip_prefix('.')?;
        let (name, encoded) = rest.split_once('.')?;
        (name == encode_name(&self.device_name)).then(|| decode_path(encoded))
    }

    /// Existing host files of this device with their decoded target paths
    fn host_files(&self) -> io::Result<Vec<(PathBuf, PathBuf)>> {
        let entries = match fs::read_dir(&self.devices_path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(target) = self.owned_target(name) {
                files.push((entry.path(), target));
            }
        }
        files.sort();
        Ok(files)
    }
}

/// A host character device to expose inside the instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharDevice {
    pub major: u32,
    pub minor: u32,
    /// Host special file, mirrored at the same path inside the instance
    pub path: PathBuf,
    /// Keep the node across instance restarts
    pub persistent: bool,
}

/// Collaborator that turns device requests into mount instructions
///
/// Every operation must tolerate targets that are already gone.
pub trait DeviceNodeManager: Send + Sync {
    /// Describe a character device setup in `run_conf`
    fn setup_char_device(
        &self,
        scope: &DeviceScope,
        config: &DeviceConfig,
        device: &CharDevice,
        run_conf: &mut RunConfig,
    ) -> io::Result<()>;

    /// Describe removal of one mapped path, or all of the device's paths for `None`
    fn remove_device_path(
        &self,
        scope: &DeviceScope,
        relative_path: Option<&Path>,
        run_conf: &mut RunConfig,
    ) -> io::Result<()>;

    /// Delete host-side files, for one path or all of the device's for `None`
    fn delete_host_files(
        &self,
        scope: &DeviceScope,
        relative_path: Option<&Path>,
    ) -> io::Result<()>;
}

/// Node manager backed by the instance's devices directory
#[derive(Debug, Clone, Copy, Default)]
pub struct HostDeviceNodes;

impl DeviceNodeManager for HostDeviceNodes {
    fn setup_char_device(
        &self,
        scope: &DeviceScope,
        config: &DeviceConfig,
        device: &CharDevice,
        run_conf: &mut RunConfig,
    ) -> io::Result<()> {
        let target_path = device
            .path
            .strip_prefix("/")
            .unwrap_or(device.path.as_path())
            .to_path_buf();

        if target_path.as_os_str().is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid device path {}", device.path.display()),
            ));
        }

        let host_path = scope.host_file(&target_path);
        debug!(
            "Setting up {}:{} at {} for device '{}'",
            device.major,
            device.minor,
            target_path.display(),
            scope.device_name
        );

        run_conf.mounts.push(MountInstruction::CharDevice {
            host_path,
            target_path,
            major: device.major,
            minor: device.minor,
            mode: config.mode(),
            uid: config.uid(),
            gid: config.gid(),
            persistent: device.persistent,
        });

        Ok(())
    }

    fn remove_device_path(
        &self,
        scope: &DeviceScope,
        relative_path: Option<&Path>,
        run_conf: &mut RunConfig,
    ) -> io::Result<()> {
        for (host_path, target_path) in scope.host_files()? {
            if relative_path.is_some_and(|p| p != target_path.as_path()) {
                continue;
            }
            run_conf.mounts.push(MountInstruction::Unmount {
                host_path,
                target_path,
            });
        }
        Ok(())
    }

    fn delete_host_files(
        &self,
        scope: &DeviceScope,
        relative_path: Option<&Path>,
    ) -> io::Result<()> {
        for (host_path, target_path) in scope.host_files()? {
            if relative_path.is_some_and(|p| p != target_path.as_path()) {
                continue;
            }
            match fs::remove_file(&host_path) {
                Ok(()) => debug!("Removed {}", host_path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Flatten a relative path into one file name component
///
/// `-` becomes `--` and `/` becomes `-`, so the mapping is reversible.
pub fn encode_path(path: &Path) -> String {
    path.to_string_lossy().replace('-', "--").replace('/', "-")
}

/// Encode a device name for use as one dot-free file name field
///
/// `%` and `.` are percent-escaped before the [`encode_path`] mapping, so
/// distinct names never collide.
pub fn encode_name(name: &str) -> String {
    let escaped = name.replace('%', "%25").replace('.', "%2E");
    encode_path(Path::new(&escaped))
}

/// Inverse of [`encode_path`]
pub fn decode_path(encoded: &str) -> PathBuf {
    let mut decoded = String::with_capacity(encoded.len());
    let mut chars = encoded.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '-' {
            if chars.peek() == Some(&'-') {
                chars.next();
                decoded.push('-');
            } else {
                decoded.push('/');
            }
        } else {
            decoded.push(c);
        }
    }
    PathBuf::from(decoded)
}
