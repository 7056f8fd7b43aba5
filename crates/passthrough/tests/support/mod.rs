//! Shared helpers for passthrough integration tests

#![allow(dead_code)]

use passthrough::nodes::CharDevice;
use passthrough::{
    DeviceConfig, DeviceNodeManager, DeviceScope, DeviceServices, HandlerRegistry,
    HostDeviceNodes, Instance, InstanceKind, RunConfig, UsbPassthrough,
};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// A call made to the node manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeCall {
    Setup { device: String, path: PathBuf },
    Remove { device: String, path: Option<PathBuf> },
    Delete { device: String, path: Option<PathBuf> },
}

/// Node manager that records calls and delegates to [`HostDeviceNodes`]
#[derive(Default)]
pub struct RecordingNodes {
    calls: Mutex<Vec<NodeCall>>,
    fail_setup: bool,
}

impl RecordingNodes {
    pub fn failing_setup() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_setup: true,
        }
    }

    pub fn calls(&self) -> Vec<NodeCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn deletes(&self) -> Vec<NodeCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, NodeCall::Delete { .. }))
            .collect()
    }
}

impl DeviceNodeManager for RecordingNodes {
    fn setup_char_device(
        &self,
        scope: &DeviceScope,
        config: &DeviceConfig,
        device: &CharDevice,
        run_conf: &mut RunConfig,
    ) -> io::Result<()> {
        self.calls.lock().unwrap().push(NodeCall::Setup {
            device: scope.device_name.clone(),
            path: device.path.clone(),
        });
        if self.fail_setup {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "mknod denied"));
        }
        HostDeviceNodes.setup_char_device(scope, config, device, run_conf)
    }

    fn remove_device_path(
        &self,
        scope: &DeviceScope,
        relative_path: Option<&Path>,
        run_conf: &mut RunConfig,
    ) -> io::Result<()> {
        self.calls.lock().unwrap().push(NodeCall::Remove {
            device: scope.device_name.clone(),
            path: relative_path.map(Path::to_path_buf),
        });
        HostDeviceNodes.remove_device_path(scope, relative_path, run_conf)
    }

    fn delete_host_files(&self, scope: &DeviceScope, relative_path: Option<&Path>) -> io::Result<()> {
        self.calls.lock().unwrap().push(NodeCall::Delete {
            device: scope.device_name.clone(),
            path: relative_path.map(Path::to_path_buf),
        });
        HostDeviceNodes.delete_host_files(scope, relative_path)
    }
}

/// Everything a lifecycle test needs
pub struct Fixture {
    pub usb_root: tempfile::TempDir,
    pub devices: tempfile::TempDir,
    pub nodes: Arc<RecordingNodes>,
    pub registry: Arc<HandlerRegistry>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_nodes(RecordingNodes::default())
    }

    pub fn with_nodes(nodes: RecordingNodes) -> Self {
        Self {
            usb_root: tempfile::tempdir().unwrap(),
            devices: tempfile::tempdir().unwrap(),
            nodes: Arc::new(nodes),
            registry: Arc::new(HandlerRegistry::new()),
        }
    }

    pub fn instance(&self) -> Instance {
        Instance::new("c1", InstanceKind::Container, self.devices.path())
    }

    pub fn services(&self) -> DeviceServices {
        DeviceServices::new(self.nodes.clone(), self.registry.clone())
            .with_usb_dev_path(self.usb_root.path())
    }

    pub fn device(&self, name: &str, pairs: &[(&str, &str)]) -> UsbPassthrough {
        UsbPassthrough::new(
            self.instance(),
            name,
            pairs.iter().copied().collect(),
            self.services(),
        )
    }

    /// Simulate the executor having created the host file for `relative_path`
    pub fn create_host_file(&self, device: &str, relative_path: &str) -> PathBuf {
        let scope = DeviceScope::new(self.devices.path(), passthrough::nodes::UNIX_CATEGORY, device);
        let path = scope.host_file(Path::new(relative_path));
        std::fs::write(&path, "").unwrap();
        path
    }
}
