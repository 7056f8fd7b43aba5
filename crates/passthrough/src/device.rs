//! USB passthrough device lifecycle
//!
//! The owning lifecycle driver calls the operations serially:
//!
//! 1. [`UsbPassthrough::validate_config`] before anything else
//! 2. [`UsbPassthrough::register`] after start, or when the daemon restarts
//! 3. [`UsbPassthrough::start`] to map devices already on the host
//! 4. [`UsbPassthrough::stop`], then the caller applies the returned
//!    [`RunConfig`] and runs its post-hooks (which perform post-stop)
//!
//! Hotplug events race with all of this on the bus thread; they only ever see
//! the immutable [`HotplugContext`] captured in `register`.

use crate::config::DeviceConfig;
use crate::descriptor::{DEFAULT_USB_DEV_PATH, enumerate};
use crate::error::{PassthroughError, Result};
use crate::hotplug::{HotplugBus, HotplugContext};
use crate::instance::Instance;
use crate::matcher::is_our_device;
use crate::nodes::{CharDevice, DeviceNodeManager, DeviceScope, UNIX_CATEGORY};
use crate::run_config::RunConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Instance-scoped collaborators shared by every passthrough device
#[derive(Clone)]
pub struct DeviceServices {
    /// Host device metadata root
    pub usb_dev_path: PathBuf,
    pub nodes: Arc<dyn DeviceNodeManager>,
    pub bus: Arc<dyn HotplugBus>,
}

impl DeviceServices {
    pub fn new(nodes: Arc<dyn DeviceNodeManager>, bus: Arc<dyn HotplugBus>) -> Self {
        Self {
            usb_dev_path: PathBuf::from(DEFAULT_USB_DEV_PATH),
            nodes,
            bus,
        }
    }

    /// Read host devices from another metadata root
    pub fn with_usb_dev_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.usb_dev_path = path.into();
        self
    }
}

/// A USB passthrough device attached to one instance
pub struct UsbPassthrough {
    instance: Instance,
    name: String,
    config: DeviceConfig,
    services: DeviceServices,
}

impl UsbPassthrough {
    pub fn new(
        instance: Instance,
        name: impl Into<String>,
        config: DeviceConfig,
        services: DeviceServices,
    ) -> Self {
        Self {
            instance,
            name: name.into(),
            config,
            services,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    fn scope(&self) -> DeviceScope {
        DeviceScope::new(self.instance.devices_path(), UNIX_CATEGORY, &self.name)
    }

    /// Check the device config against the instance
    pub fn validate_config(&self) -> Result<()> {
        self.config.validate(self.instance.kind())
    }

    /// Host capability checks; nothing is required yet
    fn validate_environment(&self) -> Result<()> {
        Ok(())
    }

    /// Subscribe to USB hotplug events for this device
    pub fn register(&self) -> Result<()> {
        let context = HotplugContext::new(
            self.scope(),
            self.config.clone(),
            Arc::clone(&self.services.nodes),
        );

        self.services
            .bus
            .subscribe(&self.instance, &self.name, context.into_handler());

        debug!(
            "Registered USB hotplug handler for {}/{}",
            self.instance.name(),
            self.name
        );
        Ok(())
    }

    /// Map every matching USB device currently on the host
    pub fn start(&self) -> Result<RunConfig> {
        self.validate_environment()?;

        let devices = enumerate(&self.services.usb_dev_path)?;
        let scope = self.scope();
        let mut run_conf = RunConfig::new();

        for device in devices.iter().filter(|d| is_our_device(&self.config, d)) {
            let node = CharDevice {
                major: device.major,
                minor: device.minor,
                path: device.path.clone(),
                persistent: false,
            };
            self.services
                .nodes
                .setup_char_device(&scope, &self.config, &node, &mut run_conf)
                .map_err(|source| PassthroughError::Setup {
                    device: self.name.clone(),
                    source,
                })?;
        }

        if self.config.required() && run_conf.mounts.is_empty() {
            return Err(PassthroughError::RequiredDeviceNotFound {
                device: self.name.clone(),
            });
        }

        info!(
            "Started USB device '{}' on {} with {} of {} host devices",
            self.name,
            self.instance.name(),
            run_conf.mounts.len(),
            devices.len()
        );
        Ok(run_conf)
    }

    /// Unsubscribe and unmap every path owned by this device
    ///
    /// The returned RunConfig carries one post-hook that performs post-stop.
    pub fn stop(&self) -> Result<RunConfig> {
        self.services.bus.unsubscribe(&self.instance, &self.name);

        let scope = self.scope();
        let mut run_conf = RunConfig::new();

        self.services
            .nodes
            .remove_device_path(&scope, None, &mut run_conf)
            .map_err(|source| PassthroughError::Teardown {
                device: self.name.clone(),
                source,
            })?;

        let nodes = Arc::clone(&self.services.nodes);
        run_conf.add_post_hook(move || delete_device_files(nodes.as_ref(), &scope));

        info!(
            "Stopping USB device '{}' on {} ({} paths)",
            self.name,
            self.instance.name(),
            run_conf.mounts.len()
        );
        Ok(run_conf)
    }

    /// Remove host-side files once the caller has unmounted them
    pub fn post_stop(&self) -> Result<()> {
        delete_device_files(self.services.nodes.as_ref(), &self.scope())
    }
}

fn delete_device_files(nodes: &dyn DeviceNodeManager, scope: &DeviceScope) -> Result<()> {
    nodes
        .delete_host_files(scope, None)
        .map_err(|source| PassthroughError::Cleanup {
            device: scope.device_name.clone(),
            source,
        })
}

impl std::fmt::Debug for UsbPassthrough {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbPassthrough")
            .field("instance", &self.instance)
            .field("name", &self.name)
            .field("config", &self.config)
            .field("usb_dev_path", &self.services.usb_dev_path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hotplug::HandlerRegistry;
    use crate::instance::InstanceKind;
    use crate::nodes::HostDeviceNodes;
    use common::test_utils::{create_mock_usb_device, write_sysfs_device};
    use tempfile::tempdir;

    fn passthrough(
        kind: InstanceKind,
        usb_root: &std::path::Path,
        devices: &std::path::Path,
        pairs: &[(&str, &str)],
    ) -> (UsbPassthrough, Arc<HandlerRegistry>) {
        let registry = Arc::new(HandlerRegistry::new());
        let services = DeviceServices::new(Arc::new(HostDeviceNodes), registry.clone())
            .with_usb_dev_path(usb_root);
        let device = UsbPassthrough::new(
            Instance::new("c1", kind, devices),
            "cam",
            pairs.iter().copied().collect(),
            services,
        );
        (device, registry)
    }

    #[test]
    fn test_validate_rejects_vm() {
        let dir = tempdir().unwrap();
        let (device, _) = passthrough(InstanceKind::VirtualMachine, dir.path(), dir.path(), &[]);
        assert!(matches!(
            device.validate_config(),
            Err(PassthroughError::UnsupportedDeviceType { .. })
        ));
    }

    #[test]
    fn test_start_maps_matching_devices() {
        let usb = tempdir().unwrap();
        let devices = tempdir().unwrap();
        write_sysfs_device(usb.path(), &create_mock_usb_device(1, 4, "046d", "c52b")).unwrap();
        write_sysfs_device(usb.path(), &create_mock_usb_device(1, 5, "0781", "5581")).unwrap();

        let (device, _) = passthrough(
            InstanceKind::Container,
            usb.path(),
            devices.path(),
            &[("vendorid", "046d")],
        );
        let run_conf = device.start().unwrap();

        assert_eq!(run_conf.mounts.len(), 1);
        assert!(run_conf.uevents.is_empty());
        assert!(run_conf.post_hooks.is_empty());
    }

    #[test]
    fn test_register_then_stop_unsubscribes() {
        let dir = tempdir().unwrap();
        let (device, registry) = passthrough(InstanceKind::Container, dir.path(), dir.path(), &[]);

        device.register().unwrap();
        device.register().unwrap();
        assert_eq!(registry.len(), 1);

        let mut run_conf = device.stop().unwrap();
        assert!(registry.is_empty());
        assert_eq!(run_conf.post_hooks.len(), 1);
        run_conf.run_post_hooks().unwrap();
    }

    #[test]
    fn test_post_stop_removes_host_files() {
        let dir = tempdir().unwrap();
        let (device, _) = passthrough(InstanceKind::Container, dir.path(), dir.path(), &[]);
        let host_file = device.scope().host_file(std::path::Path::new("dev/bus/usb/001/004"));
        std::fs::write(&host_file, "").unwrap();

        device.post_stop().unwrap();
        assert!(!host_file.exists());
    }
}
