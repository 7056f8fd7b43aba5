//! Hotplug bridge
//!
//! The host-wide hotplug bus delivers USB events on its own thread. Each
//! passthrough device subscribes one handler, keyed by (instance, device name).
//! The handler owns an immutable [`HotplugContext`] snapshot taken at register
//! time, so it keeps working after the device object that created it is gone.

use crate::config::DeviceConfig;
use crate::descriptor::{DeviceDescriptor, UsbAction};
use crate::error::{PassthroughError, Result};
use crate::instance::Instance;
use crate::matcher::is_our_device;
use crate::nodes::{CharDevice, DeviceNodeManager, DeviceScope};
use crate::run_config::RunConfig;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Callback invoked by the bus for every USB event
///
/// `Ok(None)` means the event does not concern this device.
pub type HotplugHandler =
    Arc<dyn Fn(&DeviceDescriptor) -> Result<Option<RunConfig>> + Send + Sync>;

/// Host-wide hotplug event bus
pub trait HotplugBus: Send + Sync {
    /// Install `handler` for (instance, device name), replacing any previous one
    fn subscribe(&self, instance: &Instance, device_name: &str, handler: HotplugHandler);

    /// Remove the handler for (instance, device name); no-op when absent
    fn unsubscribe(&self, instance: &Instance, device_name: &str);
}

/// Everything a hotplug handler needs, captured by value
#[derive(Clone)]
pub struct HotplugContext {
    scope: DeviceScope,
    config: DeviceConfig,
    nodes: Arc<dyn DeviceNodeManager>,
}

impl HotplugContext {
    pub fn new(scope: DeviceScope, config: DeviceConfig, nodes: Arc<dyn DeviceNodeManager>) -> Self {
        Self {
            scope,
            config,
            nodes,
        }
    }

    /// Translate one event into instructions for this device
    pub fn handle(&self, device: &DeviceDescriptor) -> Result<Option<RunConfig>> {
        if !is_our_device(&self.config, device) {
            return Ok(None);
        }

        let device_name = &self.scope.device_name;
        let mut run_conf = RunConfig::new();

        match device.action {
            UsbAction::Add => {
                let node = CharDevice {
                    major: device.major,
                    minor: device.minor,
                    path: device.path.clone(),
                    persistent: false,
                };
                self.nodes
                    .setup_char_device(&self.scope, &self.config, &node, &mut run_conf)
                    .map_err(|source| PassthroughError::Setup {
                        device: device_name.clone(),
                        source,
                    })?;
            }
            UsbAction::Remove => {
                let relative_path = device.relative_path();
                self.nodes
                    .remove_device_path(&self.scope, Some(&relative_path), &mut run_conf)
                    .map_err(|source| PassthroughError::Teardown {
                        device: device_name.clone(),
                        source,
                    })?;

                // The node may still be mounted until the caller unmounts it
                let nodes = Arc::clone(&self.nodes);
                let scope = self.scope.clone();
                run_conf.add_post_hook(move || {
                    nodes
                        .delete_host_files(&scope, Some(&relative_path))
                        .map_err(|source| PassthroughError::Cleanup {
                            device: scope.device_name.clone(),
                            source,
                        })
                });
            }
        }

        debug!(
            "USB {} {}:{} ({}) handled for device '{}'",
            device.action,
            device.vendor_id,
            device.product_id,
            device.path.display(),
            device_name
        );

        run_conf.uevents.push(device.uevent.clone());
        Ok(Some(run_conf))
    }

    /// Wrap the snapshot into a bus handler
    pub fn into_handler(self) -> HotplugHandler {
        Arc::new(move |device: &DeviceDescriptor| self.handle(device))
    }
}

/// Result of delivering one event to one subscription
#[derive(Debug)]
pub struct DispatchOutcome {
    pub instance: String,
    pub device_name: String,
    pub run_conf: RunConfig,
}

/// In-process hotplug bus
///
/// Handlers are called outside the lock, so a handler may safely
/// subscribe or unsubscribe.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Mutex<HashMap<(String, String), HotplugHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of installed subscriptions
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, instance: &str, device_name: &str) -> bool {
        self.lock()
            .contains_key(&(instance.to_string(), device_name.to_string()))
    }

    /// Deliver an event to every subscription
    ///
    /// Returns the applicable instruction sets. Handler failures are logged and
    /// do not stop delivery to the remaining subscriptions.
    pub fn dispatch(&self, device: &DeviceDescriptor) -> Vec<DispatchOutcome> {
        let mut handlers: Vec<((String, String), HotplugHandler)> = self
            .lock()
            .iter()
            .map(|(key, handler)| (key.clone(), Arc::clone(handler)))
            .collect();
        handlers.sort_by(|a, b| a.0.cmp(&b.0));

        let mut outcomes = Vec::new();
        for ((instance, device_name), handler) in handlers {
            match handler(device) {
                Ok(Some(run_conf)) => outcomes.push(DispatchOutcome {
                    instance,
                    device_name,
                    run_conf,
                }),
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        "USB event handler for {}/{} failed: {}",
                        instance, device_name, e
                    );
                }
            }
        }
        outcomes
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), HotplugHandler>> {
        // Handlers never run under the lock, so a poisoned map is still consistent
        self.handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl HotplugBus for HandlerRegistry {
    fn subscribe(&self, instance: &Instance, device_name: &str, handler: HotplugHandler) {
        let key = (instance.name().to_string(), device_name.to_string());
        if self.lock().insert(key, handler).is_some() {
            debug!(
                "Replaced USB handler for {}/{}",
                instance.name(),
                device_name
            );
        } else {
            debug!(
                "Registered USB handler for {}/{}",
                instance.name(),
                device_name
            );
        }
    }

    fn unsubscribe(&self, instance: &Instance, device_name: &str) {
        let key = (instance.name().to_string(), device_name.to_string());
        if self.lock().remove(&key).is_some() {
            debug!(
                "Unregistered USB handler for {}/{}",
                instance.name(),
                device_name
            );
        }
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.lock().keys().cloned().collect();
        keys.sort();
        f.debug_struct("HandlerRegistry")
            .field("subscriptions", &keys)
            .finish()
    }
}
