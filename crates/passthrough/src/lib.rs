//! USB passthrough for containers
//!
//! Binds physical USB devices into a running container instance. A device is
//! declared with a small option map (vendor/product filters, ownership, mode,
//! `required`); this crate decides which host devices qualify, reconciles them
//! at start, and translates hotplug events into mount instructions while the
//! instance runs.
//!
//! Creating device nodes, the host-wide event bus and the executor that
//! applies instructions are collaborators behind [`DeviceNodeManager`] and
//! [`HotplugBus`].

pub mod config;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod hotplug;
pub mod instance;
pub mod matcher;
pub mod nodes;
pub mod run_config;
pub mod settings;

pub use config::DeviceConfig;
pub use descriptor::{DeviceDescriptor, UsbAction, enumerate};
pub use device::{DeviceServices, UsbPassthrough};
pub use error::{PassthroughError, Result};
pub use hotplug::{HandlerRegistry, HotplugBus, HotplugContext, HotplugHandler};
pub use instance::{Instance, InstanceKind};
pub use matcher::is_our_device;
pub use nodes::{DeviceNodeManager, DeviceScope, HostDeviceNodes};
pub use run_config::{MountInstruction, RunConfig};
pub use settings::Settings;
