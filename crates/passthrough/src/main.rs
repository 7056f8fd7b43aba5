//! usb-passthrough
//!
//! Diagnostic front end for the USB passthrough device: inspect host devices,
//! preview what start would map into an instance, and replay recorded uevents
//! through a registered handler.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::setup_logging;
use passthrough::{
    DeviceConfig, DeviceDescriptor, DeviceServices, HandlerRegistry, HostDeviceNodes, Instance,
    InstanceKind, Settings, UsbPassthrough, enumerate, is_our_device,
};
use serde_json::json;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "usb-passthrough")]
#[command(author, version, about = "USB passthrough for container instances")]
#[command(long_about = "
Inspect and preview USB passthrough devices for container instances.

EXAMPLES:
    # List USB devices on the host
    usb-passthrough list

    # Only Logitech devices
    usb-passthrough list --vendorid 046d

    # Show what starting device 'keyboard' would map into instance c1
    usb-passthrough plan keyboard --instance c1

    # Feed recorded uevents (blank-line separated) to device 'keyboard'
    usb-passthrough replay keyboard events.txt

CONFIGURATION:
    Settings are looked up in the following order:
    1. Path specified with --config
    2. ~/.config/usb-passthrough/settings.toml
    3. /etc/usb-passthrough/settings.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to settings file
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List USB devices found under the host metadata root
    List {
        /// Only show devices with this vendor ID
        #[arg(long)]
        vendorid: Option<String>,
        /// Only show devices with this product ID
        #[arg(long)]
        productid: Option<String>,
    },
    /// Validate a declared device and print its start instructions
    Plan {
        /// Device name from settings
        device: String,
        /// Instance name
        #[arg(short, long, default_value = "default")]
        instance: String,
    },
    /// Register a declared device and replay uevents from a file
    Replay {
        /// Device name from settings
        device: String,
        /// File with uevents, one KEY=value per line, blank line between events
        file: PathBuf,
        /// Instance name
        #[arg(short, long, default_value = "default")]
        instance: String,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let settings = if let Some(ref path) = args.config {
        Settings::load(Some(path.clone())).context("Failed to load settings")?
    } else {
        Settings::load_or_default()
    };

    let log_level = args.log_level.as_deref().unwrap_or(&settings.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    debug!("usb-passthrough v{}", env!("CARGO_PKG_VERSION"));

    match args.command {
        Command::List {
            vendorid,
            productid,
        } => list_devices(&settings, vendorid, productid),
        Command::Plan { device, instance } => plan_device(&settings, &device, &instance),
        Command::Replay {
            device,
            file,
            instance,
        } => replay_events(&settings, &device, &instance, &file),
    }
}

fn list_devices(
    settings: &Settings,
    vendorid: Option<String>,
    productid: Option<String>,
) -> Result<()> {
    let filter: DeviceConfig = [("vendorid", vendorid), ("productid", productid)]
        .into_iter()
        .filter_map(|(key, value)| value.map(|v| (key, v)))
        .collect();
    filter
        .validate(InstanceKind::Container)
        .context("Invalid filter")?;

    let devices = enumerate(&settings.usb_dev_path).with_context(|| {
        format!(
            "Failed to enumerate USB devices under {}",
            settings.usb_dev_path.display()
        )
    })?;

    let matching: Vec<&DeviceDescriptor> = devices
        .iter()
        .filter(|d| is_our_device(&filter, d))
        .collect();

    if matching.is_empty() {
        println!("No USB devices found");
        return Ok(());
    }

    println!(
        "{:<4} {:<4} {:<9} {:<8} PATH",
        "BUS", "DEV", "ID", "MAJ:MIN"
    );
    for device in matching {
        println!(
            "{:03}  {:03}  {}:{} {:<8} {}",
            device.bus_number,
            device.device_number,
            device.vendor_id,
            device.product_id,
            device.dev(),
            device.path.display()
        );
    }

    Ok(())
}

fn build_device(
    settings: &Settings,
    registry: Arc<HandlerRegistry>,
    device: &str,
    instance: &str,
) -> Result<UsbPassthrough> {
    let config = settings.device(device)?.clone();
    let services = DeviceServices::new(Arc::new(HostDeviceNodes), registry)
        .with_usb_dev_path(&settings.usb_dev_path);
    let instance = Instance::new(
        instance,
        InstanceKind::Container,
        settings.instance_devices_path(instance),
    );

    let passthrough = UsbPassthrough::new(instance, device, config, services);
    passthrough
        .validate_config()
        .with_context(|| format!("Invalid configuration for device '{}'", device))?;

    Ok(passthrough)
}

fn plan_device(settings: &Settings, device: &str, instance: &str) -> Result<()> {
    let registry = Arc::new(HandlerRegistry::new());
    let passthrough = build_device(settings, registry, device, instance)?;

    let run_conf = passthrough
        .start()
        .with_context(|| format!("Failed to start device '{}'", device))?;

    info!(
        "Device '{}' would map {} paths into {}",
        device,
        run_conf.mounts.len(),
        instance
    );
    println!("{}", serde_json::to_string_pretty(&run_conf)?);
    Ok(())
}

fn replay_events(
    settings: &Settings,
    device: &str,
    instance: &str,
    file: &std::path::Path,
) -> Result<()> {
    let registry = Arc::new(HandlerRegistry::new());
    let passthrough = build_device(settings, registry.clone(), device, instance)?;
    passthrough.register()?;

    let content = fs::read_to_string(file)
        .with_context(|| format!("Failed to read uevent file: {}", file.display()))?;

    let mut results = Vec::new();
    for (index, block) in split_events(&content).into_iter().enumerate() {
        let Some(descriptor) = DeviceDescriptor::from_uevent(&block)
            .with_context(|| format!("Invalid uevent #{}", index + 1))?
        else {
            debug!("Skipping uevent #{}: not a USB device event", index + 1);
            continue;
        };

        for outcome in registry.dispatch(&descriptor) {
            results.push(json!({
                "event": index + 1,
                "action": descriptor.action,
                "seqnum": descriptor.seqnum,
                "instance": outcome.instance,
                "device": outcome.device_name,
                "run_config": outcome.run_conf,
                "post_hooks": outcome.run_conf.post_hooks.len(),
            }));
        }
    }

    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}

/// Split blank-line separated uevent blocks into their lines
fn split_events(content: &str) -> Vec<Vec<&str>> {
    let mut events = Vec::new();
    let mut current = Vec::new();

    for line in content.lines().map(str::trim) {
        if line.is_empty() {
            if !current.is_empty() {
                events.push(std::mem::take(&mut current));
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        events.push(current);
    }

    events
}
