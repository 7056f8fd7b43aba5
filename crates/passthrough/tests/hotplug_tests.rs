//! Integration tests for hotplug handling
//!
//! Covers:
//! - Handler registration through the lifecycle
//! - Add/remove translation and uevent forwarding
//! - Handlers outliving the device object
//! - Delivery from a separate bus thread
//!
//! Run with: `cargo test -p passthrough --test hotplug_tests`

mod support;

use common::test_utils::{FakeUsbDevice, create_mock_usb_device, usb_uevent};
use passthrough::{DeviceDescriptor, MountInstruction};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use support::{Fixture, NodeCall};

fn event(action: &str, device: &FakeUsbDevice, seqnum: u64) -> DeviceDescriptor {
    DeviceDescriptor::from_uevent(&usb_uevent(action, device, seqnum))
        .unwrap()
        .unwrap()
}

mod events {
    use super::*;

    #[test]
    fn test_non_matching_product_not_applicable() {
        let fixture = Fixture::new();
        let device = fixture.device("keyboard", &[("vendorid", "046d"), ("productid", "c52b")]);
        device.register().unwrap();

        let outcomes =
            fixture
                .registry
                .dispatch(&event("add", &create_mock_usb_device(1, 4, "046d", "c534"), 1));

        assert!(outcomes.is_empty());
        assert!(fixture.nodes.calls().is_empty());
    }

    #[test]
    fn test_add_event_sets_up_device() {
        let fixture = Fixture::new();
        let device = fixture.device("keyboard", &[("vendorid", "046d")]);
        device.register().unwrap();

        let mock = create_mock_usb_device(1, 4, "046d", "c52b");
        let outcomes = fixture.registry.dispatch(&event("add", &mock, 10));

        assert_eq!(outcomes.len(), 1);
        let run_conf = &outcomes[0].run_conf;
        assert!(matches!(
            &run_conf.mounts[..],
            [MountInstruction::CharDevice { major: 189, minor: 3, .. }]
        ));
        assert_eq!(run_conf.uevents, vec![usb_uevent("add", &mock, 10)]);
        assert!(run_conf.post_hooks.is_empty());
    }

    #[test]
    fn test_remove_event_teardown_and_single_post_hook() {
        let fixture = Fixture::new();
        let host_file = fixture.create_host_file("keyboard", "dev/bus/usb/001/004");
        let sibling = fixture.create_host_file("keyboard", "dev/bus/usb/001/005");
        let device = fixture.device("keyboard", &[("vendorid", "046d")]);
        device.register().unwrap();

        let mock = create_mock_usb_device(1, 4, "046d", "c52b");
        let mut outcomes = fixture.registry.dispatch(&event("remove", &mock, 11));
        assert_eq!(outcomes.len(), 1);
        let run_conf = &mut outcomes[0].run_conf;

        assert_eq!(
            run_conf.mounts,
            vec![MountInstruction::Unmount {
                host_path: host_file.clone(),
                target_path: PathBuf::from("dev/bus/usb/001/004"),
            }]
        );
        assert_eq!(run_conf.uevents.len(), 1);
        assert_eq!(run_conf.post_hooks.len(), 1);
        assert!(fixture.nodes.deletes().is_empty());

        run_conf.run_post_hooks().unwrap();

        assert_eq!(
            fixture.nodes.deletes(),
            vec![NodeCall::Delete {
                device: "keyboard".to_string(),
                path: Some(PathBuf::from("dev/bus/usb/001/004")),
            }]
        );
        assert!(!host_file.exists());
        assert!(sibling.exists());
    }

    #[test]
    fn test_remove_of_unmapped_device_forwards_uevent() {
        let fixture = Fixture::new();
        let device = fixture.device("keyboard", &[]);
        device.register().unwrap();

        let mock = create_mock_usb_device(3, 2, "0781", "5581");
        let outcomes = fixture.registry.dispatch(&event("remove", &mock, 12));

        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].run_conf.mounts.is_empty());
        assert_eq!(outcomes[0].run_conf.uevents, vec![usb_uevent("remove", &mock, 12)]);
    }

    #[test]
    fn test_devname_drives_target_path() {
        let fixture = Fixture::new();
        let device = fixture.device("printer", &[]);
        device.register().unwrap();

        let mock = create_mock_usb_device(1, 6, "04f9", "0042").with_devname("usb/lp0");
        let outcomes = fixture.registry.dispatch(&event("add", &mock, 13));

        assert!(matches!(
            &outcomes[0].run_conf.mounts[0],
            MountInstruction::CharDevice { target_path, .. } if target_path == &PathBuf::from("dev/usb/lp0")
        ));
    }

    #[test]
    fn test_setup_failure_is_handler_error() {
        let fixture = Fixture::with_nodes(support::RecordingNodes::failing_setup());
        let device = fixture.device("keyboard", &[]);
        device.register().unwrap();
        drop(device);

        // The registry logs and skips failed handlers
        let outcomes =
            fixture
                .registry
                .dispatch(&event("add", &create_mock_usb_device(1, 4, "046d", "c52b"), 14));
        assert!(outcomes.is_empty());
        assert_eq!(fixture.nodes.calls().len(), 1);
    }
}

mod snapshot {
    use super::*;

    #[test]
    fn test_handler_outlives_device() {
        let fixture = Fixture::new();
        {
            let device = fixture.device("keyboard", &[("productid", "c52b")]);
            device.register().unwrap();
        }

        let outcomes =
            fixture
                .registry
                .dispatch(&event("add", &create_mock_usb_device(1, 4, "046d", "c52b"), 20));
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].device_name, "keyboard");
    }

    #[test]
    fn test_reconfigured_device_does_not_affect_registered_handler() {
        let fixture = Fixture::new();
        let original = fixture.device("keyboard", &[("productid", "c52b")]);
        original.register().unwrap();

        // A new device object with different config, not yet registered
        let _replacement = fixture.device("keyboard", &[("productid", "ffff")]);

        let outcomes =
            fixture
                .registry
                .dispatch(&event("add", &create_mock_usb_device(1, 4, "046d", "c52b"), 21));
        assert_eq!(outcomes.len(), 1);
    }

    #[test]
    fn test_devices_on_separate_instances() {
        let fixture = Fixture::new();
        let first = fixture.device("keyboard", &[]);
        let second = passthrough::UsbPassthrough::new(
            passthrough::Instance::new("c2", passthrough::InstanceKind::Container, fixture.devices.path()),
            "keyboard",
            Default::default(),
            fixture.services(),
        );
        first.register().unwrap();
        second.register().unwrap();
        assert_eq!(fixture.registry.len(), 2);

        second.stop().unwrap();
        assert!(fixture.registry.contains("c1", "keyboard"));
        assert!(!fixture.registry.contains("c2", "keyboard"));
    }
}

mod bus_thread {
    use super::*;

    #[test]
    fn test_events_delivered_from_another_thread() {
        let fixture = Fixture::new();
        let device = fixture.device("keyboard", &[("vendorid", "046d")]);
        device.register().unwrap();

        let registry = Arc::clone(&fixture.registry);
        let bus = thread::spawn(move || {
            (1..=5u32)
                .map(|n| {
                    let mock = create_mock_usb_device(1, n + 1, "046d", "c52b");
                    registry.dispatch(&event("add", &mock, u64::from(n))).len()
                })
                .sum::<usize>()
        });

        let stopped = device.stop().unwrap();
        let delivered = bus.join().unwrap();

        assert!(delivered <= 5);
        assert_eq!(stopped.post_hooks.len(), 1);
        assert!(fixture.registry.is_empty());
    }
}
