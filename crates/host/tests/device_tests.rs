//! Integration tests for Device
//!
//! Drives the device lifecycle, control transfers and descriptor retrieval
//! against the in-memory engine:
//! - open/close and configuration changes
//! - control transfer argument checks and payload handling
//! - string, BOS and capability descriptors

use bytes::Bytes;
use common::test_utils::{
    DEFAULT_TEST_TIMEOUT, create_mock_bos, create_mock_config_descriptor,
    create_mock_minimal_config, create_mock_superspeed, create_mock_usb2_extension, with_timeout,
};
use host::testing::{MockDevice, MockOp, MockReply};
use host::{Device, DeviceError, UsbError};
use protocol::{CapabilityType, DeviceCapability, TransferKind};
use std::sync::Arc;
use std::time::Duration;

fn open_device(mock: &Arc<MockDevice>) -> Device {
    let mut device = Device::new(mock.clone());
    device.open(true).unwrap();
    device
}

fn bos_device(bos: Vec<u8>) -> Arc<MockDevice> {
    MockDevice::builder(0x1234, 0x5678)
        .usb_version(0x0210)
        .bos(bos)
        .build()
}

mod control_transfer {
    use super::*;

    #[tokio::test]
    async fn test_string_descriptor_request_bytes() {
        let mock = MockDevice::builder(0x1234, 0x5678)
            .string(4, "Config")
            .build();
        let device = open_device(&mock);

        let value = with_timeout(DEFAULT_TEST_TIMEOUT, device.get_string_descriptor(4))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value.as_deref(), Some("Config"));
        assert_eq!(
            mock.setups()[0].encode(),
            [0x80, 0x06, 0x04, 0x03, 0x09, 0x04, 0xFF, 0x00]
        );
    }

    #[tokio::test]
    async fn test_empty_string_reply_is_absent() {
        let mock = MockDevice::builder(0x1234, 0x5678)
            .raw_string(5, Vec::new())
            .build();
        let device = open_device(&mock);

        assert_eq!(device.get_string_descriptor(5).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_direction_mismatch_fails_before_submit() {
        let mock = MockDevice::builder(0x1234, 0x5678).build();
        let device = open_device(&mock);

        assert!(matches!(
            device.control_transfer(0x80, 0x06, 0x0100, 0, Bytes::from_static(&[1, 2])),
            Err(UsbError::InvalidArgument(_))
        ));
        assert!(matches!(
            device.control_transfer(0x40, 0x01, 0, 0, 4u16),
            Err(UsbError::InvalidArgument(_))
        ));
        assert_eq!(mock.submission_count(), 0);
    }

    #[tokio::test]
    async fn test_in_payload_excludes_setup() {
        let mock = MockDevice::builder(0x1234, 0x5678).build();
        mock.push_control_reply(MockReply::Data(vec![0xAA, 0xBB, 0xCC]));
        let device = open_device(&mock);

        let data = device
            .control_transfer(0xC0, 0x01, 0, 0, 64u16)
            .unwrap()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&data[..], &[0xAA, 0xBB, 0xCC]);
    }

    #[tokio::test]
    async fn test_out_request_yields_no_payload() {
        let mock = MockDevice::builder(0x1234, 0x5678).build();
        let device = open_device(&mock);

        let reply = device
            .control_transfer(0x40, 0x02, 0x0001, 0, vec![1, 2, 3])
            .unwrap()
            .await
            .unwrap();
        assert!(reply.is_none());
        assert_eq!(mock.setups()[0].length, 3);
    }

    #[tokio::test]
    async fn test_stall_is_reported_through_the_future() {
        let mock = MockDevice::builder(0x1234, 0x5678).build();
        mock.push_control_reply(MockReply::Stall);
        let device = open_device(&mock);

        let pending = device.control_transfer(0xC0, 0x01, 0, 0, 8u16);
        assert!(pending.is_ok());
        assert_eq!(
            pending.unwrap().await,
            Err(UsbError::Device(DeviceError::Stall))
        );
    }

    #[tokio::test]
    async fn test_device_timeout_applies_to_control() {
        let mock = MockDevice::builder(0x1234, 0x5678).build();
        mock.push_control_reply(MockReply::Fail(DeviceError::Timeout));
        let mut device = open_device(&mock);
        device.set_timeout(Duration::from_millis(50));
        assert_eq!(device.timeout(), Duration::from_millis(50));

        let result = device.control_transfer(0xC0, 0x01, 0, 0, 8u16).unwrap().await;
        assert!(matches!(result, Err(e) if e.device_error() == Some(DeviceError::Timeout)));
    }
}

mod bos_descriptor {
    use super::*;

    #[tokio::test]
    async fn test_old_device_skips_request() {
        let mock = MockDevice::builder(0x1234, 0x5678)
            .usb_version(0x0200)
            .bos(create_mock_bos(&[create_mock_usb2_extension()]))
            .build();
        let device = open_device(&mock);

        assert!(device.get_bos_descriptor().await.unwrap().is_none());
        assert!(device.get_capabilities().await.unwrap().is_empty());
        assert_eq!(mock.control_count(), 0);
    }

    #[tokio::test]
    async fn test_fetched_once_in_two_phases() {
        let raw = create_mock_bos(&[create_mock_usb2_extension(), create_mock_superspeed()]);
        let mock = bos_device(raw.clone());
        let device = open_device(&mock);

        let first = device.get_bos_descriptor().await.unwrap().unwrap();
        let second = device.get_bos_descriptor().await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.capabilities.len(), 2);
        assert_eq!(first.total_length as usize, raw.len());

        let setups = mock.setups();
        assert_eq!(setups.len(), 2);
        assert_eq!(setups[0].value, 0x0F00);
        assert_eq!(setups[0].length, 5);
        assert_eq!(setups[1].length as usize, raw.len());
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_fetch() {
        let mock = bos_device(create_mock_bos(&[create_mock_usb2_extension()]));
        let device = open_device(&mock);

        let (a, b) = tokio::join!(device.get_bos_descriptor(), device.get_bos_descriptor());
        assert!(a.unwrap().is_some());
        assert!(b.unwrap().is_some());
        assert_eq!(mock.control_count(), 2);
    }

    #[tokio::test]
    async fn test_stall_means_absent_and_is_cached() {
        let mock = MockDevice::builder(0x1234, 0x5678)
            .usb_version(0x0210)
            .build();
        let device = open_device(&mock);

        assert!(device.get_bos_descriptor().await.unwrap().is_none());
        assert!(device.get_bos_descriptor().await.unwrap().is_none());
        assert_eq!(mock.control_count(), 1);
    }

    #[tokio::test]
    async fn test_malformed_record_is_not_cached() {
        let mock = bos_device(vec![0x05, 0x0F, 0x0A, 0x00, 0x01, 0x00, 0x10, 0x02, 0x00, 0x00]);
        let device = open_device(&mock);

        assert!(matches!(
            device.get_bos_descriptor().await,
            Err(UsbError::MalformedDescriptor(_))
        ));
        assert!(device.get_bos_descriptor().await.is_err());
        assert_eq!(mock.control_count(), 4);
    }

    #[tokio::test]
    async fn test_transport_error_propagates() {
        let mock = bos_device(create_mock_bos(&[create_mock_usb2_extension()]));
        mock.push_control_reply(MockReply::Fail(DeviceError::Io));
        let device = open_device(&mock);

        assert_eq!(
            device.get_bos_descriptor().await,
            Err(UsbError::Device(DeviceError::Io))
        );
        assert!(device.get_bos_descriptor().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_capabilities_keep_record_order() {
        let mock = bos_device(create_mock_bos(&[
            create_mock_usb2_extension(),
            create_mock_superspeed(),
        ]));
        let device = open_device(&mock);

        let caps = device.get_capabilities().await.unwrap();
        assert_eq!(caps.len(), 2);
        assert_eq!(caps[0].index(), 0);
        assert_eq!(caps[0].capability_type(), CapabilityType::Usb20Extension);
        assert_eq!(caps[1].capability_type(), CapabilityType::SuperSpeedUsb);
        assert_eq!(caps[1].data().len(), 7);

        match caps[0].decode().unwrap() {
            DeviceCapability::Usb20Extension(ext) => assert!(ext.supports_lpm()),
            other => panic!("unexpected capability {:?}", other),
        }
        match caps[1].decode().unwrap() {
            DeviceCapability::SuperSpeedUsb(ss) => assert_eq!(ss.speeds_supported, 0x000E),
            other => panic!("unexpected capability {:?}", other),
        }
    }
}

mod configuration {
    use super::*;

    fn two_config_device() -> Arc<MockDevice> {
        MockDevice::builder(0x1234, 0x5678)
            .config(create_mock_config_descriptor(1))
            .config(create_mock_minimal_config(2))
            .build()
    }

    #[tokio::test]
    async fn test_set_configuration_replaces_interfaces() {
        let mock = two_config_device();
        let mut device = open_device(&mock);
        let old = device.interface(1).unwrap().unwrap();
        assert_eq!(device.interfaces().unwrap().len(), 2);

        device.set_configuration(2).await.unwrap();

        assert_eq!(device.interfaces().unwrap().len(), 1);
        assert!(device.interface(1).unwrap().is_none());
        assert!(!old.is_valid());
        assert!(matches!(old.claim(), Err(UsbError::InvalidState(_))));
        assert_eq!(
            device.config_descriptor().unwrap().unwrap().configuration_value,
            2
        );
        assert_eq!(mock.active_configuration(), Some(2));
        assert_eq!(device.all_config_descriptors().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_set_configuration_keeps_state() {
        let mock = two_config_device();
        let mut device = open_device(&mock);
        let iface = device.interface(0).unwrap().unwrap();
        mock.fail_operation(MockOp::SetConfiguration, Some(DeviceError::Busy));

        assert_eq!(
            device.set_configuration(2).await,
            Err(UsbError::Device(DeviceError::Busy))
        );
        assert!(iface.is_valid());
        assert_eq!(device.interfaces().unwrap().len(), 2);
        assert_eq!(mock.active_configuration(), Some(1));
    }

    #[tokio::test]
    async fn test_unreadable_new_configuration_keeps_interfaces() {
        let mock = two_config_device();
        let mut device = open_device(&mock);
        let iface = device.interface(0).unwrap().unwrap();
        mock.fail_operation(MockOp::ConfigDescriptor, Some(DeviceError::Io));

        assert_eq!(
            device.set_configuration(2).await,
            Err(UsbError::Device(DeviceError::Io))
        );
        assert!(device.is_open());
        assert!(iface.is_valid());
        assert_eq!(device.interfaces().unwrap().len(), 2);
        assert_eq!(device.interface(0).unwrap().unwrap().index(), 0);
        assert_eq!(
            device.config_descriptor().unwrap().unwrap().configuration_value,
            1
        );

        // A later attempt with a readable descriptor goes through
        mock.fail_operation(MockOp::ConfigDescriptor, None);
        device.set_configuration(2).await.unwrap();
        assert_eq!(device.interfaces().unwrap().len(), 1);
        assert!(!iface.is_valid());
    }

    #[tokio::test]
    async fn test_set_configuration_requires_open() {
        let mock = two_config_device();
        let mut device = Device::new(mock);
        assert!(matches!(
            device.set_configuration(2).await,
            Err(UsbError::InvalidState(_))
        ));
    }
}

mod lifecycle {
    use super::*;

    #[test]
    fn test_identity_accessors() {
        let hub = MockDevice::builder(0x1d6b, 0x0002).bus(3, 1).build();
        let mock = MockDevice::builder(0x1234, 0x5678)
            .bus(3, 7)
            .ports(vec![2, 4])
            .parent(hub)
            .build();
        let device = Device::new(mock);

        assert_eq!(device.bus_number(), 3);
        assert_eq!(device.device_address(), 7);
        assert_eq!(device.port_numbers(), vec![2, 4]);
        assert_eq!(device.device_descriptor().vendor_id, 0x1234);

        let parent = device.parent().unwrap();
        assert_eq!(parent.device_descriptor().vendor_id, 0x1d6b);
        assert!(parent.parent().is_none());
    }

    #[test]
    fn test_failed_open_leaves_device_closed() {
        let mock = MockDevice::builder(0x1234, 0x5678).build();
        mock.fail_operation(MockOp::Open, Some(DeviceError::Access));
        let mut device = Device::new(mock.clone());

        assert_eq!(
            device.open(true),
            Err(UsbError::Device(DeviceError::Access))
        );
        assert!(!device.is_open());
        assert!(!mock.is_open());
    }

    #[tokio::test]
    async fn test_close_cancels_pending_transfers() {
        let mock = MockDevice::builder(0x1234, 0x5678).build();
        let mut device = open_device(&mock);
        let iface = device.interface(0).unwrap().unwrap();
        iface.claim().unwrap();

        let ep = iface.endpoint(0x81).unwrap();
        assert_eq!(ep.transfer_kind(), TransferKind::Bulk);
        let read = ep.as_in().unwrap().clone();
        let pending = tokio::spawn(async move { read.transfer(64).await });
        tokio::task::yield_now().await;
        while mock.held_count() == 0 {
            tokio::task::yield_now().await;
        }

        device.close();
        let result = with_timeout(DEFAULT_TEST_TIMEOUT, pending)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(e) if e.is_cancelled()));
        assert!(!iface.is_valid());
    }

    #[tokio::test]
    async fn test_reset() {
        let mock = MockDevice::builder(0x1234, 0x5678).build();
        let device = open_device(&mock);
        device.reset().await.unwrap();
        assert_eq!(mock.reset_count(), 1);
    }

    #[test]
    fn test_drop_closes_handle() {
        let mock = MockDevice::builder(0x1234, 0x5678).build();
        let device = open_device(&mock);
        assert!(mock.is_open());
        drop(device);
        assert!(!mock.is_open());
    }
}
