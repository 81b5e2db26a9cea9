//! Integration tests for interface claiming, alternate settings and kernel
//! driver control

use bytes::BytesMut;
use common::test_utils::{DEFAULT_TEST_TIMEOUT, with_timeout};
use host::testing::{MockDevice, MockOp};
use host::{Device, DeviceError, UsbError};
use std::sync::Arc;
use std::time::Duration;

fn open(mock: &Arc<MockDevice>) -> Device {
    let mut device = Device::new(mock.clone());
    device.open(true).unwrap();
    device
}

mod claiming {
    use super::*;

    #[tokio::test]
    async fn test_claim_and_release() {
        let mock = MockDevice::builder(0x1234, 0x5678).build();
        let device = open(&mock);
        let iface = device.interface(0).unwrap().unwrap();

        assert!(!iface.is_claimed());
        assert!(!iface.endpoint(0x81).unwrap().is_usable());

        iface.claim().unwrap();
        assert!(iface.is_claimed());
        assert_eq!(mock.claimed_interfaces(), vec![0]);
        assert!(iface.endpoint(0x81).unwrap().is_usable());

        iface.release(false).await.unwrap();
        assert!(!iface.is_claimed());
        assert!(mock.claimed_interfaces().is_empty());
    }

    #[tokio::test]
    async fn test_claim_is_idempotent() {
        let mock = MockDevice::builder(0x1234, 0x5678).build();
        let device = open(&mock);
        let iface = device.interface(0).unwrap().unwrap();

        iface.claim().unwrap();
        iface.claim().unwrap();
        assert_eq!(mock.claimed_interfaces(), vec![0]);
    }

    #[tokio::test]
    async fn test_failed_claim_leaves_interface_unclaimed() {
        let mock = MockDevice::builder(0x1234, 0x5678).build();
        mock.fail_operation(MockOp::ClaimInterface, Some(DeviceError::Busy));
        let device = open(&mock);
        let iface = device.interface(0).unwrap().unwrap();

        assert_eq!(iface.claim(), Err(UsbError::Device(DeviceError::Busy)));
        assert!(!iface.is_claimed());
        assert!(!iface.endpoint(0x81).unwrap().is_usable());
    }

    #[tokio::test]
    async fn test_release_requires_claim() {
        let mock = MockDevice::builder(0x1234, 0x5678).build();
        let device = open(&mock);
        let iface = device.interface(1).unwrap().unwrap();

        assert!(matches!(
            iface.release(false).await,
            Err(UsbError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_release_with_pending_transfers_refused() {
        let mock = MockDevice::builder(0x1234, 0x5678).build();
        let device = open(&mock);
        let iface = device.interface(0).unwrap().unwrap();
        iface.claim().unwrap();

        let ep = iface.endpoint(0x81).unwrap();
        let transfer = ep.make_transfer(Duration::ZERO);
        let future = transfer.submit(BytesMut::zeroed(64)).unwrap();

        assert!(matches!(
            iface.release(false).await,
            Err(UsbError::InvalidState(_))
        ));
        assert!(iface.is_claimed());
        assert!(ep.is_usable());
        assert_eq!(mock.held_count(), 1);

        assert!(transfer.cancel());
        assert!(future.await.is_cancelled());
    }

    #[tokio::test]
    async fn test_release_closing_endpoints_cancels_and_drains() {
        let mock = MockDevice::builder(0x1234, 0x5678).build();
        let device = open(&mock);
        let iface = device.interface(0).unwrap().unwrap();
        iface.claim().unwrap();

        let ep = iface.endpoint(0x81).unwrap();
        let transfer = ep.make_transfer(Duration::ZERO);
        let future = transfer.submit(BytesMut::zeroed(64)).unwrap();

        with_timeout(DEFAULT_TEST_TIMEOUT, iface.release(true))
            .await
            .unwrap()
            .unwrap();

        assert!(future.await.is_cancelled());
        assert_eq!(ep.pending_transfers(), 0);
        assert!(!ep.is_usable());
        assert!(!iface.is_claimed());
        assert_eq!(mock.held_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_release_keeps_claim() {
        let mock = MockDevice::builder(0x1234, 0x5678).build();
        let device = open(&mock);
        let iface = device.interface(0).unwrap().unwrap();
        iface.claim().unwrap();

        mock.fail_operation(MockOp::ReleaseInterface, Some(DeviceError::Io));
        assert_eq!(
            iface.release(false).await,
            Err(UsbError::Device(DeviceError::Io))
        );
        assert!(iface.is_claimed());
        assert!(iface.endpoint(0x81).unwrap().is_usable());
    }

    #[tokio::test]
    async fn test_close_invalidates_interfaces() {
        let mock = MockDevice::builder(0x1234, 0x5678).build();
        let mut device = open(&mock);
        let iface = device.interface(0).unwrap().unwrap();
        iface.claim().unwrap();

        device.close();
        assert!(!iface.is_valid());
        assert!(!iface.is_claimed());
        assert!(matches!(iface.claim(), Err(UsbError::InvalidState(_))));
    }
}

mod alt_settings {
    use super::*;

    #[tokio::test]
    async fn test_switch_rebuilds_endpoints() {
        let mock = MockDevice::builder(0x1234, 0x5678).build();
        let device = open(&mock);
        let iface = device.interface(0).unwrap().unwrap();
        iface.claim().unwrap();

        assert_eq!(iface.alt_settings().len(), 2);
        let old = iface.endpoint(0x81).unwrap();

        iface.set_alt_setting(1).await.unwrap();
        assert_eq!(iface.alt_setting(), 1);
        assert_eq!(mock.alt_setting(0), Some(1));

        let addresses: Vec<u8> = iface.endpoints().iter().map(|ep| ep.address()).collect();
        assert_eq!(addresses, vec![0x83]);
        assert!(iface.endpoint(0x81).is_none());
        assert!(iface.endpoint(0x83).unwrap().is_usable());

        assert!(!old.is_usable());
        assert!(matches!(
            old.as_in().unwrap().transfer(8).await,
            Err(UsbError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_alt_setting_rejected() {
        let mock = MockDevice::builder(0x1234, 0x5678).build();
        let device = open(&mock);
        let iface = device.interface(0).unwrap().unwrap();
        iface.claim().unwrap();

        assert!(matches!(
            iface.set_alt_setting(7).await,
            Err(UsbError::InvalidArgument(_))
        ));
        assert_eq!(iface.alt_setting(), 0);
        assert_eq!(mock.alt_setting(0), None);
    }

    #[tokio::test]
    async fn test_alt_setting_requires_claim() {
        let mock = MockDevice::builder(0x1234, 0x5678).build();
        let device = open(&mock);
        let iface = device.interface(0).unwrap().unwrap();

        assert!(matches!(
            iface.set_alt_setting(1).await,
            Err(UsbError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_switch_changes_nothing() {
        let mock = MockDevice::builder(0x1234, 0x5678).build();
        let device = open(&mock);
        let iface = device.interface(0).unwrap().unwrap();
        iface.claim().unwrap();
        mock.fail_operation(MockOp::SetAlternateSetting, Some(DeviceError::Stall));

        let result = iface.set_alt_setting(1).await;
        assert!(matches!(result, Err(ref e) if e.is_stall()));
        assert_eq!(iface.alt_setting(), 0);
        assert!(iface.endpoint(0x81).unwrap().is_usable());
    }

    #[tokio::test]
    async fn test_release_resets_alt_setting() {
        let mock = MockDevice::builder(0x1234, 0x5678).build();
        let device = open(&mock);
        let iface = device.interface(0).unwrap().unwrap();
        iface.claim().unwrap();
        iface.set_alt_setting(1).await.unwrap();

        iface.release(false).await.unwrap();
        assert_eq!(iface.alt_setting(), 0);
        assert!(iface.endpoint(0x81).is_some());
    }
}

mod kernel_driver {
    use super::*;

    #[test]
    fn test_detach_and_reattach() {
        let mock = MockDevice::builder(0x1234, 0x5678).kernel_driver(0).build();
        let device = open(&mock);
        let iface = device.interface(0).unwrap().unwrap();

        assert!(iface.is_kernel_driver_active().unwrap());
        iface.detach_kernel_driver().unwrap();
        assert!(!iface.is_kernel_driver_active().unwrap());

        assert!(iface.detach_kernel_driver().unwrap_err().is_not_found());

        iface.attach_kernel_driver().unwrap();
        assert!(iface.is_kernel_driver_active().unwrap());
        assert_eq!(
            iface.attach_kernel_driver(),
            Err(UsbError::Device(DeviceError::Busy))
        );
    }

    #[test]
    fn test_no_driver_bound() {
        let mock = MockDevice::builder(0x1234, 0x5678).build();
        let device = open(&mock);
        let iface = device.interface(1).unwrap().unwrap();

        assert!(!iface.is_kernel_driver_active().unwrap());
    }
}
