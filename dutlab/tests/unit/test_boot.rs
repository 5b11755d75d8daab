//! Boot-mode entry against scripted hosts

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use dutlab::device::BootTarget;
use dutlab::errors::LabError;

use crate::helpers::{device_config, mock_device, ScriptedRemote};

#[tokio::test]
async fn test_enter_mode_succeeds_on_kth_attempt() {
    let dir = tempfile::tempdir().unwrap();
    for k in 1..=4 {
        let remote = Arc::new(ScriptedRemote::service_from(k));
        let (mut device, calls) = mock_device(device_config(dir.path(), "pc1", "pc"), remote.clone(), 4);

        let ip = device
            .enter_mode(BootTarget::ServiceMode, "boot_usb", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(ip, "192.168.30.17");
        assert_eq!(calls.connects(), k);
        assert_eq!(remote.proc_version_reads(), k);
        assert_eq!(device.last_known_ip(), Some("192.168.30.17"));
    }
}

#[tokio::test]
async fn test_enter_mode_exhausts_retries() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(ScriptedRemote::never_in_service_mode());
    let (mut device, calls) = mock_device(device_config(dir.path(), "pc1", "pc"), remote.clone(), 3);

    let result = device.boot_usb_service_mode(&CancellationToken::new()).await;

    assert!(matches!(result, Err(LabError::DeviceError(_))));
    assert_eq!(calls.connects(), 3);
    assert_eq!(calls.disconnects(), 3);
    assert_eq!(remote.proc_version_reads(), 3);
}

#[tokio::test]
async fn test_test_mode_is_the_absence_of_the_marker() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(ScriptedRemote::never_in_service_mode());
    let (mut device, calls) = mock_device(device_config(dir.path(), "pc1", "pc"), remote, 4);

    device
        .boot_internal_test_mode(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(calls.connects(), 1);
}

#[tokio::test]
async fn test_no_lease_counts_as_failed_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let config = device_config(dir.path(), "pc1", "pc");
    std::fs::write(config.get("leases_file_name").unwrap(), "").unwrap();
    let remote = Arc::new(ScriptedRemote::service_from(1));
    let (mut device, calls) = mock_device(config, remote.clone(), 2);

    let result = device.boot_usb_service_mode(&CancellationToken::new()).await;

    assert!(matches!(result, Err(LabError::DeviceError(_))));
    assert_eq!(calls.connects(), 2);
    assert_eq!(remote.proc_version_reads(), 0);
}

#[tokio::test]
async fn test_interrupt_is_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(ScriptedRemote::never_in_service_mode());
    let (mut device, calls) = mock_device(device_config(dir.path(), "pc1", "pc"), remote, 4);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = device.boot_usb_service_mode(&cancel).await;

    assert!(matches!(result, Err(LabError::Interrupted)));
    assert!(calls.connects() <= 1);
}

#[tokio::test]
async fn test_service_mode_restores_harness_route() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(ScriptedRemote::service_from(1));
    let (mut device, _) = mock_device(device_config(dir.path(), "pc1", "pc"), remote.clone(), 1);

    device.boot_usb_service_mode(&CancellationToken::new()).await.unwrap();

    let commands = remote.commands();
    assert!(commands
        .iter()
        .any(|c| c == "192.168.30.17: ping -c 1 192.168.30.1"));
}
