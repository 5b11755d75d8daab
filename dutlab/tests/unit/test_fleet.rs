//! Two-tier reservation, dispatch and blacklisting

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use dutlab::app::fleet::{run_fleet, FleetContext};
use dutlab::app::options::FleetOptions;
use dutlab::errors::LabError;
use dutlab::fleet::bridge::with_connection_retry;
use dutlab::fleet::lock::RESERVED_SENTINEL;
use dutlab::fleet::{FleetBridge, FleetLock, LockState};
use dutlab::storage::inventory::FleetMember;
use dutlab::storage::settings::FleetSettings;

use crate::helpers::{RecordingLocal, ScriptedRemote};

fn member(device: &str, device_type: &str, controller_ip: &str) -> FleetMember {
    FleetMember {
        device: device.to_string(),
        device_type: device_type.to_string(),
        controller_ip: controller_ip.to_string(),
        settings: HashMap::new(),
    }
}

fn settings(dir: &Path) -> FleetSettings {
    FleetSettings {
        workspace_nfs_path: dir.to_path_buf(),
        lock_dir: dir.join("lockfiles"),
        sweep_interval_secs: 1,
        connect_backoff_secs: 0,
        ..Default::default()
    }
}

fn bridge(dir: &Path, members: Vec<FleetMember>, remote: Arc<ScriptedRemote>) -> FleetBridge {
    FleetBridge::new(members, settings(dir), remote)
}

#[tokio::test]
async fn test_prelocked_device_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let bridge = bridge(dir.path(), vec![member("pc1", "pc", "10.0.0.11")], Arc::new(ScriptedRemote::default()));
    std::fs::create_dir_all(dir.path().join("lockfiles")).unwrap();
    std::fs::write(dir.path().join("lockfiles").join("pc1"), RESERVED_SENTINEL).unwrap();

    let start = Instant::now();
    let result = bridge
        .reserve_fleet_member("pc1", Duration::from_secs(5), &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(LabError::Timeout(_))));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(4));
    assert!(elapsed <= Duration::from_secs(7));
}

#[tokio::test]
async fn test_unknown_device_name() {
    let dir = tempfile::tempdir().unwrap();
    let bridge = bridge(dir.path(), vec![member("pc1", "pc", "10.0.0.11")], Arc::new(ScriptedRemote::default()));

    let result = bridge
        .reserve_fleet_member("rpi", Duration::from_secs(5), &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(LabError::DeviceName(_))));
}

#[tokio::test]
async fn test_type_selector_skips_busy_member() {
    let dir = tempfile::tempdir().unwrap();
    let bridge = bridge(
        dir.path(),
        vec![member("pc_1", "pc", "10.0.0.11"), member("pc_2", "pc", "10.0.0.12")],
        Arc::new(ScriptedRemote::default()),
    );
    let cancel = CancellationToken::new();

    let mut first = bridge.reserve_fleet_member("pc", Duration::from_secs(1), &cancel).await.unwrap();
    let mut second = bridge.reserve_fleet_member("pc", Duration::from_secs(1), &cancel).await.unwrap();
    assert_eq!(first.member().device, "pc_1");
    assert_eq!(second.member().device, "pc_2");

    first.release().await.unwrap();
    first.release().await.unwrap();
    assert_eq!(FleetLock::new(&dir.path().join("lockfiles"), "pc_1").state().unwrap(), LockState::Free);
    second.release().await.unwrap();
}

#[tokio::test]
async fn test_failed_remote_flash_blacklists() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("core.wic");
    std::fs::write(&image, "image").unwrap();

    let remote = Arc::new(ScriptedRemote::failing());
    let ctx = FleetContext::new(
        bridge(dir.path(), vec![member("pc1", "pc", "10.0.0.11")], remote.clone()),
        Arc::new(RecordingLocal::default()),
    );
    let cancel = CancellationToken::new();

    let options = FleetOptions {
        selector: "pc1".into(),
        image: Some(image),
        reserve_timeout: Some(Duration::from_secs(1)),
        ..Default::default()
    };
    let result = run_fleet(&ctx, options, &cancel).await;
    assert!(matches!(result, Err(LabError::CommandFailed { .. })));

    let lock = std::fs::read_to_string(dir.path().join("lockfiles").join("pc1")).unwrap();
    assert!(lock.starts_with(RESERVED_SENTINEL));
    assert!(lock.len() > RESERVED_SENTINEL.len());
    assert!(remote.commands().iter().any(|c| c.contains("dutlab flash pc")));

    let again = ctx
        .bridge
        .reserve_fleet_member("pc1", Duration::from_secs(1), &cancel)
        .await;
    assert!(matches!(again, Err(LabError::DevicesBlacklisted(_))));
}

#[tokio::test]
async fn test_bad_image_never_blacklists() {
    let dir = tempfile::tempdir().unwrap();
    let outside = tempfile::tempdir().unwrap();
    let stray_image = outside.path().join("core.wic");
    std::fs::write(&stray_image, "image").unwrap();

    let remote = Arc::new(ScriptedRemote::default());
    let ctx = FleetContext::new(
        bridge(dir.path(), vec![member("pc1", "pc", "10.0.0.11")], remote.clone()),
        Arc::new(RecordingLocal::default()),
    );
    let cancel = CancellationToken::new();

    for image in [dir.path().join("typo.wic"), stray_image] {
        let options = FleetOptions {
            selector: "pc1".into(),
            image: Some(image),
            reserve_timeout: Some(Duration::from_secs(1)),
            ..Default::default()
        };
        let result = run_fleet(&ctx, options, &cancel).await;
        assert!(matches!(result, Err(LabError::ImageName(_))));
        assert_eq!(
            FleetLock::new(&dir.path().join("lockfiles"), "pc1").state().unwrap(),
            LockState::Free
        );
    }
    assert!(!remote.commands().iter().any(|c| c.contains(" flash ")));
}

#[tokio::test]
async fn test_stray_processes_are_signalled_by_pid() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(ScriptedRemote::default());
    let ctx = FleetContext::new(
        bridge(dir.path(), vec![member("pc1", "pc", "10.0.0.11")], remote.clone()),
        Arc::new(RecordingLocal::default()),
    );
    let options = FleetOptions {
        selector: "pc1".into(),
        no_flash: true,
        reserve_timeout: Some(Duration::from_secs(1)),
        ..Default::default()
    };

    run_fleet(&ctx, options, &CancellationToken::new()).await.unwrap();

    assert_eq!(
        remote.commands(),
        vec!["10.0.0.11: pkill -INT -f \"[d]utlab\"".to_string()]
    );
}

#[tokio::test]
async fn test_busy_and_blacklisted_members_time_out() {
    let dir = tempfile::tempdir().unwrap();
    let bridge = bridge(
        dir.path(),
        vec![member("pc_1", "pc", "10.0.0.11"), member("pc_2", "pc", "10.0.0.12")],
        Arc::new(ScriptedRemote::default()),
    );
    let lock_dir = dir.path().join("lockfiles");
    std::fs::create_dir_all(&lock_dir).unwrap();
    std::fs::write(lock_dir.join("pc_1"), format!("{}flashing failed\n", RESERVED_SENTINEL)).unwrap();
    std::fs::write(lock_dir.join("pc_2"), RESERVED_SENTINEL).unwrap();

    let start = Instant::now();
    let result = bridge
        .reserve_fleet_member("pc", Duration::from_secs(2), &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(LabError::Timeout(_))));
    assert!(start.elapsed() >= Duration::from_secs(1));

    std::fs::write(lock_dir.join("pc_2"), format!("{}ssh refused\n", RESERVED_SENTINEL)).unwrap();
    let result = bridge
        .reserve_fleet_member("pc", Duration::from_secs(2), &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(LabError::DevicesBlacklisted(_))));
}

#[tokio::test]
async fn test_no_blacklist_releases_after_failure() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("core.wic");
    std::fs::write(&image, "image").unwrap();

    let ctx = FleetContext::new(
        bridge(dir.path(), vec![member("pc1", "pc", "10.0.0.11")], Arc::new(ScriptedRemote::failing())),
        Arc::new(RecordingLocal::default()),
    );
    let cancel = CancellationToken::new();

    let options = FleetOptions {
        selector: "pc1".into(),
        image: Some(image),
        no_blacklist: true,
        reserve_timeout: Some(Duration::from_secs(1)),
        ..Default::default()
    };
    assert!(run_fleet(&ctx, options, &cancel).await.is_err());

    let mut again = ctx
        .bridge
        .reserve_fleet_member("pc1", Duration::from_secs(1), &cancel)
        .await
        .unwrap();
    again.release().await.unwrap();
}

#[tokio::test]
async fn test_flash_and_boot_fixes_routing() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("core.wic");
    std::fs::write(&image, "image").unwrap();

    let remote = Arc::new(ScriptedRemote::saving_ip(dir.path().join("pc"), "192.168.5.23\n"));
    let local = Arc::new(RecordingLocal::default());
    let ctx = FleetContext::new(
        bridge(dir.path(), vec![member("pc1", "pc", "10.0.0.11")], remote.clone()),
        local.clone(),
    );
    let options = FleetOptions {
        selector: "pc".into(),
        image: Some(image),
        boot: true,
        reserve_timeout: Some(Duration::from_secs(1)),
        ..Default::default()
    };

    run_fleet(&ctx, options, &CancellationToken::new()).await.unwrap();

    let dispatched = remote.commands();
    assert!(dispatched
        .iter()
        .any(|c| c.contains("--save-ip") && c.contains("--boot=test_mode")));

    let local = local.commands();
    assert!(local.contains(&"sudo ip route add 192.168.5.0/24 via 10.0.0.11".to_string()));
    assert!(local.iter().any(|c| c.starts_with("ssh-keygen") && c.ends_with("-R 192.168.5.23")));
    assert_eq!(
        FleetLock::new(&dir.path().join("lockfiles"), "pc1").state().unwrap(),
        LockState::Free
    );
}

#[tokio::test]
async fn test_connection_retry_only_on_refused() {
    let cancel = CancellationToken::new();

    let calls = AtomicU32::new(0);
    let refused: Result<(), LabError> = with_connection_retry(3, Duration::ZERO, &cancel, || {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Err(LabError::ConnectionError("ssh: connect to host: Connection refused".into())) }
    })
    .await;
    assert!(refused.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let calls = AtomicU32::new(0);
    let failed: Result<(), LabError> = with_connection_retry(3, Duration::ZERO, &cancel, || {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Err(LabError::DeviceError("flash failed".into())) }
    })
    .await;
    assert!(matches!(failed, Err(LabError::DeviceError(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let calls = AtomicU32::new(0);
    let recovered = with_connection_retry(3, Duration::ZERO, &cancel, || {
        let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            if call < 2 {
                Err(LabError::ConnectionError("Connection refused".into()))
            } else {
                Ok(call)
            }
        }
    })
    .await;
    assert_eq!(recovered.unwrap(), 2);
}
