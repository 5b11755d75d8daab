//! Image writing on a device booted into its service OS

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use dutlab::errors::LabError;
use dutlab::flash::{ImageWriter, PcImageWriter};

use crate::helpers::{device_config, mock_device, ScriptedRemote};

const ROOT_AUTHORIZED_KEYS: &str = "/mnt/target_root/home/root/.ssh/authorized_keys";
const DROPBEAR_AUTHORIZED_KEYS: &str = "/mnt/target_root/var/lib/dropbear/authorized_keys";

/// Image in `dir` with a disk layout naming its rootfs partition
fn image_in(dir: &Path) -> PathBuf {
    let image = dir.join("core.wic");
    std::fs::write(&image, "image").unwrap();
    std::fs::write(
        dir.join("core-disk-layout.json"),
        r#"{"p1": {"name": "boot", "uuid": "aaaa"}, "p2": {"name": "rootfs", "uuid": "bbbb-cccc"}}"#,
    )
    .unwrap();
    image
}

/// Index of the first dispatched command ending in `command`
fn position(commands: &[String], command: &str) -> usize {
    commands
        .iter()
        .position(|c| c.ends_with(command))
        .unwrap_or_else(|| panic!("'{}' was never run in {:?}", command, commands))
}

async fn write(remote: Arc<ScriptedRemote>, dir: &Path, image: &Path) -> Result<(), LabError> {
    let (mut device, _) = mock_device(device_config(dir, "pc1", "pc"), remote, 2);
    PcImageWriter::new(dir)
        .write_image(&mut device, image, &CancellationToken::new())
        .await
}

#[tokio::test]
async fn test_write_without_bmap_settles_partitions() {
    let dir = tempfile::tempdir().unwrap();
    let image = image_in(dir.path());
    let remote = Arc::new(ScriptedRemote::service_from(1));

    write(remote.clone(), dir.path(), &image).await.unwrap();

    let commands = remote.commands();
    let copy = position(&commands, "bmaptool copy --nobmap /mnt/img_data_nfs/core.wic /dev/sda");
    let settle: Vec<usize> = [
        "partprobe /dev/sda",
        "sync",
        "udevadm trigger",
        "udevadm settle",
        "udevadm control -S",
    ]
    .iter()
    .map(|step| position(&commands[copy..], step) + copy)
    .collect();
    assert!(settle.windows(2).all(|pair| pair[0] < pair[1]), "{:?}", commands);

    let mount = position(&commands, "mount /dev/disk/by-partuuid/bbbb-cccc /mnt/target_root/");
    assert!(mount > settle[4]);
    assert!(position(&commands, "umount /mnt/target_root/") > mount);
    assert!(!commands.iter().any(|c| c.contains(DROPBEAR_AUTHORIZED_KEYS)));
}

#[tokio::test]
async fn test_write_uses_bmap_sidecar() {
    let dir = tempfile::tempdir().unwrap();
    let image = image_in(dir.path());
    std::fs::write(dir.path().join("core.wic.bmap"), "<bmap/>").unwrap();
    let remote = Arc::new(ScriptedRemote::service_from(1));

    write(remote.clone(), dir.path(), &image).await.unwrap();

    let commands = remote.commands();
    position(&commands, "bmaptool copy /mnt/img_data_nfs/core.wic /dev/sda");
    assert!(!commands.iter().any(|c| c.contains("--nobmap")));
}

#[tokio::test]
async fn test_key_falls_back_to_dropbear() {
    let dir = tempfile::tempdir().unwrap();
    let image = image_in(dir.path());
    let remote = Arc::new(ScriptedRemote::service_from(1).failing_on(ROOT_AUTHORIZED_KEYS));

    write(remote.clone(), dir.path(), &image).await.unwrap();

    let commands = remote.commands();
    let openssh = position(&commands, &format!(">> {}", ROOT_AUTHORIZED_KEYS));
    let dropbear = position(&commands, &format!(">> {}", DROPBEAR_AUTHORIZED_KEYS));
    assert!(openssh < dropbear);
    assert!(position(&commands, "umount /mnt/target_root/") > dropbear);
}

#[tokio::test]
async fn test_failed_key_injection_still_unmounts() {
    let dir = tempfile::tempdir().unwrap();
    let image = image_in(dir.path());
    let remote = Arc::new(ScriptedRemote::service_from(1).failing_on("authorized_keys"));

    let result = write(remote.clone(), dir.path(), &image).await;

    assert!(matches!(result, Err(LabError::CommandFailed { .. })));
    let commands = remote.commands();
    let dropbear = position(&commands, &format!(">> {}", DROPBEAR_AUTHORIZED_KEYS));
    assert!(position(&commands, "umount /mnt/target_root/") > dropbear);
}

#[tokio::test]
async fn test_image_outside_nfs_folder() {
    let dir = tempfile::tempdir().unwrap();
    let elsewhere = tempfile::tempdir().unwrap();
    let image = image_in(elsewhere.path());
    let remote = Arc::new(ScriptedRemote::service_from(1));

    let result = write(remote.clone(), dir.path(), &image).await;

    assert!(matches!(result, Err(LabError::ImageName(_))));
    assert!(remote.commands().is_empty());
}
