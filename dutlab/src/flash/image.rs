//! Writing images onto PC-like devices booted into their service OS

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::device::Device;
use crate::errors::LabError;
use crate::exec::ExecOptions;
use crate::filesys::file::File;
use crate::flash::orchestrator::ImageWriter;
use crate::utils::cancellable;

/// Where the service OS mounts the harness NFS export
pub const IMG_NFS_MOUNT_POINT: &str = "/mnt/img_data_nfs";
/// Where the flashed root filesystem is mounted for key injection
pub const ROOT_PARTITION_MOUNT_POINT: &str = "/mnt/target_root/";
/// Outer mount of a `.hddimg` container
pub const SUPER_ROOT_MOUNT_POINT: &str = "/mnt/super_target_root/";

/// mount(8): already mounted
const ALREADY_MOUNTED: i32 = 32;

const STEP_TIMEOUT: Duration = Duration::from_secs(60);

/// Boots the device into service mode and writes the image with bmaptool
#[derive(Debug, Clone)]
pub struct PcImageWriter {
    nfs_folder: PathBuf,
}

impl PcImageWriter {
    pub fn new(nfs_folder: impl Into<PathBuf>) -> Self {
        Self {
            nfs_folder: nfs_folder.into(),
        }
    }

    /// Path of `image` as seen by the service OS
    pub fn nfs_path(&self, image: &Path) -> Result<String, LabError> {
        let relative = image.strip_prefix(&self.nfs_folder).map_err(|_| {
            LabError::ImageName(format!(
                "Image {} is not below the NFS folder {}",
                image.display(),
                self.nfs_folder.display()
            ))
        })?;
        Ok(Path::new(IMG_NFS_MOUNT_POINT).join(relative).display().to_string())
    }

    async fn write(&self, device: &Device, image: &Path, nfs_image: &str) -> Result<(), LabError> {
        info!("Mounting the nfs containing the image to flash.");
        run(device, &["mount", IMG_NFS_MOUNT_POINT], STEP_TIMEOUT, &[ALREADY_MOUNTED]).await?;

        info!("Writing {} to internal storage.", nfs_image);
        let target = device.target_device();
        let mut bmap_args = vec!["bmaptool", "copy", nfs_image, target];
        if File::new(bmap_path(image)).exists().await {
            info!("Found {}.bmap. Using bmap for flashing.", image.display());
        } else {
            info!("Didn't find {}.bmap. Flashing without it.", image.display());
            bmap_args.insert(2, "--nobmap");
        }
        run(device, &bmap_args, device.timings().image_write_timeout, &[]).await?;

        // Rewriting the same image re-creates the by-partuuid links
        // asynchronously; this sequence settles them.
        info!("Partprobing.");
        for step in [
            vec!["partprobe", target],
            vec!["sync"],
            vec!["udevadm", "trigger"],
            vec!["udevadm", "settle"],
            vec!["udevadm", "control", "-S"],
        ] {
            run(device, &step, STEP_TIMEOUT, &[]).await?;
        }
        Ok(())
    }

    /// Root partition from the disk layout sidecar, or found by probing
    async fn root_partition(&self, device: &Device, image: &Path) -> Result<String, LabError> {
        let layout = File::new(layout_path(image));
        if !layout.exists().await {
            info!(
                "Disk layout file {} doesn't exist. Finding root partition.",
                layout.path().display()
            );
            return find_root_partition(device).await;
        }

        let disk_layout: Map<String, Value> = layout.read_json().await?;
        rootfs_by_partuuid(&disk_layout).ok_or_else(|| {
            LabError::FlashImage(format!(
                "No rootfs partition in {}",
                layout.path().display()
            ))
        })
    }

    async fn mount_root(&self, device: &Device, image: &Path, hddimg: bool) -> Result<(), LabError> {
        if hddimg {
            info!("Mounting two layers.");
            run(device, &["modprobe", "vfat"], STEP_TIMEOUT, &[]).await?;
            run(device, &["mount", device.target_device(), SUPER_ROOT_MOUNT_POINT], STEP_TIMEOUT, &[]).await?;
            let rootfs = format!("{}rootfs.img", SUPER_ROOT_MOUNT_POINT);
            run(device, &["mount", &rootfs, ROOT_PARTITION_MOUNT_POINT], STEP_TIMEOUT, &[]).await?;
        } else {
            info!("Mounting one layer.");
            let partition = self.root_partition(device, image).await?;
            run(device, &["mount", &partition, ROOT_PARTITION_MOUNT_POINT], STEP_TIMEOUT, &[]).await?;
        }
        Ok(())
    }

    async fn inject_key(&self, device: &Device) -> Result<(), LabError> {
        let passwd = format!("{}etc/passwd", ROOT_PARTITION_MOUNT_POINT);
        let passwd = run(device, &["cat", &passwd], STEP_TIMEOUT, &[]).await?;
        let home = root_home(&passwd).unwrap_or("home/root");

        info!("Writing ssh-key to device.");
        let ssh_dir = format!("{}{}/.ssh", ROOT_PARTITION_MOUNT_POINT, home);
        run(device, &["mkdir", "-p", &ssh_dir], STEP_TIMEOUT, &[]).await?;
        run(device, &["chmod", "700", &ssh_dir], STEP_TIMEOUT, &[]).await?;

        let authorized_keys = format!("{}/authorized_keys", ssh_dir);
        let appended = async {
            run(device, &["cat", "~/.ssh/authorized_keys", ">>", &authorized_keys], STEP_TIMEOUT, &[]).await?;
            run(device, &["chmod", "600", &authorized_keys], STEP_TIMEOUT, &[]).await?;
            Ok::<(), LabError>(())
        }
        .await;

        if let Err(e) = appended {
            // Images running dropbear have no OpenSSH key store
            info!("Failed ({}), trying to write the ssh-key in dropbear file instead.", e);
            let dropbear = format!("{}var/lib/dropbear/authorized_keys", ROOT_PARTITION_MOUNT_POINT);
            run(device, &["cat", "~/.ssh/authorized_keys", ">>", &dropbear], STEP_TIMEOUT, &[]).await?;
            info!("Success.");
        }
        Ok(())
    }

    async fn unmount(&self, device: &Device, hddimg: bool) -> Result<(), LabError> {
        info!("Flushing.");
        run(device, &["sync"], STEP_TIMEOUT, &[]).await?;
        info!("Unmounting.");
        run(device, &["umount", ROOT_PARTITION_MOUNT_POINT], STEP_TIMEOUT, &[]).await?;
        if hddimg {
            run(device, &["umount", SUPER_ROOT_MOUNT_POINT], STEP_TIMEOUT, &[]).await?;
        }
        Ok(())
    }

    async fn install_public_key(&self, device: &Device, image: &Path) -> Result<(), LabError> {
        let hddimg = is_hddimg(image);
        self.mount_root(device, image, hddimg).await?;

        let injected = self.inject_key(device).await;
        let unmounted = self.unmount(device, hddimg).await;
        if let Err(e) = &unmounted {
            warn!("Unmounting the flashed root filesystem failed: {}", e);
        }
        injected.and(unmounted)
    }
}

#[async_trait]
impl ImageWriter for PcImageWriter {
    async fn write_image(
        &self,
        device: &mut Device,
        image: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), LabError> {
        let image = std::path::absolute(image)?;
        let nfs_image = self.nfs_path(&image)?;

        device.boot_usb_service_mode(cancel).await?;

        let device = &*device;
        cancellable(cancel, async {
            self.write(device, &image, &nfs_image).await?;
            self.install_public_key(device, &image).await
        })
        .await
    }
}

async fn run(
    device: &Device,
    command: &[&str],
    timeout: Duration,
    ignore_codes: &[i32],
) -> Result<String, LabError> {
    let ip = device.last_known_ip().ok_or_else(|| {
        LabError::DeviceError(format!("Device {} has no known IP address", device.name()))
    })?;
    let mut options = ExecOptions::with_timeout(timeout);
    options.ignore_codes.extend_from_slice(ignore_codes);
    device.remote().run(ip, command, &options).await
}

/// Probe the target's partitions for one holding `home/root`
async fn find_root_partition(device: &Device) -> Result<String, LabError> {
    let target = device
        .target_device()
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string();
    let lsblk = run(device, &["lsblk"], STEP_TIMEOUT, &[]).await?;

    for partition in partitions_of(&lsblk, &target) {
        let dev = format!("/dev/{}", partition);
        run(device, &["mount", &dev, ROOT_PARTITION_MOUNT_POINT], STEP_TIMEOUT, &[]).await?;

        let mut files = run(device, &["ls", ROOT_PARTITION_MOUNT_POINT], STEP_TIMEOUT, &[]).await?;
        if files.split_whitespace().any(|f| f == "home") {
            let home = format!("{}home/", ROOT_PARTITION_MOUNT_POINT);
            files = run(device, &["ls", &home], STEP_TIMEOUT, &[]).await?;
        }
        run(device, &["umount", ROOT_PARTITION_MOUNT_POINT], STEP_TIMEOUT, &[]).await?;

        if files.split_whitespace().any(|f| f == "root") {
            return Ok(dev);
        }
    }

    Err(LabError::DeviceError("Couldn't find root partition".to_string()))
}

/// Partition names of `target` in `lsblk` output, e.g. `nvme0n1p2`
pub fn partitions_of(lsblk: &str, target: &str) -> Vec<String> {
    let prefix = format!("{}p", target);
    lsblk
        .split_whitespace()
        .filter(|token| token.contains(&prefix))
        .map(|token| token.chars().filter(|c| c.is_ascii_alphanumeric()).collect())
        .collect()
}

/// `/dev/disk/by-partuuid/<uuid>` of the `rootfs` entry of a disk layout
pub fn rootfs_by_partuuid(layout: &Map<String, Value>) -> Option<String> {
    layout
        .values()
        .filter_map(Value::as_object)
        .find(|partition| partition.get("name").and_then(Value::as_str) == Some("rootfs"))
        .and_then(|partition| partition.get("uuid").and_then(Value::as_str))
        .map(|uuid| format!("/dev/disk/by-partuuid/{}", uuid))
}

/// Home of root from an `etc/passwd`, without the leading slash
pub fn root_home(passwd: &str) -> Option<&str> {
    passwd
        .lines()
        .find(|line| line.starts_with("root:"))
        .and_then(|line| line.split(':').nth(5))
        .map(|home| home.trim().trim_start_matches('/'))
        .filter(|home| !home.is_empty())
}

pub fn is_hddimg(image: &Path) -> bool {
    image.extension().and_then(|e| e.to_str()) == Some("hddimg")
}

pub fn bmap_path(image: &Path) -> PathBuf {
    let mut path = image.as_os_str().to_owned();
    path.push(".bmap");
    PathBuf::from(path)
}

/// `<dir>/<name up to the first dot>-disk-layout.json`
pub fn layout_path(image: &Path) -> PathBuf {
    let name = image
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let stem = name.split('.').next().unwrap_or(name);
    image.with_file_name(format!("{}-disk-layout.json", stem))
}
