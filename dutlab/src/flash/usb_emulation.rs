//! USB mass-storage emulation of an image through libcomposite

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::errors::LabError;
use crate::exec::LocalExec;
use crate::filesys::file::File;

const SERVICE_TIMEOUT: Duration = Duration::from_secs(60);

/// Controls the gadget serving an image to the DUT as a USB stick
#[derive(Clone)]
pub struct UsbEmulation {
    local: Arc<dyn LocalExec>,
    leases: File,
}

impl UsbEmulation {
    pub fn new(local: Arc<dyn LocalExec>, leases_file: impl Into<PathBuf>) -> Self {
        Self {
            local,
            leases: File::new(leases_file),
        }
    }

    pub async fn libcomposite_running(&self) -> bool {
        self.local
            .run(
                &["systemctl", "is-active", "--quiet", "libcomposite.service"],
                SERVICE_TIMEOUT,
            )
            .await
            .is_ok()
    }

    /// Emulate `image`, or restore the regular gadget when `image` is `None`
    /// and the gadget service is down.
    pub async fn prepare(&self, image: Option<&Path>) -> Result<(), LabError> {
        let running = self.libcomposite_running().await;
        match image {
            Some(image) => self.start(image, running).await,
            None if !running => self.stop().await,
            None => Ok(()),
        }
    }

    async fn start(&self, image: &Path, running: bool) -> Result<(), LabError> {
        if running {
            self.local
                .run(&["systemctl", "stop", "libcomposite.service"], SERVICE_TIMEOUT)
                .await?;
        }
        self.free_leases().await?;

        let image = std::path::absolute(image)?;
        if !File::new(&image).exists().await {
            return Err(LabError::ImageName(format!(
                "Image file {} doesn't exist",
                image.display()
            )));
        }

        let image = image.display().to_string();
        self.local.run(&["start_libcomposite", &image], SERVICE_TIMEOUT).await?;
        info!("Started USB mass storage emulation using {}", image);
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), LabError> {
        self.free_leases().await?;
        self.local.run(&["stop_libcomposite"], SERVICE_TIMEOUT).await?;
        self.local
            .run(&["systemctl", "start", "libcomposite.service"], SERVICE_TIMEOUT)
            .await?;
        info!("Stopped USB mass storage emulation with an image");
        Ok(())
    }

    /// A stale lease would hand the DUT's old address to the next boot
    async fn free_leases(&self) -> Result<(), LabError> {
        self.local
            .run(&["systemctl", "stop", "dnsmasq.service"], SERVICE_TIMEOUT)
            .await?;
        self.leases.clear().await?;
        self.local
            .run(&["systemctl", "start", "dnsmasq.service"], SERVICE_TIMEOUT)
            .await?;
        info!("Freed dnsmasq leases");
        Ok(())
    }

    /// Append `public_key` to root's `authorized_keys` in every Linux
    /// partition of `image` that has `/home/root`, loop-mounting it at
    /// `mount_dir`.
    pub async fn inject_key_into_image(
        &self,
        image: &Path,
        public_key: &Path,
        mount_dir: &Path,
    ) -> Result<(), LabError> {
        let image = image.display().to_string();
        let fdisk = self.local.run(&["fdisk", "-l", &image], SERVICE_TIMEOUT).await?;
        let (block_size, starts) = linux_partitions(&fdisk);
        let key = File::new(public_key).read_string().await?;

        tokio::fs::create_dir_all(mount_dir).await?;
        let mount = mount_dir.display().to_string();
        for start in starts {
            let options = format!("loop,offset={}", block_size * start);
            self.local
                .run(&["mount", "-o", &options, &image, &mount], SERVICE_TIMEOUT)
                .await?;

            let appended = append_key(mount_dir, &key).await;
            self.local.run(&["umount", &mount], SERVICE_TIMEOUT).await?;
            appended?;
        }
        tokio::fs::remove_dir(mount_dir).await?;
        Ok(())
    }
}

async fn append_key(root: &Path, key: &str) -> Result<(), LabError> {
    if tokio::fs::metadata(root.join("home/root")).await.is_err() {
        return Ok(());
    }
    let authorized_keys = File::new(root.join("home/root/.ssh/authorized_keys"));
    let existing = if authorized_keys.exists().await {
        authorized_keys.read_string().await?
    } else {
        String::new()
    };
    authorized_keys
        .write_string(&format!("{}\n{}", existing, key))
        .await?;
    info!("Injected key into {}", authorized_keys.path().display());
    Ok(())
}

/// Sector size and start sectors of the Linux partitions in `fdisk -l` output
pub fn linux_partitions(fdisk: &str) -> (u64, Vec<u64>) {
    let mut block_size = 512;
    let mut starts = Vec::new();

    for line in fdisk.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if line.contains("Sector size") {
            if let Some(size) = fields.len().checked_sub(2).and_then(|i| fields[i].parse().ok()) {
                block_size = size;
            }
        }
        if line.contains("Linux") {
            if let Some(start) = fields.get(1).and_then(|s| s.parse().ok()) {
                starts.push(start);
            }
        }
    }
    (block_size, starts)
}
