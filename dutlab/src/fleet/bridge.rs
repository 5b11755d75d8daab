//! Two-tier flashing: reserve a lab controller and drive it over SSH

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::device::BootTarget;
use crate::errors::LabError;
use crate::exec::{ExecOptions, RemoteExec};
use crate::filesys::file::File;
use crate::fleet::lock::{FleetLock, FleetReservation, ReserveOutcome};
use crate::storage::inventory::FleetMember;
use crate::storage::settings::FleetSettings;
use crate::utils::{cancellable, sleep_or_cancel, time_used};

/// Logs the lab controller leaves in the shared working directory
pub const GENERATED_LOG_FILES: &[&str] = &[
    "aft.log",
    "serial.log",
    "ssh.log",
    "kb_emulator.log",
    "serial.log.raw",
];

/// What to ask the lab controller to do
#[derive(Debug, Clone)]
pub struct RemoteFlashRequest {
    /// Image on the shared workspace, front-end path
    pub image: PathBuf,

    /// Front-end working directory; must be on the shared workspace
    pub workdir: PathBuf,

    pub record: bool,
    pub boot: Option<BootTarget>,
    pub save_ip: bool,
    pub emulate_usb: bool,
}

/// A checked request, ready to dispatch
#[derive(Debug, Clone)]
pub struct PreparedFlash {
    command: Vec<String>,
    workdir: PathBuf,
}

impl PreparedFlash {
    pub fn command(&self) -> &[String] {
        &self.command
    }
}

/// Front end of the fleet
pub struct FleetBridge {
    members: Vec<FleetMember>,
    settings: FleetSettings,
    remote: Arc<dyn RemoteExec>,
}

impl FleetBridge {
    pub fn new(members: Vec<FleetMember>, settings: FleetSettings, remote: Arc<dyn RemoteExec>) -> Self {
        Self {
            members,
            settings,
            remote,
        }
    }

    pub fn settings(&self) -> &FleetSettings {
        &self.settings
    }

    pub fn candidates(&self, selector: &str) -> Vec<&FleetMember> {
        self.members.iter().filter(|m| m.matches(selector)).collect()
    }

    fn lock_of(&self, member: &FleetMember) -> FleetLock {
        FleetLock::new(&self.settings.lock_dir, &member.device)
    }

    /// Reserve a lab controller whose device or type matches `selector`.
    pub async fn reserve_fleet_member(
        &self,
        selector: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<FleetReservation, LabError> {
        let start = Instant::now();
        let candidates = self.candidates(selector);
        if candidates.is_empty() {
            return Err(LabError::DeviceName(format!(
                "Device name '{}' was not found in the fleet inventory",
                selector
            )));
        }

        loop {
            let mut all_blacklisted = true;
            for member in &candidates {
                let lock = self.lock_of(member);
                match lock.try_reserve().await? {
                    ReserveOutcome::Reserved => {
                        info!("Reserved {}", member.device);
                        info!("Waiting took: {}", time_used(start));
                        return Ok(FleetReservation::new((*member).clone(), lock));
                    }
                    ReserveOutcome::Busy => {
                        debug!("{} is busy", member.device);
                        all_blacklisted = false;
                    }
                    ReserveOutcome::Blacklisted(reason) => {
                        debug!("{} is blacklisted: {}", member.device, reason);
                    }
                }
            }

            if all_blacklisted {
                return Err(LabError::DevicesBlacklisted(format!(
                    "{} (see {})",
                    selector,
                    self.settings.lock_dir.display()
                )));
            }

            let remaining = timeout.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return Err(LabError::Timeout(format!(
                    "Could not reserve '{}' in {} seconds",
                    selector,
                    timeout.as_secs()
                )));
            }
            sleep_or_cancel(self.settings.sweep_interval().min(remaining), cancel).await?;
        }
    }

    /// `image` as seen by the lab controller
    pub fn remote_image_path(&self, image: &Path) -> Result<String, LabError> {
        let relative = image
            .strip_prefix(&self.settings.workspace_nfs_path)
            .map_err(|_| {
                LabError::ImageName(format!(
                    "{} is not on the shared workspace {}",
                    image.display(),
                    self.settings.workspace_nfs_path.display()
                ))
            })?;
        Ok(remote_join(&self.settings.remote_workspace, relative))
    }

    /// Shell words run on the lab controller
    pub fn remote_command(
        &self,
        member: &FleetMember,
        request: &RemoteFlashRequest,
    ) -> Result<Vec<String>, LabError> {
        let remote_dir = match request.workdir.strip_prefix(&self.settings.workspace_nfs_path) {
            Ok(relative) => remote_join(&self.settings.remote_workspace, relative),
            Err(_) => self.settings.remote_workspace.clone(),
        };

        let mut command = vec![
            "cd".to_string(),
            remote_dir,
            ";".to_string(),
            self.settings.remote_binary.clone(),
            "flash".to_string(),
            member.device_type.to_lowercase(),
            self.remote_image_path(&request.image)?,
        ];
        if request.record {
            command.push("--record".to_string());
        }
        if request.save_ip {
            command.push("--save-ip".to_string());
        }
        if request.emulate_usb {
            command.push("--emulate-usb".to_string());
        }
        if let Some(boot) = request.boot {
            command.push(format!("--boot={}", boot));
        }
        Ok(command)
    }

    /// File the lab controller writes the DUT address into with `--save-ip`
    pub fn ip_file(&self, member: &FleetMember) -> File {
        File::new(
            self.settings
                .workspace_nfs_path
                .join(member.device_type.to_lowercase()),
        )
    }

    /// Check `request` and build the command for `member`.
    ///
    /// Nothing is dispatched yet, so a failure here says nothing about the
    /// lab controller.
    pub async fn prepare_remote_flash(
        &self,
        member: &FleetMember,
        request: &RemoteFlashRequest,
    ) -> Result<PreparedFlash, LabError> {
        if !File::new(&request.image).exists().await {
            return Err(LabError::ImageName(format!(
                "{} doesn't exist.",
                request.image.display()
            )));
        }

        let command = self.remote_command(member, request)?;
        if request.save_ip {
            self.ip_file(member).delete().await?;
        }
        Ok(PreparedFlash {
            command,
            workdir: request.workdir.clone(),
        })
    }

    /// Run the single-tier flash on the reserved lab controller.
    pub async fn run_remote_flash(
        &self,
        reservation: &FleetReservation,
        prepared: &PreparedFlash,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, LabError> {
        let member = reservation.member();

        info!("Executing flashing of DUT");
        let start = Instant::now();
        let words: Vec<&str> = prepared.command.iter().map(String::as_str).collect();
        let options = self.controller_options(timeout);

        let result = with_connection_retry(
            self.settings.connect_retries,
            Duration::from_secs(self.settings.connect_backoff_secs),
            cancel,
            || cancellable(cancel, self.remote.run(&member.controller_ip, &words, &options)),
        )
        .await;

        rename_generated_logs(&prepared.workdir).await;

        let output = result?;
        info!("Flashing took: {}", time_used(start));
        Ok(output)
    }

    /// Interrupt stray single-tier runs left on the lab controller
    pub async fn kill_stray_processes(&self, member: &FleetMember) {
        let command = stray_process_command(&self.settings.remote_binary);
        let words: Vec<&str> = command.iter().map(String::as_str).collect();
        // pkill exits 1 when nothing matched
        let options = self.controller_options(Duration::from_secs(10)).ignoring(1);
        if let Err(e) = self.remote.run(&member.controller_ip, &words, &options).await {
            warn!("Could not stop processes on {}: {}", member.controller_ip, e);
        }
    }

    fn controller_options(&self, timeout: Duration) -> ExecOptions {
        ExecOptions {
            timeout,
            connect_timeout: Duration::from_secs(self.settings.connect_timeout_secs),
            ..Default::default()
        }
    }
}

/// Retry `op` while it fails with a refused connection, `attempts` times in
/// total. Every other failure is returned as is.
pub async fn with_connection_retry<T, F, Fut>(
    attempts: u32,
    backoff: Duration,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, LabError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LabError>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_connection_refused() && attempt < attempts => {
                warn!("Connection refused (attempt {} of {}), retrying", attempt, attempts);
                sleep_or_cancel(backoff, cancel).await?;
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// `[d]utlab`: a pattern that does not match the shell running pkill
pub fn stray_process_pattern(binary: &str) -> String {
    let name = binary.rsplit('/').next().unwrap_or(binary);
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => format!("[{}]{}", first, chars.as_str()),
        None => String::new(),
    }
}

/// Shell words that SIGINT every process whose command line matches the
/// binary. Only the PIDs are signalled.
pub fn stray_process_command(binary: &str) -> Vec<String> {
    vec![
        "pkill".to_string(),
        "-INT".to_string(),
        "-f".to_string(),
        format!("\"{}\"", stray_process_pattern(binary)),
    ]
}

fn remote_join(base: &str, relative: &Path) -> String {
    let relative = relative.display().to_string();
    if relative.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), relative)
    }
}

/// Prefix the lab controller's logs with `flash_` so later runs keep them
pub async fn rename_generated_logs(dir: &Path) {
    for log in GENERATED_LOG_FILES {
        let file = File::new(dir.join(log));
        if file.exists().await {
            if let Err(e) = file.rename_to(&format!("flash_{}", log)).await {
                warn!("Could not rename {}: {}", file.path().display(), e);
            }
        }
    }
}
