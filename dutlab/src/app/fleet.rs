//! Two-tier sessions driven from the front end

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::app::options::FleetOptions;
use crate::device::BootTarget;
use crate::errors::LabError;
use crate::exec::{LocalExec, RemoteExec, SshExec, SystemExec};
use crate::fleet::{FleetBridge, FleetReservation, RemoteFlashRequest};
use crate::fleet::networking::{fix_dut_routing, rewrite_ssh_keys};
use crate::storage::inventory::load_inventory;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::FleetSettings;
use crate::utils::{format_duration, generate_uuid};

/// What the front end asks of a reserved lab controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FleetMode {
    /// Serve the image over USB and boot from it
    EmulateUsb,

    /// Flash, boot into test mode and fix up routing to the DUT
    FlashAndBoot,

    Flash,

    /// Reserve only
    Reserve,
}

impl FleetMode {
    pub fn of(options: &FleetOptions) -> Self {
        if options.emulate_usb {
            FleetMode::EmulateUsb
        } else if options.boot {
            FleetMode::FlashAndBoot
        } else if options.no_flash {
            FleetMode::Reserve
        } else {
            FleetMode::Flash
        }
    }
}

pub struct FleetContext {
    pub bridge: FleetBridge,
    pub local: Arc<dyn LocalExec>,
}

impl FleetContext {
    pub fn new(bridge: FleetBridge, local: Arc<dyn LocalExec>) -> Self {
        Self { bridge, local }
    }

    pub async fn load(layout: &StorageLayout, settings: FleetSettings) -> Result<Self, LabError> {
        let members = load_inventory(&layout.fleet_inventory_file()).await?;
        info!("Fleet inventory has {} lab controller(s)", members.len());
        let remote: Arc<dyn RemoteExec> = Arc::new(SshExec::new(settings.controller_ssh_key()));
        Ok(Self::new(
            FleetBridge::new(members, settings, remote),
            Arc::new(SystemExec),
        ))
    }

    fn settings(&self) -> &FleetSettings {
        self.bridge.settings()
    }
}

/// Reserve a lab controller and run the single-tier session on it.
///
/// A failed remote run blacklists the controller unless `no_blacklist` is
/// set. Stray remote processes are interrupted on every exit path.
pub async fn run_fleet(
    ctx: &FleetContext,
    options: FleetOptions,
    cancel: &CancellationToken,
) -> Result<(), LabError> {
    let span = info_span!("fleet_session", id = %generate_uuid(), selector = %options.selector);
    async {
        let start = Instant::now();
        let timeout = options
            .reserve_timeout
            .unwrap_or_else(|| ctx.settings().reserve_timeout());
        let mut reservation = ctx
            .bridge
            .reserve_fleet_member(&options.selector, timeout, cancel)
            .await?;

        let result = fleet_session(ctx, &options, &mut reservation, cancel).await;

        if let Err(e) = reservation.release().await {
            warn!("Could not release {}: {}", reservation.member().device, e);
        }
        ctx.bridge.kill_stray_processes(reservation.member()).await;

        let elapsed = format_duration(start.elapsed());
        match &result {
            Ok(()) => info!("Run took {}", elapsed),
            Err(e) => error!("Run failed after {}: {}", elapsed, e),
        }
        result
    }
    .instrument(span)
    .await
}

async fn fleet_session(
    ctx: &FleetContext,
    options: &FleetOptions,
    reservation: &mut FleetReservation,
    cancel: &CancellationToken,
) -> Result<(), LabError> {
    let mode = FleetMode::of(options);
    if mode == FleetMode::Reserve {
        info!("Not flashing {}", reservation.member().device);
        return Ok(());
    }

    // Request errors are the caller's and never blacklist the controller
    let request = remote_request(options, mode)?;
    let prepared = ctx
        .bridge
        .prepare_remote_flash(reservation.member(), &request)
        .await?;
    let timeout = Duration::from_secs(ctx.settings().remote_flash_timeout_secs);

    if let Err(e) = ctx
        .bridge
        .run_remote_flash(reservation, &prepared, timeout, cancel)
        .await
    {
        if !e.is_interrupt() && !options.no_blacklist {
            let reason = format!("{}: {}", e.kind(), e);
            if let Err(blacklist_error) = reservation.blacklist(&reason).await {
                error!("Could not blacklist {}: {}", reservation.member().device, blacklist_error);
            }
        }
        return Err(e);
    }

    if mode == FleetMode::FlashAndBoot {
        let member = reservation.member();
        let ip = ctx.bridge.ip_file(member).read_string().await?;
        let ip = ip.trim();
        info!("{} booted with address {}", member.device, ip);
        fix_dut_routing(ctx.local.as_ref(), ip, &member.controller_ip).await?;
        rewrite_ssh_keys(ctx.local.as_ref(), &ctx.settings().known_hosts(), ip).await;
    }
    Ok(())
}

fn remote_request(options: &FleetOptions, mode: FleetMode) -> Result<RemoteFlashRequest, LabError> {
    let image = options
        .image
        .clone()
        .ok_or_else(|| LabError::ImageName("No image given".to_string()))?;
    let image = std::path::absolute(image)?;
    let workdir: PathBuf = std::env::current_dir()?;

    let boot_and_save = mode == FleetMode::FlashAndBoot;
    Ok(RemoteFlashRequest {
        image,
        workdir,
        record: options.record,
        boot: boot_and_save.then_some(BootTarget::TestMode),
        save_ip: options.save_ip || boot_and_save,
        emulate_usb: mode == FleetMode::EmulateUsb,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fleet_mode_precedence() {
        let mut options = FleetOptions {
            no_flash: true,
            ..Default::default()
        };
        assert_eq!(FleetMode::of(&options), FleetMode::Reserve);
        options.boot = true;
        assert_eq!(FleetMode::of(&options), FleetMode::FlashAndBoot);
        options.emulate_usb = true;
        assert_eq!(FleetMode::of(&options), FleetMode::EmulateUsb);
    }

    #[test]
    fn test_boot_requests_the_address() {
        let options = FleetOptions {
            selector: "pc".into(),
            image: Some(PathBuf::from("/home/tester/workspace/core.wic")),
            boot: true,
            ..Default::default()
        };
        let request = remote_request(&options, FleetMode::of(&options)).unwrap();
        assert_eq!(request.boot, Some(BootTarget::TestMode));
        assert!(request.save_ip);
        assert!(!request.emulate_usb);
    }

    #[test]
    fn test_missing_image() {
        let options = FleetOptions::default();
        assert!(matches!(
            remote_request(&options, FleetMode::Flash),
            Err(LabError::ImageName(_))
        ));
    }
}
