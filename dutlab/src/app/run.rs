//! Single-tier sessions on a lab controller

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::app::options::{CutterOptions, FlashOptions, QueryOptions};
use crate::app::tasks::{SessionTasks, DEFAULT_JOIN_TIMEOUT};
use crate::device::{BootRelay, BootTarget, Device, DeviceParts, DeviceTimings};
use crate::errors::LabError;
use crate::exec::{LocalExec, RemoteExec, SshExec, SystemExec};
use crate::filesys::file::File;
use crate::flash::{FlashOrchestrator, PcImageWriter, UsbEmulation};
use crate::hardware::cutter::build_cutter;
use crate::hardware::gpio::Gpio;
use crate::hardware::keyboard::build_keyboard;
use crate::pool::{DeviceFactory, Reservation, ReservationPool};
use crate::recorder::SerialRecorder;
use crate::storage::catalog::{load_device_configs, DeviceConfig};
use crate::storage::layout::StorageLayout;
use crate::storage::settings::LabSettings;
use crate::testplan::{RemoteCommandTests, TestExecutor};
use crate::utils::{generate_uuid, time_used};

/// Where images are loop-mounted for key injection before USB emulation
const USB_IMAGE_MOUNT_POINT: &str = "/mnt/emulated_usb_image";

/// Report written after running the device's test plan
const TEST_REPORT_FILE: &str = "test_report.json";

/// Everything a single-tier session needs from this host
pub struct LabContext {
    pub settings: LabSettings,
    pub pool: ReservationPool,
    pub local: Arc<dyn LocalExec>,
    pub remote: Arc<dyn RemoteExec>,
}

impl LabContext {
    pub fn new(
        settings: LabSettings,
        configs: Vec<DeviceConfig>,
        local: Arc<dyn LocalExec>,
        remote: Arc<dyn RemoteExec>,
    ) -> Self {
        let pool = ReservationPool::new(
            configs,
            settings.lock_dir.clone(),
            settings.lock_scope,
            settings.sweep_interval(),
            device_factory(&settings, remote.clone()),
        );
        Self {
            settings,
            pool,
            local,
            remote,
        }
    }

    /// Load the device catalog and wire up the system executors
    pub async fn load(
        layout: &StorageLayout,
        settings: LabSettings,
        catalog: Option<&Path>,
    ) -> Result<Self, LabError> {
        let catalog_file = catalog
            .map(File::new)
            .unwrap_or_else(|| layout.catalog_file());
        let configs = load_device_configs(
            &layout.platform_file(),
            &catalog_file,
            &settings.serial_log_name,
        )
        .await?;
        info!(
            "Loaded {} device configuration(s) from {}",
            configs.len(),
            catalog_file.path().display()
        );

        let remote: Arc<dyn RemoteExec> =
            Arc::new(SshExec::new(settings.ssh_key.clone()).without_proxy());
        Ok(Self::new(settings, configs, Arc::new(SystemExec), remote))
    }

    fn reserve_timeout(&self, requested: Option<Duration>) -> Duration {
        requested.unwrap_or_else(|| self.settings.reserve_timeout())
    }
}

/// Builds devices with the cutter, keyboard and boot relay their
/// configuration names
pub fn device_factory(settings: &LabSettings, remote: Arc<dyn RemoteExec>) -> DeviceFactory {
    let gpio = Gpio::new(settings.gpio_base.clone());
    let relay_pin = settings.boot_relay_pin.clone();
    let timings = DeviceTimings::from(&settings.timings);

    Arc::new(move |config: &DeviceConfig| {
        let parts = DeviceParts {
            cutter: build_cutter(config, &gpio)?,
            keyboard: build_keyboard(config)?,
            remote: remote.clone(),
            boot_relay: relay_pin
                .as_ref()
                .map(|pin| BootRelay::new(gpio.clone(), pin.clone())),
            timings: timings.clone(),
        };
        Device::new(config.clone(), parts)
    })
}

// ================================= FLASH ======================================== //

/// Reserve a device, then flash, boot and test it as `options` ask.
pub async fn run_flash(
    ctx: &LabContext,
    options: FlashOptions,
    cancel: &CancellationToken,
) -> Result<(), LabError> {
    let span = info_span!("session", id = %generate_uuid(), selector = %options.selector);
    async {
        let start = Instant::now();
        let timeout = ctx.reserve_timeout(options.reserve_timeout);
        let mut reservation = ctx.pool.reserve(&options.selector, timeout, cancel).await?;
        if options.test_plan.is_some() {
            reservation.device_mut().set_test_plan(options.test_plan.clone());
        }

        let mut tasks = SessionTasks::new(cancel, DEFAULT_JOIN_TIMEOUT);
        let result = flash_session(ctx, &options, &mut reservation, &mut tasks, cancel).await;

        tasks.shutdown().await;
        reservation.release();
        match &result {
            Ok(()) => info!("Session finished in {}", time_used(start)),
            Err(e) => error!("Session failed after {}: {}", time_used(start), e),
        }
        result
    }
    .instrument(span)
    .await
}

async fn flash_session(
    ctx: &LabContext,
    options: &FlashOptions,
    reservation: &mut Reservation,
    tasks: &mut SessionTasks,
    cancel: &CancellationToken,
) -> Result<(), LabError> {
    if options.record {
        let recorder = SerialRecorder::from_config(reservation.device().config())?;
        tasks.push("serial recorder", recorder.spawn(tasks.stop_token()));
    }

    let usb = UsbEmulation::new(ctx.local.clone(), reservation.device().leases().path());

    if options.emulate_usb {
        let image = require_image(options.image.as_deref())?;
        usb.inject_key_into_image(
            image,
            &ctx.settings.ssh_public_key,
            Path::new(USB_IMAGE_MOUNT_POINT),
        )
        .await?;
        usb.prepare(Some(image)).await?;
        reservation.device_mut().boot_usb_test_mode(cancel).await?;
    } else {
        if let Err(e) = usb.prepare(None).await {
            warn!("Unable to restore USB gadget: {}", e);
        }

        if !options.no_flash {
            let image = require_image(options.image.as_deref())?;
            let orchestrator =
                FlashOrchestrator::new(Arc::new(PcImageWriter::new(ctx.settings.nfs_folder.clone())));
            let retries = options.flash_retries.unwrap_or(ctx.settings.flash_retries);
            orchestrator.flash(reservation, image, retries, cancel).await?;
        }

        match options.boot {
            Some(BootTarget::TestMode) => {
                reservation.device_mut().boot_internal_test_mode(cancel).await?;
            }
            Some(BootTarget::ServiceMode) => {
                reservation.device_mut().boot_usb_service_mode(cancel).await?;
            }
            None => {}
        }
    }

    if options.save_ip {
        save_ip(ctx, reservation.device(), &options.selector).await?;
    }

    if reservation.device().test_plan().is_some() {
        let report = RemoteCommandTests::default()
            .run(reservation.device(), cancel)
            .await?;
        File::new(TEST_REPORT_FILE).write_json(&report).await?;
        if !report.passed() {
            warn!("{} test(s) failed, see {}", report.failures(), TEST_REPORT_FILE);
        }
    }

    Ok(())
}

fn require_image(image: Option<&Path>) -> Result<&Path, LabError> {
    image.ok_or_else(|| LabError::ImageName("No image given".to_string()))
}

/// File `--save-ip` writes the address of `selector`'s device into
pub fn ip_save_path(settings: &LabSettings, selector: &str) -> PathBuf {
    settings.ip_save_dir.join(selector.to_lowercase())
}

async fn save_ip(ctx: &LabContext, device: &Device, selector: &str) -> Result<(), LabError> {
    let ip = match device.last_known_ip() {
        Some(ip) => ip.to_string(),
        None => device.get_ip().await?.ok_or_else(|| {
            LabError::DeviceError(format!("No IP address to save for {}", device.name()))
        })?,
    };
    let file = File::new(ip_save_path(&ctx.settings, selector));
    file.write_string(&ip).await?;
    info!("Saved {} to {}", ip, file.path().display());
    Ok(())
}

// ================================= QUERY ======================================== //

/// Reserve a device and write its responsive address as `{"IP": ...}`
pub async fn run_query(
    ctx: &LabContext,
    options: QueryOptions,
    cancel: &CancellationToken,
) -> Result<Option<String>, LabError> {
    let timeout = ctx.reserve_timeout(options.reserve_timeout);
    let mut reservation = ctx.pool.reserve(&options.selector, timeout, cancel).await?;

    let result = reservation.device_mut().wait_for_responsive_ip(cancel).await;
    reservation.release();
    let ip = result?;

    File::new(&options.results)
        .write_json(&json!({ "IP": ip }))
        .await?;
    info!(
        "Wrote address of {} to {}",
        options.selector,
        options.results.display()
    );
    Ok(ip)
}

// ================================= CUTTER ======================================= //

/// Switch a device's power directly, without reserving it
pub async fn run_cutter(ctx: &LabContext, options: CutterOptions) -> Result<(), LabError> {
    let config = ctx
        .pool
        .candidates(&options.selector)
        .into_iter()
        .next()
        .ok_or_else(|| {
            LabError::ConfigError(format!("No devices configured for '{}'", options.selector))
        })?;

    let cutter = build_cutter(config, &Gpio::new(ctx.settings.gpio_base.clone()))?;
    if options.power_on {
        info!("Connecting power to {}", config.name);
        cutter.connect().await
    } else {
        info!("Disconnecting power from {}", config.name);
        cutter.disconnect().await
    }
}
