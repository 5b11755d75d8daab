//! Devices under test and their boot-mode state machine

pub mod fsm;
pub mod leases;

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::errors::LabError;
use crate::exec::{ExecOptions, RemoteExec};
use crate::hardware::cutter::PowerCutter;
use crate::hardware::gpio::{Gpio, PinState};
use crate::hardware::keyboard::KeyboardEmulator;
use crate::storage::catalog::DeviceConfig;
use crate::storage::settings::TimingSettings;
use crate::utils::{cancellable, sleep_or_cancel};

use fsm::{BootEvent, BootFsm};
use leases::LeasesFile;

/// Harness static address, as seen from the DUT network
pub const HARNESS_STATIC_IP: &str = "192.168.30.1";
/// Lab controller static address on the DUT network
pub const CONTROLLER_STATIC_IP: &str = "192.168.7.1";
/// Harness network
pub const HARNESS_NETWORK: &str = "192.168.30.0/24";

/// Boot profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootTarget {
    TestMode,
    ServiceMode,
}

impl fmt::Display for BootTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootTarget::TestMode => write!(f, "test_mode"),
            BootTarget::ServiceMode => write!(f, "service_mode"),
        }
    }
}

impl FromStr for BootTarget {
    type Err = LabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "test_mode" => Ok(BootTarget::TestMode),
            "service_mode" => Ok(BootTarget::ServiceMode),
            other => Err(LabError::ConfigError(format!("Bad boot target: {}", other))),
        }
    }
}

/// Timings used while entering a mode
#[derive(Debug, Clone)]
pub struct DeviceTimings {
    pub retry_attempts: u32,
    pub power_cycle_delay: Duration,
    pub boot_timeout: Duration,
    pub polling_interval: Duration,
    pub image_write_timeout: Duration,
}

impl From<&TimingSettings> for DeviceTimings {
    fn from(settings: &TimingSettings) -> Self {
        Self {
            retry_attempts: settings.retry_attempts,
            power_cycle_delay: Duration::from_secs(settings.power_cycle_delay_secs),
            boot_timeout: Duration::from_secs(settings.boot_timeout_secs),
            polling_interval: Duration::from_secs(settings.polling_interval_secs),
            image_write_timeout: Duration::from_secs(settings.image_write_timeout_secs),
        }
    }
}

impl Default for DeviceTimings {
    fn default() -> Self {
        Self::from(&TimingSettings::default())
    }
}

/// Boot-select relay: high selects service mode, low selects test mode
#[derive(Debug, Clone)]
pub struct BootRelay {
    gpio: Gpio,
    pin: String,
}

impl BootRelay {
    pub fn new(gpio: Gpio, pin: impl Into<String>) -> Self {
        Self {
            gpio,
            pin: pin.into(),
        }
    }

    /// Best effort; failures are logged only
    pub async fn select(&self, target: BootTarget) {
        info!("Setting boot relay in {}", target);
        let state = PinState::from(target == BootTarget::ServiceMode);
        if let Err(e) = self.gpio.write(&self.pin, state).await {
            warn!("Unable to set boot relay: {}", e);
        }
    }
}

/// Hardware and channels a [`Device`] is built from
pub struct DeviceParts {
    pub cutter: Box<dyn PowerCutter>,
    pub keyboard: Option<Box<dyn KeyboardEmulator>>,
    pub remote: Arc<dyn RemoteExec>,
    pub boot_relay: Option<BootRelay>,
    pub timings: DeviceTimings,
}

/// A device under test, built fresh for each reservation
pub struct Device {
    config: DeviceConfig,
    cutter: Box<dyn PowerCutter>,
    keyboard: Option<Box<dyn KeyboardEmulator>>,
    remote: Arc<dyn RemoteExec>,
    boot_relay: Option<BootRelay>,
    timings: DeviceTimings,
    leases: LeasesFile,
    service_mode_name: String,
    boot_internal_keystrokes: String,
    boot_usb_keystrokes: String,
    target_device: String,
    last_known_ip: Option<String>,
    test_plan: Option<String>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.config.name)
            .field("model", &self.config.model)
            .field("last_known_ip", &self.last_known_ip)
            .finish_non_exhaustive()
    }
}

impl Device {
    pub fn new(config: DeviceConfig, parts: DeviceParts) -> Result<Self, LabError> {
        let leases = LeasesFile::new(config.require("leases_file_name")?);
        let service_mode_name = config.require("service_mode")?.to_string();
        let boot_internal_keystrokes = config.require("boot_internal_keystrokes")?.to_string();
        let boot_usb_keystrokes = config.require("boot_usb_keystrokes")?.to_string();
        let target_device = config.require("target_device")?.to_string();
        let test_plan = config.get("test_plan").map(str::to_string);

        Ok(Self {
            config,
            cutter: parts.cutter,
            keyboard: parts.keyboard,
            remote: parts.remote,
            boot_relay: parts.boot_relay,
            timings: parts.timings,
            leases,
            service_mode_name,
            boot_internal_keystrokes,
            boot_usb_keystrokes,
            target_device,
            last_known_ip: None,
            test_plan,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn timings(&self) -> &DeviceTimings {
        &self.timings
    }

    pub fn remote(&self) -> &dyn RemoteExec {
        self.remote.as_ref()
    }

    pub fn cutter(&self) -> &dyn PowerCutter {
        self.cutter.as_ref()
    }

    pub fn leases(&self) -> &LeasesFile {
        &self.leases
    }

    /// Block device the image is written to
    pub fn target_device(&self) -> &str {
        &self.target_device
    }

    pub fn last_known_ip(&self) -> Option<&str> {
        self.last_known_ip.as_deref()
    }

    pub fn test_plan(&self) -> Option<&str> {
        self.test_plan.as_deref()
    }

    pub fn set_test_plan(&mut self, test_plan: Option<String>) {
        self.test_plan = test_plan;
    }

    pub async fn boot_internal_test_mode(&mut self, cancel: &CancellationToken) -> Result<String, LabError> {
        let keystrokes = self.boot_internal_keystrokes.clone();
        self.enter_mode(BootTarget::TestMode, &keystrokes, cancel).await
    }

    pub async fn boot_usb_test_mode(&mut self, cancel: &CancellationToken) -> Result<String, LabError> {
        let keystrokes = self.boot_usb_keystrokes.clone();
        self.enter_mode(BootTarget::TestMode, &keystrokes, cancel).await
    }

    pub async fn boot_usb_service_mode(&mut self, cancel: &CancellationToken) -> Result<String, LabError> {
        let keystrokes = self.boot_usb_keystrokes.clone();
        self.enter_mode(BootTarget::ServiceMode, &keystrokes, cancel).await
    }

    /// Put the device into `target`, retrying up to the configured number of
    /// attempts. Returns the address the device booted with.
    pub async fn enter_mode(
        &mut self,
        target: BootTarget,
        keystrokes: &str,
        cancel: &CancellationToken,
    ) -> Result<String, LabError> {
        let attempts = self.timings.retry_attempts;
        info!("Trying to enter {} up to {} times.", target, attempts);

        let mut fsm = BootFsm::new(target);
        while fsm.can_retry(attempts) {
            fsm.process(BootEvent::PowerCycle)?;

            match self.attempt_mode(&mut fsm, keystrokes, cancel).await {
                Ok(()) if fsm.is_verified() => {
                    let ip = fsm.ip().unwrap_or_default().to_string();
                    info!("Correctly booted {} image - IP: {}", target, ip);
                    return Ok(ip);
                }
                Ok(()) => warn!("Failed entering {}: {}", target, fsm.error().unwrap_or("unknown")),
                Err(e) if e.is_interrupt() => return Err(e),
                Err(e) => {
                    error!("{}: {}", e.kind(), e);
                    fsm.process(BootEvent::AttemptFailed(e.to_string()))?;
                }
            }
        }

        error!("Unable to get the device in mode {}", target);
        Err(LabError::DeviceError(format!(
            "Could not set the device in mode {}",
            target
        )))
    }

    /// One pass through the state machine
    async fn attempt_mode(
        &mut self,
        fsm: &mut BootFsm,
        keystrokes: &str,
        cancel: &CancellationToken,
    ) -> Result<(), LabError> {
        let target = fsm.target();
        if let Some(relay) = &self.boot_relay {
            relay.select(target).await;
        }
        self.power_cycle(cancel).await?;

        fsm.process(BootEvent::PoweredOn {
            keystrokes: self.keyboard.is_some(),
        })?;
        if let Some(keyboard) = &self.keyboard {
            info!("Using {} to send keyboard sequence {}", keyboard.name(), keystrokes);
            cancellable(cancel, keyboard.send_keystrokes(keystrokes)).await?;
            fsm.process(BootEvent::KeystrokesSent)?;
        } else {
            warn!("No keyboard emulator defined for the device");
        }

        let ip = leases::wait_for_responsive_ip(
            &self.leases,
            self.remote.as_ref(),
            self.timings.boot_timeout,
            self.timings.polling_interval,
            cancel,
        )
        .await?;
        self.last_known_ip = ip.clone();
        let Some(ip) = ip else {
            fsm.process(BootEvent::IpTimeout)?;
            return Ok(());
        };
        fsm.process(BootEvent::IpFound(ip.clone()))?;

        let in_service_mode = cancellable(cancel, self.in_service_mode(&ip)).await?;
        let matches = in_service_mode == (target == BootTarget::ServiceMode);
        if fsm.process(BootEvent::ModeChecked { matches })? == fsm::BootState::ModeVerified {
            cancellable(cancel, self.post_boot_hooks(target)).await?;
        }
        Ok(())
    }

    /// Look for the service-mode marker in `/proc/version`
    async fn in_service_mode(&self, ip: &str) -> Result<bool, LabError> {
        let output = self
            .remote
            .run(ip, &["cat", "/proc/version"], &ExecOptions::default())
            .await
            .map_err(|e| {
                warn!("Failed verifying the device mode: {}", e);
                e
            })?;

        let found = output.contains(&self.service_mode_name);
        info!(
            "{} {} in DUT /proc/version",
            if found { "Found" } else { "Didn't find" },
            self.service_mode_name
        );
        Ok(found)
    }

    async fn post_boot_hooks(&self, target: BootTarget) -> Result<(), LabError> {
        if target == BootTarget::ServiceMode {
            self.fix_harness_route().await?;
        }
        Ok(())
    }

    /// Routes are flushed on reboot; restore the one back to the harness
    async fn fix_harness_route(&self) -> Result<(), LabError> {
        let harness_ip = self.config.get("harness_static_ip").unwrap_or(HARNESS_STATIC_IP);
        info!("Trying to ping {}", harness_ip);
        match self.execute(&["ping", "-c", "1", harness_ip], Duration::from_secs(10)).await {
            Ok(_) => Ok(()),
            Err(LabError::CommandFailed { .. }) => {
                info!("Ping failed, adding a route via the lab controller to the harness");
                let network = self.config.get("harness_network").unwrap_or(HARNESS_NETWORK);
                let gateway = self
                    .config
                    .get("controller_static_ip")
                    .unwrap_or(CONTROLLER_STATIC_IP);
                self.execute(&["ip", "route", "add", network, "via", gateway], Duration::from_secs(30))
                    .await?;
                info!("Successfully added route to the harness");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Cut power, wait for the settle delay, restore power
    pub async fn power_cycle(&self, cancel: &CancellationToken) -> Result<(), LabError> {
        self.detach().await?;
        sleep_or_cancel(self.timings.power_cycle_delay, cancel).await?;
        self.attach().await
    }

    pub async fn detach(&self) -> Result<(), LabError> {
        self.cutter.disconnect().await
    }

    pub async fn attach(&self) -> Result<(), LabError> {
        self.cutter.connect().await
    }

    /// Current responsive address, looked up afresh
    pub async fn get_ip(&self) -> Result<Option<String>, LabError> {
        leases::responsive_ip(&self.leases, self.remote.as_ref()).await
    }

    /// Wait for an address the way mode entry does, without power cycling
    pub async fn wait_for_responsive_ip(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, LabError> {
        let ip = leases::wait_for_responsive_ip(
            &self.leases,
            self.remote.as_ref(),
            self.timings.boot_timeout,
            self.timings.polling_interval,
            cancel,
        )
        .await?;
        self.last_known_ip = ip.clone();
        Ok(ip)
    }

    async fn address(&self) -> Result<String, LabError> {
        if let Some(ip) = &self.last_known_ip {
            return Ok(ip.clone());
        }
        self.get_ip().await?.ok_or_else(|| {
            LabError::DeviceError(format!("Device {} has no responsive IP address", self.name()))
        })
    }

    /// Run a command on the device
    pub async fn execute(&self, command: &[&str], timeout: Duration) -> Result<String, LabError> {
        let ip = self.address().await?;
        self.remote
            .run(&ip, command, &ExecOptions::with_timeout(timeout))
            .await
    }

    /// Copy a local file onto the device
    pub async fn push(&self, source: &Path, destination: &str) -> Result<(), LabError> {
        let ip = self.address().await?;
        self.remote
            .push(&ip, source, destination, &ExecOptions::default())
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boot_target_round_trip() {
        assert_eq!("service_mode".parse::<BootTarget>().unwrap(), BootTarget::ServiceMode);
        assert_eq!(BootTarget::TestMode.to_string(), "test_mode");
        assert!("usb_mode".parse::<BootTarget>().is_err());
    }

    #[test]
    fn test_timings_from_settings() {
        let timings = DeviceTimings::default();
        assert_eq!(timings.retry_attempts, 4);
        assert_eq!(timings.power_cycle_delay, Duration::from_secs(10));
        assert_eq!(timings.boot_timeout, Duration::from_secs(240));
    }
}
