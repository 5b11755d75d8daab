//! Exclusive reservation of devices out of the configured pool

pub mod lock;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::device::Device;
use crate::errors::LabError;
use crate::storage::catalog::DeviceConfig;
use crate::storage::settings::LockScope;
use crate::utils::sleep_or_cancel;

use lock::HostLock;

/// Builds a fresh [`Device`] for a configuration
pub type DeviceFactory = Arc<dyn Fn(&DeviceConfig) -> Result<Device, LabError> + Send + Sync>;

/// Lock file shared by every device of a host in [`LockScope::Host`]
const HOST_LOCK_NAME: &str = "aft.lock";

/// Pool of configured devices
pub struct ReservationPool {
    configs: Vec<DeviceConfig>,
    lock_dir: PathBuf,
    scope: LockScope,
    sweep_interval: Duration,
    factory: DeviceFactory,
}

impl ReservationPool {
    pub fn new(
        configs: Vec<DeviceConfig>,
        lock_dir: impl Into<PathBuf>,
        scope: LockScope,
        sweep_interval: Duration,
        factory: DeviceFactory,
    ) -> Self {
        Self {
            configs,
            lock_dir: lock_dir.into(),
            scope,
            sweep_interval,
            factory,
        }
    }

    pub fn configs(&self) -> &[DeviceConfig] {
        &self.configs
    }

    /// Configurations whose name or model matches `selector`, in config order
    pub fn candidates(&self, selector: &str) -> Vec<&DeviceConfig> {
        self.configs.iter().filter(|c| c.matches(selector)).collect()
    }

    /// Lock file claimed when reserving `config`
    pub fn lock_path(&self, config: &DeviceConfig) -> PathBuf {
        match self.scope {
            LockScope::Device => self.lock_dir.join(format!("aft_{}.lock", config.name)),
            LockScope::Host => self.lock_dir.join(HOST_LOCK_NAME),
        }
    }

    /// Reserve a device matching `selector`, sweeping every sweep interval
    /// until `timeout` elapses.
    pub async fn reserve(
        &self,
        selector: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Reservation, LabError> {
        let candidates = self.candidates(selector);
        if candidates.is_empty() {
            return Err(LabError::ConfigError(format!(
                "No devices configured for '{}'",
                selector
            )));
        }

        info!(
            "Reserving one of {} device(s) matching '{}'",
            candidates.len(),
            selector
        );
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(reservation) = self.sweep(&candidates)? {
                return Ok(reservation);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            debug!("All devices matching '{}' are busy", selector);
            sleep_or_cancel(self.sweep_interval.min(remaining), cancel).await?;
        }

        Err(LabError::Timeout(format!(
            "Failed to reserve device '{}' in {} seconds",
            selector,
            timeout.as_secs()
        )))
    }

    /// One pass over the candidates; the first free one wins
    fn sweep(&self, candidates: &[&DeviceConfig]) -> Result<Option<Reservation>, LabError> {
        for config in candidates {
            let Some(mut lock) = HostLock::try_acquire(&self.lock_path(config))? else {
                continue;
            };

            match (self.factory)(config) {
                Ok(device) => {
                    info!("Reserved {} ({})", device.name(), device.model());
                    return Ok(Some(Reservation {
                        device,
                        lock: Some(lock),
                    }));
                }
                Err(e) => {
                    lock.release();
                    return Err(e);
                }
            }
        }
        Ok(None)
    }

    /// Release `reservation`; a no-op when already released
    pub fn release(&self, reservation: &mut Reservation) {
        reservation.release();
    }

    /// Reserve, run `f` and release on every exit path
    pub async fn with_reservation<T, F>(
        &self,
        selector: &str,
        timeout: Duration,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<T, LabError>
    where
        F: for<'a> FnOnce(&'a mut Reservation) -> BoxFuture<'a, Result<T, LabError>>,
    {
        let mut reservation = self.reserve(selector, timeout, cancel).await?;
        let result = f(&mut reservation).await;
        reservation.release();
        result
    }
}

/// A reserved device together with its lock. Dropping releases the lock.
#[derive(Debug)]
pub struct Reservation {
    device: Device,
    lock: Option<HostLock>,
}

impl Reservation {
    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut Device {
        &mut self.device
    }

    pub fn is_released(&self) -> bool {
        self.lock.as_ref().map(|l| !l.is_held()).unwrap_or(true)
    }

    /// Release the claim. Releasing twice is a no-op.
    pub fn release(&mut self) {
        if let Some(mut lock) = self.lock.take() {
            lock.release();
            info!("Released {}", self.device.name());
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.lock.is_some() {
            warn!("Reservation of {} dropped without release", self.device.name());
            self.release();
        }
    }
}
