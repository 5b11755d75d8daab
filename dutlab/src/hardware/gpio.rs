//! GPIO interface over sysfs

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::debug;

use crate::errors::LabError;

/// GPIO pin mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinMode {
    Input,
    Output,
}

impl PinMode {
    fn as_sysfs(&self) -> &'static str {
        match self {
            PinMode::Input => "in",
            PinMode::Output => "out",
        }
    }
}

/// GPIO pin state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinState {
    Low,
    High,
}

impl From<bool> for PinState {
    fn from(value: bool) -> Self {
        if value {
            PinState::High
        } else {
            PinState::Low
        }
    }
}

impl From<PinState> for bool {
    fn from(state: PinState) -> Self {
        matches!(state, PinState::High)
    }
}

impl PinState {
    fn as_sysfs(&self) -> &'static str {
        match self {
            PinState::Low => "0",
            PinState::High => "1",
        }
    }
}

/// sysfs GPIO controller rooted at e.g. `/sys/class/gpio`
#[derive(Debug, Clone)]
pub struct Gpio {
    base: PathBuf,
}

impl Gpio {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Directory of a pin; accepts both `48` and `gpio48`
    pub fn pin_dir(&self, pin: &str) -> PathBuf {
        if pin.starts_with("gpio") {
            self.base.join(pin)
        } else {
            self.base.join(format!("gpio{}", pin))
        }
    }

    /// Export a pin if needed and set its direction and initial value
    pub async fn export(&self, pin: &str, mode: PinMode, initial: PinState) -> Result<(), LabError> {
        let pin_dir = self.pin_dir(pin);
        if fs::metadata(&pin_dir).await.is_err() {
            let number = pin.trim_start_matches("gpio");
            fs::write(self.base.join("export"), number).await?;
        }

        fs::write(pin_dir.join("direction"), mode.as_sysfs()).await?;
        if mode == PinMode::Output {
            fs::write(pin_dir.join("value"), initial.as_sysfs()).await?;
        }
        debug!("Exported GPIO {} as {:?}", pin, mode);
        Ok(())
    }

    /// Write a raw value to an exported pin
    pub async fn write_raw(&self, pin: &str, value: &str) -> Result<(), LabError> {
        let value_file = self.pin_dir(pin).join("value");
        if fs::metadata(&value_file).await.is_err() {
            return Err(LabError::DeviceError(format!(
                "GPIO file {} is not found",
                value_file.display()
            )));
        }
        fs::write(&value_file, value).await?;
        Ok(())
    }

    /// Drive an exported pin
    pub async fn write(&self, pin: &str, state: PinState) -> Result<(), LabError> {
        self.write_raw(pin, state.as_sysfs()).await
    }

    /// Read an exported pin
    pub async fn read(&self, pin: &str) -> Result<PinState, LabError> {
        let raw = fs::read_to_string(self.pin_dir(pin).join("value")).await?;
        Ok(PinState::from(raw.trim() != "0"))
    }
}
