//! Power cutters: relays that connect and disconnect a DUT's power

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::error;

use crate::errors::LabError;
use crate::exec::local::execute;
use crate::hardware::gpio::Gpio;
use crate::storage::catalog::DeviceConfig;

/// Default bound for relay helper commands
const RELAY_TIMEOUT: Duration = Duration::from_secs(5);

/// Power cutter capability
#[async_trait]
pub trait PowerCutter: Send + Sync {
    /// Close the channel (power on)
    async fn connect(&self) -> Result<(), LabError>;

    /// Open the channel (power off)
    async fn disconnect(&self) -> Result<(), LabError>;

    /// Cutter settings, for diagnostics
    fn describe(&self) -> HashMap<String, String>;
}

/// Cutter discriminator, the `cutter_type` setting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CutterKind {
    Gpio,
    UsbRelay,
    Mock,
}

impl FromStr for CutterKind {
    type Err = LabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gpiocutter" | "gpio" => Ok(CutterKind::Gpio),
            "usbrelay" => Ok(CutterKind::UsbRelay),
            "mockcutter" | "mock" => Ok(CutterKind::Mock),
            other => Err(LabError::ConfigError(format!("Unknown cutter type: {}", other))),
        }
    }
}

/// Build the cutter named by the device's `cutter_type` setting
pub fn build_cutter(config: &DeviceConfig, gpio: &Gpio) -> Result<Box<dyn PowerCutter>, LabError> {
    let kind: CutterKind = config.require("cutter_type")?.parse()?;
    let cutter: Box<dyn PowerCutter> = match kind {
        CutterKind::Gpio => Box::new(GpioCutter::from_config(config, gpio.clone())?),
        CutterKind::UsbRelay => Box::new(UsbRelay::from_config(config)?),
        CutterKind::Mock => Box::new(MockCutter::new()),
    };
    Ok(cutter)
}

// ================================= GPIO ====================================== //

/// Relay driven by a GPIO pin
pub struct GpioCutter {
    gpio: Gpio,
    pin: String,
    on_value: u32,
    off_value: u32,
}

impl GpioCutter {
    pub fn new(gpio: Gpio, pin: impl Into<String>, on_value: u32, off_value: u32) -> Self {
        Self {
            gpio,
            pin: pin.into(),
            on_value,
            off_value,
        }
    }

    pub fn from_config(config: &DeviceConfig, gpio: Gpio) -> Result<Self, LabError> {
        let parse = |key: &str| -> Result<u32, LabError> {
            config.require(key)?.trim().parse().map_err(|_| {
                LabError::ConfigError(format!("Device {}: '{}' is not a GPIO value", config.name, key))
            })
        };
        Ok(Self::new(
            gpio,
            config.require("gpio_pin")?,
            parse("gpio_cutter_on")?,
            parse("gpio_cutter_off")?,
        ))
    }

    async fn set(&self, value: u32, what: &str) -> Result<(), LabError> {
        self.gpio
            .write_raw(&self.pin, &value.to_string())
            .await
            .map_err(|e| {
                error!("Unable to set GPIO controlled cutter {}: {}", what, e);
                LabError::CutterError(format!("GPIO {} {}: {}", self.pin, what, e))
            })
    }
}

#[async_trait]
impl PowerCutter for GpioCutter {
    async fn connect(&self) -> Result<(), LabError> {
        self.set(self.on_value, "on").await
    }

    async fn disconnect(&self) -> Result<(), LabError> {
        self.set(self.off_value, "off").await
    }

    fn describe(&self) -> HashMap<String, String> {
        HashMap::from([
            ("type".to_string(), "gpiocutter".to_string()),
            ("gpio_pin".to_string(), self.pin.clone()),
            ("gpio_cutter_on".to_string(), self.on_value.to_string()),
            ("gpio_cutter_off".to_string(), self.off_value.to_string()),
        ])
    }
}

// =============================== USB RELAY =================================== //

/// USB relay switched by an external helper: `<helper> <device> 1|0`
pub struct UsbRelay {
    helper: String,
    device_path: String,
}

impl UsbRelay {
    pub fn from_config(config: &DeviceConfig) -> Result<Self, LabError> {
        Ok(Self {
            helper: config.get("cutter_command").unwrap_or("cutter_on_off").to_string(),
            device_path: config.require("cutter")?.to_string(),
        })
    }

    async fn switch(&self, state: &str) -> Result<(), LabError> {
        execute(&[&self.helper, &self.device_path, state], RELAY_TIMEOUT, &[])
            .await
            .map(|_| ())
            .map_err(|e| LabError::CutterError(format!("USB relay {}: {}", self.device_path, e)))
    }
}

#[async_trait]
impl PowerCutter for UsbRelay {
    async fn connect(&self) -> Result<(), LabError> {
        self.switch("1").await
    }

    async fn disconnect(&self) -> Result<(), LabError> {
        self.switch("0").await
    }

    fn describe(&self) -> HashMap<String, String> {
        HashMap::from([
            ("type".to_string(), "usbrelay".to_string()),
            ("cutter".to_string(), self.device_path.clone()),
        ])
    }
}

// ================================= MOCK ====================================== //

/// Counts of calls made on a [`MockCutter`]
#[derive(Debug, Default)]
pub struct CutterCalls {
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
}

impl CutterCalls {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

/// Cutter without hardware. Records calls.
#[derive(Debug, Default, Clone)]
pub struct MockCutter {
    calls: Arc<CutterCalls>,
}

impl MockCutter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared call counters
    pub fn calls(&self) -> Arc<CutterCalls> {
        self.calls.clone()
    }
}

#[async_trait]
impl PowerCutter for MockCutter {
    async fn connect(&self) -> Result<(), LabError> {
        self.calls.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), LabError> {
        self.calls.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn describe(&self) -> HashMap<String, String> {
        HashMap::from([("type".to_string(), "mockcutter".to_string())])
    }
}
