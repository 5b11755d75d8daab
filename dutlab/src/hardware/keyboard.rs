//! Keyboard emulators that type boot-menu sequences into a DUT

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::errors::LabError;
use crate::exec::local::execute;
use crate::storage::catalog::DeviceConfig;

/// Upper bound for one playback
const PLAYBACK_TIMEOUT: Duration = Duration::from_secs(60);

/// Keyboard emulator capability
#[async_trait]
pub trait KeyboardEmulator: Send + Sync {
    /// Play back the keystroke sequence identified by `sequence`
    async fn send_keystrokes(&self, sequence: &str) -> Result<(), LabError>;

    fn name(&self) -> &str;
}

/// Emulator discriminator, the `keyboard_emulator` setting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyboardKind {
    /// USB gadget HID on the lab controller
    Gadget,
    /// Arduino-based PEM emulator over serial
    Arduino,
}

impl FromStr for KeyboardKind {
    type Err = LabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gadgetkeyboard" | "gadget" => Ok(KeyboardKind::Gadget),
            "arduinokeyboard" | "arduino" => Ok(KeyboardKind::Arduino),
            other => Err(LabError::ConfigError(format!(
                "Unknown keyboard emulator: {}",
                other
            ))),
        }
    }
}

/// Build the emulator named by `keyboard_emulator`, if the device has one
pub fn build_keyboard(config: &DeviceConfig) -> Result<Option<Box<dyn KeyboardEmulator>>, LabError> {
    let kind: KeyboardKind = match config.get("keyboard_emulator") {
        Some(kind) => kind.parse()?,
        None => return Ok(None),
    };

    let emulator = match kind {
        KeyboardKind::Gadget => PlaybackKeyboard {
            name: "GadgetKeyboard",
            command: vec![
                config.get("gadget_command").unwrap_or("gadget_keyboard").to_string(),
                "--device".to_string(),
                config.get("hid_device").unwrap_or("/dev/hidg0").to_string(),
                "--playback".to_string(),
            ],
        },
        KeyboardKind::Arduino => PlaybackKeyboard {
            name: "ArduinoKeyboard",
            command: vec![
                config.get("pem_command").unwrap_or("pem").to_string(),
                "--interface".to_string(),
                config.get("pem_interface").unwrap_or("serialconnection").to_string(),
                "--port".to_string(),
                config.require("pem_port")?.to_string(),
                "--playback".to_string(),
            ],
        },
    };
    Ok(Some(Box::new(emulator)))
}

/// Emulator driven by an external playback tool; the sequence file is the
/// last argument.
pub struct PlaybackKeyboard {
    name: &'static str,
    command: Vec<String>,
}

#[async_trait]
impl KeyboardEmulator for PlaybackKeyboard {
    async fn send_keystrokes(&self, sequence: &str) -> Result<(), LabError> {
        info!("{} playing back {}", self.name, sequence);
        let mut argv: Vec<&str> = self.command.iter().map(String::as_str).collect();
        argv.push(sequence);

        match execute(&argv, PLAYBACK_TIMEOUT, &[]).await {
            Ok(_) => Ok(()),
            Err(LabError::CommandTimeout { .. }) => Err(LabError::DeviceError(format!(
                "Failed to connect to {} - check the connections, settings and emulator hardware",
                self.name
            ))),
            Err(e) => Err(LabError::KeyboardError(e.to_string())),
        }
    }

    fn name(&self) -> &str {
        self.name
    }
}
