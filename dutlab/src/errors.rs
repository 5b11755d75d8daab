//! Error types for dutlab

use std::time::Duration;

use thiserror::Error;

/// Main error type for device reservation, boot and flashing
#[derive(Error, Debug)]
pub enum LabError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Unknown device name: {0}")]
    DeviceName(String),

    #[error("All devices matching '{0}' are blacklisted")]
    DevicesBlacklisted(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Device error: {0}")]
    DeviceError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Image error: {0}")]
    ImageName(String),

    #[error("Flashing failed: {0}")]
    FlashImage(String),

    #[error("Cutter error: {0}")]
    CutterError(String),

    #[error("Keyboard emulator error: {0}")]
    KeyboardError(String),

    #[error("Command '{command}' failed with exit code {code:?}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        output: String,
    },

    #[error("Command '{command}' timed out after {timeout:?}")]
    CommandTimeout { command: String, timeout: Duration },

    #[error("Interrupted")]
    Interrupted,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LabError {
    /// Process exit code for this error category
    pub fn exit_code(&self) -> i32 {
        match self {
            LabError::IoError(_) | LabError::JsonError(_) | LabError::Internal(_) => 1,
            LabError::ConfigError(_) => 2,
            LabError::Timeout(_) => 3,
            LabError::DeviceError(_) | LabError::CutterError(_) | LabError::KeyboardError(_) => 4,
            LabError::DevicesBlacklisted(_) => 5,
            LabError::DeviceName(_) => 6,
            LabError::ImageName(_) => 7,
            LabError::ConnectionError(_) => 8,
            LabError::FlashImage(_) => 9,
            LabError::CommandFailed { .. } | LabError::CommandTimeout { .. } => 10,
            LabError::Interrupted => 130,
        }
    }

    /// Short category name recorded in the final log line
    pub fn kind(&self) -> &'static str {
        match self {
            LabError::IoError(_) => "IoError",
            LabError::JsonError(_) => "JsonError",
            LabError::ConfigError(_) => "ConfigurationError",
            LabError::DeviceName(_) => "DeviceNameError",
            LabError::DevicesBlacklisted(_) => "DevicesBlacklistedError",
            LabError::Timeout(_) => "TimeoutError",
            LabError::DeviceError(_) => "DeviceError",
            LabError::ConnectionError(_) => "ConnectionError",
            LabError::ImageName(_) => "ImageNameError",
            LabError::FlashImage(_) => "FlashImageError",
            LabError::CutterError(_) => "CutterError",
            LabError::KeyboardError(_) => "KeyboardEmulatorError",
            LabError::CommandFailed { .. } => "CommandFailed",
            LabError::CommandTimeout { .. } => "CommandTimeout",
            LabError::Interrupted => "Interrupted",
            LabError::Internal(_) => "InternalError",
        }
    }

    /// True for a user-initiated interrupt; retry loops never swallow these
    pub fn is_interrupt(&self) -> bool {
        matches!(self, LabError::Interrupted)
    }

    /// True when the remote end actively refused the connection
    pub fn is_connection_refused(&self) -> bool {
        match self {
            LabError::ConnectionError(msg) => msg.contains("Connection refused"),
            LabError::CommandFailed { output, .. } => output.contains("Connection refused"),
            _ => false,
        }
    }

    /// Combined output captured from a failed command, if any
    pub fn output(&self) -> Option<&str> {
        match self {
            LabError::CommandFailed { output, .. } => Some(output.as_str()),
            _ => None,
        }
    }
}
