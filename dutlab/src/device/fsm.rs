//! Finite State Machine for one boot-mode entry

use serde::{Deserialize, Serialize};

use crate::device::BootTarget;
use crate::errors::LabError;

/// Boot state of a device during mode entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootState {
    /// Initial state, nothing attempted yet
    PoweredOff,

    /// Power is being cut and restored
    PowerCycling,

    /// Keyboard emulator is typing the boot sequence
    KeystrokeInjection,

    /// Waiting for a leased and responsive address
    AwaitingIp,

    /// Address found, mode not yet checked
    IpAcquired,

    /// Booted into the requested mode
    ModeVerified,

    /// The attempt ended in the wrong mode or failed
    ModeMismatch,
}

/// Boot event
#[derive(Debug, Clone)]
pub enum BootEvent {
    /// Start a new attempt
    PowerCycle,

    /// Power restored; `keystrokes` tells whether a sequence will be typed
    PoweredOn { keystrokes: bool },

    /// Keystroke playback finished
    KeystrokesSent,

    /// A responsive address was found
    IpFound(String),

    /// No responsive address within the boot timeout
    IpTimeout,

    /// Result of the mode marker check
    ModeChecked { matches: bool },

    /// The attempt failed with an error
    AttemptFailed(String),
}

/// Boot-mode FSM
#[derive(Debug, Clone)]
pub struct BootFsm {
    target: BootTarget,
    state: BootState,
    attempts: u32,
    ip: Option<String>,
    error: Option<String>,
}

impl BootFsm {
    pub fn new(target: BootTarget) -> Self {
        Self {
            target,
            state: BootState::PoweredOff,
            attempts: 0,
            ip: None,
            error: None,
        }
    }

    pub fn target(&self) -> BootTarget {
        self.target
    }

    pub fn state(&self) -> BootState {
        self.state
    }

    /// Attempts started so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Address found by the current attempt
    pub fn ip(&self) -> Option<&str> {
        self.ip.as_deref()
    }

    /// Reason the last attempt failed
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: BootEvent) -> Result<BootState, LabError> {
        let new_state = match (self.state, &event) {
            (BootState::PoweredOff | BootState::ModeMismatch, BootEvent::PowerCycle) => {
                self.attempts += 1;
                self.ip = None;
                self.error = None;
                BootState::PowerCycling
            }

            (BootState::PowerCycling, BootEvent::PoweredOn { keystrokes: true }) => {
                BootState::KeystrokeInjection
            }
            (BootState::PowerCycling, BootEvent::PoweredOn { keystrokes: false }) => {
                BootState::AwaitingIp
            }

            (BootState::KeystrokeInjection, BootEvent::KeystrokesSent) => BootState::AwaitingIp,

            (BootState::AwaitingIp, BootEvent::IpFound(ip)) => {
                self.ip = Some(ip.clone());
                BootState::IpAcquired
            }
            (BootState::AwaitingIp, BootEvent::IpTimeout) => {
                self.error = Some("no responsive IP address".to_string());
                BootState::ModeMismatch
            }

            (BootState::IpAcquired, BootEvent::ModeChecked { matches: true }) => {
                BootState::ModeVerified
            }
            (BootState::IpAcquired, BootEvent::ModeChecked { matches: false }) => {
                self.error = Some(format!("device did not boot into {}", self.target));
                BootState::ModeMismatch
            }

            // Post-boot hooks may still fail a verified attempt
            (state, BootEvent::AttemptFailed(err)) if state != BootState::PoweredOff => {
                self.error = Some(err.clone());
                BootState::ModeMismatch
            }

            (state, event) => {
                return Err(LabError::Internal(format!(
                    "Invalid boot transition: {:?} -> {:?}",
                    state, event
                )));
            }
        };

        self.state = new_state;
        Ok(new_state)
    }

    /// Check if another attempt is allowed
    pub fn can_retry(&self, max_attempts: u32) -> bool {
        matches!(self.state, BootState::PoweredOff | BootState::ModeMismatch)
            && self.attempts < max_attempts
    }

    pub fn is_verified(&self) -> bool {
        self.state == BootState::ModeVerified
    }
}
