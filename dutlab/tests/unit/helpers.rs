//! Fakes for hardware and remote hosts

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use dutlab::device::{Device, DeviceParts, DeviceTimings};
use dutlab::errors::LabError;
use dutlab::exec::{ExecOptions, LocalExec, RemoteExec};
use dutlab::hardware::cutter::{CutterCalls, MockCutter};
use dutlab::pool::{DeviceFactory, ReservationPool};
use dutlab::storage::catalog::DeviceConfig;
use dutlab::storage::settings::LockScope;

pub const SERVICE_MODE_NAME: &str = "service-os";

/// Remote host whose `/proc/version` reports service mode from the
/// `service_from`-th read on. Every command fails when `failing` is set,
/// and commands containing one of `failing_on` fail regardless.
#[derive(Default)]
pub struct ScriptedRemote {
    pub service_from: Option<usize>,
    pub failing: bool,
    pub failing_on: Vec<String>,
    /// File written when a single-tier flash is dispatched, as `--save-ip` would
    pub saved_ip: Option<(PathBuf, String)>,
    proc_version_reads: AtomicUsize,
    commands: Mutex<Vec<String>>,
}

impl ScriptedRemote {
    pub fn service_from(attempt: usize) -> Self {
        Self {
            service_from: Some(attempt),
            ..Default::default()
        }
    }

    pub fn never_in_service_mode() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Default::default()
        }
    }

    pub fn saving_ip(path: PathBuf, ip: &str) -> Self {
        Self {
            saved_ip: Some((path, ip.to_string())),
            ..Default::default()
        }
    }

    pub fn failing_on(mut self, pattern: &str) -> Self {
        self.failing_on.push(pattern.to_string());
        self
    }

    pub fn proc_version_reads(&self) -> usize {
        self.proc_version_reads.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteExec for ScriptedRemote {
    async fn run(&self, host: &str, command: &[&str], _options: &ExecOptions) -> Result<String, LabError> {
        let line = command.join(" ");
        self.commands.lock().unwrap().push(format!("{}: {}", host, line));

        if self.failing || self.failing_on.iter().any(|p| line.contains(p.as_str())) {
            return Err(LabError::CommandFailed {
                command: line,
                code: Some(1),
                output: "flashing failed".to_string(),
            });
        }

        if let Some((path, ip)) = &self.saved_ip {
            if command.contains(&"flash") {
                std::fs::write(path, ip).unwrap();
            }
        }

        if command == ["cat", "/proc/version"] {
            let read = self.proc_version_reads.fetch_add(1, Ordering::SeqCst) + 1;
            return match self.service_from {
                Some(from) if read >= from => Ok(format!("Linux version 6.6 ({})", SERVICE_MODE_NAME)),
                _ => Ok("Linux version 6.6 (poky)".to_string()),
            };
        }
        Ok(String::new())
    }

    async fn push(&self, _host: &str, _source: &Path, _destination: &str, _options: &ExecOptions) -> Result<String, LabError> {
        Ok(String::new())
    }

    async fn pull(&self, _host: &str, _source: &str, _destination: &Path, _options: &ExecOptions) -> Result<String, LabError> {
        Ok(String::new())
    }
}

/// Local host that accepts every command and remembers it
#[derive(Default)]
pub struct RecordingLocal {
    commands: Mutex<Vec<String>>,
}

impl RecordingLocal {
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl LocalExec for RecordingLocal {
    async fn run(&self, command: &[&str], _timeout: Duration) -> Result<String, LabError> {
        self.commands.lock().unwrap().push(command.join(" "));
        Ok(String::new())
    }
}

/// Millisecond timings so retry loops finish quickly
pub fn fast_timings(retry_attempts: u32) -> DeviceTimings {
    DeviceTimings {
        retry_attempts,
        power_cycle_delay: Duration::from_millis(1),
        boot_timeout: Duration::from_millis(20),
        polling_interval: Duration::from_millis(10),
        image_write_timeout: Duration::from_secs(1),
    }
}

/// Configuration of a mock-cut device whose leases file lives in `dir`
pub fn device_config(dir: &Path, name: &str, model: &str) -> DeviceConfig {
    let leases = dir.join(format!("{}.leases", name));
    std::fs::write(&leases, "1712345678 52:54:00:12:34:56 192.168.30.17 dut *\n").unwrap();

    let settings: HashMap<String, String> = [
        ("cutter_type", "mockcutter".to_string()),
        ("leases_file_name", leases.display().to_string()),
        ("service_mode", SERVICE_MODE_NAME.to_string()),
        ("boot_internal_keystrokes", "boot_internal".to_string()),
        ("boot_usb_keystrokes", "boot_usb".to_string()),
        ("target_device", "/dev/sda".to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();

    DeviceConfig {
        name: name.to_string(),
        model: model.to_string(),
        settings,
    }
}

/// Device wired to a mock cutter and `remote`
pub fn mock_device(config: DeviceConfig, remote: Arc<dyn RemoteExec>, retry_attempts: u32) -> (Device, Arc<CutterCalls>) {
    let cutter = MockCutter::new();
    let calls = cutter.calls();
    let device = Device::new(
        config,
        DeviceParts {
            cutter: Box::new(cutter),
            keyboard: None,
            remote,
            boot_relay: None,
            timings: fast_timings(retry_attempts),
        },
    )
    .unwrap();
    (device, calls)
}

/// Pool of mock devices locking in `lock_dir`
pub fn mock_pool(configs: Vec<DeviceConfig>, lock_dir: &Path, sweep_interval: Duration) -> ReservationPool {
    let remote: Arc<dyn RemoteExec> = Arc::new(ScriptedRemote::service_from(1));
    let factory: DeviceFactory = Arc::new(move |config: &DeviceConfig| {
        Ok(mock_device(config.clone(), remote.clone(), 2).0)
    });
    ReservationPool::new(configs, lock_dir, LockScope::Device, sweep_interval, factory)
}
