//! Settings file management

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::logs::LogLevel;

/// How host-local reservation locks are keyed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockScope {
    /// One lock file per device name
    #[default]
    Device,

    /// One lock file for every device attached to this host
    Host,
}

/// Lab-controller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabSettings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Session log file
    #[serde(default = "default_log_file")]
    pub log_file: String,

    /// Directory holding host-local reservation locks
    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,

    /// Lock keying for host-local reservations
    #[serde(default)]
    pub lock_scope: LockScope,

    /// Folder exported over NFS to the service OS; images must live below it
    #[serde(default = "default_nfs_folder")]
    pub nfs_folder: PathBuf,

    /// Serial recording output
    #[serde(default = "default_serial_log_name")]
    pub serial_log_name: String,

    /// Where `--save-ip` writes the DUT address
    #[serde(default = "default_ip_save_dir")]
    pub ip_save_dir: PathBuf,

    /// Private key used for every SSH connection to a DUT
    #[serde(default = "default_ssh_key")]
    pub ssh_key: PathBuf,

    /// Public key injected into flashed images
    #[serde(default = "default_ssh_public_key")]
    pub ssh_public_key: PathBuf,

    /// sysfs GPIO root
    #[serde(default = "default_gpio_base")]
    pub gpio_base: PathBuf,

    /// GPIO pin driving the boot-select relay; `None` disables it
    #[serde(default = "default_boot_relay_pin")]
    pub boot_relay_pin: Option<String>,

    /// Pause between reservation sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Give up reserving after this long
    #[serde(default = "default_reserve_timeout")]
    pub reserve_timeout_secs: u64,

    /// Flash attempts per run
    #[serde(default = "default_flash_retries")]
    pub flash_retries: u32,

    /// Boot timings
    #[serde(default)]
    pub timings: TimingSettings,
}

fn default_log_file() -> String {
    "aft.log".to_string()
}

fn default_lock_dir() -> PathBuf {
    PathBuf::from("/var/lock")
}

fn default_nfs_folder() -> PathBuf {
    PathBuf::from("/home/tester")
}

fn default_serial_log_name() -> String {
    "serial.log".to_string()
}

fn default_ip_save_dir() -> PathBuf {
    PathBuf::from("/root/workspace")
}

fn default_ssh_key() -> PathBuf {
    PathBuf::from("/root/.ssh/id_rsa_testing_harness")
}

fn default_ssh_public_key() -> PathBuf {
    PathBuf::from("/root/.ssh/id_rsa_testing_harness.pub")
}

fn default_gpio_base() -> PathBuf {
    PathBuf::from("/sys/class/gpio")
}

fn default_boot_relay_pin() -> Option<String> {
    Some("48".to_string())
}

fn default_sweep_interval() -> u64 {
    10
}

fn default_reserve_timeout() -> u64 {
    3600
}

fn default_flash_retries() -> u32 {
    2
}

impl Default for LabSettings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_file: default_log_file(),
            lock_dir: default_lock_dir(),
            lock_scope: LockScope::default(),
            nfs_folder: default_nfs_folder(),
            serial_log_name: default_serial_log_name(),
            ip_save_dir: default_ip_save_dir(),
            ssh_key: default_ssh_key(),
            ssh_public_key: default_ssh_public_key(),
            gpio_base: default_gpio_base(),
            boot_relay_pin: default_boot_relay_pin(),
            sweep_interval_secs: default_sweep_interval(),
            reserve_timeout_secs: default_reserve_timeout(),
            flash_retries: default_flash_retries(),
            timings: TimingSettings::default(),
        }
    }
}

impl LabSettings {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn reserve_timeout(&self) -> Duration {
        Duration::from_secs(self.reserve_timeout_secs)
    }
}

/// Boot and flashing timings, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingSettings {
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_power_cycle_delay")]
    pub power_cycle_delay_secs: u64,

    #[serde(default = "default_boot_timeout")]
    pub boot_timeout_secs: u64,

    #[serde(default = "default_polling_interval")]
    pub polling_interval_secs: u64,

    #[serde(default = "default_image_write_timeout")]
    pub image_write_timeout_secs: u64,
}

fn default_retry_attempts() -> u32 {
    4
}

fn default_power_cycle_delay() -> u64 {
    10
}

fn default_boot_timeout() -> u64 {
    240
}

fn default_polling_interval() -> u64 {
    10
}

fn default_image_write_timeout() -> u64 {
    1440
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            retry_attempts: default_retry_attempts(),
            power_cycle_delay_secs: default_power_cycle_delay(),
            boot_timeout_secs: default_boot_timeout(),
            polling_interval_secs: default_polling_interval(),
            image_write_timeout_secs: default_image_write_timeout(),
        }
    }
}

/// Front-end settings for driving lab controllers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetSettings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Front-end session log
    #[serde(default = "default_fleet_log_file")]
    pub log_file: String,

    /// Front-end path of the workspace shared with lab controllers
    #[serde(default = "default_workspace_nfs_path")]
    pub workspace_nfs_path: PathBuf,

    /// Front-end path of the lab-controller root filesystem
    #[serde(default = "default_controller_fs_path")]
    pub controller_fs_path: PathBuf,

    /// The same shared workspace as seen from a lab controller
    #[serde(default = "default_remote_workspace")]
    pub remote_workspace: String,

    /// Single-tier executable on the lab controller
    #[serde(default = "default_remote_binary")]
    pub remote_binary: String,

    /// SSH key for lab controllers; defaults to the harness key inside
    /// `controller_fs_path`
    #[serde(default)]
    pub ssh_key: Option<PathBuf>,

    /// Known-hosts file refreshed after a DUT gets a new address
    #[serde(default)]
    pub known_hosts_file: Option<PathBuf>,

    /// Directory of advisory fleet lock files
    #[serde(default = "default_fleet_lock_dir")]
    pub lock_dir: PathBuf,

    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,

    #[serde(default = "default_connect_backoff")]
    pub connect_backoff_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_remote_flash_timeout")]
    pub remote_flash_timeout_secs: u64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_reserve_timeout")]
    pub reserve_timeout_secs: u64,
}

fn default_fleet_log_file() -> String {
    "daft.log".to_string()
}

fn default_workspace_nfs_path() -> PathBuf {
    PathBuf::from("/home/tester/workspace")
}

fn default_controller_fs_path() -> PathBuf {
    PathBuf::from("/nfs/controller")
}

fn default_remote_workspace() -> String {
    "/root/workspace".to_string()
}

fn default_remote_binary() -> String {
    "dutlab".to_string()
}

fn default_fleet_lock_dir() -> PathBuf {
    PathBuf::from("/etc/daft/lockfiles")
}

fn default_connect_retries() -> u32 {
    3
}

fn default_connect_backoff() -> u64 {
    2
}

fn default_connect_timeout() -> u64 {
    15
}

fn default_remote_flash_timeout() -> u64 {
    1200
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_file: default_fleet_log_file(),
            workspace_nfs_path: default_workspace_nfs_path(),
            controller_fs_path: default_controller_fs_path(),
            remote_workspace: default_remote_workspace(),
            remote_binary: default_remote_binary(),
            ssh_key: None,
            known_hosts_file: None,
            lock_dir: default_fleet_lock_dir(),
            connect_retries: default_connect_retries(),
            connect_backoff_secs: default_connect_backoff(),
            connect_timeout_secs: default_connect_timeout(),
            remote_flash_timeout_secs: default_remote_flash_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            reserve_timeout_secs: default_reserve_timeout(),
        }
    }
}

impl FleetSettings {
    /// Key used to reach lab controllers
    pub fn controller_ssh_key(&self) -> PathBuf {
        self.ssh_key.clone().unwrap_or_else(|| {
            self.controller_fs_path
                .join("root")
                .join(".ssh")
                .join("id_rsa_testing_harness")
        })
    }

    pub fn known_hosts(&self) -> PathBuf {
        self.known_hosts_file.clone().unwrap_or_else(|| {
            std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/root"))
                .join(".ssh")
                .join("known_hosts")
        })
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn reserve_timeout(&self) -> Duration {
        Duration::from_secs(self.reserve_timeout_secs)
    }
}
