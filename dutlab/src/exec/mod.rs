//! Command execution on the local host and on remote hosts over SSH

pub mod local;
pub mod ssh;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::LabError;

pub use local::SystemExec;
pub use ssh::SshExec;

/// Options for one remote command
#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Overall bound for the command
    pub timeout: Duration,

    /// Remote user
    pub user: String,

    /// Bound for establishing the connection
    pub connect_timeout: Duration,

    /// Exit codes treated as success
    pub ignore_codes: Vec<i32>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user: "root".to_string(),
            connect_timeout: Duration::from_secs(15),
            ignore_codes: Vec::new(),
        }
    }
}

impl ExecOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Default::default()
        }
    }

    pub fn ignoring(mut self, code: i32) -> Self {
        self.ignore_codes.push(code);
        self
    }
}

/// Runs commands on this host. Output is stdout followed by stderr.
#[async_trait]
pub trait LocalExec: Send + Sync {
    async fn run(&self, command: &[&str], timeout: Duration) -> Result<String, LabError>;

    /// Run through `sh -c`, for pipelines
    async fn run_shell(&self, script: &str, timeout: Duration) -> Result<String, LabError> {
        self.run(&["sh", "-c", script], timeout).await
    }
}

/// Runs commands on, and copies files to and from, a remote host.
#[async_trait]
pub trait RemoteExec: Send + Sync {
    async fn run(&self, host: &str, command: &[&str], options: &ExecOptions) -> Result<String, LabError>;

    async fn push(
        &self,
        host: &str,
        source: &Path,
        destination: &str,
        options: &ExecOptions,
    ) -> Result<String, LabError>;

    async fn pull(
        &self,
        host: &str,
        source: &str,
        destination: &Path,
        options: &ExecOptions,
    ) -> Result<String, LabError>;

    /// True when `host` accepts a command within a short connect timeout
    async fn handshake(&self, host: &str) -> bool {
        let options = ExecOptions {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            ..Default::default()
        };
        match self.run(host, &["echo", "$?"], &options).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("Could not establish ssh-connection to {}: {}", host, e);
                false
            }
        }
    }
}
