//! Remote control of hosts over ssh/scp

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, error};

use crate::errors::LabError;
use crate::exec::local::execute;
use crate::exec::{ExecOptions, RemoteExec};

const PROXY_VARIABLES: &[&str] = &["http_proxy", "https_proxy", "ftp_proxy", "no_proxy"];

/// Markers ssh prints when the connection itself failed
const CONNECTION_FAILURES: &[&str] = &[
    "Connection refused",
    "Connection timed out",
    "No route to host",
    "Connection closed by",
];

/// [`RemoteExec`] over the system `ssh` and `scp` clients
#[derive(Debug, Clone)]
pub struct SshExec {
    identity: PathBuf,
    forward_proxy: bool,
}

impl SshExec {
    pub fn new(identity: impl Into<PathBuf>) -> Self {
        Self {
            identity: identity.into(),
            forward_proxy: true,
        }
    }

    /// Do not export the local proxy variables on the remote side
    pub fn without_proxy(mut self) -> Self {
        self.forward_proxy = false;
        self
    }

    fn base_options(&self, options: &ExecOptions) -> Vec<String> {
        vec![
            "-i".to_string(),
            self.identity.display().to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", options.connect_timeout.as_secs().max(1)),
        ]
    }
}

/// `export var="value";` for each proxy variable set locally
fn proxy_exports() -> String {
    PROXY_VARIABLES
        .iter()
        .filter_map(|var| {
            std::env::var(var)
                .ok()
                .filter(|v| !v.is_empty())
                .map(|v| format!("export {}=\"{}\"; ", var, v))
        })
        .collect()
}

/// Reclassify failures of the ssh client itself as connection errors
fn classify(err: LabError) -> LabError {
    match err {
        LabError::CommandFailed {
            code: Some(255),
            ref output,
            ..
        } if CONNECTION_FAILURES.iter().any(|m| output.contains(m)) => {
            LabError::ConnectionError(output.trim().to_string())
        }
        other => other,
    }
}

#[async_trait]
impl RemoteExec for SshExec {
    async fn run(&self, host: &str, command: &[&str], options: &ExecOptions) -> Result<String, LabError> {
        let destination = format!("{}@{}", options.user, host);
        let proxy = if self.forward_proxy { proxy_exports() } else { String::new() };

        let mut args: Vec<String> = vec!["ssh".to_string()];
        args.extend(self.base_options(options));
        args.push(destination);
        if !proxy.is_empty() {
            args.push(proxy);
        }
        args.extend(command.iter().map(|s| s.to_string()));

        debug!(target: "ssh", "Executing {} on {}", command.join(" "), host);
        let argv: Vec<&str> = args.iter().map(String::as_str).collect();
        execute(&argv, options.timeout, &options.ignore_codes)
            .await
            .map_err(|e| {
                error!(target: "ssh", "Command raised exception: {}", e);
                if let Some(output) = e.output() {
                    error!(target: "ssh", "Output: {}", output);
                }
                classify(e)
            })
    }

    async fn push(
        &self,
        host: &str,
        source: &Path,
        destination: &str,
        options: &ExecOptions,
    ) -> Result<String, LabError> {
        let mut args: Vec<String> = vec!["scp".to_string()];
        args.extend(self.base_options(options));
        args.push(source.display().to_string());
        args.push(format!("{}@{}:{}", options.user, host, destination));

        let argv: Vec<&str> = args.iter().map(String::as_str).collect();
        execute(&argv, options.timeout, &options.ignore_codes)
            .await
            .map_err(classify)
    }

    async fn pull(
        &self,
        host: &str,
        source: &str,
        destination: &Path,
        options: &ExecOptions,
    ) -> Result<String, LabError> {
        let mut args: Vec<String> = vec!["scp".to_string()];
        args.extend(self.base_options(options));
        args.push(format!("{}@{}:{}", options.user, host, source));
        args.push(destination.display().to_string());

        let argv: Vec<&str> = args.iter().map(String::as_str).collect();
        execute(&argv, options.timeout, &options.ignore_codes)
            .await
            .map_err(classify)
    }
}
