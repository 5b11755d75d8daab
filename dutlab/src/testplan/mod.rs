//! Test execution after boot

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::device::Device;
use crate::errors::LabError;
use crate::filesys::file::File;
use crate::utils::cancellable;

/// Runs tests against a booted device
#[async_trait]
pub trait TestExecutor: Send + Sync {
    async fn run(&self, device: &Device, cancel: &CancellationToken) -> Result<TestReport, LabError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub name: String,
    pub passed: bool,
    pub output: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TestReport {
    pub results: Vec<TestResult>,
}

impl TestReport {
    pub fn passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    pub fn failures(&self) -> usize {
        self.results.iter().filter(|r| !r.passed).count()
    }
}

/// Runs each command of the device's test plan file on the DUT.
///
/// The plan lists one shell command per line; blank lines and lines
/// starting with `#` are skipped. A command passes when it exits 0.
#[derive(Debug, Clone)]
pub struct RemoteCommandTests {
    timeout: Duration,
}

impl RemoteCommandTests {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for RemoteCommandTests {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

pub fn plan_commands(plan: &str) -> Vec<&str> {
    plan.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .collect()
}

#[async_trait]
impl TestExecutor for RemoteCommandTests {
    async fn run(&self, device: &Device, cancel: &CancellationToken) -> Result<TestReport, LabError> {
        let Some(plan_path) = device.test_plan() else {
            info!("No test plan for {}", device.name());
            return Ok(TestReport::default());
        };
        let plan = File::new(plan_path).read_string().await.map_err(|e| {
            LabError::ConfigError(format!("Unable to read test plan {}: {}", plan_path, e))
        })?;

        let mut report = TestReport::default();
        for command in plan_commands(&plan) {
            info!("Running test: {}", command);
            // ssh hands the words to a remote shell; quote the script once
            let script = format!("'{}'", command.replace('\'', r"'\''"));
            let result = cancellable(cancel, device.execute(&["sh", "-c", &script], self.timeout)).await;
            let (passed, output) = match result {
                Ok(output) => (true, output),
                Err(e) if e.is_interrupt() => return Err(e),
                Err(e) => {
                    error!("Test '{}' failed: {}", command, e);
                    (false, e.output().unwrap_or_default().to_string())
                }
            };
            report.results.push(TestResult {
                name: command.to_string(),
                passed,
                output,
            });
        }

        info!(
            "{} of {} tests passed",
            report.results.len() - report.failures(),
            report.results.len()
        );
        Ok(report)
    }
}
