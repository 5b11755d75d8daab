//! Utility functions

use std::future::Future;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::errors::LabError;

/// Version information for dutlab
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Get version information
pub fn version_info() -> VersionInfo {
    VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: option_env!("GIT_HASH").unwrap_or("unknown").to_string(),
        build_time: option_env!("BUILD_TIME").unwrap_or("unknown").to_string(),
    }
}

/// Human readable duration since `start`, e.g. `3min 12s`
pub fn time_used(start: Instant) -> String {
    format_duration(start.elapsed())
}

pub fn format_duration(elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64().round() as u64;
    format!("{}min {}s", secs / 60, secs % 60)
}

/// Sleep for `duration` unless `cancel` fires first.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> Result<(), LabError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(LabError::Interrupted),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Run `fut` unless `cancel` fires first.
pub async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, LabError>
where
    F: Future<Output = Result<T, LabError>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(LabError::Interrupted),
        result = fut => result,
    }
}

/// Generate a random UUID v4
pub fn generate_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}
