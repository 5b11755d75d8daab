//! Address discovery through dnsmasq leases

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::errors::LabError;
use crate::exec::RemoteExec;
use crate::utils::sleep_or_cancel;

/// One row of a dnsmasq leases file:
/// `<expiry> <mac> <ip> <hostname> <client-id>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub expiry: u64,
    pub mac: String,
    pub ip: String,
    pub hostname: String,
    pub client_id: String,
}

/// Parse a leases file. Malformed rows are skipped.
pub fn parse_leases(contents: &str) -> Vec<Lease> {
    contents
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 5 {
                if !line.trim().is_empty() {
                    debug!("Skipping malformed lease: {}", line);
                }
                return None;
            }
            Some(Lease {
                expiry: fields[0].parse().unwrap_or(0),
                mac: fields[1].to_string(),
                ip: fields[2].to_string(),
                hostname: fields[3].to_string(),
                client_id: fields[4].to_string(),
            })
        })
        .collect()
}

/// Leases file of the dnsmasq instance serving the DUT network
#[derive(Debug, Clone)]
pub struct LeasesFile {
    path: PathBuf,
}

impl LeasesFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current leases; a missing file means no leases yet
    pub async fn leases(&self) -> Result<Vec<Lease>, LabError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(parse_leases(&contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Candidate address; one DUT per lab controller, so the first lease
    pub async fn candidate_ip(&self) -> Result<Option<String>, LabError> {
        Ok(self.leases().await?.into_iter().next().map(|lease| lease.ip))
    }
}

/// Candidate address, if it accepts a remote handshake
pub async fn responsive_ip(
    leases: &LeasesFile,
    remote: &dyn RemoteExec,
) -> Result<Option<String>, LabError> {
    let Some(ip) = leases.candidate_ip().await? else {
        return Ok(None);
    };
    if remote.handshake(&ip).await {
        Ok(Some(ip))
    } else {
        Ok(None)
    }
}

/// Poll for a responsive address `timeout / interval` times.
pub async fn wait_for_responsive_ip(
    leases: &LeasesFile,
    remote: &dyn RemoteExec,
    timeout: Duration,
    interval: Duration,
    cancel: &CancellationToken,
) -> Result<Option<String>, LabError> {
    info!("Waiting for the device to become responsive");
    debug!("Timeout: {:?}, polling interval: {:?}", timeout, interval);

    let polls = (timeout.as_millis() / interval.as_millis().max(1)).max(1);
    for _ in 0..polls {
        if let Some(ip) = responsive_ip(leases, remote).await? {
            info!("Got a response from {}", ip);
            return Ok(Some(ip));
        }
        sleep_or_cancel(interval, cancel).await?;
    }

    info!("No responsive ip was found");
    Ok(None)
}
