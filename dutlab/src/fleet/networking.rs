//! Front-end network fix-ups after a DUT booted with a new address

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use ipnet::Ipv4Net;
use tracing::{info, warn};

use crate::errors::LabError;
use crate::exec::LocalExec;

const NETWORK_TIMEOUT: Duration = Duration::from_secs(30);

/// The /24 network `ip` belongs to
pub fn subnet_of(ip: &str) -> Result<Ipv4Net, LabError> {
    let addr: Ipv4Addr = ip
        .trim()
        .parse()
        .map_err(|_| LabError::ConnectionError(format!("Invalid DUT address '{}'", ip)))?;
    Ipv4Net::new(addr, 24)
        .map(|net| net.trunc())
        .map_err(|e| LabError::Internal(e.to_string()))
}

/// True when `ip route` output has an entry for `network`
pub fn route_exists(routes: &str, network: &Ipv4Net) -> bool {
    let network = network.to_string();
    let address = network.split('/').next().unwrap_or_default();
    routes.lines().any(|line| {
        line.split_whitespace()
            .next()
            .map(|dest| dest == network || dest == address)
            .unwrap_or(false)
    })
}

/// Route the DUT's /24 through the lab controller unless a route exists
pub async fn fix_dut_routing(
    local: &dyn LocalExec,
    dut_ip: &str,
    controller_ip: &str,
) -> Result<(), LabError> {
    let network = subnet_of(dut_ip)?;
    let routes = local.run(&["ip", "route"], NETWORK_TIMEOUT).await?;
    if route_exists(&routes, &network) {
        return Ok(());
    }

    info!("Adding route to {} via {}", network, controller_ip);
    let network = network.to_string();
    local
        .run(
            &["sudo", "ip", "route", "add", &network, "via", controller_ip],
            NETWORK_TIMEOUT,
        )
        .await?;
    Ok(())
}

/// Forget the old host key of `ip` and install ours on the DUT
pub async fn rewrite_ssh_keys(local: &dyn LocalExec, known_hosts: &Path, ip: &str) {
    let known_hosts = known_hosts.display().to_string();
    if let Err(e) = local
        .run(&["ssh-keygen", "-f", &known_hosts, "-R", ip], NETWORK_TIMEOUT)
        .await
    {
        warn!("Could not remove {} from {}: {}", ip, known_hosts, e);
    }
    if let Err(e) = local.run(&["ssh-copy-id", ip], NETWORK_TIMEOUT).await {
        warn!("Could not copy ssh id to {}: {}", ip, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subnet_of() {
        assert_eq!(subnet_of("192.168.30.17").unwrap().to_string(), "192.168.30.0/24");
        assert!(subnet_of("not-an-ip").is_err());
    }

    #[test]
    fn test_route_exists() {
        let routes = "default via 10.0.0.1 dev eth0\n\
                      192.168.30.0/24 via 10.0.0.7 dev eth0\n";
        assert!(route_exists(routes, &subnet_of("192.168.30.99").unwrap()));
        assert!(!route_exists(routes, &subnet_of("192.168.31.2").unwrap()));
    }
}
