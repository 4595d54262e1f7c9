//! Resolve manually entered sensors.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::{debug, info, warn};

use super::DiscoverySink;
use crate::collector::DeviceProtocol;
use crate::domain::DeviceIdentity;
use crate::{Error, Result};

const NAME_PREFIX: &str = "EVBS_";

static HOSTNAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^EVBS_[A-Za-z0-9]+$").expect("hostname pattern is valid")
});

/// Classified manual input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManualEntry {
    Ipv4(Ipv4Addr),
    /// `EVBS_<alnum>`, resolved as `<name>.local`.
    Hostname(String),
}

impl ManualEntry {
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if let Ok(ip) = input.parse::<Ipv4Addr>() {
            return Ok(ManualEntry::Ipv4(ip));
        }
        if HOSTNAME_RE.is_match(input) {
            return Ok(ManualEntry::Hostname(input.to_string()));
        }
        Err(Error::validation(format!(
            "'{input}' is neither an IPv4 address nor an {NAME_PREFIX} hostname"
        )))
    }
}

/// Name used for a sensor reached by IP whose status has no usable device id.
pub fn fallback_name(ip: Ipv4Addr) -> String {
    format!("{NAME_PREFIX}{}", ip.to_string().replace('.', "_"))
}

/// Turns user-entered addresses into device identities.
pub struct ManualResolver {
    protocol: Arc<dyn DeviceProtocol>,
}

impl ManualResolver {
    pub fn new(protocol: Arc<dyn DeviceProtocol>) -> Self {
        Self { protocol }
    }

    pub async fn resolve(&self, input: &str) -> Result<DeviceIdentity> {
        match ManualEntry::parse(input)? {
            ManualEntry::Ipv4(ip) => self.resolve_ip(ip).await,
            ManualEntry::Hostname(name) => resolve_hostname(&name).await,
        }
    }

    /// Probe `/status` and name the device from its reported id.
    async fn resolve_ip(&self, ip: Ipv4Addr) -> Result<DeviceIdentity> {
        let address = ip.to_string();
        let status = self.protocol.probe_status(&address).await.map_err(|e| {
            debug!(ip = %ip, error = %e, "Status probe failed");
            Error::Discovery(format!("Could not reach sensor at {ip}"))
        })?;

        let name = status
            .device_id
            .filter(|id| id.starts_with(NAME_PREFIX))
            .unwrap_or_else(|| fallback_name(ip));
        Ok(DeviceIdentity::new(name, address))
    }

    /// Resolve each entry and announce it. Failures are logged and skipped.
    pub async fn announce_all(&self, entries: &[String], sink: &dyn DiscoverySink) -> usize {
        let mut announced = 0;
        for entry in entries {
            let identity = match self.resolve(entry).await {
                Ok(identity) => identity,
                Err(e) => {
                    warn!(entry = %entry, error = %e, "Could not add sensor");
                    continue;
                }
            };
            info!(device = %identity.name, address = %identity.address, "Resolved sensor");
            match sink.device_found(&identity.name, &identity.address).await {
                Ok(()) => announced += 1,
                Err(e) => warn!(device = %identity.name, error = %e, "Failed to announce sensor"),
            }
        }
        announced
    }
}

async fn resolve_hostname(name: &str) -> Result<DeviceIdentity> {
    let host = format!("{name}.local");
    let unresolved = || Error::Discovery(format!("Could not resolve {host}"));
    let addrs = tokio::net::lookup_host((host.as_str(), 80))
        .await
        .map_err(|_| unresolved())?;
    let ip = addrs
        .map(|addr| addr.ip())
        .find(IpAddr::is_ipv4)
        .ok_or_else(unresolved)?;
    Ok(DeviceIdentity::new(name, ip.to_string()))
}
