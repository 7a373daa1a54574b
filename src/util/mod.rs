use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};

use anyhow::{anyhow, Context, Result};
use systemstat::{Platform, System};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::notifier::AddressResolver;

/// Install the global `tracing` subscriber. `RUST_LOG` overrides the default
/// `info` level.
pub fn init_log() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Pick an IPv4 address that a phone on the same network can reach.
///
/// Iterates over all network interfaces provided by `systemstat`, skipping any
/// loopback, link-local or broadcast addresses. The first routable interface is
/// returned.
pub fn select_host_address() -> Result<IpAddr> {
    let system = System::new();
    let networks = system.networks().context("listing network interfaces")?;

    for net in networks.values() {
        for n in &net.addrs {
            if let systemstat::IpAddr::V4(v) = n.addr {
                if !v.is_loopback() && !v.is_link_local() && !v.is_broadcast() {
                    return Ok(IpAddr::V4(v));
                }
            }
        }
    }

    Err(anyhow!("found no usable network interface"))
}

/// The address outbound traffic leaves from, falling back to an interface
/// scan.
pub fn detect_host_address() -> Result<IpAddr> {
    match local_ip_address::local_ip() {
        Ok(ip) if !ip.is_loopback() => return Ok(ip),
        Ok(ip) => debug!("Routing address {} is loopback, scanning interfaces", ip),
        Err(e) => debug!("No routing address ({}), scanning interfaces", e),
    }

    select_host_address()
}

/// Resolves the host address from the machine it runs on.
///
/// A fixed override (e.g. `HOST_IP` when running inside a container) wins over
/// detection. Once an address has been found it is returned again whenever
/// detection fails.
#[derive(Debug, Default)]
pub struct HostAddressResolver {
    fixed: Option<String>,
    last: Mutex<Option<String>>,
}

impl HostAddressResolver {
    pub fn new(fixed: Option<String>) -> HostAddressResolver {
        HostAddressResolver {
            fixed: fixed.filter(|a| !a.trim().is_empty()),
            last: Mutex::new(None),
        }
    }

    fn remember(&self, detected: Result<String>) -> Result<String> {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        match detected {
            Ok(address) => {
                *last = Some(address.clone());
                Ok(address)
            }
            Err(e) => match last.as_ref() {
                Some(address) => {
                    debug!("Address detection failed ({:#}), reusing {}", e, address);
                    Ok(address.clone())
                }
                None => Err(e),
            },
        }
    }
}

impl AddressResolver for HostAddressResolver {
    fn current_address(&self) -> Result<String> {
        if let Some(fixed) = &self.fixed {
            return Ok(fixed.clone());
        }

        self.remember(detect_host_address().map(|ip| ip.to_string()))
    }
}
