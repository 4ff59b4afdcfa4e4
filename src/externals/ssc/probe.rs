use std::{
    collections::BTreeMap,
    net::IpAddr,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tracing::{debug, instrument, trace, warn};

use crate::{
    internals::core::ports::{ProbeError, ProbePort},
    models::device::DeviceHandle,
};

pub const SSC_SERVICE_TYPE: &str = "_ssc._tcp.local.";

/// Browses for SSC services over mDNS for a fixed window and reports every
/// instance that resolved in that time.
#[derive(Debug, Clone)]
pub struct MdnsProbe {
    service_type: String,
    window: Duration,
}

impl MdnsProbe {
    pub fn new(window: Duration) -> Self {
        Self {
            service_type: SSC_SERVICE_TYPE.to_string(),
            window,
        }
    }
}

#[async_trait]
impl ProbePort for MdnsProbe {
    #[instrument(skip_all)]
    async fn probe(&self) -> Result<Vec<DeviceHandle>, ProbeError> {
        let service_type = self.service_type.clone();
        let window = self.window;
        tokio::task::spawn_blocking(move || browse(&service_type, window))
            .await
            .map_err(|e| ProbeError::Transport(e.to_string()))?
    }
}

/// Blocking browse on a daemon of its own, so every probe starts from an
/// empty cache.
fn browse(service_type: &str, window: Duration) -> Result<Vec<DeviceHandle>, ProbeError> {
    let daemon = ServiceDaemon::new().map_err(classify)?;
    let receiver = daemon.browse(service_type).map_err(classify)?;
    let deadline = Instant::now() + window;

    // NOTE: keyed by instance name, a device resolves once per address family.
    let mut found = BTreeMap::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match receiver.recv_timeout(remaining) {
            Ok(ServiceEvent::ServiceResolved(info)) => match handle_for(&info) {
                Some(handle) => {
                    debug!("Resolved {} at {}.", info.get_fullname(), handle);
                    found.insert(info.get_fullname().to_string(), handle);
                }
                None => warn!("Resolved {} without an address.", info.get_fullname()),
            },
            Ok(event) => trace!("Ignoring mDNS event: {:?}", event),
            Err(_) => break,
        }
    }

    if let Err(e) = daemon.stop_browse(service_type) {
        debug!("Failed to stop browsing. Error: {}", e);
    }
    if let Err(e) = daemon.shutdown() {
        debug!("Failed to shut down mDNS daemon. Error: {}", e);
    }
    Ok(found.into_values().collect())
}

fn handle_for(info: &ServiceInfo) -> Option<DeviceHandle> {
    let addresses = info
        .get_addresses()
        .iter()
        .map(|address| IpAddr::from(*address))
        .collect::<Vec<IpAddr>>();
    preferred_address(&addresses).map(|address| DeviceHandle::new(address, info.get_port()))
}

/// SSC devices are usually reached over IPv6 link-local. Fall back to any
/// IPv6 address, then IPv4.
fn preferred_address(addresses: &[IpAddr]) -> Option<IpAddr> {
    let rank = |address: &IpAddr| match address {
        IpAddr::V6(ip) if (ip.segments()[0] & 0xffc0) == 0xfe80 => 0,
        IpAddr::V6(_) => 1,
        IpAddr::V4(_) => 2,
    };
    addresses.iter().copied().min_by_key(|address| (rank(address), *address))
}

fn classify(e: mdns_sd::Error) -> ProbeError {
    match e {
        mdns_sd::Error::Again => ProbeError::TransientCongestion(e.to_string()),
        e => ProbeError::Transport(e.to_string()),
    }
}
