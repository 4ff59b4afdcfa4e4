use std::{
    net::{IpAddr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use futures::future::join_all;
use tokio::{
    net::{lookup_host, TcpStream},
    time::timeout,
};
use tracing::{debug, instrument, warn};

use crate::{
    internals::core::ports::{ConnectError, ConnectionPort, LinkHandle},
    models::device::{DeviceHandle, InterfaceHint},
};

use super::link::SscLink;

/// Opens one TCP connection per device, all at once. Either every device
/// connects or the whole attempt fails and the connections that did open are
/// dropped.
#[derive(Debug, Clone)]
pub struct SscConnector {
    io_timeout: Duration,
}

impl SscConnector {
    pub fn new(io_timeout: Duration) -> Self {
        Self { io_timeout }
    }

    async fn open(
        &self,
        handle: &DeviceHandle,
        interface: &InterfaceHint,
    ) -> Result<LinkHandle, String> {
        let address = resolve(handle, interface).await?;
        debug!("Connecting to {} at {}.", handle, address);
        let stream = match timeout(self.io_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(e.to_string()),
            Err(_) => return Err(format!("Timed out after {:?}.", self.io_timeout)),
        };
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to disable Nagle for {}. Error: {}", handle, e);
        }
        Ok(Arc::new(SscLink::new(handle.clone(), stream, self.io_timeout)))
    }
}

#[async_trait]
impl ConnectionPort for SscConnector {
    #[instrument(skip_all, fields(interface = %interface))]
    async fn connect(
        &self,
        handles: &[DeviceHandle],
        interface: &InterfaceHint,
    ) -> Result<Vec<Option<LinkHandle>>, ConnectError> {
        let attempts = join_all(handles.iter().map(|handle| self.open(handle, interface))).await;

        let mut links = Vec::with_capacity(handles.len());
        for (handle, attempt) in handles.iter().zip(attempts) {
            match attempt {
                Ok(link) => links.push(Some(link)),
                Err(reason) => {
                    return Err(ConnectError::Device {
                        handle: handle.clone(),
                        reason,
                    })
                }
            }
        }
        Ok(links)
    }
}

/// Link-local IPv6 addresses are only reachable through a named interface,
/// so they get the interface as their scope.
async fn resolve(handle: &DeviceHandle, interface: &InterfaceHint) -> Result<SocketAddr, String> {
    match handle.address {
        IpAddr::V6(ip) if is_link_local(&ip) => {
            let scoped = format!("{}%{}", ip, interface.name());
            let mut resolved = lookup_host((scoped.as_str(), handle.port))
                .await
                .map_err(|e| format!("Failed to resolve {}. Error: {}", scoped, e))?;
            let address = resolved
                .next()
                .ok_or_else(|| format!("No address for {}.", scoped));
            address
        }
        address => Ok(SocketAddr::new(address, handle.port)),
    }
}

fn is_link_local(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn test_is_link_local() {
        assert!(is_link_local(&"fe80::1".parse().unwrap()));
        assert!(is_link_local(&"febf::1".parse().unwrap()));
        assert!(!is_link_local(&"fec0::1".parse().unwrap()));
        assert!(!is_link_local(&"2001:db8::1".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_routable_addresses_ignore_interface() {
        let handle = DeviceHandle::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)), 45);
        let address = resolve(&handle, &InterfaceHint::new("en0")).await.unwrap();
        assert_eq!(address, "192.168.1.20:45".parse().unwrap());
    }

    #[tokio::test]
    async fn test_link_local_addresses_are_scoped() {
        let handle = DeviceHandle::new("fe80::1".parse().unwrap(), 45);
        match resolve(&handle, &InterfaceHint::new("%lo")).await.unwrap() {
            SocketAddr::V6(address) => {
                assert_eq!(address.ip(), &"fe80::1".parse::<Ipv6Addr>().unwrap());
                assert_eq!(address.port(), 45);
                assert_ne!(address.scope_id(), 0);
            }
            other => panic!("Unexpected address: {}", other),
        }
    }

    #[tokio::test]
    async fn test_connects_to_every_device() {
        let first = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let second = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let handles = [&first, &second]
            .iter()
            .map(|l| {
                let address = l.local_addr().unwrap();
                DeviceHandle::new(address.ip(), address.port())
            })
            .collect::<Vec<_>>();

        let links = SscConnector::new(Duration::from_secs(2))
            .connect(&handles, &InterfaceHint::new("lo"))
            .await
            .expect("Failed to connect.");

        assert_eq!(links.len(), 2);
        assert!(links.iter().all(Option::is_some));
    }

    #[tokio::test]
    async fn test_one_refused_device_fails_the_group() {
        let open = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed_address = closed.local_addr().unwrap();
        drop(closed);

        let open_address = open.local_addr().unwrap();
        let handles = vec![
            DeviceHandle::new(open_address.ip(), open_address.port()),
            DeviceHandle::new(closed_address.ip(), closed_address.port()),
        ];

        match SscConnector::new(Duration::from_secs(2))
            .connect(&handles, &InterfaceHint::new("lo"))
            .await
        {
            Err(ConnectError::Device { handle, .. }) => assert_eq!(handle, handles[1]),
            other => panic!("Unexpected result: {:?}", other.map(|l| l.len())),
        }
    }
}
