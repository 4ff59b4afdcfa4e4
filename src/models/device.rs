use std::{fmt::Display, net::IpAddr};

use derive_more::Display;

use crate::internals::core::ports::LinkHandle;

/// A candidate returned by one probe. Where a device answered, nothing more:
/// it has not been connected to yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    pub address: IpAddr,
    pub port: u16,
}

impl DeviceHandle {
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self { address, port }
    }
}

impl Display for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.address {
            IpAddr::V4(ip) => write!(f, "{}:{}", ip, self.port),
            IpAddr::V6(ip) => write!(f, "[{}]:{}", ip, self.port),
        }
    }
}

/// Name of the network interface used to reach the devices, e.g. `en0`.
/// Accepts the scoped form (`%en0`) and stores the bare name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display)]
#[display(fmt = "%{}", _0)]
pub struct InterfaceHint(String);

impl InterfaceHint {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().trim_start_matches('%').to_string())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl From<&str> for InterfaceHint {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A device that is part of a live group. Identity never changes; on
/// reconnect a new `Device` with a fresh link replaces this one.
#[derive(Debug, Clone)]
pub struct Device {
    handle: DeviceHandle,
    link: LinkHandle,
    interface: InterfaceHint,
}

impl Device {
    pub(crate) fn new(handle: DeviceHandle, link: LinkHandle, interface: InterfaceHint) -> Self {
        Self {
            handle,
            link,
            interface,
        }
    }

    pub fn handle(&self) -> &DeviceHandle {
        &self.handle
    }

    pub fn link(&self) -> &LinkHandle {
        &self.link
    }

    pub fn interface(&self) -> &InterfaceHint {
        &self.interface
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use super::*;

    #[test]
    fn test_interface_hint_strips_scope_marker() {
        assert_eq!(InterfaceHint::new("%en0"), InterfaceHint::new("en0"));
        assert_eq!(InterfaceHint::new(" en1 ").name(), "en1");
        assert_eq!(InterfaceHint::new("en0").to_string(), "%en0");
    }

    #[test]
    fn test_device_handle_display() {
        let v4 = DeviceHandle::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)), 45);
        assert_eq!(v4.to_string(), "192.168.1.20:45");

        let v6 = DeviceHandle::new(IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1)), 45);
        assert_eq!(v6.to_string(), "[fe80::1]:45");
    }
}
