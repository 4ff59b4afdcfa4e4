use std::fmt::Display;

use thiserror::Error;

use crate::internals::core::ports::LinkHandle;

use super::device::{Device, DeviceHandle, InterfaceHint};

/// The full set of devices that are connected at the same time. Only ever
/// built through [`DeviceGroup::build`], so a group always holds exactly the
/// expected number of devices and every one of them has a live link.
#[derive(Debug)]
pub struct DeviceGroup {
    generation: u64,
    devices: Vec<Device>,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum GroupError {
    /// Fewer candidates or live connections than the group requires.
    #[error("Incomplete group: expected {expected} devices, got {candidates} candidates with {live} live connections.")]
    IncompleteGroup {
        expected: usize,
        candidates: usize,
        live: usize,
    },
}

impl DeviceGroup {
    /// Pair each candidate with the connection opened for it (same order) and
    /// produce a group. Fails unless both lists hold exactly `expected` entries
    /// and every connection is present.
    pub fn build(
        expected: usize,
        generation: u64,
        candidates: Vec<DeviceHandle>,
        connections: Vec<Option<LinkHandle>>,
        interface: &InterfaceHint,
    ) -> Result<Self, GroupError> {
        let live = connections.iter().filter(|c| c.is_some()).count();
        let incomplete = GroupError::IncompleteGroup {
            expected,
            candidates: candidates.len(),
            live,
        };

        if expected == 0 || candidates.len() != expected || connections.len() != expected {
            return Err(incomplete);
        }

        let devices = candidates
            .into_iter()
            .zip(connections)
            .map(|(handle, link)| link.map(|link| Device::new(handle, link, interface.clone())))
            .collect::<Option<Vec<Device>>>();

        match devices {
            None => Err(incomplete),
            Some(devices) => Ok(Self {
                generation,
                devices,
            }),
        }
    }

    /// Identifies this group among all groups a supervisor has produced.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// The device reads are served from. Groups are never empty.
    pub fn primary(&self) -> &Device {
        &self.devices[0]
    }

    pub fn handles(&self) -> Vec<DeviceHandle> {
        self.devices.iter().map(|d| d.handle().clone()).collect()
    }

    pub fn is_same(&self, other: &DeviceGroup) -> bool {
        self.generation == other.generation
    }
}

impl Display for DeviceGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handles = self
            .devices
            .iter()
            .map(|d| d.handle().to_string())
            .collect::<Vec<String>>()
            .join(", ");
        write!(f, "<DeviceGroup #{} | {}>", self.generation, handles)
    }
}
