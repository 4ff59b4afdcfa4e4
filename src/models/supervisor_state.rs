use std::{fmt::Display, sync::Arc};

use super::{device::InterfaceHint, device_group::DeviceGroup};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Scanning,
    Connecting,
    Monitoring,
    Stopped,
}

impl Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SupervisorState::Idle => "idle",
            SupervisorState::Scanning => "scanning",
            SupervisorState::Connecting => "connecting",
            SupervisorState::Monitoring => "monitoring",
            SupervisorState::Stopped => "stopped",
        };
        write!(f, "{}", name)
    }
}

/// What the supervisor currently believes, published as one value so that
/// readers never see a state from one transition paired with the group from
/// another.
#[derive(Debug, Clone)]
pub struct SupervisorSnapshot {
    pub state: SupervisorState,
    pub interface: InterfaceHint,
    /// Only ever `Some` while `state` is `Monitoring`.
    pub group: Option<Arc<DeviceGroup>>,
}

impl SupervisorSnapshot {
    pub fn idle(interface: InterfaceHint) -> Self {
        Self {
            state: SupervisorState::Idle,
            interface,
            group: None,
        }
    }

    /// The group that may be controlled right now, if any.
    pub fn ready_group(&self) -> Option<&Arc<DeviceGroup>> {
        match self.state {
            SupervisorState::Monitoring => self.group.as_ref(),
            _ => None,
        }
    }
}
