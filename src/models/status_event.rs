use std::{fmt::Display, sync::Arc};

use super::device_group::DeviceGroup;

/// A notification produced once per supervisor transition. Delivered in the
/// order produced; not stored anywhere once consumed.
#[derive(Debug, Clone)]
pub enum StatusEvent {
    /// A probe found nothing usable.
    Searching,
    /// A probe found some, but not all, of the group.
    FoundPartial(usize),
    /// The probe layer failed for a reason other than congestion.
    Retrying(String),
    /// A complete set of candidates was found but could not be connected.
    ConnectFailed(String),
    /// The group is connected and may be controlled.
    Ready(Arc<DeviceGroup>),
    /// An established group stopped answering and could not be recovered.
    Lost,
    /// The supervisor gave up. Always the last event of a run.
    Error(String),
}

impl StatusEvent {
    pub fn is_ready(&self) -> bool {
        matches!(self, StatusEvent::Ready(_))
    }
}

impl Display for StatusEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusEvent::Searching => write!(f, "Searching..."),
            StatusEvent::FoundPartial(1) => write!(f, "Found 1 speaker..."),
            StatusEvent::FoundPartial(count) => write!(f, "Found {} speakers...", count),
            StatusEvent::Retrying(reason) => write!(f, "Retrying... ({})", reason),
            StatusEvent::ConnectFailed(reason) => {
                write!(f, "Retrying connection... ({})", reason)
            }
            StatusEvent::Ready(group) => write!(f, "Connected to {} speakers", group.len()),
            StatusEvent::Lost => write!(f, "Connection lost"),
            StatusEvent::Error(reason) => write!(f, "Error: {}", reason),
        }
    }
}
