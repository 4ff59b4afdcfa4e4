use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;

use crate::models::device::{DeviceHandle, InterfaceHint};

/// A live connection to one device, shared between the group and any
/// in-flight command.
pub type LinkHandle = Arc<dyn DeviceLink>;

/// One discovery attempt over the local network.
#[async_trait]
pub trait ProbePort: Send + Sync {
    /// Probe once and report every device that answered. An empty list is a
    /// normal result, not an error.
    async fn probe(&self) -> Result<Vec<DeviceHandle>, ProbeError>;
}

/// Opens connections to a complete set of candidates.
#[async_trait]
pub trait ConnectionPort: Send + Sync {
    /// Connect to every handle through `interface`. The returned list is
    /// order-correlated with `handles`. Implementations either connect to all
    /// of them or fail; a missing entry is still treated as a failure.
    async fn connect(
        &self,
        handles: &[DeviceHandle],
        interface: &InterfaceHint,
    ) -> Result<Vec<Option<LinkHandle>>, ConnectError>;
}

/// The parameter protocol spoken over one established connection.
#[async_trait]
pub trait DeviceLink: Send + Sync + Debug {
    /// Read the current level.
    async fn query(&self) -> Result<f64, LinkError>;

    /// Set the level. `Err(LinkError::Rejected)` is a nack.
    async fn apply(&self, value: f64) -> Result<(), LinkError>;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    /// The discovery transport refused to answer for now. Worth retrying soon.
    #[error("Discovery transport is congested. Reason: {0}")]
    TransientCongestion(String),
    #[error("Discovery transport failed. Reason: {0}")]
    Transport(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("Failed to connect to {handle}. Reason: {reason}")]
    Device {
        handle: DeviceHandle,
        reason: String,
    },
    #[error("Failed to connect. Reason: {0}")]
    Other(String),
}

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("Timed out waiting for a response.")]
    Timeout,
    #[error("Connection closed by device.")]
    Closed,
    /// The response did not match the expected schema.
    #[error("Malformed response: {0}")]
    Malformed(String),
    /// The device answered but refused the command.
    #[error("Command rejected: {0}")]
    Rejected(String),
}
