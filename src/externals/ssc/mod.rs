//! Adapters for speakers that speak Sennheiser Sound Control (SSC): mDNS
//! discovery, TCP connections, and newline-delimited JSON messages.

pub mod connector;
pub mod link;
pub mod message;
pub mod probe;
