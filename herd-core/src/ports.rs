//! Port candidates and local port probes

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

const LOCAL_CONNECT_TIMEOUT: Duration = Duration::from_millis(200);

/// A request for a port: either one exact port or an ordered list to choose from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortCandidates {
    /// Exactly this port; occupation is a `PortInUse` error
    Single(u16),
    /// The first free port in order; exhaustion is a `NoPortsLeft` error
    List(Vec<u16>),
}

impl PortCandidates {
    /// Candidate ports in scan order
    pub fn ports(&self) -> Vec<u16> {
        match self {
            PortCandidates::Single(port) => vec![*port],
            PortCandidates::List(ports) => ports.clone(),
        }
    }

    pub fn is_single(&self) -> bool {
        matches!(self, PortCandidates::Single(_))
    }
}

impl From<u16> for PortCandidates {
    fn from(port: u16) -> Self {
        PortCandidates::Single(port)
    }
}

impl From<Vec<u16>> for PortCandidates {
    fn from(ports: Vec<u16>) -> Self {
        PortCandidates::List(ports)
    }
}

impl From<PortRange> for PortCandidates {
    fn from(range: PortRange) -> Self {
        PortCandidates::List(range.to_vec())
    }
}

/// Inclusive port range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn to_vec(&self) -> Vec<u16> {
        (self.start..=self.end).collect()
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }
}

/// Check whether `port` is free on the control node.
///
/// A port counts as free when nothing accepts connections on it and it can
/// be bound on the loopback interface.
pub async fn local_port_is_free(port: u16) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    if let Ok(Ok(_)) = tokio::time::timeout(LOCAL_CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        return false;
    }
    TcpListener::bind(addr).await.is_ok()
}

/// Ports of `ports` that come after `chosen`; the whole list if `chosen` is absent
pub fn remaining_ports(ports: &[u16], chosen: u16) -> Vec<u16> {
    match ports.iter().position(|p| *p == chosen) {
        Some(index) => ports[index + 1..].to_vec(),
        None => ports.to_vec(),
    }
}
