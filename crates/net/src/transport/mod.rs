//! Message transports underneath the session loop and client channel.
//!
//! A [`Transport`] is polled, never awaited: `receive` returns `Ok(None)` as
//! soon as nothing is pending.

mod loopback;
mod packet;
mod peer;
mod simulator;
mod stats;
mod tracking;
mod udp;

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

pub use loopback::{LoopbackNetwork, LoopbackTransport};
pub use packet::{
    MAX_DATAGRAM_SIZE, PROTOCOL_MAGIC, PROTOCOL_VERSION, Packet, PacketBody, PacketError,
    PacketHeader, sequence_greater_than,
};
pub use stats::{LossSimulation, NetworkStats};
pub use udp::{UdpConfig, UdpTransport};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Delivery {
    Unreliable = 0,
    /// Unreliable; anything older than the newest message received is dropped.
    UnreliableSequenced = 1,
    /// Resent until acked; stale messages are dropped on arrival.
    ReliableSequenced = 2,
    /// Resent until acked and delivered strictly in send order.
    ReliableOrdered = 3,
}

impl Delivery {
    pub const ALL: [Delivery; 4] = [
        Delivery::Unreliable,
        Delivery::UnreliableSequenced,
        Delivery::ReliableSequenced,
        Delivery::ReliableOrdered,
    ];

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    pub fn is_reliable(self) -> bool {
        matches!(self, Delivery::ReliableSequenced | Delivery::ReliableOrdered)
    }

    pub fn is_sequenced(self) -> bool {
        !matches!(self, Delivery::Unreliable)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerStatus {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NetEvent {
    /// A remote peer asks to connect; answer with `approve` or `deny`.
    ConnectionApproval { hail: Vec<u8> },
    StatusChanged {
        status: PeerStatus,
        reason: String,
        /// The peer's hail on the server side, the approval response on the
        /// client side.
        hail: Vec<u8>,
    },
    Data { payload: Vec<u8>, delivery: Delivery },
    DiscoveryRequest,
    DiscoveryResponse { info: Vec<u8> },
    Diagnostic { level: log::Level, text: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Incoming {
    pub sender: SocketAddr,
    pub event: NetEvent,
}

impl Incoming {
    pub fn new(sender: SocketAddr, event: NetEvent) -> Self {
        Self { sender, event }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),
    #[error("no connection to {0}")]
    UnknownPeer(SocketAddr),
    #[error("failed to connect to {addr}: {reason}")]
    ConnectFailed { addr: String, reason: String },
    #[error("address {0} is already in use")]
    AddressInUse(SocketAddr),
    #[error("transport is shut down")]
    Closed,
    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
    #[error("transport fault: {0}")]
    Fault(String),
}

pub trait Transport: Send {
    fn local_addr(&self) -> SocketAddr;

    /// Starts the handshake with `remote`, carrying `hail` for its approval.
    fn connect(&mut self, remote: SocketAddr, hail: &[u8]) -> Result<(), TransportError>;

    fn receive(&mut self) -> Result<Option<Incoming>, TransportError>;

    fn send(
        &mut self,
        peer: SocketAddr,
        payload: &[u8],
        delivery: Delivery,
    ) -> Result<(), TransportError>;

    fn approve(&mut self, peer: SocketAddr, response: &[u8]) -> Result<(), TransportError>;

    fn deny(&mut self, peer: SocketAddr, reason: &str) -> Result<(), TransportError>;

    fn disconnect(&mut self, peer: SocketAddr, reason: &str) -> Result<(), TransportError>;

    fn respond_discovery(&mut self, peer: SocketAddr, info: &[u8])
    -> Result<(), TransportError>;

    /// Peers that completed the handshake.
    fn connections(&self) -> Vec<SocketAddr>;

    fn round_trip(&self, _peer: SocketAddr) -> Option<Duration> {
        None
    }

    fn stats(&self) -> NetworkStats {
        NetworkStats::default()
    }

    /// Disconnects every peer with `reason` and releases the endpoint.
    fn shutdown(&mut self, reason: &str);
}

/// Builds a fresh transport for each server run or client connect.
pub trait TransportFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn Transport>, TransportError>;
}

impl<F> TransportFactory for F
where
    F: Fn() -> Result<Box<dyn Transport>, TransportError> + Send + Sync,
{
    fn create(&self) -> Result<Box<dyn Transport>, TransportError> {
        self()
    }
}
