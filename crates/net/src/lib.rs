pub mod arena;
pub mod client;
pub mod config;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod simulation;
pub mod snapshot;
pub mod time;
pub mod transport;
mod wire;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use client::{ClientChannel, ClientError, ClientGame, LinkState};
pub use config::{ClientConfig, ServerConfig};
pub use protocol::{Message, NetCommand, ProtocolError, SnapshotMessage, UserCommand};
pub use registry::{AckOutcome, Approval, Connection, ConnectionRegistry, ConnectionState};
pub use server::{
    AdminCommand, GameServer, Notifier, ServerError, ServerHandle, ServerStatus, SessionFault,
    SessionState,
};
pub use simulation::{ApprovalDecision, Simulation, SimulationError};
pub use snapshot::{Compressed, DeltaError, QueueError, Snapshot, SnapshotQueue};
pub use time::{GameTime, TickClock};
pub use transport::{
    Delivery, Incoming, LoopbackNetwork, LoopbackTransport, LossSimulation, MAX_DATAGRAM_SIZE,
    NetEvent, NetworkStats, PeerStatus, Transport, TransportError, TransportFactory, UdpConfig,
    UdpTransport,
};
pub use wire::WireError;

pub const DEFAULT_PORT: u16 = 27015;
pub const DEFAULT_TICK_RATE: u32 = 60;

/// Locks a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
