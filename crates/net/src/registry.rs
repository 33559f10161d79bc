//! Per-client connection state owned by the session loop.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

use crate::lock;
use crate::simulation::{ApprovalDecision, Simulation, SimulationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Approval {
    Pending,
    Approved,
    Denied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub identity: SocketAddr,
    pub hail: Vec<u8>,
    pub approval: Approval,
    pub state: ConnectionState,
    /// 0 until the client acknowledges its first snapshot.
    pub last_acked_frame: u32,
    pub active: bool,
}

impl Connection {
    fn new(identity: SocketAddr, hail: Vec<u8>) -> Self {
        Self {
            identity,
            hail,
            approval: Approval::Pending,
            state: ConnectionState::Connecting,
            last_acked_frame: 0,
            active: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// First nonzero ack; the client is now active.
    Activated,
    Updated,
    /// Same frame as the last ack.
    Duplicate,
    /// Older than the last ack.
    Stale,
    Unknown,
}

/// All remote connections behind one coarse lock. The simulation is never
/// called while the lock is held.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<SocketAddr, Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks the simulation whether `identity` may join and records the
    /// answer. A denied connection stays in the terminal Denied state until
    /// [`forget_denied`](Self::forget_denied) drops it.
    pub fn approve(
        &self,
        sim: &mut dyn Simulation,
        identity: SocketAddr,
        hail: &[u8],
    ) -> Result<ApprovalDecision, SimulationError> {
        lock(&self.connections)
            .entry(identity)
            .and_modify(|connection| {
                if connection.approval == Approval::Denied {
                    *connection = Connection::new(identity, hail.to_vec());
                }
            })
            .or_insert_with(|| Connection::new(identity, hail.to_vec()));

        let decision = match sim.approve_connection(identity, hail) {
            Ok(decision) => decision,
            Err(err) => {
                lock(&self.connections).remove(&identity);
                return Err(err);
            }
        };

        if let Some(connection) = lock(&self.connections).get_mut(&identity) {
            if decision.accept {
                connection.approval = Approval::Approved;
                connection.hail = hail.to_vec();
            } else {
                connection.approval = Approval::Denied;
            }
        }
        Ok(decision)
    }

    /// Drops a denied connection once the transport has turned it away.
    /// Returns false for anything not in the Denied state.
    pub fn forget_denied(&self, identity: SocketAddr) -> bool {
        let mut connections = lock(&self.connections);
        let denied = connections
            .get(&identity)
            .is_some_and(|connection| connection.approval == Approval::Denied);
        if denied {
            connections.remove(&identity);
        }
        denied
    }

    /// Marks an approved connection as connected. Returns false (and tells
    /// nobody) for identities that were never approved.
    pub fn on_connected(&self, sim: &mut dyn Simulation, identity: SocketAddr, hail: &[u8]) -> bool {
        {
            let mut connections = lock(&self.connections);
            match connections.get_mut(&identity) {
                Some(connection) if connection.approval == Approval::Approved => {
                    connection.state = ConnectionState::Connected;
                }
                _ => return false,
            }
        }
        sim.on_client_connected(identity, hail);
        true
    }

    /// Removes `identity`. The simulation hears about it only if the
    /// connection had reached Connected.
    pub fn on_disconnected(
        &self,
        sim: &mut dyn Simulation,
        identity: SocketAddr,
        reason: &str,
    ) -> Option<Connection> {
        let mut connection = lock(&self.connections).remove(&identity)?;
        let was_connected = connection.state == ConnectionState::Connected;
        connection.state = ConnectionState::Disconnected;

        if was_connected {
            if connection.active {
                sim.on_client_deactivated(identity);
            }
            sim.on_client_disconnected(identity, reason);
        }
        Some(connection)
    }

    /// Records the frame a client reports as applied. Only a newer frame moves
    /// `last_acked_frame`, so a repeated ack updates it exactly once.
    pub fn record_ack(&self, identity: SocketAddr, frame: u32) -> AckOutcome {
        let mut connections = lock(&self.connections);
        let Some(connection) = connections
            .get_mut(&identity)
            .filter(|connection| connection.state == ConnectionState::Connected)
        else {
            return AckOutcome::Unknown;
        };

        if frame == connection.last_acked_frame {
            return AckOutcome::Duplicate;
        }
        if frame < connection.last_acked_frame {
            return AckOutcome::Stale;
        }

        connection.last_acked_frame = frame;
        if connection.active {
            AckOutcome::Updated
        } else {
            connection.active = true;
            AckOutcome::Activated
        }
    }

    /// Identities to send snapshots to, with the ack each one holds now.
    pub fn snapshot_targets(&self) -> Vec<(SocketAddr, u32)> {
        lock(&self.connections)
            .values()
            .filter(|connection| {
                connection.approval == Approval::Approved
                    && connection.state == ConnectionState::Connected
            })
            .map(|connection| (connection.identity, connection.last_acked_frame))
            .collect()
    }

    pub fn connected(&self) -> Vec<SocketAddr> {
        lock(&self.connections)
            .values()
            .filter(|connection| connection.state == ConnectionState::Connected)
            .map(|connection| connection.identity)
            .collect()
    }

    pub fn get(&self, identity: SocketAddr) -> Option<Connection> {
        lock(&self.connections).get(&identity).cloned()
    }

    pub fn list(&self) -> Vec<Connection> {
        let mut list: Vec<Connection> = lock(&self.connections).values().cloned().collect();
        list.sort_by_key(|connection| connection.identity);
        list
    }

    pub fn len(&self) -> usize {
        lock(&self.connections).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.connections).is_empty()
    }

    /// Drops every connection, firing the same callbacks as a disconnect.
    pub fn clear(&self, sim: &mut dyn Simulation, reason: &str) {
        let identities: Vec<SocketAddr> = lock(&self.connections).keys().copied().collect();
        for identity in identities {
            self.on_disconnected(sim, identity, reason);
        }
    }
}
