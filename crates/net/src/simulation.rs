//! The game-specific side of a server session.

use std::net::SocketAddr;

use crate::server::Notifier;
use crate::time::GameTime;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SimulationError {
    #[error("level '{0}' not found")]
    LevelNotFound(String),
    #[error("no level is loaded")]
    NoLevel,
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalDecision {
    pub accept: bool,
    /// Sent to the client when the connection is denied.
    pub reason: String,
}

impl ApprovalDecision {
    pub fn accept() -> Self {
        Self {
            accept: true,
            reason: String::new(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            accept: false,
            reason: reason.into(),
        }
    }
}

/// Authoritative game state driven by the session loop. All calls arrive on
/// the session thread.
pub trait Simulation: Send {
    fn load_level(&mut self, level: &str) -> Result<(), SimulationError>;

    fn unload_level(&mut self);

    /// Advances one fixed step and returns the full serialized state.
    fn advance_tick(&mut self, time: &GameTime) -> Result<Vec<u8>, SimulationError>;

    fn approve_connection(
        &mut self,
        identity: SocketAddr,
        hail: &[u8],
    ) -> Result<ApprovalDecision, SimulationError>;

    fn on_client_connected(&mut self, identity: SocketAddr, hail: &[u8]);

    fn on_client_disconnected(&mut self, identity: SocketAddr, reason: &str);

    /// The client acknowledged its first snapshot.
    fn on_client_activated(&mut self, _identity: SocketAddr) {}

    fn on_client_deactivated(&mut self, _identity: SocketAddr) {}

    /// `lag` is the one-way latency estimate in seconds.
    fn feed_user_command(
        &mut self,
        identity: SocketAddr,
        command: &[u8],
        command_id: u32,
        lag: f32,
    ) -> Result<(), SimulationError>;

    fn feed_notification(&mut self, identity: SocketAddr, text: &str);

    /// Answer to approval handshakes and discovery requests.
    fn describe_server(&self) -> String;

    /// Game-specific administrative commands.
    fn execute_command(&mut self, command: &str) -> Result<(), SimulationError> {
        Err(SimulationError::UnknownCommand(command.to_string()))
    }

    /// Hands the simulation a way to broadcast notifications from its tick.
    fn attach_notifier(&mut self, _notifier: Notifier) {}
}
