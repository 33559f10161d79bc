//! Client side of a session: one logical channel to one server.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

use crate::config::ClientConfig;
use crate::protocol::{Message, SnapshotMessage, UserCommand};
use crate::snapshot::{QueueError, SnapshotQueue};
use crate::time::GameTime;
use crate::transport::{
    Delivery, Incoming, NetEvent, PeerStatus, Transport, TransportError, TransportFactory,
};

/// Presentation side of a client. Every call arrives from
/// [`ClientChannel::dispatch`] or [`ClientChannel::update`].
pub trait ClientGame: Send {
    /// Hail sent with the connection request.
    fn user_info(&self) -> Vec<u8>;

    fn on_connected(&mut self, server_info: &str);

    fn apply_snapshot(&mut self, frame: u32, snapshot: &[u8]);

    fn on_notification(&mut self, text: &str);

    /// Input for this frame, if any.
    fn next_command(&mut self, time: &GameTime) -> Option<Vec<u8>>;

    fn on_disconnected(&mut self, reason: &str);

    /// Shows a user-visible error.
    fn show_error(&mut self, message: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to resolve {host}: {source}")]
    Resolve { host: String, source: io::Error },
    #[error("{0} did not resolve to any address")]
    NoAddress(String),
    #[error("not connected")]
    NotConnected,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub struct ClientChannel<G: ClientGame> {
    game: G,
    transports: Box<dyn TransportFactory>,
    config: ClientConfig,
    transport: Option<Box<dyn Transport>>,
    server: Option<SocketAddr>,
    server_info: String,
    state: LinkState,
    standby: bool,
    snapshots: SnapshotQueue,
    command_id: u32,
}

impl<G: ClientGame> ClientChannel<G> {
    pub fn new<F>(game: G, transports: F, config: ClientConfig) -> Self
    where
        F: TransportFactory + 'static,
    {
        let snapshots = SnapshotQueue::new(config.snapshot_queue_capacity);
        Self {
            game,
            transports: Box::new(transports),
            config,
            transport: None,
            server: None,
            server_info: String::new(),
            state: LinkState::Disconnected,
            standby: false,
            snapshots,
            command_id: 0,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// True after a fault forced the channel down; cleared by `connect`.
    pub fn is_standby(&self) -> bool {
        self.standby
    }

    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.server
    }

    pub fn server_info(&self) -> &str {
        &self.server_info
    }

    /// Last snapshot frame applied; sent back as the ack in every command.
    pub fn last_frame(&self) -> u32 {
        self.snapshots.last_frame()
    }

    pub fn game(&self) -> &G {
        &self.game
    }

    pub fn game_mut(&mut self) -> &mut G {
        &mut self.game
    }

    /// Opens a fresh transport and starts the handshake with `host:port`.
    /// On failure the error is shown to the user and the channel stays down.
    pub fn connect(&mut self, host: &str, port: u16) -> Result<(), ClientError> {
        if self.state != LinkState::Disconnected {
            self.disconnect();
        }

        match self.open(host, port) {
            Ok(server) => {
                log::info!("CL: Connecting to {server}");
                Ok(())
            }
            Err(err) => {
                log::error!("CL: Failed to connect to {host}:{port}: {err}");
                self.game.show_error(&err.to_string());
                self.enter_standby();
                Err(err)
            }
        }
    }

    fn open(&mut self, host: &str, port: u16) -> Result<SocketAddr, ClientError> {
        let server = resolve(host, port)?;

        // a new transport per attempt so no sequence state survives a reconnect
        let mut transport = self.transports.create()?;
        transport.connect(server, &self.game.user_info())?;

        self.transport = Some(transport);
        self.server = Some(server);
        self.server_info.clear();
        self.state = LinkState::Connecting;
        self.standby = false;
        self.snapshots.clear();
        self.command_id = 0;
        Ok(server)
    }

    /// Tears down the channel. Safe to call at any time, any number of times.
    pub fn disconnect(&mut self) {
        let was_connected = self.state == LinkState::Connected;
        if let (Some(transport), Some(server)) = (self.transport.as_mut(), self.server)
            && let Err(err) = transport.disconnect(server, "Client disconnected")
        {
            log::debug!("CL: Disconnect from {server}: {err}");
        }
        self.release("Client disconnected");
        if was_connected {
            log::info!("CL: Disconnected");
            self.game.on_disconnected("Client disconnected");
        }
    }

    fn release(&mut self, reason: &str) {
        if let Some(mut transport) = self.transport.take() {
            transport.shutdown(reason);
        }
        self.server = None;
        self.state = LinkState::Disconnected;
        self.snapshots.clear();
    }

    fn enter_standby(&mut self) {
        self.release("Client error");
        self.standby = true;
    }

    /// Handles every pending inbound event. A transport fault is logged,
    /// shown to the user and leaves the channel in standby; it never
    /// reaches the caller.
    pub fn dispatch(&mut self) {
        if let Err(err) = self.pump() {
            self.fault(&err);
        }
    }

    fn fault(&mut self, err: &TransportError) {
        log::error!("CL: Network fault: {err}");
        self.game.show_error(&format!("Network error: {err}"));
        if self.state == LinkState::Connected {
            self.game.on_disconnected("Network error");
        }
        self.enter_standby();
    }

    fn pump(&mut self) -> Result<(), TransportError> {
        for _ in 0..self.config.max_events_per_tick {
            let Some(transport) = self.transport.as_mut() else {
                break;
            };
            let Some(incoming) = transport.receive()? else {
                break;
            };
            self.handle(incoming);
        }
        Ok(())
    }

    fn handle(&mut self, incoming: Incoming) {
        let Incoming { sender, event } = incoming;
        if let NetEvent::Diagnostic { level, text } = &event {
            log::log!(*level, "CL: {text}");
            return;
        }
        if self.server != Some(sender) {
            log::warn!(
                "CL: Dropped message from {sender}, not the server ({:?})",
                self.server
            );
            return;
        }

        match event {
            NetEvent::StatusChanged {
                status,
                reason,
                hail,
            } => self.on_status_changed(status, &reason, &hail),
            NetEvent::Data { payload, .. } => self.on_data(&payload),
            NetEvent::ConnectionApproval { .. } => {
                log::warn!("CL: Unexpected connection request from {sender}");
            }
            NetEvent::DiscoveryRequest | NetEvent::DiscoveryResponse { .. } => {
                log::debug!("CL: Ignoring discovery traffic from {sender}");
            }
            NetEvent::Diagnostic { .. } => {}
        }
    }

    fn on_status_changed(&mut self, status: PeerStatus, reason: &str, hail: &[u8]) {
        match status {
            PeerStatus::Connected => {
                self.state = LinkState::Connected;
                self.server_info = String::from_utf8_lossy(hail).into_owned();
                log::info!("CL: Connected: {}", self.server_info);
                self.game.on_connected(&self.server_info);
            }
            PeerStatus::Disconnected => {
                log::info!("CL: Disconnected: {reason}");
                self.release(reason);
                self.game.on_disconnected(reason);
            }
            PeerStatus::Connecting => self.state = LinkState::Connecting,
        }
    }

    fn on_data(&mut self, payload: &[u8]) {
        match Message::decode(payload) {
            Ok(Message::Snapshot(snapshot)) => self.on_snapshot(snapshot),
            Ok(Message::Notification(text)) => self.game.on_notification(&text),
            Ok(Message::UserCommand(_)) => log::warn!("CL: Unexpected user command from server"),
            Err(err) => log::warn!("CL: Dropped message: {err}"),
        }
    }

    fn on_snapshot(&mut self, message: SnapshotMessage) {
        match self
            .snapshots
            .decompress(message.frame, message.base_frame, &message.patch)
        {
            Ok(snapshot) => self.game.apply_snapshot(snapshot.frame(), snapshot.payload()),
            Err(QueueError::NonIncreasingFrame { frame, last }) => {
                log::debug!("CL: Stale snapshot {frame}, already at {last}");
            }
            Err(err) => log::warn!("CL: Dropped snapshot {}: {err}", message.frame),
        }
    }

    /// Dispatches, then sends this frame's command (if the game has one)
    /// acknowledging the last applied snapshot.
    pub fn update(&mut self, time: &GameTime) {
        self.dispatch();
        if self.state != LinkState::Connected {
            return;
        }
        let Some(payload) = self.game.next_command(time) else {
            return;
        };

        self.command_id = self.command_id.wrapping_add(1);
        let message = Message::UserCommand(UserCommand {
            snapshot_id: self.snapshots.last_frame(),
            command_id: self.command_id,
            payload,
        });
        if let Err(err) = self.send(&message, Delivery::UnreliableSequenced) {
            self.fault(&err);
        }
    }

    /// Sends a chat-style notification to the server.
    pub fn send_notification(&mut self, text: &str) -> Result<(), ClientError> {
        if self.state != LinkState::Connected {
            return Err(ClientError::NotConnected);
        }
        let message = Message::Notification(text.to_string());
        self.send(&message, Delivery::ReliableOrdered)
            .map_err(ClientError::from)
    }

    fn send(&mut self, message: &Message, delivery: Delivery) -> Result<(), TransportError> {
        match (self.transport.as_mut(), self.server) {
            (Some(transport), Some(server)) => transport.send(server, &message.encode(), delivery),
            _ => Err(TransportError::Closed),
        }
    }
}

impl<G: ClientGame> Drop for ClientChannel<G> {
    fn drop(&mut self) {
        if self.transport.is_some() {
            self.disconnect();
        }
    }
}

/// Resolves `host:port`, preferring IPv4.
fn resolve(host: &str, port: u16) -> Result<SocketAddr, ClientError> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|source| ClientError::Resolve {
            host: host.to_string(),
            source,
        })?
        .collect();
    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| ClientError::NoAddress(host.to_string()))
}
