#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use log::Log;
use snapnet::{
    ApprovalDecision, Delivery, GameServer, GameTime, LoopbackNetwork, LoopbackTransport, Message,
    NetEvent, ServerConfig, Simulation, SimulationError, SnapshotMessage, Transport,
    TransportError, UserCommand,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn server_addr() -> SocketAddr {
    "127.0.0.1:27015".parse().unwrap()
}

/// Forwards to env_logger and keeps every warning so tests can check what
/// was reported.
struct CapturingLogger {
    inner: env_logger::Logger,
    warnings: Mutex<Vec<String>>,
}

impl Log for CapturingLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::Level::Warn || self.inner.enabled(metadata)
    }

    fn log(&self, record: &log::Record) {
        if record.level() <= log::Level::Warn {
            self.warnings.lock().unwrap().push(record.args().to_string());
        }
        if self.inner.matches(record) {
            self.inner.log(record);
        }
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

static LOGGER: OnceLock<CapturingLogger> = OnceLock::new();

pub fn init_logging() {
    let logger = LOGGER.get_or_init(|| CapturingLogger {
        inner: env_logger::builder().is_test(true).build(),
        warnings: Mutex::new(Vec::new()),
    });
    if log::set_logger(logger).is_ok() {
        log::set_max_level(logger.inner.filter().max(log::LevelFilter::Warn));
    }
}

/// Warnings logged so far by any test in this binary.
pub fn warnings() -> Vec<String> {
    LOGGER
        .get()
        .map(|logger| logger.warnings.lock().unwrap().clone())
        .unwrap_or_default()
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

#[derive(Debug, Clone, PartialEq)]
pub enum SimEvent {
    Loaded(String),
    Unloaded,
    Connected(SocketAddr, Vec<u8>),
    Disconnected(SocketAddr, String),
    Activated(SocketAddr),
    Deactivated(SocketAddr),
    Command {
        identity: SocketAddr,
        command_id: u32,
        payload: Vec<u8>,
    },
    Notification(SocketAddr, String),
    Executed(String),
}

#[derive(Debug, Clone, Default)]
pub struct SimLog(Arc<Mutex<Vec<SimEvent>>>);

impl SimLog {
    pub fn push(&self, event: SimEvent) {
        self.0.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<SimEvent> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, mut predicate: impl FnMut(&SimEvent) -> bool) -> usize {
        self.0.lock().unwrap().iter().filter(|e| predicate(e)).count()
    }

    pub fn contains(&self, event: &SimEvent) -> bool {
        self.0.lock().unwrap().contains(event)
    }
}

/// Simulation that records every callback and can be told to misbehave.
#[derive(Debug, Default)]
pub struct RecordingSimulation {
    pub log: SimLog,
    pub deny: Option<String>,
    pub fail_at_frame: Option<u32>,
    pub panic_at_frame: Option<u32>,
    pub snapshot_size: usize,
}

impl RecordingSimulation {
    pub fn new() -> (Self, SimLog) {
        let sim = Self {
            snapshot_size: 256,
            ..Self::default()
        };
        let log = sim.log.clone();
        (sim, log)
    }
}

impl Simulation for RecordingSimulation {
    fn load_level(&mut self, level: &str) -> Result<(), SimulationError> {
        if level == "missing" {
            return Err(SimulationError::LevelNotFound(level.to_string()));
        }
        self.log.push(SimEvent::Loaded(level.to_string()));
        Ok(())
    }

    fn unload_level(&mut self) {
        self.log.push(SimEvent::Unloaded);
    }

    fn advance_tick(&mut self, time: &GameTime) -> Result<Vec<u8>, SimulationError> {
        if self.fail_at_frame == Some(time.frame) {
            return Err(SimulationError::Failed("boom".to_string()));
        }
        if self.panic_at_frame == Some(time.frame) {
            panic!("kaboom");
        }
        let mut snapshot = vec![0u8; self.snapshot_size.max(4)];
        snapshot[..4].copy_from_slice(&time.frame.to_le_bytes());
        Ok(snapshot)
    }

    fn approve_connection(
        &mut self,
        _identity: SocketAddr,
        _hail: &[u8],
    ) -> Result<ApprovalDecision, SimulationError> {
        Ok(match &self.deny {
            Some(reason) => ApprovalDecision::deny(reason.clone()),
            None => ApprovalDecision::accept(),
        })
    }

    fn on_client_connected(&mut self, identity: SocketAddr, hail: &[u8]) {
        self.log.push(SimEvent::Connected(identity, hail.to_vec()));
    }

    fn on_client_disconnected(&mut self, identity: SocketAddr, reason: &str) {
        self.log
            .push(SimEvent::Disconnected(identity, reason.to_string()));
    }

    fn on_client_activated(&mut self, identity: SocketAddr) {
        self.log.push(SimEvent::Activated(identity));
    }

    fn on_client_deactivated(&mut self, identity: SocketAddr) {
        self.log.push(SimEvent::Deactivated(identity));
    }

    fn feed_user_command(
        &mut self,
        identity: SocketAddr,
        command: &[u8],
        command_id: u32,
        _lag: f32,
    ) -> Result<(), SimulationError> {
        self.log.push(SimEvent::Command {
            identity,
            command_id,
            payload: command.to_vec(),
        });
        Ok(())
    }

    fn feed_notification(&mut self, identity: SocketAddr, text: &str) {
        self.log
            .push(SimEvent::Notification(identity, text.to_string()));
    }

    fn describe_server(&self) -> String {
        "recording server".to_string()
    }

    fn execute_command(&mut self, command: &str) -> Result<(), SimulationError> {
        if command.starts_with("spawn") {
            self.log.push(SimEvent::Executed(command.to_string()));
            Ok(())
        } else {
            Err(SimulationError::UnknownCommand(command.to_string()))
        }
    }
}

pub fn loopback_server(
    sim: RecordingSimulation,
    config: ServerConfig,
) -> (GameServer, LoopbackNetwork) {
    init_logging();
    let network = LoopbackNetwork::new();
    let listen_on = network.clone();
    let factory = move || -> Result<Box<dyn Transport>, TransportError> {
        Ok(Box::new(listen_on.listen(server_addr())?))
    };
    (GameServer::new(sim, factory, config), network)
}

/// A bare transport speaking the wire protocol, for watching exactly what
/// the server sends.
pub struct RawClient {
    pub transport: LoopbackTransport,
}

impl RawClient {
    pub fn connect(network: &LoopbackNetwork, hail: &[u8]) -> Self {
        let mut transport = network.open();
        transport.connect(server_addr(), hail).unwrap();
        Self { transport }
    }

    pub fn addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// Waits for the first event `pick` accepts, discarding the rest.
    pub fn wait_for<T>(&mut self, mut pick: impl FnMut(&NetEvent) -> Option<T>) -> Option<T> {
        let deadline = Instant::now() + TIMEOUT;
        while Instant::now() < deadline {
            match self.transport.receive() {
                Ok(Some(incoming)) => {
                    if let Some(found) = pick(&incoming.event) {
                        return Some(found);
                    }
                }
                Ok(None) => thread::sleep(Duration::from_millis(1)),
                Err(_) => return None,
            }
        }
        None
    }

    pub fn wait_connected(&mut self) -> bool {
        self.wait_for(|event| match event {
            NetEvent::StatusChanged {
                status: snapnet::PeerStatus::Connected,
                ..
            } => Some(()),
            _ => None,
        })
        .is_some()
    }

    pub fn wait_disconnected(&mut self) -> Option<String> {
        self.wait_for(|event| match event {
            NetEvent::StatusChanged {
                status: snapnet::PeerStatus::Disconnected,
                reason,
                ..
            } => Some(reason.clone()),
            _ => None,
        })
    }

    pub fn wait_snapshot(&mut self) -> Option<(SnapshotMessage, Delivery)> {
        self.wait_for(|event| match event {
            NetEvent::Data { payload, delivery } => match Message::decode(payload) {
                Ok(Message::Snapshot(snapshot)) => Some((snapshot, *delivery)),
                _ => None,
            },
            _ => None,
        })
    }

    pub fn wait_notification(&mut self) -> Option<(String, Delivery)> {
        self.wait_for(|event| match event {
            NetEvent::Data { payload, delivery } => match Message::decode(payload) {
                Ok(Message::Notification(text)) => Some((text, *delivery)),
                _ => None,
            },
            _ => None,
        })
    }

    pub fn send_command(&mut self, snapshot_id: u32, command_id: u32, payload: &[u8]) {
        let message = Message::UserCommand(UserCommand {
            snapshot_id,
            command_id,
            payload: payload.to_vec(),
        });
        self.transport
            .send(server_addr(), &message.encode(), Delivery::UnreliableSequenced)
            .unwrap();
    }
}
