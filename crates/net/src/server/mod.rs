//! The authoritative server: one session thread per running instance.

mod commands;
mod notify;
mod session;

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

pub use commands::{AdminCommand, CommandError, CommandQueue};
pub use notify::Notifier;
pub use session::SessionFault;

use crate::config::ServerConfig;
use crate::lock;
use crate::registry::{Connection, ConnectionRegistry};
use crate::simulation::Simulation;
use crate::transport::{NetworkStats, TransportFactory};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("server is already running ({0:?})")]
    AlreadyRunning(SessionState),
    #[error("failed to spawn the session thread: {0}")]
    Spawn(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct ServerStatus {
    pub state: SessionState,
    pub frame: u32,
    pub level: Option<String>,
    pub local_addr: Option<SocketAddr>,
    pub connections: Vec<Connection>,
    pub stats: NetworkStats,
    pub pending_notifications: usize,
}

struct Shared {
    config: ServerConfig,
    state: Mutex<SessionState>,
    cancel: AtomicBool,
    simulation: Mutex<Box<dyn Simulation>>,
    transports: Box<dyn TransportFactory>,
    registry: ConnectionRegistry,
    notifier: Notifier,
    commands: CommandQueue,
    frame: AtomicU32,
    level: Mutex<Option<String>>,
    local_addr: Mutex<Option<SocketAddr>>,
    stats: Mutex<NetworkStats>,
}

impl Shared {
    fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    fn set_state(&self, state: SessionState) {
        *lock(&self.state) = state;
    }

    /// Only raises the cancellation flag; the session thread does the rest.
    fn stop(&self) {
        let mut state = lock(&self.state);
        match *state {
            SessionState::Running => {
                log::info!("SV: Stopping server");
                *state = SessionState::Stopping;
                self.cancel.store(true, Ordering::SeqCst);
            }
            SessionState::Starting => {
                log::info!("SV: Stop requested while starting");
                self.cancel.store(true, Ordering::SeqCst);
            }
            SessionState::Stopping => {}
            SessionState::Stopped => log::debug!("SV: Server is not running"),
        }
    }

    /// Drops commands and notifications left over from outside a session so
    /// that they never reach the next one.
    fn discard_pending(&self) {
        for line in self.commands.drain() {
            log::warn!("SV: Discarding command '{line}' queued outside a session");
        }
        let notifications = self.notifier.drain();
        if !notifications.is_empty() {
            log::debug!("SV: Discarding {} undelivered notification(s)", notifications.len());
        }
    }

    fn status(&self) -> ServerStatus {
        ServerStatus {
            state: self.state(),
            frame: self.frame.load(Ordering::Relaxed),
            level: lock(&self.level).clone(),
            local_addr: *lock(&self.local_addr),
            connections: self.registry.list(),
            stats: lock(&self.stats).clone(),
            pending_notifications: self.notifier.len(),
        }
    }
}

/// Cheap handle for other threads (consoles, signal handlers) to observe and
/// steer a running server.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

impl ServerHandle {
    pub fn stop(&self) {
        self.shared.stop();
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn status(&self) -> ServerStatus {
        self.shared.status()
    }

    pub fn notify_clients(&self, text: impl Into<String>) {
        self.shared.notifier.push(text);
    }

    /// Queues an administrative command for the next tick.
    pub fn push_command(&self, command: impl Into<String>) {
        self.shared.commands.push(command);
    }
}

pub struct GameServer {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl GameServer {
    pub fn new<S, F>(simulation: S, transports: F, config: ServerConfig) -> Self
    where
        S: Simulation + 'static,
        F: TransportFactory + 'static,
    {
        let notifier = Notifier::new();
        let mut simulation: Box<dyn Simulation> = Box::new(simulation);
        simulation.attach_notifier(notifier.clone());

        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(SessionState::Stopped),
                cancel: AtomicBool::new(false),
                simulation: Mutex::new(simulation),
                transports: Box::new(transports),
                registry: ConnectionRegistry::new(),
                notifier,
                commands: CommandQueue::new(),
                frame: AtomicU32::new(0),
                level: Mutex::new(None),
                local_addr: Mutex::new(None),
                stats: Mutex::new(NetworkStats::default()),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Spawns the session thread, which opens the transport, loads `level`
    /// and queues `post_start_command` before entering the tick loop.
    pub fn start(&self, level: &str, post_start_command: Option<&str>) -> Result<(), ServerError> {
        let mut state = lock(&self.shared.state);
        if *state != SessionState::Stopped {
            log::warn!("SV: Server is already running");
            return Err(ServerError::AlreadyRunning(*state));
        }

        // a previous session has already reported Stopped
        if let Some(previous) = lock(&self.worker).take()
            && previous.join().is_err()
        {
            log::error!("SV: Previous session thread panicked");
        }

        *state = SessionState::Starting;
        self.shared.cancel.store(false, Ordering::SeqCst);
        self.shared.discard_pending();
        drop(state);

        let shared = Arc::clone(&self.shared);
        let level = level.to_string();
        let post_start_command = post_start_command.map(str::to_string);
        let spawned = thread::Builder::new()
            .name("snapnet-session".to_string())
            .spawn(move || session::run(&shared, &level, post_start_command));

        match spawned {
            Ok(handle) => {
                *lock(&self.worker) = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.shared.set_state(SessionState::Stopped);
                Err(ServerError::Spawn(err))
            }
        }
    }

    /// Requests a stop. Safe to call repeatedly and from any thread.
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// Blocks until the session thread has finished its teardown.
    pub fn wait(&self) {
        let Some(handle) = lock(&self.worker).take() else {
            return;
        };
        if handle.join().is_err() {
            log::error!("SV: Session thread panicked during teardown");
            self.shared.set_state(SessionState::Stopped);
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == SessionState::Running
    }

    pub fn status(&self) -> ServerStatus {
        self.shared.status()
    }

    /// Queues `text` for broadcast on the next tick.
    pub fn notify_clients(&self, text: impl Into<String>) {
        self.shared.notifier.push(text);
    }

    pub fn notifier(&self) -> Notifier {
        self.shared.notifier.clone()
    }

    pub fn push_command(&self, command: impl Into<String>) {
        self.shared.commands.push(command);
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for GameServer {
    fn drop(&mut self) {
        self.stop();
        self.wait();
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::simulation::{ApprovalDecision, SimulationError};
    use crate::time::GameTime;
    use crate::transport::{LoopbackNetwork, Transport, TransportError};

    struct Idle;

    impl Simulation for Idle {
        fn load_level(&mut self, _level: &str) -> Result<(), SimulationError> {
            Ok(())
        }

        fn unload_level(&mut self) {}

        fn advance_tick(&mut self, time: &GameTime) -> Result<Vec<u8>, SimulationError> {
            Ok(time.frame.to_le_bytes().to_vec())
        }

        fn approve_connection(
            &mut self,
            _identity: SocketAddr,
            _hail: &[u8],
        ) -> Result<ApprovalDecision, SimulationError> {
            Ok(ApprovalDecision::accept())
        }

        fn on_client_connected(&mut self, _identity: SocketAddr, _hail: &[u8]) {}

        fn on_client_disconnected(&mut self, _identity: SocketAddr, _reason: &str) {}

        fn feed_user_command(
            &mut self,
            _identity: SocketAddr,
            _command: &[u8],
            _command_id: u32,
            _lag: f32,
        ) -> Result<(), SimulationError> {
            Ok(())
        }

        fn feed_notification(&mut self, _identity: SocketAddr, _text: &str) {}

        fn describe_server(&self) -> String {
            "idle".into()
        }
    }

    fn server() -> GameServer {
        let network = LoopbackNetwork::new();
        let addr: SocketAddr = "127.0.0.1:27015".parse().unwrap();
        let factory = move || -> Result<Box<dyn Transport>, TransportError> {
            Ok(Box::new(network.listen(addr)?))
        };
        GameServer::new(Idle, factory, ServerConfig::default())
    }

    #[test]
    fn stop_without_start_is_harmless() {
        let server = server();
        server.stop();
        server.stop();
        server.wait();
        assert_eq!(server.state(), SessionState::Stopped);
    }

    #[test]
    fn stop_twice_then_wait() {
        let server = server();
        server.start("arena", None).unwrap();
        server.stop();
        server.stop();
        server.wait();
        assert_eq!(server.state(), SessionState::Stopped);
    }

    #[test]
    fn double_start_is_rejected() {
        let server = server();
        server.start("arena", None).unwrap();
        assert!(matches!(
            server.start("arena", None),
            Err(ServerError::AlreadyRunning(_))
        ));
        server.stop();
        server.wait();
    }

    #[test]
    fn commands_queued_while_stopped_are_discarded() {
        let server = server();
        server.push_command("kill");
        server.notify_clients("stale");
        assert_eq!(server.status().pending_notifications, 1);

        server.start("arena", None).unwrap();
        assert_eq!(server.status().pending_notifications, 0);
        let deadline = Instant::now() + Duration::from_secs(5);
        while server.state() != SessionState::Running && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(server.state(), SessionState::Running);
        // several ticks later the stale kill has still not fired
        thread::sleep(Duration::from_millis(100));
        assert_eq!(server.state(), SessionState::Running);

        server.stop();
        server.wait();
        server.push_command("kill");
        server.start("arena", None).unwrap();
        thread::sleep(Duration::from_millis(100));
        assert_ne!(server.state(), SessionState::Stopped);
        server.stop();
        server.wait();
    }

    #[test]
    fn restart_after_stop() {
        let server = server();
        server.start("arena", None).unwrap();
        server.stop();
        server.wait();

        server.start("arena", None).unwrap();
        server.stop();
        server.wait();
        assert_eq!(server.state(), SessionState::Stopped);
    }
}
