use std::any::Any;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::time::Instant;

use super::commands::AdminCommand;
use super::{SessionState, Shared};
use crate::lock;
use crate::protocol::{Message, SnapshotMessage, UserCommand};
use crate::registry::AckOutcome;
use crate::simulation::{Simulation, SimulationError};
use crate::snapshot::{QueueError, Snapshot, SnapshotQueue};
use crate::time::{GameTime, TickClock};
use crate::transport::{Delivery, Incoming, NetEvent, PeerStatus, Transport, TransportError};

/// A fault that ends the session. Its message is relayed to every client.
#[derive(Debug, thiserror::Error)]
pub enum SessionFault {
    #[error("{0}")]
    Transport(#[from] TransportError),
    #[error("{0}")]
    Simulation(#[from] SimulationError),
    #[error("{0}")]
    Queue(#[from] QueueError),
    #[error("{0}")]
    Panic(String),
}

/// Reports Stopped when the session thread unwinds or returns.
struct StoppedOnExit<'a>(&'a Shared);

impl Drop for StoppedOnExit<'_> {
    fn drop(&mut self) {
        self.0.set_state(SessionState::Stopped);
    }
}

/// Body of the session thread.
pub(super) fn run(shared: &Shared, level: &str, post_start_command: Option<String>) {
    let _stopped = StoppedOnExit(shared);
    let mut simulation = lock(&shared.simulation);
    let sim: &mut dyn Simulation = simulation.as_mut();

    let mut session = ServerSession::new(shared);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        session.run(&mut *sim, level, post_start_command)
    }));

    let fault = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(fault)) => Some(fault),
        Err(payload) => Some(SessionFault::Panic(panic_message(payload.as_ref()))),
    };
    session.teardown(sim, fault.as_ref());
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "panic".to_string()
    }
}

struct ServerSession<'a> {
    shared: &'a Shared,
    transport: Option<Box<dyn Transport>>,
    queue: SnapshotQueue,
    clock: TickClock,
    level_loaded: bool,
}

impl<'a> ServerSession<'a> {
    fn new(shared: &'a Shared) -> Self {
        Self {
            shared,
            transport: None,
            queue: SnapshotQueue::new(shared.config.snapshot_queue_capacity),
            clock: TickClock::new(shared.config.tick_rate),
            level_loaded: false,
        }
    }

    fn transport(&mut self) -> Result<&mut Box<dyn Transport>, SessionFault> {
        self.transport
            .as_mut()
            .ok_or(SessionFault::Transport(TransportError::Closed))
    }

    fn run(
        &mut self,
        sim: &mut dyn Simulation,
        level: &str,
        post_start_command: Option<String>,
    ) -> Result<(), SessionFault> {
        let transport = self.shared.transports.create()?;
        let local_addr = transport.local_addr();
        *lock(&self.shared.local_addr) = Some(local_addr);
        self.transport = Some(transport);
        log::info!("SV: Listening on {local_addr}");

        self.level_loaded = true;
        sim.load_level(level)?;
        *lock(&self.shared.level) = Some(level.to_string());
        log::info!("SV: Level '{level}' loaded");

        if let Some(command) = post_start_command {
            self.shared.commands.push(command);
        }

        {
            let mut state = lock(&self.shared.state);
            *state = if self.shared.cancel.load(Ordering::SeqCst) {
                SessionState::Stopping
            } else {
                SessionState::Running
            };
        }

        while !self.shared.cancel.load(Ordering::SeqCst) {
            let time = self.clock.wait_next();
            self.tick(sim, &time)?;
        }
        Ok(())
    }

    fn tick(&mut self, sim: &mut dyn Simulation, time: &GameTime) -> Result<(), SessionFault> {
        self.dispatch(sim)?;

        let snapshot = sim.advance_tick(time)?;
        self.queue.push(Snapshot::new(time.frame, snapshot))?;
        self.shared.frame.store(time.frame, Ordering::Relaxed);

        self.send_snapshots()?;
        self.send_notifications()?;
        self.execute_commands(sim)?;

        let stats = self.transport()?.stats();
        *lock(&self.shared.stats) = stats;
        Ok(())
    }

    fn dispatch(&mut self, sim: &mut dyn Simulation) -> Result<(), SessionFault> {
        for _ in 0..self.shared.config.max_events_per_tick {
            let Some(incoming) = self.transport()?.receive()? else {
                break;
            };
            self.handle(sim, incoming)?;
        }
        Ok(())
    }

    fn handle(&mut self, sim: &mut dyn Simulation, incoming: Incoming) -> Result<(), SessionFault> {
        let Incoming { sender, event } = incoming;
        match event {
            NetEvent::ConnectionApproval { hail } => self.on_approval(sim, sender, &hail),
            NetEvent::StatusChanged {
                status,
                reason,
                hail,
            } => {
                self.on_status_changed(sim, sender, status, &reason, &hail);
                Ok(())
            }
            NetEvent::Data { payload, .. } => self.on_data(sim, sender, &payload),
            NetEvent::DiscoveryRequest => {
                let info = sim.describe_server();
                let result = self.transport()?.respond_discovery(sender, info.as_bytes());
                tolerate(result)
            }
            NetEvent::DiscoveryResponse { .. } => {
                log::debug!("SV: Ignoring discovery response from {sender}");
                Ok(())
            }
            NetEvent::Diagnostic { level, text } => {
                log::log!(level, "SV: {text}");
                Ok(())
            }
        }
    }

    fn on_approval(
        &mut self,
        sim: &mut dyn Simulation,
        sender: SocketAddr,
        hail: &[u8],
    ) -> Result<(), SessionFault> {
        let decision = self.shared.registry.approve(sim, sender, hail)?;
        let result = if decision.accept {
            log::info!("SV: Approved connection from {sender}");
            let info = sim.describe_server();
            self.transport()?.approve(sender, info.as_bytes())
        } else {
            log::info!("SV: Denied connection from {sender}: {}", decision.reason);
            let denied = self.transport()?.deny(sender, &decision.reason);
            self.shared.registry.forget_denied(sender);
            denied
        };
        tolerate(result)
    }

    fn on_status_changed(
        &mut self,
        sim: &mut dyn Simulation,
        sender: SocketAddr,
        status: PeerStatus,
        reason: &str,
        hail: &[u8],
    ) {
        match status {
            PeerStatus::Connected => {
                if self.shared.registry.on_connected(sim, sender, hail) {
                    log::info!("SV: {sender} connected");
                } else {
                    log::warn!("SV: {sender} connected without approval");
                }
            }
            PeerStatus::Disconnected => {
                if self.shared.registry.on_disconnected(sim, sender, reason).is_some() {
                    log::info!("SV: {sender} disconnected: {reason}");
                }
            }
            PeerStatus::Connecting => log::debug!("SV: {sender} is connecting"),
        }
    }

    fn on_data(
        &mut self,
        sim: &mut dyn Simulation,
        sender: SocketAddr,
        payload: &[u8],
    ) -> Result<(), SessionFault> {
        match Message::decode(payload) {
            Ok(Message::UserCommand(command)) => self.on_user_command(sim, sender, command),
            Ok(Message::Notification(text)) => {
                if self.shared.registry.get(sender).is_some() {
                    sim.feed_notification(sender, &text);
                } else {
                    log::warn!("SV: Notification from unknown connection {sender}");
                }
                Ok(())
            }
            Ok(Message::Snapshot(_)) => {
                log::warn!("SV: Unexpected snapshot message from {sender}");
                Ok(())
            }
            Err(err) => {
                log::warn!("SV: Dropped message from {sender}: {err}");
                Ok(())
            }
        }
    }

    fn on_user_command(
        &mut self,
        sim: &mut dyn Simulation,
        sender: SocketAddr,
        command: UserCommand,
    ) -> Result<(), SessionFault> {
        match self.shared.registry.record_ack(sender, command.snapshot_id) {
            AckOutcome::Unknown => {
                log::warn!("SV: User command from unknown connection {sender}");
                return Ok(());
            }
            AckOutcome::Activated => {
                log::debug!("SV: {sender} activated at frame {}", command.snapshot_id);
                sim.on_client_activated(sender);
            }
            AckOutcome::Updated | AckOutcome::Duplicate | AckOutcome::Stale => {}
        }

        let lag = self
            .transport()?
            .round_trip(sender)
            .map_or(0.0, |rtt| rtt.as_secs_f32() / 2.0);
        sim.feed_user_command(sender, &command.payload, command.command_id, lag)?;
        Ok(())
    }

    /// Sends the newest snapshot to every connected client, as a delta
    /// against the frame it last acknowledged when that frame is still queued.
    fn send_snapshots(&mut self) -> Result<(), SessionFault> {
        let targets = self.shared.registry.snapshot_targets();
        for (identity, acked_frame) in targets {
            let started = Instant::now();
            let compressed = self.queue.compress(acked_frame)?;
            let delivery = if compressed.is_delta() {
                Delivery::UnreliableSequenced
            } else {
                Delivery::ReliableOrdered
            };

            if self.shared.config.show_snapshots {
                log::info!(
                    "SV: Snapshot {} to {identity}: base {}, {} of {} bytes in {:?}",
                    compressed.target_frame,
                    compressed.base_frame,
                    compressed.payload.len(),
                    compressed.full_size,
                    started.elapsed()
                );
            }

            let message = Message::Snapshot(SnapshotMessage {
                frame: compressed.target_frame,
                base_frame: compressed.base_frame,
                patch: compressed.payload,
            });
            let result = self.transport()?.send(identity, &message.encode(), delivery);
            tolerate(result)?;
        }
        Ok(())
    }

    fn send_notifications(&mut self) -> Result<(), SessionFault> {
        let pending = self.shared.notifier.drain();
        if pending.is_empty() {
            return Ok(());
        }

        let connected = self.shared.registry.connected();
        if connected.is_empty() {
            log::debug!("SV: No clients for {} notification(s)", pending.len());
            return Ok(());
        }

        for text in pending {
            let bytes = Message::Notification(text).encode();
            for identity in &connected {
                let result = self
                    .transport()?
                    .send(*identity, &bytes, Delivery::ReliableSequenced);
                tolerate(result)?;
            }
        }
        Ok(())
    }

    fn execute_commands(&mut self, sim: &mut dyn Simulation) -> Result<(), SessionFault> {
        for line in self.shared.commands.drain() {
            match AdminCommand::parse(&line) {
                Ok(Some(command)) => self.execute(sim, command)?,
                Ok(None) => {}
                Err(err) => log::warn!("SV: Bad command '{line}': {err}"),
            }
        }
        Ok(())
    }

    fn execute(&mut self, sim: &mut dyn Simulation, command: AdminCommand) -> Result<(), SessionFault> {
        match command {
            AdminCommand::Notify(text) => {
                log::info!("SV: Notify: {text}");
                self.shared.notifier.push(text);
            }
            AdminCommand::Kick { identity, reason } => {
                if self.shared.registry.get(identity).is_none() {
                    log::warn!("SV: Cannot kick {identity}: no such connection");
                    return Ok(());
                }
                log::info!("SV: Kicking {identity}: {reason}");
                let result = self.transport()?.disconnect(identity, &reason);
                tolerate(result)?;
            }
            AdminCommand::Kill => {
                log::info!("SV: Kill requested");
                self.shared.stop();
            }
            AdminCommand::Status => self.log_status(),
            AdminCommand::Custom(line) => match sim.execute_command(&line) {
                Ok(()) => {}
                Err(SimulationError::UnknownCommand(_)) => {
                    log::warn!("SV: Unknown command '{line}'");
                }
                Err(err) => log::warn!("SV: Command '{line}' failed: {err}"),
            },
        }
        Ok(())
    }

    fn log_status(&self) {
        let level = lock(&self.shared.level).clone().unwrap_or_default();
        let connections = self.shared.registry.list();
        log::info!(
            "SV: Frame {}, level '{level}', {} connection(s)",
            self.queue.last_frame(),
            connections.len()
        );
        for connection in connections {
            log::info!(
                "SV:   {} {:?} acked {}",
                connection.identity,
                connection.state,
                connection.last_acked_frame
            );
        }
    }

    /// Disconnects everyone, unloads the level and releases the transport.
    fn teardown(&mut self, sim: &mut dyn Simulation, fault: Option<&SessionFault>) {
        self.shared.set_state(SessionState::Stopping);
        let reason = match fault {
            Some(fault) => {
                log::error!("SV: Session failed: {fault:?}");
                format!("Server error: {fault}")
            }
            None => self.shared.config.shutdown_reason.clone(),
        };

        if let Some(transport) = self.transport.as_mut() {
            for identity in transport.connections() {
                if let Err(err) = transport.disconnect(identity, &reason) {
                    log::debug!("SV: Failed to disconnect {identity}: {err}");
                }
            }
        }
        self.shared.registry.clear(sim, &reason);

        if self.level_loaded {
            sim.unload_level();
            *lock(&self.shared.level) = None;
        }

        if let Some(mut transport) = self.transport.take() {
            transport.shutdown("Server shutdown");
        }
        *lock(&self.shared.local_addr) = None;
        self.queue.clear();
        self.shared.frame.store(0, Ordering::Relaxed);
        log::info!("SV: Server stopped");
    }
}

/// Failures that only concern one send are not session faults: the peer
/// vanished between dispatch and send, or the message was too large for it.
fn tolerate(result: Result<(), TransportError>) -> Result<(), SessionFault> {
    match result {
        Err(TransportError::UnknownPeer(peer)) => {
            log::debug!("SV: {peer} is gone, skipping");
            Ok(())
        }
        Err(TransportError::TooLarge { size, limit }) => {
            log::warn!("SV: Dropped a {size} byte message over the {limit} byte limit");
            Ok(())
        }
        other => other.map_err(SessionFault::from),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_send_failures_keep_the_session_alive() {
        let gone: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        assert!(tolerate(Err(TransportError::UnknownPeer(gone))).is_ok());
        assert!(
            tolerate(Err(TransportError::TooLarge {
                size: 10,
                limit: 5
            }))
            .is_ok()
        );
        assert!(matches!(
            tolerate(Err(TransportError::Closed)),
            Err(SessionFault::Transport(TransportError::Closed))
        ));
    }
}
