mod common;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use common::{RecordingSimulation, SimEvent, TIMEOUT, loopback_server, server_addr, wait_until};
use snapnet::{
    ClientChannel, ClientConfig, ClientGame, Delivery, GameServer, GameTime, Incoming, LinkState,
    LoopbackNetwork, Message, NetEvent, ServerConfig, SessionState, SnapshotMessage, TickClock,
    Transport, TransportError,
};

#[derive(Debug, Clone, PartialEq)]
enum GameEvent {
    Connected(String),
    Snapshot(u32),
    Notification(String),
    Disconnected(String),
    Error(String),
}

#[derive(Clone, Default)]
struct GameLog(Arc<Mutex<Vec<GameEvent>>>);

impl GameLog {
    fn events(&self) -> Vec<GameEvent> {
        self.0.lock().unwrap().clone()
    }

    fn count(&self, mut predicate: impl FnMut(&GameEvent) -> bool) -> usize {
        self.0.lock().unwrap().iter().filter(|e| predicate(e)).count()
    }
}

struct RecordingGame {
    log: GameLog,
    send_input: bool,
}

impl RecordingGame {
    fn new() -> (Self, GameLog) {
        let log = GameLog::default();
        (
            Self {
                log: log.clone(),
                send_input: true,
            },
            log,
        )
    }

    fn push(&self, event: GameEvent) {
        self.log.0.lock().unwrap().push(event);
    }
}

impl ClientGame for RecordingGame {
    fn user_info(&self) -> Vec<u8> {
        b"tester".to_vec()
    }

    fn on_connected(&mut self, server_info: &str) {
        self.push(GameEvent::Connected(server_info.to_string()));
    }

    fn apply_snapshot(&mut self, frame: u32, snapshot: &[u8]) {
        assert_eq!(snapshot[..4], frame.to_le_bytes());
        self.push(GameEvent::Snapshot(frame));
    }

    fn on_notification(&mut self, text: &str) {
        self.push(GameEvent::Notification(text.to_string()));
    }

    fn next_command(&mut self, time: &GameTime) -> Option<Vec<u8>> {
        self.send_input.then(|| time.frame.to_le_bytes().to_vec())
    }

    fn on_disconnected(&mut self, reason: &str) {
        self.push(GameEvent::Disconnected(reason.to_string()));
    }

    fn show_error(&mut self, message: &str) {
        self.push(GameEvent::Error(message.to_string()));
    }
}

/// Loopback factory that remembers every address it hands out.
fn client_factory(
    network: &LoopbackNetwork,
) -> (
    impl Fn() -> Result<Box<dyn Transport>, TransportError> + Send + Sync + 'static,
    Arc<Mutex<Vec<SocketAddr>>>,
) {
    let opened = Arc::new(Mutex::new(Vec::new()));
    let network = network.clone();
    let record = Arc::clone(&opened);
    let factory = move || -> Result<Box<dyn Transport>, TransportError> {
        let transport = network.open();
        record.lock().unwrap().push(transport.local_addr());
        Ok(Box::new(transport))
    };
    (factory, opened)
}

/// Runs `update` at a fast fixed rate until `done` holds.
fn pump_until(
    channel: &mut ClientChannel<RecordingGame>,
    clock: &mut TickClock,
    mut done: impl FnMut(&ClientChannel<RecordingGame>) -> bool,
) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        channel.update(&clock.advance());
        if done(channel) {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}

fn running_server() -> (GameServer, LoopbackNetwork, common::SimLog) {
    let (sim, log) = RecordingSimulation::new();
    let (server, network) = loopback_server(sim, ServerConfig::default());
    server.start("arena", None).unwrap();
    assert!(wait_until(TIMEOUT, || server.state() == SessionState::Running));
    (server, network, log)
}

#[test]
fn client_connects_receives_snapshots_and_activates() {
    let (server, network, sim_log) = running_server();
    let (factory, _) = client_factory(&network);
    let (game, log) = RecordingGame::new();
    let mut channel = ClientChannel::new(game, factory, ClientConfig::default());
    let mut clock = TickClock::new(60);

    channel.connect("127.0.0.1", server_addr().port()).unwrap();
    assert_eq!(channel.state(), LinkState::Connecting);
    assert_eq!(channel.server_addr(), Some(server_addr()));

    assert!(pump_until(&mut channel, &mut clock, |c| c.state() == LinkState::Connected));
    assert_eq!(channel.server_info(), "recording server");
    assert_eq!(log.events()[0], GameEvent::Connected("recording server".into()));

    assert!(pump_until(&mut channel, &mut clock, |c| {
        c.game().log.count(|e| matches!(e, GameEvent::Snapshot(_))) >= 10
    }));
    assert!(channel.last_frame() > 0);

    let frames: Vec<u32> = log
        .events()
        .into_iter()
        .filter_map(|e| match e {
            GameEvent::Snapshot(frame) => Some(frame),
            _ => None,
        })
        .collect();
    assert!(frames.windows(2).all(|pair| pair[0] < pair[1]));

    assert!(wait_until(TIMEOUT, || sim_log.count(|e| matches!(e, SimEvent::Activated(_))) == 1));
    assert!(sim_log.count(|e| matches!(e, SimEvent::Command { .. })) > 0);
    assert!(wait_until(TIMEOUT, || {
        server
            .status()
            .connections
            .first()
            .is_some_and(|connection| connection.last_acked_frame > 0)
    }));

    server.stop();
    server.wait();
}

#[test]
fn notifications_flow_both_ways() {
    let (server, network, sim_log) = running_server();
    let (factory, _) = client_factory(&network);
    let (game, log) = RecordingGame::new();
    let mut channel = ClientChannel::new(game, factory, ClientConfig::default());
    let mut clock = TickClock::new(60);

    assert!(channel.send_notification("too early").is_err());

    channel.connect("127.0.0.1", server_addr().port()).unwrap();
    assert!(pump_until(&mut channel, &mut clock, |c| c.state() == LinkState::Connected));

    channel.send_notification("hello server").unwrap();
    assert!(wait_until(TIMEOUT, || sim_log.count(|e| {
        matches!(e, SimEvent::Notification(_, text) if text == "hello server")
    }) == 1));

    server.notify_clients("hello client");
    assert!(pump_until(&mut channel, &mut clock, |_| {
        log.events()
            .contains(&GameEvent::Notification("hello client".into()))
    }));

    server.stop();
    server.wait();
}

#[test]
fn server_shutdown_reaches_the_game() {
    let (server, network, _) = running_server();
    let (factory, _) = client_factory(&network);
    let (game, log) = RecordingGame::new();
    let mut channel = ClientChannel::new(game, factory, ClientConfig::default());
    let mut clock = TickClock::new(60);

    channel.connect("127.0.0.1", server_addr().port()).unwrap();
    assert!(pump_until(&mut channel, &mut clock, |c| c.state() == LinkState::Connected));

    server.stop();
    server.wait();
    assert!(pump_until(&mut channel, &mut clock, |c| c.state() == LinkState::Disconnected));
    assert!(log.events().contains(&GameEvent::Disconnected("Server is killed".into())));
    assert!(!channel.is_standby());
}

#[test]
fn connect_failure_leaves_channel_in_standby() {
    let network = LoopbackNetwork::new();
    let (factory, _) = client_factory(&network);
    let (game, log) = RecordingGame::new();
    let mut channel = ClientChannel::new(game, factory, ClientConfig::default());

    assert!(channel.connect("127.0.0.1", server_addr().port()).is_err());
    assert_eq!(channel.state(), LinkState::Disconnected);
    assert!(channel.is_standby());
    assert_eq!(log.count(|e| matches!(e, GameEvent::Error(_))), 1);
    assert_eq!(log.count(|e| matches!(e, GameEvent::Disconnected(_))), 0);
}

#[test]
fn messages_from_other_senders_are_dropped() {
    let (server, network, _) = running_server();
    let (factory, opened) = client_factory(&network);
    let (mut game, log) = RecordingGame::new();
    game.send_input = false;
    let mut channel = ClientChannel::new(game, factory, ClientConfig::default());
    let mut clock = TickClock::new(60);

    channel.connect("127.0.0.1", server_addr().port()).unwrap();
    assert!(pump_until(&mut channel, &mut clock, |c| c.state() == LinkState::Connected));
    server.stop();
    server.wait();
    assert!(pump_until(&mut channel, &mut clock, |c| c.state() == LinkState::Disconnected));

    // reconnect to a fake server we drive by hand
    let mut fake = network.listen(server_addr()).unwrap();
    channel.connect("127.0.0.1", server_addr().port()).unwrap();
    let client_addr = *opened.lock().unwrap().last().unwrap();
    assert!(wait_until(TIMEOUT, || network.pending(server_addr()) > 0));
    while fake.receive().unwrap().is_some() {}
    fake.approve(client_addr, b"fake").unwrap();

    let forged = Message::Snapshot(SnapshotMessage {
        frame: 900_000,
        base_frame: 0,
        patch: 900_000u32.to_le_bytes().to_vec(),
    })
    .encode();
    let stranger: SocketAddr = "127.0.0.1:4000".parse().unwrap();
    network.inject(
        client_addr,
        Incoming::new(
            stranger,
            NetEvent::Data {
                payload: forged.clone(),
                delivery: Delivery::ReliableOrdered,
            },
        ),
    );
    fake.send(client_addr, &forged, Delivery::ReliableOrdered).unwrap();

    assert!(pump_until(&mut channel, &mut clock, |c| c.last_frame() == 900_000));
    assert_eq!(log.count(|e| *e == GameEvent::Snapshot(900_000)), 1);
    assert!(
        common::warnings()
            .iter()
            .any(|line| line.starts_with(&format!("CL: Dropped message from {stranger}")))
    );
}

#[test]
fn transport_fault_disconnects_into_standby() {
    let (server, network, sim_log) = running_server();
    let (factory, opened) = client_factory(&network);
    let (game, log) = RecordingGame::new();
    let mut channel = ClientChannel::new(game, factory, ClientConfig::default());
    let mut clock = TickClock::new(60);

    channel.connect("127.0.0.1", server_addr().port()).unwrap();
    assert!(pump_until(&mut channel, &mut clock, |c| c.state() == LinkState::Connected));

    let client_addr = *opened.lock().unwrap().last().unwrap();
    network.fail_next_receive(client_addr, "cable cut");
    channel.dispatch();

    assert!(channel.is_standby());
    assert_eq!(channel.state(), LinkState::Disconnected);
    assert!(
        log.events()
            .contains(&GameEvent::Error("Network error: transport fault: cable cut".into()))
    );
    assert_eq!(log.count(|e| matches!(e, GameEvent::Disconnected(_))), 1);
    assert!(!network.is_open(client_addr));

    // the server notices the link is gone
    assert!(wait_until(TIMEOUT, || {
        sim_log.count(|e| matches!(e, SimEvent::Disconnected(id, _) if *id == client_addr)) == 1
    }));

    server.stop();
    server.wait();
}

#[test]
fn disconnect_is_idempotent() {
    let (server, network, sim_log) = running_server();
    let (factory, _) = client_factory(&network);
    let (game, log) = RecordingGame::new();
    let mut channel = ClientChannel::new(game, factory, ClientConfig::default());
    let mut clock = TickClock::new(60);

    channel.disconnect();
    assert_eq!(log.events(), vec![]);

    channel.connect("127.0.0.1", server_addr().port()).unwrap();
    assert!(pump_until(&mut channel, &mut clock, |c| c.state() == LinkState::Connected));

    channel.disconnect();
    channel.disconnect();
    assert_eq!(channel.state(), LinkState::Disconnected);
    assert_eq!(log.count(|e| matches!(e, GameEvent::Disconnected(_))), 1);
    assert!(!channel.is_standby());

    assert!(wait_until(TIMEOUT, || {
        sim_log.count(|e| matches!(e, SimEvent::Disconnected(_, reason) if reason == "Client disconnected")) == 1
    }));
    server.stop();
    server.wait();
}
