use glam::Vec3;

use snapnet::arena::{ArenaState, Buttons, InputCommand};
use snapnet::{ClientGame, GameTime};

/// Seconds between heading changes.
const TURN_INTERVAL: f64 = 2.0;

/// Headless stand-in for a game: keeps the latest arena state and drives a
/// wandering player.
#[derive(Debug)]
pub struct ArenaView {
    name: String,
    pub state: Option<ArenaState>,
    pub own_id: Option<u32>,
    pub snapshots_applied: u64,
    pub server_info: Option<String>,
    pub disconnect_reason: Option<String>,
    pub last_error: Option<String>,
    heading: f32,
    next_turn: f64,
}

impl ArenaView {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: None,
            own_id: None,
            snapshots_applied: 0,
            server_info: None,
            disconnect_reason: None,
            last_error: None,
            heading: 0.0,
            next_turn: 0.0,
        }
    }

    pub fn own_position(&self) -> Option<Vec3> {
        let state = self.state.as_ref()?;
        Some(state.player(self.own_id?)?.position())
    }

    pub fn player_count(&self) -> usize {
        self.state.as_ref().map_or(0, |state| state.players.len())
    }
}

impl ClientGame for ArenaView {
    fn user_info(&self) -> Vec<u8> {
        self.name.as_bytes().to_vec()
    }

    fn on_connected(&mut self, server_info: &str) {
        log::info!("CL: Joined {server_info}");
        self.server_info = Some(server_info.to_string());
        self.disconnect_reason = None;
        self.own_id = None;
    }

    fn apply_snapshot(&mut self, frame: u32, snapshot: &[u8]) {
        let state = match ArenaState::decode(snapshot) {
            Ok(state) => state,
            Err(err) => {
                log::warn!("CL: Undecodable snapshot {frame}: {err}");
                return;
            }
        };
        if self.own_id.is_none() {
            // the newest player with our name is us
            self.own_id = state
                .players
                .iter()
                .filter(|player| player.name == self.name)
                .map(|player| player.id)
                .max();
        }
        self.state = Some(state);
        self.snapshots_applied += 1;
    }

    fn on_notification(&mut self, text: &str) {
        log::info!("CL: [server] {text}");
    }

    fn next_command(&mut self, time: &GameTime) -> Option<Vec<u8>> {
        let now = time.total_secs();
        if now >= self.next_turn {
            self.heading = (self.heading + 2.399_963) % std::f32::consts::TAU;
            self.next_turn = now + TURN_INTERVAL;
        }

        let mut buttons = Buttons::FORWARD;
        if time.frame % 120 < 30 {
            buttons |= Buttons::FIRE;
        }
        Some(InputCommand::new(buttons, self.heading).encode())
    }

    fn on_disconnected(&mut self, reason: &str) {
        self.disconnect_reason = Some(reason.to_string());
        self.state = None;
        self.own_id = None;
    }

    fn show_error(&mut self, message: &str) {
        log::error!("CL: {message}");
        self.last_error = Some(message.to_string());
    }
}
