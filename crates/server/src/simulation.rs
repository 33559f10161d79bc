use std::collections::HashMap;
use std::net::SocketAddr;

use glam::Vec3;

use snapnet::arena::{ArenaState, Buttons, InputCommand, PlayerState};
use snapnet::{ApprovalDecision, GameTime, Notifier, Simulation, SimulationError};

pub const LEVELS: &[&str] = &["arena", "warehouse", "rooftops"];

const SPAWN_RADIUS: f32 = 10.0;
const MAX_NAME_LEN: usize = 24;

#[derive(Debug)]
struct Player {
    id: u32,
    /// Latest input; applied every tick until replaced.
    input: InputCommand,
    last_command: u32,
}

/// Top-down arena: players run around and score by holding FIRE.
pub struct ArenaSimulation {
    max_players: usize,
    state: Option<ArenaState>,
    players: HashMap<SocketAddr, Player>,
    next_id: u32,
    notifier: Option<Notifier>,
}

impl ArenaSimulation {
    pub fn new(max_players: usize) -> Self {
        Self {
            max_players,
            state: None,
            players: HashMap::new(),
            next_id: 1,
            notifier: None,
        }
    }

    fn announce(&self, text: String) {
        log::info!("SV: {text}");
        if let Some(notifier) = &self.notifier {
            notifier.push(text);
        }
    }

    fn name_of(&self, identity: SocketAddr) -> String {
        self.players
            .get(&identity)
            .and_then(|player| self.state.as_ref()?.player(player.id))
            .map_or_else(|| identity.to_string(), |player| player.name.clone())
    }

    fn spawn_point(id: u32) -> Vec3 {
        let angle = id as f32 * 2.399_963;
        Vec3::new(angle.cos() * SPAWN_RADIUS, 0.0, angle.sin() * SPAWN_RADIUS)
    }

    fn reset(&mut self) {
        let Some(state) = self.state.as_mut() else {
            return;
        };
        for player in &mut state.players {
            player.position = Self::spawn_point(player.id).to_array();
            player.velocity = [0.0; 3];
            player.score = 0;
        }
    }
}

fn player_name(hail: &[u8], id: u32) -> String {
    let name: String = String::from_utf8_lossy(hail)
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_NAME_LEN)
        .collect();
    let name = name.trim();
    if name.is_empty() {
        format!("player{id}")
    } else {
        name.to_string()
    }
}

impl Simulation for ArenaSimulation {
    fn load_level(&mut self, level: &str) -> Result<(), SimulationError> {
        if !LEVELS.contains(&level) {
            return Err(SimulationError::LevelNotFound(level.to_string()));
        }
        self.state = Some(ArenaState::new(level));
        self.players.clear();
        self.next_id = 1;
        Ok(())
    }

    fn unload_level(&mut self) {
        self.state = None;
        self.players.clear();
    }

    fn advance_tick(&mut self, time: &GameTime) -> Result<Vec<u8>, SimulationError> {
        let state = self.state.as_mut().ok_or(SimulationError::NoLevel)?;
        let dt = time.elapsed_secs();

        for player in self.players.values() {
            if let Some(state) = state.player_mut(player.id) {
                state.apply_input(&player.input, dt);
                if player.input.buttons.contains(Buttons::FIRE) && time.frame % 60 == 0 {
                    state.score += 1;
                }
            }
        }

        state.frame = time.frame;
        state
            .encode()
            .map_err(|err| SimulationError::Failed(err.to_string()))
    }

    fn approve_connection(
        &mut self,
        identity: SocketAddr,
        _hail: &[u8],
    ) -> Result<ApprovalDecision, SimulationError> {
        if self.state.is_none() {
            return Err(SimulationError::NoLevel);
        }
        if self.players.len() >= self.max_players {
            log::info!("SV: Arena full, turning away {identity}");
            return Ok(ApprovalDecision::deny("Server full"));
        }
        Ok(ApprovalDecision::accept())
    }

    fn on_client_connected(&mut self, identity: SocketAddr, hail: &[u8]) {
        let Some(state) = self.state.as_mut() else {
            return;
        };
        let id = self.next_id;
        self.next_id += 1;

        let mut player = PlayerState::new(id, player_name(hail, id));
        player.position = Self::spawn_point(id).to_array();
        let name = player.name.clone();
        state.players.push(player);
        self.players.insert(
            identity,
            Player {
                id,
                input: InputCommand::default(),
                last_command: 0,
            },
        );
        self.announce(format!("{name} joined"));
    }

    fn on_client_disconnected(&mut self, identity: SocketAddr, reason: &str) {
        let name = self.name_of(identity);
        let Some(player) = self.players.remove(&identity) else {
            return;
        };
        if let Some(state) = self.state.as_mut() {
            state.players.retain(|p| p.id != player.id);
        }
        self.announce(format!("{name} left ({reason})"));
    }

    fn on_client_activated(&mut self, identity: SocketAddr) {
        log::debug!("SV: {} is in sync", self.name_of(identity));
    }

    fn feed_user_command(
        &mut self,
        identity: SocketAddr,
        command: &[u8],
        command_id: u32,
        _lag: f32,
    ) -> Result<(), SimulationError> {
        let Some(player) = self.players.get_mut(&identity) else {
            return Ok(());
        };
        // unreliable sequenced, so an older id only shows up after a wrap
        if command_id <= player.last_command && player.last_command - command_id < u32::MAX / 2 {
            return Ok(());
        }
        match InputCommand::decode(command) {
            Ok(input) => {
                player.input = input;
                player.last_command = command_id;
            }
            Err(err) => log::warn!("SV: Bad input from {identity}: {err}"),
        }
        Ok(())
    }

    fn feed_notification(&mut self, identity: SocketAddr, text: &str) {
        let name = self.name_of(identity);
        self.announce(format!("{name}: {text}"));
    }

    fn describe_server(&self) -> String {
        let level = self
            .state
            .as_ref()
            .map_or("none", |state| state.level.as_str());
        format!(
            "snapnet arena '{level}' ({}/{} players)",
            self.players.len(),
            self.max_players
        )
    }

    fn execute_command(&mut self, command: &str) -> Result<(), SimulationError> {
        match command.trim() {
            "reset" => {
                if self.state.is_none() {
                    return Err(SimulationError::NoLevel);
                }
                self.reset();
                self.announce("Round reset".to_string());
                Ok(())
            }
            "players" => {
                let state = self.state.as_ref().ok_or(SimulationError::NoLevel)?;
                for player in &state.players {
                    log::info!(
                        "SV:   #{} {} at {:.1?} score {}",
                        player.id,
                        player.name,
                        player.position,
                        player.score
                    );
                }
                Ok(())
            }
            _ => Err(SimulationError::UnknownCommand(command.to_string())),
        }
    }

    fn attach_notifier(&mut self, notifier: Notifier) {
        self.notifier = Some(notifier);
    }
}
