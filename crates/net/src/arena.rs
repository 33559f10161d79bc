//! Demo game state shared by the bundled server and client binaries.

use glam::Vec3;
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize, rancor};

pub const ARENA_HALF_EXTENT: f32 = 50.0;
const WALK_SPEED: f32 = 5.0;
const SPRINT_SPEED: f32 = 10.0;
const INPUT_COMMAND_SIZE: usize = 6;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Buttons: u16 {
        const FORWARD = 1 << 0;
        const BACK = 1 << 1;
        const LEFT = 1 << 2;
        const RIGHT = 1 << 3;
        const JUMP = 1 << 4;
        const SPRINT = 1 << 5;
        const FIRE = 1 << 6;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ArenaError {
    #[error("failed to encode arena state: {0}")]
    Encode(rancor::Error),
    #[error("failed to decode arena state: {0}")]
    Decode(rancor::Error),
    #[error("input command needs 6 bytes, got {0}")]
    ShortCommand(usize),
}

/// One frame of player input: `u16` buttons then `f32` yaw, little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct InputCommand {
    pub buttons: Buttons,
    pub yaw: f32,
}

impl InputCommand {
    pub fn new(buttons: Buttons, yaw: f32) -> Self {
        Self { buttons, yaw }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(INPUT_COMMAND_SIZE);
        out.extend_from_slice(&self.buttons.bits().to_le_bytes());
        out.extend_from_slice(&self.yaw.to_le_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, ArenaError> {
        let Some(bytes) = data.get(..INPUT_COMMAND_SIZE) else {
            return Err(ArenaError::ShortCommand(data.len()));
        };
        let buttons = u16::from_le_bytes([bytes[0], bytes[1]]);
        let yaw = f32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        Ok(Self {
            buttons: Buttons::from_bits_truncate(buttons),
            yaw,
        })
    }

    /// Movement direction in world space, unit length or zero.
    pub fn move_direction(&self) -> Vec3 {
        let mut local = Vec3::ZERO;
        if self.buttons.contains(Buttons::FORWARD) {
            local.z -= 1.0;
        }
        if self.buttons.contains(Buttons::BACK) {
            local.z += 1.0;
        }
        if self.buttons.contains(Buttons::LEFT) {
            local.x -= 1.0;
        }
        if self.buttons.contains(Buttons::RIGHT) {
            local.x += 1.0;
        }
        if local.length_squared() < 0.001 {
            return Vec3::ZERO;
        }

        let normalized = local.normalize();
        let (sin_yaw, cos_yaw) = self.yaw.sin_cos();
        Vec3::new(
            normalized.x * cos_yaw + normalized.z * sin_yaw,
            0.0,
            -normalized.x * sin_yaw + normalized.z * cos_yaw,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct PlayerState {
    pub id: u32,
    pub name: String,
    pub position: [f32; 3],
    pub velocity: [f32; 3],
    pub yaw: f32,
    pub score: u32,
}

impl PlayerState {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            position: [0.0; 3],
            velocity: [0.0; 3],
            yaw: 0.0,
            score: 0,
        }
    }

    pub fn position(&self) -> Vec3 {
        Vec3::from_array(self.position)
    }

    /// Moves the player by one step of `input`, staying inside the arena.
    pub fn apply_input(&mut self, input: &InputCommand, dt: f32) {
        let speed = if input.buttons.contains(Buttons::SPRINT) {
            SPRINT_SPEED
        } else {
            WALK_SPEED
        };

        let velocity = input.move_direction() * speed;
        let position = (self.position() + velocity * dt).clamp(
            Vec3::splat(-ARENA_HALF_EXTENT),
            Vec3::splat(ARENA_HALF_EXTENT),
        );

        self.velocity = velocity.to_array();
        self.position = position.to_array();
        self.yaw = input.yaw;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct ArenaState {
    pub level: String,
    pub frame: u32,
    pub players: Vec<PlayerState>,
}

impl ArenaState {
    pub fn new(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            frame: 0,
            players: Vec::new(),
        }
    }

    pub fn player(&self, id: u32) -> Option<&PlayerState> {
        self.players.iter().find(|player| player.id == id)
    }

    pub fn player_mut(&mut self, id: u32) -> Option<&mut PlayerState> {
        self.players.iter_mut().find(|player| player.id == id)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ArenaError> {
        rkyv::to_bytes::<rancor::Error>(self)
            .map(|aligned| aligned.into_vec())
            .map_err(ArenaError::Encode)
    }

    pub fn decode(data: &[u8]) -> Result<Self, ArenaError> {
        let mut aligned = AlignedVec::<16>::with_capacity(data.len());
        aligned.extend_from_slice(data);
        rkyv::from_bytes::<Self, rancor::Error>(&aligned).map_err(ArenaError::Decode)
    }
}
