use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use snapnet::{LossSimulation, ServerConfig, UdpConfig};

/// Everything a server config file may set. Missing keys keep their defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub session: ServerConfig,
    pub network: NetworkSettings,
    pub arena: ArenaSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub bind: String,
    pub port: u16,
    pub max_clients: usize,
    pub timeout_secs: u64,
    pub loss: LossSimulation,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: snapnet::DEFAULT_PORT,
            max_clients: 32,
            timeout_secs: 10,
            loss: LossSimulation::default(),
        }
    }
}

impl NetworkSettings {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn udp_config(&self) -> UdpConfig {
        UdpConfig {
            // one slot for a client waiting to be told the arena is full
            max_peers: self.max_clients + 1,
            timeout: Duration::from_secs(self.timeout_secs.max(1)),
            loss: self.loss.clone(),
            ..UdpConfig::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaSettings {
    pub level: String,
    pub max_players: usize,
    /// Command run once the level is loaded.
    pub exec: Option<String>,
}

impl Default for ArenaSettings {
    fn default() -> Self {
        Self {
            level: "arena".to_string(),
            max_players: 32,
            exec: None,
        }
    }
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }
}
