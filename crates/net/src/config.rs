use serde::{Deserialize, Serialize};

use crate::DEFAULT_TICK_RATE;
use crate::snapshot::DEFAULT_CAPACITY;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub tick_rate: u32,
    pub snapshot_queue_capacity: usize,
    /// Upper bound on transport events handled per tick.
    pub max_events_per_tick: usize,
    /// Reason given to clients on a clean stop.
    pub shutdown_reason: String,
    /// Trace every snapshot send.
    pub show_snapshots: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tick_rate: DEFAULT_TICK_RATE,
            snapshot_queue_capacity: DEFAULT_CAPACITY,
            max_events_per_tick: 1024,
            shutdown_reason: "Server is killed".to_string(),
            show_snapshots: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub max_events_per_tick: usize,
    pub snapshot_queue_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_events_per_tick: 1024,
            snapshot_queue_capacity: DEFAULT_CAPACITY,
        }
    }
}
