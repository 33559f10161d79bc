use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Artificial loss and latency applied to outgoing datagrams.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossSimulation {
    pub enabled: bool,
    /// 0..=100
    pub loss_percent: f32,
    pub min_latency_ms: u32,
    pub max_latency_ms: u32,
    pub jitter_ms: u32,
}

impl LossSimulation {
    pub fn should_drop(&self) -> bool {
        if !self.enabled || self.loss_percent <= 0.0 {
            return false;
        }
        rand_unit() * 100.0 < self.loss_percent
    }

    pub fn delay(&self) -> Duration {
        if !self.enabled || self.max_latency_ms == 0 {
            return Duration::ZERO;
        }
        let range = self.max_latency_ms.saturating_sub(self.min_latency_ms);
        let jitter = (rand_unit() * self.jitter_ms as f32) as u32;
        let ms = self.min_latency_ms + (rand_unit() * range as f32) as u32 + jitter;
        Duration::from_millis(u64::from(ms))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub packets_resent: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub rtt_ms: f32,
}

pub(crate) fn rand_unit() -> f32 {
    (rand_u64() >> 40) as f32 / (1u64 << 24) as f32
}

pub(crate) fn rand_u64() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u64(COUNTER.fetch_add(1, Ordering::Relaxed));
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_simulation_is_transparent() {
        let sim = LossSimulation {
            enabled: false,
            loss_percent: 100.0,
            max_latency_ms: 500,
            ..Default::default()
        };
        assert!(!sim.should_drop());
        assert_eq!(sim.delay(), Duration::ZERO);
    }

    #[test]
    fn full_loss_drops_everything() {
        let sim = LossSimulation {
            enabled: true,
            loss_percent: 100.0,
            ..Default::default()
        };
        assert!((0..100).all(|_| sim.should_drop()));
    }

    #[test]
    fn delay_stays_in_range() {
        let sim = LossSimulation {
            enabled: true,
            min_latency_ms: 20,
            max_latency_ms: 40,
            jitter_ms: 5,
            ..Default::default()
        };
        for _ in 0..100 {
            let delay = sim.delay();
            assert!(delay >= Duration::from_millis(20));
            assert!(delay <= Duration::from_millis(45));
        }
    }

    #[test]
    fn rand_unit_is_a_fraction() {
        assert!((0..1000).map(|_| rand_unit()).all(|r| (0.0..1.0).contains(&r)));
    }
}
