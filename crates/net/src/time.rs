use std::time::{Duration, Instant};

/// Timing of one fixed simulation step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GameTime {
    /// Frame number of the snapshot this step produces; starts at 1.
    pub frame: u32,
    pub elapsed: Duration,
    pub total: Duration,
}

impl GameTime {
    pub fn elapsed_secs(&self) -> f32 {
        self.elapsed.as_secs_f32()
    }

    pub fn total_secs(&self) -> f64 {
        self.total.as_secs_f64()
    }
}

/// Fixed-step clock for the session thread.
#[derive(Debug)]
pub struct TickClock {
    step: Duration,
    frame: u32,
    total: Duration,
    next_tick: Instant,
}

/// Ticks this far behind are skipped rather than replayed.
const MAX_BEHIND_STEPS: u32 = 8;

impl TickClock {
    pub fn new(tick_rate: u32) -> Self {
        let step = Duration::from_secs_f64(1.0 / f64::from(tick_rate.max(1)));
        Self {
            step,
            frame: 0,
            total: Duration::ZERO,
            next_tick: Instant::now(),
        }
    }

    pub fn step(&self) -> Duration {
        self.step
    }

    pub fn frame(&self) -> u32 {
        self.frame
    }

    /// Advances without waiting.
    pub fn advance(&mut self) -> GameTime {
        self.frame = self.frame.wrapping_add(1);
        self.total += self.step;
        GameTime {
            frame: self.frame,
            elapsed: self.step,
            total: self.total,
        }
    }

    /// Sleeps until the next step is due, then advances.
    pub fn wait_next(&mut self) -> GameTime {
        let now = Instant::now();
        if now < self.next_tick {
            std::thread::sleep(self.next_tick - now);
            self.next_tick += self.step;
        } else if now - self.next_tick > self.step * MAX_BEHIND_STEPS {
            log::debug!(
                "Tick clock fell behind by {:?}, resyncing",
                now - self.next_tick
            );
            self.next_tick = now + self.step;
        } else {
            self.next_tick += self.step;
        }
        self.advance()
    }
}
