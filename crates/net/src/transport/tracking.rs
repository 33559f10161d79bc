use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::packet::sequence_greater_than;

const ACK_WINDOW: u32 = 32;

#[derive(Debug, Clone)]
struct SentPacket {
    sequence: u32,
    sent_at: Instant,
}

/// Outgoing packet sequences awaiting an ack, with a smoothed round trip
/// estimate fed by every ack.
#[derive(Debug)]
pub struct AckTracker {
    pending: VecDeque<SentPacket>,
    max_pending: usize,
    srtt: f32,
    rtt_var: f32,
    samples: u32,
}

impl AckTracker {
    pub fn new(max_pending: usize) -> Self {
        Self {
            pending: VecDeque::with_capacity(max_pending),
            max_pending,
            srtt: 100.0,
            rtt_var: 50.0,
            samples: 0,
        }
    }

    pub fn track_packet(&mut self, sequence: u32, now: Instant) {
        while self.pending.len() >= self.max_pending {
            self.pending.pop_front();
        }
        self.pending.push_back(SentPacket {
            sequence,
            sent_at: now,
        });
    }

    /// Removes and returns every tracked sequence covered by `ack` and its
    /// bitfield.
    pub fn process_ack(&mut self, ack: u32, ack_bitfield: u32, now: Instant) -> Vec<u32> {
        let mut acked = Vec::new();
        let mut rtt_samples = Vec::new();

        self.pending.retain(|sent| {
            if !is_acked(sent.sequence, ack, ack_bitfield) {
                return true;
            }
            acked.push(sent.sequence);
            rtt_samples.push(now.duration_since(sent.sent_at).as_secs_f32() * 1000.0);
            false
        });

        for rtt in rtt_samples {
            self.update_rtt(rtt);
        }
        acked
    }

    fn update_rtt(&mut self, rtt: f32) {
        const ALPHA: f32 = 0.125;
        const BETA: f32 = 0.25;

        if self.samples == 0 {
            self.srtt = rtt;
            self.rtt_var = rtt / 2.0;
        } else {
            let diff = (rtt - self.srtt).abs();
            self.rtt_var = (1.0 - BETA) * self.rtt_var + BETA * diff;
            self.srtt = (1.0 - ALPHA) * self.srtt + ALPHA * rtt;
        }
        self.samples = self.samples.saturating_add(1);
    }

    pub fn srtt_ms(&self) -> f32 {
        self.srtt
    }

    pub fn rtt_var_ms(&self) -> f32 {
        self.rtt_var
    }

    /// `None` until the first ack arrives.
    pub fn round_trip(&self) -> Option<Duration> {
        (self.samples > 0).then(|| Duration::from_secs_f32(self.srtt / 1000.0))
    }

    pub fn unacked_count(&self) -> usize {
        self.pending.len()
    }
}

fn is_acked(sequence: u32, ack: u32, ack_bitfield: u32) -> bool {
    if sequence == ack {
        return true;
    }
    if !sequence_greater_than(ack, sequence) {
        return false;
    }
    let diff = ack.wrapping_sub(sequence);
    diff <= ACK_WINDOW && ack_bitfield & (1 << (diff - 1)) != 0
}

/// Incoming packet sequences, summarised as the newest sequence plus a
/// bitfield of the 32 before it.
#[derive(Debug, Default)]
pub struct ReceiveTracker {
    last_received: u32,
    received_bitfield: u32,
}

impl ReceiveTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false for duplicates and for packets too old to tell apart
    /// from one.
    pub fn record_received(&mut self, sequence: u32) -> bool {
        if sequence == self.last_received {
            return false;
        }

        if sequence_greater_than(sequence, self.last_received) {
            let diff = sequence.wrapping_sub(self.last_received);
            self.received_bitfield = if diff <= ACK_WINDOW {
                // bit diff-1 marks the previous newest sequence
                (self.received_bitfield << 1 | 1) << (diff - 1)
            } else {
                0
            };
            self.last_received = sequence;
            return true;
        }

        let diff = self.last_received.wrapping_sub(sequence);
        if diff > ACK_WINDOW {
            return false;
        }
        let bit = 1 << (diff - 1);
        if self.received_bitfield & bit != 0 {
            return false;
        }
        self.received_bitfield |= bit;
        true
    }

    pub fn ack_data(&self) -> (u32, u32) {
        (self.last_received, self.received_bitfield)
    }
}
