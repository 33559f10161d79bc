use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct DelayedDatagram {
    release_time: Instant,
    order: u64,
    data: Vec<u8>,
    addr: SocketAddr,
}

impl PartialEq for DelayedDatagram {
    fn eq(&self, other: &Self) -> bool {
        self.release_time == other.release_time && self.order == other.order
    }
}

impl Eq for DelayedDatagram {}

impl PartialOrd for DelayedDatagram {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedDatagram {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse order for min-heap
        other
            .release_time
            .cmp(&self.release_time)
            .then_with(|| other.order.cmp(&self.order))
    }
}

/// Holds outgoing datagrams back until their simulated latency has passed.
#[derive(Debug, Default)]
pub struct NetworkSimulator {
    queue: BinaryHeap<DelayedDatagram>,
    next_order: u64,
}

impl NetworkSimulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delay(&mut self, data: Vec<u8>, addr: SocketAddr, delay: Duration, now: Instant) {
        let order = self.next_order;
        self.next_order += 1;
        self.queue.push(DelayedDatagram {
            release_time: now + delay,
            order,
            data,
            addr,
        });
    }

    pub fn take_due(&mut self, now: Instant) -> Vec<(Vec<u8>, SocketAddr)> {
        let mut due = Vec::new();
        while self.queue.peek().is_some_and(|d| d.release_time <= now) {
            if let Some(delayed) = self.queue.pop() {
                due.push((delayed.data, delayed.addr));
            }
        }
        due
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
