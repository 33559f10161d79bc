use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::Delivery;
use super::packet::{PacketHeader, sequence_greater_than};
use super::tracking::{AckTracker, ReceiveTracker};

const MAX_TRACKED_PACKETS: usize = 256;
const MAX_ORDERED_BACKLOG: usize = 1024;
/// Upper bound on the fragments of one message.
pub const MAX_FRAGMENTS: usize = 1024;
const MAX_PARTIAL_MESSAGES: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    /// We sent `Connect` and wait for the remote's answer.
    Connecting { attempts: u32, last_attempt: Instant },
    /// The remote sent `Connect`; the application has not answered yet.
    AwaitingApproval,
    Connected,
}

/// Position of a datagram within its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    pub index: u16,
    pub count: u16,
}

impl Fragment {
    pub const WHOLE: Fragment = Fragment { index: 0, count: 1 };

    pub fn is_whole(self) -> bool {
        self.count <= 1
    }
}

#[derive(Debug)]
struct InFlight {
    delivery: Delivery,
    message_sequence: u32,
    fragment: Fragment,
    payload: Vec<u8>,
    packet_sequences: Vec<u32>,
    last_sent: Instant,
}

/// A reliable message that is due for another transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resend {
    pub delivery: Delivery,
    pub message_sequence: u32,
    pub fragment: Fragment,
    pub payload: Vec<u8>,
}

/// Fragments of a message that has not fully arrived.
#[derive(Debug)]
struct Partial {
    parts: Vec<Option<Vec<u8>>>,
    received: usize,
    started: Instant,
}

impl Partial {
    fn new(count: u16, now: Instant) -> Self {
        Self {
            parts: vec![None; count as usize],
            received: 0,
            started: now,
        }
    }
}

/// Per-remote connection state of the UDP transport: packet sequencing and
/// acks, plus one message channel per [`Delivery`] class.
#[derive(Debug)]
pub struct Peer {
    pub addr: SocketAddr,
    pub phase: Phase,
    /// Hail received from (or sent to) the remote.
    pub hail: Vec<u8>,
    /// Approval response, kept to answer repeated `Connect` packets.
    pub response: Vec<u8>,
    pub last_receive: Instant,
    pub last_send: Instant,
    pub ack_pending: bool,
    send_sequence: u32,
    acks: AckTracker,
    received: ReceiveTracker,
    outgoing: [u32; 4],
    newest_incoming: [Option<u32>; 4],
    ordered_next: u32,
    ordered_backlog: BTreeMap<u32, Vec<u8>>,
    partial: HashMap<(Delivery, u32), Partial>,
    in_flight: Vec<InFlight>,
}

impl Peer {
    pub fn new(addr: SocketAddr, phase: Phase, hail: Vec<u8>, now: Instant) -> Self {
        Self {
            addr,
            phase,
            hail,
            response: Vec::new(),
            last_receive: now,
            last_send: now,
            ack_pending: false,
            send_sequence: 0,
            acks: AckTracker::new(MAX_TRACKED_PACKETS),
            received: ReceiveTracker::new(),
            outgoing: [0; 4],
            newest_incoming: [None; 4],
            ordered_next: 1,
            ordered_backlog: BTreeMap::new(),
            partial: HashMap::new(),
            in_flight: Vec::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.phase == Phase::Connected
    }

    /// Header for the next sequenced packet; it carries our current acks.
    pub fn next_header(&mut self, now: Instant) -> PacketHeader {
        self.send_sequence = self.send_sequence.wrapping_add(1);
        if self.send_sequence == 0 {
            self.send_sequence = 1;
        }
        self.acks.track_packet(self.send_sequence, now);
        self.last_send = now;
        self.ack_pending = false;

        let (ack, ack_bitfield) = self.received.ack_data();
        PacketHeader::new(self.send_sequence, ack, ack_bitfield)
    }

    /// Records an incoming sequenced header and settles in-flight messages
    /// it acks. Returns false when the packet is a duplicate.
    pub fn on_header(&mut self, header: &PacketHeader, now: Instant) -> bool {
        self.last_receive = now;
        if !self.received.record_received(header.sequence) {
            return false;
        }

        let acked = self.acks.process_ack(header.ack, header.ack_bitfield, now);
        if !acked.is_empty() {
            self.in_flight.retain(|message| {
                !message
                    .packet_sequences
                    .iter()
                    .any(|sequence| acked.contains(sequence))
            });
        }
        true
    }

    /// Assigns the next message sequence on `delivery`'s channel.
    pub fn next_message_sequence(&mut self, delivery: Delivery) -> u32 {
        let slot = &mut self.outgoing[delivery as usize];
        *slot = slot.wrapping_add(1);
        *slot
    }

    pub fn track_reliable(
        &mut self,
        delivery: Delivery,
        message_sequence: u32,
        fragment: Fragment,
        payload: Vec<u8>,
        packet_sequence: u32,
        now: Instant,
    ) {
        self.in_flight.push(InFlight {
            delivery,
            message_sequence,
            fragment,
            payload,
            packet_sequences: vec![packet_sequence],
            last_sent: now,
        });
    }

    pub fn resend_interval(&self, minimum: Duration) -> Duration {
        let rtt = self.acks.srtt_ms() + 4.0 * self.acks.rtt_var_ms();
        minimum.max(Duration::from_secs_f32(rtt.max(0.0) / 1000.0))
    }

    /// Reliable messages whose last transmission is older than `interval`.
    pub fn due_resends(&mut self, interval: Duration, now: Instant) -> Vec<Resend> {
        self.in_flight
            .iter()
            .filter(|message| now.duration_since(message.last_sent) >= interval)
            .map(|message| Resend {
                delivery: message.delivery,
                message_sequence: message.message_sequence,
                fragment: message.fragment,
                payload: message.payload.clone(),
            })
            .collect()
    }

    pub fn mark_resent(&mut self, resend: &Resend, packet_sequence: u32, now: Instant) {
        if let Some(message) = self.in_flight.iter_mut().find(|message| {
            message.delivery == resend.delivery
                && message.message_sequence == resend.message_sequence
                && message.fragment == resend.fragment
        }) {
            message.packet_sequences.push(packet_sequence);
            message.last_sent = now;
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Collects one fragment and passes the message on to its channel once
    /// every fragment has arrived.
    pub fn accept_fragment(
        &mut self,
        delivery: Delivery,
        message_sequence: u32,
        fragment: Fragment,
        payload: Vec<u8>,
        now: Instant,
    ) -> Vec<Vec<u8>> {
        if fragment.is_whole() {
            return self.accept_message(delivery, message_sequence, payload);
        }
        if delivery.is_reliable() {
            self.ack_pending = true;
        }
        let key = (delivery, message_sequence);
        if self.is_superseded(delivery, message_sequence) {
            self.partial.remove(&key);
            return Vec::new();
        }
        if fragment.index >= fragment.count || fragment.count as usize > MAX_FRAGMENTS {
            return Vec::new();
        }

        if !self.partial.contains_key(&key) {
            let (reliable, unreliable): (Vec<_>, Vec<_>) = self
                .partial
                .iter()
                .map(|(key, partial)| (*key, partial.started))
                .partition(|((class, _), _)| class.is_reliable());
            if delivery.is_reliable() {
                if reliable.len() >= MAX_ORDERED_BACKLOG {
                    return Vec::new();
                }
            } else if unreliable.len() >= MAX_PARTIAL_MESSAGES
                && let Some((oldest, _)) = unreliable.iter().min_by_key(|(_, started)| *started)
            {
                self.partial.remove(oldest);
            }
        }

        let partial = self
            .partial
            .entry(key)
            .or_insert_with(|| Partial::new(fragment.count, now));
        if partial.parts.len() != fragment.count as usize {
            return Vec::new();
        }
        let slot = &mut partial.parts[fragment.index as usize];
        if slot.is_none() {
            *slot = Some(payload);
            partial.received += 1;
        }
        if partial.received < partial.parts.len() {
            return Vec::new();
        }

        let Some(complete) = self.partial.remove(&key) else {
            return Vec::new();
        };
        let message = complete.parts.into_iter().flatten().flatten().collect();
        self.accept_message(delivery, message_sequence, message)
    }

    /// Drops unreliable messages whose fragments stopped arriving. Reliable
    /// ones are resent until complete.
    pub fn expire_partials(&mut self, max_age: Duration, now: Instant) {
        self.partial.retain(|(delivery, _), partial| {
            delivery.is_reliable() || now.duration_since(partial.started) < max_age
        });
    }

    pub fn partial_count(&self) -> usize {
        self.partial.len()
    }

    /// True when the channel would drop `message_sequence` on arrival.
    fn is_superseded(&self, delivery: Delivery, message_sequence: u32) -> bool {
        match delivery {
            Delivery::Unreliable => false,
            Delivery::UnreliableSequenced | Delivery::ReliableSequenced => self.newest_incoming
                [delivery as usize]
                .is_some_and(|seen| !sequence_greater_than(message_sequence, seen)),
            Delivery::ReliableOrdered => sequence_greater_than(self.ordered_next, message_sequence),
        }
    }

    /// Runs an incoming message through its channel and returns the payloads
    /// that are ready for the application, in delivery order.
    pub fn accept_message(
        &mut self,
        delivery: Delivery,
        message_sequence: u32,
        payload: Vec<u8>,
    ) -> Vec<Vec<u8>> {
        if delivery.is_reliable() {
            self.ack_pending = true;
        }

        match delivery {
            Delivery::Unreliable => vec![payload],
            Delivery::UnreliableSequenced | Delivery::ReliableSequenced => {
                let newest = &mut self.newest_incoming[delivery as usize];
                match *newest {
                    Some(seen) if !sequence_greater_than(message_sequence, seen) => Vec::new(),
                    _ => {
                        *newest = Some(message_sequence);
                        vec![payload]
                    }
                }
            }
            Delivery::ReliableOrdered => {
                if sequence_greater_than(self.ordered_next, message_sequence)
                    || self.ordered_backlog.len() >= MAX_ORDERED_BACKLOG
                {
                    return Vec::new();
                }
                self.ordered_backlog.insert(message_sequence, payload);

                let mut ready = Vec::new();
                while let Some(next) = self.ordered_backlog.remove(&self.ordered_next) {
                    ready.push(next);
                    self.ordered_next = self.ordered_next.wrapping_add(1);
                }
                ready
            }
        }
    }

    pub fn round_trip(&self) -> Option<Duration> {
        self.acks.round_trip()
    }

    pub fn srtt_ms(&self) -> f32 {
        self.acks.srtt_ms()
    }
}
