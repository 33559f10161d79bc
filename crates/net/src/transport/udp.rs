use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

use log::Level;

use super::packet::{MAX_DATAGRAM_SIZE, Packet, PacketBody, PacketHeader};
use super::peer::{Fragment, MAX_FRAGMENTS, Peer, Phase};
use super::simulator::NetworkSimulator;
use super::stats::{LossSimulation, NetworkStats};
use super::{Delivery, Incoming, NetEvent, PeerStatus, Transport, TransportError};

/// Message bytes per datagram. Longer messages are split so that no
/// datagram leans on IP fragmentation.
pub const FRAGMENT_SIZE: usize = 8 * 1024;
pub const MAX_MESSAGE_SIZE: usize = FRAGMENT_SIZE * MAX_FRAGMENTS;

#[derive(Debug, Clone)]
pub struct UdpConfig {
    pub max_peers: usize,
    /// Silence after which a peer is dropped.
    pub timeout: Duration,
    pub connect_retry: Duration,
    pub connect_attempts: u32,
    pub resend_min: Duration,
    pub keepalive: Duration,
    pub max_datagrams_per_poll: usize,
    pub loss: LossSimulation,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            max_peers: 64,
            timeout: Duration::from_secs(10),
            connect_retry: Duration::from_millis(250),
            connect_attempts: 20,
            resend_min: Duration::from_millis(100),
            keepalive: Duration::from_secs(1),
            max_datagrams_per_poll: 512,
            loss: LossSimulation::default(),
        }
    }
}

/// Connection-oriented transport over one non-blocking UDP socket.
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    config: UdpConfig,
    accepts_connections: bool,
    peers: HashMap<SocketAddr, Peer>,
    events: VecDeque<Incoming>,
    simulator: NetworkSimulator,
    stats: NetworkStats,
    recv_buffer: Vec<u8>,
    closed: bool,
}

impl UdpTransport {
    /// Binds `addr` and accepts incoming connections.
    pub fn listen<A: ToSocketAddrs>(addr: A, config: UdpConfig) -> Result<Self, TransportError> {
        Self::bind(addr, config, true)
    }

    /// Binds an ephemeral port for outgoing connections only.
    pub fn open(config: UdpConfig) -> Result<Self, TransportError> {
        Self::bind((Ipv4Addr::UNSPECIFIED, 0), config, false)
    }

    fn bind<A: ToSocketAddrs>(
        addr: A,
        config: UdpConfig,
        accepts_connections: bool,
    ) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket,
            local_addr,
            config,
            accepts_connections,
            peers: HashMap::new(),
            events: VecDeque::new(),
            simulator: NetworkSimulator::new(),
            stats: NetworkStats::default(),
            recv_buffer: vec![0u8; MAX_DATAGRAM_SIZE],
            closed: false,
        })
    }

    /// Sends a discovery request; listening servers answer with a
    /// `DiscoveryResponse` event. `target` may be a broadcast address.
    pub fn discover(&mut self, target: SocketAddr) -> Result<(), TransportError> {
        self.ensure_open()?;
        if let SocketAddr::V4(v4) = target
            && v4.ip().is_broadcast()
        {
            self.socket.set_broadcast(true)?;
        }
        self.send_raw(
            &Packet::new(PacketHeader::unsequenced(), PacketBody::DiscoveryRequest),
            target,
        )
    }

    pub fn config(&self) -> &UdpConfig {
        &self.config
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn push(&mut self, sender: SocketAddr, event: NetEvent) {
        self.events.push_back(Incoming::new(sender, event));
    }

    fn diagnostic(&mut self, sender: SocketAddr, level: Level, text: String) {
        self.push(sender, NetEvent::Diagnostic { level, text });
    }

    fn disconnected(&mut self, peer: Peer, reason: &str) {
        self.push(
            peer.addr,
            NetEvent::StatusChanged {
                status: PeerStatus::Disconnected,
                reason: reason.to_string(),
                hail: peer.hail,
            },
        );
    }

    fn send_raw(&mut self, packet: &Packet, addr: SocketAddr) -> Result<(), TransportError> {
        let data = packet.serialize()?;
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(TransportError::TooLarge {
                size: data.len(),
                limit: MAX_DATAGRAM_SIZE,
            });
        }

        if self.config.loss.should_drop() {
            self.stats.packets_lost += 1;
            return Ok(());
        }
        let delay = self.config.loss.delay();
        if !delay.is_zero() {
            self.simulator.delay(data, addr, delay, Instant::now());
            return Ok(());
        }
        self.write_datagram(&data, addr)
    }

    fn write_datagram(&mut self, data: &[u8], addr: SocketAddr) -> Result<(), TransportError> {
        match self.socket.send_to(data, addr) {
            Ok(bytes) => {
                self.stats.packets_sent += 1;
                self.stats.bytes_sent += bytes as u64;
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.stats.packets_lost += 1;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Sends a packet that carries a sequence number and our acks.
    fn send_sequenced(&mut self, addr: SocketAddr, body: PacketBody) -> Result<u32, TransportError> {
        let peer = self
            .peers
            .get_mut(&addr)
            .ok_or(TransportError::UnknownPeer(addr))?;
        let header = peer.next_header(Instant::now());
        self.send_raw(&Packet::new(header, body), addr)?;
        Ok(header.sequence)
    }

    fn send_unsequenced(&mut self, addr: SocketAddr, body: PacketBody) -> Result<(), TransportError> {
        self.send_raw(&Packet::new(PacketHeader::unsequenced(), body), addr)
    }

    fn poll(&mut self) -> Result<(), TransportError> {
        let now = Instant::now();
        for (data, addr) in self.simulator.take_due(now) {
            self.write_datagram(&data, addr)?;
        }

        for _ in 0..self.config.max_datagrams_per_poll {
            let (size, addr) = match self.socket.recv_from(&mut self.recv_buffer) {
                Ok(received) => received,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                // ICMP port unreachable from a peer that went away
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            self.stats.packets_received += 1;
            self.stats.bytes_received += size as u64;

            match Packet::deserialize(&self.recv_buffer[..size]) {
                Ok(packet) => self.handle_packet(packet, addr, now)?,
                Err(err) => {
                    self.diagnostic(addr, Level::Debug, format!("Dropped packet from {addr}: {err}"))
                }
            }
        }

        self.maintain(now)
    }

    fn handle_packet(
        &mut self,
        packet: Packet,
        addr: SocketAddr,
        now: Instant,
    ) -> Result<(), TransportError> {
        let Packet { header, body } = packet;
        match body {
            PacketBody::Connect { hail } => return self.on_connect(addr, hail, now),
            PacketBody::Approved { info } => {
                if let Some(peer) = self.peers.get_mut(&addr)
                    && matches!(peer.phase, Phase::Connecting { .. })
                {
                    peer.phase = Phase::Connected;
                    peer.last_receive = now;
                    peer.response = info.clone();
                    self.push(
                        addr,
                        NetEvent::StatusChanged {
                            status: PeerStatus::Connected,
                            reason: String::new(),
                            hail: info,
                        },
                    );
                }
            }
            PacketBody::Denied { reason } => {
                let connecting = self
                    .peers
                    .get(&addr)
                    .is_some_and(|peer| matches!(peer.phase, Phase::Connecting { .. }));
                if connecting && let Some(peer) = self.peers.remove(&addr) {
                    self.disconnected(peer, &reason);
                }
            }
            PacketBody::Disconnect { reason } => {
                if let Some(peer) = self.peers.remove(&addr) {
                    self.disconnected(peer, &reason);
                }
            }
            PacketBody::Message {
                delivery,
                message_sequence,
                fragment,
                fragment_count,
                payload,
            } => {
                let Some(delivery) = Delivery::from_u8(delivery) else {
                    self.diagnostic(
                        addr,
                        Level::Warn,
                        format!("Unknown delivery method {delivery} from {addr}"),
                    );
                    return Ok(());
                };
                let Some(peer) = self.peers.get_mut(&addr).filter(|peer| peer.is_connected())
                else {
                    self.diagnostic(
                        addr,
                        Level::Debug,
                        format!("Message from unconnected {addr} dropped"),
                    );
                    return Ok(());
                };
                if !peer.on_header(&header, now) {
                    return Ok(());
                }
                let fragment = Fragment {
                    index: fragment,
                    count: fragment_count,
                };
                for payload in
                    peer.accept_fragment(delivery, message_sequence, fragment, payload, now)
                {
                    self.events
                        .push_back(Incoming::new(addr, NetEvent::Data { payload, delivery }));
                }
            }
            PacketBody::Ack | PacketBody::KeepAlive => {
                if let Some(peer) = self.peers.get_mut(&addr)
                    && peer.is_connected()
                {
                    peer.on_header(&header, now);
                }
            }
            PacketBody::DiscoveryRequest => {
                if self.accepts_connections {
                    self.push(addr, NetEvent::DiscoveryRequest);
                }
            }
            PacketBody::DiscoveryResponse { info } => {
                self.push(addr, NetEvent::DiscoveryResponse { info });
            }
        }
        Ok(())
    }

    fn on_connect(
        &mut self,
        addr: SocketAddr,
        hail: Vec<u8>,
        now: Instant,
    ) -> Result<(), TransportError> {
        if !self.accepts_connections {
            return Ok(());
        }

        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.last_receive = now;
            if peer.is_connected() {
                // our approval got lost
                let info = peer.response.clone();
                return self.send_unsequenced(addr, PacketBody::Approved { info });
            }
            return Ok(());
        }

        if self.peers.len() >= self.config.max_peers {
            self.diagnostic(
                addr,
                Level::Warn,
                format!("Rejected connection from {addr}: server full"),
            );
            return self.send_unsequenced(
                addr,
                PacketBody::Denied {
                    reason: "Server full".to_string(),
                },
            );
        }

        self.peers
            .insert(addr, Peer::new(addr, Phase::AwaitingApproval, hail.clone(), now));
        self.push(addr, NetEvent::ConnectionApproval { hail });
        Ok(())
    }

    /// Connect retries, liveness timeouts, reliable resends and keepalives.
    fn maintain(&mut self, now: Instant) -> Result<(), TransportError> {
        let mut lost = Vec::new();
        let mut retries = Vec::new();
        let mut resends = Vec::new();

        for peer in self.peers.values_mut() {
            match peer.phase {
                Phase::Connecting {
                    attempts,
                    last_attempt,
                } => {
                    if now.duration_since(last_attempt) < self.config.connect_retry {
                        continue;
                    }
                    if attempts >= self.config.connect_attempts {
                        lost.push((peer.addr, "Failed to establish connection"));
                    } else {
                        peer.phase = Phase::Connecting {
                            attempts: attempts + 1,
                            last_attempt: now,
                        };
                        retries.push((peer.addr, peer.hail.clone()));
                    }
                }
                Phase::AwaitingApproval | Phase::Connected => {
                    if now.duration_since(peer.last_receive) > self.config.timeout {
                        lost.push((peer.addr, "Connection timed out"));
                    } else if peer.is_connected() {
                        peer.expire_partials(self.config.timeout, now);
                        let interval = peer.resend_interval(self.config.resend_min);
                        let addr = peer.addr;
                        resends.extend(
                            peer.due_resends(interval, now)
                                .into_iter()
                                .map(|resend| (addr, resend)),
                        );
                    }
                }
            }
        }

        for (addr, reason) in lost {
            if let Some(peer) = self.peers.remove(&addr) {
                self.diagnostic(addr, Level::Debug, format!("{addr}: {reason}"));
                self.disconnected(peer, reason);
            }
        }

        for (addr, hail) in retries {
            self.send_unsequenced(addr, PacketBody::Connect { hail })?;
        }

        for (addr, resend) in resends {
            let body = PacketBody::Message {
                delivery: resend.delivery as u8,
                message_sequence: resend.message_sequence,
                fragment: resend.fragment.index,
                fragment_count: resend.fragment.count,
                payload: resend.payload.clone(),
            };
            let sequence = self.send_sequenced(addr, body)?;
            self.stats.packets_resent += 1;
            if let Some(peer) = self.peers.get_mut(&addr) {
                peer.mark_resent(&resend, sequence, now);
            }
        }

        let idle: Vec<(SocketAddr, bool)> = self
            .peers
            .values()
            .filter(|peer| peer.is_connected())
            .filter(|peer| {
                peer.ack_pending || now.duration_since(peer.last_send) >= self.config.keepalive
            })
            .map(|peer| (peer.addr, peer.ack_pending))
            .collect();
        for (addr, ack_only) in idle {
            let body = if ack_only {
                PacketBody::Ack
            } else {
                PacketBody::KeepAlive
            };
            self.send_sequenced(addr, body)?;
        }

        Ok(())
    }
}

impl Transport for UdpTransport {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn connect(&mut self, remote: SocketAddr, hail: &[u8]) -> Result<(), TransportError> {
        self.ensure_open()?;
        if self.peers.contains_key(&remote) {
            return Err(TransportError::ConnectFailed {
                addr: remote.to_string(),
                reason: "already connected".to_string(),
            });
        }

        let now = Instant::now();
        let phase = Phase::Connecting {
            attempts: 1,
            last_attempt: now,
        };
        self.peers
            .insert(remote, Peer::new(remote, phase, hail.to_vec(), now));
        self.send_unsequenced(
            remote,
            PacketBody::Connect {
                hail: hail.to_vec(),
            },
        )
    }

    fn receive(&mut self) -> Result<Option<Incoming>, TransportError> {
        self.ensure_open()?;
        if self.events.is_empty() {
            self.poll()?;
        }
        Ok(self.events.pop_front())
    }

    fn send(
        &mut self,
        peer: SocketAddr,
        payload: &[u8],
        delivery: Delivery,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(TransportError::TooLarge {
                size: payload.len(),
                limit: MAX_MESSAGE_SIZE,
            });
        }

        let remote = self
            .peers
            .get_mut(&peer)
            .filter(|remote| remote.is_connected())
            .ok_or(TransportError::UnknownPeer(peer))?;
        let message_sequence = remote.next_message_sequence(delivery);

        let chunks: Vec<&[u8]> = if payload.is_empty() {
            vec![payload]
        } else {
            payload.chunks(FRAGMENT_SIZE).collect()
        };
        let count = chunks.len() as u16;
        if count > 1 {
            log::trace!("Fragmenting {} bytes to {peer} into {count} datagrams", payload.len());
        }

        for (index, chunk) in chunks.into_iter().enumerate() {
            let fragment = Fragment {
                index: index as u16,
                count,
            };
            let body = PacketBody::Message {
                delivery: delivery as u8,
                message_sequence,
                fragment: fragment.index,
                fragment_count: fragment.count,
                payload: chunk.to_vec(),
            };
            let packet_sequence = self.send_sequenced(peer, body)?;

            if delivery.is_reliable()
                && let Some(remote) = self.peers.get_mut(&peer)
            {
                remote.track_reliable(
                    delivery,
                    message_sequence,
                    fragment,
                    chunk.to_vec(),
                    packet_sequence,
                    Instant::now(),
                );
            }
        }
        Ok(())
    }

    fn approve(&mut self, peer: SocketAddr, response: &[u8]) -> Result<(), TransportError> {
        self.ensure_open()?;
        let remote = self
            .peers
            .get_mut(&peer)
            .filter(|remote| remote.phase == Phase::AwaitingApproval)
            .ok_or(TransportError::UnknownPeer(peer))?;
        remote.phase = Phase::Connected;
        remote.response = response.to_vec();
        remote.last_receive = Instant::now();
        let hail = remote.hail.clone();

        self.send_unsequenced(
            peer,
            PacketBody::Approved {
                info: response.to_vec(),
            },
        )?;
        self.push(
            peer,
            NetEvent::StatusChanged {
                status: PeerStatus::Connected,
                reason: String::new(),
                hail,
            },
        );
        Ok(())
    }

    fn deny(&mut self, peer: SocketAddr, reason: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.peers
            .remove(&peer)
            .ok_or(TransportError::UnknownPeer(peer))?;
        self.send_unsequenced(
            peer,
            PacketBody::Denied {
                reason: reason.to_string(),
            },
        )
    }

    fn disconnect(&mut self, peer: SocketAddr, reason: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        let remote = self
            .peers
            .remove(&peer)
            .ok_or(TransportError::UnknownPeer(peer))?;
        self.send_unsequenced(
            peer,
            PacketBody::Disconnect {
                reason: reason.to_string(),
            },
        )?;
        self.disconnected(remote, reason);
        Ok(())
    }

    fn respond_discovery(&mut self, peer: SocketAddr, info: &[u8]) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.send_unsequenced(
            peer,
            PacketBody::DiscoveryResponse {
                info: info.to_vec(),
            },
        )
    }

    fn connections(&self) -> Vec<SocketAddr> {
        self.peers
            .values()
            .filter(|peer| peer.is_connected())
            .map(|peer| peer.addr)
            .collect()
    }

    fn round_trip(&self, peer: SocketAddr) -> Option<Duration> {
        self.peers.get(&peer).and_then(Peer::round_trip)
    }

    fn stats(&self) -> NetworkStats {
        let connected: Vec<f32> = self
            .peers
            .values()
            .filter(|peer| peer.is_connected())
            .map(Peer::srtt_ms)
            .collect();
        let mut stats = self.stats.clone();
        if !connected.is_empty() {
            stats.rtt_ms = connected.iter().sum::<f32>() / connected.len() as f32;
        }
        stats
    }

    fn shutdown(&mut self, reason: &str) {
        if self.closed {
            return;
        }
        let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for addr in addrs {
            let body = PacketBody::Disconnect {
                reason: reason.to_string(),
            };
            if let Err(err) = self.send_unsequenced(addr, body) {
                log::debug!("Failed to notify {addr} of shutdown: {err}");
            }
        }
        for (data, addr) in self.simulator.take_due(Instant::now() + Duration::from_secs(3600)) {
            let _ = self.socket.send_to(&data, addr);
        }
        self.peers.clear();
        self.events.clear();
        self.closed = true;
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.shutdown("Transport closed");
    }
}
