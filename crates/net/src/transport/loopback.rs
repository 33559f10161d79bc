use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use super::{Delivery, Incoming, NetEvent, PeerStatus, Transport, TransportError};
use crate::lock;

const FIRST_EPHEMERAL_PORT: u16 = 49152;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Pending,
    Connected,
}

#[derive(Debug, Default)]
struct Mailbox {
    listening: bool,
    inbox: VecDeque<Incoming>,
    links: HashMap<SocketAddr, (Link, Vec<u8>)>,
    faults: VecDeque<String>,
}

#[derive(Debug)]
struct Hub {
    mailboxes: HashMap<SocketAddr, Mailbox>,
    next_port: u16,
}

/// In-process network shared by every [`LoopbackTransport`] created from it.
/// Delivery is immediate and lossless, so every delivery class is honoured.
#[derive(Debug, Clone)]
pub struct LoopbackNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl Default for LoopbackNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self {
            hub: Arc::new(Mutex::new(Hub {
                mailboxes: HashMap::new(),
                next_port: FIRST_EPHEMERAL_PORT,
            })),
        }
    }

    /// Opens a transport at `addr` that accepts connections.
    pub fn listen(&self, addr: SocketAddr) -> Result<LoopbackTransport, TransportError> {
        let mut hub = lock(&self.hub);
        if hub.mailboxes.contains_key(&addr) {
            return Err(TransportError::AddressInUse(addr));
        }
        hub.mailboxes.insert(
            addr,
            Mailbox {
                listening: true,
                ..Mailbox::default()
            },
        );
        Ok(LoopbackTransport::new(self.clone(), addr))
    }

    /// Opens a transport on a fresh local address for outgoing connections.
    pub fn open(&self) -> LoopbackTransport {
        let mut hub = lock(&self.hub);
        let addr = loop {
            let port = hub.next_port;
            hub.next_port = hub.next_port.checked_add(1).unwrap_or(FIRST_EPHEMERAL_PORT);
            let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
            if !hub.mailboxes.contains_key(&addr) {
                break addr;
            }
        };
        hub.mailboxes.insert(addr, Mailbox::default());
        LoopbackTransport::new(self.clone(), addr)
    }

    /// Queues a raw event for `to`, as if `incoming.sender` had sent it.
    pub fn inject(&self, to: SocketAddr, incoming: Incoming) -> bool {
        match lock(&self.hub).mailboxes.get_mut(&to) {
            Some(mailbox) => {
                mailbox.inbox.push_back(incoming);
                true
            }
            None => false,
        }
    }

    /// Makes the next `receive` on `addr` fail with a transport fault.
    pub fn fail_next_receive(&self, addr: SocketAddr, message: impl Into<String>) -> bool {
        match lock(&self.hub).mailboxes.get_mut(&addr) {
            Some(mailbox) => {
                mailbox.faults.push_back(message.into());
                true
            }
            None => false,
        }
    }

    pub fn is_open(&self, addr: SocketAddr) -> bool {
        lock(&self.hub).mailboxes.contains_key(&addr)
    }

    /// Number of events waiting at `addr`.
    pub fn pending(&self, addr: SocketAddr) -> usize {
        lock(&self.hub)
            .mailboxes
            .get(&addr)
            .map_or(0, |mailbox| mailbox.inbox.len())
    }
}

#[derive(Debug)]
pub struct LoopbackTransport {
    network: LoopbackNetwork,
    addr: SocketAddr,
    closed: bool,
}

impl LoopbackTransport {
    fn new(network: LoopbackNetwork, addr: SocketAddr) -> Self {
        Self {
            network,
            addr,
            closed: false,
        }
    }

    pub fn network(&self) -> &LoopbackNetwork {
        &self.network
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    /// Asks every listening mailbox for its discovery info.
    pub fn discover(&mut self) -> Result<usize, TransportError> {
        self.ensure_open()?;
        let mut hub = lock(&self.network.hub);
        let mut asked = 0;
        for (addr, mailbox) in hub.mailboxes.iter_mut() {
            if mailbox.listening && *addr != self.addr {
                mailbox
                    .inbox
                    .push_back(Incoming::new(self.addr, NetEvent::DiscoveryRequest));
                asked += 1;
            }
        }
        Ok(asked)
    }

    /// Drops the link on both ends and tells `peer` why.
    fn sever(&mut self, peer: SocketAddr, reason: &str) -> Option<Vec<u8>> {
        let mut hub = lock(&self.network.hub);
        let (_, hail) = hub.mailboxes.get_mut(&self.addr)?.links.remove(&peer)?;
        if let Some(remote) = hub.mailboxes.get_mut(&peer)
            && let Some((_, remote_hail)) = remote.links.remove(&self.addr)
        {
            remote.inbox.push_back(Incoming::new(
                self.addr,
                NetEvent::StatusChanged {
                    status: PeerStatus::Disconnected,
                    reason: reason.to_string(),
                    hail: remote_hail,
                },
            ));
        }
        Some(hail)
    }
}

impl Transport for LoopbackTransport {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn connect(&mut self, remote: SocketAddr, hail: &[u8]) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut hub = lock(&self.network.hub);
        let listening = hub
            .mailboxes
            .get(&remote)
            .is_some_and(|mailbox| mailbox.listening);
        if !listening || remote == self.addr {
            return Err(TransportError::ConnectFailed {
                addr: remote.to_string(),
                reason: "no listener at that address".to_string(),
            });
        }

        if let Some(local) = hub.mailboxes.get_mut(&self.addr) {
            local.links.insert(remote, (Link::Pending, Vec::new()));
        }
        if let Some(server) = hub.mailboxes.get_mut(&remote) {
            server
                .links
                .insert(self.addr, (Link::Pending, hail.to_vec()));
            server.inbox.push_back(Incoming::new(
                self.addr,
                NetEvent::ConnectionApproval {
                    hail: hail.to_vec(),
                },
            ));
        }
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<Incoming>, TransportError> {
        self.ensure_open()?;
        let mut hub = lock(&self.network.hub);
        let mailbox = hub
            .mailboxes
            .get_mut(&self.addr)
            .ok_or(TransportError::Closed)?;
        if let Some(fault) = mailbox.faults.pop_front() {
            return Err(TransportError::Fault(fault));
        }
        Ok(mailbox.inbox.pop_front())
    }

    fn send(
        &mut self,
        peer: SocketAddr,
        payload: &[u8],
        delivery: Delivery,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut hub = lock(&self.network.hub);
        let linked = hub
            .mailboxes
            .get(&self.addr)
            .and_then(|mailbox| mailbox.links.get(&peer))
            .is_some_and(|(link, _)| *link == Link::Connected);
        if !linked {
            return Err(TransportError::UnknownPeer(peer));
        }

        let remote = hub
            .mailboxes
            .get_mut(&peer)
            .ok_or(TransportError::UnknownPeer(peer))?;
        remote.inbox.push_back(Incoming::new(
            self.addr,
            NetEvent::Data {
                payload: payload.to_vec(),
                delivery,
            },
        ));
        Ok(())
    }

    fn approve(&mut self, peer: SocketAddr, response: &[u8]) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut hub = lock(&self.network.hub);

        let hail = match hub
            .mailboxes
            .get_mut(&self.addr)
            .and_then(|mailbox| mailbox.links.get_mut(&peer))
        {
            Some((link, hail)) if *link == Link::Pending => {
                *link = Link::Connected;
                hail.clone()
            }
            _ => return Err(TransportError::UnknownPeer(peer)),
        };

        if let Some(local) = hub.mailboxes.get_mut(&self.addr) {
            local.inbox.push_back(Incoming::new(
                peer,
                NetEvent::StatusChanged {
                    status: PeerStatus::Connected,
                    reason: String::new(),
                    hail,
                },
            ));
        }
        if let Some(remote) = hub.mailboxes.get_mut(&peer) {
            remote
                .links
                .insert(self.addr, (Link::Connected, response.to_vec()));
            remote.inbox.push_back(Incoming::new(
                self.addr,
                NetEvent::StatusChanged {
                    status: PeerStatus::Connected,
                    reason: String::new(),
                    hail: response.to_vec(),
                },
            ));
        }
        Ok(())
    }

    fn deny(&mut self, peer: SocketAddr, reason: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.sever(peer, reason)
            .map(|_| ())
            .ok_or(TransportError::UnknownPeer(peer))
    }

    fn disconnect(&mut self, peer: SocketAddr, reason: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        let hail = self
            .sever(peer, reason)
            .ok_or(TransportError::UnknownPeer(peer))?;

        let mut hub = lock(&self.network.hub);
        if let Some(local) = hub.mailboxes.get_mut(&self.addr) {
            local.inbox.push_back(Incoming::new(
                peer,
                NetEvent::StatusChanged {
                    status: PeerStatus::Disconnected,
                    reason: reason.to_string(),
                    hail,
                },
            ));
        }
        Ok(())
    }

    fn respond_discovery(&mut self, peer: SocketAddr, info: &[u8]) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut hub = lock(&self.network.hub);
        let remote = hub
            .mailboxes
            .get_mut(&peer)
            .ok_or(TransportError::UnknownPeer(peer))?;
        remote.inbox.push_back(Incoming::new(
            self.addr,
            NetEvent::DiscoveryResponse {
                info: info.to_vec(),
            },
        ));
        Ok(())
    }

    fn connections(&self) -> Vec<SocketAddr> {
        lock(&self.network.hub)
            .mailboxes
            .get(&self.addr)
            .map(|mailbox| {
                mailbox
                    .links
                    .iter()
                    .filter(|(_, (link, _))| *link == Link::Connected)
                    .map(|(addr, _)| *addr)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn shutdown(&mut self, reason: &str) {
        if self.closed {
            return;
        }
        let peers: Vec<SocketAddr> = lock(&self.network.hub)
            .mailboxes
            .get(&self.addr)
            .map(|mailbox| mailbox.links.keys().copied().collect())
            .unwrap_or_default();
        for peer in peers {
            self.sever(peer, reason);
        }
        lock(&self.network.hub).mailboxes.remove(&self.addr);
        self.closed = true;
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.shutdown("Transport closed");
    }
}
