use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize, rancor};

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;
pub const PROTOCOL_VERSION: u32 = 2;
pub const PROTOCOL_MAGIC: u32 = 0x534E_4150;

const SEQUENCE_WRAP_THRESHOLD: u32 = u32::MAX / 2;

#[inline]
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_WRAP_THRESHOLD))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_WRAP_THRESHOLD))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub struct PacketHeader {
    pub magic: u32,
    pub version: u32,
    pub sequence: u32,
    pub ack: u32,
    pub ack_bitfield: u32,
}

impl PacketHeader {
    pub fn new(sequence: u32, ack: u32, ack_bitfield: u32) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION,
            sequence,
            ack,
            ack_bitfield,
        }
    }

    /// Header for packets sent outside a connection (handshake, discovery).
    pub fn unsequenced() -> Self {
        Self::new(0, 0, 0)
    }

    pub fn is_valid(&self) -> bool {
        self.magic == PROTOCOL_MAGIC && self.version == PROTOCOL_VERSION
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum PacketBody {
    Connect { hail: Vec<u8> },
    Approved { info: Vec<u8> },
    Denied { reason: String },
    Disconnect { reason: String },
    /// One fragment of an application message. `fragment_count` is 1 for
    /// messages that fit in a single datagram.
    Message {
        delivery: u8,
        message_sequence: u32,
        fragment: u16,
        fragment_count: u16,
        payload: Vec<u8>,
    },
    Ack,
    KeepAlive,
    DiscoveryRequest,
    DiscoveryResponse { info: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Packet {
    pub header: PacketHeader,
    pub body: PacketBody,
}

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("serialization failed: {0}")]
    Serialize(rancor::Error),
    #[error("deserialization failed: {0}")]
    Deserialize(rancor::Error),
    #[error("bad magic or protocol version")]
    BadHeader,
}

impl Packet {
    pub fn new(header: PacketHeader, body: PacketBody) -> Self {
        Self { header, body }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, PacketError> {
        rkyv::to_bytes::<rancor::Error>(self)
            .map(|aligned| aligned.into_vec())
            .map_err(PacketError::Serialize)
    }

    /// Validates and decodes a datagram. The bytes are copied into an aligned
    /// buffer first since socket buffers carry no alignment guarantee.
    pub fn deserialize(data: &[u8]) -> Result<Self, PacketError> {
        let mut aligned = AlignedVec::<16>::with_capacity(data.len());
        aligned.extend_from_slice(data);
        let packet = rkyv::from_bytes::<Self, rancor::Error>(&aligned)
            .map_err(PacketError::Deserialize)?;
        if !packet.header.is_valid() {
            return Err(PacketError::BadHeader);
        }
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_comparison() {
        assert!(sequence_greater_than(2, 1));
        assert!(!sequence_greater_than(1, 2));
        assert!(sequence_greater_than(0, u32::MAX));
        assert!(!sequence_greater_than(u32::MAX, 0));
    }

    #[test]
    fn test_packet_serialization() {
        let packet = Packet::new(
            PacketHeader::new(4, 3, 0b101),
            PacketBody::Message {
                delivery: 3,
                message_sequence: 9,
                fragment: 1,
                fragment_count: 2,
                payload: vec![1, 2, 3],
            },
        );

        let bytes = packet.serialize().unwrap();
        assert_eq!(Packet::deserialize(&bytes).unwrap(), packet);
    }

    #[test]
    fn unaligned_input_decodes() {
        let packet = Packet::new(PacketHeader::unsequenced(), PacketBody::Connect {
            hail: b"player".to_vec(),
        });
        let bytes = packet.serialize().unwrap();

        let mut shifted = vec![0u8];
        shifted.extend_from_slice(&bytes);
        assert_eq!(Packet::deserialize(&shifted[1..]).unwrap(), packet);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(Packet::deserialize(&[0xde, 0xad, 0xbe, 0xef]).is_err());
    }

    #[test]
    fn foreign_magic_is_rejected() {
        let mut packet = Packet::new(PacketHeader::unsequenced(), PacketBody::KeepAlive);
        packet.header.magic = 0x1234;
        let bytes = packet.serialize().unwrap();
        assert!(matches!(
            Packet::deserialize(&bytes),
            Err(PacketError::BadHeader)
        ));
    }
}
