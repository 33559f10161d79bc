//! Application messages carried inside transport payloads.
//!
//! Every message starts with a one-byte [`NetCommand`] discriminator. Integers
//! are little-endian; byte blocks carry an `i32` length prefix and strings a
//! varint length prefix.

use crate::wire::{WireError, WireReader, WireWriter};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetCommand {
    Snapshot = 1,
    Notification = 2,
    UserCommand = 3,
}

impl NetCommand {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Snapshot),
            2 => Some(Self::Notification),
            3 => Some(Self::UserCommand),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotMessage {
    pub frame: u32,
    /// 0 when `patch` is the full snapshot.
    pub base_frame: u32,
    pub patch: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserCommand {
    /// Last frame the client applied; doubles as its snapshot ack.
    pub snapshot_id: u32,
    pub command_id: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Snapshot(SnapshotMessage),
    Notification(String),
    UserCommand(UserCommand),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("empty message")]
    Empty,
    #[error("unknown command byte {0}")]
    UnknownCommand(u8),
    #[error("malformed message: {0}")]
    Wire(#[from] WireError),
}

impl Message {
    pub fn command(&self) -> NetCommand {
        match self {
            Message::Snapshot(_) => NetCommand::Snapshot,
            Message::Notification(_) => NetCommand::Notification,
            Message::UserCommand(_) => NetCommand::UserCommand,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = WireWriter::with_capacity(self.encoded_hint());
        out.u8(self.command() as u8);
        match self {
            Message::Snapshot(snapshot) => {
                out.u32(snapshot.frame);
                out.u32(snapshot.base_frame);
                out.i32(snapshot.patch.len() as i32);
                out.bytes(&snapshot.patch);
            }
            Message::Notification(text) => out.string(text),
            Message::UserCommand(command) => {
                out.u32(command.snapshot_id);
                out.u32(command.command_id);
                out.i32(command.payload.len() as i32);
                out.bytes(&command.payload);
            }
        }
        out.finish()
    }

    /// Decodes one message. Bytes past the end of the message are ignored.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = WireReader::new(data);
        if reader.is_empty() {
            return Err(ProtocolError::Empty);
        }
        let tag = reader.u8()?;
        let command = NetCommand::from_u8(tag).ok_or(ProtocolError::UnknownCommand(tag))?;

        let message = match command {
            NetCommand::Snapshot => Message::Snapshot(SnapshotMessage {
                frame: reader.u32()?,
                base_frame: reader.u32()?,
                patch: reader.sized_bytes()?.to_vec(),
            }),
            NetCommand::Notification => Message::Notification(reader.string()?),
            NetCommand::UserCommand => Message::UserCommand(UserCommand {
                snapshot_id: reader.u32()?,
                command_id: reader.u32()?,
                payload: reader.sized_bytes()?.to_vec(),
            }),
        };
        Ok(message)
    }

    fn encoded_hint(&self) -> usize {
        match self {
            Message::Snapshot(snapshot) => 13 + snapshot.patch.len(),
            Message::Notification(text) => 6 + text.len(),
            Message::UserCommand(command) => 13 + command.payload.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_layout() {
        let bytes = Message::Snapshot(SnapshotMessage {
            frame: 7,
            base_frame: 5,
            patch: vec![0xAA, 0xBB],
        })
        .encode();

        assert_eq!(
            bytes,
            vec![1, 7, 0, 0, 0, 5, 0, 0, 0, 2, 0, 0, 0, 0xAA, 0xBB]
        );
    }

    #[test]
    fn notification_layout() {
        let bytes = Message::Notification("hi".into()).encode();
        assert_eq!(bytes, vec![2, 2, b'h', b'i']);
        assert_eq!(
            Message::decode(&bytes).unwrap(),
            Message::Notification("hi".into())
        );
    }

    #[test]
    fn user_command_decodes() {
        let command = UserCommand {
            snapshot_id: 5,
            command_id: 12,
            payload: vec![1, 2, 3],
        };
        let bytes = Message::UserCommand(command.clone()).encode();
        assert_eq!(bytes.len(), 16);
        assert_eq!(Message::decode(&bytes).unwrap(), Message::UserCommand(command));
    }

    #[test]
    fn unknown_command_is_reported() {
        assert_eq!(
            Message::decode(&[0x7F, 1, 2]),
            Err(ProtocolError::UnknownCommand(0x7F))
        );
        assert_eq!(Message::decode(&[]), Err(ProtocolError::Empty));
    }

    #[test]
    fn truncated_snapshot_is_malformed() {
        let mut bytes = Message::Snapshot(SnapshotMessage {
            frame: 1,
            base_frame: 0,
            patch: vec![9; 10],
        })
        .encode();
        bytes.truncate(bytes.len() - 3);

        assert!(matches!(
            Message::decode(&bytes),
            Err(ProtocolError::Wire(WireError::Truncated { .. }))
        ));
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        let mut bytes = Message::Notification("ok".into()).encode();
        bytes.extend_from_slice(&[0xFF, 0xFF]);
        assert_eq!(
            Message::decode(&bytes).unwrap(),
            Message::Notification("ok".into())
        );
    }
}
