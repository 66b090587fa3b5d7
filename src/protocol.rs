//! Wire protocol framing
//!
//! Every datagram starts with a fixed 8-byte header:
//!
//! ```text
//! offset 0  2 bytes  magic ("WM")
//! offset 2  1 byte   protocol version
//! offset 3  1 byte   packet type
//! offset 4  4 bytes  sequence number, big-endian
//! offset 8  N bytes  payload (raw 16-bit mono PCM for Audio, empty otherwise)
//! ```
//!
//! Sequence numbers are per-session, start at 0 on connect and wrap on
//! overflow. Wraparound is an expected event, not an error.

use bytes::{BufMut, Bytes, BytesMut};

use crate::config::ProtocolConfig;
use crate::error::NetworkError;

/// Size of the fixed packet header in bytes.
pub const HEADER_SIZE: usize = 8;

/// Packet type discriminator carried at header offset 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Audio = 0,
    Keepalive = 1,
    Disconnect = 2,
    Ack = 3,
}

impl PacketType {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Audio),
            1 => Some(Self::Keepalive),
            2 => Some(Self::Disconnect),
            3 => Some(Self::Ack),
            _ => None,
        }
    }
}

/// A decoded datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub sequence: u32,
    pub payload: Bytes,
}

/// Stateless encoder/decoder for the fixed header format.
///
/// Pure transformation; the magic and version bytes come from the
/// [`ProtocolConfig`] handed in at construction.
#[derive(Debug, Clone)]
pub struct PacketCodec {
    magic: [u8; 2],
    version: u8,
}

impl PacketCodec {
    pub fn new(cfg: &ProtocolConfig) -> Self {
        Self {
            magic: cfg.magic,
            version: cfg.version,
        }
    }

    /// Frame a payload. The result is exactly `HEADER_SIZE + payload.len()` bytes.
    pub fn encode(&self, packet_type: PacketType, sequence: u32, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        buf.put_slice(&self.magic);
        buf.put_u8(self.version);
        buf.put_u8(packet_type as u8);
        buf.put_u32(sequence);
        buf.put_slice(payload);
        buf.freeze()
    }

    /// Parse a datagram. Rejects buffers shorter than the header, wrong magic
    /// bytes and unknown type bytes. The version byte is carried but not
    /// checked; only one version is in service.
    pub fn decode(&self, data: &[u8]) -> Result<Packet, NetworkError> {
        if data.len() < HEADER_SIZE {
            return Err(NetworkError::InvalidPacket);
        }
        if data[0..2] != self.magic {
            return Err(NetworkError::InvalidPacket);
        }
        let packet_type = PacketType::from_byte(data[3]).ok_or(NetworkError::InvalidPacket)?;
        let sequence = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        Ok(Packet {
            packet_type,
            sequence,
            payload: Bytes::copy_from_slice(&data[HEADER_SIZE..]),
        })
    }

    /// Cheap liveness check used on the hot receive path: does this datagram
    /// belong to our protocol at all?
    pub fn matches_magic(&self, data: &[u8]) -> bool {
        data.len() >= 2 && data[0..2] == self.magic
    }
}
