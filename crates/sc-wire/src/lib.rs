//! Wire-format codecs for the space-captain protocol.
//!
//! Two header formats coexist, one per transport: [`Header`], the 18-byte
//! versioned header used by the secure datagram transport, and
//! [`stream::StreamHeader`], the 8-byte `{type, length}` header used by
//! the legacy TCP demo transport. Each transport picks one format and
//! never mixes them.

pub mod stream;

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

/// Maximum payload size carried by any single protocol-header message.
pub const MAX_MESSAGE_SIZE: usize = 4096;

/// Size in bytes of the on-wire [`Header`]. No padding.
pub const HEADER_SIZE: usize = 18;

/// Protocol version this crate implements.
pub const PROTOCOL_VERSION: u16 = 0x0001;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("buffer too small to hold a header: need {need}, have {have}")]
    BufferTooSmall { need: usize, have: usize },
    #[error("payload_length {0} exceeds MAX_MESSAGE_SIZE ({MAX_MESSAGE_SIZE})")]
    PayloadTooLarge(u16),
    #[error("payload_length is zero, which is only valid for ping/pong")]
    ZeroLengthPayload,
}

/// Client -> server and server -> client message type identifiers.
///
/// Kept as a thin newtype over `u16` rather than a closed enum: the secure
/// datagram dispatcher must be able to echo back message types it doesn't
/// recognize unchanged, so an unrecognized type is data, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageType(pub u16);

impl MessageType {
    pub const DIAL_UPDATE: MessageType = MessageType(0x0001);
    pub const MOVEMENT_INPUT: MessageType = MessageType(0x0002);
    pub const FIRE_WEAPON: MessageType = MessageType(0x0003);
    pub const STATE_ACK: MessageType = MessageType(0x0004);
    pub const HEARTBEAT: MessageType = MessageType(0x0005);
    pub const PING: MessageType = MessageType(0x0006);

    pub const STATE_UPDATE: MessageType = MessageType(0x1001);
    pub const ENTITY_DESTROYED: MessageType = MessageType(0x1002);
    pub const DAMAGE_RECEIVED: MessageType = MessageType(0x1003);
    pub const ERROR_RESPONSE: MessageType = MessageType(0x1004);
    pub const PONG: MessageType = MessageType(0x1005);

    pub const CONNECTION_ACCEPTED: MessageType = MessageType(0x2001);
    pub const CONNECTION_REJECTED: MessageType = MessageType(0x2002);
    pub const DISCONNECT_NOTIFY: MessageType = MessageType(0x2003);

    #[inline]
    #[must_use]
    pub fn is_client_to_server(self) -> bool {
        self.0 <= 0x0fff
    }

    #[inline]
    #[must_use]
    pub fn is_server_to_client(self) -> bool {
        (0x1000..=0x1fff).contains(&self.0)
    }

    #[inline]
    #[must_use]
    pub fn is_connection_management(self) -> bool {
        (0x2000..=0x2fff).contains(&self.0)
    }
}

/// The 18-byte fixed header of the secure (protocol) transport.
///
/// Layout, all fields network byte order (big endian), packed with no
/// padding:
///
/// | offset | size | field |
/// |---|---|---|
/// | 0  | 2 | `protocol_version` |
/// | 2  | 2 | `message_type` |
/// | 4  | 4 | `sequence_number` |
/// | 8  | 8 | `timestamp` (unix millis) |
/// | 16 | 2 | `payload_length` |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub protocol_version: u16,
    pub message_type: MessageType,
    pub sequence_number: u32,
    pub timestamp: u64,
    pub payload_length: u16,
}

impl Header {
    #[must_use]
    pub fn new(message_type: MessageType, sequence_number: u32, timestamp: u64, payload_length: u16) -> Self {
        Self { protocol_version: PROTOCOL_VERSION, message_type, sequence_number, timestamp, payload_length }
    }

    /// Encodes the header into `out[..HEADER_SIZE]` in network byte order.
    ///
    /// # Panics
    /// Panics if `out` is shorter than [`HEADER_SIZE`].
    pub fn encode(&self, out: &mut [u8]) {
        assert!(out.len() >= HEADER_SIZE);
        BigEndian::write_u16(&mut out[0..2], self.protocol_version);
        BigEndian::write_u16(&mut out[2..4], self.message_type.0);
        BigEndian::write_u32(&mut out[4..8], self.sequence_number);
        BigEndian::write_u64(&mut out[8..16], self.timestamp);
        BigEndian::write_u16(&mut out[16..18], self.payload_length);
    }

    /// Decodes a header from `buf`, validating `payload_length` against
    /// [`MAX_MESSAGE_SIZE`] (invariant: `0 < payload_length <=
    /// MAX_MESSAGE_SIZE`, except ping/pong which may be zero-length).
    pub fn decode(buf: &[u8]) -> Result<Header, WireError> {
        if buf.len() < HEADER_SIZE {
            return Err(WireError::BufferTooSmall { need: HEADER_SIZE, have: buf.len() });
        }

        let header = Header {
            protocol_version: BigEndian::read_u16(&buf[0..2]),
            message_type: MessageType(BigEndian::read_u16(&buf[2..4])),
            sequence_number: BigEndian::read_u32(&buf[4..8]),
            timestamp: BigEndian::read_u64(&buf[8..16]),
            payload_length: BigEndian::read_u16(&buf[16..18]),
        };

        if header.payload_length as usize > MAX_MESSAGE_SIZE {
            return Err(WireError::PayloadTooLarge(header.payload_length));
        }

        Ok(header)
    }

    /// Same as [`Header::decode`] but also rejects a zero-length payload,
    /// enforcing `0 < payload_length`. Ping/pong are the one exception,
    /// validated separately by callers that know they're dealing with a
    /// zero-payload type.
    pub fn decode_nonzero_payload(buf: &[u8]) -> Result<Header, WireError> {
        let header = Header::decode(buf)?;
        if header.payload_length == 0 {
            return Err(WireError::ZeroLengthPayload);
        }
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_size_is_18_bytes() {
        let mut buf = [0u8; HEADER_SIZE];
        let h = Header::new(MessageType::PING, 1, 42, 0);
        h.encode(&mut buf);
        assert_eq!(buf.len(), 18);
    }

    #[test]
    fn roundtrip_preserves_fields() {
        let h = Header::new(MessageType::DAMAGE_RECEIVED, 0xdead_beef, 0x0102_0304_0506_0708, 123);
        let mut buf = [0u8; HEADER_SIZE];
        h.encode(&mut buf);
        let decoded = Header::decode(&buf).unwrap();
        assert_eq!(h, decoded);
    }

    #[test]
    fn encodes_network_byte_order() {
        let h = Header::new(MessageType::PONG, 1, 0, 0);
        let mut buf = [0u8; HEADER_SIZE];
        h.encode(&mut buf);
        // protocol_version = 0x0001 big-endian -> [0x00, 0x01]
        assert_eq!(&buf[0..2], &[0x00, 0x01]);
        // message_type PONG = 0x1005 big-endian -> [0x10, 0x05]
        assert_eq!(&buf[2..4], &[0x10, 0x05]);
    }

    #[test]
    fn rejects_oversized_payload() {
        let mut buf = [0u8; HEADER_SIZE];
        let h = Header::new(MessageType::PING, 1, 0, 0);
        h.encode(&mut buf);
        BigEndian::write_u16(&mut buf[16..18], (MAX_MESSAGE_SIZE + 1) as u16);
        assert!(matches!(Header::decode(&buf), Err(WireError::PayloadTooLarge(_))));
    }

    #[test]
    fn rejects_truncated_buffer() {
        let buf = [0u8; HEADER_SIZE - 1];
        assert!(matches!(Header::decode(&buf), Err(WireError::BufferTooSmall { .. })));
    }

    #[test]
    fn message_type_range_classification() {
        assert!(MessageType::PING.is_client_to_server());
        assert!(MessageType::PONG.is_server_to_client());
        assert!(MessageType::CONNECTION_ACCEPTED.is_connection_management());
    }
}
