//! The simplified 8-byte header used by the stream (TCP) transport's
//! echo/reverse/time demo. Kept distinct from the secure transport's
//! 18-byte [`crate::Header`] rather than unified into one format, since
//! the two transports never interoperate.
//!
//! Layout, network byte order, packed:
//!
//! | offset | size | field |
//! |---|---|---|
//! | 0 | 4 | `message_type` |
//! | 4 | 4 | `length` (bytes of body that follow, including any terminator) |

use byteorder::{BigEndian, ByteOrder};

use crate::WireError;

pub const STREAM_HEADER_SIZE: usize = 8;
pub const MAX_STREAM_BODY_LEN: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StreamMessageType {
    Echo = 0,
    Reverse = 1,
    Time = 2,
}

impl StreamMessageType {
    #[must_use]
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Echo),
            1 => Some(Self::Reverse),
            2 => Some(Self::Time),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    pub message_type: u32,
    pub length: u32,
}

impl StreamHeader {
    #[must_use]
    pub fn new(message_type: StreamMessageType, length: u32) -> Self {
        Self { message_type: message_type as u32, length }
    }

    pub fn encode(&self, out: &mut [u8]) {
        assert!(out.len() >= STREAM_HEADER_SIZE);
        BigEndian::write_u32(&mut out[0..4], self.message_type);
        BigEndian::write_u32(&mut out[4..8], self.length);
    }

    pub fn decode(buf: &[u8]) -> Result<StreamHeader, WireError> {
        if buf.len() < STREAM_HEADER_SIZE {
            return Err(WireError::BufferTooSmall { need: STREAM_HEADER_SIZE, have: buf.len() });
        }

        let header = StreamHeader {
            message_type: BigEndian::read_u32(&buf[0..4]),
            length: BigEndian::read_u32(&buf[4..8]),
        };

        if header.length as usize > MAX_STREAM_BODY_LEN {
            return Err(WireError::PayloadTooLarge(header.length as u16));
        }

        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_header_is_8_bytes() {
        let h = StreamHeader::new(StreamMessageType::Reverse, 6);
        let mut buf = [0u8; STREAM_HEADER_SIZE];
        h.encode(&mut buf);
        assert_eq!(buf.len(), 8);
    }

    #[test]
    fn roundtrip() {
        let h = StreamHeader::new(StreamMessageType::Time, 21);
        let mut buf = [0u8; STREAM_HEADER_SIZE];
        h.encode(&mut buf);
        assert_eq!(StreamHeader::decode(&buf).unwrap(), h);
    }

    #[test]
    fn known_type_ids_match_original_enum_order() {
        assert_eq!(StreamMessageType::from_u32(0), Some(StreamMessageType::Echo));
        assert_eq!(StreamMessageType::from_u32(1), Some(StreamMessageType::Reverse));
        assert_eq!(StreamMessageType::from_u32(2), Some(StreamMessageType::Time));
        assert_eq!(StreamMessageType::from_u32(3), None);
    }
}
