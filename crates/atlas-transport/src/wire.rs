//! # Chunk wire format
//!
//! The 16-byte chunk header and its on-air companion body (§3 Chunk, §6
//! External Interfaces). Byte layout is normative for interoperability with
//! existing deployments — see the header doctest-style example in the spec:
//! `4D 42 01 00 DE AD BE EF 01 02 03 04 00 03 00 06` for
//! `(prefix=deadbeef01020304, seq=3, total=6, flags=0)`.
//!
//! Based on `strata-transport::wire::PacketHeader`'s fixed-layout
//! encode/decode shape, simplified to the flat header this protocol uses
//! (no VarInt — sequence/total are always 16 bits on this medium).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{TransportError, MAX_CHUNK_SIZE};

pub const MAGIC: [u8; 2] = *b"MB";
pub const VERSION: u8 = 1;
pub const HEADER_LEN: usize = 16;

/// Chunk header flags (§3 Chunk).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkFlags(pub u8);

impl ChunkFlags {
    pub const NONE: ChunkFlags = ChunkFlags(0x00);
    pub const ACK: ChunkFlags = ChunkFlags(0x01);
    pub const NACK: ChunkFlags = ChunkFlags(0x02);

    pub fn is_control(self) -> bool {
        self.0 & (Self::ACK.0 | Self::NACK.0) != 0
    }

    pub fn is_ack(self) -> bool {
        self.0 & Self::ACK.0 != 0
    }

    pub fn is_nack(self) -> bool {
        self.0 & Self::NACK.0 != 0
    }

    fn is_valid(self) -> bool {
        matches!(self.0, 0x00 | 0x01 | 0x02)
    }
}

/// One on-air chunk: 16-byte header plus an opaque body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub flags: ChunkFlags,
    /// First 8 UTF-8 bytes of the envelope id, right-padded with `0x00`.
    pub id_prefix: [u8; 8],
    /// 1-based chunk sequence number.
    pub sequence: u16,
    /// Total chunk count for this envelope.
    pub total: u16,
    pub body: Bytes,
}

impl Chunk {
    pub fn new(id_prefix: [u8; 8], sequence: u16, total: u16, flags: ChunkFlags, body: Bytes) -> Self {
        Chunk {
            flags,
            id_prefix,
            sequence,
            total,
            body,
        }
    }

    /// Encode header + body into a single on-air frame.
    pub fn encode(&self) -> Result<Bytes, TransportError> {
        let total_len = HEADER_LEN + self.body.len();
        if total_len > MAX_CHUNK_SIZE {
            return Err(TransportError::FrameTooLarge {
                actual: total_len,
                limit: MAX_CHUNK_SIZE,
            });
        }
        let mut buf = BytesMut::with_capacity(total_len);
        buf.put_slice(&MAGIC);
        buf.put_u8(VERSION);
        buf.put_u8(self.flags.0);
        buf.put_slice(&self.id_prefix);
        buf.put_u16(self.sequence);
        buf.put_u16(self.total);
        buf.put_slice(&self.body);
        Ok(buf.freeze())
    }

    /// Parse a frame into a `Chunk`. Rejects magic/version/flag mismatches
    /// per §4.2 — body length is simply `frame.len() - HEADER_LEN`, there is
    /// no inner length field.
    pub fn decode(mut frame: Bytes) -> Result<Self, TransportError> {
        if frame.len() > MAX_CHUNK_SIZE {
            return Err(TransportError::FrameTooLarge {
                actual: frame.len(),
                limit: MAX_CHUNK_SIZE,
            });
        }
        if frame.len() < HEADER_LEN {
            return Err(TransportError::InvalidFrame(format!(
                "frame of {} bytes shorter than {HEADER_LEN}-byte header",
                frame.len()
            )));
        }

        let mut magic = [0u8; 2];
        frame.copy_to_slice(&mut magic);
        if magic != MAGIC {
            return Err(TransportError::InvalidFrame(format!(
                "bad magic {magic:02x?}"
            )));
        }

        let version = frame.get_u8();
        if version != VERSION {
            return Err(TransportError::InvalidFrame(format!(
                "unsupported version {version}"
            )));
        }

        let flags = ChunkFlags(frame.get_u8());
        if !flags.is_valid() {
            return Err(TransportError::InvalidFrame(format!(
                "invalid flags 0x{:02x}",
                flags.0
            )));
        }

        let mut id_prefix = [0u8; 8];
        frame.copy_to_slice(&mut id_prefix);
        let sequence = frame.get_u16();
        let total = frame.get_u16();

        Ok(Chunk {
            flags,
            id_prefix,
            sequence,
            total,
            body: frame,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_matches_spec_example() {
        let chunk = Chunk::new(
            [0xde, 0xad, 0xbe, 0xef, 0x01, 0x02, 0x03, 0x04],
            3,
            6,
            ChunkFlags::NONE,
            Bytes::new(),
        );
        let encoded = chunk.encode().unwrap();
        assert_eq!(
            &encoded[..],
            &[
                0x4D, 0x42, 0x01, 0x00, 0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x02, 0x03, 0x04, 0x00,
                0x03, 0x00, 0x06,
            ]
        );
    }

    #[test]
    fn roundtrip_with_body() {
        let chunk = Chunk::new([1; 8], 1, 1, ChunkFlags::NONE, Bytes::from_static(b"hello"));
        let encoded = chunk.encode().unwrap();
        let decoded = Chunk::decode(encoded).unwrap();
        assert_eq!(decoded, chunk);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = vec![0u8; HEADER_LEN];
        bytes[0] = 0xff;
        let err = Chunk::decode(Bytes::from(bytes)).unwrap_err();
        assert!(matches!(err, TransportError::InvalidFrame(_)));
    }

    #[test]
    fn rejects_bad_version() {
        let mut bytes = vec![0u8; HEADER_LEN];
        bytes[0..2].copy_from_slice(&MAGIC);
        bytes[2] = 9;
        let err = Chunk::decode(Bytes::from(bytes)).unwrap_err();
        assert!(matches!(err, TransportError::InvalidFrame(_)));
    }

    #[test]
    fn rejects_bad_flags() {
        let mut bytes = vec![0u8; HEADER_LEN];
        bytes[0..2].copy_from_slice(&MAGIC);
        bytes[2] = VERSION;
        bytes[3] = 0x07;
        let err = Chunk::decode(Bytes::from(bytes)).unwrap_err();
        assert!(matches!(err, TransportError::InvalidFrame(_)));
    }

    #[test]
    fn rejects_oversize_frame() {
        let body = Bytes::from(vec![0u8; MAX_CHUNK_SIZE]);
        let chunk = Chunk::new([0; 8], 1, 1, ChunkFlags::NONE, body);
        let err = chunk.encode().unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { .. }));
    }

    #[test]
    fn ack_nack_flags_are_control() {
        assert!(ChunkFlags::ACK.is_control());
        assert!(ChunkFlags::NACK.is_control());
        assert!(!ChunkFlags::NONE.is_control());
    }

    proptest::proptest! {
        #[test]
        fn roundtrip_any_valid_header(seq: u16, total: u16, body_len in 0usize..200) {
            let body = Bytes::from(vec![0xAB; body_len]);
            let chunk = Chunk::new([7; 8], seq, total, ChunkFlags::NONE, body);
            let encoded = chunk.encode().unwrap();
            let decoded = Chunk::decode(encoded).unwrap();
            prop_assert_eq!(decoded, chunk);
        }
    }
}
