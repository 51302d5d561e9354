//! Frame protocol spoken between the controller and storage-driver sidecars.
//!
//! Every message is a fixed 24-byte header followed by an opaque payload. The header
//! carries the opcode, a request id used to multiplex concurrent calls over one
//! connection, and a CRC32 of the payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, TransportError};

/// Frame header size in bytes (magic:4 + version:1 + flags:1 + opcode:2 + request_id:8 + payload_length:4 + checksum:4)
pub const FRAME_HEADER_SIZE: usize = 24;

/// Protocol magic number for frame validation ("VOLR").
pub const MAGIC: u32 = 0x564F_4C52;

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest payload accepted on the wire (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Operations understood by a storage-driver sidecar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    /// Liveness check.
    Ping = 0x0001,
    /// Start replication for a volume.
    Enable = 0x0201,
    /// Stop replication for a volume.
    Disable = 0x0202,
    /// Make the local replica primary.
    Promote = 0x0203,
    /// Make the local replica secondary.
    Demote = 0x0204,
    /// Reconcile divergent replica data.
    Resync = 0x0205,
    /// Read-only replication state query.
    GetInfo = 0x0206,
}

impl TryFrom<u16> for Opcode {
    type Error = TransportError;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            0x0001 => Ok(Opcode::Ping),
            0x0201 => Ok(Opcode::Enable),
            0x0202 => Ok(Opcode::Disable),
            0x0203 => Ok(Opcode::Promote),
            0x0204 => Ok(Opcode::Demote),
            0x0205 => Ok(Opcode::Resync),
            0x0206 => Ok(Opcode::GetInfo),
            other => Err(TransportError::UnknownOpcode(other)),
        }
    }
}

/// Frame flags for protocol control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// No flags set.
    pub const NONE: FrameFlags = FrameFlags(0x00);
    /// Frame is a response to the request with the same id.
    pub const RESPONSE: FrameFlags = FrameFlags(0x01);

    /// Raw byte representation.
    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Builds flags from a raw byte, dropping unknown bits.
    pub fn from_bits(bits: u8) -> Self {
        FrameFlags(bits & 0x01)
    }

    /// True when every bit of `other` is set.
    pub fn contains(&self, other: FrameFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns these flags with `other` added.
    pub fn with(self, other: FrameFlags) -> Self {
        FrameFlags(self.0 | other.0)
    }
}

/// Frame header containing metadata about the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Protocol magic number
    pub magic: u32,
    /// Protocol version
    pub version: u8,
    /// Control flags
    pub flags: FrameFlags,
    /// Operation code
    pub opcode: Opcode,
    /// Request ID for multiplexing
    pub request_id: u64,
    /// Payload length in bytes
    pub payload_length: u32,
    /// CRC32 checksum of payload
    pub checksum: u32,
}

impl FrameHeader {
    /// Serializes the header into `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32(self.magic);
        buf.put_u8(self.version);
        buf.put_u8(self.flags.bits());
        buf.put_u16(self.opcode as u16);
        buf.put_u64(self.request_id);
        buf.put_u32(self.payload_length);
        buf.put_u32(self.checksum);
    }

    /// Parses and validates a header from exactly [`FRAME_HEADER_SIZE`] bytes.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < FRAME_HEADER_SIZE {
            return Err(TransportError::InvalidFrame {
                reason: format!("header is {} bytes, need {}", raw.len(), FRAME_HEADER_SIZE),
            });
        }
        let mut buf = &raw[..FRAME_HEADER_SIZE];
        let magic = buf.get_u32();
        if magic != MAGIC {
            return Err(TransportError::InvalidMagic {
                expected: MAGIC,
                got: magic,
            });
        }
        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(TransportError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: version,
            });
        }
        let flags = FrameFlags::from_bits(buf.get_u8());
        let opcode = Opcode::try_from(buf.get_u16())?;
        let request_id = buf.get_u64();
        let payload_length = buf.get_u32();
        let checksum = buf.get_u32();
        Ok(Self {
            magic,
            version,
            flags,
            opcode,
            request_id,
            payload_length,
            checksum,
        })
    }
}

/// A single frame in the RPC protocol.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame header
    pub header: FrameHeader,
    /// Payload data
    pub payload: Vec<u8>,
}

impl Frame {
    /// Creates a request frame, computing length and checksum from the payload.
    pub fn new(opcode: Opcode, request_id: u64, payload: Vec<u8>) -> Self {
        let header = FrameHeader {
            magic: MAGIC,
            version: PROTOCOL_VERSION,
            flags: FrameFlags::NONE,
            opcode,
            request_id,
            payload_length: payload.len() as u32,
            checksum: crc32fast::hash(&payload),
        };
        Self { header, payload }
    }

    /// Builds the response to this frame carrying `payload`.
    pub fn make_response(&self, payload: Vec<u8>) -> Frame {
        let mut response = Frame::new(self.header.opcode, self.header.request_id, payload);
        response.header.flags = self.header.flags.with(FrameFlags::RESPONSE);
        response
    }

    /// Operation code of this frame.
    pub fn opcode(&self) -> Opcode {
        self.header.opcode
    }

    /// Multiplexing id of this frame.
    pub fn request_id(&self) -> u64 {
        self.header.request_id
    }

    /// True if this frame answers an earlier request.
    pub fn is_response(&self) -> bool {
        self.header.flags.contains(FrameFlags::RESPONSE)
    }

    /// Serializes header and payload.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        self.header.encode_into(&mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parses a complete frame from a contiguous buffer.
    pub fn decode(raw: &[u8]) -> Result<Frame> {
        let header = FrameHeader::decode(raw)?;
        if header.payload_length > MAX_PAYLOAD_SIZE {
            return Err(TransportError::PayloadTooLarge {
                size: header.payload_length,
                max_size: MAX_PAYLOAD_SIZE,
            });
        }
        let end = FRAME_HEADER_SIZE + header.payload_length as usize;
        if raw.len() < end {
            return Err(TransportError::InvalidFrame {
                reason: format!("payload truncated: have {}, need {}", raw.len(), end),
            });
        }
        let frame = Frame {
            header,
            payload: raw[FRAME_HEADER_SIZE..end].to_vec(),
        };
        frame.validate()?;
        Ok(frame)
    }

    /// Verifies the payload length and checksum against the header.
    pub fn validate(&self) -> Result<()> {
        if self.payload.len() as u32 != self.header.payload_length {
            return Err(TransportError::InvalidFrame {
                reason: format!(
                    "length mismatch: header {}, payload {}",
                    self.header.payload_length,
                    self.payload.len()
                ),
            });
        }
        let computed = crc32fast::hash(&self.payload);
        if computed != self.header.checksum {
            return Err(TransportError::ChecksumMismatch {
                expected: self.header.checksum,
                computed,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_decode_frame() {
        let frame = Frame::new(Opcode::Promote, 42, b"volume-a".to_vec());
        let encoded = frame.encode();
        assert_eq!(encoded.len(), FRAME_HEADER_SIZE + 8);

        let decoded = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded.opcode(), Opcode::Promote);
        assert_eq!(decoded.request_id(), 42);
        assert_eq!(decoded.payload, b"volume-a");
        assert!(!decoded.is_response());
    }

    #[test]
    fn test_make_response_keeps_request_id() {
        let request = Frame::new(Opcode::GetInfo, 7, vec![1, 2, 3]);
        let response = request.make_response(vec![9]);
        assert!(response.is_response());
        assert_eq!(response.request_id(), 7);
        assert_eq!(response.opcode(), Opcode::GetInfo);
        response.validate().unwrap();
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut raw = Frame::new(Opcode::Ping, 1, vec![]).encode().to_vec();
        raw[0] = 0xFF;
        match FrameHeader::decode(&raw) {
            Err(TransportError::InvalidMagic { expected, .. }) => assert_eq!(expected, MAGIC),
            other => panic!("expected InvalidMagic, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        let mut raw = Frame::new(Opcode::Ping, 1, vec![]).encode().to_vec();
        raw[6] = 0x7F;
        raw[7] = 0x7F;
        assert!(matches!(
            FrameHeader::decode(&raw),
            Err(TransportError::UnknownOpcode(0x7F7F))
        ));
    }

    #[test]
    fn test_corrupted_payload_fails_checksum() {
        let mut raw = Frame::new(Opcode::Enable, 3, b"params".to_vec())
            .encode()
            .to_vec();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        assert!(matches!(
            Frame::decode(&raw),
            Err(TransportError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_flags() {
        let flags = FrameFlags::NONE.with(FrameFlags::RESPONSE);
        assert!(flags.contains(FrameFlags::RESPONSE));
        assert!(!FrameFlags::NONE.contains(FrameFlags::RESPONSE));
        assert_eq!(FrameFlags::from_bits(0xFF).bits(), 0x01);
    }

    proptest! {
        #[test]
        fn prop_decode_never_panics(raw in proptest::collection::vec(any::<u8>(), 0..64)) {
            let _ = Frame::decode(&raw);
        }
    }
}
