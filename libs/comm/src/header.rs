//! Frame Header and Wire Format
//!
//! Every frame a channel puts on a transport is an envelope around one
//! payload chunk:
//!
//! ```text
//! [magic:4][version:1][flags:1][reserved:2][header_len:4][payload_len:4]
//! [header: bincode][payload][crc32:4]
//! ```
//!
//! The header is a fixed, versioned record validated when a frame is
//! decoded. A header announcing `incomplete` must name the total `size` and
//! the `address` of the work channel carrying the remainder. End-of-stream
//! is signalled out of band by the `eof` flag; the payload of an EOF frame
//! is the reserved sentinel.

use crate::{CommError, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use comm_config::comm::EOF_SENTINEL;
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Read, Write};
use uuid::Uuid;

/// Wire format constants
pub struct WireFormat;

impl WireFormat {
    /// Protocol version
    pub const VERSION: u8 = 1;
    /// Magic bytes for frame validation
    pub const MAGIC: &'static [u8; 4] = b"CMFR";
    /// Fixed prelude size in bytes
    pub const PRELUDE_SIZE: usize = 16;
    /// Trailing checksum size in bytes
    pub const CHECKSUM_SIZE: usize = 4;
    /// Largest encoded header accepted
    pub const MAX_HEADER_SIZE: usize = 4096;
    /// Envelope bytes a transport must accept on top of the payload limit
    pub const MAX_OVERHEAD: usize = Self::PRELUDE_SIZE + Self::MAX_HEADER_SIZE + Self::CHECKSUM_SIZE;
}

const FLAG_EOF: u8 = 0b0000_0001;
const FLAG_INCOMPLETE: u8 = 0b0000_0010;

/// Metadata accompanying one frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Message identifier shared by all frames of one message
    pub id: Uuid,
    /// More of the payload follows on a work channel
    pub incomplete: bool,
    /// Total payload length when incomplete
    pub size: Option<u64>,
    /// Work channel address carrying the remainder
    pub address: Option<String>,
    /// Where the peer should send its response
    pub response_address: Option<String>,
    /// End of stream
    pub eof: bool,
}

impl Header {
    /// Header for a new message
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4())
    }

    /// Header continuing an existing message
    pub fn with_id(id: Uuid) -> Self {
        Self {
            id,
            incomplete: false,
            size: None,
            address: None,
            response_address: None,
            eof: false,
        }
    }

    /// End-of-stream header
    pub fn eof() -> Self {
        Self {
            eof: true,
            ..Self::new()
        }
    }

    pub fn with_response_address(mut self, address: Option<String>) -> Self {
        self.response_address = address;
        self
    }

    /// Mark the message as continued on the work channel at `address`
    pub fn mark_incomplete(&mut self, size: usize, address: impl Into<String>) {
        self.incomplete = true;
        self.size = Some(size as u64);
        self.address = Some(address.into());
    }

    fn flags(&self) -> u8 {
        let mut flags = 0u8;
        if self.eof {
            flags |= FLAG_EOF;
        }
        if self.incomplete {
            flags |= FLAG_INCOMPLETE;
        }
        flags
    }

    /// Check the header invariants
    pub fn validate(&self) -> Result<()> {
        if self.incomplete {
            if self.size.is_none() {
                return Err(CommError::protocol("incomplete header without size"));
            }
            if self.address.as_deref().map_or(true, str::is_empty) {
                return Err(CommError::protocol("incomplete header without work address"));
            }
            if self.eof {
                return Err(CommError::protocol("EOF header cannot be incomplete"));
            }
        }
        Ok(())
    }
}

impl Default for Header {
    fn default() -> Self {
        Self::new()
    }
}

/// One frame: header plus payload chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(header: Header, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// End-of-stream frame
    pub fn eof() -> Self {
        Self::new(Header::eof(), Bytes::from_static(EOF_SENTINEL))
    }

    pub fn is_eof(&self) -> bool {
        self.header.eof
    }

    /// Serialize frame to wire format
    pub fn encode(&self) -> Result<Bytes> {
        self.header.validate()?;

        let header = bincode::serialize(&self.header)?;
        if header.len() > WireFormat::MAX_HEADER_SIZE {
            return Err(CommError::protocol(format!(
                "Header size {} exceeds maximum {}",
                header.len(),
                WireFormat::MAX_HEADER_SIZE
            )));
        }
        if self.payload.len() > u32::MAX as usize {
            return Err(CommError::protocol("Payload too large for one frame"));
        }

        let mut buffer = Vec::with_capacity(
            WireFormat::PRELUDE_SIZE + header.len() + self.payload.len() + WireFormat::CHECKSUM_SIZE,
        );

        buffer.write_all(WireFormat::MAGIC)?; // 4 bytes: magic
        buffer.write_u8(WireFormat::VERSION)?; // 1 byte: version
        buffer.write_u8(self.header.flags())?; // 1 byte: flags
        buffer.write_u16::<LittleEndian>(0)?; // 2 bytes: reserved
        buffer.write_u32::<LittleEndian>(header.len() as u32)?;
        buffer.write_u32::<LittleEndian>(self.payload.len() as u32)?;
        buffer.write_all(&header)?;
        buffer.write_all(&self.payload)?;

        let checksum = crc32fast::hash(&buffer);
        buffer.write_u32::<LittleEndian>(checksum)?;

        Ok(Bytes::from(buffer))
    }

    /// Deserialize frame from wire format
    pub fn decode(data: &Bytes) -> Result<Self> {
        if data.len() < WireFormat::PRELUDE_SIZE + WireFormat::CHECKSUM_SIZE {
            return Err(CommError::protocol("Frame too short"));
        }

        let body_len = data.len() - WireFormat::CHECKSUM_SIZE;
        let expected = (&data[body_len..]).read_u32::<LittleEndian>()?;
        if crc32fast::hash(&data[..body_len]) != expected {
            return Err(CommError::protocol("Frame checksum mismatch"));
        }

        let mut cursor = Cursor::new(&data[..body_len]);
        let mut magic = [0u8; 4];
        cursor.read_exact(&mut magic)?;
        if &magic != WireFormat::MAGIC {
            return Err(CommError::protocol("Invalid frame magic"));
        }

        let version = cursor.read_u8()?;
        if version != WireFormat::VERSION {
            return Err(CommError::protocol(format!(
                "Unsupported frame version {}",
                version
            )));
        }

        let flags = cursor.read_u8()?;
        let _reserved = cursor.read_u16::<LittleEndian>()?;
        let header_len = cursor.read_u32::<LittleEndian>()? as usize;
        let payload_len = cursor.read_u32::<LittleEndian>()? as usize;

        if header_len > WireFormat::MAX_HEADER_SIZE {
            return Err(CommError::protocol(format!(
                "Header size {} exceeds maximum {}",
                header_len,
                WireFormat::MAX_HEADER_SIZE
            )));
        }
        if WireFormat::PRELUDE_SIZE + header_len + payload_len != body_len {
            return Err(CommError::protocol("Truncated frame"));
        }

        let header_start = WireFormat::PRELUDE_SIZE;
        let payload_start = header_start + header_len;
        let header: Header = bincode::deserialize(&data[header_start..payload_start])?;
        header.validate()?;

        if header.flags() != flags {
            return Err(CommError::protocol("Frame flags disagree with header"));
        }
        if let Some(size) = header.size.filter(|_| header.incomplete) {
            if size <= payload_len as u64 {
                return Err(CommError::protocol(format!(
                    "Incomplete frame announces {} bytes but already carries {}",
                    size, payload_len
                )));
            }
        }

        Ok(Self {
            header,
            payload: data.slice(payload_start..body_len),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_incomplete_header_requires_size_and_address() {
        let mut header = Header::new();
        header.incomplete = true;
        assert!(header.validate().is_err());

        header.size = Some(10);
        assert!(header.validate().is_err());

        header.address = Some("mem-work".to_string());
        assert!(header.validate().is_ok());
    }

    #[test]
    fn test_eof_frame() {
        let encoded = Frame::eof().encode().unwrap();
        let decoded = Frame::decode(&encoded).unwrap();
        assert!(decoded.is_eof());
        assert_eq!(&decoded.payload[..], EOF_SENTINEL);
    }

    #[test]
    fn test_sentinel_payload_without_flag_is_data() {
        let frame = Frame::new(Header::new(), Bytes::from_static(EOF_SENTINEL));
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert!(!decoded.is_eof());
    }

    #[test]
    fn test_corrupted_frame_rejected() {
        let frame = Frame::new(Header::new(), Bytes::from_static(b"hello"));
        let encoded = frame.encode().unwrap();

        let mut corrupted = encoded.to_vec();
        let last_payload_byte = corrupted.len() - WireFormat::CHECKSUM_SIZE - 1;
        corrupted[last_payload_byte] ^= 0xFF;
        let err = Frame::decode(&Bytes::from(corrupted)).unwrap_err();
        assert!(matches!(err, CommError::Protocol { .. }));
    }

    #[test]
    fn test_short_and_foreign_frames_rejected() {
        assert!(Frame::decode(&Bytes::from_static(b"abc")).is_err());

        let mut foreign = vec![0u8; 32];
        let checksum = crc32fast::hash(&foreign[..28]);
        foreign[28..].copy_from_slice(&checksum.to_le_bytes());
        assert!(Frame::decode(&Bytes::from(foreign)).is_err());
    }

    #[test]
    fn test_incomplete_header_cannot_be_encoded_invalid() {
        let mut header = Header::new();
        header.incomplete = true;
        let frame = Frame::new(header, Bytes::new());
        assert!(frame.encode().is_err());
    }

    #[test]
    fn test_incomplete_frame_must_announce_more_than_it_carries() {
        let mut header = Header::new();
        header.mark_incomplete(4, "mem-work");
        let encoded = Frame::new(header, Bytes::from_static(b"abcd")).encode().unwrap();
        let err = Frame::decode(&encoded).unwrap_err();
        assert!(matches!(err, CommError::Protocol { .. }));
    }

    proptest! {
        #[test]
        fn prop_frame_preserves_header_and_payload(
            payload in proptest::collection::vec(any::<u8>(), 0..2048),
            response in proptest::option::of("[a-z0-9-]{1,64}"),
            incomplete in any::<bool>(),
            extra in 1usize..1_000_000,
        ) {
            let mut header = Header::new().with_response_address(response);
            if incomplete {
                header.mark_incomplete(payload.len() + extra, "mem-work-address");
            }
            let frame = Frame::new(header, Bytes::from(payload));
            let encoded = frame.encode().unwrap();
            prop_assert!(encoded.len() <= frame.payload.len() + WireFormat::MAX_OVERHEAD);
            prop_assert_eq!(Frame::decode(&encoded).unwrap(), frame);
        }
    }
}
