//! Fixed-size frame header for relay RPC traffic.
//!
//! Layout (32 bytes, all integers little-endian):
//!
//! | Offset | Size | Field            |
//! |--------|------|------------------|
//! | 0      | 4    | magic (`RLY0`)   |
//! | 4      | 4    | checksum         |
//! | 8      | 4    | message_type     |
//! | 12     | 4    | method           |
//! | 16     | 8    | request_id       |
//! | 24     | 8    | payload_length   |

use crate::error::{RelayError, Result};
use crate::message::{MessageType, Method};

/// Magic bytes at the start of every frame.
pub const MAGIC: [u8; 4] = *b"RLY0";

/// Size of a serialized header.
pub const HEADER_SIZE: usize = 32;

/// Raw header bytes.
pub type HeaderBytes = [u8; HEADER_SIZE];

/// Frame header carried in front of every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub checksum: u32,
    pub message_type: MessageType,
    pub method: Method,
    pub request_id: u64,
    pub payload_length: u64,
}

impl FrameHeader {
    pub fn new(
        message_type: MessageType,
        method: Method,
        request_id: u64,
        payload_length: u64,
        checksum: u32,
    ) -> Self {
        Self {
            checksum,
            message_type,
            method,
            request_id,
            payload_length,
        }
    }

    pub fn to_bytes(&self) -> HeaderBytes {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&MAGIC);
        out[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        out[8..12].copy_from_slice(&(self.message_type as u32).to_le_bytes());
        out[12..16].copy_from_slice(&(self.method as u32).to_le_bytes());
        out[16..24].copy_from_slice(&self.request_id.to_le_bytes());
        out[24..32].copy_from_slice(&self.payload_length.to_le_bytes());
        out
    }

    /// Parse a header, rejecting wrong magic and unknown enum values.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(RelayError::TruncatedPacket {
                needed: HEADER_SIZE,
                available: bytes.len(),
            });
        }
        if bytes[0..4] != MAGIC {
            return Err(RelayError::InvalidMagic);
        }

        Ok(Self {
            checksum: read_u32(bytes, 4),
            message_type: MessageType::try_from(read_u32(bytes, 8))?,
            method: Method::try_from(read_u32(bytes, 12))?,
            request_id: read_u64(bytes, 16),
            payload_length: read_u64(bytes, 24),
        })
    }
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}
