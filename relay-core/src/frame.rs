//! A header plus its payload: the unit the codec reads and writes.

use crate::error::{RelayError, Result};
use crate::header::{FrameHeader, HEADER_SIZE};
use crate::message::{MessageType, Method};

/// Largest payload a single frame may carry (16 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Largest complete frame, header included.
pub const MAX_FRAME_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD_SIZE;

/// Request id reserved for frames that are never answered.
pub const UNTRACKED_ID: u64 = 0;

/// First four bytes of the payload's blake3 hash, or zero when empty.
pub fn checksum(payload: &[u8]) -> u32 {
    if payload.is_empty() {
        return 0;
    }
    let hash = blake3::hash(payload);
    let bytes = hash.as_bytes();
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    header: FrameHeader,
    payload: Vec<u8>,
}

impl Frame {
    pub fn new(message_type: MessageType, method: Method, request_id: u64, payload: Vec<u8>) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(RelayError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let header = FrameHeader::new(
            message_type,
            method,
            request_id,
            payload.len() as u64,
            checksum(&payload),
        );
        Ok(Self { header, payload })
    }

    pub fn request(request_id: u64, method: Method, payload: Vec<u8>) -> Result<Self> {
        Self::new(MessageType::Request, method, request_id, payload)
    }

    pub fn response(request_id: u64, method: Method, payload: Vec<u8>) -> Result<Self> {
        Self::new(MessageType::Response, method, request_id, payload)
    }

    /// A failed reply carrying `message` as UTF-8.
    pub fn fault(request_id: u64, method: Method, message: &str) -> Result<Self> {
        Self::new(MessageType::Fault, method, request_id, message.as_bytes().to_vec())
    }

    pub fn push(method: Method, payload: Vec<u8>) -> Result<Self> {
        Self::new(MessageType::Push, method, UNTRACKED_ID, payload)
    }

    pub fn heartbeat() -> Self {
        Self::empty(MessageType::Request, Method::Heartbeat)
    }

    pub fn goodbye() -> Self {
        Self::empty(MessageType::Request, Method::Goodbye)
    }

    fn empty(message_type: MessageType, method: Method) -> Self {
        Self {
            header: FrameHeader::new(message_type, method, UNTRACKED_ID, 0, 0),
            payload: Vec::new(),
        }
    }

    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    pub fn message_type(&self) -> MessageType {
        self.header.message_type
    }

    pub fn method(&self) -> Method {
        self.header.method
    }

    pub fn request_id(&self) -> u64 {
        self.header.request_id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// `true` when the stored checksum matches the payload.
    pub fn validate(&self) -> bool {
        self.header.checksum == checksum(&self.payload)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse exactly one frame from `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let header = FrameHeader::from_bytes(bytes)?;
        let payload_len = header.payload_length as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(RelayError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let expected = HEADER_SIZE + payload_len;
        if bytes.len() != expected {
            return Err(RelayError::InvalidFrameLength {
                expected,
                actual: bytes.len(),
            });
        }

        let frame = Self {
            header,
            payload: bytes[HEADER_SIZE..].to_vec(),
        };
        if !frame.validate() {
            return Err(RelayError::ChecksumMismatch);
        }
        Ok(frame)
    }
}
