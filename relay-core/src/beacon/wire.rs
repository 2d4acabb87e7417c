//! Beacon wire format.
//!
//! ```text
//! probe    = LP(service_type)
//! response = LP(service_type) || BE16(port) || LP(payload)
//! LP(s)    = BE16(len(utf8(s))) || utf8(s)
//! ```
//!
//! The length prefix is a signed 16-bit big-endian integer, so a single
//! string carries at most `i16::MAX` bytes.

use crate::error::{RelayError, Result};

/// Largest UTF-8 byte length a length-prefixed string may carry.
pub const MAX_STRING_LEN: usize = i16::MAX as usize;

/// Size of the length prefix in front of every string.
const LEN_PREFIX: usize = 2;

/// Encode `s` as a big-endian 16-bit length followed by its UTF-8 bytes.
pub fn encode(s: &str) -> Result<Vec<u8>> {
    let bytes = s.as_bytes();
    if bytes.len() > MAX_STRING_LEN {
        return Err(RelayError::Encoding { len: bytes.len() });
    }

    let mut out = Vec::with_capacity(LEN_PREFIX + bytes.len());
    out.extend_from_slice(&(bytes.len() as i16).to_be_bytes());
    out.extend_from_slice(bytes);
    Ok(out)
}

/// Decode a length-prefixed string from the front of `bytes`.
///
/// Trailing bytes after the string are ignored.
pub fn decode(bytes: &[u8]) -> Result<String> {
    decode_prefixed(bytes).map(|(s, _)| s)
}

/// Decode a length-prefixed string and report how many bytes it used.
pub fn decode_prefixed(bytes: &[u8]) -> Result<(String, usize)> {
    if bytes.len() < LEN_PREFIX {
        return Err(RelayError::TruncatedPacket {
            needed: LEN_PREFIX,
            available: bytes.len(),
        });
    }

    let len = i16::from_be_bytes([bytes[0], bytes[1]]);
    if len < 0 {
        return Err(RelayError::InvalidHeader("negative string length"));
    }

    let end = LEN_PREFIX + len as usize;
    if bytes.len() < end {
        return Err(RelayError::TruncatedPacket {
            needed: end,
            available: bytes.len(),
        });
    }

    let s = String::from_utf8(bytes[LEN_PREFIX..end].to_vec())?;
    Ok((s, end))
}

/// `true` iff `needle` is a byte-wise prefix of `haystack`.
pub fn has_prefix(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.len() >= needle.len() && haystack[..needle.len()] == *needle
}

// ── Messages ─────────────────────────────────────────────────────

/// A probe asking every advertiser of `service_type` to answer.
pub fn probe(service_type: &str) -> Result<Vec<u8>> {
    encode(service_type)
}

/// An advertiser's answer to a matching probe.
pub fn response(service_type: &str, port: u16, payload: &str) -> Result<Vec<u8>> {
    let mut out = encode(service_type)?;
    out.extend_from_slice(&port.to_be_bytes());
    out.extend_from_slice(&encode(payload)?);
    Ok(out)
}

/// A parsed advertiser response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeaconResponse {
    /// Port the advertised service listens on.
    pub port: u16,
    /// Free-form payload chosen by the advertiser.
    pub payload: String,
}

/// Parse a response previously checked to start with `prefix`, the
/// encoded service type.
///
/// Returns `Ok(None)` when the packet belongs to another service type.
pub fn parse_response(packet: &[u8], prefix: &[u8]) -> Result<Option<BeaconResponse>> {
    if !has_prefix(packet, prefix) {
        return Ok(None);
    }

    let rest = &packet[prefix.len()..];
    if rest.len() < 2 {
        return Err(RelayError::TruncatedPacket {
            needed: prefix.len() + 2,
            available: packet.len(),
        });
    }

    let port = u16::from_be_bytes([rest[0], rest[1]]);
    let payload = decode(&rest[2..])?;
    Ok(Some(BeaconResponse { port, payload }))
}
