//! # Wire Codec
//!
//! Every UDP datagram, and every frame nested inside an `open` or `line`
//! ciphertext, has the same layout:
//!
//! ```text
//! ┌──────────────┬──────────────────────┬──────────────────┐
//! │ u16 BE len   │ UTF-8 JSON header    │ raw body bytes   │
//! └──────────────┴──────────────────────┴──────────────────┘
//! ```
//!
//! ## Header Fields
//!
//! | Frame | Fields |
//! |-------|--------|
//! | `open` | `type`, `open`, `iv`, `sig` |
//! | open (inner) | `to`, `at`, `line` |
//! | `line` | `type`, `line`, `iv` |
//! | stream (inner) | `stream`, `seq`, `ack`, `miss`, plus `type`, `seek`, `see`, `sock`, `peer`, `ip`, `port`, `end`, `err` |
//!
//! Fields the codec does not know about are preserved in [`Header::extra`] so
//! applications can carry their own keys on custom stream types.
//!
//! ## Limits
//!
//! - The header must serialize to at most 65535 bytes.
//! - Decoding rejects a zero length, a length past the end of the buffer, and
//!   malformed JSON. None of these are fatal; callers log and drop.

use std::net::SocketAddr;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Largest header the 16-bit length prefix can describe.
pub const MAX_HEADER_LEN: usize = u16::MAX as usize;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug)]
pub enum WireError {
    /// Buffer too short to hold the length prefix.
    Truncated,
    /// Length prefix is zero or runs past the end of the buffer.
    BadLength(usize),
    /// Serialized header exceeds [`MAX_HEADER_LEN`].
    HeaderTooLarge(usize),
    /// Header is not a JSON object of the expected shape.
    Json(serde_json::Error),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::Truncated => write!(f, "frame shorter than length prefix"),
            WireError::BadLength(len) => write!(f, "invalid header length {}", len),
            WireError::HeaderTooLarge(len) => write!(f, "header of {} bytes exceeds limit", len),
            WireError::Json(e) => write!(f, "invalid header json: {}", e),
        }
    }
}

impl std::error::Error for WireError {}

impl From<serde_json::Error> for WireError {
    fn from(err: serde_json::Error) -> Self {
        WireError::Json(err)
    }
}

// ============================================================================
// Header
// ============================================================================

/// JSON header of a frame. Absent fields are omitted on the wire.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Header {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    // Outer framing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,

    // Inner open
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<u64>,

    // Stream sequencing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub miss: Option<Vec<i64>>,

    // Built-in stream payloads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seek: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub see: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sock: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,

    /// Application-defined fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Header {
    /// Header carrying only a `type` field.
    pub fn typed(kind: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.into()),
            ..Self::default()
        }
    }

    /// `{end: true}`, optionally with an error message.
    pub fn ending(err: Option<&str>) -> Self {
        Self {
            end: Some(true),
            err: err.map(str::to_string),
            ..Self::default()
        }
    }

    pub fn is_end(&self) -> bool {
        self.end == Some(true)
    }

    /// True for `{}`.
    pub fn is_empty(&self) -> bool {
        *self == Header::default()
    }

    /// True when only sequencing fields are present, i.e. the frame is a bare
    /// acknowledgement.
    pub fn is_ack_only(&self) -> bool {
        let payload = Header {
            stream: None,
            seq: None,
            ack: None,
            miss: None,
            ..self.clone()
        };
        payload.is_empty()
    }
}

// ============================================================================
// Packet
// ============================================================================

/// A decoded frame plus receive-side metadata that never goes on the wire.
#[derive(Clone, Debug, Default)]
pub struct Packet {
    pub header: Header,
    pub body: Option<Vec<u8>>,
    /// Datagram source address.
    pub sender: Option<SocketAddr>,
    /// Local, monotonically increasing receive counter.
    pub id: u64,
    pub received_at: Option<Instant>,
}

impl Packet {
    pub fn new(header: Header, body: Option<Vec<u8>>) -> Self {
        Self {
            header,
            body,
            ..Self::default()
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        encode(&self.header, self.body.as_deref())
    }
}

/// Serialize a frame. An absent body is written as zero bytes.
pub fn encode(header: &Header, body: Option<&[u8]>) -> Result<Vec<u8>, WireError> {
    let json = serde_json::to_vec(header)?;
    if json.len() > MAX_HEADER_LEN {
        return Err(WireError::HeaderTooLarge(json.len()));
    }
    let body = body.unwrap_or_default();

    let mut out = Vec::with_capacity(2 + json.len() + body.len());
    out.extend_from_slice(&(json.len() as u16).to_be_bytes());
    out.extend_from_slice(&json);
    out.extend_from_slice(body);
    Ok(out)
}

/// Parse a frame. The body is `None` when the buffer ends at the header.
pub fn decode(buf: &[u8]) -> Result<Packet, WireError> {
    if buf.len() < 2 {
        return Err(WireError::Truncated);
    }
    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if len == 0 || len > buf.len() - 2 {
        return Err(WireError::BadLength(len));
    }

    let header: Header = serde_json::from_slice(&buf[2..2 + len])?;
    let body = if buf.len() > len + 2 {
        Some(buf[len + 2..].to_vec())
    } else {
        None
    };
    Ok(Packet::new(header, body))
}
