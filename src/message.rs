//! Peer-to-peer control messages
//!
//! Messages the session itself originates or consumes: liveness pings,
//! location and detected-address notifications, and opaque application data.
//!
//! # Message Framing
//!
//! Messages are length-prefixed with a 4-byte big-endian length header:
//! ```text
//! ┌─────────────┬─────────────────────────────────┐
//! │ Length (4B) │ Payload (bincode-encoded)       │
//! └─────────────┴─────────────────────────────────┘
//! ```

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::PeerError;

// ============================================================================
// Constants
// ============================================================================

/// Maximum message size (64 KB)
pub const MAX_MESSAGE_SIZE: u32 = 65536;

/// Length of the message header (4 bytes for length)
pub const HEADER_LEN: usize = 4;

// ============================================================================
// Messages
// ============================================================================

/// Control and data messages exchanged with a peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PeerMessage {
    /// Low-level liveness probe
    Ping { id: u32 },
    Pong { id: u32 },

    /// Link-level ping used for the round-trip average
    LinkPing { id: u64 },
    LinkPong { id: u64 },

    /// Our keyspace location moved
    LocationChanged { location: f64 },

    /// The address we see the peer's packets coming from
    DetectedAddress { address: Option<SocketAddr> },

    /// Opaque application payload
    Data { payload: Vec<u8> },
}

impl PeerMessage {
    /// Short name for log lines
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::Ping { .. } => "Ping",
            PeerMessage::Pong { .. } => "Pong",
            PeerMessage::LinkPing { .. } => "LinkPing",
            PeerMessage::LinkPong { .. } => "LinkPong",
            PeerMessage::LocationChanged { .. } => "LocationChanged",
            PeerMessage::DetectedAddress { .. } => "DetectedAddress",
            PeerMessage::Data { .. } => "Data",
        }
    }
}

/// Which reply a blocking wait is interested in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFilter {
    Pong { id: u32 },
    LinkPong { id: u64 },
}

impl MessageFilter {
    pub fn matches(&self, msg: &PeerMessage) -> bool {
        match (self, msg) {
            (MessageFilter::Pong { id }, PeerMessage::Pong { id: got }) => id == got,
            (MessageFilter::LinkPong { id }, PeerMessage::LinkPong { id: got }) => id == got,
            _ => false,
        }
    }
}

// ============================================================================
// Message Encoding/Decoding
// ============================================================================

/// Framing failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Not enough data (need N more bytes)
    #[error("incomplete message, need {0} more bytes")]
    Incomplete(usize),
    #[error("message too large: {0} bytes (max 65536)")]
    TooLarge(usize),
    #[error("deserialization error: {0}")]
    Malformed(String),
}

impl From<FrameError> for PeerError {
    fn from(e: FrameError) -> Self {
        PeerError::Decode(e.to_string())
    }
}

/// Encode a message as `[4-byte BE length][bincode payload]`
pub fn encode_message(msg: &PeerMessage) -> Result<Vec<u8>, PeerError> {
    let payload = bincode::serialize(msg).map_err(|e| PeerError::Encode(e.to_string()))?;

    if payload.len() > MAX_MESSAGE_SIZE as usize {
        return Err(PeerError::Encode(format!(
            "message too large: {} bytes (max {})",
            payload.len(),
            MAX_MESSAGE_SIZE
        )));
    }

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);

    Ok(buf)
}

/// Decode one message; returns it and the number of bytes consumed
pub fn decode_message(buf: &[u8]) -> Result<(PeerMessage, usize), FrameError> {
    if buf.len() < HEADER_LEN {
        return Err(FrameError::Incomplete(HEADER_LEN - buf.len()));
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if length > MAX_MESSAGE_SIZE as usize {
        return Err(FrameError::TooLarge(length));
    }

    let total_len = HEADER_LEN + length;
    if buf.len() < total_len {
        return Err(FrameError::Incomplete(total_len - buf.len()));
    }

    let msg = bincode::deserialize(&buf[HEADER_LEN..total_len])
        .map_err(|e| FrameError::Malformed(e.to_string()))?;

    Ok((msg, total_len))
}

/// Decode as many whole messages as the buffer holds
///
/// Returns decoded messages and the unconsumed tail
pub fn decode_messages(mut buf: &[u8]) -> (Vec<PeerMessage>, Vec<u8>) {
    let mut messages = Vec::new();

    while !buf.is_empty() {
        match decode_message(buf) {
            Ok((msg, consumed)) => {
                messages.push(msg);
                buf = &buf[consumed..];
            }
            Err(FrameError::Incomplete(_)) => break,
            Err(e) => {
                log::warn!("Dropping undecodable message data: {}", e);
                break;
            }
        }
    }

    (messages, buf.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let msg = PeerMessage::DetectedAddress {
            address: Some("203.0.113.5:9001".parse().unwrap()),
        };
        let encoded = encode_message(&msg).unwrap();
        let length = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]) as usize;
        assert_eq!(length, encoded.len() - HEADER_LEN);

        let (decoded, consumed) = decode_message(&encoded).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_decode_incomplete() {
        let encoded = encode_message(&PeerMessage::LinkPing { id: 9 }).unwrap();
        assert!(matches!(decode_message(&encoded[..2]), Err(FrameError::Incomplete(2))));
        assert!(matches!(
            decode_message(&encoded[..encoded.len() - 1]),
            Err(FrameError::Incomplete(1))
        ));
    }

    #[test]
    fn test_decode_too_large() {
        let buf = (MAX_MESSAGE_SIZE + 1).to_be_bytes();
        assert!(matches!(decode_message(&buf), Err(FrameError::TooLarge(_))));
    }

    #[test]
    fn test_decode_multiple_with_tail() {
        let mut buf = encode_message(&PeerMessage::Ping { id: 1 }).unwrap();
        buf.extend(encode_message(&PeerMessage::LocationChanged { location: 0.5 }).unwrap());
        let third = encode_message(&PeerMessage::Pong { id: 1 }).unwrap();
        buf.extend_from_slice(&third[..3]);

        let (messages, rest) = decode_messages(&buf);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].kind(), "LocationChanged");
        assert_eq!(rest, third[..3].to_vec());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let msg = PeerMessage::Data {
            payload: vec![0u8; MAX_MESSAGE_SIZE as usize + 1],
        };
        assert!(matches!(encode_message(&msg), Err(PeerError::Encode(_))));
    }

    #[test]
    fn test_filter_matching() {
        let filter = MessageFilter::Pong { id: 3 };
        assert!(filter.matches(&PeerMessage::Pong { id: 3 }));
        assert!(!filter.matches(&PeerMessage::Pong { id: 4 }));
        assert!(!filter.matches(&PeerMessage::LinkPong { id: 3 }));
    }
}
