//! Error taxonomy for the peer session core
//!
//! Parse and integrity failures are never recovered locally; they abort the
//! handshake or reference update and reach the caller. Connection-state errors
//! are retryable. `PacketSequence` means the session is desynchronised and the
//! caller should tear it down. `WouldBlock` is a deferral, not a failure.

use thiserror::Error;

/// Errors produced by the peer session core
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeerError {
    /// Malformed reference or record (bad syntax, missing field)
    #[error("parse error: {0}")]
    Parse(String),

    /// A reference claimed a different identity than the peer we hold
    #[error("identity changed")]
    IdentityMismatch,

    /// Peer's testnet flag differs from ours
    #[error("testnet mismatch: peer.testnet={peer} but node.testnet={local}")]
    TestnetMismatch { peer: bool, local: bool },

    /// Reference signature missing or invalid
    #[error("reference signature verification failed: {0}")]
    Signature(String),

    /// No usable session key
    #[error("not connected")]
    NotConnected,

    /// Connection was lost while waiting on it
    #[error("disconnected while waiting: {0}")]
    Disconnected(String),

    /// The session key was deprecated under the caller
    #[error("session key changed")]
    KeyChanged,

    /// Packet numbering is inconsistent; the session must be torn down
    #[error("packet sequence inconsistency: {0}")]
    PacketSequence(String),

    /// A throttled channel would block; defer and retry later
    #[error("operation would block")]
    WouldBlock,

    /// Synchronous send did not complete in time
    #[error("timed out waiting for send after {0} ms")]
    SendTimeout(u64),

    /// Cryptographic primitive failure (bad key length, failed decrypt)
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Message serialization failed
    #[error("encode error: {0}")]
    Encode(String),

    /// Message deserialization failed
    #[error("decode error: {0}")]
    Decode(String),
}

impl PeerError {
    /// Whether the caller may simply retry later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PeerError::NotConnected
                | PeerError::Disconnected(_)
                | PeerError::KeyChanged
                | PeerError::WouldBlock
                | PeerError::SendTimeout(_)
        )
    }

    /// Whether the session state can no longer be trusted
    pub fn is_fatal_for_session(&self) -> bool {
        matches!(self, PeerError::PacketSequence(_))
    }

    pub(crate) fn parse(msg: impl Into<String>) -> Self {
        PeerError::Parse(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(PeerError::NotConnected.is_retryable());
        assert!(PeerError::WouldBlock.is_retryable());
        assert!(!PeerError::IdentityMismatch.is_retryable());
        assert!(!PeerError::Signature(String::new()).is_retryable());
    }

    #[test]
    fn test_sequence_error_is_fatal() {
        let err = PeerError::PacketSequence("gap".into());
        assert!(err.is_fatal_for_session());
        assert!(!err.is_retryable());
        assert!(!PeerError::NotConnected.is_fatal_for_session());
    }

    #[test]
    fn test_display() {
        let err = PeerError::TestnetMismatch { peer: true, local: false };
        assert_eq!(
            err.to_string(),
            "testnet mismatch: peer.testnet=true but node.testnet=false"
        );
    }
}
