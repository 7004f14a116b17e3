//! Darknet Peer Session Core
//!
//! This crate holds everything a darknet node keeps per remote peer:
//! - Session key ring (current/previous/unverified generations)
//! - Handshake scheduling, including burst-only peers and ARK fallback
//! - Routing backoff under overload
//! - Derived connection status, mirrored into a peer-set index
//! - Outbound message queue with ack/resend deadlines
//!
//! Packet encryption, DNS, ARK fetching and the peer-set index itself are
//! collaborators reached through the traits in [`collaborators`].

// ============================================================================
// Modules
// ============================================================================

pub mod address;
pub mod ark;
pub mod average;
pub mod backoff;
pub mod clock;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod fieldset;
pub mod handshake;
pub mod identity;
pub mod key_ring;
pub mod message;
pub mod metrics;
pub mod node;
pub mod noderef;
pub mod peer;
pub mod ping;
pub mod queue;
pub mod session_key;
pub mod status;
pub mod version;

// ============================================================================
// Re-exports
// ============================================================================

pub use collaborators::{ArkTransport, Collaborators, PacketTransport, PeerSetManager, SubscriptionHandle};
pub use config::PeerConfig;
pub use error::PeerError;
pub use fieldset::FieldSet;
pub use node::LocalNode;
pub use peer::{PeerSession, PeerSnapshot, SessionOptions};
pub use status::{PeerMode, PeerStatus, VersionCompat};
