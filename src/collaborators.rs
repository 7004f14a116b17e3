//! Ports to the rest of the node
//!
//! The session never owns the transport, the ARK subscription service or the
//! peer-set manager; it talks to them through these traits. The peer-set
//! manager indexes sessions by identity hash and must never call back into a
//! session from inside one of these callbacks, because they run under the
//! session's state lock.

use std::sync::Arc;
use std::time::Duration;

use crate::address::{AddressResolver, SystemResolver};
use crate::ark::ArkReference;
use crate::clock::{Clock, SystemClock};
use crate::error::PeerError;
use crate::identity::IdentityHash;
use crate::message::{MessageFilter, PeerMessage};
use crate::session_key::SessionKey;
use crate::status::PeerStatus;

/// Opaque token identifying an ARK subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);

/// Encrypted packet transport (the packet mangler)
pub trait PacketTransport: Send + Sync {
    /// Send a control message outside the normal queue
    fn send(&self, peer: &IdentityHash, message: &PeerMessage) -> Result<(), PeerError>;

    /// Block until a matching message arrives from the peer or the timeout passes
    fn wait_for(
        &self,
        peer: &IdentityHash,
        filter: &MessageFilter,
        timeout: Duration,
    ) -> Result<Option<PeerMessage>, PeerError>;

    /// Flush acks and resends that are due on this key
    fn process_outgoing(&self, peer: &IdentityHash, key: &Arc<SessionKey>) -> Result<(), PeerError>;

    /// Enough data is queued to be worth sending now
    fn wake_up(&self);
}

/// Long-term reference publication service
///
/// Fetched references are delivered by the owner of this service through
/// `PeerSession::on_ark_found` and `PeerSession::got_ark`.
pub trait ArkTransport: Send + Sync {
    fn subscribe(&self, peer: &IdentityHash, ark: &ArkReference) -> Result<SubscriptionHandle, PeerError>;
    fn unsubscribe(&self, peer: &IdentityHash, ark: &ArkReference, handle: SubscriptionHandle);
}

/// Index of peers by status and backoff reason
pub trait PeerSetManager: Send + Sync {
    fn add_peer_status(&self, status: PeerStatus, peer: &IdentityHash);
    fn remove_peer_status(&self, status: PeerStatus, peer: &IdentityHash);
    fn add_backoff_reason(&self, reason: &str, peer: &IdentityHash);
    fn remove_backoff_reason(&self, reason: &str, peer: &IdentityHash);
    /// Peer became connected and routable
    fn peer_connected(&self, peer: &IdentityHash);
    /// Peer should no longer be routed to
    fn peer_disconnected(&self, peer: &IdentityHash);
    /// Persisted peer data changed
    fn write_peers(&self);
}

/// Everything a session needs from outside
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn PacketTransport>,
    pub ark: Arc<dyn ArkTransport>,
    pub peers: Arc<dyn PeerSetManager>,
    pub resolver: Arc<dyn AddressResolver>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Bundle with the system resolver and wall clock
    pub fn new(
        transport: Arc<dyn PacketTransport>,
        ark: Arc<dyn ArkTransport>,
        peers: Arc<dyn PeerSetManager>,
    ) -> Self {
        Self {
            transport,
            ark,
            peers,
            resolver: Arc::new(SystemResolver),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn AddressResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}
