//! Peer session: the single owned state aggregate for one remote peer
//!
//! All mutable connection state lives in `PeerState` behind one lock. Every
//! public operation takes the lock once, mutates, recomputes the derived
//! status and releases it before talking to the transport or the ARK service.
//! The peer-set manager is notified of status and backoff-reason changes
//! while the lock is held, so its indices always agree with the session.
//!
//! # Locks
//!
//! ```text
//! state  (PeerState)      connection flags, keys, addresses, schedulers
//! ark    (ArkFetcher)     subscription handle; never taken under `state`
//! queue  (MessageQueue)   outbound messages; independent of `state`
//! ```
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected ──should_send_handshake──► AttemptPending ──sent_handshake──►
//!   HandshakeSent ──completed_handshake──► Unverified ──verified──► Connected
//!                                       └──────(verified key)─────► Connected
//! Connected ──disconnected──► Disconnected (keys deprecated, retained)
//! ```

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;

use crate::address::{compute_handshake_candidates, AddressSet, PeerAddress};
use crate::ark::{ArkFetcher, ArkReference};
use crate::backoff::{BackoffSnapshot, RoutingBackoff};
use crate::collaborators::Collaborators;
use crate::config::PeerConfig;
use crate::error::PeerError;
use crate::fieldset::FieldSet;
use crate::handshake::{HandshakeScheduler, HandshakeSnapshot};
use crate::identity::{IdentityHash, PeerIdentity, SetupCipher};
use crate::key_ring::{KeyRing, KeyRingSnapshot};
use crate::message::{encode_message, MessageFilter, PeerMessage};
use crate::metrics::PeerMetrics;
use crate::node::LocalNode;
use crate::noderef::{parse_handshake_reference, NodeReference, ParseContext, ParsePurpose, PeerMetadata};
use crate::ping::PingTracker;
use crate::queue::{MessageItem, MessageQueue, SendCallback, SyncSendWaiter};
use crate::session_key::{ResendItem, SessionKey, NEVER};
use crate::status::{derive_status, PeerMode, PeerStatus, StatusInputs, VersionCompat};
use crate::version::{check_arbitrary_good_version, check_good_version};

// ============================================================================
// Options and Snapshots
// ============================================================================

/// How a session is being created
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Reference comes from our own peer store (signature not checked)
    pub from_local: bool,
    /// Loading at node startup
    pub on_startup: bool,
    /// Stored metadata record for this peer
    pub metadata: Option<FieldSet>,
    /// Seed for the session's random source; entropy if unset
    pub rng_seed: Option<u64>,
}

/// Point-in-time view of a session
#[derive(Debug, Clone, Serialize)]
pub struct PeerSnapshot {
    pub identity: String,
    pub name: Option<String>,
    pub status: String,
    pub connected: bool,
    pub routable: bool,
    pub disabled: bool,
    pub mode: PeerMode,
    pub compat: VersionCompat,
    pub version: Option<String>,
    pub location: Option<f64>,
    pub nominal_addresses: Vec<String>,
    pub detected_address: Option<String>,
    pub handshake_candidates: Vec<String>,
    pub boot_id: Option<u64>,
    pub bogus_reference: bool,
    pub connected_time: u64,
    pub time_last_sent: u64,
    pub time_last_disconnect: u64,
    pub keys: KeyRingSnapshot,
    pub handshake: HandshakeSnapshot,
    pub backoff: BackoffSnapshot,
    pub ark: Option<ArkReference>,
    pub average_ping_ms: f64,
    pub idle_ms: u64,
    pub queued_messages: usize,
    pub percent_time_routable: f64,
}

// ============================================================================
// State
// ============================================================================

struct PeerState {
    reference: NodeReference,
    connected: bool,
    routable: bool,
    completed_handshake: bool,
    bogus_reference: bool,
    rekeying: bool,
    boot_id: Option<u64>,
    keys: KeyRing,
    sent_initial_messages: bool,

    time_last_sent: u64,
    time_last_received: u64,
    time_last_connected: u64,
    time_last_routable: u64,
    time_last_disconnect: u64,
    connected_time: u64,
    peer_added_time: u64,
    never_connected: bool,

    /// Peer's build is below our minimum
    invalid_version: bool,
    /// Our build is below the peer's minimum
    reverse_invalid_version: bool,
    /// Version verdict confirmed by a completed handshake
    compat: VersionCompat,

    addresses: AddressSet,
    ignore_source_port: bool,
    allow_local_addresses: bool,

    handshake: HandshakeScheduler,
    backoff: RoutingBackoff,
    pings: PingTracker,
    mode: PeerMode,
    disabled: bool,

    status: PeerStatus,
    /// Backoff reason currently registered with the peer-set manager
    registered_backoff_reason: Option<String>,

    had_routable_connection_count: u64,
    routable_connection_check_count: u64,

    rng: StdRng,
}

impl PeerState {
    fn status_inputs(&self) -> StatusInputs {
        StatusInputs {
            connected: self.connected,
            routable: self.routable,
            backed_off_until: self.backoff.until(),
            disabled: self.disabled,
            never_connected: self.never_connected,
            mode: self.mode,
            bursting: self.handshake.is_bursting(),
            compat: self.compat,
        }
    }
}

// ============================================================================
// Peer Session
// ============================================================================

pub struct PeerSession {
    identity: PeerIdentity,
    node: Arc<LocalNode>,
    collab: Collaborators,
    state: Mutex<PeerState>,
    ark_fetcher: ArkFetcher,
    queue: MessageQueue,
    metrics: PeerMetrics,
    incoming_setup: SetupCipher,
    outgoing_setup: SetupCipher,
}

impl PeerSession {
    /// Create a session from a peer's node reference
    pub fn new(
        reference: &FieldSet,
        node: Arc<LocalNode>,
        collab: Collaborators,
        options: SessionOptions,
    ) -> Result<Self, PeerError> {
        let now = collab.clock.now_ms();
        let config = &node.config;

        let mut ctx = ParseContext::new(ParsePurpose::Construct, node.testnet);
        if options.from_local {
            ctx = ctx.from_local();
        }
        if options.on_startup {
            ctx = ctx.on_startup();
        }
        let parsed = NodeReference::parse(reference, ctx)?;

        let group = node.share_group(parsed.group.clone());
        let identity = PeerIdentity::new(parsed.identity.clone(), group, parsed.public_key.clone());
        if *identity.hash() == node.identity_hash {
            return Err(PeerError::parse("reference describes the local node"));
        }

        let incoming_setup = SetupCipher::incoming(&node.identity_hash, identity.hash_hash())?;
        let outgoing_setup = SetupCipher::outgoing(&node.identity_hash_hash, identity.hash())?;

        let metadata = match &options.metadata {
            Some(fs) => Some(PeerMetadata::from_fieldset(fs, now, config.peer_added_expiry)?),
            None => None,
        };

        let mut rng = match options.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let (invalid_version, reverse_invalid_version) = version_checks(&node, &parsed);
        let mut addresses = AddressSet::new(parsed.addresses.clone());
        let handshake = HandshakeScheduler::new(now, config, &mut rng);
        let queue = MessageQueue::new(config);

        let mut state = PeerState {
            reference: parsed,
            connected: false,
            routable: false,
            completed_handshake: false,
            bogus_reference: false,
            rekeying: false,
            boot_id: None,
            keys: KeyRing::new(),
            sent_initial_messages: false,
            time_last_sent: 0,
            time_last_received: 0,
            time_last_connected: 0,
            time_last_routable: 0,
            time_last_disconnect: 0,
            connected_time: 0,
            peer_added_time: now,
            never_connected: true,
            invalid_version,
            reverse_invalid_version,
            compat: VersionCompat::Compatible,
            addresses: AddressSet::default(),
            ignore_source_port: false,
            allow_local_addresses: false,
            handshake,
            backoff: RoutingBackoff::new(config),
            pings: PingTracker::new(config.max_pings, config.ping_half_life),
            mode: PeerMode::Normal,
            disabled: false,
            status: PeerStatus::NeverConnected,
            registered_backoff_reason: None,
            had_routable_connection_count: 0,
            routable_connection_check_count: 0,
            rng,
        };

        if let Some(meta) = metadata {
            if let Some(detected) = meta.detected.as_deref() {
                if let Ok(addr) = PeerAddress::parse(detected) {
                    addresses.set_detected(addr);
                }
            }
            state.time_last_received = meta.time_last_received_packet;
            state.time_last_connected = meta.time_last_connected;
            state.time_last_routable = meta.time_last_routable;
            state.peer_added_time = meta.peer_added_time;
            state.never_connected = meta.never_connected;
            state.disabled = meta.disabled;
            state.mode = if meta.listen_only {
                PeerMode::ListenOnly
            } else if meta.burst_only {
                PeerMode::BurstOnly
            } else {
                PeerMode::Normal
            };
            state.ignore_source_port = meta.ignore_source_port;
            state.allow_local_addresses = meta.allow_local_addresses;
            state.had_routable_connection_count = meta.had_routable_connection_count;
            state.routable_connection_check_count = meta.routable_connection_check_count;
        } else if options.from_local {
            // Stored without metadata: treat as known but never seen
            state.peer_added_time = 0;
        }
        state.addresses = addresses;
        state.status = derive_status(&state.status_inputs(), now);

        let session = Self {
            identity,
            node,
            collab,
            state: Mutex::new(state),
            ark_fetcher: ArkFetcher::new(),
            queue,
            metrics: PeerMetrics::new(),
            incoming_setup,
            outgoing_setup,
        };

        {
            let st = session.state.lock();
            session.collab.peers.add_peer_status(st.status, session.hash());
        }
        // First refresh never blocks on DNS
        session.maybe_update_handshake_addresses(true);
        log::debug!("Created peer session {}", session.identity.hash().short());
        Ok(session)
    }

    fn now(&self) -> u64 {
        self.collab.clock.now_ms()
    }

    fn config(&self) -> &PeerConfig {
        &self.node.config
    }

    // ========================================================================
    // Identity
    // ========================================================================

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    pub fn hash(&self) -> &IdentityHash {
        self.identity.hash()
    }

    /// Cipher for handshake packets from the peer
    pub fn incoming_setup_cipher(&self) -> &SetupCipher {
        &self.incoming_setup
    }

    /// Cipher for handshake packets to the peer
    pub fn outgoing_setup_cipher(&self) -> &SetupCipher {
        &self.outgoing_setup
    }

    /// Check a signature made with the peer's key
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        self.identity.public_key().verify(data, signature)
    }

    /// Best negotiation type both sides support, `None` if there is none
    pub fn best_neg_type(&self) -> Option<i32> {
        let st = self.state.lock();
        let theirs = &st.reference.neg_types;
        self.node
            .supported_neg_types
            .iter()
            .filter(|t| theirs.contains(*t))
            .last()
            .copied()
    }

    // ========================================================================
    // Status
    // ========================================================================

    /// Recompute the derived status and keep the manager's indices in step
    fn refresh_status(&self, st: &mut PeerState, now: u64) {
        let peers = &self.collab.peers;
        let hash = self.identity.hash();

        if st.routable && st.backoff.is_backed_off(now) {
            let reason = st.backoff.reason().map(str::to_string);
            if reason != st.registered_backoff_reason {
                if let Some(old) = st.registered_backoff_reason.take() {
                    peers.remove_backoff_reason(&old, hash);
                }
                if let Some(new) = &reason {
                    peers.add_backoff_reason(new, hash);
                }
                st.registered_backoff_reason = reason;
            }
        } else if st.routable || !st.connected {
            if let Some(old) = st.registered_backoff_reason.take() {
                peers.remove_backoff_reason(&old, hash);
            }
        }

        let status = derive_status(&st.status_inputs(), now);
        if status != st.status {
            log::debug!(
                "Peer {} status {} -> {}",
                hash.short(),
                st.status,
                status
            );
            peers.remove_peer_status(st.status, hash);
            peers.add_peer_status(status, hash);
            st.status = status;
        }
    }

    pub fn status(&self) -> PeerStatus {
        self.state.lock().status
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn is_routable(&self) -> bool {
        self.state.lock().routable
    }

    pub fn has_completed_handshake(&self) -> bool {
        self.state.lock().completed_handshake
    }

    pub fn is_backed_off(&self) -> bool {
        let now = self.now();
        self.state.lock().backoff.is_backed_off(now)
    }

    pub fn boot_id(&self) -> Option<u64> {
        self.state.lock().boot_id
    }

    pub fn current_key(&self) -> Option<Arc<SessionKey>> {
        self.state.lock().keys.current().cloned()
    }

    pub fn previous_key(&self) -> Option<Arc<SessionKey>> {
        self.state.lock().keys.previous().cloned()
    }

    pub fn unverified_key(&self) -> Option<Arc<SessionKey>> {
        self.state.lock().keys.unverified().cloned()
    }

    pub fn location(&self) -> Option<f64> {
        self.state.lock().reference.location
    }

    pub fn time_last_received(&self) -> u64 {
        self.state.lock().time_last_received
    }

    pub fn average_ping_time(&self) -> f64 {
        self.state.lock().pings.average_ping_time()
    }

    /// Address to send to, honouring ignore-source-port
    pub fn peer_address(&self) -> Option<PeerAddress> {
        let st = self.state.lock();
        st.addresses.get_peer(st.ignore_source_port)
    }

    /// Connected but silent for longer than the inactivity limit
    pub fn is_inactive(&self) -> bool {
        let now = self.now();
        let st = self.state.lock();
        st.connected && now.saturating_sub(st.time_last_received) > self.config().max_peer_inactivity
    }

    // ========================================================================
    // Handshakes
    // ========================================================================

    fn calc_next_handshake(&self, st: &mut PeerState, now: u64, successful: bool) -> bool {
        let (mode, compat, invalid) = (st.mode, st.compat, st.invalid_version);
        st.handshake
            .calc_next(now, successful, mode, compat, invalid, &self.node.config, &mut st.rng)
    }

    /// Is a handshake attempt due now?
    pub fn should_send_handshake(&self) -> bool {
        self.maybe_update_handshake_addresses(false);
        let now = self.now();
        let mut guard = self.state.lock();
        let st = &mut *guard;

        if st.disabled || st.mode == PeerMode::ListenOnly {
            return false;
        }
        let due = st.handshake.is_due(now)
            && !st.addresses.candidates().is_empty()
            && (st.rekeying || !st.connected);
        if !due {
            return false;
        }
        if st.handshake.has_live_handshake(now, self.config().handshake_timeout) {
            return false;
        }
        if st.mode == PeerMode::BurstOnly && !st.handshake.is_bursting() {
            st.handshake.start_burst();
            self.refresh_status(st, now);
        }
        true
    }

    /// A handshake packet went out
    pub fn sent_handshake(&self) {
        PeerMetrics::incr(&self.metrics.handshakes_sent_total, 1);
        self.after_handshake_attempt(true);
    }

    /// A handshake was due but could not be sent
    pub fn could_not_send_handshake(&self) {
        PeerMetrics::incr(&self.metrics.handshake_failures_total, 1);
        self.after_handshake_attempt(false);
    }

    fn after_handshake_attempt(&self, successful: bool) {
        let now = self.now();
        let fetch_ark = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let fetch = self.calc_next_handshake(st, now, successful);
            self.refresh_status(st, now);
            fetch
        };
        if fetch_ark {
            log::info!(
                "Handshake failures for {} reached the ARK threshold",
                self.hash().short()
            );
            self.start_ark_fetcher();
        }
    }

    /// The in-progress key agreement was used
    pub fn negotiation_used(&self) {
        let now = self.now();
        self.state.lock().handshake.touch_negotiation(now);
    }

    /// Request a fresh handshake while staying connected
    pub fn start_rekeying(&self) {
        let now = self.now();
        let mut st = self.state.lock();
        if st.connected && !st.rekeying {
            log::debug!("Rekeying with {}", self.hash().short());
            st.rekeying = true;
            st.handshake.reset_next_to(now);
        }
    }

    /// A handshake completed and produced a new session key
    ///
    /// `reference` is the peer's reference from the handshake, prefixed with
    /// its encoding byte. An unverified key must be confirmed by `verified`
    /// before it becomes current.
    pub fn completed_handshake(
        &self,
        boot_id: u64,
        reference: Option<&[u8]>,
        key_material: Vec<u8>,
        unverified: bool,
        reply_to: Option<SocketAddr>,
    ) -> Result<Arc<SessionKey>, PeerError> {
        let now = self.now();
        {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            // Successful handshake never triggers an ARK fetch
            self.calc_next_handshake(st, now, true);
        }
        self.stop_ark_fetcher();

        if let Some(data) = reference.filter(|d| !d.is_empty()) {
            let result = parse_handshake_reference(data)
                .and_then(|fs| self.process_new_noderef(&fs, ParsePurpose::Update));
            if let Err(e) = result {
                log::error!(
                    "Failed to parse reference from {} in handshake: {}",
                    self.hash().short(),
                    e
                );
                {
                    let mut guard = self.state.lock();
                    let st = &mut *guard;
                    st.bogus_reference = true;
                    st.connected = false;
                    st.routable = false;
                    self.refresh_status(st, now);
                }
                self.collab.peers.peer_disconnected(self.hash());
                return Err(e);
            }
        }

        if let Some(addr) = reply_to {
            self.changed_ip(addr);
        }

        let key = SessionKey::new(key_material, self.config().ack_delay);
        let (outcome, routable, connected, older, newer) = {
            let mut guard = self.state.lock();
            let st = &mut *guard;

            let older = st.invalid_version;
            let newer = st.reverse_invalid_version;
            if newer {
                log::info!(
                    "Peer {} requires a newer build than ours ({})",
                    self.hash().short(),
                    self.node.version
                );
            }
            if older {
                log::info!("Peer {} is too old for us", self.hash().short());
            }

            st.bogus_reference = false;
            st.completed_handshake = true;
            st.handshake.reset_count();
            // An unverified key only connects us once a packet decrypts under it
            if !unverified {
                st.connected = true;
            }
            st.compat = VersionCompat::from_checks(older, newer);
            st.routable = st.connected && st.compat.is_compatible();
            st.rekeying = false;

            let boot_changed = st.boot_id.map_or(false, |b| b != boot_id);
            if boot_changed {
                log::info!("Peer {} restarted (boot id changed)", self.hash().short());
                st.sent_initial_messages = false;
            }
            st.boot_id = Some(boot_id);
            st.connected_time = now;
            st.time_last_received = now;

            let outcome = st.keys.install_new_session(Arc::clone(&key), boot_changed, unverified);
            if !unverified {
                st.never_connected = false;
                st.peer_added_time = 0;
                st.handshake.clear_negotiation();
                st.time_last_connected = now;
                if st.routable {
                    st.time_last_routable = now;
                }
            }
            self.refresh_status(st, now);
            (outcome, st.routable, st.connected, older, newer)
        };

        for old in outcome.discarded {
            old.discard();
        }
        let mut resend: Vec<ResendItem> = Vec::new();
        for old in outcome.retired {
            resend.extend(old.completely_deprecated());
        }
        self.requeue_resend_items(resend);

        PeerMetrics::incr(&self.metrics.connections_total, 1);
        if older || newer {
            self.collab.peers.peer_disconnected(self.hash());
        } else if connected && routable {
            self.collab.peers.peer_connected(self.hash());
        }
        if !unverified {
            self.collab.peers.write_peers();
        }
        log::info!(
            "Completed handshake with {} (generation {}, unverified: {})",
            self.hash().short(),
            key.generation(),
            unverified
        );
        self.maybe_send_initial_messages();
        Ok(key)
    }

    /// A packet decrypted under `key`; promotes it if it was unverified
    pub fn verified(&self, key: &Arc<SessionKey>) -> bool {
        let now = self.now();
        let (promotion, routable) = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let Some(promotion) = st.keys.promote_unverified(key) else {
                return false;
            };
            st.connected = true;
            st.routable = st.compat.is_compatible();
            st.never_connected = false;
            st.peer_added_time = 0;
            st.handshake.clear_negotiation();
            st.time_last_connected = now;
            if st.routable {
                st.time_last_routable = now;
            }
            self.refresh_status(st, now);
            (promotion, st.routable)
        };

        if let Some(old) = promotion.retired {
            self.requeue_resend_items(old.completely_deprecated());
        }
        if routable {
            self.collab.peers.peer_connected(self.hash());
        }
        self.collab.peers.write_peers();
        log::debug!(
            "Promoted generation {} to current for {}",
            key.generation(),
            self.hash().short()
        );
        self.maybe_send_initial_messages();
        true
    }

    fn maybe_send_initial_messages(&self) {
        let routable = {
            let mut st = self.state.lock();
            if st.sent_initial_messages {
                return;
            }
            match st.keys.current() {
                Some(k) if !k.is_deprecated() => {}
                _ => return,
            }
            if st.keys.unverified().is_some() {
                return;
            }
            st.sent_initial_messages = true;
            st.routable
        };

        if routable {
            if let Some(location) = self.node.location {
                if let Err(e) = self.send_message(&PeerMessage::LocationChanged { location }) {
                    log::debug!("Could not send location to {}: {}", self.hash().short(), e);
                }
            }
        }
        self.send_detected_address();
    }

    // ========================================================================
    // Disconnection
    // ========================================================================

    /// Connection lost; keys are deprecated but kept for in-flight packets
    ///
    /// Returns whether we were connected.
    pub fn disconnected(&self) -> bool {
        self.disconnect(false)
    }

    /// Tear down completely, dropping all keys and queued messages
    pub fn force_disconnect(&self) {
        log::warn!("Forcing disconnect of {}", self.hash().short());
        self.disconnect(true);
    }

    fn disconnect(&self, dump_everything: bool) -> bool {
        let now = self.now();
        let (was_connected, dropped_keys) = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let was_connected = st.connected;
            st.connected = false;
            st.routable = false;
            st.rekeying = false;
            st.sent_initial_messages = false;
            st.keys.disconnect_all();
            let dropped = if dump_everything {
                st.keys.take_all()
            } else {
                Vec::new()
            };
            st.handshake.reset_next_to(now);
            st.time_last_disconnect = now;
            self.refresh_status(st, now);
            (was_connected, dropped)
        };

        for key in dropped_keys {
            key.discard();
        }
        let failed = if dump_everything {
            self.queue.drain_all()
        } else {
            self.queue.take_with_callbacks()
        };
        failed.iter().for_each(MessageItem::notify_disconnected);

        self.collab.peers.peer_disconnected(self.hash());
        if was_connected {
            PeerMetrics::incr(&self.metrics.disconnections_total, 1);
            log::info!("Disconnected {}", self.hash().short());
        }
        was_connected
    }

    /// Connected with no key to send under is impossible; recover by disconnecting
    ///
    /// Returns true if the invariant was broken.
    pub fn check_connection_invariants(&self) -> bool {
        let broken = {
            let st = self.state.lock();
            st.connected && !st.keys.has_usable_key()
        };
        if broken {
            log::error!(
                "Peer {} is connected but has no usable session key; disconnecting",
                self.hash().short()
            );
            self.disconnect(false);
        }
        broken
    }

    /// Stop routing to a peer that should no longer be talked to
    pub fn invalidate(&self) {
        let now = self.now();
        {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            st.routable = false;
            self.refresh_status(st, now);
        }
        log::info!("Invalidated {}", self.hash().short());
        self.collab.peers.peer_disconnected(self.hash());
    }

    fn should_disconnect_now(&self) -> bool {
        let st = self.state.lock();
        match &st.reference.version {
            Some(v) => !check_good_version(v, &self.node.version, self.node.last_good_build),
            None => true,
        }
    }

    // ========================================================================
    // Packets
    // ========================================================================

    /// A packet from the peer was decrypted
    ///
    /// `key` and `packet_number` identify the session packet; handshake
    /// packets pass `None`.
    pub fn received_packet(
        &self,
        from: Option<SocketAddr>,
        key: Option<(&Arc<SessionKey>, u32)>,
    ) {
        let now = self.now();
        if let Some(addr) = from {
            self.changed_ip(addr);
        }
        let promote = {
            let mut st = self.state.lock();
            st.time_last_received = now;
            if let Some((k, _)) = key {
                if !st.connected && st.keys.unverified().map_or(true, |u| !Arc::ptr_eq(u, k)) {
                    log::debug!(
                        "Received packet from {} on generation {} while disconnected",
                        self.hash().short(),
                        k.generation()
                    );
                }
            }
            key.map_or(false, |(k, _)| {
                st.keys.unverified().map_or(false, |u| Arc::ptr_eq(u, k))
            })
        };
        if let Some((k, number)) = key {
            k.received_packet(number, now);
            if promote {
                self.verified(k);
            }
        }
    }

    pub fn sent_packet(&self) {
        let now = self.now();
        self.state.lock().time_last_sent = now;
    }

    pub fn report_incoming_bytes(&self, bytes: u64) {
        PeerMetrics::incr(&self.metrics.bytes_in_total, bytes);
    }

    pub fn report_outgoing_bytes(&self, bytes: u64) {
        PeerMetrics::incr(&self.metrics.bytes_out_total, bytes);
    }

    /// Earliest time an ack or resend must go out
    pub fn next_urgent_time(&self) -> u64 {
        self.state.lock().keys.next_urgent_time()
    }

    /// Flush acks and resends on keys whose deadline has passed
    pub fn send_any_urgent_notifications(&self) {
        let now = self.now();
        let keys: Vec<Arc<SessionKey>> = {
            let st = self.state.lock();
            [st.keys.current(), st.keys.previous()]
                .into_iter()
                .flatten()
                .cloned()
                .collect()
        };
        for key in keys {
            let urgent = key.next_urgent_time();
            if urgent == NEVER || urgent > now {
                continue;
            }
            if let Err(e) = self.collab.transport.process_outgoing(self.hash(), &key) {
                if e.is_fatal_for_session() {
                    log::error!("Session with {} desynchronised: {}", self.hash().short(), e);
                    self.force_disconnect();
                    return;
                }
                log::debug!("Urgent flush to {} failed: {}", self.hash().short(), e);
            }
        }
    }

    // ========================================================================
    // Routing Backoff
    // ========================================================================

    /// The peer rejected a request because it is overloaded
    pub fn local_rejected_overload(&self, reason: &str) {
        let now = self.now();
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if st.backoff.report_overload(now, reason, &mut st.rng) {
            PeerMetrics::incr(&self.metrics.backoffs_total, 1);
        }
        self.refresh_status(st, now);
    }

    /// A request to the peer succeeded without overload
    pub fn success_not_overload(&self) {
        let now = self.now();
        let mut guard = self.state.lock();
        let st = &mut *guard;
        st.backoff.report_success(now);
        self.refresh_status(st, now);
    }

    /// Recompute status after time alone may have changed it (backoff expiry)
    ///
    /// Meant to be called periodically; it also enforces the connection
    /// invariants once the state lock is released.
    pub fn update_status(&self) {
        let now = self.now();
        {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            st.backoff.sample_backed_off(now);
            self.refresh_status(st, now);
        }
        self.check_connection_invariants();
    }

    pub fn backoff_snapshot(&self) -> BackoffSnapshot {
        let now = self.now();
        self.state.lock().backoff.snapshot(now)
    }

    /// Sample whether we currently have a routable connection
    pub fn check_routable_connection_status(&self) {
        let cap = self.config().routable_check_cap;
        let mut st = self.state.lock();
        if st.routable {
            st.had_routable_connection_count += 1;
        }
        st.routable_connection_check_count += 1;
        if st.routable_connection_check_count >= cap {
            st.had_routable_connection_count /= 2;
            st.routable_connection_check_count /= 2;
        }
    }

    pub fn percent_time_routable_connection(&self) -> f64 {
        let st = self.state.lock();
        percent_routable(&st)
    }

    // ========================================================================
    // Outbound Messages
    // ========================================================================

    /// Queue a message for the packet assembler
    pub fn send_async(
        &self,
        data: Vec<u8>,
        callback: Option<Arc<dyn SendCallback>>,
    ) -> Result<(), PeerError> {
        let now = self.now();
        if !self.is_connected() {
            if let Some(cb) = &callback {
                cb.disconnected();
            }
            return Err(PeerError::NotConnected);
        }
        let mut item = MessageItem::new(data, now);
        if let Some(cb) = callback {
            item = item.with_callback(cb);
        }
        if self.queue.enqueue(item) {
            self.collab.transport.wake_up();
        }
        Ok(())
    }

    /// Queue a message and block until it is acknowledged
    pub fn send_sync(&self, data: Vec<u8>) -> Result<(), PeerError> {
        let waiter = SyncSendWaiter::new();
        self.send_async(data, Some(waiter.clone() as Arc<dyn SendCallback>))?;
        let timeout = Duration::from_millis(self.config().sync_send_timeout);
        waiter.wait(timeout).map_err(|e| {
            if let PeerError::SendTimeout(ms) = e {
                log::warn!("Sync send to {} waited {} ms without an ack", self.hash().short(), ms);
            }
            e
        })
    }

    fn send_message(&self, msg: &PeerMessage) -> Result<(), PeerError> {
        self.send_async(encode_message(msg)?, None)
    }

    /// Everything queued, for the packet assembler
    pub fn grab_queued_messages(&self) -> Vec<MessageItem> {
        self.queue.drain_all()
    }

    /// Put messages back after a failed transmission
    pub fn requeue_messages(&self, items: Vec<MessageItem>, reason: &str, dont_log: bool) {
        PeerMetrics::incr(&self.metrics.requeued_messages_total, items.len() as u64);
        self.queue.requeue(items, reason, dont_log, self.now());
    }

    pub fn queued_messages(&self) -> usize {
        self.queue.len()
    }

    /// Hand unacknowledged packets back for retransmission
    ///
    /// Packets whose key is still held are resent under that key's sequence
    /// layer; the rest go back to the message queue for the current key.
    pub fn requeue_resend_items(&self, items: Vec<ResendItem>) {
        if items.is_empty() {
            return;
        }
        let now = self.now();
        let mut by_key: Vec<(Arc<SessionKey>, ResendItem)> = Vec::new();
        let mut orphans: Vec<ResendItem> = Vec::new();
        let can_send = {
            let st = self.state.lock();
            for item in items {
                match st.keys.find(item.generation) {
                    Some((_, key)) => by_key.push((Arc::clone(key), item)),
                    None => orphans.push(item),
                }
            }
            st.keys.current().is_some() || st.keys.unverified().is_some()
        };

        for (key, item) in by_key {
            key.resend_item(item, now);
        }
        if orphans.is_empty() {
            return;
        }
        if can_send {
            let messages: Vec<MessageItem> = orphans.into_iter().map(|i| i.into_message(now)).collect();
            self.requeue_messages(messages, "key no longer held", true);
        } else {
            log::error!(
                "No session key to resend {} packets to {}; failing them",
                orphans.len(),
                self.hash().short()
            );
            for item in orphans {
                item.callbacks.iter().for_each(|cb| cb.disconnected());
            }
        }
    }

    // ========================================================================
    // Pings
    // ========================================================================

    /// Low-level ping; true if the matching pong arrived in time
    pub fn ping(&self, id: u32) -> Result<bool, PeerError> {
        if !self.is_connected() {
            return Err(PeerError::NotConnected);
        }
        let start = self.now();
        self.collab.transport.send(self.hash(), &PeerMessage::Ping { id })?;
        let reply = self.collab.transport.wait_for(
            self.hash(),
            &MessageFilter::Pong { id },
            Duration::from_millis(self.config().ping_timeout),
        )?;
        if reply.is_some() {
            let now = self.now();
            self.state.lock().pings.report_rtt(now, now.saturating_sub(start));
        }
        Ok(reply.is_some())
    }

    /// Send a link ping and remember when
    pub fn send_ping(&self) -> Result<u64, PeerError> {
        let now = self.now();
        let id = self.state.lock().pings.send_ping(now);
        self.collab.transport.send(self.hash(), &PeerMessage::LinkPing { id })?;
        Ok(id)
    }

    /// Returns the round trip if `id` was outstanding
    pub fn received_link_pong(&self, id: u64) -> Option<u64> {
        let now = self.now();
        let rtt = self.state.lock().pings.received_pong(id, now);
        if self.is_routable() && self.should_disconnect_now() {
            self.invalidate();
        }
        rtt
    }

    /// Dispatch a control message from the peer
    ///
    /// Returns the payload of `Data` messages for the application.
    pub fn handle_message(&self, msg: PeerMessage) -> Result<Option<Vec<u8>>, PeerError> {
        match msg {
            PeerMessage::Ping { id } => {
                self.collab.transport.send(self.hash(), &PeerMessage::Pong { id })?;
            }
            PeerMessage::LinkPing { id } => {
                self.collab.transport.send(self.hash(), &PeerMessage::LinkPong { id })?;
            }
            PeerMessage::LinkPong { id } => {
                self.received_link_pong(id);
            }
            PeerMessage::LocationChanged { location } => {
                self.update_location(location)?;
            }
            PeerMessage::DetectedAddress { address } => {
                log::debug!(
                    "Peer {} sees us at {:?}",
                    self.hash().short(),
                    address
                );
            }
            PeerMessage::Pong { .. } => {}
            PeerMessage::Data { payload } => return Ok(Some(payload)),
        }
        Ok(None)
    }

    // ========================================================================
    // Addresses
    // ========================================================================

    /// The peer's packets now come from `addr`
    pub fn changed_ip(&self, addr: SocketAddr) {
        let (moved, connected) = {
            let mut st = self.state.lock();
            let moved = st.addresses.set_detected(PeerAddress::from_socket(addr));
            (moved, st.connected)
        };
        if moved {
            log::debug!("Peer {} moved to {}", self.hash().short(), addr);
            if connected {
                self.send_detected_address();
            }
        }
    }

    fn send_detected_address(&self) {
        let address = self.peer_address().and_then(|a| a.socket_addr());
        if let Err(e) = self.send_message(&PeerMessage::DetectedAddress { address }) {
            log::debug!("Could not send detected address to {}: {}", self.hash().short(), e);
        }
    }

    /// Refresh handshake candidates if the cooldown allows
    ///
    /// Hostnames are resolved without holding the state lock.
    pub fn maybe_update_handshake_addresses(&self, ignore_hostnames: bool) {
        let now = self.now();
        let (snapshot, rules) = {
            let mut st = self.state.lock();
            let cooldown = self.config().handshake_address_refresh_interval;
            match st.addresses.begin_refresh(now, cooldown, ignore_hostnames) {
                Some(snapshot) => (snapshot, self.node.candidate_rules(st.allow_local_addresses)),
                None => return,
            }
        };
        let candidates = compute_handshake_candidates(&snapshot, &rules, self.collab.resolver.as_ref());
        if candidates.is_empty() {
            log::debug!("No usable handshake addresses for {}", self.hash().short());
        }
        self.state.lock().addresses.finish_refresh(candidates);
    }

    pub fn handshake_addresses(&self) -> Vec<SocketAddr> {
        self.maybe_update_handshake_addresses(false);
        self.state.lock().addresses.candidates().to_vec()
    }

    // ========================================================================
    // Reference Updates and ARK
    // ========================================================================

    /// Apply an updated reference from the peer; true if anything changed
    pub fn process_new_noderef(&self, fs: &FieldSet, purpose: ParsePurpose) -> Result<bool, PeerError> {
        let parsed = NodeReference::parse(fs, ParseContext::new(purpose, self.node.testnet))?;
        if !self.identity.same_identity(&parsed.identity) {
            return Err(PeerError::IdentityMismatch);
        }
        let (invalid, reverse_invalid) = version_checks(&self.node, &parsed);

        let changed = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let current = &mut st.reference;
            let mut changed = false;

            if parsed.version.is_some() && parsed.version != current.version {
                current.version = parsed.version.clone();
                st.invalid_version = invalid;
                changed = true;
            }
            if parsed.last_good_version.is_some() && parsed.last_good_version != current.last_good_version {
                current.last_good_version = parsed.last_good_version.clone();
                changed = true;
            }
            st.reverse_invalid_version = reverse_invalid;
            if let Some(loc) = parsed.location {
                if current.location != Some(loc) {
                    current.location = Some(loc);
                    changed = true;
                }
            }
            if parsed.name.is_some() && parsed.name != current.name {
                current.name = parsed.name.clone();
                changed = true;
            }
            if parsed.neg_types != current.neg_types {
                current.neg_types = parsed.neg_types.clone();
                changed = true;
            }
            match (&mut current.ark, &parsed.ark) {
                (Some(mine), Some(theirs)) => changed |= mine.update_from(theirs),
                (None, Some(theirs)) => {
                    current.ark = Some(theirs.clone());
                    changed = true;
                }
                _ => {}
            }
            current.signature = parsed.signature.clone();
            if !parsed.addresses.is_empty() && st.addresses.replace_nominal(parsed.addresses.clone()) {
                current.addresses = parsed.addresses;
                st.addresses.reset_refresh_cooldown();
                changed = true;
            }
            changed
        };

        if changed {
            log::debug!("Reference for {} changed", self.hash().short());
            self.collab.peers.write_peers();
        }
        Ok(changed)
    }

    /// ARK service found an edition; true if it should be fetched
    pub fn on_ark_found(&self, edition: u64) -> bool {
        let st = self.state.lock();
        if st.connected {
            return false;
        }
        match &st.reference.ark {
            Some(ark) => edition >= ark.suggested_edition,
            None => false,
        }
    }

    /// A fetched ARK edition arrived
    ///
    /// A bad payload pushes the failure counter to the ARK threshold. Later
    /// handshake failures count past it, so they do not start another fetch
    /// until the counter is reset. The connection is left alone.
    pub fn got_ark(&self, fs: &FieldSet, fetched_edition: u64) -> Result<(), PeerError> {
        {
            let mut st = self.state.lock();
            st.handshake.reset_count();
            if let Some(ark) = st.reference.ark.as_mut() {
                ark.fetched(fetched_edition);
            }
        }
        log::info!(
            "Got ARK edition {} for {}",
            fetched_edition,
            self.hash().short()
        );
        match self.process_new_noderef(fs, ParsePurpose::Ark) {
            Ok(_) => Ok(()),
            Err(e) => {
                log::error!("Bad ARK payload for {}: {}", self.hash().short(), e);
                let max = self.config().max_handshake_count;
                self.state.lock().handshake.force_count(max);
                Err(e)
            }
        }
    }

    /// Subscribe to the peer's ARK; never for listen-only or disabled peers
    pub fn start_ark_fetcher(&self) {
        let ark = {
            let st = self.state.lock();
            if st.disabled || st.mode == PeerMode::ListenOnly {
                log::debug!("Not fetching ARK for {} ({:?})", self.hash().short(), st.mode);
                return;
            }
            st.reference.ark.clone()
        };
        self.ark_fetcher
            .start(self.collab.ark.as_ref(), self.hash(), ark.as_ref());
    }

    pub fn stop_ark_fetcher(&self) {
        self.ark_fetcher.stop(self.collab.ark.as_ref(), self.hash());
    }

    pub fn is_fetching_ark(&self) -> bool {
        self.ark_fetcher.is_active()
    }

    /// The peer announced a new keyspace location
    pub fn update_location(&self, location: f64) -> Result<(), PeerError> {
        if !(0.0..=1.0).contains(&location) {
            log::error!("Invalid location {} from {}", location, self.hash().short());
            return Err(PeerError::parse(format!("location {} out of range", location)));
        }
        self.state.lock().reference.location = Some(location);
        self.collab.peers.write_peers();
        Ok(())
    }

    // ========================================================================
    // Settings
    // ========================================================================

    pub fn set_disabled(&self, disabled: bool) {
        let now = self.now();
        let was_connected = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            st.disabled = disabled;
            self.refresh_status(st, now);
            st.connected
        };
        if disabled {
            if was_connected {
                self.disconnected();
            }
            self.stop_ark_fetcher();
        }
        self.collab.peers.write_peers();
    }

    pub fn set_listen_only(&self, listen_only: bool) {
        let now = self.now();
        {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            if listen_only {
                st.mode = PeerMode::ListenOnly;
            } else if st.mode == PeerMode::ListenOnly {
                st.mode = PeerMode::Normal;
            }
            self.refresh_status(st, now);
        }
        if listen_only {
            self.stop_ark_fetcher();
        }
        self.collab.peers.write_peers();
    }

    pub fn set_burst_only(&self, burst_only: bool) {
        let now = self.now();
        {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            if burst_only {
                st.mode = PeerMode::BurstOnly;
            } else if st.mode == PeerMode::BurstOnly {
                st.mode = PeerMode::Normal;
                // Drop any long pause left over from burst mode
                st.handshake.reset_next_to(now);
            }
            self.refresh_status(st, now);
        }
        self.collab.peers.write_peers();
    }

    pub fn set_ignore_source_port(&self, ignore: bool) {
        self.state.lock().ignore_source_port = ignore;
        self.collab.peers.write_peers();
    }

    pub fn set_allow_local_addresses(&self, allow: bool) {
        {
            let mut st = self.state.lock();
            st.allow_local_addresses = allow;
            st.addresses.reset_refresh_cooldown();
        }
        self.collab.peers.write_peers();
    }

    pub fn mode(&self) -> PeerMode {
        self.state.lock().mode
    }

    pub fn is_disabled(&self) -> bool {
        self.state.lock().disabled
    }

    // ========================================================================
    // Export
    // ========================================================================

    /// Reference record for the peer store
    pub fn export_reference(&self) -> FieldSet {
        self.state.lock().reference.to_fieldset()
    }

    /// Local-only metadata record for the peer store
    pub fn export_metadata(&self) -> FieldSet {
        let st = self.state.lock();
        PeerMetadata {
            detected: st.addresses.detected().map(|a| a.to_string()),
            time_last_received_packet: st.time_last_received,
            time_last_connected: st.time_last_connected,
            time_last_routable: st.time_last_routable,
            peer_added_time: st.peer_added_time,
            never_connected: st.never_connected,
            disabled: st.disabled,
            listen_only: st.mode == PeerMode::ListenOnly,
            burst_only: st.mode == PeerMode::BurstOnly,
            ignore_source_port: st.ignore_source_port,
            allow_local_addresses: st.allow_local_addresses,
            had_routable_connection_count: st.had_routable_connection_count,
            routable_connection_check_count: st.routable_connection_check_count,
        }
        .to_fieldset()
    }

    /// Runtime statistics, not persisted
    pub fn export_volatile(&self) -> FieldSet {
        let now = self.now();
        let st = self.state.lock();
        let mut fs = FieldSet::new();
        fs.put_single("averagePingTime", st.pings.average_ping_time().to_string());
        fs.put_single("idle", now.saturating_sub(st.time_last_received).to_string());
        if let Some(reason) = st.backoff.reason() {
            fs.put_single("lastRoutingBackoffReason", reason);
        }
        fs.put_single("routingBackoffPercent", (st.backoff.backed_off_percent() * 100.0).to_string());
        fs.put_single("routingBackoff", st.backoff.remaining(now).to_string());
        fs.put_single("routingBackoffLength", st.backoff.length().to_string());
        fs.put_single("overloadProbability", (st.backoff.p_rejected() * 100.0).to_string());
        fs.put_single("percentTimeRoutableConnection", (percent_routable(&st) * 100.0).to_string());
        fs.put_single("totalBytesIn", self.metrics.bytes_in_total.load(Ordering::Relaxed).to_string());
        fs.put_single("totalBytesOut", self.metrics.bytes_out_total.load(Ordering::Relaxed).to_string());
        fs.put_single("status", st.status.as_str());
        fs
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        let now = self.now();
        let queued = self.queue.len();
        let st = self.state.lock();
        PeerSnapshot {
            identity: self.hash().to_string(),
            name: st.reference.name.clone(),
            status: st.status.to_string(),
            connected: st.connected,
            routable: st.routable,
            disabled: st.disabled,
            mode: st.mode,
            compat: st.compat,
            version: st.reference.version.as_ref().map(|v| v.to_string()),
            location: st.reference.location,
            nominal_addresses: st.addresses.nominal().iter().map(|a| a.to_string()).collect(),
            detected_address: st.addresses.detected().map(|a| a.to_string()),
            handshake_candidates: st.addresses.candidates().iter().map(|a| a.to_string()).collect(),
            boot_id: st.boot_id,
            bogus_reference: st.bogus_reference,
            connected_time: st.connected_time,
            time_last_sent: st.time_last_sent,
            time_last_disconnect: st.time_last_disconnect,
            keys: st.keys.snapshot(),
            handshake: st.handshake.snapshot(),
            backoff: st.backoff.snapshot(now),
            ark: st.reference.ark.clone(),
            average_ping_ms: st.pings.average_ping_time(),
            idle_ms: now.saturating_sub(st.time_last_received),
            queued_messages: queued,
            percent_time_routable: percent_routable(&st),
        }
    }

    /// Prometheus text for this peer's counters
    pub fn render_metrics(&self) -> String {
        self.metrics.render(&self.hash().short())
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("peer", &self.hash().short())
            .field("status", &self.status())
            .finish()
    }
}

/// `(peer too old, we too new)` for a parsed reference
fn version_checks(node: &LocalNode, reference: &NodeReference) -> (bool, bool) {
    let invalid = match &reference.version {
        Some(v) => !check_good_version(v, &node.version, node.last_good_build),
        None => true,
    };
    let reverse_invalid = !check_arbitrary_good_version(&node.version, reference.last_good_version.as_ref());
    (invalid, reverse_invalid)
}

fn percent_routable(st: &PeerState) -> f64 {
    if st.routable_connection_check_count == 0 {
        0.0
    } else {
        st.had_routable_connection_count as f64 / st.routable_connection_check_count as f64
    }
}
