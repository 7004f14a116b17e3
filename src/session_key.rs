//! One generation of session key material
//!
//! A `SessionKey` owns the key bytes negotiated in one handshake plus the
//! packet-number space used under them: which numbers have been handed out,
//! which sent packets are still unacknowledged, which received packets still
//! need an ack, and when the next ack or resend must go out.
//!
//! Encryption itself happens in the packet layer; this type only tracks
//! sequencing so keys can be rotated without losing in-flight data.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::PeerError;
use crate::queue::{MessageItem, SendCallback};

/// Time value meaning "nothing scheduled"
pub const NEVER: u64 = u64::MAX;

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// An unacknowledged packet handed back for retransmission
#[derive(Clone)]
pub struct ResendItem {
    /// Key generation the packet was originally sent under
    pub generation: u64,
    pub packet_number: u32,
    pub payload: Vec<u8>,
    pub callbacks: Vec<Arc<dyn SendCallback>>,
}

impl ResendItem {
    /// Turn back into a plain queue entry for fresh transmission
    pub fn into_message(self, now: u64) -> MessageItem {
        MessageItem {
            data: self.payload,
            callbacks: self.callbacks,
            already_reported_bytes: true,
            enqueued_at: now,
        }
    }
}

impl std::fmt::Debug for ResendItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResendItem")
            .field("generation", &self.generation)
            .field("packet_number", &self.packet_number)
            .field("len", &self.payload.len())
            .finish()
    }
}

struct SentPacket {
    payload: Vec<u8>,
    callbacks: Vec<Arc<dyn SendCallback>>,
}

struct KeyState {
    next_packet_number: u32,
    unacked: BTreeMap<u32, SentPacket>,
    pending_acks: Vec<u32>,
    resends: Vec<u32>,
    next_urgent_time: u64,
    completely_deprecated: bool,
}

impl KeyState {
    fn recompute_urgent(&mut self) {
        if self.pending_acks.is_empty() && self.resends.is_empty() {
            self.next_urgent_time = NEVER;
        }
    }
}

/// Key material plus its packet-number space
pub struct SessionKey {
    generation: u64,
    key_material: Vec<u8>,
    ack_delay: u64,
    deprecated: AtomicBool,
    state: Mutex<KeyState>,
}

impl SessionKey {
    pub fn new(key_material: Vec<u8>, ack_delay: u64) -> Arc<Self> {
        Arc::new(Self {
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
            key_material,
            ack_delay,
            deprecated: AtomicBool::new(false),
            state: Mutex::new(KeyState {
                next_packet_number: 0,
                unacked: BTreeMap::new(),
                pending_acks: Vec::new(),
                resends: Vec::new(),
                next_urgent_time: NEVER,
                completely_deprecated: false,
            }),
        })
    }

    /// Process-unique identifier of this key
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn key_material(&self) -> &[u8] {
        &self.key_material
    }

    /// No longer preferred for sending, still usable for decrypting
    pub fn is_deprecated(&self) -> bool {
        self.deprecated.load(Ordering::Acquire)
    }

    pub fn deprecate(&self) {
        if !self.deprecated.swap(true, Ordering::AcqRel) {
            log::debug!("Deprecated session key generation {}", self.generation);
        }
    }

    pub fn is_completely_deprecated(&self) -> bool {
        self.state.lock().completely_deprecated
    }

    /// Next outbound packet number
    pub fn allocate_packet_number(&self) -> Result<u32, PeerError> {
        if self.is_deprecated() {
            return Err(PeerError::KeyChanged);
        }
        let mut state = self.state.lock();
        if state.next_packet_number == u32::MAX {
            return Err(PeerError::PacketSequence(format!(
                "packet numbers exhausted on generation {}",
                self.generation
            )));
        }
        let n = state.next_packet_number;
        state.next_packet_number += 1;
        Ok(n)
    }

    /// Record a transmitted packet until it is acknowledged
    pub fn record_sent(
        &self,
        packet_number: u32,
        payload: Vec<u8>,
        callbacks: Vec<Arc<dyn SendCallback>>,
    ) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        if packet_number >= state.next_packet_number {
            return Err(PeerError::PacketSequence(format!(
                "packet {} was never allocated on generation {}",
                packet_number, self.generation
            )));
        }
        if state.unacked.contains_key(&packet_number) {
            return Err(PeerError::PacketSequence(format!(
                "packet {} sent twice on generation {}",
                packet_number, self.generation
            )));
        }
        callbacks.iter().for_each(|cb| cb.sent());
        state
            .unacked
            .insert(packet_number, SentPacket { payload, callbacks });
        Ok(())
    }

    /// Peer acknowledged one of our packets; false if unknown
    pub fn acknowledged(&self, packet_number: u32) -> bool {
        let packet = {
            let mut state = self.state.lock();
            state.resends.retain(|n| *n != packet_number);
            state.recompute_urgent();
            state.unacked.remove(&packet_number)
        };
        match packet {
            Some(p) => {
                p.callbacks.iter().for_each(|cb| cb.acknowledged());
                true
            }
            None => false,
        }
    }

    /// An inbound packet arrived; an ack becomes due after the ack delay
    pub fn received_packet(&self, packet_number: u32, now: u64) {
        let mut state = self.state.lock();
        state.pending_acks.push(packet_number);
        state.next_urgent_time = state.next_urgent_time.min(now + self.ack_delay);
    }

    /// Acks to piggyback on the next outgoing packet
    pub fn take_pending_acks(&self) -> Vec<u32> {
        let mut state = self.state.lock();
        let acks = std::mem::take(&mut state.pending_acks);
        state.recompute_urgent();
        acks
    }

    /// Mark an unacknowledged packet for retransmission; false if unknown
    pub fn resend_packet(&self, packet_number: u32, now: u64) -> bool {
        let mut state = self.state.lock();
        if !state.unacked.contains_key(&packet_number) {
            return false;
        }
        if !state.resends.contains(&packet_number) {
            state.resends.push(packet_number);
        }
        state.next_urgent_time = state.next_urgent_time.min(now);
        true
    }

    /// Adopt a packet for retransmission under this key's sequence layer
    pub fn resend_item(&self, item: ResendItem, now: u64) {
        let mut state = self.state.lock();
        let number = item.packet_number;
        state.unacked.entry(number).or_insert(SentPacket {
            payload: item.payload,
            callbacks: item.callbacks,
        });
        if !state.resends.contains(&number) {
            state.resends.push(number);
        }
        state.next_urgent_time = state.next_urgent_time.min(now);
    }

    /// Packets due for retransmission, as `(number, payload)`
    pub fn take_resends(&self) -> Vec<(u32, Vec<u8>)> {
        let mut state = self.state.lock();
        let numbers = std::mem::take(&mut state.resends);
        let out: Vec<(u32, Vec<u8>)> = numbers
            .into_iter()
            .filter_map(|n| state.unacked.get(&n).map(|p| (n, p.payload.clone())))
            .collect();
        state.recompute_urgent();
        out
    }

    pub fn unacked_count(&self) -> usize {
        self.state.lock().unacked.len()
    }

    /// Earliest time an ack or resend must go out, `NEVER` if none
    pub fn next_urgent_time(&self) -> u64 {
        self.state.lock().next_urgent_time
    }

    /// Retire this key, handing back everything still unacknowledged
    pub fn completely_deprecated(&self) -> Vec<ResendItem> {
        self.deprecate();
        let mut state = self.state.lock();
        state.completely_deprecated = true;
        state.resends.clear();
        state.pending_acks.clear();
        state.next_urgent_time = NEVER;
        std::mem::take(&mut state.unacked)
            .into_iter()
            .map(|(n, p)| ResendItem {
                generation: self.generation,
                packet_number: n,
                payload: p.payload,
                callbacks: p.callbacks,
            })
            .collect()
    }

    /// Discard the key, failing everything still unacknowledged
    pub fn discard(&self) {
        for item in self.completely_deprecated() {
            item.callbacks.iter().for_each(|cb| cb.disconnected());
        }
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKey")
            .field("generation", &self.generation)
            .field("deprecated", &self.is_deprecated())
            .finish()
    }
}
