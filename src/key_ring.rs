//! Current, previous and unverified session keys
//!
//! At most one key sits in each slot. `previous` only exists to drain
//! in-flight traffic from a superseded key and is always deprecated. The ring
//! itself is plain data; `PeerSession` keeps it behind its state lock so every
//! rotation is a single step for concurrent readers.
//!
//! Rotations return the keys they pushed out instead of acting on them, so
//! the caller can resend or fail their packets after releasing the lock.

use std::sync::Arc;

use serde::Serialize;

use crate::session_key::{SessionKey, NEVER};

/// Which slot a key occupies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum KeySlot {
    Current,
    Previous,
    Unverified,
}

/// Keys displaced by `promote_unverified`
#[derive(Debug, Default)]
pub struct Promotion {
    /// Old `previous`, now completely deprecated
    pub retired: Option<Arc<SessionKey>>,
}

/// Keys displaced by `install_new_session`
#[derive(Debug, Default)]
pub struct InstallOutcome {
    /// Dropped because the peer restarted; their packets are meaningless
    pub discarded: Vec<Arc<SessionKey>>,
    /// Superseded by a rekey; their packets should be resent
    pub retired: Vec<Arc<SessionKey>>,
}

/// Generations in each slot, for status snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct KeyRingSnapshot {
    pub current: Option<u64>,
    pub previous: Option<u64>,
    pub unverified: Option<u64>,
}

#[derive(Debug, Default)]
pub struct KeyRing {
    current: Option<Arc<SessionKey>>,
    previous: Option<Arc<SessionKey>>,
    unverified: Option<Arc<SessionKey>>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&Arc<SessionKey>> {
        self.current.as_ref()
    }

    pub fn previous(&self) -> Option<&Arc<SessionKey>> {
        self.previous.as_ref()
    }

    pub fn unverified(&self) -> Option<&Arc<SessionKey>> {
        self.unverified.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_none() && self.previous.is_none() && self.unverified.is_none()
    }

    /// A key we can send under now or once verified
    pub fn has_usable_key(&self) -> bool {
        self.current.is_some() || self.unverified.is_some()
    }

    /// Install the key from a completed handshake
    ///
    /// With `boot_changed` every held key is discarded first. An unverified
    /// key waits in its own slot for `promote_unverified`; a verified one
    /// becomes current straight away, pushing the old current to previous.
    pub fn install_new_session(
        &mut self,
        key: Arc<SessionKey>,
        boot_changed: bool,
        unverified: bool,
    ) -> InstallOutcome {
        let mut outcome = InstallOutcome::default();
        if boot_changed {
            outcome.discarded.extend(self.current.take());
            outcome.discarded.extend(self.previous.take());
            outcome.discarded.extend(self.unverified.take());
        }

        if unverified {
            if let Some(old) = self.unverified.take() {
                if self.previous.is_none() {
                    old.deprecate();
                    self.previous = Some(old);
                } else {
                    outcome.retired.push(old);
                }
            }
            self.unverified = Some(key);
        } else {
            outcome.retired.extend(self.previous.take());
            outcome.retired.extend(self.unverified.take());
            if let Some(old) = self.current.take() {
                old.deprecate();
                self.previous = Some(old);
            }
            self.current = Some(key);
        }
        outcome
    }

    /// A packet decrypted under `key`; promote it if it is the unverified one
    ///
    /// Returns `None` if `key` is not (or no longer) the unverified key.
    pub fn promote_unverified(&mut self, key: &Arc<SessionKey>) -> Option<Promotion> {
        match &self.unverified {
            Some(u) if Arc::ptr_eq(u, key) && !u.is_deprecated() => {}
            _ => return None,
        }
        let retired = self.previous.take();
        if let Some(old) = self.current.take() {
            old.deprecate();
            self.previous = Some(old);
        }
        self.current = self.unverified.take();
        Some(Promotion { retired })
    }

    /// Deprecate everything in place, keeping keys for in-flight decrypts
    pub fn disconnect_all(&self) {
        for key in self.iter() {
            key.deprecate();
        }
    }

    /// Empty every slot, returning what was held
    pub fn take_all(&mut self) -> Vec<Arc<SessionKey>> {
        [self.current.take(), self.previous.take(), self.unverified.take()]
            .into_iter()
            .flatten()
            .collect()
    }

    /// Earliest mandatory send time over current and previous
    pub fn next_urgent_time(&self) -> u64 {
        [&self.current, &self.previous]
            .into_iter()
            .flatten()
            .map(|k| k.next_urgent_time())
            .min()
            .unwrap_or(NEVER)
    }

    /// Slot of the key with this generation, if still held
    pub fn find(&self, generation: u64) -> Option<(KeySlot, &Arc<SessionKey>)> {
        [
            (KeySlot::Current, &self.current),
            (KeySlot::Previous, &self.previous),
            (KeySlot::Unverified, &self.unverified),
        ]
        .into_iter()
        .find_map(|(slot, key)| match key {
            Some(k) if k.generation() == generation => Some((slot, k)),
            _ => None,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<SessionKey>> {
        [&self.current, &self.previous, &self.unverified]
            .into_iter()
            .flatten()
    }

    pub fn snapshot(&self) -> KeyRingSnapshot {
        KeyRingSnapshot {
            current: self.current.as_ref().map(|k| k.generation()),
            previous: self.previous.as_ref().map(|k| k.generation()),
            unverified: self.unverified.as_ref().map(|k| k.generation()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> Arc<SessionKey> {
        SessionKey::new(vec![0; 32], 200)
    }

    fn check_invariants(ring: &KeyRing) {
        if let Some(p) = ring.previous() {
            assert!(p.is_deprecated());
        }
        if let (Some(c), Some(p)) = (ring.current(), ring.previous()) {
            assert_ne!(c.generation(), p.generation());
        }
    }

    #[test]
    fn test_rekeys_with_same_boot_keep_three_slots() {
        let mut ring = KeyRing::new();
        for i in 0..10 {
            let unverified = i % 3 == 1;
            ring.install_new_session(key(), false, unverified);
            check_invariants(&ring);
        }
    }

    #[test]
    fn test_verified_rekey_demotes_current() {
        let mut ring = KeyRing::new();
        let k1 = key();
        let k2 = key();
        ring.install_new_session(k1.clone(), false, false);
        let outcome = ring.install_new_session(k2.clone(), false, false);
        assert!(outcome.discarded.is_empty());
        assert!(Arc::ptr_eq(ring.current().unwrap(), &k2));
        assert!(Arc::ptr_eq(ring.previous().unwrap(), &k1));
        assert!(k1.is_deprecated());

        let k3 = key();
        let outcome = ring.install_new_session(k3, false, false);
        assert_eq!(outcome.retired.len(), 1);
        assert!(Arc::ptr_eq(&outcome.retired[0], &k1));
    }

    #[test]
    fn test_boot_change_discards_instead_of_demoting() {
        let mut ring = KeyRing::new();
        ring.install_new_session(key(), false, false);
        ring.install_new_session(key(), false, false);
        ring.install_new_session(key(), false, true);

        let fresh = key();
        let outcome = ring.install_new_session(fresh.clone(), true, false);
        assert_eq!(outcome.discarded.len(), 3);
        assert!(outcome.retired.is_empty());
        assert!(ring.previous().is_none());
        assert!(ring.unverified().is_none());
        assert!(Arc::ptr_eq(ring.current().unwrap(), &fresh));
    }

    #[test]
    fn test_promote_unverified() {
        let mut ring = KeyRing::new();
        let k1 = key();
        let k0 = key();
        ring.install_new_session(k0.clone(), false, false);
        ring.install_new_session(key(), false, false);
        ring.install_new_session(k1.clone(), false, true);

        let before = ring.current().unwrap().clone();
        let promotion = ring.promote_unverified(&k1).unwrap();
        assert!(Arc::ptr_eq(promotion.retired.as_ref().unwrap(), &k0));
        assert!(Arc::ptr_eq(ring.current().unwrap(), &k1));
        assert!(!Arc::ptr_eq(ring.current().unwrap(), &before));
        assert!(Arc::ptr_eq(ring.previous().unwrap(), &before));
        assert!(ring.unverified().is_none());
        check_invariants(&ring);

        // Second promotion of the same key is rejected
        assert!(ring.promote_unverified(&k1).is_none());
    }

    #[test]
    fn test_unverified_replaced_moves_to_empty_previous() {
        let mut ring = KeyRing::new();
        let u1 = key();
        ring.install_new_session(u1.clone(), false, true);
        let outcome = ring.install_new_session(key(), false, true);
        assert!(outcome.retired.is_empty());
        assert!(Arc::ptr_eq(ring.previous().unwrap(), &u1));
        assert!(u1.is_deprecated());
    }

    #[test]
    fn test_disconnect_all_keeps_keys() {
        let mut ring = KeyRing::new();
        ring.install_new_session(key(), false, false);
        ring.install_new_session(key(), false, true);
        ring.disconnect_all();
        assert!(ring.current().is_some());
        assert!(ring.iter().all(|k| k.is_deprecated()));
    }

    #[test]
    fn test_next_urgent_time_and_find() {
        let mut ring = KeyRing::new();
        assert_eq!(ring.next_urgent_time(), NEVER);
        let k1 = key();
        let k2 = key();
        ring.install_new_session(k1.clone(), false, false);
        ring.install_new_session(k2.clone(), false, false);
        k1.received_packet(0, 1_000);
        k2.received_packet(0, 2_000);
        assert_eq!(ring.next_urgent_time(), 1_200);

        assert_eq!(ring.find(k1.generation()).map(|(s, _)| s), Some(KeySlot::Previous));
        assert_eq!(ring.find(k2.generation()).map(|(s, _)| s), Some(KeySlot::Current));
        assert!(ring.find(u64::MAX).is_none());
    }
}
