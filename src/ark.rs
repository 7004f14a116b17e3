//! Advertised Reference Key tracking
//!
//! A peer publishes its latest reference under a versioned public key. We
//! remember the next edition we want and, while we cannot reach the peer,
//! keep a subscription open with the ARK transport.
//!
//! Subscribe and unsubscribe can be slow, so `ArkFetcher` guards them with its
//! own lock. Callers read whatever they need from the session state first,
//! release the session lock, then call into the fetcher. The session lock is
//! never taken while the fetcher lock is held.

use parking_lot::Mutex;
use serde::Serialize;

use crate::collaborators::{ArkTransport, SubscriptionHandle};
use crate::identity::IdentityHash;

/// Public pointer plus the edition we want next
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArkReference {
    pub pub_uri: String,
    /// Next edition to fetch, not the last one fetched
    pub suggested_edition: u64,
}

impl ArkReference {
    pub fn new(pub_uri: impl Into<String>, suggested_edition: u64) -> Self {
        Self {
            pub_uri: pub_uri.into(),
            suggested_edition,
        }
    }

    /// Adopt a newer reference; true if anything changed
    pub fn update_from(&mut self, other: &ArkReference) -> bool {
        if self.pub_uri != other.pub_uri {
            *self = other.clone();
            return true;
        }
        if other.suggested_edition > self.suggested_edition {
            self.suggested_edition = other.suggested_edition;
            return true;
        }
        false
    }

    /// After fetching `fetched`, ask for the one after it
    pub fn fetched(&mut self, fetched: u64) {
        self.suggested_edition = self.suggested_edition.max(fetched.saturating_add(1));
    }
}

struct ActiveFetch {
    handle: SubscriptionHandle,
    ark: ArkReference,
}

/// Subscription state for one peer's ARK
#[derive(Default)]
pub struct ArkFetcher {
    active: Mutex<Option<ActiveFetch>>,
}

impl ArkFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Subscribe unless already subscribed; true if a new subscription started
    pub fn start(
        &self,
        transport: &dyn ArkTransport,
        peer: &IdentityHash,
        ark: Option<&ArkReference>,
    ) -> bool {
        let Some(ark) = ark else {
            log::debug!("No ARK for {}", peer.short());
            return false;
        };
        let mut active = self.active.lock();
        if active.is_some() {
            return false;
        }
        log::debug!(
            "Starting ARK fetcher for {} at edition {}",
            peer.short(),
            ark.suggested_edition
        );
        match transport.subscribe(peer, ark) {
            Ok(handle) => {
                *active = Some(ActiveFetch {
                    handle,
                    ark: ark.clone(),
                });
                true
            }
            Err(e) => {
                log::warn!("ARK subscription for {} failed: {}", peer.short(), e);
                false
            }
        }
    }

    /// Unsubscribe if subscribed; true if a subscription was stopped
    pub fn stop(&self, transport: &dyn ArkTransport, peer: &IdentityHash) -> bool {
        let mut active = self.active.lock();
        match active.take() {
            Some(fetch) => {
                log::debug!("Stopping ARK fetcher for {}", peer.short());
                transport.unsubscribe(peer, &fetch.ark, fetch.handle);
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for ArkFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArkFetcher")
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PeerError;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct CountingArk {
        subscribed: AtomicU64,
        unsubscribed: AtomicU64,
    }

    impl ArkTransport for CountingArk {
        fn subscribe(
            &self,
            _peer: &IdentityHash,
            _ark: &ArkReference,
        ) -> Result<SubscriptionHandle, PeerError> {
            let n = self.subscribed.fetch_add(1, Ordering::SeqCst);
            Ok(SubscriptionHandle(n))
        }

        fn unsubscribe(&self, _peer: &IdentityHash, _ark: &ArkReference, _handle: SubscriptionHandle) {
            self.unsubscribed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_start_is_idempotent() {
        let transport = CountingArk::default();
        let fetcher = ArkFetcher::new();
        let peer = IdentityHash::of(b"peer");
        let ark = ArkReference::new("USK@abc/ark", 4);

        assert!(fetcher.start(&transport, &peer, Some(&ark)));
        assert!(!fetcher.start(&transport, &peer, Some(&ark)));
        assert_eq!(transport.subscribed.load(Ordering::SeqCst), 1);
        assert!(fetcher.is_active());

        assert!(fetcher.stop(&transport, &peer));
        assert!(!fetcher.stop(&transport, &peer));
        assert_eq!(transport.unsubscribed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_start_without_ark_is_noop() {
        let transport = CountingArk::default();
        let fetcher = ArkFetcher::new();
        assert!(!fetcher.start(&transport, &IdentityHash::of(b"p"), None));
        assert_eq!(transport.subscribed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_edition_tracking() {
        let mut ark = ArkReference::new("USK@abc/ark", 4);
        ark.fetched(7);
        assert_eq!(ark.suggested_edition, 8);
        ark.fetched(2);
        assert_eq!(ark.suggested_edition, 8);

        assert!(!ark.update_from(&ArkReference::new("USK@abc/ark", 5)));
        assert!(ark.update_from(&ArkReference::new("USK@abc/ark", 9)));
        assert_eq!(ark.suggested_edition, 9);
        assert!(ark.update_from(&ArkReference::new("USK@new/ark", 1)));
        assert_eq!(ark.pub_uri, "USK@new/ark");
    }

    #[test]
    fn test_fetched_last_edition_saturates() {
        let mut ark = ArkReference::new("USK@abc/ark", 4);
        ark.fetched(u64::MAX);
        assert_eq!(ark.suggested_edition, u64::MAX);
    }
}
