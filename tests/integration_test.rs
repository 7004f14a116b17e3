//! Concurrent use of one peer session from I/O, scheduler and sender threads

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair};

use darknet_peer::ark::ArkReference;
use darknet_peer::clock::ManualClock;
use darknet_peer::identity::{encode_base64, CryptoGroup, IdentityHash};
use darknet_peer::message::{MessageFilter, PeerMessage};
use darknet_peer::noderef::sign_reference;
use darknet_peer::session_key::SessionKey;
use darknet_peer::version::NodeVersion;
use darknet_peer::{
    ArkTransport, Collaborators, FieldSet, LocalNode, PacketTransport, PeerError, PeerSession,
    PeerSetManager, PeerStatus, SessionOptions, SubscriptionHandle,
};

struct Quiet;

impl PacketTransport for Quiet {
    fn send(&self, _peer: &IdentityHash, _message: &PeerMessage) -> Result<(), PeerError> {
        Ok(())
    }

    fn wait_for(
        &self,
        _peer: &IdentityHash,
        _filter: &MessageFilter,
        _timeout: Duration,
    ) -> Result<Option<PeerMessage>, PeerError> {
        Ok(None)
    }

    fn process_outgoing(&self, _peer: &IdentityHash, _key: &Arc<SessionKey>) -> Result<(), PeerError> {
        Ok(())
    }

    fn wake_up(&self) {}
}

impl ArkTransport for Quiet {
    fn subscribe(&self, _peer: &IdentityHash, _ark: &ArkReference) -> Result<SubscriptionHandle, PeerError> {
        Ok(SubscriptionHandle(1))
    }

    fn unsubscribe(&self, _peer: &IdentityHash, _ark: &ArkReference, _handle: SubscriptionHandle) {}
}

/// Status index that counts members per status, like a real peer manager
#[derive(Default)]
struct StatusIndex {
    members: Mutex<HashMap<PeerStatus, i64>>,
    reasons: Mutex<HashMap<String, i64>>,
}

impl PeerSetManager for StatusIndex {
    fn add_peer_status(&self, status: PeerStatus, _peer: &IdentityHash) {
        *self.members.lock().entry(status).or_default() += 1;
    }
    fn remove_peer_status(&self, status: PeerStatus, _peer: &IdentityHash) {
        *self.members.lock().entry(status).or_default() -= 1;
    }
    fn add_backoff_reason(&self, reason: &str, _peer: &IdentityHash) {
        *self.reasons.lock().entry(reason.to_string()).or_default() += 1;
    }
    fn remove_backoff_reason(&self, reason: &str, _peer: &IdentityHash) {
        *self.reasons.lock().entry(reason.to_string()).or_default() -= 1;
    }
    fn peer_connected(&self, _peer: &IdentityHash) {}
    fn peer_disconnected(&self, _peer: &IdentityHash) {}
    fn write_peers(&self) {}
}

fn reference() -> FieldSet {
    let pkcs8 = Ed25519KeyPair::generate_pkcs8(&SystemRandom::new()).unwrap();
    let pair = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).unwrap();
    let mut fs = FieldSet::new();
    fs.put_single("identity", encode_base64(b"remote-peer"));
    fs.put_single("version", "Fred,0.7,1.0,1010");
    fs.put_single("lastGoodVersion", "Fred,0.7,1.0,1000");
    fs.put_single("location", "0.6");
    fs.put_single("myName", "remote");
    fs.put_single("physical.udp", "203.0.113.9:9001");
    fs.put_single("dsaGroup.p", "ff01");
    fs.put_single("dsaGroup.q", "ff02");
    fs.put_single("dsaGroup.g", "02");
    fs.put_single("dsaPubKey.y", encode_base64(pair.public_key().as_ref()));
    fs.put_single("ark.pubURI", "USK@remote/ark");
    fs.put_single("ark.number", "1");
    sign_reference(&mut fs, &pair);
    fs
}

fn session(index: Arc<StatusIndex>, clock: Arc<ManualClock>) -> PeerSession {
    let group = CryptoGroup {
        p: "ff01".into(),
        q: "ff02".into(),
        g: "02".into(),
    };
    let node = LocalNode::new(b"local", NodeVersion::new("Fred", "0.7", "1.0", 1010), 1000, group, false);
    let quiet = Arc::new(Quiet);
    let collab = Collaborators::new(quiet.clone(), quiet, index).with_clock(clock);
    PeerSession::new(&reference(), Arc::new(node), collab, SessionOptions::default()).unwrap()
}

#[test]
fn test_concurrent_events_keep_index_consistent() {
    let index = Arc::new(StatusIndex::default());
    let clock = Arc::new(ManualClock::new(10_000_000));
    let peer = Arc::new(session(index.clone(), clock.clone()));

    let mut handles = Vec::new();
    for worker in 0..4u64 {
        let peer = Arc::clone(&peer);
        let clock = Arc::clone(&clock);
        handles.push(thread::spawn(move || {
            for round in 0..200u64 {
                clock.advance(7);
                match (worker + round) % 6 {
                    0 => {
                        let boot = if round % 50 == 0 { round } else { 1 };
                        peer.completed_handshake(boot, None, vec![worker as u8; 32], false, None)
                            .unwrap();
                    }
                    1 => {
                        peer.disconnected();
                    }
                    2 => peer.local_rejected_overload("Timeout"),
                    3 => peer.success_not_overload(),
                    4 => {
                        let _ = peer.send_async(vec![1; 64], None);
                        peer.grab_queued_messages();
                    }
                    _ => {
                        if peer.should_send_handshake() {
                            peer.sent_handshake();
                        }
                        peer.update_status();
                    }
                }
                assert!(!peer.check_connection_invariants());
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    // Exactly one status registered, and it is the session's
    let members = index.members.lock();
    let registered: Vec<_> = members.iter().filter(|(_, n)| **n != 0).collect();
    assert_eq!(registered.len(), 1);
    assert_eq!(*registered[0].0, peer.status());
    assert_eq!(*registered[0].1, 1);
    assert!(index.reasons.lock().values().all(|n| *n == 0 || *n == 1));
}

#[test]
fn test_snapshot_serializes() {
    let index = Arc::new(StatusIndex::default());
    let clock = Arc::new(ManualClock::new(5_000));
    let peer = session(index, clock);
    peer.completed_handshake(42, None, vec![0; 32], false, None).unwrap();

    let json = serde_json::to_value(peer.snapshot()).unwrap();
    assert_eq!(json["status"], "CONNECTED");
    assert_eq!(json["boot_id"], 42);
    assert_eq!(json["name"], "remote");
    assert!(peer.render_metrics().contains("darknet_peer_connections_total"));
}
