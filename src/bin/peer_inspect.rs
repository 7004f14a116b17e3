//! Offline peer inspector
//!
//! Loads a stored peer record (reference fields plus an optional
//! `metadata.` subset) and prints the session state it would start in,
//! as JSON. Nothing is sent; every collaborator is a no-op.
//!
//! Usage: peer-inspect <peer-file> [--testnet] [--config <json-file>]

use std::sync::Arc;
use std::time::Duration;

use darknet_peer::ark::ArkReference;
use darknet_peer::identity::{CryptoGroup, IdentityHash};
use darknet_peer::message::{MessageFilter, PeerMessage};
use darknet_peer::session_key::SessionKey;
use darknet_peer::version::NodeVersion;
use darknet_peer::{
    ArkTransport, Collaborators, FieldSet, LocalNode, PacketTransport, PeerConfig, PeerError,
    PeerSession, PeerSetManager, PeerStatus, SessionOptions, SubscriptionHandle,
};

/// Identity the inspector pretends to have
const INSPECTOR_IDENTITY: &[u8] = b"peer-inspect";

// ============================================================================
// Offline Collaborators
// ============================================================================

struct Offline;

impl PacketTransport for Offline {
    fn send(&self, _peer: &IdentityHash, message: &PeerMessage) -> Result<(), PeerError> {
        log::debug!("Dropping {} (offline)", message.kind());
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

impl ArkTransport for Offline {
    fn subscribe(&self, _peer: &IdentityHash, _ark: &ArkReference) -> Result<SubscriptionHandle, PeerError> {
        Err(PeerError::WouldBlock)
    }

    fn unsubscribe(&self, _peer: &IdentityHash, _ark: &ArkReference, _handle: SubscriptionHandle) {}
}

impl PeerSetManager for Offline {
    fn add_peer_status(&self, status: PeerStatus, peer: &IdentityHash) {
        log::debug!("{} -> {}", peer.short(), status);
    }
    fn remove_peer_status(&self, _status: PeerStatus, _peer: &IdentityHash) {}
    fn add_backoff_reason(&self, _reason: &str, _peer: &IdentityHash) {}
    fn remove_backoff_reason(&self, _reason: &str, _peer: &IdentityHash) {}
    fn peer_connected(&self, _peer: &IdentityHash) {}
    fn peer_disconnected(&self, _peer: &IdentityHash) {}
    fn write_peers(&self) {}
}

// ============================================================================
// Main
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    let args: Vec<String> = std::env::args().collect();

    // <peer-file>          Stored peer record
    // --testnet            Inspect as a testnet node
    // --config <file>      JSON overrides for PeerConfig
    let Some(path) = args.get(1).filter(|a| !a.starts_with("--")) else {
        eprintln!("Usage: {} <peer-file> [--testnet] [--config <json-file>]", args[0]);
        std::process::exit(2);
    };
    let testnet = args.iter().any(|a| a == "--testnet");
    let config = match args.iter().position(|a| a == "--config") {
        Some(i) => {
            let file = args.get(i + 1).ok_or("--config needs a file")?;
            PeerConfig::from_json(&std::fs::read_to_string(file)?)?
        }
        None => PeerConfig::default(),
    };

    let mut record = FieldSet::parse(&std::fs::read_to_string(path)?)?;
    let metadata = record.subset("metadata");
    record.remove_subset("metadata");

    // Pretend to run the peer's own version so the record is judged on its own
    let version: NodeVersion = match record.get("version") {
        Some(v) => v.parse()?,
        None => NodeVersion::new("Fred", "0.7", "1.0", 0),
    };
    let group = match record.subset("dsaGroup") {
        Some(fs) => CryptoGroup::from_fieldset(&fs)?,
        None => return Err("record has no dsaGroup".into()),
    };
    let last_good = version.build;
    let node = LocalNode::new(INSPECTOR_IDENTITY, version, last_good, group, testnet).with_config(config);

    let offline = Arc::new(Offline);
    let collab = Collaborators::new(offline.clone(), offline.clone(), offline);
    let options = SessionOptions {
        from_local: true,
        metadata,
        ..Default::default()
    };

    let session = PeerSession::new(&record, Arc::new(node), collab, options)?;
    log::info!("Loaded peer {} from {}", session.hash().short(), path);
    println!("{}", serde_json::to_string_pretty(&session.snapshot())?);
    Ok(())
}
