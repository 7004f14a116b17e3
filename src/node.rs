//! The local node as seen by its peer sessions

use std::net::IpAddr;
use std::sync::Arc;

use ring::rand::{SecureRandom, SystemRandom};

use crate::address::CandidateRules;
use crate::config::PeerConfig;
use crate::error::PeerError;
use crate::identity::{CryptoGroup, IdentityHash};
use crate::version::NodeVersion;

/// Facts about ourselves that every peer session consults
#[derive(Debug, Clone)]
pub struct LocalNode {
    pub identity_hash: IdentityHash,
    pub identity_hash_hash: IdentityHash,
    pub testnet: bool,
    pub version: NodeVersion,
    /// Oldest peer build we still talk to
    pub last_good_build: u32,
    /// Our own public IPs
    pub primary_ips: Vec<IpAddr>,
    pub crypto_group: Arc<CryptoGroup>,
    /// Negotiation types we support, in preference order (last is best)
    pub supported_neg_types: Vec<i32>,
    /// Our keyspace location, announced to peers on connect
    pub location: Option<f64>,
    pub config: PeerConfig,
}

impl LocalNode {
    pub fn new(
        identity: &[u8],
        version: NodeVersion,
        last_good_build: u32,
        crypto_group: CryptoGroup,
        testnet: bool,
    ) -> Self {
        let identity_hash = IdentityHash::of(identity);
        let identity_hash_hash = IdentityHash::of(identity_hash.as_bytes());
        Self {
            identity_hash,
            identity_hash_hash,
            testnet,
            version,
            last_good_build,
            primary_ips: Vec::new(),
            crypto_group: Arc::new(crypto_group),
            supported_neg_types: vec![0],
            location: None,
            config: PeerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: PeerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_primary_ips(mut self, ips: Vec<IpAddr>) -> Self {
        self.primary_ips = ips;
        self
    }

    pub fn with_neg_types(mut self, types: Vec<i32>) -> Self {
        self.supported_neg_types = types;
        self
    }

    pub fn with_location(mut self, location: f64) -> Self {
        self.location = Some(location);
        self
    }

    /// Share our group allocation when the peer uses the same parameters
    pub fn share_group(&self, group: CryptoGroup) -> Arc<CryptoGroup> {
        if *self.crypto_group == group {
            Arc::clone(&self.crypto_group)
        } else {
            Arc::new(group)
        }
    }

    pub fn candidate_rules(&self, allow_local_addresses: bool) -> CandidateRules {
        CandidateRules {
            primary_ips: self.primary_ips.clone(),
            allow_local_addresses,
        }
    }
}

/// Random boot session id, chosen once per process start
pub fn generate_boot_id() -> Result<u64, PeerError> {
    let rng = SystemRandom::new();
    let mut buf = [0u8; 8];
    rng.fill(&mut buf)
        .map_err(|_| PeerError::Crypto("SystemRandom failed".into()))?;
    Ok(u64::from_ne_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group() -> CryptoGroup {
        CryptoGroup {
            p: "p".into(),
            q: "q".into(),
            g: "g".into(),
        }
    }

    #[test]
    fn test_group_sharing() {
        let node = LocalNode::new(b"me", NodeVersion::new("Fred", "0.7", "1.0", 1010), 1000, group(), false);
        let shared = node.share_group(group());
        assert!(Arc::ptr_eq(&shared, &node.crypto_group));

        let other = node.share_group(CryptoGroup { g: "h".into(), ..group() });
        assert!(!Arc::ptr_eq(&other, &node.crypto_group));
    }

    #[test]
    fn test_boot_ids_differ() {
        assert_ne!(generate_boot_id().unwrap(), generate_boot_id().unwrap());
    }
}
