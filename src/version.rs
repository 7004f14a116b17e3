//! Protocol version strings and compatibility checks
//!
//! Versions are advertised as `name,series,protocol,build`, e.g.
//! `Fred,0.7,1.0,1010`. Two nodes can talk when the name and protocol match
//! and each side's build is at least the other's minimum acceptable build.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::PeerError;

/// Parsed version string
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeVersion {
    pub name: String,
    pub series: String,
    pub protocol: String,
    pub build: u32,
}

impl NodeVersion {
    pub fn new(name: &str, series: &str, protocol: &str, build: u32) -> Self {
        Self {
            name: name.to_string(),
            series: series.to_string(),
            protocol: protocol.to_string(),
            build,
        }
    }

    fn same_network(&self, other: &NodeVersion) -> bool {
        self.name == other.name && self.protocol == other.protocol
    }
}

impl FromStr for NodeVersion {
    type Err = PeerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(',').collect();
        if parts.len() != 4 || parts[..3].iter().any(|p| p.is_empty()) {
            return Err(PeerError::parse(format!("bad version string {:?}", s)));
        }
        let build = parts[3]
            .parse::<u32>()
            .map_err(|e| PeerError::parse(format!("bad build in {:?}: {}", s, e)))?;
        Ok(NodeVersion::new(parts[0], parts[1], parts[2], build))
    }
}

impl fmt::Display for NodeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.name, self.series, self.protocol, self.build)
    }
}

/// Is the peer's version acceptable to us?
///
/// `false` means the peer is too old for us.
pub fn check_good_version(peer: &NodeVersion, local: &NodeVersion, local_last_good_build: u32) -> bool {
    peer.same_network(local) && peer.build >= local_last_good_build
}

/// Are we acceptable to the peer, judged by its advertised minimum?
///
/// `false` means we are too new for the peer to understand. A peer that
/// advertises no minimum accepts everything.
pub fn check_arbitrary_good_version(ours: &NodeVersion, peer_last_good: Option<&NodeVersion>) -> bool {
    match peer_last_good {
        None => true,
        Some(min) => ours.same_network(min) && ours.build >= min.build,
    }
}
