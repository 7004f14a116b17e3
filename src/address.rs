//! Peer addresses and handshake candidates
//!
//! A peer advertises nominal addresses (`physical.udp` in its reference); we
//! also remember the address its last valid packet came from. Handshakes go
//! to a cached candidate list built from both, refreshed at most once per
//! cooldown. Building the list may resolve hostnames, so the session only
//! snapshots its addresses under its lock and resolves outside it.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};

use crate::error::PeerError;

// ============================================================================
// Address
// ============================================================================

/// One `host:port` address, optionally with a cached resolution
#[derive(Debug, Clone)]
pub struct PeerAddress {
    host: String,
    port: u16,
    resolved: Option<IpAddr>,
}

impl PeerAddress {
    /// Parse `host:port`, `a.b.c.d:port` or `[v6]:port`
    pub fn parse(s: &str) -> Result<Self, PeerError> {
        let s = s.trim();
        if let Ok(sock) = s.parse::<SocketAddr>() {
            return Ok(Self::from_socket(sock));
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| PeerError::parse(format!("address {:?} has no port", s)))?;
        let port = port
            .parse::<u16>()
            .map_err(|e| PeerError::parse(format!("address {:?}: {}", s, e)))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(PeerError::parse(format!("address {:?} has no host", s)));
        }
        Ok(Self {
            host: host.to_string(),
            port,
            resolved: host.parse::<IpAddr>().ok(),
        })
    }

    pub fn from_socket(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
            resolved: Some(addr.ip()),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.resolved
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.resolved.map(|ip| SocketAddr::new(ip, self.port))
    }

    pub fn with_port(&self, port: u16) -> Self {
        Self {
            host: self.host.clone(),
            port,
            resolved: self.resolved,
        }
    }

    /// Look the hostname up if it is not resolved yet
    pub fn resolve(&mut self, resolver: &dyn AddressResolver) -> Option<IpAddr> {
        if self.resolved.is_none() {
            self.resolved = resolver.resolve(&self.host);
            if self.resolved.is_none() {
                log::debug!("Could not resolve {}", self.host);
            }
        }
        self.resolved
    }

    /// Loopback, private, link-local or unspecified
    pub fn is_local(&self) -> bool {
        self.resolved.map(is_local_ip).unwrap_or(false)
    }
}

/// Equal when the ports match and either the resolved IPs or the hostnames do
impl PartialEq for PeerAddress {
    fn eq(&self, other: &Self) -> bool {
        if self.port != other.port {
            return false;
        }
        match (self.resolved, other.resolved) {
            (Some(a), Some(b)) if a == b => true,
            _ => self.host.eq_ignore_ascii_case(&other.host),
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

pub fn is_local_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80
        }
    }
}

// ============================================================================
// Resolution
// ============================================================================

/// DNS-style lookup, one host at a time
pub trait AddressResolver: Send + Sync {
    fn resolve(&self, host: &str) -> Option<IpAddr>;
}

/// Resolver backed by the operating system
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl AddressResolver for SystemResolver {
    fn resolve(&self, host: &str) -> Option<IpAddr> {
        match (host, 0u16).to_socket_addrs() {
            Ok(mut addrs) => addrs.next().map(|a| a.ip()),
            Err(e) => {
                log::debug!("DNS lookup for {} failed: {}", host, e);
                None
            }
        }
    }
}

// ============================================================================
// Address Set
// ============================================================================

/// Local facts that shape the candidate list
#[derive(Debug, Clone, Default)]
pub struct CandidateRules {
    /// Our own public IPs; a peer advertising one of them is on our host
    pub primary_ips: Vec<IpAddr>,
    pub allow_local_addresses: bool,
}

/// Addresses copied out from under the session lock for resolution
#[derive(Debug, Clone)]
pub struct RefreshSnapshot {
    pub nominal: Vec<PeerAddress>,
    pub detected: Option<PeerAddress>,
    /// Hostnames are not looked up (startup path)
    pub ignore_hostnames: bool,
}

/// Nominal, detected and handshake-candidate addresses of one peer
#[derive(Debug, Clone, Default)]
pub struct AddressSet {
    nominal: Vec<PeerAddress>,
    detected: Option<PeerAddress>,
    candidates: Vec<SocketAddr>,
    last_refresh_attempt: u64,
}

impl AddressSet {
    pub fn new(nominal: Vec<PeerAddress>) -> Self {
        let mut set = Self::default();
        set.replace_nominal(nominal);
        set
    }

    pub fn nominal(&self) -> &[PeerAddress] {
        &self.nominal
    }

    pub fn detected(&self) -> Option<&PeerAddress> {
        self.detected.as_ref()
    }

    pub fn candidates(&self) -> &[SocketAddr] {
        &self.candidates
    }

    /// Replace the advertised addresses, dropping duplicates; true if changed
    pub fn replace_nominal(&mut self, addrs: Vec<PeerAddress>) -> bool {
        let mut deduped: Vec<PeerAddress> = Vec::with_capacity(addrs.len());
        for addr in addrs {
            if !deduped.contains(&addr) {
                deduped.push(addr);
            }
        }
        let changed = deduped.len() != self.nominal.len()
            || deduped.iter().any(|a| !self.nominal.contains(a));
        self.nominal = deduped;
        changed
    }

    /// Record where the peer's packets come from; true if it moved
    pub fn set_detected(&mut self, addr: PeerAddress) -> bool {
        if self.detected.as_ref() == Some(&addr) {
            return false;
        }
        self.detected = Some(addr);
        self.last_refresh_attempt = 0;
        true
    }

    /// Address to talk to
    ///
    /// With `ignore_source_port`, a nominal address on the detected IP but a
    /// different port wins over the detected port (port-rewriting NATs).
    pub fn get_peer(&self, ignore_source_port: bool) -> Option<PeerAddress> {
        let detected = self.detected.as_ref()?;
        if ignore_source_port {
            if let Some(ip) = detected.ip() {
                if let Some(p) = self
                    .nominal
                    .iter()
                    .find(|p| p.ip() == Some(ip) && p.port() != detected.port())
                {
                    return Some(p.clone());
                }
            }
        }
        Some(detected.clone())
    }

    pub fn reset_refresh_cooldown(&mut self) {
        self.last_refresh_attempt = 0;
    }

    /// Start a candidate refresh if the cooldown allows
    ///
    /// A refresh that skips hostname lookups does not arm the cooldown, so
    /// the first full refresh can follow immediately.
    pub fn begin_refresh(
        &mut self,
        now: u64,
        cooldown: u64,
        ignore_hostnames: bool,
    ) -> Option<RefreshSnapshot> {
        if self.last_refresh_attempt != 0 && now.saturating_sub(self.last_refresh_attempt) < cooldown {
            return None;
        }
        if !ignore_hostnames {
            self.last_refresh_attempt = now;
        }
        Some(RefreshSnapshot {
            nominal: self.nominal.clone(),
            detected: self.detected.clone(),
            ignore_hostnames,
        })
    }

    pub fn finish_refresh(&mut self, candidates: Vec<SocketAddr>) {
        self.candidates = candidates;
    }
}

/// Build the handshake candidate list from a snapshot
///
/// Runs without the session lock; may block on DNS unless the snapshot says
/// to ignore hostnames.
pub fn compute_handshake_candidates(
    snapshot: &RefreshSnapshot,
    rules: &CandidateRules,
    resolver: &dyn AddressResolver,
) -> Vec<SocketAddr> {
    let mut ordered: Vec<PeerAddress> = Vec::new();
    let mut rewritten: Option<SocketAddr> = None;

    if snapshot.nominal.is_empty() {
        if let Some(d) = &snapshot.detected {
            ordered.push(d.clone());
        }
    } else {
        for p in &snapshot.nominal {
            if rewritten.is_none() {
                if let Some(ip) = p.ip() {
                    if rules.primary_ips.contains(&ip) {
                        rewritten = Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), p.port()));
                    }
                }
            }
            if !ordered.contains(p) {
                ordered.push(p.clone());
            }
        }
        if let Some(d) = &snapshot.detected {
            if !ordered.contains(d) {
                ordered.push(d.clone());
            }
        }
    }

    let mut out: Vec<SocketAddr> = Vec::with_capacity(ordered.len() + 1);
    if let Some(local) = rewritten {
        out.push(local);
    }
    for mut addr in ordered {
        let ip = if snapshot.ignore_hostnames {
            addr.ip()
        } else {
            addr.resolve(resolver)
        };
        let Some(ip) = ip else { continue };
        if !rules.allow_local_addresses && is_local_ip(ip) {
            log::debug!("Skipping local handshake address {}", addr);
            continue;
        }
        let sock = SocketAddr::new(ip, addr.port());
        if !out.contains(&sock) {
            out.push(sock);
        }
    }
    out
}
