//! Node references and local metadata records
//!
//! A node reference describes a peer: identity, addresses, version, keys and
//! ARK pointer, signed by the peer. Metadata is our own bookkeeping about the
//! peer and is never exchanged.
//!
//! # Reference fields
//!
//! | Field | Notes |
//! |---|---|
//! | `identity` | base64, required |
//! | `version`, `lastGoodVersion` | `name,series,protocol,build` |
//! | `location` | keyspace position in `[0, 1]` |
//! | `physical.udp` | repeatable `host:port` |
//! | `testnet` | must match ours |
//! | `auth.negTypes` | integer list, defaults to `0` |
//! | `dsaGroup.*`, `dsaPubKey.*` | key group and signing key |
//! | `ark.pubURI`, `ark.number` | number is the edition minus one |
//! | `myName` | display name |
//! | `sig` | base64 Ed25519 over SHA-256 of the rest |

use ring::digest::{digest, SHA256};
use ring::signature::Ed25519KeyPair;
use serde::Serialize;

use crate::address::PeerAddress;
use crate::ark::ArkReference;
use crate::error::PeerError;
use crate::fieldset::FieldSet;
use crate::identity::{decode_base64, encode_base64, CryptoGroup, PeerPublicKey};
use crate::version::NodeVersion;

/// Handshake payload prefix: plain reference text follows
pub const REF_PLAIN: u8 = 0;

/// Handshake payload prefix: compressed reference follows
pub const REF_COMPRESSED: u8 = 1;

// ============================================================================
// Parsing Context
// ============================================================================

/// Why a reference is being parsed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsePurpose {
    /// Creating a new peer; location and name are required
    Construct,
    /// Replacing a known peer's reference; version is required
    Update,
    /// Delivered by an ARK fetch; version and location may be absent
    Ark,
}

#[derive(Debug, Clone, Copy)]
pub struct ParseContext {
    pub purpose: ParsePurpose,
    /// Our own testnet flag
    pub testnet: bool,
    /// Read from our own peer store; signature is not checked
    pub from_local: bool,
    /// Loading at startup; refetch the stored ARK edition
    pub on_startup: bool,
}

impl ParseContext {
    pub fn new(purpose: ParsePurpose, testnet: bool) -> Self {
        Self {
            purpose,
            testnet,
            from_local: false,
            on_startup: false,
        }
    }

    pub fn from_local(mut self) -> Self {
        self.from_local = true;
        self
    }

    pub fn on_startup(mut self) -> Self {
        self.on_startup = true;
        self
    }
}

// ============================================================================
// Node Reference
// ============================================================================

#[derive(Debug, Clone)]
pub struct NodeReference {
    pub identity: Vec<u8>,
    pub version: Option<NodeVersion>,
    pub last_good_version: Option<NodeVersion>,
    pub location: Option<f64>,
    pub addresses: Vec<PeerAddress>,
    pub testnet: bool,
    pub neg_types: Vec<i32>,
    pub group: CryptoGroup,
    pub public_key: PeerPublicKey,
    pub ark: Option<ArkReference>,
    pub name: Option<String>,
    pub signature: Option<String>,
}

impl NodeReference {
    pub fn parse(fs: &FieldSet, ctx: ParseContext) -> Result<Self, PeerError> {
        let identity = decode_base64(
            fs.get("identity")
                .ok_or_else(|| PeerError::parse("no identity"))?,
        )?;
        if identity.is_empty() {
            return Err(PeerError::parse("empty identity"));
        }

        let testnet = fs.get_bool("testnet", false);
        if testnet != ctx.testnet {
            return Err(PeerError::TestnetMismatch {
                peer: testnet,
                local: ctx.testnet,
            });
        }

        let version = fs.get("version").map(str::parse::<NodeVersion>).transpose()?;
        if version.is_none() && ctx.purpose == ParsePurpose::Update {
            return Err(PeerError::parse("no version"));
        }
        let last_good_version = fs
            .get("lastGoodVersion")
            .map(str::parse::<NodeVersion>)
            .transpose()?;

        let location = fs.get_f64("location")?;
        if let Some(loc) = location {
            if !(0.0..=1.0).contains(&loc) {
                return Err(PeerError::parse(format!("location {} out of range", loc)));
            }
        }
        let name = fs.get("myName").map(str::to_string);
        if ctx.purpose == ParsePurpose::Construct {
            if location.is_none() {
                return Err(PeerError::parse("no location"));
            }
            if name.is_none() {
                return Err(PeerError::parse("no name"));
            }
        }

        let mut addresses: Vec<PeerAddress> = Vec::new();
        for raw in fs.get_all("physical.udp") {
            match PeerAddress::parse(&raw) {
                Ok(addr) => {
                    if !addresses.contains(&addr) {
                        addresses.push(addr);
                    }
                }
                Err(e) => log::warn!("Invalid physical.udp {:?}: {}", raw, e),
            }
        }

        let neg_types = fs.get_int_array("auth.negTypes")?.unwrap_or_else(|| vec![0]);

        let group = CryptoGroup::from_fieldset(
            &fs.subset("dsaGroup")
                .ok_or_else(|| PeerError::parse("no dsaGroup"))?,
        )?;
        let public_key = PeerPublicKey::from_fieldset(
            &fs.subset("dsaPubKey")
                .ok_or_else(|| PeerError::parse("no dsaPubKey"))?,
        )?;

        let signature = fs.get("sig").map(str::to_string);
        if !ctx.from_local {
            verify_reference(fs, &public_key)?;
        }

        let ark = parse_ark(fs, ctx.on_startup)?;

        Ok(NodeReference {
            identity,
            version,
            last_good_version,
            location,
            addresses,
            testnet,
            neg_types,
            group,
            public_key,
            ark,
            name,
            signature,
        })
    }

    /// Serialize, including the stored signature if there is one
    pub fn to_fieldset(&self) -> FieldSet {
        let mut fs = FieldSet::new();
        fs.put_single("identity", encode_base64(&self.identity));
        if let Some(v) = &self.version {
            fs.put_single("version", v.to_string());
        }
        if let Some(v) = &self.last_good_version {
            fs.put_single("lastGoodVersion", v.to_string());
        }
        if let Some(loc) = self.location {
            fs.put_single("location", loc.to_string());
        }
        for addr in &self.addresses {
            fs.put_append("physical.udp", addr.to_string());
        }
        fs.put_single("testnet", self.testnet.to_string());
        for t in &self.neg_types {
            fs.put_append("auth.negTypes", t.to_string());
        }
        fs.put_subset("dsaGroup", &self.group.to_fieldset());
        fs.put_subset("dsaPubKey", &self.public_key.to_fieldset());
        if let Some(ark) = &self.ark {
            fs.put_single("ark.pubURI", ark.pub_uri.clone());
            fs.put_single("ark.number", ark.suggested_edition.saturating_sub(1).to_string());
        }
        if let Some(name) = &self.name {
            fs.put_single("myName", name.clone());
        }
        if let Some(sig) = &self.signature {
            fs.put_single("sig", sig.clone());
        }
        fs
    }
}

fn parse_ark(fs: &FieldSet, on_startup: bool) -> Result<Option<ArkReference>, PeerError> {
    let Some(uri) = fs.get("ark.pubURI") else {
        return Ok(None);
    };
    // ark.number is the edition this reference came from; we want the next
    // one, except at startup where the stored edition is refetched
    let number = fs.get_u64("ark.number")?.unwrap_or(0);
    let edition = if on_startup {
        number
    } else {
        number
            .checked_add(1)
            .ok_or_else(|| PeerError::parse("ark.number overflow"))?
    };
    Ok(Some(ArkReference::new(uri, edition)))
}

/// Digest the signature covers
fn signing_digest(fs: &FieldSet) -> Vec<u8> {
    digest(&SHA256, fs.to_ordered_string_without("sig").as_bytes())
        .as_ref()
        .to_vec()
}

/// Check `sig` against the reference's own content
pub fn verify_reference(fs: &FieldSet, key: &PeerPublicKey) -> Result<(), PeerError> {
    let sig = fs
        .get("sig")
        .ok_or_else(|| PeerError::Signature("no signature".into()))?;
    let sig = decode_base64(sig).map_err(|e| PeerError::Signature(e.to_string()))?;
    if key.verify(&signing_digest(fs), &sig) {
        Ok(())
    } else {
        Err(PeerError::Signature("signature does not match".into()))
    }
}

/// Sign our own exported reference in place
pub fn sign_reference(fs: &mut FieldSet, key_pair: &Ed25519KeyPair) {
    fs.remove("sig");
    let sig = key_pair.sign(&signing_digest(fs));
    fs.put_single("sig", encode_base64(sig.as_ref()));
}

/// Unwrap a reference received inside a handshake
///
/// The first byte says how the rest is encoded. Compressed references are
/// not supported.
pub fn parse_handshake_reference(data: &[u8]) -> Result<FieldSet, PeerError> {
    let (&kind, body) = data
        .split_first()
        .ok_or_else(|| PeerError::parse("empty reference"))?;
    match kind {
        REF_PLAIN => {
            let text = std::str::from_utf8(body)
                .map_err(|e| PeerError::parse(format!("reference is not UTF-8: {}", e)))?;
            FieldSet::parse(text)
        }
        REF_COMPRESSED => Err(PeerError::parse("compressed references are not supported")),
        other => Err(PeerError::parse(format!("unknown reference encoding {}", other))),
    }
}

// ============================================================================
// Metadata
// ============================================================================

/// Local-only facts about a peer, persisted alongside its reference
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PeerMetadata {
    pub detected: Option<String>,
    pub time_last_received_packet: u64,
    pub time_last_connected: u64,
    pub time_last_routable: u64,
    pub peer_added_time: u64,
    pub never_connected: bool,
    pub disabled: bool,
    pub listen_only: bool,
    pub burst_only: bool,
    pub ignore_source_port: bool,
    pub allow_local_addresses: bool,
    pub had_routable_connection_count: u64,
    pub routable_connection_check_count: u64,
}

impl PeerMetadata {
    /// Parse a stored metadata record
    ///
    /// Missing connect/routable times fall back to the last packet time.
    /// The peer-added time only survives for never-connected peers younger
    /// than `added_expiry`.
    pub fn from_fieldset(fs: &FieldSet, now: u64, added_expiry: u64) -> Result<Self, PeerError> {
        let last_received = fs.get_u64("timeLastReceivedPacket")?.unwrap_or(0);
        let never_connected = fs.get_bool("neverConnected", false);
        let mut peer_added_time = fs.get_u64("peerAddedTime")?.unwrap_or(0);
        if !never_connected || now.saturating_sub(peer_added_time) > added_expiry {
            peer_added_time = 0;
        }

        let detected = match fs.get("detected.udp") {
            Some(raw) => match PeerAddress::parse(raw) {
                Ok(addr) => Some(addr.to_string()),
                Err(e) => {
                    log::warn!("Ignoring bad detected.udp {:?}: {}", raw, e);
                    None
                }
            },
            None => None,
        };

        Ok(PeerMetadata {
            detected,
            time_last_received_packet: last_received,
            time_last_connected: fs.get_u64("timeLastConnected")?.unwrap_or(last_received),
            time_last_routable: fs.get_u64("timeLastRoutable")?.unwrap_or(last_received),
            peer_added_time,
            never_connected,
            disabled: fs.get_bool("isDisabled", false),
            listen_only: fs.get_bool("isListenOnly", false),
            burst_only: fs.get_bool("isBurstOnly", false),
            ignore_source_port: fs.get_bool("ignoreSourcePort", false),
            allow_local_addresses: fs.get_bool("allowLocalAddresses", false),
            had_routable_connection_count: fs.get_u64("hadRoutableConnectionCount")?.unwrap_or(0),
            routable_connection_check_count: fs.get_u64("routableConnectionCheckCount")?.unwrap_or(0),
        })
    }

    pub fn to_fieldset(&self) -> FieldSet {
        let mut fs = FieldSet::new();
        if let Some(d) = &self.detected {
            fs.put_single("detected.udp", d.clone());
        }
        if self.time_last_received_packet > 0 {
            fs.put_single("timeLastReceivedPacket", self.time_last_received_packet.to_string());
        }
        if self.time_last_connected > 0 {
            fs.put_single("timeLastConnected", self.time_last_connected.to_string());
        }
        if self.time_last_routable > 0 {
            fs.put_single("timeLastRoutable", self.time_last_routable.to_string());
        }
        if self.peer_added_time > 0 {
            fs.put_single("peerAddedTime", self.peer_added_time.to_string());
        }
        if self.never_connected {
            fs.put_single("neverConnected", "true");
        }
        let flags = [
            ("isDisabled", self.disabled),
            ("isListenOnly", self.listen_only),
            ("isBurstOnly", self.burst_only),
            ("ignoreSourcePort", self.ignore_source_port),
            ("allowLocalAddresses", self.allow_local_addresses),
        ];
        for (key, set) in flags {
            if set {
                fs.put_single(key, "true");
            }
        }
        if self.had_routable_connection_count > 0 {
            fs.put_single("hadRoutableConnectionCount", self.had_routable_connection_count.to_string());
        }
        if self.routable_connection_check_count > 0 {
            fs.put_single(
                "routableConnectionCheckCount",
                self.routable_connection_check_count.to_string(),
            );
        }
        fs
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ring::rand::SystemRandom;
    use ring::signature::KeyPair;

    pub(crate) fn key_pair() -> Ed25519KeyPair {
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&SystemRandom::new()).unwrap();
        Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).unwrap()
    }

    pub(crate) fn signed_reference(pair: &Ed25519KeyPair, identity: &[u8]) -> FieldSet {
        let mut fs = FieldSet::new();
        fs.put_single("identity", encode_base64(identity));
        fs.put_single("version", "Fred,0.7,1.0,1010");
        fs.put_single("lastGoodVersion", "Fred,0.7,1.0,1000");
        fs.put_single("location", "0.25");
        fs.put_append("physical.udp", "203.0.113.5:9001");
        fs.put_append("physical.udp", "198.51.100.7:9001");
        fs.put_single("testnet", "false");
        fs.put_single("auth.negTypes", "0");
        fs.put_single("dsaGroup.p", "ff01");
        fs.put_single("dsaGroup.q", "ff02");
        fs.put_single("dsaGroup.g", "02");
        fs.put_single("dsaPubKey.y", encode_base64(pair.public_key().as_ref()));
        fs.put_single("ark.pubURI", "USK@abc/ark");
        fs.put_single("ark.number", "4");
        fs.put_single("myName", "peer-one");
        sign_reference(&mut fs, pair);
        fs
    }

    #[test]
    fn test_parse_signed_reference() {
        let pair = key_pair();
        let fs = signed_reference(&pair, b"peer-one-identity");
        let r = NodeReference::parse(&fs, ParseContext::new(ParsePurpose::Construct, false)).unwrap();
        assert_eq!(r.identity, b"peer-one-identity");
        assert_eq!(r.location, Some(0.25));
        assert_eq!(r.addresses.len(), 2);
        assert_eq!(r.neg_types, vec![0]);
        assert_eq!(r.ark.as_ref().unwrap().suggested_edition, 5);
        assert_eq!(r.version.as_ref().unwrap().build, 1010);
    }

    #[test]
    fn test_tampered_reference_rejected() {
        let pair = key_pair();
        let mut fs = signed_reference(&pair, b"peer");
        fs.put_single("location", "0.75");
        let err = NodeReference::parse(&fs, ParseContext::new(ParsePurpose::Construct, false)).unwrap_err();
        assert!(matches!(err, PeerError::Signature(_)));

        // Trusted local storage skips the check
        assert!(NodeReference::parse(&fs, ParseContext::new(ParsePurpose::Construct, false).from_local()).is_ok());
    }

    #[test]
    fn test_missing_signature_rejected() {
        let pair = key_pair();
        let mut fs = signed_reference(&pair, b"peer");
        fs.remove("sig");
        assert!(matches!(
            NodeReference::parse(&fs, ParseContext::new(ParsePurpose::Update, false)),
            Err(PeerError::Signature(_))
        ));
    }

    #[test]
    fn test_testnet_mismatch() {
        let pair = key_pair();
        let fs = signed_reference(&pair, b"peer");
        assert_eq!(
            NodeReference::parse(&fs, ParseContext::new(ParsePurpose::Construct, true)).unwrap_err(),
            PeerError::TestnetMismatch { peer: false, local: true }
        );
    }

    #[test]
    fn test_required_fields_by_purpose() {
        let pair = key_pair();
        let mut fs = signed_reference(&pair, b"peer");
        fs.remove("version");
        fs.remove("location");
        sign_reference(&mut fs, &pair);
        let ctx = |p| ParseContext::new(p, false);
        assert!(NodeReference::parse(&fs, ctx(ParsePurpose::Ark)).is_ok());
        assert!(NodeReference::parse(&fs, ctx(ParsePurpose::Update)).is_err());
        assert!(NodeReference::parse(&fs, ctx(ParsePurpose::Construct)).is_err());

        let mut fs = signed_reference(&pair, b"peer");
        fs.remove_subset("dsaPubKey");
        assert!(NodeReference::parse(&fs, ctx(ParsePurpose::Construct).from_local()).is_err());
    }

    #[test]
    fn test_export_reparse_preserves_identity_location_addresses() {
        let pair = key_pair();
        let fs = signed_reference(&pair, b"peer");
        let ctx = ParseContext::new(ParsePurpose::Construct, false);
        let first = NodeReference::parse(&fs, ctx).unwrap();
        let exported = first.to_fieldset();
        let second = NodeReference::parse(&exported, ctx).unwrap();
        assert_eq!(second.identity, first.identity);
        assert_eq!(second.location, first.location);
        assert_eq!(second.addresses.len(), first.addresses.len());
        assert!(first.addresses.iter().all(|a| second.addresses.contains(a)));
        // ark.number is exported as edition - 1, then bumped again
        assert_eq!(exported.get("ark.number"), Some("4"));
    }

    #[test]
    fn test_startup_ark_edition() {
        let pair = key_pair();
        let fs = signed_reference(&pair, b"peer");
        let r = NodeReference::parse(
            &fs,
            ParseContext::new(ParsePurpose::Construct, false).from_local().on_startup(),
        )
        .unwrap();
        assert_eq!(r.ark.unwrap().suggested_edition, 4);
    }

    #[test]
    fn test_ark_number_overflow_rejected() {
        let pair = key_pair();
        let mut fs = signed_reference(&pair, b"peer");
        fs.put_single("ark.number", u64::MAX.to_string());
        sign_reference(&mut fs, &pair);

        let err = NodeReference::parse(&fs, ParseContext::new(ParsePurpose::Construct, false)).unwrap_err();
        assert!(matches!(err, PeerError::Parse(_)));

        // The stored edition is refetched as-is at startup
        let r = NodeReference::parse(
            &fs,
            ParseContext::new(ParsePurpose::Construct, false).from_local().on_startup(),
        )
        .unwrap();
        assert_eq!(r.ark.unwrap().suggested_edition, u64::MAX);
    }

    #[test]
    fn test_handshake_reference_prefix() {
        let mut data = vec![REF_PLAIN];
        data.extend_from_slice(b"identity=abc\nEnd\n");
        assert_eq!(parse_handshake_reference(&data).unwrap().get("identity"), Some("abc"));

        assert!(parse_handshake_reference(&[REF_COMPRESSED, 1, 2]).is_err());
        assert!(parse_handshake_reference(&[7]).is_err());
        assert!(parse_handshake_reference(&[]).is_err());
    }

    #[test]
    fn test_metadata_rules() {
        let mut fs = FieldSet::new();
        fs.put_single("timeLastReceivedPacket", "5000");
        fs.put_single("peerAddedTime", "1000");
        fs.put_single("neverConnected", "true");
        fs.put_single("isBurstOnly", "true");
        fs.put_single("detected.udp", "203.0.113.5:9001");

        let meta = PeerMetadata::from_fieldset(&fs, 2_000, 30_000).unwrap();
        assert_eq!(meta.time_last_connected, 5_000);
        assert_eq!(meta.time_last_routable, 5_000);
        assert_eq!(meta.peer_added_time, 1_000);
        assert!(meta.burst_only);
        assert_eq!(meta.detected.as_deref(), Some("203.0.113.5:9001"));

        // Expired
        let meta = PeerMetadata::from_fieldset(&fs, 100_000, 30_000).unwrap();
        assert_eq!(meta.peer_added_time, 0);

        // Connected peers forget it
        fs.put_single("neverConnected", "false");
        let meta = PeerMetadata::from_fieldset(&fs, 2_000, 30_000).unwrap();
        assert_eq!(meta.peer_added_time, 0);

        let reparsed = PeerMetadata::from_fieldset(&meta.to_fieldset(), 2_000, 30_000).unwrap();
        assert_eq!(reparsed, meta);
    }
}
