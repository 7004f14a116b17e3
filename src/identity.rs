//! Peer identity and handshake setup ciphers
//!
//! A peer is known by its raw identity bytes. Everything else is derived:
//! the identity hash (SHA-256 of the raw bytes), the hash of that hash, and
//! the two setup-cipher keys used to encrypt handshake packets before any
//! session key exists.
//!
//! # Setup keys
//!
//! ```text
//! incoming = local.identity_hash      XOR peer.identity_hash_hash
//! outgoing = local.identity_hash_hash XOR peer.identity_hash
//! ```
//!
//! The peer computes the mirror image, so our outgoing key is its incoming key.

use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::digest::{digest, SHA256};
use ring::rand::{SecureRandom, SystemRandom};
use ring::signature::{UnparsedPublicKey, ED25519};

use crate::error::PeerError;
use crate::fieldset::FieldSet;

/// Length of an identity hash in bytes
pub const HASH_LEN: usize = 32;

/// Length of an Ed25519 public key in bytes
pub const PUBLIC_KEY_LEN: usize = 32;

// ============================================================================
// Hashes
// ============================================================================

/// SHA-256 digest used to key peers
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityHash([u8; HASH_LEN]);

impl IdentityHash {
    pub fn of(data: &[u8]) -> Self {
        let d = digest(&SHA256, data);
        let mut out = [0u8; HASH_LEN];
        out.copy_from_slice(d.as_ref());
        IdentityHash(out)
    }

    pub fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        IdentityHash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Byte-wise XOR, used to derive setup keys
    pub fn xor(&self, other: &IdentityHash) -> [u8; HASH_LEN] {
        let mut out = [0u8; HASH_LEN];
        for (i, b) in out.iter_mut().enumerate() {
            *b = self.0[i] ^ other.0[i];
        }
        out
    }

    /// First four bytes in hex, for log lines
    pub fn short(&self) -> String {
        hex(&self.0[..4])
    }
}

impl fmt::Display for IdentityHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex(&self.0))
    }
}

impl fmt::Debug for IdentityHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityHash({})", self.short())
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

// ============================================================================
// Crypto Group and Public Key
// ============================================================================

/// Network-wide key group parameters, shared read-only between peers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoGroup {
    pub p: String,
    pub q: String,
    pub g: String,
}

impl CryptoGroup {
    pub fn from_fieldset(fs: &FieldSet) -> Result<Self, PeerError> {
        let field = |k: &str| {
            fs.get(k)
                .map(str::to_string)
                .ok_or_else(|| PeerError::parse(format!("dsaGroup.{} missing", k)))
        };
        Ok(CryptoGroup {
            p: field("p")?,
            q: field("q")?,
            g: field("g")?,
        })
    }

    pub fn to_fieldset(&self) -> FieldSet {
        let mut fs = FieldSet::new();
        fs.put_single("p", self.p.clone());
        fs.put_single("q", self.q.clone());
        fs.put_single("g", self.g.clone());
        fs
    }
}

/// Ed25519 key that signs the peer's node references
#[derive(Clone, PartialEq, Eq)]
pub struct PeerPublicKey {
    bytes: [u8; PUBLIC_KEY_LEN],
}

impl PeerPublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PeerError> {
        if bytes.len() != PUBLIC_KEY_LEN {
            return Err(PeerError::parse(format!(
                "public key must be {} bytes, got {}",
                PUBLIC_KEY_LEN,
                bytes.len()
            )));
        }
        let mut out = [0u8; PUBLIC_KEY_LEN];
        out.copy_from_slice(bytes);
        Ok(PeerPublicKey { bytes: out })
    }

    pub fn from_fieldset(fs: &FieldSet) -> Result<Self, PeerError> {
        let y = fs
            .get("y")
            .ok_or_else(|| PeerError::parse("dsaPubKey.y missing"))?;
        Self::from_bytes(&decode_base64(y)?)
    }

    pub fn to_fieldset(&self) -> FieldSet {
        let mut fs = FieldSet::new();
        fs.put_single("y", encode_base64(&self.bytes));
        fs
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Verify `signature` over `message`
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        UnparsedPublicKey::new(&ED25519, &self.bytes)
            .verify(message, signature)
            .is_ok()
    }
}

impl fmt::Debug for PeerPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerPublicKey({})", hex(&self.bytes[..4]))
    }
}

// ============================================================================
// Peer Identity
// ============================================================================

/// Immutable identity of a remote peer
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    raw: Vec<u8>,
    hash: IdentityHash,
    hash_hash: IdentityHash,
    group: Arc<CryptoGroup>,
    public_key: PeerPublicKey,
}

impl PeerIdentity {
    pub fn new(raw: Vec<u8>, group: Arc<CryptoGroup>, public_key: PeerPublicKey) -> Self {
        let hash = IdentityHash::of(&raw);
        let hash_hash = IdentityHash::of(hash.as_bytes());
        Self {
            raw,
            hash,
            hash_hash,
            group,
            public_key,
        }
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn hash(&self) -> &IdentityHash {
        &self.hash
    }

    pub fn hash_hash(&self) -> &IdentityHash {
        &self.hash_hash
    }

    pub fn group(&self) -> &Arc<CryptoGroup> {
        &self.group
    }

    pub fn public_key(&self) -> &PeerPublicKey {
        &self.public_key
    }

    /// Same raw identity bytes
    pub fn same_identity(&self, raw: &[u8]) -> bool {
        self.raw == raw
    }
}

pub fn encode_base64(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn decode_base64(text: &str) -> Result<Vec<u8>, PeerError> {
    URL_SAFE_NO_PAD
        .decode(text.trim())
        .map_err(|e| PeerError::parse(format!("bad base64: {}", e)))
}

// ============================================================================
// Setup Ciphers
// ============================================================================

/// AES-256-GCM cipher protecting handshake packets
pub struct SetupCipher {
    key: LessSafeKey,
}

impl SetupCipher {
    pub fn from_key(key: &[u8; HASH_LEN]) -> Result<Self, PeerError> {
        let unbound = UnboundKey::new(&AES_256_GCM, key)
            .map_err(|_| PeerError::Crypto("invalid setup key".into()))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
        })
    }

    /// Cipher for packets the peer sends to us
    pub fn incoming(local_hash: &IdentityHash, peer_hash_hash: &IdentityHash) -> Result<Self, PeerError> {
        Self::from_key(&local_hash.xor(peer_hash_hash))
    }

    /// Cipher for packets we send to the peer
    pub fn outgoing(local_hash_hash: &IdentityHash, peer_hash: &IdentityHash) -> Result<Self, PeerError> {
        Self::from_key(&local_hash_hash.xor(peer_hash))
    }

    /// Encrypt; output is `nonce || ciphertext || tag`
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, PeerError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        SystemRandom::new()
            .fill(&mut nonce_bytes)
            .map_err(|_| PeerError::Crypto("failed to generate nonce".into()))?;

        let mut in_out = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| PeerError::Crypto("seal failed".into()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + in_out.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&in_out);
        Ok(out)
    }

    /// Decrypt the output of `seal`
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, PeerError> {
        if sealed.len() < NONCE_LEN + AES_256_GCM.tag_len() {
            return Err(PeerError::Crypto("sealed packet too short".into()));
        }
        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes.copy_from_slice(&sealed[..NONCE_LEN]);

        let mut in_out = sealed[NONCE_LEN..].to_vec();
        let plain_len = self
            .key
            .open_in_place(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| PeerError::Crypto("decrypt failed".into()))?
            .len();
        in_out.truncate(plain_len);
        Ok(in_out)
    }
}

impl fmt::Debug for SetupCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SetupCipher(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group() -> Arc<CryptoGroup> {
        Arc::new(CryptoGroup {
            p: "ff01".into(),
            q: "ff02".into(),
            g: "02".into(),
        })
    }

    #[test]
    fn test_identity_hashes() {
        let key = PeerPublicKey::from_bytes(&[7u8; 32]).unwrap();
        let id = PeerIdentity::new(b"peer-one".to_vec(), group(), key);
        assert_eq!(*id.hash(), IdentityHash::of(b"peer-one"));
        assert_eq!(*id.hash_hash(), IdentityHash::of(id.hash().as_bytes()));
        assert_ne!(id.hash(), id.hash_hash());
        assert!(id.same_identity(b"peer-one"));
        assert_eq!(id.hash().to_string().len(), 64);
        assert_eq!(id.hash().short().len(), 8);
    }

    #[test]
    fn test_setup_ciphers_mirror_each_other() {
        let a = IdentityHash::of(b"alice");
        let aa = IdentityHash::of(a.as_bytes());
        let b = IdentityHash::of(b"bob");
        let bb = IdentityHash::of(b.as_bytes());

        // Alice's outgoing key is Bob's incoming key
        let alice_out = SetupCipher::outgoing(&aa, &b).unwrap();
        let bob_in = SetupCipher::incoming(&b, &aa).unwrap();

        let sealed = alice_out.seal(b"hello bob").unwrap();
        assert_eq!(bob_in.open(&sealed).unwrap(), b"hello bob");

        // Bob's own outgoing key is different
        let bob_out = SetupCipher::outgoing(&bb, &a).unwrap();
        assert!(bob_out.open(&sealed).is_err());
    }

    #[test]
    fn test_open_rejects_short_input() {
        let cipher = SetupCipher::from_key(&[1u8; 32]).unwrap();
        assert!(matches!(cipher.open(&[0u8; 4]), Err(PeerError::Crypto(_))));
    }

    #[test]
    fn test_public_key_fieldset_roundtrip() {
        let key = PeerPublicKey::from_bytes(&[9u8; 32]).unwrap();
        let parsed = PeerPublicKey::from_fieldset(&key.to_fieldset()).unwrap();
        assert_eq!(parsed, key);
        assert!(PeerPublicKey::from_bytes(&[0u8; 31]).is_err());
    }

    #[test]
    fn test_signature_verification() {
        use ring::signature::{Ed25519KeyPair, KeyPair};

        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
        let pair = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).unwrap();
        let key = PeerPublicKey::from_bytes(pair.public_key().as_ref()).unwrap();

        let sig = pair.sign(b"payload");
        assert!(key.verify(b"payload", sig.as_ref()));
        assert!(!key.verify(b"tampered", sig.as_ref()));
    }

    #[test]
    fn test_crypto_group_requires_all_fields() {
        let mut fs = group().to_fieldset();
        assert_eq!(CryptoGroup::from_fieldset(&fs).unwrap(), *group());
        fs.remove("g");
        assert!(CryptoGroup::from_fieldset(&fs).is_err());
    }
}
