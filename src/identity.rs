//! # Identity and Distance
//!
//! This module defines the identity types used throughout telemesh:
//!
//! - [`Hashname`]: 20-byte SHA1 digest identifying a node (and reused for line and
//!   stream ids, which share its 40-hex shape)
//! - [`Distance`]: Kademlia XOR distance reduced to a bucket index
//! - [`Keypair`]: RSA keypair with its PEM public key
//!
//! ## Identity Model
//!
//! A node's hashname is `SHA1(public_key_pem || network)`, rendered as lowercase hex.
//! The same key therefore has a different hashname in every network namespace.
//! Possession of the private key is the only proof of identity.
//!
//! ## Distance
//!
//! `distance_to` XORs two digests and returns the index of the highest set bit
//! (159 for the most significant bit of the first byte, 0 for the least
//! significant bit of the last byte). Identical digests are [`Distance::Same`],
//! which never names a bucket.

use rand::RngCore;
use rand::rngs::OsRng;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha1::{Digest, Sha1};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::crypto::{self, CryptoError, Secret};

/// Length of a SHA1 digest in bytes.
pub const HASHNAME_LEN: usize = 20;

/// Length of the hex rendering of a digest.
pub const HASHNAME_HEX_LEN: usize = HASHNAME_LEN * 2;

/// Number of routing buckets (one per possible highest differing bit).
pub const BUCKET_COUNT: usize = HASHNAME_LEN * 8;

/// Default RSA modulus size for generated keys.
pub const DEFAULT_KEY_BITS: usize = 2048;

/// Returns current time as milliseconds since Unix epoch.
/// Used for the `at` field of opens.
#[inline]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Check the 40-hex-character shape of a SHA1 digest.
///
/// Used to reject malformed `stream`, `line` and `seek` fields before they are
/// trusted as map keys.
pub fn is_valid_digest(value: &str) -> bool {
    value.len() == HASHNAME_HEX_LEN && value.bytes().all(|b| b.is_ascii_hexdigit())
}

// ============================================================================
// Hashname
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hashname([u8; HASHNAME_LEN]);

impl Hashname {
    #[inline]
    pub fn from_bytes(bytes: [u8; HASHNAME_LEN]) -> Self {
        Self(bytes)
    }

    /// Hash arbitrary bytes into a digest.
    pub fn digest(data: &[u8]) -> Self {
        let digest = Sha1::digest(data);
        let mut bytes = [0u8; HASHNAME_LEN];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Derive the hashname of a PEM public key within a network namespace.
    pub fn from_key(public_pem: &str, network: &str) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(public_pem.as_bytes());
        hasher.update(network.as_bytes());
        let mut bytes = [0u8; HASHNAME_LEN];
        bytes.copy_from_slice(&hasher.finalize());
        Self(bytes)
    }

    /// A random digest, used for line ids and stream ids.
    pub fn random() -> Self {
        let mut bytes = [0u8; HASHNAME_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; HASHNAME_LEN] {
        &self.0
    }

    #[inline]
    pub fn xor_distance(&self, other: &Hashname) -> [u8; HASHNAME_LEN] {
        let mut out = [0u8; HASHNAME_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Bucket index of `other` relative to `self`.
    pub fn distance_to(&self, other: &Hashname) -> Distance {
        let xor = self.xor_distance(other);
        for (i, byte) in xor.iter().enumerate() {
            if *byte != 0 {
                let bit = 7 - byte.leading_zeros() as usize;
                return Distance::Bucket((HASHNAME_LEN - 1 - i) * 8 + bit);
            }
        }
        Distance::Same
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 40-hex-char digest. The convenience address form
    /// `hashname,ip,port` is accepted and only its first segment is used.
    pub fn parse(value: &str) -> Option<Self> {
        let first = value.split(',').next().unwrap_or_default();
        if !is_valid_digest(first) {
            return None;
        }
        let bytes = hex::decode(first).ok()?;
        bytes.try_into().ok().map(Self)
    }
}

impl std::fmt::Debug for Hashname {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hashname({})", &self.to_hex()[..12])
    }
}

impl std::fmt::Display for Hashname {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::str::FromStr for Hashname {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != HASHNAME_HEX_LEN {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut bytes = [0u8; HASHNAME_LEN];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl From<[u8; HASHNAME_LEN]> for Hashname {
    fn from(bytes: [u8; HASHNAME_LEN]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hashname {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// ============================================================================
// Distance
// ============================================================================

/// XOR distance reduced to its highest differing bit.
///
/// `Same` orders before every bucket, so sorting by distance puts the own
/// identity first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Distance {
    Same,
    Bucket(usize),
}

impl Distance {
    pub fn bucket(self) -> Option<usize> {
        match self {
            Distance::Same => None,
            Distance::Bucket(index) => Some(index),
        }
    }
}

// ============================================================================
// Public Keys
// ============================================================================

/// A peer's RSA public key together with the exact PEM text it announced.
///
/// The PEM text is kept byte for byte: it is hashed into the hashname and
/// relayed verbatim in `connect` bodies.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    pem: String,
    key: RsaPublicKey,
}

impl PublicKey {
    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        let key = crypto::parse_public_key(pem)?;
        Ok(Self {
            pem: pem.to_string(),
            key,
        })
    }

    pub fn pem(&self) -> &str {
        &self.pem
    }

    pub fn key(&self) -> &RsaPublicKey {
        &self.key
    }

    pub fn hashname(&self, network: &str) -> Hashname {
        Hashname::from_key(&self.pem, network)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicKey")
            .field("pem_len", &self.pem.len())
            .finish()
    }
}

// ============================================================================
// Keypair
// ============================================================================

#[derive(Clone)]
pub struct Keypair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
    public_pem: String,
}

impl Keypair {
    /// Generate a fresh RSA keypair.
    pub fn generate(bits: usize) -> Result<Self, CryptoError> {
        let private = RsaPrivateKey::new(&mut OsRng, bits)?;
        let public = RsaPublicKey::from(&private);
        let public_pem = public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self {
            private,
            public,
            public_pem: terminate_pem(public_pem),
        })
    }

    /// Load a keypair from PEM text. The private key may be PKCS#8
    /// (`BEGIN PRIVATE KEY`) or PKCS#1 (`BEGIN RSA PRIVATE KEY`).
    ///
    /// The public PEM text is kept verbatim (plus a trailing newline if it had
    /// none) because the hashname is derived from its exact bytes.
    pub fn from_pem(public_pem: &str, private_pem: &str) -> Result<Self, CryptoError> {
        let private = RsaPrivateKey::from_pkcs8_pem(private_pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(private_pem))
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let public = crypto::parse_public_key(public_pem)?;
        if RsaPublicKey::from(&private) != public {
            return Err(CryptoError::KeyMismatch);
        }
        Ok(Self {
            private,
            public,
            public_pem: terminate_pem(public_pem.to_string()),
        })
    }

    pub fn public_pem(&self) -> &str {
        &self.public_pem
    }

    pub fn private_pem(&self) -> Result<String, CryptoError> {
        self.private
            .to_pkcs8_pem(LineEnding::LF)
            .map(|pem| pem.to_string())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    /// The public half as a [`PublicKey`], as peers will see it.
    pub fn public(&self) -> PublicKey {
        PublicKey {
            pem: self.public_pem.clone(),
            key: self.public.clone(),
        }
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private
    }

    pub fn hashname(&self, network: &str) -> Hashname {
        Hashname::from_key(&self.public_pem, network)
    }

    /// Sign with RSA/MD5, base64 output.
    pub fn sign(&self, data: &[u8]) -> Result<String, CryptoError> {
        crypto::sign_md5(&self.private, data)
    }

    /// Unwrap a base64 RSA-encrypted line secret addressed to this key.
    pub fn decrypt_secret(&self, field: &str) -> Result<Secret, CryptoError> {
        crypto::decrypt_secret(&self.private, field)
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public_pem_len", &self.public_pem.len())
            .finish_non_exhaustive()
    }
}

fn terminate_pem(mut pem: String) -> String {
    if !pem.ends_with('\n') {
        pem.push('\n');
    }
    pem
}

/// Small RSA keys generated once per test binary.
#[cfg(test)]
pub(crate) fn test_keypair(index: usize) -> Keypair {
    use std::sync::OnceLock;

    const TEST_KEYS: usize = 8;
    static KEYS: OnceLock<Vec<Keypair>> = OnceLock::new();
    let keys = KEYS.get_or_init(|| {
        (0..TEST_KEYS)
            .map(|_| Keypair::generate(1024).expect("test key generation"))
            .collect()
    });
    keys[index % TEST_KEYS].clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hashname_with_first_byte(first: u8) -> Hashname {
        let mut bytes = [0u8; HASHNAME_LEN];
        bytes[0] = first;
        Hashname::from_bytes(bytes)
    }

    #[test]
    fn hashname_is_sha1_of_key_and_network() {
        let keypair = test_keypair(0);
        let mut concatenated = keypair.public_pem().as_bytes().to_vec();
        concatenated.extend_from_slice(b"testnet");

        assert_eq!(keypair.hashname("testnet"), Hashname::digest(&concatenated));
        assert_eq!(keypair.hashname("testnet"), keypair.hashname("testnet"));
        assert_ne!(keypair.hashname("testnet"), keypair.hashname("othernet"));
    }

    #[test]
    fn hashname_renders_as_lowercase_hex() {
        let hex = test_keypair(1).hashname("testnet").to_hex();
        assert_eq!(hex.len(), HASHNAME_HEX_LEN);
        assert!(hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)));
    }

    #[test]
    fn sha1_known_vector() {
        assert_eq!(
            Hashname::digest(b"abc").to_hex(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn distance_is_symmetric_and_same_is_sentinel() {
        let a = Hashname::random();
        let b = Hashname::random();

        assert_eq!(a.distance_to(&b), b.distance_to(&a));
        assert_eq!(a.distance_to(&a), Distance::Same);
        assert_eq!(a.distance_to(&a).bucket(), None);
    }

    #[test]
    fn distance_is_highest_differing_bit() {
        let zero = Hashname::from_bytes([0u8; HASHNAME_LEN]);
        assert_eq!(zero.distance_to(&hashname_with_first_byte(0x80)), Distance::Bucket(159));
        assert_eq!(zero.distance_to(&hashname_with_first_byte(0x01)), Distance::Bucket(152));

        let mut last = [0u8; HASHNAME_LEN];
        last[HASHNAME_LEN - 1] = 0x01;
        assert_eq!(zero.distance_to(&Hashname::from_bytes(last)), Distance::Bucket(0));

        last[HASHNAME_LEN - 1] = 0xff;
        last[HASHNAME_LEN - 2] = 0x02;
        assert_eq!(zero.distance_to(&Hashname::from_bytes(last)), Distance::Bucket(9));
    }

    #[test]
    fn same_orders_before_every_bucket() {
        assert!(Distance::Same < Distance::Bucket(0));
        assert!(Distance::Bucket(3) < Distance::Bucket(4));
    }

    #[test]
    fn digest_shape_validation() {
        let valid = Hashname::random().to_hex();
        assert!(is_valid_digest(&valid));
        assert!(is_valid_digest(&valid.to_uppercase()));
        assert!(!is_valid_digest(&valid[..39]));
        assert!(!is_valid_digest(&format!("{}0", valid)));
        assert!(!is_valid_digest(&"g".repeat(40)));
        assert!(!is_valid_digest(""));
    }

    #[test]
    fn parse_accepts_address_form() {
        let hashname = Hashname::random();
        let address = format!("{},10.0.0.1,42424", hashname);

        assert_eq!(Hashname::parse(&address), Some(hashname));
        assert_eq!(Hashname::parse(&hashname.to_hex()), Some(hashname));
        assert_eq!(Hashname::parse("nope,10.0.0.1,1"), None);
        assert_eq!(hashname.to_hex().parse::<Hashname>(), Ok(hashname));
    }

    #[test]
    fn keypair_pem_round_trip() {
        let keypair = test_keypair(2);
        let private = keypair.private_pem().unwrap();
        let loaded = Keypair::from_pem(keypair.public_pem(), &private).unwrap();

        assert_eq!(loaded.public_pem(), keypair.public_pem());
        assert_eq!(loaded.hashname("net"), keypair.hashname("net"));
    }

    #[test]
    fn keypair_rejects_mismatched_halves() {
        let a = test_keypair(3);
        let b = test_keypair(4);
        let result = Keypair::from_pem(a.public_pem(), &b.private_pem().unwrap());
        assert!(matches!(result, Err(CryptoError::KeyMismatch)));
    }
}
