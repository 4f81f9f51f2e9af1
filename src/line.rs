//! # Lines
//!
//! A line is the encrypted channel between two hashnames. Each side picks its
//! own random line id and AES secret and announces them in an `open`:
//!
//! ```text
//! open  { type:"open", open:RSA(secret), iv, sig:RSA-MD5(ciphertext) }
//!   └── AES-CTR(secret, iv) of  { to, at, line }  + own PEM public key
//!
//! line  { type:"line", line:<peer's line id>, iv }
//!   └── AES-CTR(own secret, iv) of the stream frame
//! ```
//!
//! A frame sent on a line carries the *receiver's* line id (learned from the
//! receiver's open) and is encrypted with the *sender's* secret (which the
//! receiver learned from the sender's open).
//!
//! This module only builds and checks frames. Registry updates, the `at`
//! ordering check and replying with our own open belong to the node.
//!
//! ## Verification Order
//!
//! 1. `open` present and RSA-decryptable with our private key
//! 2. body present and decrypts to a well-formed inner frame
//! 3. inner `to` is our hashname
//! 4. inner `line` is a 40-hex id
//! 5. inner body is a PEM key
//! 6. `sig` verifies over the ciphertext with that key
//! 7. inner `at` present

use crate::crypto::{self, CryptoError, Secret};
use crate::identity::{Hashname, Keypair, PublicKey};
use crate::messages::{self, Header, Packet, WireError};

#[derive(Debug)]
pub enum LineError {
    MissingField(&'static str),
    InvalidIv,
    Crypto(CryptoError),
    Wire(WireError),
    WrongRecipient(Option<String>),
    InvalidLine,
    InvalidKey,
    BadSignature,
}

impl std::fmt::Display for LineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LineError::MissingField(field) => write!(f, "missing {}", field),
            LineError::InvalidIv => write!(f, "invalid initialization vector"),
            LineError::Crypto(e) => write!(f, "{}", e),
            LineError::Wire(e) => write!(f, "invalid inner frame: {}", e),
            LineError::WrongRecipient(to) => {
                write!(f, "open for wrong hashname {}", to.as_deref().unwrap_or("<none>"))
            }
            LineError::InvalidLine => write!(f, "invalid line id"),
            LineError::InvalidKey => write!(f, "invalid attached key"),
            LineError::BadSignature => write!(f, "invalid signature"),
        }
    }
}

impl std::error::Error for LineError {}

impl From<CryptoError> for LineError {
    fn from(err: CryptoError) -> Self {
        LineError::Crypto(err)
    }
}

impl From<WireError> for LineError {
    fn from(err: WireError) -> Self {
        LineError::Wire(err)
    }
}

/// The accepted content of a peer's open.
#[derive(Debug)]
pub struct VerifiedOpen {
    /// The sender's outgoing line id; our frames to it carry this id.
    pub line: Hashname,
    /// The sender's secret; its frames to us decrypt with this.
    pub secret: Secret,
    pub key: PublicKey,
    pub at: u64,
}

// ============================================================================
// Open
// ============================================================================

pub fn build_open(
    own: &Keypair,
    to: &Hashname,
    recipient: &PublicKey,
    line: &Hashname,
    secret: &Secret,
    at: u64,
) -> Result<Vec<u8>, LineError> {
    let inner = Header {
        to: Some(to.to_hex()),
        at: Some(at),
        line: Some(line.to_hex()),
        ..Header::default()
    };
    let plain = messages::encode(&inner, Some(own.public_pem().as_bytes()))?;

    let iv = crypto::random_iv();
    let ciphertext = crypto::aes_ctr(secret, &iv, &plain);

    let outer = Header {
        kind: Some("open".to_string()),
        open: Some(crypto::encrypt_secret(recipient.key(), secret)?),
        iv: Some(hex::encode(iv)),
        sig: Some(own.sign(&ciphertext)?),
        ..Header::default()
    };
    Ok(messages::encode(&outer, Some(&ciphertext))?)
}

/// Check an inbound open addressed to `own_hashname`.
///
/// Nothing is recorded on failure, so a rejected open never touches the
/// registry.
pub fn verify_open(
    own: &Keypair,
    own_hashname: &Hashname,
    packet: &Packet,
) -> Result<VerifiedOpen, LineError> {
    let wrapped = packet
        .header
        .open
        .as_deref()
        .ok_or(LineError::MissingField("open"))?;
    let secret = own.decrypt_secret(wrapped)?;

    let ciphertext = packet.body.as_deref().ok_or(LineError::MissingField("body"))?;
    let iv = parse_iv(&packet.header)?;
    let inner = messages::decode(&crypto::aes_ctr(&secret, &iv, ciphertext))?;

    if inner.header.to.as_deref() != Some(own_hashname.to_hex().as_str()) {
        return Err(LineError::WrongRecipient(inner.header.to));
    }

    let line: Hashname = inner
        .header
        .line
        .as_deref()
        .and_then(|line| line.parse().ok())
        .ok_or(LineError::InvalidLine)?;

    let pem = inner
        .body
        .as_deref()
        .ok_or(LineError::MissingField("key"))?;
    let pem = std::str::from_utf8(pem).map_err(|_| LineError::InvalidKey)?;
    if !crypto::is_pem_key(pem) {
        return Err(LineError::InvalidKey);
    }
    let key = PublicKey::from_pem(pem).map_err(|_| LineError::InvalidKey)?;

    let sig = packet
        .header
        .sig
        .as_deref()
        .ok_or(LineError::MissingField("sig"))?;
    crypto::verify_md5(key.key(), ciphertext, sig).map_err(|_| LineError::BadSignature)?;

    let at = inner.header.at.ok_or(LineError::MissingField("at"))?;

    Ok(VerifiedOpen {
        line,
        secret,
        key,
        at,
    })
}

// ============================================================================
// Line Frames
// ============================================================================

/// Encrypt a stream frame for a peer whose incoming line id is `line`.
pub fn seal_line(line: &Hashname, secret: &Secret, inner: &Packet) -> Result<Vec<u8>, LineError> {
    let plain = inner.encode()?;
    let iv = crypto::random_iv();
    let outer = Header {
        kind: Some("line".to_string()),
        line: Some(line.to_hex()),
        iv: Some(hex::encode(iv)),
        ..Header::default()
    };
    Ok(messages::encode(&outer, Some(&crypto::aes_ctr(secret, &iv, &plain)))?)
}

/// Decrypt a `line` frame. Receive metadata is carried over to the result.
pub fn open_line(secret: &Secret, packet: &Packet) -> Result<Packet, LineError> {
    let iv = parse_iv(&packet.header)?;
    let ciphertext = packet.body.as_deref().ok_or(LineError::MissingField("body"))?;
    let mut inner = messages::decode(&crypto::aes_ctr(secret, &iv, ciphertext))?;
    inner.sender = packet.sender;
    inner.id = packet.id;
    inner.received_at = packet.received_at;
    Ok(inner)
}

fn parse_iv(header: &Header) -> Result<crypto::Iv, LineError> {
    let iv = header.iv.as_deref().ok_or(LineError::MissingField("iv"))?;
    crypto::parse_iv(iv).ok_or(LineError::InvalidIv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::test_keypair;

    const NETWORK: &str = "testnet";

    struct Pair {
        alice: Keypair,
        bob: Keypair,
    }

    fn pair() -> Pair {
        Pair {
            alice: test_keypair(0),
            bob: test_keypair(1),
        }
    }

    fn open_from_alice(pair: &Pair, to: &Hashname) -> (Packet, Hashname, Secret) {
        let line = Hashname::random();
        let secret = crypto::random_secret();
        let frame = build_open(&pair.alice, to, &pair.bob.public(), &line, &secret, 1_000).unwrap();
        (messages::decode(&frame).unwrap(), line, secret)
    }

    #[test]
    fn open_round_trip() {
        let pair = pair();
        let bob_hashname = pair.bob.hashname(NETWORK);
        let (packet, line, secret) = open_from_alice(&pair, &bob_hashname);

        assert_eq!(packet.header.kind.as_deref(), Some("open"));
        assert_eq!(packet.header.iv.as_ref().map(String::len), Some(crypto::IV_HEX_LEN));

        let verified = verify_open(&pair.bob, &bob_hashname, &packet).unwrap();
        assert_eq!(verified.line, line);
        assert_eq!(verified.secret, secret);
        assert_eq!(verified.at, 1_000);
        assert_eq!(verified.key.hashname(NETWORK), pair.alice.hashname(NETWORK));
    }

    #[test]
    fn open_for_another_hashname_is_rejected() {
        let pair = pair();
        let bob_hashname = pair.bob.hashname(NETWORK);
        let (packet, _, _) = open_from_alice(&pair, &Hashname::random());

        let err = verify_open(&pair.bob, &bob_hashname, &packet).unwrap_err();
        assert!(matches!(err, LineError::WrongRecipient(Some(_))));
    }

    #[test]
    fn open_with_tampered_ciphertext_fails_signature() {
        let pair = pair();
        let bob_hashname = pair.bob.hashname(NETWORK);
        let (mut packet, _, _) = open_from_alice(&pair, &bob_hashname);

        let sig_from_other = pair.bob.sign(packet.body.as_deref().unwrap()).unwrap();
        packet.header.sig = Some(sig_from_other);

        let err = verify_open(&pair.bob, &bob_hashname, &packet).unwrap_err();
        assert!(matches!(err, LineError::BadSignature));
    }

    #[test]
    fn open_encrypted_to_someone_else_fails_to_decrypt() {
        let pair = pair();
        let carol = test_keypair(2);
        let (packet, _, _) = open_from_alice(&pair, &carol.hashname(NETWORK));

        let err = verify_open(&carol, &carol.hashname(NETWORK), &packet).unwrap_err();
        assert!(matches!(err, LineError::Crypto(_)));
    }

    #[test]
    fn open_missing_fields_is_rejected() {
        let pair = pair();
        let bob_hashname = pair.bob.hashname(NETWORK);
        let (packet, _, _) = open_from_alice(&pair, &bob_hashname);

        let mut no_open = packet.clone();
        no_open.header.open = None;
        assert!(matches!(
            verify_open(&pair.bob, &bob_hashname, &no_open),
            Err(LineError::MissingField("open"))
        ));

        let mut no_body = packet.clone();
        no_body.body = None;
        assert!(matches!(
            verify_open(&pair.bob, &bob_hashname, &no_body),
            Err(LineError::MissingField("body"))
        ));

        let mut no_sig = packet;
        no_sig.header.sig = None;
        assert!(matches!(
            verify_open(&pair.bob, &bob_hashname, &no_sig),
            Err(LineError::MissingField("sig"))
        ));
    }

    #[test]
    fn line_frames_round_trip_with_metadata() {
        let line = Hashname::random();
        let secret = crypto::random_secret();
        let mut header = Header::typed("seek");
        header.seek = Some(Hashname::random().to_hex());
        let inner = Packet::new(header.clone(), Some(b"payload".to_vec()));

        let frame = seal_line(&line, &secret, &inner).unwrap();
        let mut outer = messages::decode(&frame).unwrap();
        assert_eq!(outer.header.kind.as_deref(), Some("line"));
        assert_eq!(outer.header.line, Some(line.to_hex()));
        outer.id = 42;

        let opened = open_line(&secret, &outer).unwrap();
        assert_eq!(opened.header, header);
        assert_eq!(opened.body.as_deref(), Some(&b"payload"[..]));
        assert_eq!(opened.id, 42);
    }

    #[test]
    fn line_frame_with_bad_iv_is_rejected() {
        let secret = crypto::random_secret();
        let frame = seal_line(&Hashname::random(), &secret, &Packet::default()).unwrap();
        let mut outer = messages::decode(&frame).unwrap();
        outer.header.iv = Some("zz".repeat(16));
        assert!(matches!(open_line(&secret, &outer), Err(LineError::InvalidIv)));
    }
}
