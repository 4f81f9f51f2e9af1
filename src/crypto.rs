//! # Cryptographic Primitives
//!
//! This module provides the primitives the line handshake is built from:
//!
//! - **Secret wrapping**: RSA PKCS#1 v1.5 encryption of the 16-byte AES line secret
//! - **Signatures**: RSA PKCS#1 v1.5 over an MD5 digest of the open ciphertext
//! - **Line cipher**: AES-128 in counter mode (128-bit big-endian counter over the IV)
//! - **Key shape**: PEM validation for keys attached to inbound opens
//!
//! Binary values that travel inside JSON headers are base64 (`open`, `sig`) or
//! lowercase hex (`iv`).
//!
//! ## Security Properties
//!
//! - A fresh random IV is drawn for every encrypted frame; secrets are never reused
//!   across peers.
//! - Signatures cover the *ciphertext* of the open, so a verifier never has to
//!   trust plaintext it could not yet authenticate.
//! - Nothing here authenticates the line cipher itself (CTR is malleable); frames
//!   that decrypt to garbage are rejected by the wire decoder.

use aes::Aes128;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use ctr::cipher::{KeyIvInit, StreamCipher};
use md5::{Digest, Md5};
use rand::RngCore;
use rand::rngs::OsRng;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// Length of an AES-128 line secret.
pub const SECRET_LEN: usize = 16;

/// Length of an AES-CTR initialization vector.
pub const IV_LEN: usize = 16;

/// Length of the hex rendering of an IV as carried in the `iv` header field.
pub const IV_HEX_LEN: usize = IV_LEN * 2;

pub type Secret = [u8; SECRET_LEN];
pub type Iv = [u8; IV_LEN];

// ============================================================================
// Error Types
// ============================================================================

/// Error type for every cryptographic failure in the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Base64 field could not be decoded.
    Encoding,
    /// RSA operation (encrypt/decrypt/sign) failed.
    Rsa(String),
    /// Decrypted secret is not 16 bytes.
    SecretLength(usize),
    /// Key material is not a parseable PEM key.
    InvalidKey(String),
    /// Signature did not verify against the supplied key.
    SignatureInvalid,
    /// The public and private halves of a keypair do not belong together.
    KeyMismatch,
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CryptoError::Encoding => write!(f, "invalid base64 encoding"),
            CryptoError::Rsa(e) => write!(f, "rsa operation failed: {}", e),
            CryptoError::SecretLength(len) => write!(f, "secret has invalid length {}", len),
            CryptoError::InvalidKey(e) => write!(f, "invalid key: {}", e),
            CryptoError::SignatureInvalid => write!(f, "signature verification failed"),
            CryptoError::KeyMismatch => write!(f, "public key does not match private key"),
        }
    }
}

impl std::error::Error for CryptoError {}

impl From<rsa::Error> for CryptoError {
    fn from(err: rsa::Error) -> Self {
        CryptoError::Rsa(err.to_string())
    }
}

// ============================================================================
// Randomness
// ============================================================================

pub fn random_secret() -> Secret {
    let mut secret = [0u8; SECRET_LEN];
    OsRng.fill_bytes(&mut secret);
    secret
}

pub fn random_iv() -> Iv {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    iv
}

/// Parse the 32-hex-char `iv` header field.
pub fn parse_iv(field: &str) -> Option<Iv> {
    if field.len() != IV_HEX_LEN {
        return None;
    }
    let bytes = hex::decode(field).ok()?;
    bytes.try_into().ok()
}

// ============================================================================
// Line Cipher
// ============================================================================

/// Apply the AES-128-CTR keystream. Encryption and decryption are the same
/// operation.
pub fn aes_ctr(secret: &Secret, iv: &Iv, data: &[u8]) -> Vec<u8> {
    let mut buf = data.to_vec();
    let mut cipher = Aes128Ctr::new(&(*secret).into(), &(*iv).into());
    cipher.apply_keystream(&mut buf);
    buf
}

// ============================================================================
// RSA Secret Wrapping and Signatures
// ============================================================================

/// RSA-encrypt a line secret to `recipient` and render it as base64.
pub fn encrypt_secret(recipient: &RsaPublicKey, secret: &Secret) -> Result<String, CryptoError> {
    let wrapped = recipient.encrypt(&mut OsRng, Pkcs1v15Encrypt, secret)?;
    Ok(STANDARD.encode(wrapped))
}

/// Recover a line secret from the base64 `open` header field.
pub fn decrypt_secret(private: &RsaPrivateKey, field: &str) -> Result<Secret, CryptoError> {
    let wrapped = STANDARD.decode(field).map_err(|_| CryptoError::Encoding)?;
    let secret = private.decrypt(Pkcs1v15Encrypt, &wrapped)?;
    let len = secret.len();
    secret.try_into().map_err(|_| CryptoError::SecretLength(len))
}

/// Sign `data` (RSA PKCS#1 v1.5 over MD5) and render the signature as base64.
pub fn sign_md5(private: &RsaPrivateKey, data: &[u8]) -> Result<String, CryptoError> {
    let digest = Md5::digest(data);
    let signature = private.sign(Pkcs1v15Sign::new::<Md5>(), &digest)?;
    Ok(STANDARD.encode(signature))
}

/// Verify a base64 RSA/MD5 signature over `data`.
pub fn verify_md5(public: &RsaPublicKey, data: &[u8], signature: &str) -> Result<(), CryptoError> {
    let signature = STANDARD.decode(signature).map_err(|_| CryptoError::Encoding)?;
    let digest = Md5::digest(data);
    public
        .verify(Pkcs1v15Sign::new::<Md5>(), &digest, &signature)
        .map_err(|_| CryptoError::SignatureInvalid)
}

// ============================================================================
// Key Material
// ============================================================================

/// Parse a PEM public key, accepting SPKI (`BEGIN PUBLIC KEY`) or PKCS#1
/// (`BEGIN RSA PUBLIC KEY`).
pub fn parse_public_key(pem: &str) -> Result<RsaPublicKey, CryptoError> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

/// Check that `text` starts with a well-formed PEM key block:
/// matching `BEGIN <label> KEY` / `END <label> KEY` lines around base64 lines,
/// terminated by a newline.
pub fn is_pem_key(text: &str) -> bool {
    let Some(rest) = text.strip_prefix("-----BEGIN ") else {
        return false;
    };
    let Some(label_end) = rest.find(" KEY-----") else {
        return false;
    };
    let label = &rest[..label_end];
    if label.contains('\n') {
        return false;
    }
    let rest = &rest[label_end + " KEY-----".len()..];
    let rest = rest.strip_prefix('\r').unwrap_or(rest);
    let Some(rest) = rest.strip_prefix('\n') else {
        return false;
    };

    let footer = format!("-----END {} KEY-----", label);
    let Some(footer_at) = rest.find(&footer) else {
        return false;
    };
    let body = &rest[..footer_at];
    if !body.ends_with('\n') {
        return false;
    }
    let body_ok = body
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'/' | b'+' | b'=' | b'\r' | b'\n'));
    if !body_ok {
        return false;
    }

    let tail = &rest[footer_at + footer.len()..];
    tail.starts_with('\n') || tail.starts_with("\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::test_keypair;

    #[test]
    fn aes_ctr_is_its_own_inverse() {
        let secret = random_secret();
        let iv = random_iv();
        let plaintext = b"an ordinary line frame, longer than one block of sixteen bytes";

        let ciphertext = aes_ctr(&secret, &iv, plaintext);
        assert_ne!(&ciphertext[..], &plaintext[..]);
        assert_eq!(ciphertext.len(), plaintext.len());
        assert_eq!(aes_ctr(&secret, &iv, &ciphertext), plaintext.to_vec());
    }

    #[test]
    fn aes_ctr_depends_on_iv() {
        let secret = random_secret();
        let a = aes_ctr(&secret, &[0u8; IV_LEN], b"same input");
        let b = aes_ctr(&secret, &[1u8; IV_LEN], b"same input");
        assert_ne!(a, b);
    }

    #[test]
    fn parse_iv_requires_32_hex_chars() {
        let iv = random_iv();
        assert_eq!(parse_iv(&hex::encode(iv)), Some(iv));
        assert_eq!(parse_iv("abcd"), None);
        assert_eq!(parse_iv(&"zz".repeat(16)), None);
    }

    #[test]
    fn secret_wrapping_round_trips() {
        let keypair = test_keypair(0);
        let secret = random_secret();

        let wrapped = encrypt_secret(keypair.public_key(), &secret).unwrap();
        let unwrapped = decrypt_secret(keypair.private_key(), &wrapped).unwrap();
        assert_eq!(unwrapped, secret);
    }

    #[test]
    fn secret_unwrapping_with_wrong_key_fails() {
        let alice = test_keypair(0);
        let bob = test_keypair(1);
        let wrapped = encrypt_secret(alice.public_key(), &random_secret()).unwrap();

        assert!(decrypt_secret(bob.private_key(), &wrapped).is_err());
        assert_eq!(
            decrypt_secret(alice.private_key(), "not base64!"),
            Err(CryptoError::Encoding)
        );
    }

    #[test]
    fn md5_signatures_verify_only_original_data() {
        let keypair = test_keypair(0);
        let other = test_keypair(1);
        let signature = sign_md5(keypair.private_key(), b"ciphertext").unwrap();

        assert!(verify_md5(keypair.public_key(), b"ciphertext", &signature).is_ok());
        assert_eq!(
            verify_md5(keypair.public_key(), b"tampered", &signature),
            Err(CryptoError::SignatureInvalid)
        );
        assert_eq!(
            verify_md5(other.public_key(), b"ciphertext", &signature),
            Err(CryptoError::SignatureInvalid)
        );
    }

    #[test]
    fn pem_shape_check() {
        let keypair = test_keypair(0);
        assert!(is_pem_key(keypair.public_pem()));

        let crlf = keypair.public_pem().replace('\n', "\r\n");
        assert!(is_pem_key(&crlf));

        assert!(!is_pem_key("hello"));
        assert!(!is_pem_key("-----BEGIN PUBLIC KEY-----\nabc\n-----END PRIVATE KEY-----\n"));
        assert!(!is_pem_key("-----BEGIN PUBLIC KEY-----\na$c\n-----END PUBLIC KEY-----\n"));
        assert!(!is_pem_key("-----BEGIN PUBLIC KEY-----\nabc\n-----END PUBLIC KEY-----"));
        assert!(is_pem_key("-----BEGIN PUBLIC KEY-----\nabc=\n-----END PUBLIC KEY-----\n"));
    }

    #[test]
    fn parse_public_key_accepts_generated_pem() {
        let keypair = test_keypair(0);
        let parsed = parse_public_key(keypair.public_pem()).unwrap();
        assert_eq!(&parsed, keypair.public_key());
        assert!(parse_public_key("-----BEGIN PUBLIC KEY-----\nabc=\n-----END PUBLIC KEY-----\n").is_err());
    }
}
