//! Cryptography for the sievekv wire.
//!
//! Two independent devices live here:
//!
//! - **Datagram sealing**: every datagram between peers is AES-128-CBC
//!   encrypted under a key derived from the destination's shared secret with
//!   PBKDF2. The 16-byte IV is prepended to the ciphertext. This is the only
//!   confidentiality/authentication device the protocol carries; there are no
//!   public-key signatures.
//! - **Response digests**: the "signature" a replica attaches to an APPROVE
//!   is a SHA-256 digest of the canonical form of its speculative response.
//!   Correct replicas therefore produce identical digests for identical
//!   inputs, and the leader partitions replies by digest equality.

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use sha2::{Digest, Sha256};

use sievekv_types::Operation;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// AES block size; also the length of the prepended IV.
pub const BLOCK_SIZE: usize = 16;

/// Derived key length in bytes (AES-128).
pub const KEY_LEN: usize = 16;

/// Fixed PBKDF2 salt shared by the whole cluster.
const SALT: &[u8; 8] = b"12345678";

/// PBKDF2 iteration count. Expensive on purpose; derive once per peer, not
/// per datagram.
const ITERATIONS: u32 = 100_000;

/// A derived per-peer sealing key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SealingKey([u8; KEY_LEN]);

impl std::fmt::Debug for SealingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        f.write_str("SealingKey(..)")
    }
}

impl SealingKey {
    /// Derives the sealing key for a peer from its shared secret:
    /// PBKDF2-HMAC-SHA-256, fixed 8-byte salt, 100k iterations, 16 bytes out.
    pub fn derive(secret: &str) -> Self {
        let mut key = [0u8; KEY_LEN];
        pbkdf2::pbkdf2_hmac::<Sha256>(secret.as_bytes(), SALT, ITERATIONS, &mut key);
        Self(key)
    }
}

/// Errors from opening a sealed datagram.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Datagram shorter than IV + one block, or ciphertext not block-aligned.
    #[error("sealed datagram has invalid length {0}")]
    Truncated(usize),

    /// Padding check failed after decryption (wrong key or corrupt data).
    #[error("datagram failed to unpad (wrong key or corrupted)")]
    Unpad,
}

/// Seals a plaintext for the wire: fresh random IV, AES-128-CBC with PKCS#7
/// padding, IV prepended.
pub fn seal(plaintext: &[u8], key: &SealingKey) -> Vec<u8> {
    let mut iv = [0u8; BLOCK_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    seal_with_iv(plaintext, key, &iv)
}

fn seal_with_iv(plaintext: &[u8], key: &SealingKey, iv: &[u8; BLOCK_SIZE]) -> Vec<u8> {
    let ciphertext = Aes128CbcEnc::new(&key.0.into(), iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);
    let mut out = Vec::with_capacity(BLOCK_SIZE + ciphertext.len());
    out.extend_from_slice(iv);
    out.extend_from_slice(&ciphertext);
    out
}

/// Opens a sealed datagram: splits the IV, decrypts, strips padding.
pub fn open(sealed: &[u8], key: &SealingKey) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < 2 * BLOCK_SIZE || (sealed.len() - BLOCK_SIZE) % BLOCK_SIZE != 0 {
        return Err(CryptoError::Truncated(sealed.len()));
    }
    let (iv, ciphertext) = sealed.split_at(BLOCK_SIZE);
    let iv: [u8; BLOCK_SIZE] = iv.try_into().expect("split_at yields BLOCK_SIZE bytes");
    Aes128CbcDec::new(&key.0.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::Unpad)
}

// ============================================================================
// Response digests
// ============================================================================

/// Digests a speculative response: base64 of SHA-256 over its canonical form.
pub fn sign_response(response: &Operation) -> String {
    let digest = Sha256::digest(response.canonical().as_bytes());
    BASE64.encode(digest)
}

/// Recomputes the digest of `response` and compares with `signature`.
pub fn verify_response(response: &Operation, signature: &str) -> bool {
    sign_response(response) == signature
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_is_deterministic_per_secret() {
        let a = SealingKey::derive("3");
        let b = SealingKey::derive("3");
        let c = SealingKey::derive("4");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn seal_open_round_trip() {
        let key = SealingKey::derive("secret");
        let plain = br#"{"type":1,"c":0,"o":["a",1]}"#;

        let sealed = seal(plain, &key);
        assert!(sealed.len() > plain.len());
        assert_eq!(sealed.len() % BLOCK_SIZE, 0);

        let opened = open(&sealed, &key).expect("open");
        assert_eq!(opened, plain);
    }

    #[test]
    fn fresh_iv_per_seal() {
        let key = SealingKey::derive("secret");
        let a = seal(b"same plaintext", &key);
        let b = seal(b"same plaintext", &key);
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let sealed = seal(b"payload bytes here", &SealingKey::derive("one"));
        let result = open(&sealed, &SealingKey::derive("two"));
        assert!(matches!(result, Err(CryptoError::Unpad)));
    }

    #[test]
    fn truncated_datagrams_rejected() {
        let key = SealingKey::derive("k");
        assert!(matches!(open(b"short", &key), Err(CryptoError::Truncated(5))));
        // IV present but no ciphertext block
        assert!(matches!(
            open(&[0u8; BLOCK_SIZE], &key),
            Err(CryptoError::Truncated(_))
        ));
        // Not block aligned
        assert!(matches!(
            open(&[0u8; BLOCK_SIZE * 2 + 3], &key),
            Err(CryptoError::Truncated(_))
        ));
    }

    #[test]
    fn equal_responses_share_a_digest() {
        let a = Operation::new("a", 1);
        let b = Operation::new("a", 1);
        assert_eq!(sign_response(&a), sign_response(&b));
        assert!(verify_response(&b, &sign_response(&a)));
    }

    #[test]
    fn mangled_responses_diverge() {
        let honest = Operation::new("a", 1);
        let mangled = Operation::new("a", "1FAULTY3");
        assert_ne!(sign_response(&honest), sign_response(&mangled));
        assert!(!verify_response(&mangled, &sign_response(&honest)));
    }
}
