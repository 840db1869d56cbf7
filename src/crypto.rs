//! # Cryptographic Infrastructure
//!
//! This module provides the asymmetric encryption used by the authorization
//! handshake:
//!
//! - **Sealing**: encrypt a payload so that only the holder of an
//!   [`Identity`]'s private key can read it
//! - **Opening**: decrypt a sealed payload with a [`Keypair`]
//!
//! ## Construction
//!
//! An [`Identity`] is an Ed25519 public key. Sealing maps it to its X25519
//! (Montgomery) form and performs an ephemeral Diffie-Hellman exchange:
//!
//! ```text
//! sealed = ephemeral_pk (32) || nonce (12) || ChaCha20-Poly1305(key, nonce, plaintext)
//! key    = BLAKE3-derive(SEAL_KDF_CONTEXT, shared || ephemeral_pk || recipient)
//! ```
//!
//! ## Security Properties
//!
//! - Opening with the wrong keypair fails authentication; it never yields a
//!   plausible plaintext
//! - Any bit flip in the sealed payload is detected by the AEAD tag
//! - The recipient identity is bound into the key derivation, so a sealed
//!   payload cannot be re-targeted

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use curve25519_dalek::edwards::CompressedEdwardsY;
use curve25519_dalek::montgomery::MontgomeryPoint;
use curve25519_dalek::scalar::Scalar;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::identity::{Identity, Keypair};

// ============================================================================
// Seal Error Types
// ============================================================================

/// Error type for sealing and opening failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SealError {
    /// The recipient identity is not a valid Ed25519 point.
    InvalidRecipient,
    /// The sealed payload is shorter than the fixed header.
    Truncated,
    /// AEAD authentication failed (wrong key or tampered payload).
    DecryptionFailed,
    /// AEAD encryption failed.
    EncryptionFailed,
}

impl std::fmt::Display for SealError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SealError::InvalidRecipient => write!(f, "recipient identity is not a valid public key"),
            SealError::Truncated => write!(f, "sealed payload is truncated"),
            SealError::DecryptionFailed => write!(f, "sealed payload failed authentication"),
            SealError::EncryptionFailed => write!(f, "encryption failed"),
        }
    }
}

impl std::error::Error for SealError {}

// ============================================================================
// Domain Separation
// ============================================================================

/// BLAKE3 key-derivation context for sealed payloads.
pub const SEAL_KDF_CONTEXT: &str = "overmesh 2024 handshake seal v1";

const EPHEMERAL_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Fixed overhead added by [`seal`]: ephemeral key, nonce and AEAD tag.
pub const SEAL_OVERHEAD: usize = EPHEMERAL_LEN + NONCE_LEN + 16;

// ============================================================================
// Seal / Open
// ============================================================================

/// Encrypt `plaintext` so that only `recipient` can open it.
pub fn seal(recipient: &Identity, plaintext: &[u8]) -> Result<Vec<u8>, SealError> {
    let recipient_point = CompressedEdwardsY(*recipient.as_bytes())
        .decompress()
        .ok_or(SealError::InvalidRecipient)?
        .to_montgomery();

    let mut ephemeral_bytes = [0u8; 32];
    OsRng.fill_bytes(&mut ephemeral_bytes);
    let ephemeral_secret = Scalar::from_bytes_mod_order(ephemeral_bytes);
    let ephemeral_public = MontgomeryPoint::mul_base(&ephemeral_secret);

    let shared = recipient_point * ephemeral_secret;
    let key = derive_key(&shared, &ephemeral_public, recipient);

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| SealError::EncryptionFailed)?;

    let mut sealed = Vec::with_capacity(SEAL_OVERHEAD + plaintext.len());
    sealed.extend_from_slice(ephemeral_public.as_bytes());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Decrypt a payload produced by [`seal`] for `keypair`'s identity.
pub fn open(keypair: &Keypair, sealed: &[u8]) -> Result<Vec<u8>, SealError> {
    if sealed.len() < SEAL_OVERHEAD {
        return Err(SealError::Truncated);
    }

    let mut ephemeral = [0u8; EPHEMERAL_LEN];
    ephemeral.copy_from_slice(&sealed[..EPHEMERAL_LEN]);
    let ephemeral_public = MontgomeryPoint(ephemeral);
    let nonce = &sealed[EPHEMERAL_LEN..EPHEMERAL_LEN + NONCE_LEN];
    let ciphertext = &sealed[EPHEMERAL_LEN + NONCE_LEN..];

    let secret = keypair.signing_key().to_scalar();
    let shared = ephemeral_public * secret;
    let key = derive_key(&shared, &ephemeral_public, &keypair.identity());

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| SealError::DecryptionFailed)
}

fn derive_key(shared: &MontgomeryPoint, ephemeral: &MontgomeryPoint, recipient: &Identity) -> [u8; 32] {
    let mut material = Vec::with_capacity(96);
    material.extend_from_slice(shared.as_bytes());
    material.extend_from_slice(ephemeral.as_bytes());
    material.extend_from_slice(recipient.as_bytes());
    blake3::derive_key(SEAL_KDF_CONTEXT, &material)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let kp = Keypair::from_credentials("login1", "password1");
        let sealed = seal(&kp.identity(), b"addr1-nonce").unwrap();

        assert_eq!(sealed.len(), SEAL_OVERHEAD + b"addr1-nonce".len());
        assert_eq!(open(&kp, &sealed).unwrap(), b"addr1-nonce");
    }

    #[test]
    fn test_open_with_wrong_key_fails() {
        let alice = Keypair::from_credentials("alice", "pw");
        let mallory = Keypair::from_credentials("mallory", "pw");

        let sealed = seal(&alice.identity(), b"secret").unwrap();
        assert_eq!(open(&mallory, &sealed), Err(SealError::DecryptionFailed));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let kp = Keypair::generate();
        let mut sealed = seal(&kp.identity(), b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;

        assert_eq!(open(&kp, &sealed), Err(SealError::DecryptionFailed));
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let kp = Keypair::generate();
        assert_eq!(open(&kp, &[0u8; 10]), Err(SealError::Truncated));
    }

    #[test]
    fn test_sealing_is_randomized() {
        let kp = Keypair::generate();
        let a = seal(&kp.identity(), b"same").unwrap();
        let b = seal(&kp.identity(), b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_seal_to_invalid_identity_fails() {
        let bogus = (2u8..=255)
            .map(|y| {
                let mut bytes = [0u8; 32];
                bytes[0] = y;
                Identity::from_bytes(bytes)
            })
            .find(|id| CompressedEdwardsY(*id.as_bytes()).decompress().is_none())
            .expect("some small y is off-curve");
        assert!(!bogus.is_valid());
        assert_eq!(seal(&bogus, b"x"), Err(SealError::InvalidRecipient));
    }
}
