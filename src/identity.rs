//! # Identity and Proximity Metric
//!
//! This module defines the identity types used throughout Overmesh:
//!
//! - [`Keypair`]: Ed25519 signing keypair, derivable from a credential pair
//! - [`Identity`]: 32-byte public key serving as both address in the metric
//!   space and verifiable cryptographic identity
//! - [`distance`]: absolute big-endian difference between two identities
//! - [`DistanceCache`]: bounded memo of identity distances
//!
//! ## Deterministic Identities
//!
//! `Keypair::from_credentials(login, password)` always yields the same keypair
//! for the same credentials. A node restarted with the same login keeps its
//! position in the overlay and can reload its persisted friend table.
//!
//! ## Metric
//!
//! Closeness is NOT the Kademlia XOR metric. The distance between `a` and `b`
//! is `|a - b|` with both read as big-endian unsigned integers, computed
//! byte-wise with borrow propagation from the least-significant byte. Because
//! the result is itself big-endian, lexicographic byte order on distances is
//! numeric order.
//!
//! ## Invariants
//!
//! - `distance(a, b) == distance(b, a)`
//! - `distance(a, a)` is all zeros, same length as `a`
//! - `Identity::from_bytes(bytes).as_bytes() == bytes`

use std::num::NonZeroUsize;

use ed25519_dalek::{SigningKey, VerifyingKey};
use lru::LruCache;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Domain separation context for credential-derived seeds.
const CREDENTIAL_KDF_CONTEXT: &str = "overmesh 2024 credential seed v1";

/// Keyed-hash stretching rounds applied to the credential seed.
const CREDENTIAL_KDF_ROUNDS: u32 = 2500;

/// Distance between two identities. Big-endian, so `Ord` is numeric order.
pub type Distance = [u8; 32];

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a random keypair (ephemeral identity).
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Derive a keypair deterministically from a credential pair.
    ///
    /// The login and password are length-prefixed before hashing so that
    /// `("ab", "c")` and `("a", "bc")` produce different seeds.
    pub fn from_credentials(login: &str, password: &str) -> Self {
        let mut hasher = blake3::Hasher::new_derive_key(CREDENTIAL_KDF_CONTEXT);
        hasher.update(&(login.len() as u64).to_le_bytes());
        hasher.update(login.as_bytes());
        hasher.update(&(password.len() as u64).to_le_bytes());
        hasher.update(password.as_bytes());
        let mut seed = *hasher.finalize().as_bytes();

        for _ in 0..CREDENTIAL_KDF_ROUNDS {
            seed = *blake3::keyed_hash(&seed, password.as_bytes()).as_bytes();
        }

        Self::from_secret_key_bytes(&seed)
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn identity(&self) -> Identity {
        Identity::from_bytes(self.public_key_bytes())
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("identity", &hex::encode(self.identity().as_bytes()))
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity([u8; 32]);

impl Identity {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Absolute big-endian difference between two identities.
    #[inline]
    pub fn distance(&self, other: &Identity) -> Distance {
        let mut out = [0u8; 32];
        subtract_abs(&self.0, &other.0, &mut out);
        out
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Check that this identity is a usable Ed25519 public key.
    ///
    /// Peers can only be sealed to (and therefore authorized) when their
    /// identity decodes to a curve point.
    #[inline]
    pub fn is_valid(&self) -> bool {
        if self.0.iter().all(|&b| b == 0) {
            return false;
        }
        VerifyingKey::try_from(self.0.as_slice()).is_ok()
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for Identity {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl From<Identity> for [u8; 32] {
    fn from(identity: Identity) -> Self {
        identity.0
    }
}

impl AsRef<[u8]> for Identity {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Distance between two equal-length identity strings.
///
/// # Panics
/// Panics if `a` and `b` differ in length. Identities of different lengths
/// never share a metric space, so this is a caller bug.
pub fn distance(a: &[u8], b: &[u8]) -> Vec<u8> {
    assert_eq!(a.len(), b.len(), "distance requires equal-length identities");
    let mut out = vec![0u8; a.len()];
    subtract_abs(a, b, &mut out);
    out
}

/// Writes `|a - b|` into `out`. All three slices have the same length.
fn subtract_abs(a: &[u8], b: &[u8], out: &mut [u8]) {
    let (hi, lo) = if b > a { (b, a) } else { (a, b) };
    let mut borrow = 0i16;
    for i in (0..hi.len()).rev() {
        let mut res = hi[i] as i16 - lo[i] as i16 - borrow;
        borrow = if res < 0 { 1 } else { 0 };
        if res < 0 {
            res += 256;
        }
        out[i] = res as u8;
    }
}

/// Bounded memo of identity distances.
///
/// Keys are unordered pairs, so `get(a, b)` and `get(b, a)` share one slot.
pub struct DistanceCache {
    entries: LruCache<(Identity, Identity), Distance>,
}

impl DistanceCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
        }
    }

    pub fn get(&mut self, a: &Identity, b: &Identity) -> Distance {
        let key = if a <= b { (*a, *b) } else { (*b, *a) };
        if let Some(d) = self.entries.get(&key) {
            return *d;
        }
        let d = a.distance(b);
        self.entries.put(key, d);
        d
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for DistanceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistanceCache")
            .field("len", &self.entries.len())
            .field("capacity", &self.entries.cap())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_single_byte() {
        let c = distance(&[10], &[4]);
        assert_eq!(c, vec![6]);
        assert_eq!(c, distance(&[4], &[10]));
    }

    #[test]
    fn test_distance_full_range() {
        let c = distance(&[0xFF, 0xFF, 0xFF], &[0x00, 0x00, 0x00]);
        assert_eq!(c, vec![0xFF, 0xFF, 0xFF]);
        assert_eq!(c, distance(&[0x00, 0x00, 0x00], &[0xFF, 0xFF, 0xFF]));
    }

    #[test]
    fn test_distance_borrow_propagation() {
        let c = distance(&[0xFF, 0x0A, 0x0A], &[0x00, 0x14, 0x14]);
        assert_eq!(c, vec![0xFE, 0xF5, 0xF6]);
        assert_eq!(c, distance(&[0x00, 0x14, 0x14], &[0xFF, 0x0A, 0x0A]));
    }

    #[test]
    fn test_distance_to_self_is_zero() {
        let a = [0x12u8, 0x34, 0x56, 0x78];
        assert_eq!(distance(&a, &a), vec![0u8; 4]);

        let id = Keypair::from_credentials("login1", "password1").identity();
        assert_eq!(id.distance(&id), [0u8; 32]);
    }

    #[test]
    #[should_panic(expected = "equal-length")]
    fn test_distance_rejects_unequal_lengths() {
        let _ = distance(&[1, 2], &[1, 2, 3]);
    }

    #[test]
    fn test_identity_distance_matches_slice_distance() {
        let a = Keypair::from_credentials("alice", "pw").identity();
        let b = Keypair::from_credentials("bob", "pw").identity();
        assert_eq!(a.distance(&b).to_vec(), distance(a.as_bytes(), b.as_bytes()));
        assert_eq!(a.distance(&b), b.distance(&a));
    }

    #[test]
    fn test_distance_order_is_numeric() {
        let mut center = [0u8; 32];
        center[31] = 100;
        let mut near = [0u8; 32];
        near[31] = 90;
        let mut far = [0u8; 32];
        far[30] = 1;
        let center = Identity::from_bytes(center);
        assert!(center.distance(&Identity::from_bytes(near)) < center.distance(&Identity::from_bytes(far)));
    }

    #[test]
    fn test_credentials_are_deterministic() {
        let kp1 = Keypair::from_credentials("login1", "password1");
        let kp2 = Keypair::from_credentials("login2", "password2");
        let kp3 = Keypair::from_credentials("login1", "password1");

        assert_eq!(kp1.secret_key_bytes(), kp3.secret_key_bytes());
        assert_eq!(kp1.identity(), kp3.identity());
        assert_ne!(kp1.secret_key_bytes(), kp2.secret_key_bytes());
        assert_ne!(kp1.identity(), kp2.identity());
    }

    #[test]
    fn test_credentials_are_length_prefixed() {
        let a = Keypair::from_credentials("ab", "c");
        let b = Keypair::from_credentials("a", "bc");
        assert_ne!(a.identity(), b.identity());
    }

    #[test]
    fn test_generated_identities_are_valid() {
        let kp1 = Keypair::generate();
        let kp2 = Keypair::generate();
        assert_ne!(kp1.identity(), kp2.identity());
        assert!(kp1.identity().is_valid());
        assert!(!Identity::from_bytes([0u8; 32]).is_valid());
    }

    #[test]
    fn test_identity_hex_roundtrip() {
        let id = Keypair::from_credentials("hex", "pw").identity();
        assert_eq!(Identity::from_hex(&id.to_hex()).unwrap(), id);
        assert!(Identity::from_hex("abcd").is_err());
    }

    #[test]
    fn test_distance_cache_is_bounded_and_symmetric() {
        let mut cache = DistanceCache::new(2);
        let ids: Vec<Identity> = (1u8..=4).map(|i| Identity::from_bytes([i; 32])).collect();

        assert_eq!(cache.get(&ids[0], &ids[1]), ids[0].distance(&ids[1]));
        assert_eq!(cache.get(&ids[1], &ids[0]), ids[0].distance(&ids[1]));
        assert_eq!(cache.len(), 1);

        cache.get(&ids[0], &ids[2]);
        cache.get(&ids[0], &ids[3]);
        assert_eq!(cache.len(), 2);
    }
}
