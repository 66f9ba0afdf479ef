//! Key material for veil devices and peers.
//!
//! Provides three things:
//!   1. X25519 key handling — public-from-private and static-static
//!      precomputation for peers
//!   2. BLAKE3 hashing — stateless handshake response (cookie) keys
//!   3. Hex key parsing for configuration files
//!
//! Private, preshared and precomputed keys live in `Zeroizing` buffers and
//! are wiped when dropped. There is no unsafe code in this module.

use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::schema::KEY_LEN;

/// A raw 32-byte key.
pub type Key = [u8; KEY_LEN];

/// Label mixed into the mac1 key derivation.
const LABEL_MAC1: &[u8] = b"mac1----";
/// Label mixed into the cookie key derivation.
const LABEL_COOKIE: &[u8] = b"cookie--";

// ── Helpers ───────────────────────────────────────────────────────────────────

/// True if every byte is zero. Does not short-circuit.
pub fn is_zero(bytes: &[u8]) -> bool {
    bytes.iter().fold(0u8, |acc, b| acc | b) == 0
}

// ── Keypair ───────────────────────────────────────────────────────────────────

/// A device's static X25519 identity.
///
/// An all-zero private key is not an identity: setting it clears the
/// device's keys instead.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Keypair {
    /// Private key — zeroized on drop, never exposed directly.
    private: Zeroizing<Key>,
    pub public: Key,
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::thread_rng());
        let public = PublicKey::from(&secret);
        Self {
            private: Zeroizing::new(secret.to_bytes()),
            public: *public.as_bytes(),
        }
    }

    /// Reconstruct a keypair from private key bytes. Returns `None` for the
    /// all-zero key.
    pub fn from_private(private: &Key) -> Option<Self> {
        let public = public_from_private(private)?;
        Some(Self {
            private: Zeroizing::new(*private),
            public,
        })
    }

    /// Copy of the private key for serialization.
    pub fn private_bytes(&self) -> Zeroizing<Key> {
        Zeroizing::new(*self.private)
    }

    /// Precompute the static-static Diffie-Hellman result with a peer.
    ///
    /// Returns `None` when the result is all zeros, i.e. the remote key is a
    /// low-order point that can never complete a handshake.
    pub fn precompute_static_static(&self, remote: &Key) -> Option<Zeroizing<Key>> {
        let secret = StaticSecret::from(*self.private);
        let shared = secret.diffie_hellman(&PublicKey::from(*remote));
        if is_zero(shared.as_bytes()) {
            return None;
        }
        Some(Zeroizing::new(*shared.as_bytes()))
    }
}

/// Derive the public key for `private`, or `None` for the all-zero key.
pub fn public_from_private(private: &Key) -> Option<Key> {
    if is_zero(private) {
        return None;
    }
    let secret = StaticSecret::from(*private);
    Some(*PublicKey::from(&secret).as_bytes())
}

// ── Cookie keys ───────────────────────────────────────────────────────────────

/// Keys used to answer handshakes statelessly while under load.
///
/// Both are derived from the device public key, so they change whenever the
/// device identity does.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct CookieKeys {
    pub mac1: Zeroizing<Key>,
    pub cookie: Zeroizing<Key>,
}

impl CookieKeys {
    pub fn derive(public: &Key) -> Self {
        Self {
            mac1: Zeroizing::new(labelled_hash(LABEL_MAC1, public)),
            cookie: Zeroizing::new(labelled_hash(LABEL_COOKIE, public)),
        }
    }

    /// Keys for a device without an identity.
    pub fn empty() -> Self {
        Self {
            mac1: Zeroizing::new([0u8; KEY_LEN]),
            cookie: Zeroizing::new([0u8; KEY_LEN]),
        }
    }
}

fn labelled_hash(label: &[u8], public: &Key) -> Key {
    let mut h = blake3::Hasher::new();
    h.update(label);
    h.update(public);
    *h.finalize().as_bytes()
}

// ── Hex ───────────────────────────────────────────────────────────────────────

/// Parse a hex-encoded key, ignoring surrounding whitespace.
pub fn parse_hex_key(text: &str) -> Result<Zeroizing<Key>, KeyError> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    hex::decode_to_slice(text.trim(), &mut *key).map_err(|_| KeyError::BadHex)?;
    Ok(key)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("key is not 64 hex characters")]
    BadHex,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
