//! X25519 Diffie-Hellman key exchange
//!
//! Key pairs are clamped at construction and wiped from memory on drop.

use std::fmt;

use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Key length for X25519 (both private and public keys are 32 bytes)
pub const KEY_LEN: usize = 32;

/// An X25519 key pair with a clamped private scalar
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyPair {
    private_key: [u8; KEY_LEN],
    public_key: [u8; KEY_LEN],
}

impl KeyPair {
    /// Generate a key pair from the operating system's CSPRNG
    pub fn generate() -> Result<Self, CryptoError> {
        Self::generate_with(&mut OsRng)
    }

    /// Generate a key pair from the given random source
    ///
    /// A failing source is reported as [`CryptoError::RandomUnavailable`];
    /// there is no fallback to weaker randomness.
    pub fn generate_with<R: RngCore + CryptoRng>(rng: &mut R) -> Result<Self, CryptoError> {
        let mut bytes = [0u8; KEY_LEN];
        rng.try_fill_bytes(&mut bytes)
            .map_err(|e| CryptoError::RandomUnavailable {
                reason: e.to_string(),
            })?;
        let pair = Self::from_private(bytes);
        bytes.zeroize();
        Ok(pair)
    }

    /// Build a key pair from raw private key bytes, clamping them first
    pub fn from_private(mut private_key: [u8; KEY_LEN]) -> Self {
        clamp(&mut private_key);
        let public_key = public_key(&private_key);
        Self {
            private_key,
            public_key,
        }
    }

    pub fn private_key(&self) -> &[u8; KEY_LEN] {
        &self.private_key
    }

    pub fn public_key(&self) -> &[u8; KEY_LEN] {
        &self.public_key
    }

    /// DH between this key pair's private key and a peer public key
    pub fn dh(&self, peer_public: &[u8; KEY_LEN]) -> Result<[u8; KEY_LEN], CryptoError> {
        diffie_hellman(&self.private_key, peer_public)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &&self.public_key[..8])
            .finish_non_exhaustive()
    }
}

/// Clamp a Curve25519 scalar in place
pub fn clamp(scalar: &mut [u8; KEY_LEN]) {
    scalar[0] &= 248;
    scalar[31] &= 127;
    scalar[31] |= 64;
}

/// Derive public key from private key
pub fn public_key(private_key: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    let secret = StaticSecret::from(*private_key);
    PublicKey::from(&secret).to_bytes()
}

/// Perform X25519 Diffie-Hellman key exchange
///
/// Both inputs must be exactly 32 bytes. A shared secret of all zeros
/// (the peer sent a low-order point) is rejected.
pub fn diffie_hellman(private_key: &[u8], peer_public: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
    let mut private = to_key(private_key)?;
    let public = to_key(peer_public)?;

    let secret = StaticSecret::from(private);
    private.zeroize();

    let shared = secret.diffie_hellman(&PublicKey::from(public));
    if !shared.was_contributory() {
        return Err(CryptoError::NonContributory);
    }
    Ok(shared.to_bytes())
}

fn to_key(bytes: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
    bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
        expected: KEY_LEN,
        got: bytes.len(),
    })
}
