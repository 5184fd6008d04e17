//! Noise IKpsk2 symmetric state for WireGuard
//!
//! Pattern: `Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s`
//!
//! Both roles start from the same transcript hash (seeded with the
//! responder's static public key) and advance it with the same sequence
//! of `mix_*` calls, so a mismatch anywhere surfaces as an AEAD failure.

use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::{aead, blake2s};
use crate::error::CryptoError;

/// Noise protocol construction string
pub const CONSTRUCTION: &[u8] = b"Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s";

/// WireGuard identifier string
pub const IDENTIFIER: &[u8] = b"WireGuard v1 zx2c4 Jason@zx2c4.com";

/// Label for MAC1 key derivation
pub const LABEL_MAC1: &[u8] = b"mac1----";

/// Label for cookie key derivation
pub const LABEL_COOKIE: &[u8] = b"cookie--";

/// Hash length (also chaining key length)
pub const HASH_LEN: usize = 32;

/// Which side of the handshake a party plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Chaining key and transcript hash of an in-progress handshake
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricState {
    chaining_key: [u8; HASH_LEN],
    hash: [u8; HASH_LEN],
}

impl SymmetricState {
    /// Initial state for a handshake towards `responder_static`
    ///
    /// ck = HASH(CONSTRUCTION)
    /// h = HASH(HASH(ck || IDENTIFIER) || responder_static)
    pub fn new(responder_static: &[u8; 32]) -> Self {
        let chaining_key = blake2s::hash(&[CONSTRUCTION]);
        let h = blake2s::hash(&[&chaining_key, IDENTIFIER]);
        Self {
            chaining_key,
            hash: blake2s::hash(&[&h, responder_static]),
        }
    }

    pub fn chaining_key(&self) -> &[u8; HASH_LEN] {
        &self.chaining_key
    }

    pub fn hash(&self) -> &[u8; HASH_LEN] {
        &self.hash
    }

    /// h = HASH(h || data)
    pub fn mix_hash(&mut self, data: &[u8]) {
        self.hash = blake2s::hash(&[&self.hash, data]);
    }

    /// ck = KDF1(ck, data), used for unencrypted ephemeral keys
    pub fn mix_chain(&mut self, data: &[u8]) {
        self.chaining_key = blake2s::kdf1(&self.chaining_key, data);
    }

    /// (ck, k) = KDF2(ck, input); returns k
    pub fn mix_key(&mut self, input: &[u8]) -> Zeroizing<[u8; 32]> {
        let (chaining_key, key) = blake2s::kdf2(&self.chaining_key, input);
        self.chaining_key = chaining_key;
        Zeroizing::new(key)
    }

    /// (ck, τ, k) = KDF3(ck, psk); h = HASH(h || τ); returns k
    pub fn mix_key_and_hash(&mut self, psk: &[u8; 32]) -> Zeroizing<[u8; 32]> {
        let (chaining_key, mut tau, key) = blake2s::kdf3(&self.chaining_key, psk);
        self.chaining_key = chaining_key;
        self.mix_hash(&tau);
        tau.zeroize();
        Zeroizing::new(key)
    }

    /// c = AEAD(k, 0, plaintext, h); h = HASH(h || c)
    pub fn encrypt_and_hash(
        &mut self,
        key: &[u8; 32],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let ciphertext = aead::encrypt(key, &aead::transport_nonce(0), plaintext, &self.hash)?;
        self.mix_hash(&ciphertext);
        Ok(ciphertext)
    }

    /// p = AEAD-Open(k, 0, c, h); h = HASH(h || c)
    ///
    /// The transcript is only advanced when authentication succeeds.
    pub fn decrypt_and_hash(
        &mut self,
        key: &[u8; 32],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let plaintext = aead::decrypt(key, &aead::transport_nonce(0), ciphertext, &self.hash)?;
        self.mix_hash(ciphertext);
        Ok(plaintext)
    }

    /// Derive the transport keys once the handshake is complete
    pub fn split(&self, role: Role) -> TransportKeys {
        let (initiator_to_responder, responder_to_initiator) =
            blake2s::kdf2(&self.chaining_key, &[]);
        match role {
            Role::Initiator => TransportKeys {
                sending: initiator_to_responder,
                receiving: responder_to_initiator,
            },
            Role::Responder => TransportKeys {
                sending: responder_to_initiator,
                receiving: initiator_to_responder,
            },
        }
    }
}

/// Transport keys derived from a completed handshake
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct TransportKeys {
    sending: [u8; 32],
    receiving: [u8; 32],
}

impl TransportKeys {
    pub fn sending(&self) -> &[u8; 32] {
        &self.sending
    }

    pub fn receiving(&self) -> &[u8; 32] {
        &self.receiving
    }
}

/// mac1_key = HASH(LABEL_MAC1 || peer_public_key)
pub fn mac1_key(peer_public: &[u8; 32]) -> [u8; 32] {
    blake2s::hash(&[LABEL_MAC1, peer_public])
}

/// cookie_key = HASH(LABEL_COOKIE || peer_public_key)
pub fn cookie_key(peer_public: &[u8; 32]) -> [u8; 32] {
    blake2s::hash(&[LABEL_COOKIE, peer_public])
}
