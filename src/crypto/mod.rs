//! Cryptographic primitives for WireGuard
//!
//! - BLAKE2s hashing, keyed MAC, and HKDF key derivation (blake2s)
//! - ChaCha20-Poly1305 and XChaCha20-Poly1305 AEAD (aead)
//! - X25519 Diffie-Hellman key exchange (x25519)
//! - Noise IKpsk2 symmetric state (noise)

pub mod aead;
pub mod blake2s;
pub mod noise;
pub mod x25519;
