//! AEAD encryption for WireGuard
//!
//! ChaCha20-Poly1305 for handshake fields and transport packets,
//! XChaCha20-Poly1305 for cookie replies. Tags are appended to the
//! ciphertext; any tag mismatch is reported as
//! [`CryptoError::AuthenticationFailed`] without releasing plaintext.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce, XChaCha20Poly1305, XNonce,
};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Authentication tag length
pub const TAG_LEN: usize = 16;

/// ChaCha20-Poly1305 key length
pub const KEY_LEN: usize = 32;

/// ChaCha20-Poly1305 nonce length
pub const NONCE_LEN: usize = 12;

/// XChaCha20-Poly1305 nonce length
pub const XNONCE_LEN: usize = 24;

/// Build the transport nonce for a packet counter
///
/// Four zero bytes followed by the counter in little-endian order.
pub fn transport_nonce(counter: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// Encrypt plaintext using ChaCha20-Poly1305
pub fn encrypt(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    ChaCha20Poly1305::new(Key::from_slice(key))
        .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::Encryption)
}

/// Decrypt and authenticate ciphertext (with appended tag) using ChaCha20-Poly1305
pub fn decrypt(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::AuthenticationFailed);
    }

    ChaCha20Poly1305::new(Key::from_slice(key))
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::AuthenticationFailed)
}

/// Encrypt using XChaCha20-Poly1305 (cookie replies)
pub fn xencrypt(
    key: &[u8; KEY_LEN],
    nonce: &[u8; XNONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    XChaCha20Poly1305::new(Key::from_slice(key))
        .encrypt(XNonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::Encryption)
}

/// Decrypt using XChaCha20-Poly1305 (cookie replies)
pub fn xdecrypt(
    key: &[u8; KEY_LEN],
    nonce: &[u8; XNONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::AuthenticationFailed);
    }

    XChaCha20Poly1305::new(Key::from_slice(key))
        .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::AuthenticationFailed)
}

/// One direction of a transport session
///
/// Holds the key for the lifetime of the session and seals packets with
/// counter nonces and empty associated data.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PacketKey {
    key: [u8; KEY_LEN],
}

impl PacketKey {
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.key
    }

    /// Seal a packet under the given counter
    pub fn seal(&self, counter: u64, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        encrypt(&self.key, &transport_nonce(counter), plaintext, &[])
    }

    /// Open a packet sealed under the given counter
    pub fn open(&self, counter: u64, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        decrypt(&self.key, &transport_nonce(counter), ciphertext, &[])
    }
}

impl std::fmt::Debug for PacketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PacketKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_nonce_layout() {
        let nonce = transport_nonce(0x0102_0304_0506_0708);
        assert_eq!(nonce, [0, 0, 0, 0, 8, 7, 6, 5, 4, 3, 2, 1]);
    }

    #[test]
    fn test_encrypt_appends_tag() {
        let key = [0u8; 32];
        let plaintext = b"Hello, WireGuard!";
        let nonce = transport_nonce(42);

        let ciphertext = encrypt(&key, &nonce, plaintext, b"ad").unwrap();
        assert_eq!(ciphertext.len(), plaintext.len() + TAG_LEN);

        let decrypted = decrypt(&key, &nonce, &ciphertext, b"ad").unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_rfc8439_vector() {
        let key: [u8; 32] =
            hex::decode("808182838485868788898a8b8c8d8e8f909192939495969798999a9b9c9d9e9f")
                .unwrap()
                .try_into()
                .unwrap();
        let nonce: [u8; 12] = hex::decode("070000004041424344454647")
            .unwrap()
            .try_into()
            .unwrap();
        let aad = hex::decode("50515253c0c1c2c3c4c5c6c7").unwrap();
        let plaintext = b"Ladies and Gentlemen of the class of '99: If I could offer you only one tip for the future, sunscreen would be it.";

        let sealed = encrypt(&key, &nonce, plaintext, &aad).unwrap();
        assert_eq!(
            hex::encode(&sealed[plaintext.len()..]),
            "1ae10b594f09e26a7e902ecbd0600691"
        );
    }

    #[test]
    fn test_every_bit_flip_fails_authentication() {
        let key = [9u8; 32];
        let nonce = transport_nonce(3);
        let ciphertext = encrypt(&key, &nonce, b"abc", &[]).unwrap();

        for byte in 0..ciphertext.len() {
            for bit in 0..8 {
                let mut tampered = ciphertext.clone();
                tampered[byte] ^= 1 << bit;
                assert_eq!(
                    decrypt(&key, &nonce, &tampered, &[]),
                    Err(CryptoError::AuthenticationFailed)
                );
            }
        }
    }

    #[test]
    fn test_wrong_nonce_or_aad_fails() {
        let key = [0u8; 32];
        let ciphertext = encrypt(&key, &transport_nonce(42), b"payload", b"correct").unwrap();

        assert!(decrypt(&key, &transport_nonce(43), &ciphertext, b"correct").is_err());
        assert!(decrypt(&key, &transport_nonce(42), &ciphertext, b"wrong").is_err());
    }

    #[test]
    fn test_short_ciphertext_rejected() {
        let result = decrypt(&[0u8; 32], &transport_nonce(0), &[0u8; TAG_LEN - 1], &[]);
        assert_eq!(result, Err(CryptoError::AuthenticationFailed));
    }

    #[test]
    fn test_xchacha_roundtrip() {
        let key = [3u8; 32];
        let nonce = [5u8; 24];

        let ciphertext = xencrypt(&key, &nonce, b"cookie-cookie-16", b"mac1").unwrap();
        assert_eq!(ciphertext.len(), 32);
        assert_eq!(
            xdecrypt(&key, &nonce, &ciphertext, b"mac1").unwrap(),
            b"cookie-cookie-16"
        );
        assert!(xdecrypt(&key, &nonce, &ciphertext, b"mac2").is_err());
    }

    #[test]
    fn test_packet_key_counters_are_distinct() {
        let key = PacketKey::new([1u8; 32]);
        let first = key.seal(0, b"same").unwrap();
        let second = key.seal(1, b"same").unwrap();

        assert_ne!(first, second);
        assert_eq!(key.open(1, &second).unwrap(), b"same");
        assert!(key.open(0, &second).is_err());
    }
}
