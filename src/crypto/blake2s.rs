//! BLAKE2s primitives: hash, keyed MAC, and HKDF
//!
//! The Noise KDF used by WireGuard is plain RFC 5869 HKDF over
//! HMAC-BLAKE2s with the chaining key as salt and an empty info string,
//! so `kdf1`/`kdf2`/`kdf3` are thin wrappers around [`hkdf`].

use blake2::{
    digest::{consts::U16, FixedOutput, Mac as MacTrait},
    Blake2s256, Blake2sMac, Digest,
};
use hkdf::SimpleHkdf;
use zeroize::Zeroizing;

use crate::error::CryptoError;

type HkdfBlake2s = SimpleHkdf<Blake2s256>;

/// Length of BLAKE2s-256 hash output
pub const HASH_LEN: usize = 32;

/// Length of BLAKE2s MAC output (16 bytes for WireGuard)
pub const MAC_LEN: usize = 16;

/// BLAKE2s-256 over the concatenation of `parts`
pub fn hash(parts: &[&[u8]]) -> [u8; HASH_LEN] {
    let mut hasher = Blake2s256::new();
    for part in parts {
        Digest::update(&mut hasher, part);
    }
    hasher.finalize().into()
}

/// Key sizes accepted by [`mac`]: 16-byte cookies and 32-byte keys
pub trait MacKey: sealed::Sealed {
    fn key_bytes(&self) -> &[u8];
}

impl MacKey for [u8; 16] {
    fn key_bytes(&self) -> &[u8] {
        self
    }
}

impl MacKey for [u8; 32] {
    fn key_bytes(&self) -> &[u8] {
        self
    }
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for [u8; 16] {}
    impl Sealed for [u8; 32] {}
}

/// Keyed BLAKE2s with a 16-byte output over the concatenation of `parts`
///
/// Used for MAC1 (32-byte key) and MAC2 / cookies (16- or 32-byte key).
pub fn mac<K: MacKey>(key: &K, parts: &[&[u8]]) -> [u8; MAC_LEN] {
    // MacKey is only implemented for keys BLAKE2s accepts
    let mut mac = Blake2sMac::<U16>::new_from_slice(key.key_bytes())
        .expect("BLAKE2s key is at most 32 bytes");
    for part in parts {
        MacTrait::update(&mut mac, part);
    }
    mac.finalize_fixed().into()
}

/// HKDF (extract-then-expand) with HMAC-BLAKE2s
pub fn hkdf(ikm: &[u8], salt: &[u8], info: &[u8], output_len: usize) -> Result<Vec<u8>, CryptoError> {
    let kdf = HkdfBlake2s::new(Some(salt), ikm);
    let mut okm = vec![0u8; output_len];
    kdf.expand(info, &mut okm)
        .map_err(|_| CryptoError::KeyDerivation)?;
    Ok(okm)
}

fn kdf_blocks<const N: usize>(chaining_key: &[u8; HASH_LEN], input: &[u8]) -> [[u8; HASH_LEN]; N] {
    let kdf = HkdfBlake2s::new(Some(&chaining_key[..]), input);
    let mut okm = Zeroizing::new([0u8; HASH_LEN * 3]);
    // At most three blocks, well under the HKDF output limit
    kdf.expand(&[], &mut okm[..HASH_LEN * N])
        .expect("HKDF output of at most 96 bytes");

    let mut out = [[0u8; HASH_LEN]; N];
    for (i, block) in out.iter_mut().enumerate() {
        block.copy_from_slice(&okm[i * HASH_LEN..(i + 1) * HASH_LEN]);
    }
    out
}

/// KDF1: one 32-byte output
pub fn kdf1(chaining_key: &[u8; HASH_LEN], input: &[u8]) -> [u8; HASH_LEN] {
    let [t1] = kdf_blocks::<1>(chaining_key, input);
    t1
}

/// KDF2: two 32-byte outputs
pub fn kdf2(chaining_key: &[u8; HASH_LEN], input: &[u8]) -> ([u8; HASH_LEN], [u8; HASH_LEN]) {
    let [t1, t2] = kdf_blocks::<2>(chaining_key, input);
    (t1, t2)
}

/// KDF3: three 32-byte outputs
pub fn kdf3(
    chaining_key: &[u8; HASH_LEN],
    input: &[u8],
) -> ([u8; HASH_LEN], [u8; HASH_LEN], [u8; HASH_LEN]) {
    let [t1, t2, t3] = kdf_blocks::<3>(chaining_key, input);
    (t1, t2, t3)
}
