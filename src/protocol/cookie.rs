//! MAC1/MAC2 and cookie handling for WireGuard DoS protection
//!
//! Every handshake message carries MAC1, keyed by the receiver's static
//! public key. A responder under load additionally demands MAC2, keyed by
//! a cookie bound to the sender's address. When MAC2 is missing or stale it
//! answers with a Cookie Reply instead of doing any DH work; the initiator
//! decrypts the cookie and uses it for its next attempts.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::crypto::{aead, blake2s, noise};
use crate::error::{CryptoError, ProtocolError, VeilGuardError};
use crate::protocol::messages::{CookieReply, MacProtected};

/// Cookie validity duration
pub const COOKIE_VALIDITY: Duration = Duration::from_secs(120);

/// Length of a decrypted cookie
pub const COOKIE_LEN: usize = 16;

/// Fill in MAC1 (and MAC2 when a cookie is held) for a message bound for `peer_public`
pub fn seal_macs<M: MacProtected>(msg: &mut M, peer_public: &[u8; 32], cookie: Option<&[u8; COOKIE_LEN]>) {
    let mac1_key = noise::mac1_key(peer_public);
    let bytes = msg.to_wire();
    let mac1 = blake2s::mac(&mac1_key, &[&bytes[..M::MAC1_OFFSET]]);
    msg.set_mac1(mac1);

    let mac2 = match cookie {
        Some(cookie) => {
            let bytes = msg.to_wire();
            blake2s::mac(cookie, &[&bytes[..M::MAC2_OFFSET]])
        }
        None => [0u8; 16],
    };
    msg.set_mac2(mac2);
}

/// Verify MAC1 of a message addressed to `local_public`, in constant time
pub fn verify_mac1<M: MacProtected>(msg: &M, local_public: &[u8; 32]) -> Result<(), ProtocolError> {
    let bytes = msg.to_wire();
    let expected = blake2s::mac(&noise::mac1_key(local_public), &[&bytes[..M::MAC1_OFFSET]]);
    if bool::from(expected[..].ct_eq(&msg.mac1()[..])) {
        Ok(())
    } else {
        Err(ProtocolError::MacVerificationFailed)
    }
}

/// State for tracking received cookies (initiator side)
#[derive(Debug, Clone, Default)]
pub struct CookieState {
    cookie: Option<[u8; COOKIE_LEN]>,
    received_at: Option<Instant>,
}

impl CookieState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if we have a valid (non-expired) cookie
    pub fn has_valid_cookie(&self) -> bool {
        matches!(self.received_at, Some(received) if received.elapsed() < COOKIE_VALIDITY)
            && self.cookie.is_some()
    }

    /// Get the current cookie if valid
    pub fn get_cookie(&self) -> Option<&[u8; COOKIE_LEN]> {
        if self.has_valid_cookie() {
            self.cookie.as_ref()
        } else {
            None
        }
    }

    /// Decrypt and store the cookie from a Cookie Reply
    ///
    /// `our_last_mac1` is the MAC1 of the handshake message the reply answers.
    pub fn process_cookie_reply(
        &mut self,
        reply: &CookieReply,
        our_last_mac1: &[u8; 16],
        peer_public: &[u8; 32],
    ) -> Result<(), VeilGuardError> {
        let key = noise::cookie_key(peer_public);
        let mut decrypted = aead::xdecrypt(&key, &reply.nonce, &reply.encrypted_cookie, our_last_mac1)?;

        let cookie: [u8; COOKIE_LEN] = decrypted
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::AuthenticationFailed)?;
        decrypted.zeroize();

        self.cookie = Some(cookie);
        self.received_at = Some(Instant::now());

        tracing::debug!("Stored new cookie (valid for {}s)", COOKIE_VALIDITY.as_secs());

        Ok(())
    }

    pub fn clear(&mut self) {
        if let Some(cookie) = self.cookie.as_mut() {
            cookie.zeroize();
        }
        self.cookie = None;
        self.received_at = None;
    }
}

/// Responder-side cookie issuing and MAC2 checking
pub struct CookieChecker {
    secret: [u8; 32],
    rotated_at: Instant,
    cookie_key: [u8; 32],
    under_load: bool,
}

impl CookieChecker {
    /// Create a checker for the responder whose static public key is `local_public`
    pub fn new(local_public: &[u8; 32]) -> Result<Self, CryptoError> {
        let mut checker = Self {
            secret: [0u8; 32],
            rotated_at: Instant::now(),
            cookie_key: noise::cookie_key(local_public),
            under_load: false,
        };
        checker.rotate_secret(&mut OsRng)?;
        Ok(checker)
    }

    pub fn is_under_load(&self) -> bool {
        self.under_load
    }

    /// Toggle whether MAC2 is demanded from initiators
    pub fn set_under_load(&mut self, under_load: bool) {
        if under_load != self.under_load {
            tracing::info!("Cookie protection {}", if under_load { "enabled" } else { "disabled" });
        }
        self.under_load = under_load;
    }

    fn rotate_secret<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> Result<(), CryptoError> {
        rng.try_fill_bytes(&mut self.secret)
            .map_err(|e| CryptoError::RandomUnavailable {
                reason: e.to_string(),
            })?;
        self.rotated_at = Instant::now();
        Ok(())
    }

    fn refresh(&mut self) -> Result<(), CryptoError> {
        if self.rotated_at.elapsed() >= COOKIE_VALIDITY {
            self.rotate_secret(&mut OsRng)?;
        }
        Ok(())
    }

    /// cookie = MAC(secret, ip || port)
    pub fn cookie_for(&mut self, source: SocketAddr) -> Result<[u8; COOKIE_LEN], CryptoError> {
        self.refresh()?;
        let port = source.port().to_be_bytes();
        let cookie = match source.ip() {
            std::net::IpAddr::V4(ip) => blake2s::mac(&self.secret, &[&ip.octets(), &port]),
            std::net::IpAddr::V6(ip) => blake2s::mac(&self.secret, &[&ip.octets(), &port]),
        };
        Ok(cookie)
    }

    /// Verify MAC2 against the cookie for `source`
    pub fn verify_mac2<M: MacProtected>(&mut self, msg: &M, source: SocketAddr) -> Result<(), VeilGuardError> {
        let cookie = self.cookie_for(source)?;
        let bytes = msg.to_wire();
        let expected = blake2s::mac(&cookie, &[&bytes[..M::MAC2_OFFSET]]);
        if bool::from(expected[..].ct_eq(&msg.mac2()[..])) {
            Ok(())
        } else {
            Err(ProtocolError::MacVerificationFailed.into())
        }
    }

    /// Build a Cookie Reply for a handshake message from `source`
    pub fn create_reply<M: MacProtected>(
        &mut self,
        msg: &M,
        receiver_index: u32,
        source: SocketAddr,
    ) -> Result<CookieReply, VeilGuardError> {
        self.create_reply_with(&mut OsRng, msg, receiver_index, source)
    }

    pub fn create_reply_with<R: RngCore + CryptoRng, M: MacProtected>(
        &mut self,
        rng: &mut R,
        msg: &M,
        receiver_index: u32,
        source: SocketAddr,
    ) -> Result<CookieReply, VeilGuardError> {
        let mut cookie = self.cookie_for(source)?;

        let mut nonce = [0u8; aead::XNONCE_LEN];
        rng.try_fill_bytes(&mut nonce)
            .map_err(|e| CryptoError::RandomUnavailable {
                reason: e.to_string(),
            })?;

        let sealed = aead::xencrypt(&self.cookie_key, &nonce, &cookie, msg.mac1())?;
        cookie.zeroize();
        let encrypted_cookie = sealed
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::Encryption)?;

        tracing::debug!("Issuing cookie reply to {}", source);

        Ok(CookieReply {
            receiver_index,
            nonce,
            encrypted_cookie,
        })
    }
}

impl Drop for CookieChecker {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}
