//! Responder-side peer table
//!
//! A [`Responder`] owns the local identity, the set of peers allowed to
//! connect, and the cookie checker. It turns an incoming initiation into
//! either a cookie reply or an established session.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tai64::Tai64N;
use zeroize::Zeroizing;

use crate::crypto::x25519::KeyPair;
use crate::error::{ProtocolError, Result};
use crate::protocol::cookie::{self, CookieChecker};
use crate::protocol::handshake::HandshakeSession;
use crate::protocol::messages::{CookieReply, HandshakeInitiation, HandshakeResponse};
use crate::protocol::session::generate_index;

/// A peer the responder accepts handshakes from
#[derive(Debug)]
pub struct PeerEntry {
    pub public_key: [u8; 32],
    preshared_key: Option<Zeroizing<[u8; 32]>>,
    latest_timestamp: Option<Tai64N>,
}

impl PeerEntry {
    /// Timestamp of the newest accepted initiation from this peer
    pub fn latest_timestamp(&self) -> Option<Tai64N> {
        self.latest_timestamp
    }
}

/// Result of handling an initiation
#[derive(Debug)]
pub enum ResponderOutcome {
    /// Under load and MAC2 missing or wrong: send this instead of responding
    Cookie(CookieReply),
    /// Handshake complete on our side
    Established {
        peer: [u8; 32],
        response: HandshakeResponse,
        session: HandshakeSession,
    },
}

/// Local identity plus the peers it will talk to
pub struct Responder {
    identity: Arc<KeyPair>,
    peers: HashMap<[u8; 32], PeerEntry>,
    cookies: CookieChecker,
}

impl Responder {
    pub fn new(identity: Arc<KeyPair>) -> Result<Self> {
        let cookies = CookieChecker::new(identity.public_key())?;
        Ok(Self {
            identity,
            peers: HashMap::new(),
            cookies,
        })
    }

    pub fn identity(&self) -> &Arc<KeyPair> {
        &self.identity
    }

    /// Allow handshakes from `public_key`, replacing any previous entry
    pub fn add_peer(&mut self, public_key: [u8; 32], preshared_key: Option<[u8; 32]>) {
        tracing::debug!("Adding peer {:02x?}", &public_key[..8]);
        self.peers.insert(
            public_key,
            PeerEntry {
                public_key,
                preshared_key: preshared_key.map(Zeroizing::new),
                latest_timestamp: None,
            },
        );
    }

    pub fn remove_peer(&mut self, public_key: &[u8; 32]) -> bool {
        self.peers.remove(public_key).is_some()
    }

    pub fn peer(&self, public_key: &[u8; 32]) -> Option<&PeerEntry> {
        self.peers.get(public_key)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn cookies_mut(&mut self) -> &mut CookieChecker {
        &mut self.cookies
    }

    /// Process an initiation from `from`
    ///
    /// MAC1 is checked before any DH. Under load a missing or wrong MAC2
    /// yields a cookie reply. Unknown peers and replayed timestamps are
    /// rejected and the half-built session is abandoned.
    pub fn handle_initiation(
        &mut self,
        msg: &HandshakeInitiation,
        from: SocketAddr,
    ) -> Result<ResponderOutcome> {
        cookie::verify_mac1(msg, self.identity.public_key())?;

        if self.cookies.is_under_load() && self.cookies.verify_mac2(msg, from).is_err() {
            let reply = self.cookies.create_reply(msg, msg.sender_index, from)?;
            return Ok(ResponderOutcome::Cookie(reply));
        }

        let mut session = HandshakeSession::new_responder(Arc::clone(&self.identity), generate_index());
        let info = session.process_initiation(msg)?;

        let Some(entry) = self.peers.get_mut(&info.peer_static) else {
            tracing::warn!("Initiation from unknown peer {:02x?}", &info.peer_static[..8]);
            session.abandon();
            return Err(ProtocolError::UnknownPeer.into());
        };

        if entry
            .latest_timestamp
            .map_or(false, |latest| info.timestamp <= latest)
        {
            tracing::warn!("Stale initiation timestamp from {:02x?}", &info.peer_static[..8]);
            session.abandon();
            return Err(ProtocolError::StaleTimestamp.into());
        }

        let psk = entry.preshared_key.as_deref().copied();
        let response = session.create_response(psk)?;
        entry.latest_timestamp = Some(info.timestamp);

        Ok(ResponderOutcome::Established {
            peer: info.peer_static,
            response,
            session,
        })
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("identity", &self.identity)
            .field("peers", &self.peers.len())
            .field("under_load", &self.cookies.is_under_load())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VeilGuardError;
    use crate::protocol::cookie::CookieState;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tai64::Tai64;

    fn addr() -> SocketAddr {
        "198.51.100.7:51820".parse().unwrap()
    }

    fn time(secs: u64) -> Tai64N {
        Tai64N(Tai64(0x4000_0000_0000_0000 + secs), 0)
    }

    struct Fixture {
        alice: Arc<KeyPair>,
        responder: Responder,
    }

    fn fixture(psk: Option<[u8; 32]>) -> Fixture {
        let alice = Arc::new(KeyPair::from_private([0xA1; 32]));
        let bob = Arc::new(KeyPair::from_private([0xB2; 32]));
        let mut responder = Responder::new(bob).unwrap();
        responder.add_peer(*alice.public_key(), psk);
        Fixture { alice, responder }
    }

    fn initiation(
        f: &Fixture,
        psk: Option<[u8; 32]>,
        at: Tai64N,
        cookie: Option<&[u8; 16]>,
    ) -> (HandshakeSession, HandshakeInitiation) {
        let bob_public = *f.responder.identity().public_key();
        let mut session = HandshakeSession::new_initiator(Arc::clone(&f.alice), bob_public, psk, 40);
        let msg = session
            .create_initiation_with(&mut StdRng::seed_from_u64(at.1 as u64), at, cookie)
            .unwrap();
        (session, msg)
    }

    #[test]
    fn test_known_peer_establishes() {
        let psk = Some([9u8; 32]);
        let mut f = fixture(psk);
        let (mut initiator, msg) = initiation(&f, psk, time(1), None);

        let outcome = f.responder.handle_initiation(&msg, addr()).unwrap();
        let ResponderOutcome::Established {
            peer,
            response,
            mut session,
        } = outcome
        else {
            panic!("expected established session");
        };

        assert_eq!(peer, *f.alice.public_key());
        initiator.process_response(&response).unwrap();

        let packet = initiator.encrypt_packet(b"hi").unwrap();
        assert_eq!(session.decrypt_packet(&packet).unwrap(), b"hi");
        assert_eq!(f.responder.peer(&peer).unwrap().latest_timestamp(), Some(time(1)));
    }

    #[test]
    fn test_unknown_peer_rejected() {
        let mut f = fixture(None);
        let alice_public = *f.alice.public_key();
        assert!(f.responder.remove_peer(&alice_public));

        let (_, msg) = initiation(&f, None, time(1), None);
        assert!(matches!(
            f.responder.handle_initiation(&msg, addr()),
            Err(VeilGuardError::Protocol(ProtocolError::UnknownPeer))
        ));
    }

    #[test]
    fn test_replayed_timestamp_rejected() {
        let mut f = fixture(None);
        let (_, first) = initiation(&f, None, time(10), None);
        assert!(f.responder.handle_initiation(&first, addr()).is_ok());

        assert!(matches!(
            f.responder.handle_initiation(&first, addr()),
            Err(VeilGuardError::Protocol(ProtocolError::StaleTimestamp))
        ));

        let (_, older) = initiation(&f, None, time(5), None);
        assert!(matches!(
            f.responder.handle_initiation(&older, addr()),
            Err(VeilGuardError::Protocol(ProtocolError::StaleTimestamp))
        ));

        let (_, newer) = initiation(&f, None, time(11), None);
        assert!(f.responder.handle_initiation(&newer, addr()).is_ok());
    }

    #[test]
    fn test_bad_mac1_rejected_before_dh() {
        let mut f = fixture(None);
        let (_, mut msg) = initiation(&f, None, time(1), None);
        msg.mac1[0] ^= 0xFF;

        assert!(matches!(
            f.responder.handle_initiation(&msg, addr()),
            Err(VeilGuardError::Protocol(ProtocolError::MacVerificationFailed))
        ));
        assert!(f.responder.peer(f.alice.public_key()).unwrap().latest_timestamp().is_none());
    }

    #[test]
    fn test_under_load_requires_cookie() {
        let mut f = fixture(None);
        f.responder.cookies_mut().set_under_load(true);

        let (first_session, first) = initiation(&f, None, time(1), None);
        let reply = match f.responder.handle_initiation(&first, addr()).unwrap() {
            ResponderOutcome::Cookie(reply) => reply,
            other => panic!("expected cookie reply, got {:?}", other),
        };
        assert_eq!(reply.receiver_index, 40);

        let mut cookies = CookieState::new();
        cookies
            .process_cookie_reply(
                &reply,
                first_session.last_mac1().unwrap(),
                f.responder.identity().public_key(),
            )
            .unwrap();

        let (_, retry) = initiation(&f, None, time(2), cookies.get_cookie());
        assert!(matches!(
            f.responder.handle_initiation(&retry, addr()).unwrap(),
            ResponderOutcome::Established { .. }
        ));
    }
}
