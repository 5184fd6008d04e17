//! Noise IKpsk2 handshake state machine for both roles
//!
//! A [`HandshakeSession`] drives one handshake attempt and, once
//! established, the transport session it produces:
//!
//! ```text
//! initiator: Initial --create_initiation--> InitiationSent --process_response--> Established
//! responder: Initial --process_initiation--> InitiationReceived --create_response--> Established
//! ```
//!
//! Any verification failure moves the session to `Failed`, which is
//! absorbing: ephemeral keys and the chaining key are wiped and every
//! further call returns `IllegalState`. Retries use a fresh session.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use tai64::Tai64N;
use zeroize::{Zeroize, Zeroizing};

use crate::crypto::noise::{Role, SymmetricState};
use crate::crypto::x25519::KeyPair;
use crate::error::{CryptoError, ProtocolError, Result, VeilGuardError};
use crate::protocol::cookie::{self, COOKIE_LEN};
use crate::protocol::messages::{HandshakeInitiation, HandshakeResponse, TransportData};
use crate::protocol::session::{REJECT_AFTER_TIME, REKEY_AFTER_TIME};
use crate::protocol::transport::TransportState;

/// Length of an encoded TAI64N timestamp
const TIMESTAMP_LEN: usize = 12;

/// Handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Initial,
    InitiationSent,
    InitiationReceived,
    Established,
    Failed,
}

impl HandshakeState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Initial => "Initial",
            Self::InitiationSent => "InitiationSent",
            Self::InitiationReceived => "InitiationReceived",
            Self::Established => "Established",
            Self::Failed => "Failed",
        }
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What the responder learned from a valid initiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitiationInfo {
    /// Initiator's static public key
    pub peer_static: [u8; 32],
    /// Timestamp the initiator embedded, for replay checks
    pub timestamp: Tai64N,
}

/// One handshake attempt and the session it establishes
pub struct HandshakeSession {
    role: Role,
    state: HandshakeState,
    local_static: Arc<KeyPair>,
    remote_static: Option<[u8; 32]>,
    preshared_key: Zeroizing<[u8; 32]>,
    local_index: u32,
    remote_index: Option<u32>,
    local_ephemeral: Option<KeyPair>,
    remote_ephemeral: Option<[u8; 32]>,
    symmetric: SymmetricState,
    last_mac1: Option<[u8; 16]>,
    transport: Option<TransportState>,
    established_at: Option<Instant>,
}

impl HandshakeSession {
    /// Start a handshake towards a known responder
    pub fn new_initiator(
        local_static: Arc<KeyPair>,
        remote_static: [u8; 32],
        preshared_key: Option<[u8; 32]>,
        local_index: u32,
    ) -> Self {
        Self {
            role: Role::Initiator,
            state: HandshakeState::Initial,
            symmetric: SymmetricState::new(&remote_static),
            local_static,
            remote_static: Some(remote_static),
            preshared_key: Zeroizing::new(preshared_key.unwrap_or_default()),
            local_index,
            remote_index: None,
            local_ephemeral: None,
            remote_ephemeral: None,
            last_mac1: None,
            transport: None,
            established_at: None,
        }
    }

    /// Wait for an initiation addressed to `local_static`
    pub fn new_responder(local_static: Arc<KeyPair>, local_index: u32) -> Self {
        Self {
            role: Role::Responder,
            state: HandshakeState::Initial,
            symmetric: SymmetricState::new(local_static.public_key()),
            local_static,
            remote_static: None,
            preshared_key: Zeroizing::new([0u8; 32]),
            local_index,
            remote_index: None,
            local_ephemeral: None,
            remote_ephemeral: None,
            last_mac1: None,
            transport: None,
            established_at: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == HandshakeState::Established
    }

    pub fn local_index(&self) -> u32 {
        self.local_index
    }

    pub fn remote_index(&self) -> Option<u32> {
        self.remote_index
    }

    /// Peer's static key (known up front for initiators, learned by responders)
    pub fn remote_static(&self) -> Option<&[u8; 32]> {
        self.remote_static.as_ref()
    }

    /// MAC1 of the last handshake message we sent, needed to open cookie replies
    pub fn last_mac1(&self) -> Option<&[u8; 16]> {
        self.last_mac1.as_ref()
    }

    pub fn sending_key(&self) -> Option<&[u8; 32]> {
        self.transport.as_ref().map(TransportState::sending_key)
    }

    pub fn receiving_key(&self) -> Option<&[u8; 32]> {
        self.transport.as_ref().map(TransportState::receiving_key)
    }

    pub fn sending_counter(&self) -> Option<u64> {
        self.transport.as_ref().map(TransportState::sending_counter)
    }

    pub fn receiving_counter(&self) -> Option<u64> {
        self.transport.as_ref().and_then(TransportState::receiving_counter)
    }

    /// Time since the session was established
    pub fn age(&self) -> Option<Duration> {
        self.established_at.map(|at| at.elapsed())
    }

    /// Whether the initiator should start a new handshake for this peer
    pub fn needs_rekey(&self) -> bool {
        self.needs_rekey_after(REKEY_AFTER_TIME)
    }

    /// Like [`needs_rekey`](Self::needs_rekey) with a custom session lifetime
    pub fn needs_rekey_after(&self, rekey_after: Duration) -> bool {
        match (&self.transport, self.age()) {
            (Some(transport), Some(age)) => transport.needs_rekey() || age >= rekey_after,
            _ => false,
        }
    }

    /// Whether the session is too old to carry traffic
    pub fn is_expired(&self) -> bool {
        self.is_expired_after(REJECT_AFTER_TIME)
    }

    pub fn is_expired_after(&self, reject_after: Duration) -> bool {
        self.age().map_or(false, |age| age >= reject_after)
    }

    /// Build the first handshake message using the OS RNG and current time
    pub fn create_initiation(&mut self) -> Result<HandshakeInitiation> {
        self.create_initiation_with(&mut OsRng, Tai64N::now(), None)
    }

    /// Build the first handshake message
    ///
    /// `cookie` is the value from a previous Cookie Reply, if any; it keys MAC2.
    pub fn create_initiation_with<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        timestamp: Tai64N,
        cookie: Option<&[u8; COOKIE_LEN]>,
    ) -> Result<HandshakeInitiation> {
        self.require(Role::Initiator, HandshakeState::Initial, "create_initiation")?;
        let result = self.build_initiation(rng, timestamp, cookie);
        self.settle(result, HandshakeState::InitiationSent)
    }

    fn build_initiation<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        timestamp: Tai64N,
        cookie: Option<&[u8; COOKIE_LEN]>,
    ) -> Result<HandshakeInitiation> {
        let remote_static = self.remote_static.ok_or(ProtocolError::NoSession)?;

        let ephemeral = KeyPair::generate_with(rng)?;
        let ephemeral_public = *ephemeral.public_key();
        self.symmetric.mix_hash(&ephemeral_public);
        self.symmetric.mix_chain(&ephemeral_public);

        // es
        let es = Zeroizing::new(ephemeral.dh(&remote_static)?);
        let key = self.symmetric.mix_key(&*es);
        let encrypted_static = self
            .symmetric
            .encrypt_and_hash(&key, self.local_static.public_key())?;

        // ss
        let ss = Zeroizing::new(self.local_static.dh(&remote_static)?);
        let key = self.symmetric.mix_key(&*ss);
        let encrypted_timestamp = self.symmetric.encrypt_and_hash(&key, &timestamp.to_bytes())?;

        let mut msg = HandshakeInitiation {
            sender_index: self.local_index,
            unencrypted_ephemeral: ephemeral_public,
            encrypted_static: to_array(encrypted_static)?,
            encrypted_timestamp: to_array(encrypted_timestamp)?,
            mac1: [0u8; 16],
            mac2: [0u8; 16],
        };
        cookie::seal_macs(&mut msg, &remote_static, cookie);

        self.last_mac1 = Some(msg.mac1);
        self.local_ephemeral = Some(ephemeral);

        tracing::debug!(
            "Created handshake initiation (sender_index={}, ephemeral={:02x?})",
            self.local_index,
            &ephemeral_public[..8]
        );

        Ok(msg)
    }

    /// Consume the responder's reply and derive transport keys
    pub fn process_response(&mut self, msg: &HandshakeResponse) -> Result<()> {
        self.require(Role::Initiator, HandshakeState::InitiationSent, "process_response")?;
        let result = self.consume_response(msg);
        self.settle(result, HandshakeState::Established)
    }

    fn consume_response(&mut self, msg: &HandshakeResponse) -> Result<()> {
        if msg.receiver_index != self.local_index {
            return Err(ProtocolError::InvalidReceiverIndex {
                index: msg.receiver_index,
            }
            .into());
        }
        cookie::verify_mac1(msg, self.local_static.public_key())?;

        let ephemeral = self.local_ephemeral.take().ok_or(ProtocolError::NoSession)?;
        let responder_ephemeral = msg.unencrypted_ephemeral;

        self.symmetric.mix_hash(&responder_ephemeral);
        self.symmetric.mix_chain(&responder_ephemeral);

        // ee
        let ee = Zeroizing::new(ephemeral.dh(&responder_ephemeral)?);
        self.symmetric.mix_key(&*ee);

        // se
        let se = Zeroizing::new(self.local_static.dh(&responder_ephemeral)?);
        self.symmetric.mix_key(&*se);

        // psk
        let key = self.symmetric.mix_key_and_hash(&self.preshared_key);
        let nothing = self.symmetric.decrypt_and_hash(&key, &msg.encrypted_nothing)?;
        if !nothing.is_empty() {
            return Err(CryptoError::AuthenticationFailed.into());
        }

        self.remote_index = Some(msg.sender_index);
        self.remote_ephemeral = Some(responder_ephemeral);
        self.establish();
        Ok(())
    }

    /// Validate an initiation addressed to us and learn who sent it
    ///
    /// The caller decides whether the peer is acceptable; if not it calls
    /// [`abandon`](Self::abandon), otherwise [`create_response`](Self::create_response).
    pub fn process_initiation(&mut self, msg: &HandshakeInitiation) -> Result<InitiationInfo> {
        self.require(Role::Responder, HandshakeState::Initial, "process_initiation")?;
        let result = self.consume_initiation(msg);
        self.settle(result, HandshakeState::InitiationReceived)
    }

    fn consume_initiation(&mut self, msg: &HandshakeInitiation) -> Result<InitiationInfo> {
        cookie::verify_mac1(msg, self.local_static.public_key())?;

        let initiator_ephemeral = msg.unencrypted_ephemeral;
        self.symmetric.mix_hash(&initiator_ephemeral);
        self.symmetric.mix_chain(&initiator_ephemeral);

        // es
        let es = Zeroizing::new(self.local_static.dh(&initiator_ephemeral)?);
        let key = self.symmetric.mix_key(&*es);
        let peer_static: [u8; 32] = to_array(self.symmetric.decrypt_and_hash(&key, &msg.encrypted_static)?)?;

        // ss
        let ss = Zeroizing::new(self.local_static.dh(&peer_static)?);
        let key = self.symmetric.mix_key(&*ss);
        let timestamp = self
            .symmetric
            .decrypt_and_hash(&key, &msg.encrypted_timestamp)?;
        if timestamp.len() != TIMESTAMP_LEN {
            return Err(CryptoError::AuthenticationFailed.into());
        }
        let timestamp =
            Tai64N::from_slice(&timestamp).map_err(|_| CryptoError::AuthenticationFailed)?;

        self.remote_static = Some(peer_static);
        self.remote_index = Some(msg.sender_index);
        self.remote_ephemeral = Some(initiator_ephemeral);

        tracing::debug!(
            "Accepted initiation (sender_index={}, peer={:02x?})",
            msg.sender_index,
            &peer_static[..8]
        );

        Ok(InitiationInfo {
            peer_static,
            timestamp,
        })
    }

    /// Answer a processed initiation using the OS RNG
    pub fn create_response(&mut self, preshared_key: Option<[u8; 32]>) -> Result<HandshakeResponse> {
        self.create_response_with(&mut OsRng, preshared_key, None)
    }

    /// Answer a processed initiation and derive transport keys
    pub fn create_response_with<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        preshared_key: Option<[u8; 32]>,
        cookie: Option<&[u8; COOKIE_LEN]>,
    ) -> Result<HandshakeResponse> {
        self.require(Role::Responder, HandshakeState::InitiationReceived, "create_response")?;
        *self.preshared_key = preshared_key.unwrap_or_default();
        let result = self.build_response(rng, cookie);
        self.settle(result, HandshakeState::Established)
    }

    fn build_response<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        cookie: Option<&[u8; COOKIE_LEN]>,
    ) -> Result<HandshakeResponse> {
        let (Some(remote_static), Some(remote_ephemeral), Some(remote_index)) =
            (self.remote_static, self.remote_ephemeral, self.remote_index)
        else {
            return Err(ProtocolError::NoSession.into());
        };

        let ephemeral = KeyPair::generate_with(rng)?;
        let ephemeral_public = *ephemeral.public_key();
        self.symmetric.mix_hash(&ephemeral_public);
        self.symmetric.mix_chain(&ephemeral_public);

        // ee
        let ee = Zeroizing::new(ephemeral.dh(&remote_ephemeral)?);
        self.symmetric.mix_key(&*ee);

        // se
        let se = Zeroizing::new(ephemeral.dh(&remote_static)?);
        self.symmetric.mix_key(&*se);

        // psk
        let key = self.symmetric.mix_key_and_hash(&self.preshared_key);
        let encrypted_nothing = to_array(self.symmetric.encrypt_and_hash(&key, &[])?)?;

        let mut msg = HandshakeResponse {
            sender_index: self.local_index,
            receiver_index: remote_index,
            unencrypted_ephemeral: ephemeral_public,
            encrypted_nothing,
            mac1: [0u8; 16],
            mac2: [0u8; 16],
        };
        cookie::seal_macs(&mut msg, &remote_static, cookie);
        self.last_mac1 = Some(msg.mac1);

        self.establish();
        Ok(msg)
    }

    /// Give up on this handshake, wiping all secret state
    pub fn abandon(&mut self) {
        if self.state != HandshakeState::Failed {
            tracing::debug!(
                "Abandoning handshake (local_index={}, state={})",
                self.local_index,
                self.state
            );
        }
        self.wipe();
        self.state = HandshakeState::Failed;
    }

    /// Encrypt a packet on the established session
    pub fn encrypt_packet(&mut self, plaintext: &[u8]) -> Result<TransportData> {
        let state = self.state;
        let remote_index = self.remote_index;
        match (self.transport.as_mut(), remote_index) {
            (Some(transport), Some(remote_index)) => transport.encrypt(remote_index, plaintext),
            _ => Err(illegal("encrypt_packet", state)),
        }
    }

    /// Decrypt a packet received on the established session
    ///
    /// Failed decryptions drop the packet but leave the session usable.
    pub fn decrypt_packet(&mut self, packet: &TransportData) -> Result<Vec<u8>> {
        let state = self.state;
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| illegal("decrypt_packet", state))?;
        if packet.receiver_index != self.local_index {
            return Err(ProtocolError::InvalidReceiverIndex {
                index: packet.receiver_index,
            }
            .into());
        }
        transport.decrypt(packet)
    }

    /// Encrypt an empty keepalive packet
    pub fn create_keepalive(&mut self) -> Result<TransportData> {
        self.encrypt_packet(&[])
    }

    fn require(&self, role: Role, state: HandshakeState, operation: &'static str) -> Result<()> {
        if self.role != role || self.state != state {
            return Err(illegal(operation, self.state));
        }
        Ok(())
    }

    fn settle<T>(&mut self, result: Result<T>, next: HandshakeState) -> Result<T> {
        match result {
            Ok(value) => {
                self.state = next;
                Ok(value)
            }
            Err(err) => {
                tracing::warn!(
                    "Handshake failed (local_index={}, state={}): {}",
                    self.local_index,
                    self.state,
                    err
                );
                self.wipe();
                self.state = HandshakeState::Failed;
                Err(err)
            }
        }
    }

    fn establish(&mut self) {
        let keys = self.symmetric.split(self.role);
        self.transport = Some(TransportState::new(&keys));
        self.established_at = Some(Instant::now());
        self.local_ephemeral = None;
        self.symmetric.zeroize();

        tracing::info!(
            "Session established ({:?}, local_index={}, remote_index={:?})",
            self.role,
            self.local_index,
            self.remote_index
        );
    }

    fn wipe(&mut self) {
        self.local_ephemeral = None;
        self.transport = None;
        self.established_at = None;
        self.symmetric.zeroize();
        self.preshared_key.zeroize();
    }
}

impl fmt::Debug for HandshakeSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeSession")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("local_index", &self.local_index)
            .field("remote_index", &self.remote_index)
            .finish_non_exhaustive()
    }
}

fn illegal(operation: &'static str, state: HandshakeState) -> VeilGuardError {
    ProtocolError::IllegalState {
        operation,
        state: state.name(),
    }
    .into()
}

fn to_array<const N: usize>(bytes: Vec<u8>) -> std::result::Result<[u8; N], CryptoError> {
    bytes
        .try_into()
        .map_err(|_| CryptoError::AuthenticationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tai64::Tai64;

    struct Peers {
        initiator: HandshakeSession,
        responder: HandshakeSession,
    }

    fn identities() -> (Arc<KeyPair>, Arc<KeyPair>) {
        (
            Arc::new(KeyPair::from_private([0x11; 32])),
            Arc::new(KeyPair::from_private([0x22; 32])),
        )
    }

    fn fixed_time() -> Tai64N {
        Tai64N(Tai64(0x4000_0000_6500_0000), 123_456)
    }

    fn peers(psk: Option<[u8; 32]>) -> Peers {
        let (alice, bob) = identities();
        let bob_public = *bob.public_key();
        Peers {
            initiator: HandshakeSession::new_initiator(alice, bob_public, psk, 1),
            responder: HandshakeSession::new_responder(bob, 2),
        }
    }

    fn complete(peers: &mut Peers, psk: Option<[u8; 32]>, seed: u64) -> HandshakeResponse {
        let mut rng = StdRng::seed_from_u64(seed);
        let init = peers
            .initiator
            .create_initiation_with(&mut rng, fixed_time(), None)
            .unwrap();
        peers.responder.process_initiation(&init).unwrap();
        let response = peers
            .responder
            .create_response_with(&mut rng, psk, None)
            .unwrap();
        peers.initiator.process_response(&response).unwrap();
        response
    }

    #[test]
    fn test_full_handshake_derives_matching_keys() {
        let mut p = peers(None);
        complete(&mut p, None, 1);

        assert!(p.initiator.is_established());
        assert!(p.responder.is_established());
        assert_eq!(p.initiator.sending_key(), p.responder.receiving_key());
        assert_eq!(p.initiator.receiving_key(), p.responder.sending_key());
        assert_eq!(p.initiator.remote_index(), Some(2));
        assert_eq!(p.responder.remote_index(), Some(1));
    }

    #[test]
    fn test_responder_learns_initiator_identity_and_timestamp() {
        let (alice, _) = identities();
        let mut p = peers(None);
        let init = p
            .initiator
            .create_initiation_with(&mut StdRng::seed_from_u64(3), fixed_time(), None)
            .unwrap();

        let info = p.responder.process_initiation(&init).unwrap();
        assert_eq!(info.peer_static, *alice.public_key());
        assert_eq!(info.timestamp, fixed_time());
        assert_eq!(p.responder.state(), HandshakeState::InitiationReceived);
    }

    #[test]
    fn test_psk_mismatch_fails_initiator() {
        let mut p = peers(Some([7u8; 32]));
        let mut rng = StdRng::seed_from_u64(5);
        let init = p
            .initiator
            .create_initiation_with(&mut rng, fixed_time(), None)
            .unwrap();
        p.responder.process_initiation(&init).unwrap();
        let response = p
            .responder
            .create_response_with(&mut rng, Some([8u8; 32]), None)
            .unwrap();

        let err = p.initiator.process_response(&response).unwrap_err();
        assert!(err.invalidates_handshake());
        assert_eq!(p.initiator.state(), HandshakeState::Failed);
        assert!(p.initiator.sending_key().is_none());
    }

    #[test]
    fn test_wrong_responder_key_fails_mac1() {
        let (alice, _) = identities();
        let stranger = Arc::new(KeyPair::from_private([0x33; 32]));
        let bob = KeyPair::from_private([0x22; 32]);

        let mut initiator = HandshakeSession::new_initiator(alice, *bob.public_key(), None, 1);
        let mut wrong = HandshakeSession::new_responder(stranger, 9);

        let init = initiator.create_initiation().unwrap();
        let err = wrong.process_initiation(&init).unwrap_err();
        assert!(matches!(
            err,
            VeilGuardError::Protocol(ProtocolError::MacVerificationFailed)
        ));
        assert_eq!(wrong.state(), HandshakeState::Failed);
    }

    #[test]
    fn test_tampered_response_fails_and_is_absorbing() {
        let mut p = peers(None);
        let mut rng = StdRng::seed_from_u64(9);
        let init = p
            .initiator
            .create_initiation_with(&mut rng, fixed_time(), None)
            .unwrap();
        p.responder.process_initiation(&init).unwrap();
        let mut response = p.responder.create_response_with(&mut rng, None, None).unwrap();
        response.encrypted_nothing[3] ^= 0x40;

        assert!(p.initiator.process_response(&response).is_err());
        assert_eq!(p.initiator.state(), HandshakeState::Failed);

        let again = p.initiator.process_response(&response).unwrap_err();
        assert!(matches!(
            again,
            VeilGuardError::Protocol(ProtocolError::IllegalState {
                operation: "process_response",
                state: "Failed"
            })
        ));
    }

    #[test]
    fn test_out_of_order_calls_are_illegal() {
        let mut p = peers(None);

        assert!(matches!(
            p.initiator.encrypt_packet(b"too early"),
            Err(VeilGuardError::Protocol(ProtocolError::IllegalState {
                operation: "encrypt_packet",
                state: "Initial"
            }))
        ));

        let response = HandshakeResponse {
            sender_index: 2,
            receiver_index: 1,
            unencrypted_ephemeral: [0u8; 32],
            encrypted_nothing: [0u8; 16],
            mac1: [0u8; 16],
            mac2: [0u8; 16],
        };
        assert!(matches!(
            p.initiator.process_response(&response),
            Err(VeilGuardError::Protocol(ProtocolError::IllegalState { .. }))
        ));
        assert!(matches!(
            p.responder.create_initiation(),
            Err(VeilGuardError::Protocol(ProtocolError::IllegalState { .. }))
        ));
        assert!(matches!(
            p.responder.create_response(None),
            Err(VeilGuardError::Protocol(ProtocolError::IllegalState { .. }))
        ));
        // Illegal calls do not disturb the session
        assert_eq!(p.initiator.state(), HandshakeState::Initial);
        assert!(p.initiator.create_initiation().is_ok());
        assert!(matches!(
            p.initiator.create_initiation(),
            Err(VeilGuardError::Protocol(ProtocolError::IllegalState { .. }))
        ));
    }

    #[test]
    fn test_response_with_wrong_receiver_index_fails() {
        let mut p = peers(None);
        let mut rng = StdRng::seed_from_u64(11);
        let init = p
            .initiator
            .create_initiation_with(&mut rng, fixed_time(), None)
            .unwrap();
        p.responder.process_initiation(&init).unwrap();
        let mut response = p.responder.create_response_with(&mut rng, None, None).unwrap();
        response.receiver_index = 99;

        assert!(matches!(
            p.initiator.process_response(&response),
            Err(VeilGuardError::Protocol(ProtocolError::InvalidReceiverIndex { index: 99 }))
        ));
    }

    #[test]
    fn test_seeded_handshakes_are_deterministic() {
        let mut first = peers(Some([4u8; 32]));
        let mut second = peers(Some([4u8; 32]));
        let a = complete(&mut first, Some([4u8; 32]), 21);
        let b = complete(&mut second, Some([4u8; 32]), 21);

        assert_eq!(a, b);
        assert_eq!(first.initiator.sending_key(), second.initiator.sending_key());
    }

    #[test]
    fn test_transport_after_handshake() {
        let mut p = peers(None);
        complete(&mut p, None, 13);

        let packet = p.initiator.encrypt_packet(&[0x01, 0x02, 0x03]).unwrap();
        assert_eq!(packet.receiver_index, 2);
        assert_eq!(packet.counter, 0);
        assert_eq!(p.responder.decrypt_packet(&packet).unwrap(), vec![0x01, 0x02, 0x03]);

        let reply = p.responder.encrypt_packet(b"pong").unwrap();
        assert_eq!(p.initiator.decrypt_packet(&reply).unwrap(), b"pong");

        let misrouted = TransportData {
            receiver_index: 77,
            ..packet
        };
        assert!(matches!(
            p.responder.decrypt_packet(&misrouted),
            Err(VeilGuardError::Protocol(ProtocolError::InvalidReceiverIndex { index: 77 }))
        ));
    }

    #[test]
    fn test_transport_auth_failure_keeps_session() {
        let mut p = peers(None);
        complete(&mut p, None, 17);

        let mut packet = p.initiator.encrypt_packet(b"payload").unwrap();
        let genuine = packet.clone();
        packet.encrypted_data[0] ^= 1;

        assert!(p.responder.decrypt_packet(&packet).is_err());
        assert!(p.responder.is_established());
        assert_eq!(p.responder.decrypt_packet(&genuine).unwrap(), b"payload");
    }

    #[test]
    fn test_abandon_wipes_session() {
        let mut p = peers(None);
        complete(&mut p, None, 19);

        p.responder.abandon();
        assert_eq!(p.responder.state(), HandshakeState::Failed);
        assert!(p.responder.sending_key().is_none());
        assert!(p.responder.create_keepalive().is_err());
    }

    #[test]
    fn test_fresh_session_is_not_due_for_rekey() {
        let mut p = peers(None);
        assert!(!p.initiator.needs_rekey());
        complete(&mut p, None, 23);
        assert!(!p.initiator.needs_rekey());
        assert!(!p.initiator.is_expired());
    }
}
