//! WireGuard protocol implementation
//!
//! This module contains the core protocol components:
//! - Message wire formats
//! - Handshake logic (Noise IKpsk2, both roles)
//! - Cookie/DoS protection
//! - Transport encryption and replay protection
//! - Session slots, timers and the responder peer table

pub mod cookie;
pub mod handshake;
pub mod messages;
pub mod peer;
pub mod session;
pub mod transport;

pub use cookie::{CookieChecker, CookieState};
pub use handshake::{HandshakeSession, HandshakeState, InitiationInfo};
pub use messages::{
    CookieReply, HandshakeInitiation, HandshakeResponse, MessageType, TransportData, WireMessage,
};
pub use peer::{Responder, ResponderOutcome};
pub use session::{PeerSessions, RetryPolicy, SessionTimers};
pub use transport::{ReplayWindow, TransportState};
