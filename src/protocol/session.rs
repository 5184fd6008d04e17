//! Session slots and timing for one peer
//!
//! A peer has at most one current session. A rekey produces a brand-new
//! [`HandshakeSession`] that replaces it; the replaced session lingers as
//! `previous` only so packets already in flight can still be decrypted.

use std::time::{Duration, Instant};

use rand::Rng;

use crate::protocol::handshake::HandshakeSession;

/// Initiate rekey after this much time
pub const REKEY_AFTER_TIME: Duration = Duration::from_secs(120);

/// Reject packets from sessions older than this
pub const REJECT_AFTER_TIME: Duration = Duration::from_secs(180);

/// Retransmit a handshake initiation after this long without a response
pub const REKEY_TIMEOUT: Duration = Duration::from_secs(5);

/// Give up on a handshake after trying for this long
pub const REKEY_ATTEMPT_TIME: Duration = Duration::from_secs(90);

/// Send a keepalive if nothing was sent within this time after receiving data
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// How handshakes are retransmitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Wait this long for a response before retransmitting
    pub retransmit_after: Duration,
    /// Total number of initiations sent before giving up
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retransmit_after: REKEY_TIMEOUT,
            max_attempts: (REKEY_ATTEMPT_TIME.as_secs() / REKEY_TIMEOUT.as_secs()) as u32,
        }
    }
}

/// Session lifetimes, normally the protocol constants above
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimers {
    /// Initiator starts a new handshake once its session is this old
    pub rekey_after: Duration,
    /// Sessions older than this carry no traffic
    pub reject_after: Duration,
    /// Passive keepalive delay after receiving data
    pub keepalive_after: Duration,
}

impl Default for SessionTimers {
    fn default() -> Self {
        Self {
            rekey_after: REKEY_AFTER_TIME,
            reject_after: REJECT_AFTER_TIME,
            keepalive_after: KEEPALIVE_TIMEOUT,
        }
    }
}

/// A handshake in flight (initiator side)
#[derive(Debug)]
pub struct PendingHandshake {
    pub session: HandshakeSession,
    pub sent_at: Instant,
    pub attempt: u32,
}

/// Current, previous, and pending sessions for one peer
#[derive(Debug, Default)]
pub struct PeerSessions {
    timers: SessionTimers,
    current: Option<HandshakeSession>,
    previous: Option<HandshakeSession>,
    pending: Option<PendingHandshake>,
    last_sent: Option<Instant>,
    last_received: Option<Instant>,
}

impl PeerSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timers(timers: SessionTimers) -> Self {
        Self {
            timers,
            ..Self::default()
        }
    }

    pub fn timers(&self) -> SessionTimers {
        self.timers
    }

    /// Current session if it is still allowed to carry traffic
    pub fn current(&self) -> Option<&HandshakeSession> {
        let reject_after = self.timers.reject_after;
        self.current.as_ref().filter(|s| !s.is_expired_after(reject_after))
    }

    pub fn current_mut(&mut self) -> Option<&mut HandshakeSession> {
        let reject_after = self.timers.reject_after;
        self.current.as_mut().filter(|s| !s.is_expired_after(reject_after))
    }

    /// Install a freshly established session, demoting the old one
    pub fn establish(&mut self, session: HandshakeSession) {
        debug_assert!(session.is_established());
        if let Some(old) = self.current.take() {
            self.previous = Some(old);
        }
        self.current = Some(session);
    }

    /// Find an established session by the index we assigned to it
    pub fn find_by_index(&mut self, local_index: u32) -> Option<&mut HandshakeSession> {
        let reject_after = self.timers.reject_after;
        [self.current.as_mut(), self.previous.as_mut()]
            .into_iter()
            .flatten()
            .find(|s| s.local_index() == local_index && !s.is_expired_after(reject_after))
    }

    pub fn pending(&self) -> Option<&PendingHandshake> {
        self.pending.as_ref()
    }

    pub fn set_pending(&mut self, session: HandshakeSession, attempt: u32) {
        self.pending = Some(PendingHandshake {
            session,
            sent_at: Instant::now(),
            attempt,
        });
    }

    /// Remove the pending handshake if its index matches
    pub fn take_pending(&mut self, local_index: u32) -> Option<PendingHandshake> {
        match &self.pending {
            Some(p) if p.session.local_index() == local_index => self.pending.take(),
            _ => None,
        }
    }

    pub fn cancel_pending(&mut self) -> Option<PendingHandshake> {
        self.pending.take()
    }

    /// Whether the current session should be replaced
    pub fn needs_rekey(&self) -> bool {
        let rekey_after = self.timers.rekey_after;
        self.pending.is_none()
            && self
                .current
                .as_ref()
                .map_or(false, |s| s.needs_rekey_after(rekey_after))
    }

    pub fn mark_sent(&mut self) {
        self.last_sent = Some(Instant::now());
    }

    pub fn mark_received(&mut self) {
        self.last_received = Some(Instant::now());
    }

    /// Whether nothing has been sent for `interval`; a zero interval never fires
    pub fn idle_for(&self, interval: Duration) -> bool {
        !interval.is_zero() && self.last_sent.map_or(true, |at| at.elapsed() >= interval)
    }

    pub fn last_received(&self) -> Option<Instant> {
        self.last_received
    }

    /// Data arrived a keepalive delay ago and nothing was sent since
    pub fn owes_keepalive(&self) -> bool {
        match (self.last_received, self.last_sent) {
            (Some(received), sent) => {
                received.elapsed() >= self.timers.keepalive_after
                    && sent.map_or(true, |sent| sent < received)
            }
            (None, _) => false,
        }
    }

    /// Drop sessions that may no longer carry traffic
    pub fn expire(&mut self) {
        let reject_after = self.timers.reject_after;
        if self.previous.as_ref().map_or(false, |s| s.is_expired_after(reject_after)) {
            self.previous = None;
        }
        if self.current.as_ref().map_or(false, |s| s.is_expired_after(reject_after)) {
            tracing::info!("Current session expired");
            self.current = None;
        }
    }

    pub fn clear(&mut self) {
        self.current = None;
        self.previous = None;
        self.pending = None;
    }
}

/// Generate a random session index
pub fn generate_index() -> u32 {
    rand::thread_rng().gen()
}
