//! Transport data encryption and replay protection
//!
//! A [`TransportState`] exists only for an established session. Sending
//! counters start at zero and never wrap; receiving counters are checked
//! against a sliding window before decryption and recorded only after the
//! packet authenticates.

use crate::crypto::aead::PacketKey;
use crate::crypto::noise::TransportKeys;
use crate::error::{ProtocolError, VeilGuardError};
use crate::protocol::messages::TransportData;

/// Start a new handshake once this many packets have been sent
pub const REKEY_AFTER_MESSAGES: u64 = 1 << 60;

/// Refuse to send or receive at or beyond this counter (2^64 - 2^13 - 1)
pub const REJECT_AFTER_MESSAGES: u64 = u64::MAX - (1 << 13);

/// Size of the anti-replay window in packets
pub const WINDOW_SIZE: u64 = 128;

/// Anti-replay window
///
/// Bit N of the bitmap represents counter `highest - N`.
#[derive(Debug, Clone, Default)]
pub struct ReplayWindow {
    highest: Option<u64>,
    bitmap: u128,
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest counter accepted so far
    pub fn highest(&self) -> Option<u64> {
        self.highest
    }

    /// Check a counter without recording it
    pub fn check(&self, counter: u64) -> Result<(), ProtocolError> {
        let rejected = ProtocolError::ReplayedOrExpiredCounter { counter };
        if counter >= REJECT_AFTER_MESSAGES {
            return Err(rejected);
        }

        match self.highest {
            None => Ok(()),
            Some(highest) if counter > highest => Ok(()),
            Some(highest) => {
                let age = highest - counter;
                if age >= WINDOW_SIZE || self.bitmap & (1u128 << age) != 0 {
                    Err(rejected)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Record a counter that passed [`check`](Self::check) and authenticated
    pub fn update(&mut self, counter: u64) {
        match self.highest {
            None => {
                self.highest = Some(counter);
                self.bitmap = 1;
            }
            Some(highest) if counter > highest => {
                let shift = counter - highest;
                self.bitmap = if shift >= WINDOW_SIZE {
                    1
                } else {
                    (self.bitmap << shift) | 1
                };
                self.highest = Some(counter);
            }
            Some(highest) => {
                let age = highest - counter;
                if age < WINDOW_SIZE {
                    self.bitmap |= 1u128 << age;
                }
            }
        }
    }

    /// Check and record in one step
    pub fn check_and_update(&mut self, counter: u64) -> Result<(), ProtocolError> {
        self.check(counter)?;
        self.update(counter);
        Ok(())
    }
}

/// Keys and counters of an established session
#[derive(Debug)]
pub struct TransportState {
    sending: PacketKey,
    receiving: PacketKey,
    sending_counter: u64,
    replay_window: ReplayWindow,
}

impl TransportState {
    pub fn new(keys: &TransportKeys) -> Self {
        Self {
            sending: PacketKey::new(*keys.sending()),
            receiving: PacketKey::new(*keys.receiving()),
            sending_counter: 0,
            replay_window: ReplayWindow::new(),
        }
    }

    pub fn sending_key(&self) -> &[u8; 32] {
        self.sending.as_bytes()
    }

    pub fn receiving_key(&self) -> &[u8; 32] {
        self.receiving.as_bytes()
    }

    /// Counter that the next outgoing packet will use
    pub fn sending_counter(&self) -> u64 {
        self.sending_counter
    }

    /// Highest authenticated incoming counter
    pub fn receiving_counter(&self) -> Option<u64> {
        self.replay_window.highest()
    }

    /// Encrypt a packet for the peer's `receiver_index`
    ///
    /// An empty plaintext produces a keepalive.
    pub fn encrypt(
        &mut self,
        receiver_index: u32,
        plaintext: &[u8],
    ) -> Result<TransportData, VeilGuardError> {
        if self.sending_counter >= REJECT_AFTER_MESSAGES {
            return Err(ProtocolError::CounterExhausted.into());
        }

        let counter = self.sending_counter;
        let encrypted_data = self.sending.seal(counter, plaintext)?;
        self.sending_counter += 1;

        Ok(TransportData {
            receiver_index,
            counter,
            encrypted_data,
        })
    }

    /// Decrypt a packet, enforcing the replay window
    pub fn decrypt(&mut self, packet: &TransportData) -> Result<Vec<u8>, VeilGuardError> {
        self.replay_window.check(packet.counter)?;
        let plaintext = self.receiving.open(packet.counter, &packet.encrypted_data)?;
        self.replay_window.update(packet.counter);
        Ok(plaintext)
    }

    /// Whether the counter-based rekey threshold has been reached
    pub fn needs_rekey(&self) -> bool {
        self.sending_counter >= REKEY_AFTER_MESSAGES
    }
}
