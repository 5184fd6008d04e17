//! WireGuard message wire formats
//!
//! Defines the packet structures for:
//! - Type 1: Handshake Initiation (148 bytes)
//! - Type 2: Handshake Response (92 bytes)
//! - Type 3: Cookie Reply (64 bytes)
//! - Type 4: Transport Data (16-byte header + encrypted payload)
//!
//! All integers are little-endian. Decoding is total: any input produces
//! either a message or a [`MalformedMessage`], never a panic.

use crate::crypto::aead::TAG_LEN;
use crate::error::MalformedMessage;

/// Default tunnel MTU, used to bound transport payloads
pub const DEFAULT_MTU: usize = 1420;

/// Largest UDP payload the codec will ever look at
pub const MAX_DATAGRAM_LEN: usize = 65535;

/// WireGuard message types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    HandshakeInitiation = 1,
    HandshakeResponse = 2,
    CookieReply = 3,
    TransportData = 4,
}

impl TryFrom<u8> for MessageType {
    type Error = MalformedMessage;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::HandshakeInitiation),
            2 => Ok(Self::HandshakeResponse),
            3 => Ok(Self::CookieReply),
            4 => Ok(Self::TransportData),
            _ => Err(MalformedMessage::UnknownType { msg_type: value }),
        }
    }
}

/// Handshake messages carrying MAC1/MAC2 trailers
///
/// MAC1 covers every byte before it; MAC2 covers every byte before it,
/// MAC1 included.
pub trait MacProtected {
    /// Offset of the MAC1 field in the encoded message
    const MAC1_OFFSET: usize;
    /// Offset of the MAC2 field in the encoded message
    const MAC2_OFFSET: usize;

    fn to_wire(&self) -> Vec<u8>;
    fn mac1(&self) -> &[u8; 16];
    fn mac2(&self) -> &[u8; 16];
    fn set_mac1(&mut self, mac1: [u8; 16]);
    fn set_mac2(&mut self, mac2: [u8; 16]);
}

/// Handshake Initiation message (148 bytes)
///
/// ```text
/// type(1) | reserved(3) | sender_index(4) | ephemeral_public(32) |
/// encrypted_static(48) | encrypted_timestamp(28) | mac1(16) | mac2(16)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeInitiation {
    pub sender_index: u32,
    pub unencrypted_ephemeral: [u8; 32],
    pub encrypted_static: [u8; 48],
    pub encrypted_timestamp: [u8; 28],
    pub mac1: [u8; 16],
    pub mac2: [u8; 16],
}

impl HandshakeInitiation {
    pub const SIZE: usize = 148;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = MessageType::HandshakeInitiation as u8;
        buf[4..8].copy_from_slice(&self.sender_index.to_le_bytes());
        buf[8..40].copy_from_slice(&self.unencrypted_ephemeral);
        buf[40..88].copy_from_slice(&self.encrypted_static);
        buf[88..116].copy_from_slice(&self.encrypted_timestamp);
        buf[116..132].copy_from_slice(&self.mac1);
        buf[132..148].copy_from_slice(&self.mac2);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, MalformedMessage> {
        expect_fixed(data, MessageType::HandshakeInitiation, Self::SIZE)?;
        Ok(Self {
            sender_index: read_u32(data, 4),
            unencrypted_ephemeral: read_array(data, 8),
            encrypted_static: read_array(data, 40),
            encrypted_timestamp: read_array(data, 88),
            mac1: read_array(data, 116),
            mac2: read_array(data, 132),
        })
    }
}

impl MacProtected for HandshakeInitiation {
    const MAC1_OFFSET: usize = 116;
    const MAC2_OFFSET: usize = 132;

    fn to_wire(&self) -> Vec<u8> {
        self.encode().to_vec()
    }
    fn mac1(&self) -> &[u8; 16] {
        &self.mac1
    }
    fn mac2(&self) -> &[u8; 16] {
        &self.mac2
    }
    fn set_mac1(&mut self, mac1: [u8; 16]) {
        self.mac1 = mac1;
    }
    fn set_mac2(&mut self, mac2: [u8; 16]) {
        self.mac2 = mac2;
    }
}

/// Handshake Response message (92 bytes)
///
/// ```text
/// type(1) | reserved(3) | sender_index(4) | receiver_index(4) |
/// ephemeral_public(32) | encrypted_nothing(16) | mac1(16) | mac2(16)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub sender_index: u32,
    pub receiver_index: u32,
    pub unencrypted_ephemeral: [u8; 32],
    pub encrypted_nothing: [u8; 16],
    pub mac1: [u8; 16],
    pub mac2: [u8; 16],
}

impl HandshakeResponse {
    pub const SIZE: usize = 92;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = MessageType::HandshakeResponse as u8;
        buf[4..8].copy_from_slice(&self.sender_index.to_le_bytes());
        buf[8..12].copy_from_slice(&self.receiver_index.to_le_bytes());
        buf[12..44].copy_from_slice(&self.unencrypted_ephemeral);
        buf[44..60].copy_from_slice(&self.encrypted_nothing);
        buf[60..76].copy_from_slice(&self.mac1);
        buf[76..92].copy_from_slice(&self.mac2);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, MalformedMessage> {
        expect_fixed(data, MessageType::HandshakeResponse, Self::SIZE)?;
        Ok(Self {
            sender_index: read_u32(data, 4),
            receiver_index: read_u32(data, 8),
            unencrypted_ephemeral: read_array(data, 12),
            encrypted_nothing: read_array(data, 44),
            mac1: read_array(data, 60),
            mac2: read_array(data, 76),
        })
    }
}

impl MacProtected for HandshakeResponse {
    const MAC1_OFFSET: usize = 60;
    const MAC2_OFFSET: usize = 76;

    fn to_wire(&self) -> Vec<u8> {
        self.encode().to_vec()
    }
    fn mac1(&self) -> &[u8; 16] {
        &self.mac1
    }
    fn mac2(&self) -> &[u8; 16] {
        &self.mac2
    }
    fn set_mac1(&mut self, mac1: [u8; 16]) {
        self.mac1 = mac1;
    }
    fn set_mac2(&mut self, mac2: [u8; 16]) {
        self.mac2 = mac2;
    }
}

/// Cookie Reply message (64 bytes)
///
/// ```text
/// type(1) | reserved(3) | receiver_index(4) | nonce(24) | encrypted_cookie(32)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieReply {
    pub receiver_index: u32,
    pub nonce: [u8; 24],
    pub encrypted_cookie: [u8; 32],
}

impl CookieReply {
    pub const SIZE: usize = 64;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = MessageType::CookieReply as u8;
        buf[4..8].copy_from_slice(&self.receiver_index.to_le_bytes());
        buf[8..32].copy_from_slice(&self.nonce);
        buf[32..64].copy_from_slice(&self.encrypted_cookie);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, MalformedMessage> {
        expect_fixed(data, MessageType::CookieReply, Self::SIZE)?;
        Ok(Self {
            receiver_index: read_u32(data, 4),
            nonce: read_array(data, 8),
            encrypted_cookie: read_array(data, 32),
        })
    }
}

/// Transport Data message
///
/// ```text
/// type(1) | reserved(3) | receiver_index(4) | counter(8) | encrypted_packet(n+16)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportData {
    pub receiver_index: u32,
    pub counter: u64,
    pub encrypted_data: Vec<u8>,
}

impl TransportData {
    /// Size of the transport header (not including encrypted payload)
    pub const HEADER_SIZE: usize = 16;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::HEADER_SIZE + self.encrypted_data.len());
        buf.push(MessageType::TransportData as u8);
        buf.extend_from_slice(&[0, 0, 0]);
        buf.extend_from_slice(&self.receiver_index.to_le_bytes());
        buf.extend_from_slice(&self.counter.to_le_bytes());
        buf.extend_from_slice(&self.encrypted_data);
        buf
    }

    /// Decode with the payload bounded by the default MTU
    pub fn decode(data: &[u8]) -> Result<Self, MalformedMessage> {
        Self::decode_bounded(data, DEFAULT_MTU)
    }

    /// Decode, rejecting encrypted payloads larger than `mtu` plus the tag
    pub fn decode_bounded(data: &[u8], mtu: usize) -> Result<Self, MalformedMessage> {
        check_type(data, MessageType::TransportData)?;
        if data.len() < Self::HEADER_SIZE {
            return Err(MalformedMessage::WrongLength {
                msg_type: MessageType::TransportData as u8,
                expected: Self::HEADER_SIZE,
                got: data.len(),
            });
        }
        check_reserved(data, MessageType::TransportData)?;

        let payload = &data[Self::HEADER_SIZE..];
        let limit = mtu.saturating_add(TAG_LEN).min(MAX_DATAGRAM_LEN);
        if payload.len() > limit {
            return Err(MalformedMessage::Oversized {
                limit,
                got: payload.len(),
            });
        }

        Ok(Self {
            receiver_index: read_u32(data, 4),
            counter: u64::from_le_bytes(read_array(data, 8)),
            encrypted_data: payload.to_vec(),
        })
    }
}

/// Any WireGuard message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    HandshakeInitiation(HandshakeInitiation),
    HandshakeResponse(HandshakeResponse),
    CookieReply(CookieReply),
    TransportData(TransportData),
}

impl WireMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::HandshakeInitiation(_) => MessageType::HandshakeInitiation,
            Self::HandshakeResponse(_) => MessageType::HandshakeResponse,
            Self::CookieReply(_) => MessageType::CookieReply,
            Self::TransportData(_) => MessageType::TransportData,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::HandshakeInitiation(msg) => msg.encode().to_vec(),
            Self::HandshakeResponse(msg) => msg.encode().to_vec(),
            Self::CookieReply(msg) => msg.encode().to_vec(),
            Self::TransportData(msg) => msg.encode(),
        }
    }

    /// Decode a datagram using the default MTU bound
    pub fn decode(data: &[u8]) -> Result<Self, MalformedMessage> {
        Self::decode_bounded(data, DEFAULT_MTU)
    }

    /// Decode a datagram, bounding transport payloads by the connection MTU
    pub fn decode_bounded(data: &[u8], mtu: usize) -> Result<Self, MalformedMessage> {
        match message_type(data)? {
            MessageType::HandshakeInitiation => {
                HandshakeInitiation::decode(data).map(Self::HandshakeInitiation)
            }
            MessageType::HandshakeResponse => {
                HandshakeResponse::decode(data).map(Self::HandshakeResponse)
            }
            MessageType::CookieReply => CookieReply::decode(data).map(Self::CookieReply),
            MessageType::TransportData => {
                TransportData::decode_bounded(data, mtu).map(Self::TransportData)
            }
        }
    }
}

impl From<HandshakeInitiation> for WireMessage {
    fn from(msg: HandshakeInitiation) -> Self {
        Self::HandshakeInitiation(msg)
    }
}

impl From<HandshakeResponse> for WireMessage {
    fn from(msg: HandshakeResponse) -> Self {
        Self::HandshakeResponse(msg)
    }
}

impl From<CookieReply> for WireMessage {
    fn from(msg: CookieReply) -> Self {
        Self::CookieReply(msg)
    }
}

impl From<TransportData> for WireMessage {
    fn from(msg: TransportData) -> Self {
        Self::TransportData(msg)
    }
}

/// Get the message type from a packet
pub fn message_type(data: &[u8]) -> Result<MessageType, MalformedMessage> {
    let first = data.first().ok_or(MalformedMessage::Empty)?;
    MessageType::try_from(*first)
}

fn check_type(data: &[u8], expected: MessageType) -> Result<(), MalformedMessage> {
    let actual = message_type(data)?;
    if actual != expected {
        return Err(MalformedMessage::UnknownType {
            msg_type: actual as u8,
        });
    }
    Ok(())
}

fn expect_fixed(data: &[u8], msg_type: MessageType, size: usize) -> Result<(), MalformedMessage> {
    check_type(data, msg_type)?;
    if data.len() != size {
        return Err(MalformedMessage::WrongLength {
            msg_type: msg_type as u8,
            expected: size,
            got: data.len(),
        });
    }
    check_reserved(data, msg_type)
}

// The type byte and the three reserved bytes form one little-endian u32
fn check_reserved(data: &[u8], msg_type: MessageType) -> Result<(), MalformedMessage> {
    if data[1..4] != [0, 0, 0] {
        return Err(MalformedMessage::ReservedNotZero {
            msg_type: msg_type as u8,
        });
    }
    Ok(())
}

// Callers validate lengths before reading fields.
fn read_array<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&data[offset..offset + N]);
    out
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(read_array(data, offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_initiation() -> HandshakeInitiation {
        HandshakeInitiation {
            sender_index: 0x12345678,
            unencrypted_ephemeral: [1u8; 32],
            encrypted_static: [2u8; 48],
            encrypted_timestamp: [3u8; 28],
            mac1: [4u8; 16],
            mac2: [5u8; 16],
        }
    }

    #[test]
    fn test_initiation_layout() {
        let bytes = sample_initiation().encode();

        assert_eq!(bytes.len(), 148);
        assert_eq!(&bytes[..4], &[1, 0, 0, 0]);
        assert_eq!(&bytes[4..8], &0x12345678u32.to_le_bytes());
        assert_eq!(bytes[116], 4);
        assert_eq!(bytes[147], 5);
        assert_eq!(HandshakeInitiation::decode(&bytes).unwrap(), sample_initiation());
    }

    #[test]
    fn test_response_layout() {
        let response = HandshakeResponse {
            sender_index: 0x11223344,
            receiver_index: 0x55667788,
            unencrypted_ephemeral: [6u8; 32],
            encrypted_nothing: [7u8; 16],
            mac1: [8u8; 16],
            mac2: [9u8; 16],
        };
        let bytes = response.encode();

        assert_eq!(bytes.len(), 92);
        assert_eq!(bytes[0], 2);
        assert_eq!(&bytes[8..12], &[0x88, 0x77, 0x66, 0x55]);
        assert_eq!(
            WireMessage::decode(&bytes).unwrap(),
            WireMessage::HandshakeResponse(response)
        );
    }

    #[test]
    fn test_cookie_reply_layout() {
        let reply = CookieReply {
            receiver_index: 9,
            nonce: [0xAB; 24],
            encrypted_cookie: [0xCD; 32],
        };
        let bytes = reply.encode();

        assert_eq!(bytes.len(), 64);
        assert_eq!(bytes[0], 3);
        assert_eq!(CookieReply::decode(&bytes).unwrap(), reply);
    }

    #[test]
    fn test_transport_layout() {
        let msg = TransportData {
            receiver_index: 42,
            counter: 1234,
            encrypted_data: vec![0xAA; 100],
        };
        let bytes = msg.encode();

        assert_eq!(bytes[0], 4);
        assert_eq!(bytes.len(), TransportData::HEADER_SIZE + 100);
        assert_eq!(&bytes[8..16], &1234u64.to_le_bytes());
        assert_eq!(
            WireMessage::decode(&bytes).unwrap(),
            WireMessage::TransportData(msg)
        );
    }

    #[test]
    fn test_fixed_sizes_must_match_exactly() {
        let mut bytes = sample_initiation().encode().to_vec();
        bytes.push(0);
        assert_eq!(
            WireMessage::decode(&bytes),
            Err(MalformedMessage::WrongLength {
                msg_type: 1,
                expected: 148,
                got: 149
            })
        );

        assert!(HandshakeResponse::decode(&[2u8; 91]).is_err());
        assert!(CookieReply::decode(&[3u8; 65]).is_err());
    }

    #[test]
    fn test_reserved_bytes_must_be_zero() {
        let mut initiation = sample_initiation().encode();
        initiation[2] = 0x01;
        assert_eq!(
            WireMessage::decode(&initiation),
            Err(MalformedMessage::ReservedNotZero { msg_type: 1 })
        );

        let mut transport = TransportData {
            receiver_index: 7,
            counter: 0,
            encrypted_data: vec![0; TAG_LEN],
        }
        .encode();
        transport[3] = 0x80;
        assert_eq!(
            WireMessage::decode(&transport),
            Err(MalformedMessage::ReservedNotZero { msg_type: 4 })
        );

        // A well-formed datagram re-encodes to the same bytes
        transport[3] = 0;
        assert_eq!(WireMessage::decode(&transport).unwrap().encode(), transport);
    }

    #[test]
    fn test_short_transport_header_rejected() {
        let result = WireMessage::decode(&[4, 0, 0, 0, 1, 0, 0, 0, 0]);
        assert!(matches!(
            result,
            Err(MalformedMessage::WrongLength { msg_type: 4, .. })
        ));
    }

    #[test]
    fn test_transport_payload_bounded_by_mtu() {
        let msg = TransportData {
            receiver_index: 1,
            counter: 0,
            encrypted_data: vec![0; 100 + TAG_LEN + 1],
        };
        let bytes = msg.encode();

        assert_eq!(
            WireMessage::decode_bounded(&bytes, 100),
            Err(MalformedMessage::Oversized {
                limit: 116,
                got: 117
            })
        );
        assert!(WireMessage::decode_bounded(&bytes, 101).is_ok());
    }

    #[test]
    fn test_unknown_and_empty() {
        assert_eq!(WireMessage::decode(&[]), Err(MalformedMessage::Empty));
        assert_eq!(
            WireMessage::decode(&[99u8; 148]),
            Err(MalformedMessage::UnknownType { msg_type: 99 })
        );
        assert_eq!(
            HandshakeResponse::decode(&sample_initiation().encode()),
            Err(MalformedMessage::UnknownType { msg_type: 1 })
        );
    }

    #[test]
    fn test_decode_never_panics_on_prefixes() {
        let bytes = sample_initiation().encode();
        for len in 0..bytes.len() {
            assert!(WireMessage::decode(&bytes[..len]).is_err());
        }
        for tag in 0..=u8::MAX {
            for len in [0usize, 1, 15, 16, 17, 63, 64, 92, 148, 200] {
                let mut buf = vec![0u8; len];
                if let Some(first) = buf.first_mut() {
                    *first = tag;
                }
                let _ = WireMessage::decode(&buf);
            }
        }
    }
}
