//! Error types for VeilGuard

use thiserror::Error;

/// Main error type for VeilGuard
#[derive(Error, Debug)]
pub enum VeilGuardError {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Cryptographic errors
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Network errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// System I/O errors
    #[error("System error: {0}")]
    System(#[from] std::io::Error),
}

/// Configuration parsing errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid config format at line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error("Invalid base64 key: {field}")]
    InvalidKey { field: String },

    #[error("Invalid IP address: {value}")]
    InvalidAddress { value: String },

    #[error("Invalid endpoint (expected host:port): {value}")]
    InvalidEndpoint { value: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid CIDR notation: {value}")]
    InvalidCidr { value: String },

    #[error("Invalid {field}: {reason}")]
    Invalid { field: String, reason: String },

    #[error("Provider rejected the request ({error}): {message}")]
    ProviderRejected { error: String, message: String },

    #[error("Malformed provider response: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cryptographic operation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Key derivation failed")]
    KeyDerivation,

    #[error("Encryption failed")]
    Encryption,

    #[error("Authentication failed: invalid ciphertext or tag")]
    AuthenticationFailed,

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Secure random source unavailable: {reason}")]
    RandomUnavailable { reason: String },

    #[error("DH produced a non-contributory shared secret")]
    NonContributory,
}

/// Reasons a datagram could not be decoded into a wire message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedMessage {
    #[error("empty datagram")]
    Empty,

    #[error("unknown message type {msg_type}")]
    UnknownType { msg_type: u8 },

    #[error("message type {msg_type} must be {expected} bytes, got {got}")]
    WrongLength {
        msg_type: u8,
        expected: usize,
        got: usize,
    },

    #[error("transport payload of {got} bytes exceeds limit of {limit}")]
    Oversized { limit: usize, got: usize },

    #[error("message type {msg_type} has non-zero reserved bytes")]
    ReservedNotZero { msg_type: u8 },
}

/// Protocol-level errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] MalformedMessage),

    #[error("Cannot {operation} while handshake is {state}")]
    IllegalState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("Handshake timeout after {attempts} attempts")]
    HandshakeTimeout { attempts: u32 },

    #[error("MAC verification failed")]
    MacVerificationFailed,

    #[error("Counter {counter} replayed or outside the receive window")]
    ReplayedOrExpiredCounter { counter: u64 },

    #[error("Sending counter exhausted, session must be rekeyed")]
    CounterExhausted,

    #[error("Invalid receiver index: {index}")]
    InvalidReceiverIndex { index: u32 },

    #[error("Initiation from unknown peer")]
    UnknownPeer,

    #[error("Initiation timestamp is not newer than the last accepted one")]
    StaleTimestamp,

    #[error("Session expired")]
    SessionExpired,

    #[error("No active session")]
    NoSession,
}

/// Network-level errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("DNS resolution failed for {host}")]
    DnsResolutionFailed { host: String },

    #[error("Socket bind failed on {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    #[error("Send failed: {reason}")]
    SendFailed { reason: String },

    #[error("Receive failed: {reason}")]
    ReceiveFailed { reason: String },

    #[error("Endpoint not set")]
    NoEndpoint,

    #[error("Tunnel task has stopped")]
    TunnelClosed,
}

impl VeilGuardError {
    /// Get a user-friendly error message with suggested action
    pub fn user_message(&self) -> String {
        match self {
            Self::Config(ConfigError::FileNotFound { path }) => {
                format!(
                    "Config file not found: {}\n  Check the path and try again.",
                    path
                )
            }

            Self::Config(ConfigError::InvalidKey { field }) => {
                format!(
                    "Invalid {} in config. Expected 32-byte base64-encoded key.",
                    field
                )
            }

            Self::Protocol(ProtocolError::HandshakeTimeout { attempts }) => {
                format!(
                    "Handshake timed out after {} attempts.\n  \
                    Check network connectivity and firewall rules for the peer's UDP port.",
                    attempts
                )
            }

            Self::Protocol(ProtocolError::MacVerificationFailed) => {
                "MAC verification failed. The peer's public key may be incorrect.".to_string()
            }

            Self::Crypto(CryptoError::RandomUnavailable { .. }) => {
                "No secure random source is available; refusing to generate keys.".to_string()
            }

            _ => format!("{}", self),
        }
    }

    /// Check if this error is recoverable
    ///
    /// Recoverable errors affect a single datagram or attempt; the caller can
    /// drop the packet or start a fresh handshake.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Crypto(CryptoError::RandomUnavailable { .. }) => false,
            Self::Crypto(CryptoError::InvalidKeyLength { .. }) => false,

            Self::Protocol(ProtocolError::IllegalState { .. }) => false,
            Self::Protocol(_) => true,
            Self::Network(NetworkError::TunnelClosed) => false,
            Self::Network(_) => true,
            Self::Crypto(_) => true,

            _ => false,
        }
    }

    /// Whether this error ends the handshake attempt that produced it
    pub fn invalidates_handshake(&self) -> bool {
        match self {
            Self::Crypto(_) => true,
            Self::Protocol(ProtocolError::MacVerificationFailed)
            | Self::Protocol(ProtocolError::InvalidReceiverIndex { .. })
            | Self::Protocol(ProtocolError::UnknownPeer)
            | Self::Protocol(ProtocolError::StaleTimestamp) => true,
            _ => false,
        }
    }

    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 1,
            Self::Network(_) => 3,
            Self::Protocol(_) => 4,
            Self::Crypto(_) => 5,
            Self::System(_) => 7,
        }
    }
}

impl From<MalformedMessage> for VeilGuardError {
    fn from(err: MalformedMessage) -> Self {
        Self::Protocol(err.into())
    }
}

/// Result type alias for VeilGuard operations
pub type Result<T> = std::result::Result<T, VeilGuardError>;
