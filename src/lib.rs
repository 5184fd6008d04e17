//! VeilGuard - WireGuard-compatible tunnel core
//!
//! The cryptographic handshake and transport layer of a WireGuard tunnel,
//! usable without a TUN device.
//!
//! # Features
//!
//! - Noise IKpsk2 handshake, initiator and responder roles
//! - ChaCha20-Poly1305 transport with a 128-packet replay window
//! - Cookie/DoS protection (MAC1/MAC2, cookie replies)
//! - Session rekey, retransmission and keepalives over UDP
//! - WireGuard `.conf` parsing/rendering and provider JSON decoding
//!
//! # Usage
//!
//! ```no_run
//! use veilguard::{endpoint, TunnelConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = TunnelConfig::from_file("wireguard.conf")?;
//!     let mut tunnel = endpoint::connect_with_config(&config).await?;
//!     tunnel.send(b"hello").await?;
//!     if let Some(reply) = tunnel.recv().await {
//!         println!("{} bytes back", reply.len());
//!     }
//!     tunnel.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod crypto;
pub mod endpoint;
pub mod error;
pub mod protocol;

pub use config::TunnelConfig;
pub use endpoint::TunnelHandle;
pub use error::VeilGuardError;
