//! Tunnel configuration
//!
//! Parsing and rendering of WireGuard `.conf` files, and decoding of the
//! configuration provider's JSON responses into the same model.

mod parser;
mod provider;

pub use parser::{
    parse_key, Endpoint, InterfaceConfig, PeerConfig, TunnelConfig, DEFAULT_PORT, MIN_MTU,
};
pub use provider::{ProviderError, ProviderResponse, VpnConnection, DEFAULT_KEEPALIVE};
