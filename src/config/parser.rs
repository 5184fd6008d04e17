//! WireGuard configuration file parser and renderer
//!
//! Parses standard WireGuard `.conf` files with [Interface] and [Peer]
//! sections, and renders the same format back for the tunnel backend.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ipnet::IpNet;

use crate::error::{ConfigError, NetworkError};
use crate::protocol::messages::DEFAULT_MTU;

/// Port used when an endpoint omits one
pub const DEFAULT_PORT: u16 = 51820;

/// Smallest MTU that still carries an IPv4 packet plus WireGuard overhead
pub const MIN_MTU: u16 = 576;

/// Complete tunnel configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    /// Interface configuration (our side)
    pub interface: InterfaceConfig,
    /// Peer configurations
    pub peers: Vec<PeerConfig>,
}

/// Interface (local) configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceConfig {
    /// Our private key (32 bytes)
    pub private_key: [u8; 32],
    /// Tunnel addresses with prefix, IPv4 and IPv6
    pub addresses: Vec<IpNet>,
    /// DNS servers (optional)
    pub dns: Vec<IpAddr>,
    /// Listen port (optional, for responders)
    pub listen_port: Option<u16>,
    /// MTU (optional, default 1420)
    pub mtu: Option<u16>,
}

/// Peer configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    /// Peer's public key (32 bytes)
    pub public_key: [u8; 32],
    /// Pre-shared key (optional, 32 bytes)
    pub preshared_key: Option<[u8; 32]>,
    /// Peer's endpoint (host:port)
    pub endpoint: Option<Endpoint>,
    /// Allowed IP ranges for this peer
    pub allowed_ips: Vec<IpNet>,
    /// Keepalive interval in seconds (optional)
    pub persistent_keepalive: Option<u16>,
}

/// A peer endpoint as written in configuration: an IP literal or hostname plus port
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port`, falling back to `default_port` when no port is given
    pub fn parse_with_default(value: &str, default_port: u16) -> Result<Self, ConfigError> {
        let value = value.trim();
        let invalid = || ConfigError::InvalidEndpoint {
            value: value.to_string(),
        };

        if let Ok(addr) = value.parse::<SocketAddr>() {
            return Ok(Self::new(addr.ip().to_string(), addr.port()));
        }
        if let Ok(ip) = value.parse::<IpAddr>() {
            return Ok(Self::new(ip.to_string(), default_port));
        }

        // Bracketed IPv6 without port: [::1]
        if let Some(inner) = value.strip_prefix('[').and_then(|v| v.strip_suffix(']')) {
            let ip: IpAddr = inner.parse().map_err(|_| invalid())?;
            return Ok(Self::new(ip.to_string(), default_port));
        }

        let (host, port) = match value.rsplit_once(':') {
            Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
            None => (value, default_port),
        };

        let valid_host = !host.is_empty()
            && host
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
        if !valid_host || port == 0 {
            return Err(invalid());
        }

        Ok(Self::new(host, port))
    }

    /// Resolve to a socket address, preferring IPv4
    pub async fn resolve(&self) -> Result<SocketAddr, NetworkError> {
        if let Ok(ip) = self.host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.port));
        }

        let failed = || NetworkError::DnsResolutionFailed {
            host: self.host.clone(),
        };
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|_| failed())?
            .collect();

        let addr = addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(failed)?;

        tracing::debug!("Resolved {} to {}", self, addr);
        Ok(addr)
    }
}

impl FromStr for Endpoint {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let endpoint = Self::parse_with_default(value, 0)?;
        if endpoint.port == 0 {
            return Err(ConfigError::InvalidEndpoint {
                value: value.to_string(),
            });
        }
        Ok(endpoint)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl TunnelConfig {
    /// Parse a WireGuard configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                ConfigError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    /// Parse a WireGuard configuration from a string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut interface: Option<InterfaceConfig> = None;
        let mut peers: Vec<PeerConfig> = Vec::new();
        let mut current_section: Option<Section> = None;
        let mut current_peer: Option<PeerBuilder> = None;

        for (line_num, line) in content.lines().enumerate() {
            let line_num = line_num + 1;
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if line.eq_ignore_ascii_case("[interface]") {
                if let Some(peer) = current_peer.take() {
                    peers.push(peer.build()?);
                }
                current_section = Some(Section::Interface);
                continue;
            } else if line.eq_ignore_ascii_case("[peer]") {
                if let Some(peer) = current_peer.take() {
                    peers.push(peer.build()?);
                }
                current_section = Some(Section::Peer);
                current_peer = Some(PeerBuilder::default());
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::ParseError {
                    line: line_num,
                    message: format!("Expected 'key = value', got: {}", line),
                });
            };

            let key = key.trim().to_lowercase();
            let value = value.trim();

            match current_section {
                Some(Section::Interface) => {
                    let iface = interface.get_or_insert_with(|| InterfaceConfig {
                        private_key: [0u8; 32],
                        addresses: Vec::new(),
                        dns: Vec::new(),
                        listen_port: None,
                        mtu: None,
                    });

                    match key.as_str() {
                        "privatekey" => {
                            iface.private_key = parse_key(value, "PrivateKey")?;
                        }
                        "address" => {
                            // Repeated Address lines accumulate
                            iface.addresses.extend(parse_cidrs(value)?);
                        }
                        "dns" => {
                            for dns_str in split_list(value) {
                                let dns: IpAddr =
                                    dns_str.parse().map_err(|_| ConfigError::InvalidAddress {
                                        value: dns_str.to_string(),
                                    })?;
                                iface.dns.push(dns);
                            }
                        }
                        "listenport" => {
                            iface.listen_port = Some(parse_number(value, "ListenPort", line_num)?);
                        }
                        "mtu" => {
                            iface.mtu = Some(parse_number(value, "MTU", line_num)?);
                        }
                        _ => {
                            tracing::debug!("Unknown interface key: {}", key);
                        }
                    }
                }
                Some(Section::Peer) => {
                    let peer = current_peer.as_mut().ok_or(ConfigError::ParseError {
                        line: line_num,
                        message: "Peer value outside of [Peer] section".to_string(),
                    })?;

                    match key.as_str() {
                        "publickey" => {
                            peer.public_key = Some(parse_key(value, "PublicKey")?);
                        }
                        "presharedkey" => {
                            peer.preshared_key = Some(parse_key(value, "PresharedKey")?);
                        }
                        "endpoint" => {
                            peer.endpoint = Some(value.parse()?);
                        }
                        "allowedips" => {
                            peer.allowed_ips.extend(parse_cidrs(value)?);
                        }
                        "persistentkeepalive" => {
                            // Zero disables keepalives, same as "off"
                            peer.persistent_keepalive = match value {
                                "off" => None,
                                _ => Some(parse_number::<u16>(value, "PersistentKeepalive", line_num)?)
                                    .filter(|&secs| secs > 0),
                            };
                        }
                        _ => {
                            tracing::debug!("Unknown peer key: {}", key);
                        }
                    }
                }
                None => {
                    return Err(ConfigError::ParseError {
                        line: line_num,
                        message: "Configuration value outside of any section".to_string(),
                    });
                }
            }
        }

        if let Some(peer) = current_peer.take() {
            peers.push(peer.build()?);
        }

        let interface = interface.ok_or(ConfigError::MissingField {
            field: "[Interface] section".to_string(),
        })?;

        if interface.private_key == [0u8; 32] {
            return Err(ConfigError::MissingField {
                field: "PrivateKey".to_string(),
            });
        }

        Ok(TunnelConfig { interface, peers })
    }

    /// Check the configuration is usable by the tunnel backend
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interface.addresses.is_empty() {
            return Err(ConfigError::MissingField {
                field: "Address".to_string(),
            });
        }

        let mtu = self.mtu();
        if mtu < MIN_MTU {
            return Err(ConfigError::Invalid {
                field: "MTU".to_string(),
                reason: format!("{} is below the minimum of {}", mtu, MIN_MTU),
            });
        }

        if self.peers.is_empty() {
            return Err(ConfigError::MissingField {
                field: "[Peer] section".to_string(),
            });
        }

        let own_public = self.public_key();
        for peer in &self.peers {
            if peer.allowed_ips.is_empty() {
                return Err(ConfigError::MissingField {
                    field: "AllowedIPs in [Peer]".to_string(),
                });
            }
            if peer.public_key == own_public {
                return Err(ConfigError::Invalid {
                    field: "PublicKey".to_string(),
                    reason: "peer key equals the interface's own key".to_string(),
                });
            }
        }

        Ok(())
    }

    /// Effective MTU
    pub fn mtu(&self) -> u16 {
        self.interface.mtu.unwrap_or(DEFAULT_MTU as u16)
    }

    /// Get our public key derived from the private key
    pub fn public_key(&self) -> [u8; 32] {
        crate::crypto::x25519::public_key(&self.interface.private_key)
    }
}

impl fmt::Display for TunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let iface = &self.interface;
        writeln!(f, "[Interface]")?;
        writeln!(f, "PrivateKey = {}", BASE64.encode(iface.private_key))?;
        if !iface.addresses.is_empty() {
            writeln!(f, "Address = {}", join(&iface.addresses))?;
        }
        if !iface.dns.is_empty() {
            writeln!(f, "DNS = {}", join(&iface.dns))?;
        }
        if let Some(port) = iface.listen_port {
            writeln!(f, "ListenPort = {}", port)?;
        }
        if let Some(mtu) = iface.mtu {
            writeln!(f, "MTU = {}", mtu)?;
        }

        for peer in &self.peers {
            writeln!(f)?;
            writeln!(f, "[Peer]")?;
            writeln!(f, "PublicKey = {}", BASE64.encode(peer.public_key))?;
            if let Some(psk) = peer.preshared_key {
                writeln!(f, "PresharedKey = {}", BASE64.encode(psk))?;
            }
            if !peer.allowed_ips.is_empty() {
                writeln!(f, "AllowedIPs = {}", join(&peer.allowed_ips))?;
            }
            if let Some(endpoint) = &peer.endpoint {
                writeln!(f, "Endpoint = {}", endpoint)?;
            }
            if let Some(keepalive) = peer.persistent_keepalive {
                writeln!(f, "PersistentKeepalive = {}", keepalive)?;
            }
        }
        Ok(())
    }
}

/// Section type during parsing
#[derive(Clone, Copy)]
enum Section {
    Interface,
    Peer,
}

/// Builder for PeerConfig during parsing
#[derive(Default)]
struct PeerBuilder {
    public_key: Option<[u8; 32]>,
    preshared_key: Option<[u8; 32]>,
    endpoint: Option<Endpoint>,
    allowed_ips: Vec<IpNet>,
    persistent_keepalive: Option<u16>,
}

impl PeerBuilder {
    fn build(self) -> Result<PeerConfig, ConfigError> {
        let public_key = self.public_key.ok_or(ConfigError::MissingField {
            field: "PublicKey in [Peer]".to_string(),
        })?;

        Ok(PeerConfig {
            public_key,
            preshared_key: self.preshared_key,
            endpoint: self.endpoint,
            allowed_ips: self.allowed_ips,
            persistent_keepalive: self.persistent_keepalive,
        })
    }
}

/// Parse a base64-encoded 32-byte key
pub fn parse_key(value: &str, field_name: &str) -> Result<[u8; 32], ConfigError> {
    let invalid = || ConfigError::InvalidKey {
        field: field_name.to_string(),
    };
    let bytes = BASE64.decode(value.trim()).map_err(|_| invalid())?;
    bytes.try_into().map_err(|_| invalid())
}

/// Parse a comma separated CIDR list
pub(crate) fn parse_cidrs(value: &str) -> Result<Vec<IpNet>, ConfigError> {
    split_list(value)
        .map(|cidr| {
            cidr.parse::<IpNet>().map_err(|_| ConfigError::InvalidCidr {
                value: cidr.to_string(),
            })
        })
        .collect()
}

pub(crate) fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_number<T: FromStr>(value: &str, field: &str, line: usize) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::ParseError {
        line,
        message: format!("Invalid {}: {}", field, value),
    })
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_CONFIG: &str = r#"
[Interface]
PrivateKey = UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=
Address = 10.0.0.2/24, fd00::2/128
DNS = 8.8.8.8

[Peer]
PublicKey = YgkBjKXER5YarD8STsvMFURw/5nhCLIFOJ5uKWrrMW4=
AllowedIPs = 10.0.0.0/24, 0.0.0.0/0
Endpoint = 13.239.46.151:51820
PersistentKeepalive = 25
"#;

    #[test]
    fn test_parse_config() {
        let config = TunnelConfig::parse(TEST_CONFIG).unwrap();

        assert_eq!(config.interface.addresses.len(), 2);
        assert_eq!(config.interface.addresses[0].to_string(), "10.0.0.2/24");
        assert_eq!(config.interface.addresses[1].to_string(), "fd00::2/128");
        assert_eq!(config.interface.dns.len(), 1);
        assert_eq!(config.interface.dns[0].to_string(), "8.8.8.8");
        assert_eq!(config.mtu(), 1420);

        assert_eq!(config.peers.len(), 1);
        let peer = &config.peers[0];
        assert_eq!(
            peer.endpoint,
            Some(Endpoint::new("13.239.46.151", 51820))
        );
        assert_eq!(peer.persistent_keepalive, Some(25));
        assert_eq!(peer.allowed_ips.len(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_keepalive_means_off() {
        let with_value = |value: &str| {
            TEST_CONFIG.replace("PersistentKeepalive = 25", &format!("PersistentKeepalive = {}", value))
        };

        let config = TunnelConfig::parse(&with_value("0")).unwrap();
        assert_eq!(config.peers[0].persistent_keepalive, None);
        assert!(!config.to_string().contains("PersistentKeepalive"));

        let config = TunnelConfig::parse(&with_value("off")).unwrap();
        assert_eq!(config.peers[0].persistent_keepalive, None);
    }

    #[test]
    fn test_render_roundtrip() {
        let config = TunnelConfig::parse(TEST_CONFIG).unwrap();
        let rendered = config.to_string();

        assert!(rendered.starts_with("[Interface]\nPrivateKey = UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=\n"));
        assert!(rendered.contains("Address = 10.0.0.2/24, fd00::2/128\n"));
        assert!(rendered.contains("\n[Peer]\nPublicKey = YgkBjKXER5YarD8STsvMFURw/5nhCLIFOJ5uKWrrMW4=\n"));
        assert_eq!(TunnelConfig::parse(&rendered).unwrap(), config);
    }

    #[test]
    fn test_parse_key() {
        let key_b64 = "UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=";
        let key = parse_key(key_b64, "TestKey").unwrap();
        assert_eq!(key.len(), 32);
    }

    #[test]
    fn test_invalid_key() {
        assert!(parse_key("invalid-base64!", "TestKey").is_err());
        assert!(parse_key("dG9vIHNob3J0", "TestKey").is_err()); // "too short"
    }

    #[test]
    fn test_endpoint_forms() {
        assert_eq!(
            "vpn.example.com:51821".parse::<Endpoint>().unwrap(),
            Endpoint::new("vpn.example.com", 51821)
        );
        let v6: Endpoint = "[2001:db8::1]:51820".parse().unwrap();
        assert_eq!(v6.host, "2001:db8::1");
        assert_eq!(v6.to_string(), "[2001:db8::1]:51820");

        assert_eq!(
            Endpoint::parse_with_default("52.47.190.220", DEFAULT_PORT).unwrap(),
            Endpoint::new("52.47.190.220", 51820)
        );

        assert!("vpn.example.com".parse::<Endpoint>().is_err());
        assert!("bad host:80".parse::<Endpoint>().is_err());
        assert!("host:notaport".parse::<Endpoint>().is_err());
    }

    #[tokio::test]
    async fn test_resolve_ip_literal() {
        let endpoint = Endpoint::new("127.0.0.1", 51820);
        assert_eq!(
            endpoint.resolve().await.unwrap(),
            "127.0.0.1:51820".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_missing_interface() {
        let config = "[Peer]\nPublicKey = YgkBjKXER5YarD8STsvMFURw/5nhCLIFOJ5uKWrrMW4=\n";
        assert!(TunnelConfig::parse(config).is_err());
    }

    #[test]
    fn test_missing_private_key() {
        let config = "[Interface]\nAddress = 10.0.0.2/24\n";
        assert!(matches!(
            TunnelConfig::parse(config),
            Err(ConfigError::MissingField { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_incomplete() {
        let mut config = TunnelConfig::parse(TEST_CONFIG).unwrap();
        config.peers[0].allowed_ips.clear();
        assert!(config.validate().is_err());

        let mut config = TunnelConfig::parse(TEST_CONFIG).unwrap();
        config.interface.mtu = Some(100);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));

        let mut config = TunnelConfig::parse(TEST_CONFIG).unwrap();
        config.peers.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_error_reports_line() {
        let config = "[Interface]\nPrivateKey = UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=\nMTU = big\n";
        assert!(matches!(
            TunnelConfig::parse(config),
            Err(ConfigError::ParseError { line: 3, .. })
        ));
    }
}
