//! Configuration provider responses
//!
//! The provider answers a connect request with either a connection
//! description or an `{error, message}` body. Both are decoded into typed
//! structs here, and a connection is validated into a [`TunnelConfig`] at
//! the boundary so malformed keys or addresses never reach the tunnel.

use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::config::parser::{
    parse_cidrs, parse_key, split_list, Endpoint, InterfaceConfig, PeerConfig, TunnelConfig,
    DEFAULT_PORT,
};
use crate::error::ConfigError;
use crate::protocol::messages::DEFAULT_MTU;

/// Keepalive interval written into provider-generated configurations
pub const DEFAULT_KEEPALIVE: u16 = 25;

/// Connection details issued by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VpnConnection {
    pub private_key: String,
    pub public_key: String,
    pub server_public_key: String,
    pub server_endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_port: Option<u16>,
    #[serde(rename = "allowedIPs")]
    pub allowed_ips: String,
    #[serde(rename = "internalIP")]
    pub internal_ip: String,
    pub dns: String,
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preshared_key: Option<String>,
    #[serde(rename = "internalIPv6", default, skip_serializing_if = "Option::is_none")]
    pub internal_ipv6: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_config: Option<String>,
}

/// Error body returned by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderError {
    pub error: String,
    pub message: String,
}

/// Any response the provider may send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProviderResponse {
    Connection(Box<VpnConnection>),
    Error(ProviderError),
}

fn default_mtu() -> u16 {
    DEFAULT_MTU as u16
}

impl ProviderResponse {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Turn the response into a validated tunnel configuration
    pub fn into_config(self) -> Result<TunnelConfig, ConfigError> {
        match self {
            Self::Connection(connection) => TunnelConfig::try_from(*connection),
            Self::Error(ProviderError { error, message }) => {
                tracing::warn!("Provider returned an error: {} ({})", message, error);
                Err(ConfigError::ProviderRejected { error, message })
            }
        }
    }
}

/// Host address with a single-address prefix when none is given
fn host_address(value: &str, field: &str) -> Result<IpNet, ConfigError> {
    let value = value.trim();
    if let Ok(net) = value.parse::<IpNet>() {
        return Ok(net);
    }
    let ip: IpAddr = value.parse().map_err(|_| ConfigError::InvalidAddress {
        value: format!("{} ({})", value, field),
    })?;
    Ok(IpNet::from(ip))
}

impl TryFrom<VpnConnection> for TunnelConfig {
    type Error = ConfigError;

    fn try_from(connection: VpnConnection) -> Result<Self, Self::Error> {
        let private_key = parse_key(&connection.private_key, "privateKey")?;
        let public_key = parse_key(&connection.public_key, "publicKey")?;
        if crate::crypto::x25519::public_key(&private_key) != public_key {
            return Err(ConfigError::Invalid {
                field: "publicKey".to_string(),
                reason: "does not match privateKey".to_string(),
            });
        }

        let server_public_key = parse_key(&connection.server_public_key, "serverPublicKey")?;
        let preshared_key = connection
            .preshared_key
            .as_deref()
            .filter(|psk| !psk.trim().is_empty())
            .map(|psk| parse_key(psk, "presharedKey"))
            .transpose()?;

        let mut addresses = vec![host_address(&connection.internal_ip, "internalIP")?];
        if let Some(v6) = connection.internal_ipv6.as_deref().filter(|v| !v.trim().is_empty()) {
            addresses.push(host_address(v6, "internalIPv6")?);
        }

        let dns = split_list(&connection.dns)
            .map(|server| {
                server.parse::<IpAddr>().map_err(|_| ConfigError::InvalidAddress {
                    value: server.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut endpoint = Endpoint::parse_with_default(
            &connection.server_endpoint,
            connection.server_port.unwrap_or(DEFAULT_PORT),
        )?;
        if let Some(port) = connection.server_port {
            endpoint.port = port;
        }

        let config = TunnelConfig {
            interface: InterfaceConfig {
                private_key,
                addresses,
                dns,
                listen_port: None,
                mtu: Some(connection.mtu),
            },
            peers: vec![PeerConfig {
                public_key: server_public_key,
                preshared_key,
                endpoint: Some(endpoint),
                allowed_ips: parse_cidrs(&connection.allowed_ips)?,
                persistent_keepalive: Some(DEFAULT_KEEPALIVE),
            }],
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

    const CLIENT_PRIVATE: [u8; 32] = [0x48; 32];
    const SERVER_PRIVATE: [u8; 32] = [0x50; 32];

    fn connection_json(extra: &str) -> String {
        let client_public = crate::crypto::x25519::public_key(&CLIENT_PRIVATE);
        let server_public = crate::crypto::x25519::public_key(&SERVER_PRIVATE);
        format!(
            r#"{{
                "privateKey": "{}",
                "publicKey": "{}",
                "serverPublicKey": "{}",
                "serverEndpoint": "52.47.190.220:51820",
                "allowedIPs": "0.0.0.0/0, ::/0",
                "internalIP": "10.77.26.5",
                "dns": "1.1.1.1"{}
            }}"#,
            BASE64.encode(CLIENT_PRIVATE),
            BASE64.encode(client_public),
            BASE64.encode(server_public),
            extra
        )
    }

    #[test]
    fn test_decode_connection_defaults() {
        let response = ProviderResponse::from_json(&connection_json("")).unwrap();
        let ProviderResponse::Connection(connection) = &response else {
            panic!("expected connection variant");
        };
        assert_eq!(connection.mtu, 1420);
        assert!(connection.preshared_key.is_none());

        let config = response.into_config().unwrap();
        assert_eq!(config.interface.addresses[0].to_string(), "10.77.26.5/32");
        assert_eq!(config.interface.mtu, Some(1420));
        assert_eq!(config.peers[0].endpoint, Some(Endpoint::new("52.47.190.220", 51820)));
        assert_eq!(config.peers[0].persistent_keepalive, Some(25));
        assert_eq!(config.peers[0].allowed_ips.len(), 2);
    }

    #[test]
    fn test_decode_connection_optional_fields() {
        let psk = BASE64.encode([7u8; 32]);
        let extra = format!(
            r#", "presharedKey": "{}", "internalIPv6": "fd00::5", "mtu": 1380, "serverPort": 443"#,
            psk
        );
        let config = ProviderResponse::from_json(&connection_json(&extra))
            .unwrap()
            .into_config()
            .unwrap();

        assert_eq!(config.interface.addresses[1].to_string(), "fd00::5/128");
        assert_eq!(config.mtu(), 1380);
        assert_eq!(config.peers[0].preshared_key, Some([7u8; 32]));
        assert_eq!(config.peers[0].endpoint.as_ref().map(|e| e.port), Some(443));

        let rendered = config.to_string();
        assert!(rendered.contains("Address = 10.77.26.5/32, fd00::5/128\n"));
        assert!(rendered.contains("Endpoint = 52.47.190.220:443\n"));
    }

    #[test]
    fn test_decode_error_variant() {
        let json = r#"{"error": "no_capacity", "message": "Server is full"}"#;
        let response = ProviderResponse::from_json(json).unwrap();
        assert_eq!(
            response,
            ProviderResponse::Error(ProviderError {
                error: "no_capacity".to_string(),
                message: "Server is full".to_string(),
            })
        );
        assert!(matches!(
            response.into_config(),
            Err(ConfigError::ProviderRejected { .. })
        ));
    }

    #[test]
    fn test_rejects_bad_fields_at_boundary() {
        let json = connection_json("").replace("10.77.26.5", "not-an-ip");
        assert!(matches!(
            ProviderResponse::from_json(&json).unwrap().into_config(),
            Err(ConfigError::InvalidAddress { .. })
        ));

        let json = connection_json("").replace(&BASE64.encode(CLIENT_PRIVATE), "AAAA");
        assert!(matches!(
            ProviderResponse::from_json(&json).unwrap().into_config(),
            Err(ConfigError::InvalidKey { .. })
        ));

        assert!(matches!(
            ProviderResponse::from_json(r#"{"privateKey": 5}"#),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn test_rejects_mismatched_key_pair() {
        let wrong_public = BASE64.encode([0x11; 32]);
        let client_public = BASE64.encode(crate::crypto::x25519::public_key(&CLIENT_PRIVATE));
        let json = connection_json("").replace(&client_public, &wrong_public);
        assert!(matches!(
            ProviderResponse::from_json(&json).unwrap().into_config(),
            Err(ConfigError::Invalid { .. })
        ));
    }
}
