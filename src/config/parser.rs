//! WireGuard configuration file parser
//!
//! Parses standard WireGuard `.conf` files with [Interface] and [Peer] sections.
//! Used both for the server configuration (the system of record for peers)
//! and for reading back generated client configurations.

use std::net::{IpAddr, Ipv6Addr};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ipnet::{IpNet, Ipv4Net};

use crate::error::ConfigError;

/// Comment prefix recording a peer's name above its `[Peer]` header
pub const PEER_NAME_COMMENT: &str = "# Peer:";

/// Complete WireGuard configuration
#[derive(Debug, Clone)]
pub struct WireGuardConfig {
    /// Interface configuration (our side)
    pub interface: InterfaceConfig,
    /// Peer configurations
    pub peers: Vec<PeerConfig>,
}

/// Interface (local) configuration
#[derive(Debug, Clone)]
pub struct InterfaceConfig {
    /// Our private key (32 bytes)
    pub private_key: [u8; 32],
    /// Our VPN IP addresses with prefix
    pub address: Vec<Ipv4Net>,
    /// DNS servers (optional)
    pub dns: Vec<IpAddr>,
    /// Listen port (optional, for servers)
    pub listen_port: Option<u16>,
    /// MTU (optional)
    pub mtu: Option<u16>,
}

/// Peer configuration
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Name from a `# Peer: <name>` comment directly above the section
    pub name: Option<String>,
    /// Peer's public key (32 bytes)
    pub public_key: [u8; 32],
    /// Pre-shared key (optional, 32 bytes)
    pub preshared_key: Option<[u8; 32]>,
    /// Peer's endpoint (host:port), kept textual since hostnames are allowed
    pub endpoint: Option<String>,
    /// Allowed IP ranges for this peer
    pub allowed_ips: Vec<IpNet>,
    /// Keepalive interval in seconds (optional)
    pub persistent_keepalive: Option<u16>,
}

impl WireGuardConfig {
    /// Parse a WireGuard configuration from a string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut interface: Option<InterfaceConfig> = None;
        let mut peers: Vec<PeerConfig> = Vec::new();
        let mut current_section: Option<Section> = None;

        // Temporary storage for current peer being parsed
        let mut current_peer: Option<PeerBuilder> = None;
        let mut pending_name: Option<String> = None;

        for (line_num, line) in content.lines().enumerate() {
            let line_num = line_num + 1; // 1-indexed
            let line = line.trim();

            if let Some(name) = line.strip_prefix(PEER_NAME_COMMENT) {
                let name = name.trim();
                if !name.is_empty() {
                    pending_name = Some(name.to_string());
                }
                continue;
            }

            // Skip empty lines and comments
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            // Check for section headers
            if line.eq_ignore_ascii_case("[interface]") {
                if let Some(peer) = current_peer.take() {
                    peers.push(peer.build()?);
                }
                if interface.is_some() {
                    return Err(ConfigError::ParseError {
                        line: line_num,
                        message: "Duplicate [Interface] section".to_string(),
                    });
                }
                pending_name = None;
                current_section = Some(Section::Interface);
                continue;
            } else if line.eq_ignore_ascii_case("[peer]") {
                if let Some(peer) = current_peer.take() {
                    peers.push(peer.build()?);
                }
                current_section = Some(Section::Peer);
                current_peer = Some(PeerBuilder::new(pending_name.take()));
                continue;
            } else if line.starts_with('[') {
                return Err(ConfigError::ParseError {
                    line: line_num,
                    message: format!("Unknown section: {}", line),
                });
            }

            pending_name = None;

            // Parse key = value pairs
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
                        address: Vec::new(),
                        dns: Vec::new(),
                        listen_port: None,
                        mtu: None,
                    });

                    match key.as_str() {
                        "privatekey" => {
                            iface.private_key = parse_key(value, "PrivateKey")?;
                        }
                        "address" => {
                            // May have multiple addresses separated by comma
                            for addr_str in split_list(value) {
                                let ip_net: IpNet =
                                    addr_str.parse().map_err(|_| ConfigError::InvalidCidr {
                                        value: addr_str.to_string(),
                                    })?;
                                if let IpNet::V4(v4net) = ip_net {
                                    iface.address.push(v4net);
                                }
                            }
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
                            iface.listen_port = Some(value.parse().map_err(|_| {
                                ConfigError::ParseError {
                                    line: line_num,
                                    message: format!("Invalid ListenPort: {}", value),
                                }
                            })?);
                        }
                        "mtu" => {
                            iface.mtu =
                                Some(value.parse().map_err(|_| ConfigError::ParseError {
                                    line: line_num,
                                    message: format!("Invalid MTU: {}", value),
                                })?);
                        }
                        _ => {
                            // wg-quick keys (PostUp, SaveConfig, ...) are not ours to judge
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
                            peer.endpoint = Some(parse_endpoint(value)?);
                        }
                        "allowedips" => {
                            for ip_str in split_list(value) {
                                let ip: IpNet =
                                    ip_str.parse().map_err(|_| ConfigError::InvalidCidr {
                                        value: ip_str.to_string(),
                                    })?;
                                peer.allowed_ips.push(ip);
                            }
                        }
                        "persistentkeepalive" => {
                            peer.persistent_keepalive =
                                Some(value.parse().map_err(|_| ConfigError::ParseError {
                                    line: line_num,
                                    message: format!("Invalid PersistentKeepalive: {}", value),
                                })?);
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

        // Save any pending peer
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

        Ok(WireGuardConfig { interface, peers })
    }

    /// Get our public key derived from the private key
    pub fn public_key(&self) -> [u8; 32] {
        crate::keys::public_key(&self.interface.private_key)
    }

    /// Find a peer by the name recorded in its `# Peer:` comment
    pub fn peer_named(&self, name: &str) -> Option<&PeerConfig> {
        self.peers.iter().find(|p| p.name.as_deref() == Some(name))
    }
}

/// Section type during parsing
#[derive(Clone, Copy)]
enum Section {
    Interface,
    Peer,
}

/// Builder for PeerConfig during parsing
struct PeerBuilder {
    name: Option<String>,
    public_key: Option<[u8; 32]>,
    preshared_key: Option<[u8; 32]>,
    endpoint: Option<String>,
    allowed_ips: Vec<IpNet>,
    persistent_keepalive: Option<u16>,
}

impl PeerBuilder {
    fn new(name: Option<String>) -> Self {
        Self {
            name,
            public_key: None,
            preshared_key: None,
            endpoint: None,
            allowed_ips: Vec::new(),
            persistent_keepalive: None,
        }
    }

    fn build(self) -> Result<PeerConfig, ConfigError> {
        let public_key = self.public_key.ok_or(ConfigError::MissingField {
            field: "PublicKey in [Peer]".to_string(),
        })?;

        Ok(PeerConfig {
            name: self.name,
            public_key,
            preshared_key: self.preshared_key,
            endpoint: self.endpoint,
            allowed_ips: self.allowed_ips,
            persistent_keepalive: self.persistent_keepalive,
        })
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// Parse a base64-encoded 32-byte key
pub(crate) fn parse_key(value: &str, field_name: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = BASE64
        .decode(value)
        .map_err(|_| ConfigError::InvalidKey {
            field: field_name.to_string(),
        })?;

    if bytes.len() != 32 {
        return Err(ConfigError::InvalidKey {
            field: field_name.to_string(),
        });
    }

    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// Parse an endpoint (host:port or [v6]:port)
pub(crate) fn parse_endpoint(value: &str) -> Result<String, ConfigError> {
    let invalid = || ConfigError::InvalidAddress {
        value: value.to_string(),
    };

    let (host, port) = value.rsplit_once(':').ok_or_else(invalid)?;
    port.parse::<u16>().map_err(|_| invalid())?;

    // IPv6 hosts must be bracketed, otherwise the port is ambiguous
    let host = match host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        Some(inner) => {
            inner.parse::<Ipv6Addr>().map_err(|_| invalid())?;
            inner
        }
        None if host.contains(':') => return Err(invalid()),
        None => host,
    };
    if host.is_empty() || host.contains(char::is_whitespace) {
        return Err(invalid());
    }

    Ok(value.to_string())
}
