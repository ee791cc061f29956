//! Peer records and `.conf` rendering
//!
//! Produces the server-side `[Peer]` stanza and the complete client
//! configuration. Rendering is pure: same inputs, same text.

use std::fmt;
use std::fmt::Write as _;

use ipnet::Ipv4Net;

use crate::config::PEER_NAME_COMMENT;
use crate::error::{ProvisionError, Result};
use crate::keys::PeerKeys;

/// Longest accepted name; `<name>.conf` must still fit a single path component
pub const MAX_NAME_LEN: usize = 250;

/// A peer name that is safe to use as a single path component
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerName(String);

impl PeerName {
    pub fn parse(raw: &str) -> Result<Self> {
        let name = raw.trim();

        if name.is_empty() {
            return Err(ProvisionError::invalid("peer name is empty"));
        }
        if name == "." || name == ".." {
            return Err(ProvisionError::invalid(format!(
                "peer name '{}' is not a usable directory name",
                name
            )));
        }
        if name.contains(['/', '\\']) {
            return Err(ProvisionError::invalid(format!(
                "peer name '{}' contains a path separator",
                name
            )));
        }
        if name.chars().any(char::is_control) {
            return Err(ProvisionError::invalid(
                "peer name contains control characters",
            ));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(ProvisionError::invalid(format!(
                "peer name is longer than {} bytes",
                MAX_NAME_LEN
            )));
        }

        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A newly provisioned peer
#[derive(Debug, Clone)]
pub struct Peer {
    pub name: PeerName,
    pub keys: PeerKeys,
    pub allowed_ip: Ipv4Net,
}

/// What the client needs to know about the server
#[derive(Debug, Clone)]
pub struct ServerMetadata {
    pub public_key: String,
    pub endpoint: String,
    pub dns: Vec<String>,
    pub client_allowed_ips: Vec<String>,
    pub persistent_keepalive: Option<u16>,
}

/// `[Peer]` stanza appended to the server configuration
pub fn server_stanza(peer: &Peer) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{} {}", PEER_NAME_COMMENT, peer.name);
    out.push_str("[Peer]\n");
    let _ = writeln!(out, "PublicKey = {}", peer.keys.public_key);
    if let Some(psk) = &peer.keys.preshared_key {
        let _ = writeln!(out, "PresharedKey = {}", psk);
    }
    let _ = writeln!(out, "AllowedIPs = {}", peer.allowed_ip);
    out
}

/// Complete client `.conf`
pub fn client_config(peer: &Peer, server: &ServerMetadata) -> String {
    let mut out = String::new();
    out.push_str("[Interface]\n");
    let _ = writeln!(out, "Address = {}", peer.allowed_ip);
    let _ = writeln!(out, "PrivateKey = {}", peer.keys.private_key);
    if !server.dns.is_empty() {
        let _ = writeln!(out, "DNS = {}", server.dns.join(", "));
    }

    out.push_str("\n[Peer]\n");
    let _ = writeln!(out, "PublicKey = {}", server.public_key);
    if let Some(psk) = &peer.keys.preshared_key {
        let _ = writeln!(out, "PresharedKey = {}", psk);
    }
    let _ = writeln!(out, "AllowedIPs = {}", server.client_allowed_ips.join(", "));
    let _ = writeln!(out, "Endpoint = {}", server.endpoint);
    if let Some(keepalive) = server.persistent_keepalive {
        let _ = writeln!(out, "PersistentKeepalive = {}", keepalive);
    }
    out
}
