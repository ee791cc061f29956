//! Provisioner settings
//!
//! Layered, later wins: built-in defaults, an optional JSON settings file,
//! then command-line overrides.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ipnet::IpNet;
use serde::Deserialize;

use crate::error::{ProvisionError, Result};

/// Settings file consulted when `--settings` is not given (read only if present)
pub const DEFAULT_SETTINGS_PATH: &str = "/etc/wireguard/wg-provision.json";

/// Port used when neither the endpoint nor the server config names one
const DEFAULT_LISTEN_PORT: u16 = 51820;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Live server configuration (the system of record for peers)
    pub server_config: PathBuf,
    /// Public host or host:port clients connect to
    pub endpoint: Option<String>,
    /// DNS servers pushed to clients
    pub dns: Vec<String>,
    /// Routes the client sends through the tunnel
    pub client_allowed_ips: Vec<String>,
    pub persistent_keepalive: Option<u16>,
    /// Generate a pre-shared key for each peer
    pub preshared_key: bool,
    /// Directory receiving `<name>/<name>.conf` and `<name>/<name>.png`
    pub output_dir: PathBuf,
    pub tool_timeout_secs: u64,
    pub lock_timeout_secs: u64,
    /// Also add the peer to the running interface with `wg set`
    pub apply: bool,
    /// Generate keys in-process instead of calling `wg genkey`
    pub native_keys: bool,
    /// Print the QR code to the terminal after writing the PNG
    pub terminal_qr: bool,
    pub wg_command: String,
    pub qrencode_command: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_config: PathBuf::from("/etc/wireguard/wg0.conf"),
            endpoint: None,
            dns: vec!["1.1.1.1".to_string()],
            client_allowed_ips: vec!["0.0.0.0/0".to_string()],
            persistent_keepalive: None,
            preshared_key: false,
            output_dir: PathBuf::from("."),
            tool_timeout_secs: 10,
            lock_timeout_secs: 10,
            apply: false,
            native_keys: false,
            terminal_qr: true,
            wg_command: "wg".to_string(),
            qrencode_command: "qrencode".to_string(),
        }
    }
}

/// Command-line values that take precedence over the settings file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub server_config: Option<PathBuf>,
    pub endpoint: Option<String>,
    pub dns: Vec<String>,
    pub output_dir: Option<PathBuf>,
    pub persistent_keepalive: Option<u16>,
    pub preshared_key: bool,
    pub apply: bool,
    pub native_keys: bool,
    pub no_terminal_qr: bool,
}

impl Settings {
    /// Load settings from an explicit path, or from the default path if it exists
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_SETTINGS_PATH), false),
        };

        match std::fs::read_to_string(&path) {
            Ok(json) => {
                let settings = Self::from_json(&json).map_err(|e| {
                    ProvisionError::invalid(format!(
                        "settings file {} is invalid: {}",
                        path.display(),
                        e
                    ))
                })?;
                tracing::debug!("Loaded settings from {:?}", path);
                Ok(settings)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
                tracing::debug!("No settings file at {:?}, using defaults", path);
                Ok(Self::default())
            }
            Err(e) => Err(ProvisionError::io(
                format!("failed to read settings file {}", path.display()),
                e,
            )),
        }
    }

    pub fn from_json(json: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Apply command-line overrides on top of file/default values
    pub fn merge(mut self, overrides: Overrides) -> Self {
        if let Some(p) = overrides.server_config {
            self.server_config = p;
        }
        if let Some(e) = overrides.endpoint {
            self.endpoint = Some(e);
        }
        if !overrides.dns.is_empty() {
            self.dns = overrides.dns;
        }
        if let Some(d) = overrides.output_dir {
            self.output_dir = d;
        }
        if overrides.persistent_keepalive.is_some() {
            self.persistent_keepalive = overrides.persistent_keepalive;
        }
        self.preshared_key |= overrides.preshared_key;
        self.apply |= overrides.apply;
        self.native_keys |= overrides.native_keys;
        if overrides.no_terminal_qr {
            self.terminal_qr = false;
        }
        self
    }

    /// Check values that do not depend on the server configuration
    pub fn validate(&self) -> Result<()> {
        for dns in &self.dns {
            dns.parse::<IpAddr>()
                .map_err(|_| ProvisionError::invalid(format!("invalid DNS server: {}", dns)))?;
        }
        if self.client_allowed_ips.is_empty() {
            return Err(ProvisionError::invalid("client_allowed_ips must not be empty"));
        }
        for net in &self.client_allowed_ips {
            net.parse::<IpNet>().map_err(|_| {
                ProvisionError::invalid(format!("invalid client allowed IP: {}", net))
            })?;
        }
        if self.tool_timeout_secs == 0 {
            return Err(ProvisionError::invalid("tool_timeout_secs must be positive"));
        }
        Ok(())
    }

    /// Resolve the client-facing endpoint, filling in the port when only a host is set
    pub fn resolve_endpoint(&self, listen_port: Option<u16>) -> Result<String> {
        let endpoint = self.endpoint.as_deref().map(str::trim).unwrap_or_default();
        if endpoint.is_empty() {
            return Err(ProvisionError::invalid(
                "no endpoint configured; pass --endpoint or set endpoint in the settings file",
            ));
        }

        let port = listen_port.unwrap_or(DEFAULT_LISTEN_PORT);
        let candidate = if endpoint.parse::<std::net::Ipv6Addr>().is_ok() {
            format!("[{}]:{}", endpoint, port)
        } else if crate::config::parse_endpoint(endpoint).is_ok() {
            endpoint.to_string()
        } else {
            format!("{}:{}", endpoint, port)
        };

        crate::config::parse_endpoint(&candidate)
            .map_err(|_| ProvisionError::invalid(format!("invalid endpoint: {}", endpoint)))
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.server_config, PathBuf::from("/etc/wireguard/wg0.conf"));
        assert_eq!(settings.dns, vec!["1.1.1.1".to_string()]);
        assert_eq!(settings.client_allowed_ips, vec!["0.0.0.0/0".to_string()]);
        assert!(!settings.preshared_key);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let settings =
            Settings::from_json(r#"{"endpoint": "vpn.example.com", "preshared_key": true}"#)
                .unwrap();
        assert_eq!(settings.endpoint.as_deref(), Some("vpn.example.com"));
        assert!(settings.preshared_key);
        assert_eq!(settings.tool_timeout_secs, 10);
        assert_eq!(settings.wg_command, "wg");
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        assert!(Settings::from_json(r#"{"endpiont": "typo"}"#).is_err());
    }

    #[test]
    fn test_load_explicit_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(br#"{"dns": ["9.9.9.9", "149.112.112.112"]}"#)
            .unwrap();
        file.flush().unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.dns.len(), 2);
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = Settings::load(Some(&dir.path().join("absent.json")));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_corrupted_file_is_invalid_input() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"{ invalid json without closing brace").unwrap();
        file.flush().unwrap();

        let err = Settings::load(Some(file.path())).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_merge_overrides() {
        let base = Settings {
            endpoint: Some("old.example.com".to_string()),
            ..Settings::default()
        };
        let merged = base.merge(Overrides {
            endpoint: Some("new.example.com:443".to_string()),
            dns: vec!["9.9.9.9".to_string()],
            preshared_key: true,
            no_terminal_qr: true,
            ..Overrides::default()
        });
        assert_eq!(merged.endpoint.as_deref(), Some("new.example.com:443"));
        assert_eq!(merged.dns, vec!["9.9.9.9".to_string()]);
        assert!(merged.preshared_key);
        assert!(!merged.terminal_qr);
        assert_eq!(merged.output_dir, PathBuf::from("."));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let settings = Settings {
            dns: vec!["dns.example.com".to_string()],
            ..Settings::default()
        };
        assert!(settings.validate().is_err());

        let settings = Settings {
            client_allowed_ips: vec!["0.0.0.0/99".to_string()],
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_resolve_endpoint() {
        let mut settings = Settings::default();
        assert!(settings.resolve_endpoint(Some(51820)).is_err());

        settings.endpoint = Some("vpn.example.com".to_string());
        assert_eq!(
            settings.resolve_endpoint(Some(51999)).unwrap(),
            "vpn.example.com:51999"
        );
        assert_eq!(
            settings.resolve_endpoint(None).unwrap(),
            "vpn.example.com:51820"
        );

        settings.endpoint = Some("203.0.113.7:443".to_string());
        assert_eq!(settings.resolve_endpoint(Some(51820)).unwrap(), "203.0.113.7:443");

        settings.endpoint = Some("2001:db8::1".to_string());
        assert_eq!(
            settings.resolve_endpoint(Some(51820)).unwrap(),
            "[2001:db8::1]:51820"
        );

        // Trailing group looks like a port but is part of the address
        settings.endpoint = Some("2001:db8::1:5".to_string());
        assert_eq!(
            settings.resolve_endpoint(Some(51820)).unwrap(),
            "[2001:db8::1:5]:51820"
        );

        settings.endpoint = Some("[2001:db8::1]:443".to_string());
        assert_eq!(settings.resolve_endpoint(Some(51820)).unwrap(), "[2001:db8::1]:443");
    }
}
