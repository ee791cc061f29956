//! Peer key generation
//!
//! Keys are produced by `wg genkey` / `wg pubkey` / `wg genpsk` by default.
//! Every key is checked to be 32 bytes of base64, and the public key is
//! cross-checked against an X25519 derivation of the private key.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::config::parse_key;
use crate::error::{Result, ToolError};
use crate::tool::ToolCommand;

/// Key length for X25519 (both private and public keys are 32 bytes)
pub const KEY_LEN: usize = 32;

/// Base64-encoded key material for one peer
#[derive(Clone, PartialEq, Eq)]
pub struct PeerKeys {
    pub private_key: String,
    pub public_key: String,
    pub preshared_key: Option<String>,
}

// Keep private material out of logs
impl std::fmt::Debug for PeerKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerKeys")
            .field("public_key", &self.public_key)
            .field("preshared_key", &self.preshared_key.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait KeyGenerator: Send + Sync {
    async fn generate(&self, with_psk: bool) -> Result<PeerKeys>;
}

/// Derive public key from private key
pub fn public_key(private_key: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    let secret = StaticSecret::from(*private_key);
    PublicKey::from(&secret).to_bytes()
}

/// Derive the base64 public key for a base64 private key
pub fn public_key_b64(private_key: &str) -> Result<String> {
    let private = parse_key(private_key, "PrivateKey")?;
    Ok(BASE64.encode(public_key(&private)))
}

/// Key generation through the `wg` command line tool
pub struct WgKeyGenerator {
    wg: ToolCommand,
    timeout: Duration,
}

impl WgKeyGenerator {
    pub fn new(wg: ToolCommand, timeout: Duration) -> Self {
        Self { wg, timeout }
    }

    async fn wg(&self, subcommand: &str, stdin: Option<&str>) -> Result<String> {
        let out = self.wg.run(&[subcommand], stdin, self.timeout).await?;
        self.check_key(&out, subcommand)?;
        Ok(out)
    }

    fn check_key(&self, value: &str, subcommand: &str) -> Result<()> {
        parse_key(value, subcommand).map_err(|_| ToolError::Failed {
            tool: self.wg.program().to_string(),
            reason: format!("'{}' did not print a 32-byte base64 key", subcommand),
        })?;
        Ok(())
    }
}

#[async_trait]
impl KeyGenerator for WgKeyGenerator {
    async fn generate(&self, with_psk: bool) -> Result<PeerKeys> {
        let private_key = self.wg("genkey", None).await?;
        let public_key = self.wg("pubkey", Some(&format!("{}\n", private_key))).await?;

        if public_key_b64(&private_key)? != public_key {
            return Err(ToolError::Failed {
                tool: self.wg.program().to_string(),
                reason: "public key does not match the generated private key".to_string(),
            }
            .into());
        }

        let preshared_key = if with_psk {
            Some(self.wg("genpsk", None).await?)
        } else {
            None
        };

        tracing::debug!("Generated keypair with public key {}", public_key);
        Ok(PeerKeys {
            private_key,
            public_key,
            preshared_key,
        })
    }
}

/// In-process key generation (X25519 from the OS RNG)
#[derive(Debug, Default)]
pub struct NativeKeyGenerator;

#[async_trait]
impl KeyGenerator for NativeKeyGenerator {
    async fn generate(&self, with_psk: bool) -> Result<PeerKeys> {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);

        let preshared_key = with_psk.then(|| {
            let mut psk = [0u8; KEY_LEN];
            OsRng.fill_bytes(&mut psk);
            BASE64.encode(psk)
        });

        Ok(PeerKeys {
            private_key: BASE64.encode(secret.to_bytes()),
            public_key: BASE64.encode(public.as_bytes()),
            preshared_key,
        })
    }
}
