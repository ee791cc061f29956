//! wg-provision - WireGuard peer provisioning
//!
//! Adds a peer to a WireGuard server in one pass: generate keys, pick the
//! next free address from the server's interface network, append a `[Peer]`
//! stanza to the server configuration, write the client `.conf`, and render
//! it as a QR code.
//!
//! # Usage
//!
//! ```no_run
//! use wg_provision::{Provisioner, Settings};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings {
//!         endpoint: Some("vpn.example.com".to_string()),
//!         ..Settings::default()
//!     };
//!     let done = Provisioner::from_settings(settings).provision("alice").await?;
//!     println!("{} -> {}", done.name, done.allowed_ip);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod controller;
pub mod error;
pub mod keys;
pub mod output;
pub mod qr;
pub mod render;
pub mod server;
pub mod tool;

pub use config::{Settings, WireGuardConfig};
pub use controller::{Provisioned, Provisioner};
pub use error::{ErrorKind, ProvisionError, RunError};
