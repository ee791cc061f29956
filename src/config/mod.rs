//! Configuration handling
//!
//! - `parser`: standard WireGuard `.conf` files (server config and generated client configs)
//! - `settings`: provisioner settings (defaults, JSON settings file, CLI overrides)

mod parser;
mod settings;

pub use parser::{InterfaceConfig, PeerConfig, WireGuardConfig, PEER_NAME_COMMENT};
pub use settings::{Overrides, Settings, DEFAULT_SETTINGS_PATH};

pub(crate) use parser::{parse_endpoint, parse_key};
