//! Error types for wg-provision

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Main error type for peer provisioning
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// WireGuard `.conf` parsing errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// External tool errors (`wg`, `qrencode`)
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Permission denied: {message}")]
    PermissionDenied { message: String },

    #[error("Already exists: {what}")]
    AlreadyExists { what: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Payload of {len} bytes does not fit in a QR code")]
    EncodingTooLarge { len: usize },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Configuration parsing errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid config format at line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error("Invalid base64 key: {field}")]
    InvalidKey { field: String },

    #[error("Invalid IP address: {value}")]
    InvalidAddress { value: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid CIDR notation: {value}")]
    InvalidCidr { value: String },
}

/// External command errors
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("'{tool}' is not installed or not on PATH")]
    NotFound { tool: String },

    #[error("'{tool}' failed: {reason}")]
    Failed { tool: String, reason: String },

    #[error("'{tool}' did not finish within {seconds}s")]
    Timeout { tool: String, seconds: u64 },
}

/// Failure category, one per distinct operator-facing outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ToolUnavailable,
    ToolTimeout,
    PermissionDenied,
    AlreadyExists,
    InvalidInput,
    IoFailure,
    EncodingTooLarge,
}

impl ProvisionError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::InvalidInput,
            Self::Tool(ToolError::Timeout { .. }) => ErrorKind::ToolTimeout,
            Self::Tool(_) => ErrorKind::ToolUnavailable,
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Self::InvalidInput { .. } => ErrorKind::InvalidInput,
            Self::EncodingTooLarge { .. } => ErrorKind::EncodingTooLarge,
            Self::Io { .. } => ErrorKind::IoFailure,
        }
    }

    /// Get a user-friendly error message with suggested action
    pub fn user_message(&self) -> String {
        match self {
            Self::PermissionDenied { message } => {
                format!(
                    "{}\n  Run with sudo or as a user allowed to edit the WireGuard configuration.",
                    message
                )
            }

            Self::Tool(ToolError::NotFound { tool }) => {
                format!(
                    "'{}' is required but was not found.\n  \
                    Install wireguard-tools and qrencode, then try again.",
                    tool
                )
            }

            Self::Config(ConfigError::FileNotFound { path }) => {
                format!(
                    "Server configuration not found: {}\n  \
                    Pass --server-config or set server_config in the settings file.",
                    path
                )
            }

            Self::Config(ConfigError::InvalidKey { field }) => {
                format!(
                    "Invalid {} in server configuration. Expected 32-byte base64-encoded key.",
                    field
                )
            }

            _ => format!("{}", self),
        }
    }

    /// Get the exit code for this error
    pub fn exit_code(&self) -> u8 {
        match self.kind() {
            ErrorKind::InvalidInput => 1,
            ErrorKind::PermissionDenied => 2,
            ErrorKind::AlreadyExists => 3,
            ErrorKind::ToolUnavailable => 4,
            ErrorKind::ToolTimeout => 5,
            ErrorKind::EncodingTooLarge => 6,
            ErrorKind::IoFailure => 7,
        }
    }
}

/// Stage of a provisioning run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    AwaitingName,
    Validating,
    Generating,
    Writing,
    Rendering,
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AwaitingName => "reading peer name",
            Self::Validating => "validating",
            Self::Generating => "generating keys",
            Self::Writing => "writing configuration",
            Self::Rendering => "rendering QR code",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Side effect performed during a run, reported when a later step fails
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    PeerDirectory(PathBuf),
    ClientConfig(PathBuf),
    ServerStanza(PathBuf),
    LivePeer(String),
    QrImage(PathBuf),
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerDirectory(p) => write!(f, "created directory {}", p.display()),
            Self::ClientConfig(p) => write!(f, "wrote client config {}", p.display()),
            Self::ServerStanza(p) => write!(f, "appended [Peer] to {}", p.display()),
            Self::LivePeer(iface) => write!(f, "added peer to live interface {}", iface),
            Self::QrImage(p) => write!(f, "wrote QR image {}", p.display()),
        }
    }
}

/// A failed run: where it stopped, what it already did, and why
#[derive(Debug)]
pub struct RunError {
    pub stage: Stage,
    pub completed: Vec<Artifact>,
    pub source: ProvisionError,
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed while {}: {}", self.stage, self.source.user_message())?;
        if self.completed.is_empty() {
            write!(f, "\nNo changes were made.")
        } else {
            write!(f, "\nAlready completed (clean up manually if needed):")?;
            for artifact in &self.completed {
                write!(f, "\n  - {}", artifact)?;
            }
            Ok(())
        }
    }
}

impl RunError {
    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }

    pub fn exit_code(&self) -> u8 {
        self.source.exit_code()
    }
}

/// Result type alias for provisioning operations
pub type Result<T> = std::result::Result<T, ProvisionError>;
