//! Per-peer output directory
//!
//! Layout: `<output_dir>/<name>/<name>.conf` and `<output_dir>/<name>/<name>.png`.
//! Creation is exclusive; an existing directory or file is never reused.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{ProvisionError, Result};
use crate::render::PeerName;
use crate::server::{require_access, AccessMode};

/// Paths produced for one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerPaths {
    pub dir: PathBuf,
    pub config: PathBuf,
    pub qr: PathBuf,
}

impl PeerPaths {
    pub fn new(output_dir: &Path, name: &PeerName) -> Self {
        let dir = output_dir.join(name.as_str());
        Self {
            config: dir.join(format!("{}.conf", name)),
            qr: dir.join(format!("{}.png", name)),
            dir,
        }
    }
}

/// Fail unless `output_dir` is an existing directory this process may write to
pub fn check_output_dir(output_dir: &Path) -> Result<()> {
    if !output_dir.is_dir() {
        return Err(ProvisionError::invalid(format!(
            "output directory {} does not exist",
            output_dir.display()
        )));
    }
    require_access(output_dir, AccessMode::Write)
}

/// Fail with `AlreadyExists` if the peer directory is already there
pub fn ensure_absent(paths: &PeerPaths) -> Result<()> {
    match std::fs::symlink_metadata(&paths.dir) {
        Ok(_) => Err(ProvisionError::AlreadyExists {
            what: format!("{} already exists", paths.dir.display()),
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ProvisionError::io(
            format!("failed to inspect {}", paths.dir.display()),
            e,
        )),
    }
}

/// Create the peer directory; the creation itself is the collision check
pub fn create_peer_directory(paths: &PeerPaths) -> Result<&Path> {
    let mut builder = std::fs::DirBuilder::new();

    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }

    builder.create(&paths.dir).map_err(|e| match e.kind() {
        std::io::ErrorKind::AlreadyExists => ProvisionError::AlreadyExists {
            what: format!("{} already exists", paths.dir.display()),
        },
        std::io::ErrorKind::PermissionDenied => ProvisionError::PermissionDenied {
            message: format!("cannot create {}", paths.dir.display()),
        },
        _ => ProvisionError::io(format!("failed to create {}", paths.dir.display()), e),
    })?;

    tracing::info!("Created {}", paths.dir.display());
    Ok(&paths.dir)
}

/// Write the client config; owner-only on Unix since it holds a private key
pub fn write_client_config(path: &Path, content: &str) -> Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let io_err = |e: std::io::Error| ProvisionError::io(format!("failed to write {}", path.display()), e);
    let mut file = options.open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::AlreadyExists {
            ProvisionError::AlreadyExists {
                what: format!("{} already exists", path.display()),
            }
        } else {
            io_err(e)
        }
    })?;
    file.write_all(content.as_bytes()).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;

    tracing::info!("Wrote {}", path.display());
    Ok(())
}
