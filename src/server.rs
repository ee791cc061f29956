//! Server configuration resource
//!
//! The live server `.conf` is the system of record for peers. All access goes
//! through [`ServerConfigFile`]: reading, address allocation and appending
//! happen under a [`ServerConfigLock`], an advisory exclusive lock on a
//! sidecar `<config>.lock` file that is released when the guard drops.
//!
//! Appends never edit the file in place. The new content (old bytes verbatim
//! plus the stanza) goes to a temp file in the same directory, is fsynced,
//! and is renamed over the original, so a crash leaves either the old or the
//! new file. A symlinked config is resolved first, and the replacement keeps
//! the original owner and mode.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use ipnet::{IpNet, Ipv4Net};
use tempfile::NamedTempFile;

use crate::config::WireGuardConfig;
use crate::error::{ConfigError, ProvisionError, Result};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Handle to the server configuration file
#[derive(Debug, Clone)]
pub struct ServerConfigFile {
    path: PathBuf,
}

/// Exclusive access to the server configuration, released on drop
#[derive(Debug)]
pub struct ServerConfigLock<'a> {
    config: &'a ServerConfigFile,
    lock_file: File,
}

/// Parsed server configuration plus the exact bytes it was parsed from
#[derive(Debug, Clone)]
pub struct ServerSnapshot {
    pub raw: String,
    pub config: WireGuardConfig,
}

impl ServerConfigFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Interface name, taken from the file stem the way wg-quick does
    pub fn interface_name(&self) -> Option<&str> {
        self.path.file_stem().and_then(|s| s.to_str())
    }

    pub fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    /// Fail with `PermissionDenied` unless the file can be read and replaced
    pub fn check_access(&self) -> Result<()> {
        if !self.path.exists() {
            return Err(ConfigError::FileNotFound {
                path: self.path.display().to_string(),
            }
            .into());
        }
        require_access(&self.path, AccessMode::ReadWrite)?;
        require_access(parent_dir(&self.path), AccessMode::Write)
    }

    /// Acquire the exclusive lock, waiting up to `timeout` for another run to finish
    pub async fn lock(&self, timeout: Duration) -> Result<ServerConfigLock<'_>> {
        let lock_path = self.lock_path();
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| {
                ProvisionError::io(format!("failed to open lock file {}", lock_path.display()), e)
            })?;

        let started = Instant::now();
        loop {
            match try_lock_exclusive(&lock_file) {
                Ok(()) => break,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if started.elapsed() >= timeout {
                        return Err(ProvisionError::io(
                            format!(
                                "{} is locked by another provisioning run",
                                self.path.display()
                            ),
                            e,
                        ));
                    }
                    tokio::time::sleep(LOCK_POLL_INTERVAL).await;
                }
                Err(e) => {
                    return Err(ProvisionError::io(
                        format!("failed to lock {}", lock_path.display()),
                        e,
                    ))
                }
            }
        }

        tracing::debug!("Locked {:?}", lock_path);
        Ok(ServerConfigLock {
            config: self,
            lock_file,
        })
    }
}

impl ServerConfigLock<'_> {
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Read and parse the current configuration; malformed files are rejected
    pub fn read(&self) -> Result<ServerSnapshot> {
        let raw = std::fs::read_to_string(&self.config.path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProvisionError::from(ConfigError::FileNotFound {
                    path: self.config.path.display().to_string(),
                })
            } else {
                ProvisionError::io(
                    format!("failed to read {}", self.config.path.display()),
                    e,
                )
            }
        })?;
        let config = WireGuardConfig::parse(&raw)?;
        Ok(ServerSnapshot { raw, config })
    }

    /// Append `stanza` after the existing content, leaving existing bytes untouched
    pub fn append_peer_stanza(&self, snapshot: &ServerSnapshot, stanza: &str) -> Result<()> {
        // Replace the link target, not the link
        let path = std::fs::canonicalize(&self.config.path).map_err(|e| {
            ProvisionError::io(format!("failed to resolve {}", self.config.path.display()), e)
        })?;
        let path = path.as_path();
        let io_err = |what: &str, e: std::io::Error| {
            ProvisionError::io(format!("failed to {} {}", what, path.display()), e)
        };

        // Guard against edits made behind the lock's back since the snapshot
        let current = std::fs::read_to_string(path).map_err(|e| io_err("re-read", e))?;
        if current != snapshot.raw {
            return Err(ProvisionError::io(
                "server configuration changed while it was locked",
                std::io::Error::other(path.display().to_string()),
            ));
        }

        let mut content = current;
        if !content.is_empty() {
            if !content.ends_with('\n') {
                content.push('\n');
            }
            content.push('\n');
        }
        content.push_str(stanza);

        let metadata = std::fs::metadata(path).map_err(|e| io_err("stat", e))?;

        let mut tmp = NamedTempFile::new_in(parent_dir(path))
            .map_err(|e| io_err("create temp file next to", e))?;
        tmp.write_all(content.as_bytes())
            .map_err(|e| io_err("write temp file for", e))?;
        copy_owner(tmp.as_file(), &metadata)
            .map_err(|e| io_err("copy owner to temp file for", e))?;
        std::fs::set_permissions(tmp.path(), metadata.permissions())
            .map_err(|e| io_err("set permissions on temp file for", e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| io_err("sync temp file for", e))?;
        tmp.persist(path).map_err(|e| io_err("replace", e.error))?;

        sync_dir(parent_dir(path));
        tracing::info!("Appended [Peer] to {}", path.display());
        Ok(())
    }
}

impl Drop for ServerConfigLock<'_> {
    fn drop(&mut self) {
        unlock(&self.lock_file);
        tracing::debug!("Released lock on {:?}", self.config.path);
    }
}

/// First host of the interface network not used by the server or any peer, as a /32
pub fn next_free_address(config: &WireGuardConfig) -> Result<Ipv4Net> {
    let interface = config.interface.address.first().ok_or(ConfigError::MissingField {
        field: "Address in [Interface]".to_string(),
    })?;
    let network = interface.trunc();

    let in_use = |ip: Ipv4Addr| {
        config.interface.address.iter().any(|a| a.addr() == ip)
            || config.peers.iter().any(|peer| {
                peer.allowed_ips.iter().any(|net| match net {
                    IpNet::V4(v4) => v4.contains(&ip),
                    IpNet::V6(_) => false,
                })
            })
    };

    if network.prefix_len() >= 31 {
        return Err(ProvisionError::invalid(format!(
            "interface network {} has no room for peers",
            network
        )));
    }

    for ip in network.hosts() {
        if !in_use(ip) {
            return Ipv4Net::new(ip, 32)
                .map_err(|_| ProvisionError::invalid(format!("cannot assign {}", ip)));
        }
    }

    Err(ProvisionError::invalid(format!(
        "all addresses in {} are already assigned",
        network
    )))
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

#[derive(Clone, Copy)]
pub(crate) enum AccessMode {
    Write,
    ReadWrite,
}

/// Check access with the real/effective ids the kernel would use
#[cfg(unix)]
pub(crate) fn require_access(path: &Path, mode: AccessMode) -> Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| ProvisionError::invalid(format!("path contains NUL: {}", path.display())))?;
    let flags = match mode {
        AccessMode::Write => libc::W_OK,
        AccessMode::ReadWrite => libc::R_OK | libc::W_OK,
    };

    if unsafe { libc::access(c_path.as_ptr(), flags) } == 0 {
        return Ok(());
    }

    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EACCES) | Some(libc::EPERM) | Some(libc::EROFS) => {
            let who = if unsafe { libc::geteuid() } == 0 {
                "root"
            } else {
                "the current user"
            };
            Err(ProvisionError::PermissionDenied {
                message: format!("{} cannot modify {}", who, path.display()),
            })
        }
        _ => Err(ProvisionError::io(
            format!("failed to check access to {}", path.display()),
            err,
        )),
    }
}

#[cfg(not(unix))]
pub(crate) fn require_access(path: &Path, _mode: AccessMode) -> Result<()> {
    let meta = std::fs::metadata(path)
        .map_err(|e| ProvisionError::io(format!("failed to stat {}", path.display()), e))?;
    if meta.permissions().readonly() {
        return Err(ProvisionError::PermissionDenied {
            message: format!("{} is read-only", path.display()),
        });
    }
    Ok(())
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn unlock(file: &File) {
    use std::os::unix::io::AsRawFd;

    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

#[cfg(not(unix))]
fn try_lock_exclusive(_file: &File) -> std::io::Result<()> {
    tracing::warn!("Advisory locking is not available on this platform");
    Ok(())
}

#[cfg(not(unix))]
fn unlock(_file: &File) {}

/// Give `file` the owner and group of `original`, when they differ
#[cfg(unix)]
fn copy_owner(file: &File, original: &std::fs::Metadata) -> std::io::Result<()> {
    use std::os::unix::fs::MetadataExt;

    let current = file.metadata()?;
    if current.uid() == original.uid() && current.gid() == original.gid() {
        return Ok(());
    }
    std::os::unix::fs::fchown(file, Some(original.uid()), Some(original.gid()))
}

#[cfg(not(unix))]
fn copy_owner(_file: &File, _original: &std::fs::Metadata) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        tracing::warn!("Failed to sync directory {:?}: {}", dir, e);
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}
