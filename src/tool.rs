//! External command execution
//!
//! `wg` and `qrencode` are run as subprocesses with a bounded runtime. A
//! missing binary or a non-zero exit is reported as the tool being
//! unavailable; an overrun kills the child and reports a timeout.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::ToolError;

/// A program plus leading arguments, e.g. `wg` or `sh -c '...' qrencode`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    program: String,
    args: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Fail unless the program resolves to an executable on PATH (or is an existing path)
    pub fn ensure_available(&self) -> Result<PathBuf, ToolError> {
        find_in_path(&self.program, std::env::var_os("PATH")).ok_or_else(|| ToolError::NotFound {
            tool: self.program.clone(),
        })
    }

    /// Run with extra arguments, optionally feeding `stdin`, and return trimmed stdout
    pub async fn run<S: AsRef<str>>(
        &self,
        extra_args: &[S],
        stdin: Option<&str>,
        timeout: Duration,
    ) -> Result<String, ToolError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .args(extra_args.iter().map(|a| a.as_ref()))
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(
            "Running {} {}",
            self.program,
            extra_args
                .iter()
                .map(|a| a.as_ref())
                .collect::<Vec<_>>()
                .join(" ")
        );

        let mut child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ToolError::NotFound {
                    tool: self.program.clone(),
                }
            } else {
                self.failed(format!("could not start: {}", e))
            }
        })?;

        let input = stdin.map(str::to_owned);
        let child_stdin = child.stdin.take();
        let exchange = async move {
            if let (Some(mut pipe), Some(input)) = (child_stdin, input) {
                let written = match pipe.write_all(input.as_bytes()).await {
                    Ok(()) => pipe.shutdown().await,
                    Err(e) => Err(e),
                };
                // A tool that exits without reading stdin is judged by its exit status
                match written {
                    Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => return Err(e),
                    _ => {}
                }
                // Closing stdin signals EOF to the tool
                drop(pipe);
            }
            child.wait_with_output().await
        };

        let output = match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result.map_err(|e| self.failed(e.to_string()))?,
            Err(_) => {
                tracing::warn!("{} timed out after {:?}", self.program, timeout);
                return Err(ToolError::Timeout {
                    tool: self.program.clone(),
                    seconds: timeout.as_secs().max(1),
                });
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            let reason = if stderr.is_empty() {
                format!("exited with {}", output.status)
            } else {
                format!("exited with {}: {}", output.status, stderr)
            };
            return Err(self.failed(reason));
        }

        String::from_utf8(output.stdout)
            .map(|s| s.trim().to_string())
            .map_err(|_| self.failed("produced non UTF-8 output".to_string()))
    }

    fn failed(&self, reason: String) -> ToolError {
        ToolError::Failed {
            tool: self.program.clone(),
            reason,
        }
    }
}

/// Resolve a program name the way a shell would, without running it
fn find_in_path(program: &str, path_var: Option<OsString>) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }

    let path_var = path_var?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(program))
        .find(|p| is_executable(p))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
