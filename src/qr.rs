//! QR code output
//!
//! The PNG is written by `qrencode`, which reads the config text on stdin.
//! Capacity is checked up front with the `qrcode` crate at error correction
//! level L (qrencode's default), so an oversized payload fails before any
//! tool runs.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use qrcode::render::unicode;
use qrcode::types::QrError;
use qrcode::{EcLevel, QrCode};

use crate::error::{ProvisionError, Result};
use crate::tool::ToolCommand;

#[async_trait]
pub trait QrEmitter: Send + Sync {
    /// Fail early if the emitter cannot run at all
    fn preflight(&self) -> Result<()>;

    /// Write `payload` as a QR image to `output`
    async fn emit(&self, payload: &str, output: &Path) -> Result<()>;
}

/// Fail with `EncodingTooLarge` if `payload` exceeds QR capacity
pub fn check_capacity(payload: &str) -> Result<QrCode> {
    QrCode::with_error_correction_level(payload, EcLevel::L).map_err(|e| match e {
        QrError::DataTooLong => ProvisionError::EncodingTooLarge { len: payload.len() },
        other => ProvisionError::invalid(format!("cannot encode QR code: {}", other)),
    })
}

/// Render `payload` with Unicode half blocks for display in a terminal
pub fn render_terminal(payload: &str) -> Result<String> {
    let code = check_capacity(payload)?;
    Ok(code
        .render::<unicode::Dense1x2>()
        .dark_color(unicode::Dense1x2::Light)
        .light_color(unicode::Dense1x2::Dark)
        .build())
}

/// PNG output through the `qrencode` tool
pub struct QrencodeEmitter {
    qrencode: ToolCommand,
    timeout: Duration,
}

impl QrencodeEmitter {
    pub fn new(qrencode: ToolCommand, timeout: Duration) -> Self {
        Self { qrencode, timeout }
    }
}

#[async_trait]
impl QrEmitter for QrencodeEmitter {
    fn preflight(&self) -> Result<()> {
        self.qrencode.ensure_available()?;
        Ok(())
    }

    async fn emit(&self, payload: &str, output: &Path) -> Result<()> {
        check_capacity(payload)?;

        let output_arg = output.to_str().ok_or_else(|| {
            ProvisionError::invalid(format!("output path is not UTF-8: {}", output.display()))
        })?;
        self.qrencode
            .run(&["-t", "PNG", "-o", output_arg], Some(payload), self.timeout)
            .await?;

        if !output.is_file() {
            return Err(ProvisionError::io(
                format!("{} did not produce {}", self.qrencode.program(), output.display()),
                std::io::Error::from(std::io::ErrorKind::NotFound),
            ));
        }

        tracing::info!("Wrote {}", output.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// Writes stdin verbatim to the `-o` target, standing in for `qrencode`
    #[cfg(unix)]
    fn fake_qrencode() -> ToolCommand {
        ToolCommand::with_args("sh", ["-c", "cat > \"$4\"", "qrencode"])
    }

    #[test]
    fn test_capacity_limit() {
        assert!(check_capacity(&"A".repeat(512)).is_ok());

        // Version 40-L holds 2953 bytes
        assert!(check_capacity(&"x".repeat(2953)).is_ok());
        let kind = check_capacity(&"x".repeat(2954)).err().map(|e| e.kind());
        assert_eq!(kind, Some(ErrorKind::EncodingTooLarge));
    }

    #[test]
    fn test_render_terminal() {
        let art = render_terminal("[Interface]\nAddress = 10.0.0.4/32\n").unwrap();
        assert!(art.lines().count() > 10);
        assert!(art.contains('█') || art.contains('▀') || art.contains('▄'));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_emit_writes_image() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("alice.png");
        let payload = "[Interface]\nAddress = 10.0.0.4/32\n";

        let emitter = QrencodeEmitter::new(fake_qrencode(), TIMEOUT);
        emitter.preflight().unwrap();
        emitter.emit(payload, &output).await.unwrap();

        assert_eq!(std::fs::read_to_string(&output).unwrap(), payload);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_oversized_payload_never_reaches_tool() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("big.png");

        let emitter = QrencodeEmitter::new(fake_qrencode(), TIMEOUT);
        let err = emitter.emit(&"x".repeat(4000), &output).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EncodingTooLarge);
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn test_missing_qrencode() {
        let emitter = QrencodeEmitter::new(
            ToolCommand::new("definitely-not-a-real-tool-7f3a"),
            TIMEOUT,
        );
        assert_eq!(emitter.preflight().unwrap_err().kind(), ErrorKind::ToolUnavailable);

        let dir = tempfile::tempdir().unwrap();
        let err = emitter
            .emit("payload", &dir.path().join("x.png"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ToolUnavailable);
    }
}
