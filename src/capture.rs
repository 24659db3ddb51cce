//! Screen capture via the device's screencap utility
//!
//! The server treats capture as an opaque capability "produce PNG bytes":
//! it spawns the platform screencap binary and drains its stdout to EOF,
//! with the accumulated size capped so the result always fits one frame.

use crate::error::{Result, RmiError};
use log::debug;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// Device binary that renders the current screen as PNG on stdout
const SCREENCAP_BIN: &str = "/system/bin/screencap";

/// Largest capture payload that still fits a u32 length prefix
const MAX_CAPTURE_BYTES: u64 = u32::MAX as u64;

/// Capture the current screen as PNG bytes
pub async fn capture_png() -> Result<Vec<u8>> {
    capture_from(SCREENCAP_BIN, &["-p"]).await
}

async fn capture_from(program: &str, args: &[&str]) -> Result<Vec<u8>> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;

    let Some(mut stdout) = child.stdout.take() else {
        return Err(RmiError::Io(std::io::Error::other(
            "capture stdout unavailable",
        )));
    };

    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = stdout.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        if data.len() as u64 + n as u64 > MAX_CAPTURE_BYTES {
            return Err(RmiError::FrameTooLarge);
        }
        data.extend_from_slice(&buf[..n]);
    }

    let status = child.wait().await?;
    if !status.success() && data.is_empty() {
        return Err(RmiError::Io(std::io::Error::other(format!(
            "capture exited with {}",
            status
        ))));
    }
    debug!("captured {} bytes", data.len());
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn collects_child_stdout_to_eof() {
        let data = capture_from("/bin/sh", &["-c", "printf 'not-a-png'"])
            .await
            .unwrap();
        assert_eq!(data, b"not-a-png");
    }

    #[tokio::test]
    async fn missing_binary_is_an_error() {
        assert!(capture_from("/nonexistent/screencap", &["-p"]).await.is_err());
    }

    #[tokio::test]
    async fn failing_child_with_no_output_is_an_error() {
        assert!(capture_from("/bin/sh", &["-c", "exit 3"]).await.is_err());
    }
}
