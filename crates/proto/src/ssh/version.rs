//! SSH protocol version exchange (RFC 4253 Section 4.2).
//!
//! Both sides open the connection with an identification string:
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! A server may send other lines before its identification string; they are
//! skipped. Lines are capped at 255 bytes and may not contain NUL.
//!
//! # Example
//!
//! ```rust
//! use keel_proto::ssh::version::Version;
//!
//! let parsed = Version::parse("SSH-2.0-OpenSSH_8.9 Ubuntu-3").unwrap();
//! assert_eq!(parsed.software(), "OpenSSH_8.9");
//! assert_eq!(parsed.comments(), Some("Ubuntu-3"));
//! assert_eq!(parsed.as_str(), "SSH-2.0-OpenSSH_8.9 Ubuntu-3");
//! ```

use super::config::ClientId;
use bytes::BytesMut;
use keel_platform::{KeelError, KeelResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Maximum length of an identification line, excluding CR LF.
pub const MAX_VERSION_LENGTH: usize = 255;

/// Lines a server may send before its identification string.
pub const MAX_PRE_BANNER_LINES: usize = 1024;

/// A parsed identification string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    raw: String,
    proto_version: String,
    software_version: String,
    comments: Option<String>,
}

impl Version {
    /// Parses an identification line, with or without CR LF.
    ///
    /// Accepts protocol versions `2.0` and `1.99`.
    pub fn parse(line: &str) -> KeelResult<Self> {
        let line = line.trim_end_matches('\n').trim_end_matches('\r');

        if line.len() > MAX_VERSION_LENGTH {
            return Err(KeelError::Protocol(format!(
                "Version string too long: {} bytes (max {})",
                line.len(),
                MAX_VERSION_LENGTH
            )));
        }

        if line.contains('\0') {
            return Err(KeelError::Protocol(
                "Version string contains null byte".to_string(),
            ));
        }

        if !line.starts_with("SSH-") {
            return Err(KeelError::Protocol(format!(
                "Invalid version string: must start with 'SSH-', got '{}'",
                line
            )));
        }

        let parts: Vec<&str> = line.splitn(3, '-').collect();
        if parts.len() < 3 {
            return Err(KeelError::Protocol(format!(
                "Invalid version string format: '{}'",
                line
            )));
        }

        let proto_version = parts[1];
        let rest = parts[2];

        if proto_version != "2.0" && proto_version != "1.99" {
            return Err(KeelError::Protocol(format!(
                "Unsupported protocol version: '{}' (expected '2.0' or '1.99')",
                proto_version
            )));
        }

        let (software_version, comments) = match rest.split_once(' ') {
            Some((software, comments)) => (software.to_string(), Some(comments.trim().to_string())),
            None => (rest.to_string(), None),
        };

        Ok(Self {
            raw: line.to_string(),
            proto_version: proto_version.to_string(),
            software_version,
            comments,
        })
    }

    /// The line exactly as received, without CR LF. This is what gets hashed.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Returns the protocol version (e.g., "2.0").
    pub fn proto_version(&self) -> &str {
        &self.proto_version
    }

    /// Returns the software version (e.g., "OpenSSH_8.9").
    pub fn software(&self) -> &str {
        &self.software_version
    }

    /// Returns the comments, if any.
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Removes one line from the front of `buf`, if a full one is buffered.
fn take_line(buf: &mut BytesMut) -> KeelResult<Option<String>> {
    let Some(pos) = buf.iter().position(|&b| b == b'\n') else {
        if buf.len() > MAX_VERSION_LENGTH + 2 {
            return Err(KeelError::Protocol(format!(
                "Identification line exceeds {} bytes",
                MAX_VERSION_LENGTH
            )));
        }
        return Ok(None);
    };

    let line = buf.split_to(pos + 1);
    let text = String::from_utf8_lossy(&line);
    Ok(Some(text.trim_end_matches('\n').trim_end_matches('\r').to_string()))
}

/// Reads the peer's identification string, skipping any lines before it.
///
/// Bytes that arrive after the identification line stay in `buf`; they
/// belong to the first binary packet.
pub async fn read_identification<R>(reader: &mut R, buf: &mut BytesMut) -> KeelResult<Version>
where
    R: AsyncRead + Unpin,
{
    let mut skipped = 0;
    loop {
        while let Some(line) = take_line(buf)? {
            if line.starts_with("SSH-") {
                let version = Version::parse(&line)?;
                debug!(peer = %version, "Received identification string");
                return Ok(version);
            }

            trace!(line = %line, "Skipping pre-identification line");
            skipped += 1;
            if skipped > MAX_PRE_BANNER_LINES {
                return Err(KeelError::Protocol(
                    "Too many lines before identification string".to_string(),
                ));
            }
        }

        if reader.read_buf(buf).await? == 0 {
            return Err(KeelError::ConnectionClosed);
        }
    }
}

/// Sends our identification string and reads the server's.
pub async fn exchange_identification<S>(
    stream: &mut S,
    client_id: &ClientId,
    buf: &mut BytesMut,
) -> KeelResult<Version>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&client_id.to_wire()).await?;
    stream.flush().await?;
    read_identification(stream, buf).await
}
