//! SSH protocol version exchange (RFC 4253 Section 4.2).
//!
//! The SSH protocol begins with a version exchange where both client and server
//! send an identification string:
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! A server may send other lines before its identification string. The
//! [`IdentificationReader`] collects those lines for the application and
//! keeps partial lines buffered until the rest arrives.
//!
//! # Example
//!
//! ```rust
//! use fjord_proto::ssh::version::Version;
//!
//! let version = Version::new("Fjord_0.1.0", Some("test build"));
//! assert_eq!(version.to_string(), "SSH-2.0-Fjord_0.1.0 test build");
//!
//! let parsed = Version::parse("SSH-2.0-OpenSSH_8.9").unwrap();
//! assert_eq!(parsed.software(), "OpenSSH_8.9");
//! ```

use bytes::BytesMut;
use fjord_platform::{FjordError, FjordResult};

/// Maximum length of SSH version string (RFC 4253 Section 4.2).
pub const MAX_VERSION_LENGTH: usize = 255;

/// Maximum number of non-identification lines accepted before the version line.
pub const MAX_BANNER_LINES: usize = 64;

/// Longest pre-identification line tolerated.
const MAX_BANNER_LINE_LENGTH: usize = 8 * 1024;

/// SSH identification string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    proto_version: String,
    software_version: String,
    comments: Option<String>,
}

impl Version {
    /// Creates an identification for protocol version 2.0.
    ///
    /// ```rust
    /// use fjord_proto::ssh::version::Version;
    ///
    /// let version = Version::new("Fjord_0.1.0", None);
    /// assert_eq!(version.to_string(), "SSH-2.0-Fjord_0.1.0");
    /// ```
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        Self {
            proto_version: "2.0".to_string(),
            software_version: software.to_string(),
            comments: comments.map(String::from),
        }
    }

    /// Returns the identification this crate announces by default.
    pub fn default_fjord() -> Self {
        Self::new(&format!("Fjord_{}", env!("CARGO_PKG_VERSION")), None)
    }

    /// Parses an identification line (with or without the trailing CR LF).
    ///
    /// # Errors
    ///
    /// Returns [`FjordError::Protocol`] if the line is longer than 255
    /// characters, contains a NUL, does not start with `SSH-`, or announces a
    /// protocol version other than `2.0` / `1.99`.
    pub fn parse(line: &str) -> FjordResult<Self> {
        let line = line.trim_end_matches('\n').trim_end_matches('\r');

        if line.len() > MAX_VERSION_LENGTH {
            return Err(FjordError::Protocol(format!(
                "Identification too long: {} bytes (max {})",
                line.len(),
                MAX_VERSION_LENGTH
            )));
        }
        if line.contains('\0') {
            return Err(FjordError::Protocol(
                "Identification contains a NUL byte".to_string(),
            ));
        }
        let rest = line.strip_prefix("SSH-").ok_or_else(|| {
            FjordError::Protocol(format!("Invalid identification line: '{}'", line))
        })?;

        let (proto_version, rest) = rest.split_once('-').ok_or_else(|| {
            FjordError::Protocol(format!("Invalid identification format: '{}'", line))
        })?;

        if proto_version != "2.0" && proto_version != "1.99" {
            return Err(FjordError::Protocol(format!(
                "Unsupported protocol version: '{}' (expected '2.0' or '1.99')",
                proto_version
            )));
        }

        let (software_version, comments) = match rest.split_once(' ') {
            Some((software, comments)) => (software.to_string(), Some(comments.trim().to_string())),
            None => (rest.to_string(), None),
        };

        Ok(Self {
            proto_version: proto_version.to_string(),
            software_version,
            comments,
        })
    }

    /// Returns the protocol version (e.g., "2.0").
    pub fn proto_version(&self) -> &str {
        &self.proto_version
    }

    /// Returns the software version.
    pub fn software(&self) -> &str {
        &self.software_version
    }

    /// Returns the comments, if any.
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }

    /// Line as sent on the wire, CR LF terminated.
    pub fn to_wire_format(&self) -> Vec<u8> {
        format!("{}\r\n", self).into_bytes()
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SSH-{}-{}", self.proto_version, self.software_version)?;
        if let Some(comments) = &self.comments {
            write!(f, " {}", comments)?;
        }
        Ok(())
    }
}

/// Incremental reader for the peer's identification line.
///
/// Bytes are consumed from the connection buffer one complete line at a
/// time. Anything after the identification line stays in the buffer for the
/// packet decoder.
#[derive(Debug, Default)]
pub struct IdentificationReader {
    banner: Vec<String>,
    identification: Option<(String, Version)>,
}

impl IdentificationReader {
    /// Creates an empty reader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes complete lines from `buf`.
    ///
    /// Returns `Ok(false)` while more data is needed and `Ok(true)` once the
    /// identification line has been parsed.
    pub fn read_identification(&mut self, buf: &mut BytesMut) -> FjordResult<bool> {
        if self.identification.is_some() {
            return Ok(true);
        }
        loop {
            let newline = match buf.iter().position(|&b| b == b'\n') {
                Some(pos) => pos,
                None => {
                    if buf.len() > MAX_BANNER_LINE_LENGTH {
                        return Err(FjordError::Protocol(format!(
                            "Incomplete identification line exceeds {} bytes",
                            MAX_BANNER_LINE_LENGTH
                        )));
                    }
                    return Ok(false);
                }
            };

            let raw = buf.split_to(newline + 1);
            let line = String::from_utf8_lossy(&raw[..newline])
                .trim_end_matches('\r')
                .to_string();

            if line.starts_with("SSH-") {
                let version = Version::parse(&line)?;
                self.identification = Some((line, version));
                return Ok(true);
            }

            if self.banner.len() >= MAX_BANNER_LINES {
                return Err(FjordError::Protocol(format!(
                    "Too many lines ({}) before the identification string",
                    MAX_BANNER_LINES
                )));
            }
            self.banner.push(line);
        }
    }

    /// Lines received before the identification string.
    pub fn banner(&self) -> &[String] {
        &self.banner
    }

    /// The raw identification line (without CR LF), used in the exchange hash.
    pub fn identification_line(&self) -> Option<&str> {
        self.identification.as_ref().map(|(line, _)| line.as_str())
    }

    /// The parsed identification.
    pub fn version(&self) -> Option<&Version> {
        self.identification.as_ref().map(|(_, v)| v)
    }

    /// Takes the collected banner lines.
    pub fn take_banner(&mut self) -> Vec<String> {
        std::mem::take(&mut self.banner)
    }
}
