//! SSH2 protocol core for the Fjord toolkit.
//!
//! This crate provides an event driven SSH2 implementation for both roles:
//!
//! - **Session** - version exchange, key exchange and rekeying, with
//!   non-transport traffic held back while keys change
//! - **Channels** - flow controlled channels with `session`, `direct-tcpip`,
//!   `forwarded-tcpip`, `x11` and agent channel types
//! - **Forwarding** - local, remote and SOCKS dynamic port forwarding with
//!   lifecycle events
//!
//! # Features
//!
//! - `ssh` (default) - SSH protocol support (client + server)
//!
//! # Example
//!
//! ```rust
//! use fjord_proto::ssh::proposal::negotiate_algorithm;
//!
//! let client = vec!["curve25519-sha256".to_string()];
//! let server = vec!["diffie-hellman-group14-sha256".to_string(), "curve25519-sha256".to_string()];
//! assert_eq!(negotiate_algorithm(&client, &server).as_deref(), Some("curve25519-sha256"));
//! ```
//!
//! # Security
//!
//! - All cryptographic operations use vetted libraries (`ring`, `dalek`)
//! - Constant-time operations for MAC checks and authentication
//! - Secure memory handling with `zeroize`
//! - Packet decoding is fuzzed
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ssh")]
pub mod ssh;
