//! SSH (Secure Shell) protocol implementation.
//!
//! This module implements the SSH protocol according to RFC 4251-4254.
//!
//! # Architecture
//!
//! The SSH implementation is layered:
//!
//! 1. **Packet Layer** ([`packet`]) - Binary packet protocol (RFC 4253 Section 6)
//! 2. **Session** ([`session`]) - Version exchange, key exchange and the
//!    per-connection event loop (RFC 4253)
//! 3. **Authentication Layer** ([`auth`]) - User authentication (RFC 4252)
//! 4. **Connection Layer** ([`connection`], [`channel`]) - Channels and
//!    requests (RFC 4254)
//! 5. **Forwarding** ([`forward`]) - Local, remote and dynamic TCP/IP
//!    forwarding, X11 and agent forwarding
//! 6. **Client/Server APIs** ([`client`], [`server`])
//!
//! Every long running operation returns an [`future::SshFuture`] that can be
//! awaited, waited on from a plain thread, or observed through listeners.
//!
//! # Security Considerations
//!
//! - **Input Validation**: packet lengths, padding and name-lists are checked
//!   before anything is allocated
//! - **Constant-Time Operations**: MAC checks and password comparison
//! - **Memory Safety**: key material is zeroized on drop using [`zeroize`]
//! - **No Unsafe Code**: pure Rust implementation without `unsafe`
//!
//! # Example
//!
//! ```rust
//! use fjord_proto::ssh::version::Version;
//!
//! let version = Version::parse("SSH-2.0-OpenSSH_9.6").unwrap();
//! assert_eq!(version.software(), "OpenSSH_9.6");
//! ```
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol

pub mod algorithms;
pub mod auth;
pub mod buffer;
pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod forward;
pub mod future;
pub(crate) mod io;
pub mod message;
pub mod packet;
pub mod proposal;
pub mod server;
pub mod session;
pub mod version;

// Re-export main types
pub use auth::{PasswordAuthenticator, PublicKeyAuthenticator};
pub use channel::{Channel, ChannelEvent, ChannelState};
pub use client::{RemoteCommandError, SshClient};
pub use config::{ClientConfig, ServerConfig, ServerKeyVerifier, SshConfig};
pub use forward::types::ForwardAddr;
pub use forward::TcpipForwarder;
pub use future::SshFuture;
pub use message::{DisconnectReason, MessageType};
pub use server::SshServer;
pub use session::{KexState, Role, SessionHandle, SessionState};
pub use version::Version;
