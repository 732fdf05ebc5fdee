//! Session configuration.
//!
//! [`SshConfig`] carries the protocol tunables shared by both roles.
//! [`ClientConfig`] and [`ServerConfig`] wrap it with the collaborators each
//! role needs (host key verification, authenticators, command factories,
//! forwarding policy).
//!
//! ```rust
//! use fjord_proto::ssh::config::SshConfig;
//! use std::time::Duration;
//!
//! let config = SshConfig::default()
//!     .with_window_size(64 * 1024)
//!     .with_command_exit_timeout(Duration::from_secs(1));
//! assert_eq!(config.window_size, 64 * 1024);
//! ```

use crate::ssh::algorithms::{
    names, CipherAlgorithm, CompressionAlgorithm, HostKey, HostKeyAlgorithm, KexAlgorithm,
    MacAlgorithm,
};
use crate::ssh::auth::{PasswordAuthenticator, PublicKeyAuthenticator};
use crate::ssh::channel::command::CommandFactory;
use crate::ssh::channel::request::ChannelRequestHandler;
use crate::ssh::connection::global::GlobalRequestHandler;
use crate::ssh::forward::filter::{ForwardingFilter, RejectAllForwardingFilter};
use crate::ssh::forward::types::ForwardAddr;
use crate::ssh::proposal::{KexProposal, KexProposalOption};
use crate::ssh::session::Role;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Default local window: 2 MiB.
pub const DEFAULT_WINDOW_SIZE: u32 = 2 * 1024 * 1024;
/// Default maximum packet size announced for channels: 32 KiB.
pub const DEFAULT_MAX_PACKET_SIZE: u32 = 32 * 1024;
/// Default wait for a command to exit after its channel was closed.
pub const DEFAULT_COMMAND_EXIT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default wait for a `tcpip-forward` reply.
pub const DEFAULT_FORWARD_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Protocol tunables shared by client and server.
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Software version placed in the identification line.
    pub software_version: String,
    /// Key exchange preference.
    pub kex_algorithms: Vec<String>,
    /// Host key preference (client side; the server offers its keys).
    pub host_key_algorithms: Vec<String>,
    /// Cipher preference, used for both directions.
    pub ciphers: Vec<String>,
    /// MAC preference, used for both directions.
    pub macs: Vec<String>,
    /// Compression preference, used for both directions.
    pub compression: Vec<String>,
    /// Initial local window per channel.
    pub window_size: u32,
    /// Largest data packet accepted per channel.
    pub max_packet_size: u32,
    /// Concurrent channel limit; `None` is unlimited.
    pub max_channels: Option<usize>,
    /// Wait for a channel open confirmation; `None` waits forever.
    pub channel_open_timeout: Option<Duration>,
    /// Wait for authentication; `None` waits forever.
    pub auth_timeout: Option<Duration>,
    /// Wait for version exchange and the first key exchange.
    pub connect_timeout: Option<Duration>,
    /// Wait for a server command to exit after its channel closed.
    pub command_exit_timeout: Duration,
    /// Wait for replies to forwarding global requests.
    pub forward_request_timeout: Duration,
    /// Client heartbeat interval; `None` disables it.
    pub heartbeat_interval: Option<Duration>,
    /// Rekey after this many bytes in either direction.
    pub rekey_bytes_limit: u64,
    /// Rekey after this many packets in either direction.
    pub rekey_packets_limit: u64,
    /// Rekey after this much time; `None` disables it.
    pub rekey_time_limit: Option<Duration>,
    /// Grace period for channels to close before a graceful disconnect.
    pub close_timeout: Duration,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            software_version: format!("Fjord_{}", env!("CARGO_PKG_VERSION")),
            kex_algorithms: names(&KexAlgorithm::ALL, KexAlgorithm::name),
            host_key_algorithms: names(&HostKeyAlgorithm::ALL, HostKeyAlgorithm::name),
            // `none` is never offered unless asked for
            ciphers: vec![
                CipherAlgorithm::Aes256Gcm.name().to_string(),
                CipherAlgorithm::Aes128Gcm.name().to_string(),
            ],
            macs: vec![
                MacAlgorithm::HmacSha256.name().to_string(),
                MacAlgorithm::HmacSha512.name().to_string(),
            ],
            compression: names(&CompressionAlgorithm::ALL, CompressionAlgorithm::name),
            window_size: DEFAULT_WINDOW_SIZE,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            max_channels: None,
            channel_open_timeout: None,
            auth_timeout: None,
            connect_timeout: None,
            command_exit_timeout: DEFAULT_COMMAND_EXIT_TIMEOUT,
            forward_request_timeout: DEFAULT_FORWARD_REQUEST_TIMEOUT,
            heartbeat_interval: None,
            rekey_bytes_limit: 1 << 30,
            rekey_packets_limit: 1 << 31,
            rekey_time_limit: Some(Duration::from_secs(3600)),
            close_timeout: Duration::from_secs(5),
        }
    }
}

impl SshConfig {
    /// Sets the software version.
    pub fn with_software_version(mut self, version: impl Into<String>) -> Self {
        self.software_version = version.into();
        self
    }

    /// Sets the key exchange preference.
    pub fn with_kex_algorithms<S: Into<String>>(mut self, algs: Vec<S>) -> Self {
        self.kex_algorithms = algs.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the host key preference.
    pub fn with_host_key_algorithms<S: Into<String>>(mut self, algs: Vec<S>) -> Self {
        self.host_key_algorithms = algs.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the cipher preference.
    pub fn with_ciphers<S: Into<String>>(mut self, algs: Vec<S>) -> Self {
        self.ciphers = algs.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the MAC preference.
    pub fn with_macs<S: Into<String>>(mut self, algs: Vec<S>) -> Self {
        self.macs = algs.into_iter().map(Into::into).collect();
        self
    }

    /// Appends `none` to the cipher list so [`switch_to_none_cipher`] can be
    /// negotiated later.
    ///
    /// [`switch_to_none_cipher`]: crate::ssh::session::SessionHandle::switch_to_none_cipher
    pub fn with_none_cipher_allowed(mut self) -> Self {
        let none = CipherAlgorithm::None.name().to_string();
        if !self.ciphers.contains(&none) {
            self.ciphers.push(none);
        }
        self
    }

    /// Sets the initial local window.
    pub fn with_window_size(mut self, size: u32) -> Self {
        self.window_size = size;
        self
    }

    /// Sets the maximum packet size.
    pub fn with_max_packet_size(mut self, size: u32) -> Self {
        self.max_packet_size = size;
        self
    }

    /// Limits concurrent channels.
    pub fn with_max_channels(mut self, max: usize) -> Self {
        self.max_channels = Some(max);
        self
    }

    /// Sets the channel open timeout.
    pub fn with_channel_open_timeout(mut self, timeout: Duration) -> Self {
        self.channel_open_timeout = Some(timeout);
        self
    }

    /// Sets the authentication timeout.
    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = Some(timeout);
        self
    }

    /// Sets the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Sets the command exit timeout.
    pub fn with_command_exit_timeout(mut self, timeout: Duration) -> Self {
        self.command_exit_timeout = timeout;
        self
    }

    /// Sets the forward request timeout.
    pub fn with_forward_request_timeout(mut self, timeout: Duration) -> Self {
        self.forward_request_timeout = timeout;
        self
    }

    /// Enables the client heartbeat.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    /// Sets the rekey limits. `time` of `None` disables time based rekeying.
    pub fn with_rekey_limits(mut self, bytes: u64, packets: u64, time: Option<Duration>) -> Self {
        self.rekey_bytes_limit = bytes;
        self.rekey_packets_limit = packets;
        self.rekey_time_limit = time;
        self
    }

    /// Sets the graceful close grace period.
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Builds the local KEXINIT proposal.
    ///
    /// `host_key_algorithms` overrides the configured host key list; the
    /// server passes the algorithms of the keys it actually holds.
    pub fn proposal(&self, host_key_algorithms: Option<Vec<String>>) -> KexProposal {
        let host_keys = host_key_algorithms.unwrap_or_else(|| self.host_key_algorithms.clone());
        KexProposal::new()
            .with(KexProposalOption::Algorithms, self.kex_algorithms.clone())
            .with(KexProposalOption::ServerKeys, host_keys)
            .with(KexProposalOption::C2sEncryption, self.ciphers.clone())
            .with(KexProposalOption::S2cEncryption, self.ciphers.clone())
            .with(KexProposalOption::C2sMac, self.macs.clone())
            .with(KexProposalOption::S2cMac, self.macs.clone())
            .with(KexProposalOption::C2sCompression, self.compression.clone())
            .with(KexProposalOption::S2cCompression, self.compression.clone())
    }
}

/// Decides whether a server host key is trusted.
pub trait ServerKeyVerifier: Send + Sync {
    /// Called once per key exchange with the server's public key blob.
    fn verify_server_key(&self, remote: Option<SocketAddr>, key_blob: &[u8]) -> bool;
}

/// Trusts every host key. Only for tests and trusted networks.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllServerKeys;

impl ServerKeyVerifier for AcceptAllServerKeys {
    fn verify_server_key(&self, remote: Option<SocketAddr>, key_blob: &[u8]) -> bool {
        tracing::warn!(
            "Accepting unverified host key {} from {:?}",
            crate::ssh::algorithms::hostkey::fingerprint(key_blob),
            remote
        );
        true
    }
}

/// Rejects every host key.
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectAllServerKeys;

impl ServerKeyVerifier for RejectAllServerKeys {
    fn verify_server_key(&self, _remote: Option<SocketAddr>, _key_blob: &[u8]) -> bool {
        false
    }
}

/// Trusts a fixed set of host keys, compared by fingerprint.
#[derive(Debug, Default, Clone)]
pub struct KnownServerKeys {
    fingerprints: HashSet<String>,
}

impl KnownServerKeys {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a public key blob.
    pub fn with_key(mut self, key_blob: &[u8]) -> Self {
        self.fingerprints
            .insert(crate::ssh::algorithms::hostkey::fingerprint(key_blob));
        self
    }

    /// Adds a `SHA256:` fingerprint.
    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprints.insert(fingerprint.into());
        self
    }
}

impl ServerKeyVerifier for KnownServerKeys {
    fn verify_server_key(&self, _remote: Option<SocketAddr>, key_blob: &[u8]) -> bool {
        self.fingerprints
            .contains(&crate::ssh::algorithms::hostkey::fingerprint(key_blob))
    }
}

/// Client side configuration.
#[derive(Clone)]
pub struct ClientConfig {
    /// Protocol tunables.
    pub ssh: SshConfig,
    /// Host key policy.
    pub server_key_verifier: Arc<dyn ServerKeyVerifier>,
    /// Local X server that `x11` channels opened by the server connect to.
    pub x11_display: Option<ForwardAddr>,
    /// Local agent socket that agent channels opened by the server connect to.
    pub agent_socket: Option<PathBuf>,
}

impl ClientConfig {
    /// Creates a configuration with the given host key policy.
    pub fn new(server_key_verifier: Arc<dyn ServerKeyVerifier>) -> Self {
        Self {
            ssh: SshConfig::default(),
            server_key_verifier,
            x11_display: None,
            agent_socket: None,
        }
    }

    /// Replaces the protocol tunables.
    pub fn with_ssh(mut self, ssh: SshConfig) -> Self {
        self.ssh = ssh;
        self
    }

    /// Sets the local X server.
    pub fn with_x11_display(mut self, display: ForwardAddr) -> Self {
        self.x11_display = Some(display);
        self
    }

    /// Sets the local agent socket.
    pub fn with_agent_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.agent_socket = Some(path.into());
        self
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("ssh", &self.ssh)
            .field("x11_display", &self.x11_display)
            .field("agent_socket", &self.agent_socket)
            .finish_non_exhaustive()
    }
}

/// Server side configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Protocol tunables.
    pub ssh: SshConfig,
    /// Host keys; at least one is required.
    pub host_keys: Vec<Arc<dyn HostKey>>,
    /// Password verification.
    pub password_authenticator: Option<Arc<dyn PasswordAuthenticator>>,
    /// Public key verification.
    pub publickey_authenticator: Option<Arc<dyn PublicKeyAuthenticator>>,
    /// Shell, exec and subsystem programs.
    pub command_factory: Option<Arc<dyn CommandFactory>>,
    /// Forwarding policy.
    pub forwarding_filter: Arc<dyn ForwardingFilter>,
    /// Extra global request handlers, consulted before the built-in ones.
    pub global_request_handlers: Vec<Arc<dyn GlobalRequestHandler>>,
    /// Extra session channel request handlers, consulted before the built-in ones.
    pub channel_request_handlers: Vec<Arc<dyn ChannelRequestHandler>>,
    /// Failed authentication attempts before disconnecting.
    pub max_auth_attempts: u32,
    /// Lines sent before the identification line.
    pub banner_lines: Vec<String>,
}

impl ServerConfig {
    /// Creates a configuration with a single host key.
    pub fn new(host_key: Arc<dyn HostKey>) -> Self {
        Self {
            ssh: SshConfig::default(),
            host_keys: vec![host_key],
            password_authenticator: None,
            publickey_authenticator: None,
            command_factory: None,
            forwarding_filter: Arc::new(RejectAllForwardingFilter),
            global_request_handlers: Vec::new(),
            channel_request_handlers: Vec::new(),
            max_auth_attempts: 6,
            banner_lines: Vec::new(),
        }
    }

    /// Replaces the protocol tunables.
    pub fn with_ssh(mut self, ssh: SshConfig) -> Self {
        self.ssh = ssh;
        self
    }

    /// Adds another host key.
    pub fn with_host_key(mut self, key: Arc<dyn HostKey>) -> Self {
        self.host_keys.push(key);
        self
    }

    /// Sets the password authenticator.
    pub fn with_password_authenticator(mut self, auth: Arc<dyn PasswordAuthenticator>) -> Self {
        self.password_authenticator = Some(auth);
        self
    }

    /// Sets the public key authenticator.
    pub fn with_publickey_authenticator(mut self, auth: Arc<dyn PublicKeyAuthenticator>) -> Self {
        self.publickey_authenticator = Some(auth);
        self
    }

    /// Sets the command factory.
    pub fn with_command_factory(mut self, factory: Arc<dyn CommandFactory>) -> Self {
        self.command_factory = Some(factory);
        self
    }

    /// Sets the forwarding policy.
    pub fn with_forwarding_filter(mut self, filter: Arc<dyn ForwardingFilter>) -> Self {
        self.forwarding_filter = filter;
        self
    }

    /// Adds a global request handler.
    pub fn with_global_request_handler(mut self, handler: Arc<dyn GlobalRequestHandler>) -> Self {
        self.global_request_handlers.push(handler);
        self
    }

    /// Adds a channel request handler.
    pub fn with_channel_request_handler(
        mut self,
        handler: Arc<dyn ChannelRequestHandler>,
    ) -> Self {
        self.channel_request_handlers.push(handler);
        self
    }

    /// Sets the authentication attempt limit.
    pub fn with_max_auth_attempts(mut self, max: u32) -> Self {
        self.max_auth_attempts = max;
        self
    }

    /// Adds a line sent before the identification line.
    pub fn with_banner_line(mut self, line: impl Into<String>) -> Self {
        self.banner_lines.push(line.into());
        self
    }

    /// Host key algorithms offered in KEXINIT, in configuration order.
    pub fn host_key_algorithms(&self) -> Vec<String> {
        let mut algs: Vec<String> = Vec::new();
        for key in &self.host_keys {
            let name = key.algorithm().name().to_string();
            if !algs.contains(&name) {
                algs.push(name);
            }
        }
        algs
    }

    /// Host key for the negotiated algorithm.
    pub fn host_key(&self, algorithm: &str) -> Option<&Arc<dyn HostKey>> {
        self.host_keys
            .iter()
            .find(|k| k.algorithm().name() == algorithm)
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("ssh", &self.ssh)
            .field("host_keys", &self.host_key_algorithms())
            .field("max_auth_attempts", &self.max_auth_attempts)
            .field("banner_lines", &self.banner_lines)
            .finish_non_exhaustive()
    }
}

/// Role specific configuration handed to a session.
#[derive(Debug, Clone)]
pub(crate) enum RoleConfig {
    Client(Arc<ClientConfig>),
    Server(Arc<ServerConfig>),
}

impl RoleConfig {
    pub(crate) fn role(&self) -> Role {
        match self {
            RoleConfig::Client(_) => Role::Client,
            RoleConfig::Server(_) => Role::Server,
        }
    }

    pub(crate) fn ssh(&self) -> &SshConfig {
        match self {
            RoleConfig::Client(c) => &c.ssh,
            RoleConfig::Server(s) => &s.ssh,
        }
    }

    pub(crate) fn proposal(&self) -> KexProposal {
        match self {
            RoleConfig::Client(c) => c.ssh.proposal(None),
            RoleConfig::Server(s) => s.ssh.proposal(Some(s.host_key_algorithms())),
        }
    }

    pub(crate) fn server(&self) -> Option<&Arc<ServerConfig>> {
        match self {
            RoleConfig::Server(s) => Some(s),
            RoleConfig::Client(_) => None,
        }
    }

    pub(crate) fn client(&self) -> Option<&Arc<ClientConfig>> {
        match self {
            RoleConfig::Client(c) => Some(c),
            RoleConfig::Server(_) => None,
        }
    }
}
