//! SSH client.
//!
//! Connects over TCP, runs the first key exchange and hands out channels
//! through the session handle.
//!
//! # Example
//!
//! ```rust,no_run
//! use fjord_proto::ssh::client::SshClient;
//! use fjord_proto::ssh::config::{AcceptAllServerKeys, ClientConfig};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientConfig::new(Arc::new(AcceptAllServerKeys));
//! let client = SshClient::connect("127.0.0.1:2222", config).await?;
//! client.authenticate_password("user", "password").await?;
//!
//! let output = client.execute_remote_command("uname -a").await?;
//! println!("{}", output);
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

use crate::ssh::algorithms::hostkey::HostKey;
use crate::ssh::auth::ClientAuth;
use crate::ssh::channel::{Channel, ChannelEvent};
use crate::ssh::config::{ClientConfig, RoleConfig};
use crate::ssh::connection::messages::{ChannelType, EXTENDED_DATA_STDERR};
use crate::ssh::forward::TcpipForwarder;
use crate::ssh::session::{self, SessionHandle};
use bytes::BytesMut;
use fjord_platform::{FjordError, FjordResult};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// A remote command that wrote to stderr or exited unsuccessfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommandError {
    /// Command line that was run
    pub command: String,
    /// Exit status, if the server reported one
    pub exit_status: Option<u32>,
    /// Everything the command wrote to stderr
    pub stderr: String,
}

impl std::fmt::Display for RemoteCommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Remote command '{}' failed", self.command)?;
        if let Some(status) = self.exit_status {
            write!(f, " with status {}", status)?;
        }
        if !self.stderr.is_empty() {
            write!(f, ": {}", self.stderr.trim_end())?;
        }
        Ok(())
    }
}

impl std::error::Error for RemoteCommandError {}

/// Client side of one SSH connection.
///
/// Dropping the client closes the session gracefully.
#[derive(Debug)]
pub struct SshClient {
    session: SessionHandle,
    server_addr: Option<SocketAddr>,
}

impl SshClient {
    /// Connects to `addr` and completes the first key exchange.
    ///
    /// Both the TCP connect and the key exchange are bounded by the
    /// configured connect timeout.
    pub async fn connect(addr: &str, config: ClientConfig) -> FjordResult<Self> {
        let timeout = config.ssh.connect_timeout;
        debug!("Connecting to {}", addr);
        let stream = match timeout {
            Some(limit) => tokio::time::timeout(limit, TcpStream::connect(addr))
                .await
                .map_err(|_| FjordError::Timeout(format!("Connecting to {} took over {:?}", addr, limit)))??,
            None => TcpStream::connect(addr).await?,
        };
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr().ok();
        let local = stream.local_addr().ok();
        let client = Self::start(stream, config, peer, local).await?;
        info!("Connected to {}", addr);
        Ok(client)
    }

    /// Runs a client session over an already connected stream.
    pub async fn connect_stream<S>(stream: S, config: ClientConfig) -> FjordResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::start(stream, config, None, None).await
    }

    async fn start<S>(
        stream: S,
        config: ClientConfig,
        peer: Option<SocketAddr>,
        local: Option<SocketAddr>,
    ) -> FjordResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let timeout = config.ssh.connect_timeout;
        let session = session::spawn(stream, RoleConfig::Client(Arc::new(config)), peer, local);
        if let Err(e) = session.kex_future().verify(timeout).await {
            session.close(true);
            return Err(e);
        }
        Ok(Self {
            session,
            server_addr: peer,
        })
    }

    /// Session handle, for channels, rekeying and state.
    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    /// Server address, if connected over TCP.
    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.server_addr
    }

    /// Authenticated user name.
    pub fn username(&self) -> Option<String> {
        self.session.username()
    }

    /// True once authentication succeeded.
    pub fn is_authenticated(&self) -> bool {
        self.session.is_authenticated()
    }

    /// Server identification line.
    pub fn server_version(&self) -> Option<String> {
        self.session.peer_version()
    }

    /// Authenticates with a password.
    ///
    /// A rejected password fails with [`FjordError::Security`]; the session
    /// stays usable for another attempt.
    pub async fn authenticate_password(&self, user: &str, password: &str) -> FjordResult<()> {
        let request = ClientAuth::Password {
            user: user.to_string(),
            password: Zeroizing::new(password.to_string()),
        };
        let timeout = self.session.shared().config.ssh().auth_timeout;
        self.session.authenticate(request).verify(timeout).await
    }

    /// Authenticates with a private key.
    pub async fn authenticate_publickey(&self, user: &str, key: Arc<dyn HostKey>) -> FjordResult<()> {
        let request = ClientAuth::PublicKey {
            user: user.to_string(),
            key,
        };
        let timeout = self.session.shared().config.ssh().auth_timeout;
        self.session.authenticate(request).verify(timeout).await
    }

    /// Opens a `session` channel and waits for confirmation.
    pub async fn open_session(&self) -> FjordResult<Channel> {
        self.session.open_channel_confirmed(ChannelType::Session).await
    }

    /// Runs `command` and returns its stdout.
    ///
    /// Fails with a [`RemoteCommandError`] (wrapped in
    /// [`FjordError::Other`]) if the command wrote anything to stderr or
    /// exited with a non-zero status.
    pub async fn execute_remote_command(&self, command: &str) -> FjordResult<String> {
        let mut channel = self.open_session().await?;
        channel.exec(command).await?;
        let mut stdout = BytesMut::new();
        let mut stderr = BytesMut::new();
        let mut exit_status = None;
        while let Some(event) = channel.next_event().await {
            match event {
                ChannelEvent::Data(data) => stdout.extend_from_slice(&data),
                ChannelEvent::ExtendedData { code, data } if code == EXTENDED_DATA_STDERR => {
                    stderr.extend_from_slice(&data)
                }
                ChannelEvent::ExitStatus(status) => exit_status = Some(status),
                ChannelEvent::Closed => break,
                _ => {}
            }
        }
        let stderr = String::from_utf8_lossy(&stderr).into_owned();
        if !stderr.is_empty() || exit_status.map_or(false, |s| s != 0) {
            return Err(FjordError::Other(Box::new(RemoteCommandError {
                command: command.to_string(),
                exit_status,
                stderr,
            })));
        }
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }

    /// TCP/IP forwarder of this session.
    pub fn forwarder(&self) -> Arc<TcpipForwarder> {
        self.session.forwarder()
    }

    /// Closes the session gracefully and waits until it is gone.
    pub async fn close(&self) -> FjordResult<()> {
        let timeout = self.session.shared().config.ssh().close_timeout;
        self.session.close(false).verify(Some(timeout * 2)).await
    }
}

impl Drop for SshClient {
    fn drop(&mut self) {
        if self.session.is_open() {
            self.session.close(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_command_error_display() {
        let err = RemoteCommandError {
            command: "false".to_string(),
            exit_status: Some(1),
            stderr: "boom\n".to_string(),
        };
        assert_eq!(err.to_string(), "Remote command 'false' failed with status 1: boom");

        let err = RemoteCommandError {
            command: "ls".to_string(),
            exit_status: None,
            stderr: String::new(),
        };
        assert_eq!(err.to_string(), "Remote command 'ls' failed");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let config = ClientConfig::new(Arc::new(crate::ssh::config::AcceptAllServerKeys));
        let err = SshClient::connect(&addr.to_string(), config).await.unwrap_err();
        assert!(matches!(err, FjordError::Io(_)));
    }
}
