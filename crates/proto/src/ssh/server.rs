//! SSH server.
//!
//! Accepts TCP connections and runs one session per connection. What a
//! session offers is decided by the [`ServerConfig`]: host keys,
//! authenticators, the command factory and the forwarding filter.
//!
//! # Example
//!
//! ```rust,no_run
//! use fjord_proto::ssh::algorithms::hostkey::Ed25519HostKey;
//! use fjord_proto::ssh::auth::StaticPasswordAuthenticator;
//! use fjord_proto::ssh::config::ServerConfig;
//! use fjord_proto::ssh::server::SshServer;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> fjord_platform::FjordResult<()> {
//! let config = ServerConfig::new(Arc::new(Ed25519HostKey::generate()))
//!     .with_password_authenticator(Arc::new(
//!         StaticPasswordAuthenticator::new().with_user("user", "password"),
//!     ));
//! let server = SshServer::bind("127.0.0.1:2222", config).await?;
//! server.run().await
//! # }
//! ```

use crate::ssh::config::{RoleConfig, ServerConfig};
use crate::ssh::session::{self, SessionHandle};
use fjord_platform::FjordResult;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Listening SSH server.
#[derive(Debug)]
pub struct SshServer {
    listener: TcpListener,
    config: Arc<ServerConfig>,
}

impl SshServer {
    /// Binds the listening socket.
    pub async fn bind(addr: &str, config: ServerConfig) -> FjordResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("SSH server listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            config: Arc::new(config),
        })
    }

    /// Address the server listens on.
    pub fn local_addr(&self) -> FjordResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts one connection and starts its session.
    ///
    /// The returned handle is live immediately; the key exchange and
    /// authentication proceed in the background.
    pub async fn accept(&self) -> FjordResult<SessionHandle> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        let local = stream.local_addr().ok();
        info!("Accepted connection from {}", peer);
        Ok(self.serve(stream, Some(peer), local))
    }

    /// Runs a server session over an already connected stream.
    pub fn serve<S>(
        &self,
        stream: S,
        peer: Option<SocketAddr>,
        local: Option<SocketAddr>,
    ) -> SessionHandle
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        session::spawn(
            stream,
            RoleConfig::Server(Arc::clone(&self.config)),
            peer,
            local,
        )
    }

    /// Accepts connections until accepting fails.
    pub async fn run(&self) -> FjordResult<()> {
        loop {
            match self.accept().await {
                Ok(session) => {
                    let peer = session.peer_addr();
                    tokio::spawn(async move {
                        // completes once the session is gone, never fails
                        let _ = session.close_future().wait(None).await;
                        info!("Connection from {:?} finished", peer);
                    });
                }
                Err(e) if is_transient(&e) => warn!("Accept failed: {}", e),
                Err(e) => return Err(e),
            }
        }
    }
}

fn is_transient(err: &fjord_platform::FjordError) -> bool {
    use std::io::ErrorKind;
    match err {
        fjord_platform::FjordError::Io(e) => matches!(
            e.kind(),
            ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset | ErrorKind::Interrupted
        ),
        _ => false,
    }
}
