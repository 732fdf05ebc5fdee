//! Server side agent forwarding.
//!
//! On `auth-agent-req@openssh.com` the server creates a Unix socket in a
//! private temporary directory and returns its path for `SSH_AUTH_SOCK`.
//! Every connection to that socket becomes an `auth-agent@openssh.com`
//! channel to the client.

use crate::ssh::session::WeakSession;
use fjord_platform::FjordResult;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

struct AgentSocket {
    dir: PathBuf,
    path: PathBuf,
    task: JoinHandle<()>,
}

/// Agent socket of one session.
pub struct AgentForwardSupport {
    session: WeakSession,
    socket: Mutex<Option<AgentSocket>>,
}

impl std::fmt::Debug for AgentForwardSupport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentForwardSupport")
            .field("path", &self.path())
            .finish()
    }
}

impl AgentForwardSupport {
    pub(crate) fn new(session: WeakSession) -> Self {
        Self {
            session,
            socket: Mutex::new(None),
        }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<AgentSocket>> {
        self.socket
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Path of the agent socket, once created.
    pub fn path(&self) -> Option<PathBuf> {
        self.slot().as_ref().map(|s| s.path.clone())
    }

    /// Creates the agent socket if needed and returns its path.
    pub(crate) fn initialize(&self) -> FjordResult<String> {
        let mut slot = self.slot();
        if let Some(socket) = slot.as_ref() {
            return Ok(socket.path.display().to_string());
        }
        let socket = imp::bind(self.session.clone())?;
        let path = socket.path.display().to_string();
        info!("Agent forwarding socket at {}", path);
        *slot = Some(socket);
        Ok(path)
    }

    /// Stops the listener and removes the socket.
    pub fn close(&self) {
        if let Some(socket) = self.slot().take() {
            socket.task.abort();
            let _ = std::fs::remove_file(&socket.path);
            let _ = std::fs::remove_dir(&socket.dir);
        }
    }
}

impl Drop for AgentForwardSupport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(unix)]
mod imp {
    use super::AgentSocket;
    use crate::ssh::connection::messages::ChannelType;
    use crate::ssh::forward::tunnel;
    use crate::ssh::session::WeakSession;
    use fjord_platform::FjordResult;
    use rand::RngCore;
    use std::os::unix::fs::DirBuilderExt;
    use tokio::net::UnixListener;
    use tracing::{debug, warn};

    pub(super) fn bind(session: WeakSession) -> FjordResult<AgentSocket> {
        let mut suffix = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut suffix);
        let dir = std::env::temp_dir().join(format!("fjord-agent-{}", hex::encode(suffix)));
        std::fs::DirBuilder::new().mode(0o700).create(&dir)?;
        let path = dir.join("agent.sock");
        let listener = match UnixListener::bind(&path) {
            Ok(listener) => listener,
            Err(e) => {
                let _ = std::fs::remove_dir(&dir);
                return Err(e.into());
            }
        };
        let task = tokio::spawn(accept_loop(listener, session));
        Ok(AgentSocket { dir, path, task })
    }

    async fn accept_loop(listener: UnixListener, session: WeakSession) {
        loop {
            let socket = match listener.accept().await {
                Ok((socket, _)) => socket,
                Err(e) => {
                    warn!("Agent socket accept failed: {}", e);
                    return;
                }
            };
            let Some(handle) = session.upgrade() else {
                return;
            };
            tokio::spawn(async move {
                match handle.open_channel_confirmed(ChannelType::AuthAgent).await {
                    Ok(channel) => tunnel::bridge(channel.into_stream(), socket).await,
                    Err(e) => debug!("Client refused agent channel: {}", e),
                }
            });
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use super::AgentSocket;
    use crate::ssh::session::WeakSession;
    use fjord_platform::{FjordError, FjordResult};

    pub(super) fn bind(_session: WeakSession) -> FjordResult<AgentSocket> {
        Err(FjordError::NotImplemented(
            "Agent forwarding needs Unix sockets".to_string(),
        ))
    }
}
