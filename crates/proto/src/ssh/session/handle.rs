//! Application side of a session.
//!
//! A [`SessionHandle`] is a cheap clonable sender into the session loop plus
//! a view of the state the loop publishes. Every operation is a [`Msg`]; the
//! loop is the only code that touches the transport, the key exchange or the
//! channel table.

use super::{KexState, Role, SessionState};
use crate::ssh::auth::ClientAuth;
use crate::ssh::channel::{Channel, ChannelEvent, ChannelSetup};
use crate::ssh::channel::window::RemoteWindow;
use crate::ssh::config::RoleConfig;
use crate::ssh::connection::messages::{ChannelRequestType, ChannelType, GlobalRequestType};
use crate::ssh::forward::agent::AgentForwardSupport;
use crate::ssh::forward::x11::X11ForwardSupport;
use crate::ssh::forward::TcpipForwarder;
use crate::ssh::future::{AuthFuture, CloseFuture, KexFuture, OpenFuture, SshFuture};
use crate::ssh::proposal::Negotiated;
use bytes::Bytes;
use fjord_platform::{FjordError, FjordResult};
use once_cell::sync::OnceCell;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{mpsc, oneshot};

/// Commands from handles to the session loop.
pub(crate) enum Msg {
    OpenChannel {
        setup: ChannelSetup,
        reply: oneshot::Sender<FjordResult<u32>>,
    },
    ChannelData {
        id: u32,
        ext: Option<u32>,
        data: Bytes,
    },
    ChannelConsumed {
        id: u32,
        len: u32,
    },
    ChannelEof {
        id: u32,
    },
    ChannelClose {
        id: u32,
        immediately: bool,
    },
    ChannelRequest {
        id: u32,
        request: ChannelRequestType,
        reply: Option<SshFuture<bool>>,
    },
    ChannelReply {
        id: u32,
        success: bool,
    },
    ChannelOpenResult {
        id: u32,
        result: FjordResult<()>,
    },
    CommandExited {
        id: u32,
        status: u32,
    },
    GlobalRequest {
        request: GlobalRequestType,
        reply: Option<SshFuture<Option<Bytes>>>,
    },
    GlobalReply {
        token: u64,
        success: bool,
        data: Bytes,
    },
    Rekey {
        future: KexFuture,
    },
    SwitchToNoneCipher {
        future: KexFuture,
    },
    Authenticate {
        request: ClientAuth,
        future: AuthFuture,
    },
    Close {
        immediately: bool,
    },
}

/// State the loop publishes for handles.
#[derive(Debug, Clone, Default)]
pub(crate) struct SessionInfo {
    pub(crate) state: SessionState,
    pub(crate) kex_state: KexState,
    pub(crate) session_id: Option<Vec<u8>>,
    pub(crate) peer_version: Option<String>,
    pub(crate) banner: Vec<String>,
    pub(crate) username: Option<String>,
    pub(crate) authenticated: bool,
    pub(crate) negotiated: Option<Negotiated>,
}

/// Data shared between the loop and all handles of one session.
pub(crate) struct SessionShared {
    pub(crate) role: Role,
    pub(crate) config: RoleConfig,
    pub(crate) peer_addr: Option<SocketAddr>,
    pub(crate) local_addr: Option<SocketAddr>,
    info: Mutex<SessionInfo>,
    pub(crate) first_kex: KexFuture,
    pub(crate) close_future: CloseFuture,
    forwarder: OnceCell<Arc<TcpipForwarder>>,
    x11: OnceCell<Arc<X11ForwardSupport>>,
    agent: OnceCell<Arc<AgentForwardSupport>>,
}

impl SessionShared {
    pub(crate) fn new(
        config: RoleConfig,
        peer_addr: Option<SocketAddr>,
        local_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            role: config.role(),
            config,
            peer_addr,
            local_addr,
            info: Mutex::new(SessionInfo::default()),
            first_kex: KexFuture::new("key exchange"),
            close_future: CloseFuture::new("session close"),
            forwarder: OnceCell::new(),
            x11: OnceCell::new(),
            agent: OnceCell::new(),
        }
    }

    pub(crate) fn info(&self) -> MutexGuard<'_, SessionInfo> {
        self.info
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.info().state = state;
    }

    pub(crate) fn existing_forwarder(&self) -> Option<&Arc<TcpipForwarder>> {
        self.forwarder.get()
    }

    /// Stops forwarding listeners created for this session.
    pub(crate) fn close_supports(&self) {
        if let Some(forwarder) = self.forwarder.get() {
            forwarder.abort();
        }
        if let Some(x11) = self.x11.get() {
            x11.close();
        }
        if let Some(agent) = self.agent.get() {
            agent.close();
        }
    }
}

/// Clonable handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<Msg>,
    shared: Arc<SessionShared>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("role", &self.shared.role)
            .field("peer_addr", &self.shared.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl SessionHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Msg>, shared: Arc<SessionShared>) -> Self {
        Self { tx, shared }
    }

    pub(crate) fn shared(&self) -> &Arc<SessionShared> {
        &self.shared
    }

    pub(crate) fn send(&self, msg: Msg) -> FjordResult<()> {
        self.tx
            .send(msg)
            .map_err(|_| FjordError::Closed("Session closed".to_string()))
    }

    /// Which side of the connection this is.
    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Remote socket address, if known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer_addr
    }

    /// Local socket address, if known.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.shared.info().state
    }

    /// Current key exchange state.
    pub fn kex_state(&self) -> KexState {
        self.shared.info().kex_state
    }

    /// True until the session starts closing.
    pub fn is_open(&self) -> bool {
        !matches!(self.state(), SessionState::Closing | SessionState::Closed)
    }

    /// Exchange hash of the first key exchange.
    pub fn session_id(&self) -> Option<Vec<u8>> {
        self.shared.info().session_id.clone()
    }

    /// Peer identification line.
    pub fn peer_version(&self) -> Option<String> {
        self.shared.info().peer_version.clone()
    }

    /// Lines the server sent before its identification line.
    pub fn banner(&self) -> Vec<String> {
        self.shared.info().banner.clone()
    }

    /// Authenticated user.
    pub fn username(&self) -> Option<String> {
        self.shared.info().username.clone()
    }

    /// True once user authentication succeeded.
    pub fn is_authenticated(&self) -> bool {
        self.shared.info().authenticated
    }

    /// Algorithms agreed in the latest key exchange.
    pub fn negotiated(&self) -> Option<Negotiated> {
        self.shared.info().negotiated.clone()
    }

    /// Completes when the first key exchange has finished.
    pub fn kex_future(&self) -> KexFuture {
        self.shared.first_kex.clone()
    }

    /// Completes when the session has terminated.
    pub fn close_future(&self) -> CloseFuture {
        self.shared.close_future.clone()
    }

    /// Closes the session.
    ///
    /// A graceful close lets open channels finish closing (bounded by the
    /// configured close timeout) before disconnecting; an immediate close
    /// disconnects right away.
    pub fn close(&self, immediately: bool) -> CloseFuture {
        let future = self.close_future();
        if self.send(Msg::Close { immediately }).is_err() && !future.is_done() {
            future.set_value(Ok(()));
        }
        future
    }

    /// Starts a key re-exchange. Completes when new keys are in use.
    pub fn rekey(&self) -> KexFuture {
        let future = KexFuture::new("rekey");
        if let Err(e) = self.send(Msg::Rekey {
            future: future.clone(),
        }) {
            future.set_value(Err(e));
        }
        future
    }

    /// Re-exchanges keys negotiating the `none` cipher in both directions.
    ///
    /// Only valid while no channel is open and no key exchange is running,
    /// and only if both sides offered `none`.
    pub fn switch_to_none_cipher(&self) -> KexFuture {
        let future = KexFuture::new("switch to none cipher");
        if let Err(e) = self.send(Msg::SwitchToNoneCipher {
            future: future.clone(),
        }) {
            future.set_value(Err(e));
        }
        future
    }

    pub(crate) fn authenticate(&self, request: ClientAuth) -> AuthFuture {
        let future = AuthFuture::new("authentication");
        if let Err(e) = self.send(Msg::Authenticate {
            request,
            future: future.clone(),
        }) {
            future.set_value(Err(e));
        }
        future
    }

    /// Opens a channel.
    ///
    /// Returns as soon as the channel is registered and the open request
    /// queued; wait on [`Channel::open_future`] for the peer's answer.
    pub async fn open_channel(&self, channel_type: ChannelType) -> FjordResult<Channel> {
        let (events_tx, events_rx) = mpsc::unbounded_channel::<ChannelEvent>();
        let remote = Arc::new(RemoteWindow::new());
        let open_future = OpenFuture::new("channel open");
        let close_future = CloseFuture::new("channel close");
        let setup = ChannelSetup {
            channel_type: channel_type.clone(),
            events: events_tx,
            remote: Arc::clone(&remote),
            open_future: open_future.clone(),
            close_future: close_future.clone(),
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Msg::OpenChannel {
            setup,
            reply: reply_tx,
        })?;
        let id = reply_rx
            .await
            .map_err(|_| FjordError::Closed("Session closed".to_string()))??;
        Ok(Channel::new(
            id,
            channel_type,
            self.clone(),
            events_rx,
            remote,
            open_future,
            close_future,
        ))
    }

    /// Opens a channel and waits for confirmation within the configured
    /// channel open timeout.
    pub async fn open_channel_confirmed(&self, channel_type: ChannelType) -> FjordResult<Channel> {
        let channel = self.open_channel(channel_type).await?;
        let timeout = self.shared.config.ssh().channel_open_timeout;
        if let Err(e) = channel.open_future().verify(timeout).await {
            channel.close(true);
            return Err(e);
        }
        Ok(channel)
    }

    /// Sends a global request.
    ///
    /// With `want_reply` the future yields `Some(data)` on success and `None`
    /// on failure; without it the future completes as soon as the request is
    /// queued.
    pub fn global_request(
        &self,
        request: GlobalRequestType,
        want_reply: bool,
    ) -> SshFuture<Option<Bytes>> {
        let future: SshFuture<Option<Bytes>> = SshFuture::new("global request");
        let reply = if want_reply {
            Some(future.clone())
        } else {
            None
        };
        match self.send(Msg::GlobalRequest { request, reply }) {
            Ok(()) => {
                if !want_reply {
                    future.set_value(Ok(None));
                }
            }
            Err(e) => {
                future.set_value(Err(e));
            }
        }
        future
    }

    pub(crate) fn global_reply(&self, token: u64, success: bool, data: Bytes) {
        // the loop is gone, nobody is waiting for the reply
        let _ = self.send(Msg::GlobalReply {
            token,
            success,
            data,
        });
    }

    /// TCP/IP forwarder of this session, created on first use.
    pub fn forwarder(&self) -> Arc<TcpipForwarder> {
        Arc::clone(
            self.shared
                .forwarder
                .get_or_init(|| Arc::new(TcpipForwarder::new(self.downgrade(), &self.shared.config))),
        )
    }

    pub(crate) fn x11_support(&self) -> Arc<X11ForwardSupport> {
        Arc::clone(
            self.shared
                .x11
                .get_or_init(|| Arc::new(X11ForwardSupport::new(self.downgrade()))),
        )
    }

    pub(crate) fn agent_support(&self) -> Arc<AgentForwardSupport> {
        Arc::clone(
            self.shared
                .agent
                .get_or_init(|| Arc::new(AgentForwardSupport::new(self.downgrade()))),
        )
    }

    /// Non-owning reference for long lived helpers.
    pub fn downgrade(&self) -> WeakSession {
        WeakSession {
            tx: self.tx.downgrade(),
            shared: Arc::downgrade(&self.shared),
        }
    }
}

/// Non-owning session reference.
///
/// Forwarders and forward supports are cached inside the session and keep
/// only this, so they never keep a finished session alive.
#[derive(Clone)]
pub struct WeakSession {
    tx: mpsc::WeakUnboundedSender<Msg>,
    shared: Weak<SessionShared>,
}

impl WeakSession {
    /// Recovers a handle if the session is still running.
    pub fn upgrade(&self) -> Option<SessionHandle> {
        Some(SessionHandle {
            tx: self.tx.upgrade()?,
            shared: self.shared.upgrade()?,
        })
    }

    pub(crate) fn handle(&self) -> FjordResult<SessionHandle> {
        self.upgrade()
            .ok_or_else(|| FjordError::Closed("Session closed".to_string()))
    }
}

impl std::fmt::Debug for WeakSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakSession")
            .field("alive", &(self.shared.strong_count() > 0))
            .finish()
    }
}
