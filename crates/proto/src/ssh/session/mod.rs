//! Session core.
//!
//! One task per connection owns the socket reader, the packet codec, the key
//! exchange, user authentication and the channel table. Everything else
//! talks to it through a [`SessionHandle`]. The task runs until the peer
//! disconnects, a fatal error occurs or the application closes the session;
//! on the way out every pending future is completed.
//!
//! Incoming packets are dispatched by opcode range:
//!
//! | Range  | Handler                                   |
//! |--------|-------------------------------------------|
//! | 1-19   | transport (disconnect, ignore, debug, service) |
//! | 20-49  | key exchange                              |
//! | 50-79  | user authentication                       |
//! | 80-127 | connection protocol, after authentication |

pub mod handle;
mod keepalive;
pub(crate) mod kex;
pub(crate) mod transport;

pub use handle::{SessionHandle, WeakSession};

use crate::ssh::auth::{ClientAuthService, ServerAuthService, SERVICE_USERAUTH};
use crate::ssh::buffer::{self, SshReader, SshWrite};
use crate::ssh::config::RoleConfig;
use crate::ssh::connection::messages::ConnectionMessage;
use crate::ssh::connection::ConnectionService;
use crate::ssh::io::IoWriter;
use crate::ssh::message::{DisconnectReason, MessageType};
use crate::ssh::packet::PacketDecoder;
use crate::ssh::version::{IdentificationReader, Version};
use bytes::{BufMut, Bytes, BytesMut};
use fjord_platform::{FjordError, FjordResult};
use handle::{Msg, SessionShared};
use keepalive::KeepaliveTask;
use kex::KexMachine;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use transport::Transport;

/// Housekeeping period of the session loop.
const TICK: Duration = Duration::from_millis(250);

/// Which end of the connection a session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiated the connection
    Client,
    /// Accepted the connection
    Server,
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Waiting for the peer's identification line
    #[default]
    VersionExchange,
    /// KEXINIT sent or received
    KexInit,
    /// Key exchange method messages in flight
    KexRun,
    /// Our NEWKEYS sent, waiting for the peer's
    KexKeys,
    /// Keys in place, services running
    Established,
    /// Graceful close in progress
    Closing,
    /// Terminated
    Closed,
}

/// Progress of the current key exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KexState {
    /// No exchange started yet
    #[default]
    Unknown,
    /// KEXINIT exchanged or being exchanged
    Init,
    /// Method specific messages in flight
    Run,
    /// Waiting for NEWKEYS
    Keys,
    /// Last exchange finished
    Done,
}

impl From<KexState> for SessionState {
    fn from(state: KexState) -> Self {
        match state {
            KexState::Unknown | KexState::Init => SessionState::KexInit,
            KexState::Run => SessionState::KexRun,
            KexState::Keys => SessionState::KexKeys,
            KexState::Done => SessionState::Established,
        }
    }
}

/// What the connection protocol handlers see of their session.
pub(crate) struct SessionContext {
    pub(crate) role: Role,
    pub(crate) config: RoleConfig,
    pub(crate) handle: SessionHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Service {
    None,
    UserAuth,
    Connection,
}

/// Starts the session task over `stream` and returns its handle.
///
/// The identification line and our first KEXINIT are queued right away.
pub(crate) fn spawn<S>(
    stream: S,
    config: RoleConfig,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
) -> SessionHandle
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(SessionShared::new(config.clone(), peer_addr, local_addr));
    let handle = SessionHandle::new(tx, Arc::clone(&shared));
    let (reader, writer) = tokio::io::split(stream);
    let session = Session::new(handle.clone(), shared, IoWriter::spawn(writer));
    tokio::spawn(session.run(reader, rx));
    handle
}

struct Session {
    ctx: SessionContext,
    shared: Arc<SessionShared>,
    transport: Transport,
    decoder: PacketDecoder,
    ident: IdentificationReader,
    ident_done: bool,
    local_version: Version,
    kex: KexMachine,
    service: Service,
    client_auth: ClientAuthService,
    server_auth: ServerAuthService,
    connection: ConnectionService,
    keepalive: Option<KeepaliveTask>,
    started: Instant,
    closing: bool,
    close_deadline: Option<Instant>,
    finished: bool,
    peer_disconnected: bool,
}

impl Session {
    fn new(handle: SessionHandle, shared: Arc<SessionShared>, writer: IoWriter) -> Self {
        let config = shared.config.clone();
        let role = config.role();
        let local_version = Version::new(&config.ssh().software_version, None);
        let connection = ConnectionService::new(config.ssh());
        Self {
            kex: KexMachine::new(role, local_version.to_string()),
            local_version,
            ctx: SessionContext {
                role,
                config,
                handle,
            },
            shared,
            transport: Transport::new(writer),
            decoder: PacketDecoder::new(),
            ident: IdentificationReader::new(),
            ident_done: false,
            service: Service::None,
            client_auth: ClientAuthService::default(),
            server_auth: ServerAuthService::default(),
            connection,
            keepalive: None,
            started: Instant::now(),
            closing: false,
            close_deadline: None,
            finished: false,
            peer_disconnected: false,
        }
    }

    async fn run<R>(mut self, mut reader: R, mut rx: mpsc::UnboundedReceiver<Msg>)
    where
        R: AsyncRead + Unpin,
    {
        let result = match self.start() {
            Ok(()) => self.event_loop(&mut reader, &mut rx).await,
            Err(e) => Err(e),
        };
        self.teardown(result).await;
    }

    fn start(&mut self) -> FjordResult<()> {
        let mut lines: Vec<Bytes> = self
            .ctx
            .config
            .server()
            .map(|server| {
                server
                    .banner_lines
                    .iter()
                    .map(|line| Bytes::from(format!("{}\r\n", line)))
                    .collect()
            })
            .unwrap_or_default();
        lines.push(Bytes::from(self.local_version.to_wire_format()));
        for line in lines {
            self.write_raw(line)?;
        }
        debug!("Sent identification {}", self.local_version);
        self.kex.start(&mut self.transport, &self.ctx.config, false)?;
        self.publish_kex();
        Ok(())
    }

    /// Queues bytes outside the packet framing. Fails if the writer is
    /// already gone.
    fn write_raw(&mut self, data: Bytes) -> FjordResult<()> {
        match self.transport.writer_mut().write(data).peek() {
            Some(Err(e)) => {
                warn!("Identification write failed: {}", e);
                Err(e)
            }
            _ => Ok(()),
        }
    }

    async fn event_loop<R>(
        &mut self,
        reader: &mut R,
        rx: &mut mpsc::UnboundedReceiver<Msg>,
    ) -> FjordResult<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = BytesMut::with_capacity(16 * 1024);
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                read = reader.read_buf(&mut buf) => match read {
                    Ok(0) => {
                        if self.closing {
                            return Ok(());
                        }
                        self.peer_disconnected = true;
                        return Err(FjordError::Closed("Connection closed by peer".to_string()));
                    }
                    Ok(n) => {
                        trace!("Read {} bytes", n);
                        self.process_input(&mut buf)?;
                    }
                    Err(e) => {
                        self.peer_disconnected = true;
                        return Err(e.into());
                    }
                },
                msg = rx.recv() => match msg {
                    Some(msg) => self.handle_msg(msg)?,
                    None => return Ok(()),
                },
                _ = tick.tick() => self.on_tick(Instant::now())?,
            }
            if self.closing && self.connection.channel_count() == 0 {
                self.finished = true;
            }
            if self.finished {
                return Ok(());
            }
        }
    }

    fn process_input(&mut self, buf: &mut BytesMut) -> FjordResult<()> {
        if !self.ident_done {
            if !self.ident.read_identification(buf)? {
                return Ok(());
            }
            self.ident_done = true;
            let line = self.ident.identification_line().unwrap_or_default().to_string();
            debug!("Peer identification {}", line);
            self.kex.set_peer_version(&line);
            let banner = self.ident.take_banner();
            {
                let mut info = self.shared.info();
                info.peer_version = Some(line);
                info.banner = banner;
            }
        }
        while !self.finished {
            let Some(payload) = self.decoder.decode(buf)? else {
                break;
            };
            self.dispatch(payload)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, payload: Bytes) -> FjordResult<()> {
        let Some(&opcode) = payload.first() else {
            return Err(FjordError::Protocol("Empty packet payload".to_string()));
        };
        trace!("Received {}", MessageType::describe(opcode));
        match opcode {
            1 => self.handle_disconnect(payload),
            2 => Ok(()),
            3 => {
                let mut r = SshReader::new(payload);
                r.get_u8()?;
                debug!("Peer could not handle our packet {}", r.get_u32()?);
                Ok(())
            }
            4 => {
                let mut r = SshReader::new(payload);
                r.get_u8()?;
                let _always_display = r.get_bool()?;
                debug!("Peer debug message: {}", r.get_utf8()?);
                Ok(())
            }
            5 => self.handle_service_request(payload),
            6 => self.handle_service_accept(payload),
            20 | 21 | 30..=49 => self.handle_kex(payload),
            50..=79 => self.handle_auth(payload),
            80..=127 => {
                if self.service != Service::Connection {
                    return Err(FjordError::Protocol(format!(
                        "{} before authentication",
                        MessageType::describe(opcode)
                    )));
                }
                let message = ConnectionMessage::decode(payload)?;
                self.connection
                    .process(&mut self.transport, &self.ctx, message)
            }
            _ => {
                debug!("Unimplemented {}", MessageType::describe(opcode));
                let mut reply = buffer::payload(MessageType::Unimplemented as u8);
                reply.put_u32(self.decoder.last_sequence());
                self.transport.send(reply.freeze())
            }
        }
    }

    fn handle_disconnect(&mut self, payload: Bytes) -> FjordResult<()> {
        let mut r = SshReader::new(payload);
        r.get_u8()?;
        let reason = r.get_u32()?;
        let message = r.get_utf8().unwrap_or_default();
        info!("Peer disconnected (reason {}): {}", reason, message);
        self.peer_disconnected = true;
        if reason == DisconnectReason::ByApplication as u32 {
            self.finished = true;
            return Ok(());
        }
        Err(FjordError::Disconnect { reason, message })
    }

    fn handle_service_request(&mut self, payload: Bytes) -> FjordResult<()> {
        let mut r = SshReader::new(payload);
        r.get_u8()?;
        let name = r.get_utf8()?;
        if self.ctx.role != Role::Server || self.kex.completed() == 0 {
            return Err(FjordError::Protocol(
                "Unexpected SSH_MSG_SERVICE_REQUEST".to_string(),
            ));
        }
        if name != SERVICE_USERAUTH || self.service != Service::None {
            return Err(FjordError::Disconnect {
                reason: DisconnectReason::ServiceNotAvailable as u32,
                message: format!("Service {} not available", name),
            });
        }
        debug!("Accepting service {}", name);
        let mut reply = buffer::payload(MessageType::ServiceAccept as u8);
        reply.put_utf8(&name);
        self.transport.send(reply.freeze())?;
        self.service = Service::UserAuth;
        Ok(())
    }

    fn handle_service_accept(&mut self, payload: Bytes) -> FjordResult<()> {
        let mut r = SshReader::new(payload);
        r.get_u8()?;
        let name = r.get_utf8()?;
        if self.ctx.role != Role::Client || name != SERVICE_USERAUTH {
            return Err(FjordError::Protocol(format!(
                "Unexpected SSH_MSG_SERVICE_ACCEPT for {}",
                name
            )));
        }
        let Some(session_id) = self.kex.session_id() else {
            return Err(FjordError::Protocol(
                "Service accepted before key exchange".to_string(),
            ));
        };
        self.service = Service::UserAuth;
        self.client_auth
            .service_accepted(&mut self.transport, session_id)
    }

    fn handle_kex(&mut self, payload: Bytes) -> FjordResult<()> {
        let done = self.kex.process(
            &mut self.transport,
            &mut self.decoder,
            &self.ctx.config,
            self.shared.peer_addr,
            payload,
        )?;
        self.publish_kex();
        if done && self.kex.completed() == 1 {
            info!("Key exchange complete");
            self.shared.first_kex.set_value(Ok(()));
            if self.ctx.role == Role::Client {
                let mut request = buffer::payload(MessageType::ServiceRequest as u8);
                request.put_utf8(SERVICE_USERAUTH);
                self.transport.send(request.freeze())?;
            }
        }
        Ok(())
    }

    fn handle_auth(&mut self, payload: Bytes) -> FjordResult<()> {
        if self.service == Service::Connection {
            trace!("Ignoring authentication message after success");
            return Ok(());
        }
        let user = match self.ctx.role {
            Role::Server => {
                if self.service != Service::UserAuth {
                    return Err(FjordError::Protocol(
                        "Authentication request before service request".to_string(),
                    ));
                }
                let (Some(server), Some(session_id)) =
                    (self.ctx.config.server(), self.kex.session_id())
                else {
                    return Err(FjordError::IllegalState(
                        "Server session without key exchange".to_string(),
                    ));
                };
                self.server_auth
                    .process(&mut self.transport, server, session_id, payload)?
            }
            Role::Client => self.client_auth.process(payload)?,
        };
        if let Some(user) = user {
            self.authenticated(user);
        }
        Ok(())
    }

    fn authenticated(&mut self, user: String) {
        self.service = Service::Connection;
        {
            let mut info = self.shared.info();
            info.username = Some(user);
            info.authenticated = true;
        }
        if self.ctx.role == Role::Client {
            if let Some(interval) = self.ctx.config.ssh().heartbeat_interval {
                self.keepalive = Some(KeepaliveTask::spawn(interval, self.ctx.handle.downgrade()));
            }
        }
    }

    fn publish_kex(&self) {
        let mut info = self.shared.info();
        info.kex_state = self.kex.state();
        info.session_id = self.kex.session_id().map(<[u8]>::to_vec);
        info.negotiated = self.kex.negotiated().cloned();
        if !self.closing {
            info.state = self.kex.state().into();
        }
    }

    fn handle_msg(&mut self, msg: Msg) -> FjordResult<()> {
        let connected = if self.service == Service::Connection {
            Ok(())
        } else {
            Err(FjordError::IllegalState(
                "Session not authenticated".to_string(),
            ))
        };
        let t = &mut self.transport;
        let ssh = self.ctx.config.ssh();
        match msg {
            Msg::OpenChannel { setup, reply } => {
                let result = match connected {
                    Ok(()) => self.connection.register(t, ssh, setup),
                    Err(e) => {
                        setup.open_future.set_value(Err(e.clone()));
                        setup.close_future.set_value(Ok(()));
                        Err(e)
                    }
                };
                // the opener gave up waiting
                let _ = reply.send(result);
                Ok(())
            }
            Msg::ChannelData { id, ext, data } => self.connection.channel_data(t, id, ext, data),
            Msg::ChannelConsumed { id, len } => self.connection.channel_consumed(t, id, len),
            Msg::ChannelEof { id } => self.connection.channel_eof(t, id),
            Msg::ChannelClose { id, immediately } => {
                self.connection.channel_close(t, ssh, id, immediately)
            }
            Msg::ChannelRequest { id, request, reply } => {
                self.connection.channel_request(t, id, request, reply)
            }
            Msg::ChannelReply { id, success } => self.connection.channel_reply(t, id, success),
            Msg::ChannelOpenResult { id, result } => self.connection.open_result(t, id, result),
            Msg::CommandExited { id, status } => {
                self.connection.command_exited(t, ssh, id, status)
            }
            Msg::GlobalRequest { request, reply } => match connected {
                Ok(()) => self.connection.send_global_request(t, request, reply),
                Err(e) => {
                    if let Some(reply) = reply {
                        reply.set_value(Err(e));
                    }
                    Ok(())
                }
            },
            Msg::GlobalReply {
                token,
                success,
                data,
            } => self.connection.global_reply(t, token, success, data),
            Msg::Rekey { future } => {
                if self.closing {
                    future.set_value(Err(FjordError::Closed("Session closing".to_string())));
                    return Ok(());
                }
                self.kex.rekey(t, &self.ctx.config, future)?;
                self.publish_kex();
                Ok(())
            }
            Msg::SwitchToNoneCipher { future } => {
                let open = self.connection.channel_count();
                self.kex
                    .switch_to_none_cipher(t, &self.ctx.config, open, future)?;
                self.publish_kex();
                Ok(())
            }
            Msg::Authenticate { request, future } => {
                if self.ctx.role != Role::Client {
                    future.set_value(Err(FjordError::IllegalState(
                        "Only clients authenticate".to_string(),
                    )));
                    return Ok(());
                }
                if self.service == Service::Connection {
                    future.set_value(Err(FjordError::IllegalState(
                        "Already authenticated".to_string(),
                    )));
                    return Ok(());
                }
                let session_id = if self.service == Service::UserAuth {
                    self.kex.session_id()
                } else {
                    None
                };
                self.client_auth.authenticate(t, session_id, request, future)
            }
            Msg::Close { immediately } => self.begin_close(immediately),
        }
    }

    fn begin_close(&mut self, immediately: bool) -> FjordResult<()> {
        if self.closing {
            if immediately {
                self.finished = true;
            }
            return Ok(());
        }
        debug!("Closing session (immediately: {})", immediately);
        self.closing = true;
        self.shared.set_state(SessionState::Closing);
        if immediately || self.connection.channel_count() == 0 {
            self.finished = true;
            return Ok(());
        }
        let ssh = self.ctx.config.ssh();
        self.connection.begin_close(&mut self.transport, ssh)?;
        self.close_deadline = Some(Instant::now() + ssh.close_timeout);
        Ok(())
    }

    fn on_tick(&mut self, now: Instant) -> FjordResult<()> {
        self.connection.expire(now);
        let ssh = self.ctx.config.ssh();
        if let Some(deadline) = self.close_deadline {
            if now >= deadline {
                debug!("Channels did not close in time, disconnecting");
                self.finished = true;
                return Ok(());
            }
        }
        if self.kex.completed() == 0 {
            if let Some(limit) = ssh.connect_timeout {
                if now.duration_since(self.started) >= limit {
                    return Err(FjordError::Timeout(format!(
                        "Key exchange not complete after {:?}",
                        limit
                    )));
                }
            }
        }
        if self.ctx.role == Role::Server && self.service != Service::Connection {
            if let Some(limit) = ssh.auth_timeout {
                if now.duration_since(self.started) >= limit {
                    return Err(FjordError::Timeout(format!(
                        "Authentication not complete after {:?}",
                        limit
                    )));
                }
            }
        }
        if !self.closing && self.kex.needs_rekey(ssh, &self.transport, &self.decoder, now) {
            info!("Rekey limit reached");
            self.kex.rekey(
                &mut self.transport,
                &self.ctx.config,
                crate::ssh::future::KexFuture::new("rekey"),
            )?;
            self.publish_kex();
        }
        Ok(())
    }

    async fn teardown(mut self, result: FjordResult<()>) {
        let error = match &result {
            Ok(()) => {
                info!("Session closed");
                FjordError::Closed("Session closed".to_string())
            }
            Err(e) => {
                warn!("Session terminated: {}", e);
                e.clone()
            }
        };
        self.closing = true;
        self.shared.set_state(SessionState::Closing);
        if !self.peer_disconnected {
            let (reason, description) = match &result {
                Ok(()) => (DisconnectReason::ByApplication, "Session closed".to_string()),
                Err(e) => (DisconnectReason::for_error(e), e.to_string()),
            };
            let mut message = buffer::payload(MessageType::Disconnect as u8);
            message.put_u32(reason as u32);
            message.put_utf8(&description);
            message.put_utf8("");
            if let Err(e) = self.transport.send(message.freeze()) {
                debug!("Could not send disconnect: {}", e);
            }
        }
        self.keepalive = None;
        self.connection.abort(&error);
        self.kex.abort(&error);
        self.client_auth.abort(&error);
        if !self.shared.first_kex.is_done() {
            self.shared.first_kex.set_value(Err(error.clone()));
        }
        self.shared.close_supports();
        self.transport.writer_mut().join().await;
        self.shared.set_state(SessionState::Closed);
        self.shared.close_future.set_value(Ok(()));
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ssh::algorithms::hostkey::{Ed25519HostKey, HostKey};
    use crate::ssh::auth::{ClientAuth, StaticPasswordAuthenticator};
    use crate::ssh::channel::request::ChannelRequestContext;
    use crate::ssh::config::{AcceptAllServerKeys, ClientConfig, ServerConfig, SshConfig};
    use crate::ssh::connection::messages::ChannelType;
    use zeroize::Zeroizing;

    const WAIT: Option<Duration> = Some(Duration::from_secs(5));

    /// A handle whose loop is the returned receiver.
    pub(crate) fn detached_handle() -> (SessionHandle, mpsc::UnboundedReceiver<Msg>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = RoleConfig::Client(Arc::new(ClientConfig::new(Arc::new(AcceptAllServerKeys))));
        let shared = Arc::new(SessionShared::new(config, None, None));
        (SessionHandle::new(tx, shared), rx)
    }

    pub(crate) fn dummy_request_context() -> ChannelRequestContext {
        ChannelRequestContext {
            channel_id: 0,
            channel_type: "session".to_string(),
            session: detached_handle().0,
        }
    }

    pub(crate) fn sink_transport() -> Transport {
        Transport::new(IoWriter::spawn(tokio::io::sink()))
    }

    pub(crate) fn client_context() -> (SessionContext, mpsc::UnboundedReceiver<Msg>) {
        let (handle, rx) = detached_handle();
        let ctx = SessionContext {
            role: Role::Client,
            config: handle.shared().config.clone(),
            handle,
        };
        (ctx, rx)
    }

    pub(crate) fn server_context(config: ServerConfig) -> (SessionContext, mpsc::UnboundedReceiver<Msg>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = RoleConfig::Server(Arc::new(config));
        let shared = Arc::new(SessionShared::new(config.clone(), None, None));
        let ctx = SessionContext {
            role: Role::Server,
            config,
            handle: SessionHandle::new(tx, shared),
        };
        (ctx, rx)
    }

    fn pair(client: ClientConfig, server: ServerConfig) -> (SessionHandle, SessionHandle) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = spawn(a, RoleConfig::Client(Arc::new(client)), None, None);
        let server = spawn(b, RoleConfig::Server(Arc::new(server)), None, None);
        (client, server)
    }

    fn server_config() -> ServerConfig {
        ServerConfig::new(Arc::new(Ed25519HostKey::generate())).with_password_authenticator(
            Arc::new(StaticPasswordAuthenticator::new().with_user("alice", "secret")),
        )
    }

    fn client_config() -> ClientConfig {
        ClientConfig::new(Arc::new(AcceptAllServerKeys))
    }

    fn password(user: &str, password: &str) -> ClientAuth {
        ClientAuth::Password {
            user: user.to_string(),
            password: Zeroizing::new(password.to_string()),
        }
    }

    #[tokio::test]
    async fn test_start_fails_without_writer() {
        let (handle, _rx) = detached_handle();
        let shared = Arc::clone(handle.shared());
        let mut writer = IoWriter::spawn(tokio::io::sink());
        writer.shutdown();
        let mut session = Session::new(handle, shared, writer);
        assert!(matches!(session.start(), Err(FjordError::Closed(_))));
        assert_eq!(session.kex.state(), KexState::Unknown);
    }

    #[test]
    fn test_kex_state_maps_to_session_state() {
        assert_eq!(SessionState::from(KexState::Init), SessionState::KexInit);
        assert_eq!(SessionState::from(KexState::Keys), SessionState::KexKeys);
        assert_eq!(SessionState::from(KexState::Done), SessionState::Established);
    }

    #[tokio::test]
    async fn test_key_exchange_agrees_on_session_id() {
        let (client, server) = pair(client_config(), server_config());
        client.kex_future().verify(WAIT).await.unwrap();
        server.kex_future().verify(WAIT).await.unwrap();

        assert_eq!(client.state(), SessionState::Established);
        assert_eq!(client.kex_state(), KexState::Done);
        assert!(client.session_id().is_some());
        assert_eq!(client.session_id(), server.session_id());
        assert!(client.peer_version().unwrap().starts_with("SSH-2.0-"));
        client.close(true).verify(WAIT).await.unwrap();
        server.close_future().verify(WAIT).await.unwrap();
    }

    #[tokio::test]
    async fn test_password_authentication() {
        let (client, server) = pair(client_config(), server_config());
        client
            .authenticate(password("alice", "secret"))
            .verify(WAIT)
            .await
            .unwrap();
        assert!(client.is_authenticated());
        assert_eq!(client.username().as_deref(), Some("alice"));

        // the server records the user once its success is out
        tokio::time::timeout(Duration::from_secs(5), async {
            while !server.is_authenticated() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(server.username().as_deref(), Some("alice"));
        client.close(false).verify(WAIT).await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_password_fails_future_only() {
        let (client, _server) = pair(client_config(), server_config());
        let err = client
            .authenticate(password("alice", "wrong"))
            .verify(WAIT)
            .await
            .unwrap_err();
        assert!(matches!(err, FjordError::Security(_)));
        assert!(client.is_open());
        assert!(!client.is_authenticated());
    }

    #[tokio::test]
    async fn test_open_channel_requires_authentication() {
        let (client, _server) = pair(client_config(), server_config());
        client.kex_future().verify(WAIT).await.unwrap();
        let err = client.open_channel(ChannelType::Session).await.unwrap_err();
        assert!(matches!(err, FjordError::IllegalState(_)));
    }

    #[tokio::test]
    async fn test_rekey_keeps_session_id() {
        let (client, server) = pair(client_config(), server_config());
        client
            .authenticate(password("alice", "secret"))
            .verify(WAIT)
            .await
            .unwrap();
        let first = client.session_id();
        client.rekey().verify(WAIT).await.unwrap();
        assert_eq!(client.session_id(), first);
        assert_eq!(client.kex_state(), KexState::Done);
        assert_eq!(server.session_id(), first);
    }

    #[tokio::test]
    async fn test_host_key_rejected_fails_session() {
        let client = ClientConfig::new(Arc::new(crate::ssh::config::RejectAllServerKeys));
        let (client, server) = pair(client, server_config());
        let err = client.kex_future().verify(WAIT).await.unwrap_err();
        assert!(matches!(err, FjordError::Security(_)));
        client.close_future().verify(WAIT).await.unwrap();
        server.close_future().verify(WAIT).await.unwrap();
        assert_eq!(client.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_server_auth_timeout() {
        let ssh = SshConfig::default().with_auth_timeout(Duration::from_millis(300));
        let (client, server) = pair(client_config(), server_config().with_ssh(ssh));
        server.close_future().verify(WAIT).await.unwrap();
        client.close_future().verify(WAIT).await.unwrap();
        assert!(!client.is_open());
    }

    #[tokio::test]
    async fn test_banner_lines_reach_client() {
        let (client, _server) = pair(
            client_config(),
            server_config().with_banner_line("welcome to fjord"),
        );
        client.kex_future().verify(WAIT).await.unwrap();
        assert_eq!(client.banner(), vec!["welcome to fjord".to_string()]);
    }

    #[tokio::test]
    async fn test_client_publickey_signature_over_session_id() {
        let key = Arc::new(Ed25519HostKey::generate());
        let blob = key.public_key_blob();
        let server = server_config().with_publickey_authenticator(Arc::new(
            crate::ssh::auth::StaticPublicKeyAuthenticator::new().with_key("bob", blob),
        ));
        let (client, _server) = pair(client_config(), server);
        client
            .authenticate(ClientAuth::PublicKey {
                user: "bob".to_string(),
                key,
            })
            .verify(WAIT)
            .await
            .unwrap();
        assert_eq!(client.username().as_deref(), Some("bob"));
    }
}
