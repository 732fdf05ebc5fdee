//! The `ssh-connection` service (RFC 4254).
//!
//! [`ConnectionService`] owns the channel table of one session. Channels
//! are stored by local id; everything addressed to a channel is routed by
//! the recipient id the peer put in the message.

pub mod global;
pub mod messages;

use crate::ssh::channel::engine::ChannelEntry;
use crate::ssh::channel::request::RequestResult;
use crate::ssh::channel::{server, ChannelEvent, ChannelSetup};
use crate::ssh::config::SshConfig;
use crate::ssh::forward::tunnel::{self, TunnelTarget};
use crate::ssh::forward::types::ForwardAddr;
use crate::ssh::future::SshFuture;
use crate::ssh::message::{ChannelOpenFailureReason, MessageType};
use crate::ssh::session::transport::Transport;
use crate::ssh::session::{Role, SessionContext};
use bytes::Bytes;
use fjord_platform::{FjordError, FjordResult};
use global::ReplyQueue;
use messages::{ChannelRequestType, ChannelType, ConnectionMessage, GlobalRequestType};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Closed channels remembered for a late CLOSE from the peer.
const MAX_CLOSED_IDS: usize = 1024;

/// Channel table and global request bookkeeping of one session.
pub(crate) struct ConnectionService {
    channels: BTreeMap<u32, ChannelEntry>,
    next_id: u32,
    /// Channels we finalized before the peer's CLOSE arrived.
    closed_ids: BTreeSet<u32>,
    max_channels: Option<usize>,
    closing: bool,
    no_more_sessions: bool,
    replies: ReplyQueue,
    outgoing_globals: VecDeque<SshFuture<Option<Bytes>>>,
}

impl ConnectionService {
    pub(crate) fn new(config: &SshConfig) -> Self {
        Self {
            channels: BTreeMap::new(),
            next_id: 0,
            closed_ids: BTreeSet::new(),
            max_channels: config.max_channels,
            closing: false,
            no_more_sessions: false,
            replies: ReplyQueue::default(),
            outgoing_globals: VecDeque::new(),
        }
    }

    pub(crate) fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing
    }

    fn at_capacity(&self) -> bool {
        self.max_channels
            .map_or(false, |max| self.channels.len() >= max)
    }

    fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    /// Registers a channel opened by us and sends its open request.
    pub(crate) fn register(
        &mut self,
        t: &mut Transport,
        config: &SshConfig,
        setup: ChannelSetup,
    ) -> FjordResult<u32> {
        if self.closing {
            let err = FjordError::Closed("session closing".to_string());
            setup.open_future.set_value(Err(err.clone()));
            setup.close_future.set_value(Ok(()));
            return Err(err);
        }
        if self.at_capacity() {
            let err = ChannelOpenFailureReason::ResourceShortage
                .into_error(format!("Too many channels (max {})", self.channels.len()));
            setup.open_future.set_value(Err(err.clone()));
            setup.close_future.set_value(Ok(()));
            return Err(err);
        }
        let id = self.allocate_id();
        let entry = ChannelEntry::outgoing(id, setup, config);
        t.send_message(&entry.open_message())?;
        debug!("Opening channel {} ({})", id, entry.channel_type.name());
        self.channels.insert(id, entry);
        Ok(id)
    }

    /// Removes a channel. Unknown ids are ignored.
    pub(crate) fn unregister(&mut self, id: u32) -> Option<ChannelEntry> {
        let entry = self.channels.remove(&id)?;
        if !entry.close_received() {
            self.closed_ids.insert(id);
            if self.closed_ids.len() > MAX_CLOSED_IDS {
                // ids increase, so the first one is the oldest
                self.closed_ids.pop_first();
            }
        }
        Some(entry)
    }

    fn finalize(&mut self, id: u32, error: Option<FjordError>) {
        if let Some(entry) = self.unregister(id) {
            entry.finalize(error);
        }
    }

    /// Routes one incoming connection protocol message.
    pub(crate) fn process(
        &mut self,
        t: &mut Transport,
        ctx: &SessionContext,
        message: ConnectionMessage,
    ) -> FjordResult<()> {
        match message {
            ConnectionMessage::GlobalRequest {
                request,
                want_reply,
            } => self.handle_global_request(t, ctx, request, want_reply),
            ConnectionMessage::RequestSuccess { data } => {
                self.handle_global_reply(Some(data));
                Ok(())
            }
            ConnectionMessage::RequestFailure => {
                self.handle_global_reply(None);
                Ok(())
            }
            ConnectionMessage::ChannelOpen {
                channel_type,
                sender,
                window,
                max_packet,
            } => self.handle_open(t, ctx, channel_type, sender, window, max_packet),
            other => self.process_channel_message(t, ctx, other),
        }
    }

    fn process_channel_message(
        &mut self,
        t: &mut Transport,
        ctx: &SessionContext,
        message: ConnectionMessage,
    ) -> FjordResult<()> {
        let opcode = message.message_type() as u8;
        let Some(id) = message.recipient() else {
            return Err(FjordError::Protocol(format!(
                "Unexpected {}",
                MessageType::describe(opcode)
            )));
        };
        if !self.channels.contains_key(&id) {
            if self.closed_ids.contains(&id) {
                return self.handle_for_closed(t, id, message);
            }
            return Err(FjordError::Protocol(format!(
                "Received {} for unknown channel {}",
                MessageType::describe(opcode),
                id
            )));
        }
        let config = ctx.config.ssh();
        let deadline = Instant::now() + config.close_timeout;
        match message {
            ConnectionMessage::ChannelOpenConfirmation {
                sender,
                window,
                max_packet,
                ..
            } => {
                if let Some(entry) = self.channels.get_mut(&id) {
                    entry.handle_open_confirmation(sender, window, max_packet)?;
                }
            }
            ConnectionMessage::ChannelOpenFailure {
                reason,
                description,
                ..
            } => {
                if let Some(mut entry) = self.channels.remove(&id) {
                    entry.handle_open_failure(reason, &description);
                    entry.finalize(None);
                }
            }
            ConnectionMessage::WindowAdjust { bytes_to_add, .. } => {
                let result = match self.channels.get_mut(&id) {
                    Some(entry) => entry.handle_window_adjust(bytes_to_add),
                    None => Ok(()),
                };
                if let Err(e) = result {
                    // only this channel is torn down, the session goes on
                    warn!("Closing channel {}: {}", id, e);
                    if let Some(entry) = self.channels.get_mut(&id) {
                        entry.send_close(t, deadline)?;
                    }
                    self.finalize(id, Some(e));
                }
            }
            ConnectionMessage::Data { data, .. } => {
                if let Some(entry) = self.channels.get_mut(&id) {
                    entry.handle_data(None, data)?;
                }
            }
            ConnectionMessage::ExtendedData {
                data_type, data, ..
            } => {
                if let Some(entry) = self.channels.get_mut(&id) {
                    entry.handle_data(Some(data_type), data)?;
                }
            }
            ConnectionMessage::Eof { .. } => {
                if let Some(entry) = self.channels.get_mut(&id) {
                    entry.handle_eof();
                }
            }
            ConnectionMessage::Close { .. } => self.handle_close(t, ctx, id)?,
            ConnectionMessage::Request {
                request,
                want_reply,
                ..
            } => self.handle_channel_request(t, ctx, id, request, want_reply)?,
            ConnectionMessage::Success { .. } => {
                if let Some(entry) = self.channels.get_mut(&id) {
                    entry.handle_reply(true)?;
                }
            }
            ConnectionMessage::Failure { .. } => {
                if let Some(entry) = self.channels.get_mut(&id) {
                    entry.handle_reply(false)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Messages for channels we already dropped from the table.
    fn handle_for_closed(&mut self, t: &mut Transport, id: u32, message: ConnectionMessage) -> FjordResult<()> {
        match message {
            ConnectionMessage::ChannelOpenConfirmation { sender, .. } => {
                // closed while the open was pending
                t.send_message(&ConnectionMessage::Close { recipient: sender })
            }
            ConnectionMessage::ChannelOpenFailure { .. } | ConnectionMessage::Close { .. } => {
                self.closed_ids.remove(&id);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn handle_close(&mut self, t: &mut Transport, ctx: &SessionContext, id: u32) -> FjordResult<()> {
        let config = ctx.config.ssh();
        let now = Instant::now();
        let Some(entry) = self.channels.get_mut(&id) else {
            return Ok(());
        };
        entry.handle_close();
        let done = match entry.server.as_mut() {
            Some(server) => server.peer_closed(now + config.command_exit_timeout),
            None => true,
        };
        entry.send_close(t, now + config.close_timeout)?;
        if done {
            self.finalize(id, None);
        } else {
            debug!("Channel {} waits for its command to exit", id);
        }
        Ok(())
    }

    fn handle_channel_request(
        &mut self,
        t: &mut Transport,
        ctx: &SessionContext,
        id: u32,
        request: ChannelRequestType,
        want_reply: bool,
    ) -> FjordResult<()> {
        let Some(entry) = self.channels.get_mut(&id) else {
            return Ok(());
        };
        if entry.server.is_some() {
            return server::handle_request(entry, t, ctx, request, want_reply);
        }
        let handled = match request {
            ChannelRequestType::ExitStatus { status } if ctx.role == Role::Client => {
                entry.deliver(ChannelEvent::ExitStatus(status));
                true
            }
            ChannelRequestType::ExitSignal {
                signal,
                core_dumped,
                message,
                ..
            } if ctx.role == Role::Client => {
                entry.deliver(ChannelEvent::ExitSignal {
                    signal,
                    core_dumped,
                    message,
                });
                true
            }
            other => {
                debug!("Channel {} ignores request '{}'", id, other.name());
                false
            }
        };
        if want_reply {
            entry.send_reply(t, handled)?;
        }
        Ok(())
    }

    fn handle_open(
        &mut self,
        t: &mut Transport,
        ctx: &SessionContext,
        channel_type: ChannelType,
        sender: u32,
        window: u32,
        max_packet: u32,
    ) -> FjordResult<()> {
        let refuse = |t: &mut Transport, reason: ChannelOpenFailureReason, description: String| {
            info!("Refusing channel open from peer channel {}: {}", sender, description);
            t.send_message(&ConnectionMessage::ChannelOpenFailure {
                recipient: sender,
                reason: reason as u32,
                description,
                language: String::new(),
            })
        };
        if self.closing {
            return refuse(
                t,
                ChannelOpenFailureReason::ConnectFailed,
                "Server is shutting down".to_string(),
            );
        }
        if self.at_capacity() {
            return refuse(
                t,
                ChannelOpenFailureReason::ResourceShortage,
                "Too many channels".to_string(),
            );
        }

        let target = match (ctx.role, &channel_type) {
            (Role::Server, ChannelType::Session) => {
                if self.no_more_sessions {
                    return refuse(
                        t,
                        ChannelOpenFailureReason::AdministrativelyProhibited,
                        "no-more-sessions in effect".to_string(),
                    );
                }
                None
            }
            (Role::Server, ChannelType::DirectTcpip { host, port, .. }) => {
                let allowed = match (ctx.config.server(), u16::try_from(*port)) {
                    (Some(server), Ok(port)) => {
                        let address = ForwardAddr::new(host.clone(), port);
                        server
                            .forwarding_filter
                            .can_connect(channel_type.name(), &address, &ctx.handle)
                            .then_some(address)
                    }
                    _ => None,
                };
                match allowed {
                    Some(address) => Some(TunnelTarget::Tcp(address)),
                    None => {
                        return refuse(
                            t,
                            ChannelOpenFailureReason::AdministrativelyProhibited,
                            format!("Connection to {}:{} not permitted", host, port),
                        )
                    }
                }
            }
            (
                Role::Client,
                ChannelType::ForwardedTcpip {
                    connected_address,
                    connected_port,
                    ..
                },
            ) => {
                let local = ctx
                    .handle
                    .shared()
                    .existing_forwarder()
                    .and_then(|f| f.remote_target(connected_address, *connected_port));
                match local {
                    Some(address) => Some(TunnelTarget::Tcp(address)),
                    None => {
                        return refuse(
                            t,
                            ChannelOpenFailureReason::ConnectFailed,
                            format!(
                                "No forwarding for {}:{}",
                                connected_address, connected_port
                            ),
                        )
                    }
                }
            }
            (Role::Client, ChannelType::X11 { .. }) => {
                match ctx.config.client().and_then(|c| c.x11_display.clone()) {
                    Some(display) => Some(TunnelTarget::Tcp(display)),
                    None => {
                        return refuse(
                            t,
                            ChannelOpenFailureReason::AdministrativelyProhibited,
                            "X11 forwarding not configured".to_string(),
                        )
                    }
                }
            }
            (Role::Client, ChannelType::AuthAgent) => {
                match ctx.config.client().and_then(|c| c.agent_socket.clone()) {
                    Some(path) => Some(TunnelTarget::Unix(path)),
                    None => {
                        return refuse(
                            t,
                            ChannelOpenFailureReason::AdministrativelyProhibited,
                            "Agent forwarding not configured".to_string(),
                        )
                    }
                }
            }
            _ => {
                return refuse(
                    t,
                    ChannelOpenFailureReason::UnknownChannelType,
                    format!("Unsupported channel type: {}", channel_type.name()),
                )
            }
        };

        let id = self.allocate_id();
        let mut entry = ChannelEntry::incoming(
            id,
            channel_type,
            sender,
            window,
            max_packet,
            ctx.config.ssh(),
        );
        match target {
            None => {
                server::attach(&mut entry, ctx.handle.username());
                entry.confirm(t)?;
            }
            Some(target) => {
                let (events_tx, events_rx) = mpsc::unbounded_channel();
                entry.receiver.install(events_tx);
                tunnel::spawn_inbound(
                    ctx.handle.clone(),
                    id,
                    target,
                    events_rx,
                    entry.remote_window.clone(),
                );
            }
        }
        debug!(
            "Channel {} ({}) registered for peer channel {}",
            id,
            entry.channel_type.name(),
            sender
        );
        self.channels.insert(id, entry);
        Ok(())
    }

    /// Outcome of connecting a peer opened channel to its local target.
    pub(crate) fn open_result(&mut self, t: &mut Transport, id: u32, result: FjordResult<()>) -> FjordResult<()> {
        let Some(entry) = self.channels.get_mut(&id) else {
            return Ok(());
        };
        match result {
            Ok(()) if !self.closing => entry.confirm(t),
            Ok(()) => {
                entry.reject(t, ChannelOpenFailureReason::ConnectFailed, "Server is shutting down")?;
                if let Some(entry) = self.channels.remove(&id) {
                    entry.finalize(None);
                }
                Ok(())
            }
            Err(e) => {
                entry.reject(t, ChannelOpenFailureReason::ConnectFailed, &e.to_string())?;
                // the peer sends no CLOSE for a refused open
                if let Some(entry) = self.channels.remove(&id) {
                    entry.finalize(Some(e));
                }
                Ok(())
            }
        }
    }

    fn handle_global_request(
        &mut self,
        t: &mut Transport,
        ctx: &SessionContext,
        request: GlobalRequestType,
        want_reply: bool,
    ) -> FjordResult<()> {
        let dispatched = global::dispatch(
            &mut self.replies,
            &mut self.no_more_sessions,
            ctx,
            &request,
            want_reply,
        );
        let success = match dispatched.result {
            RequestResult::ReplySuccess => true,
            RequestResult::Replied => return Ok(()),
            _ => false,
        };
        self.global_reply(t, dispatched.token, success, Bytes::new())
    }

    /// Sends a reply for an incoming global request, keeping arrival order.
    pub(crate) fn global_reply(&mut self, t: &mut Transport, token: u64, success: bool, data: Bytes) -> FjordResult<()> {
        for (success, data) in self.replies.complete(token, success, data) {
            let message = if success {
                ConnectionMessage::RequestSuccess { data }
            } else {
                ConnectionMessage::RequestFailure
            };
            t.send_message(&message)?;
        }
        Ok(())
    }

    fn handle_global_reply(&mut self, data: Option<Bytes>) {
        match self.outgoing_globals.pop_front() {
            Some(future) => {
                future.set_value(Ok(data));
            }
            None => warn!("Ignoring unexpected global request reply"),
        }
    }

    /// Sends a global request of ours.
    pub(crate) fn send_global_request(
        &mut self,
        t: &mut Transport,
        request: GlobalRequestType,
        reply: Option<SshFuture<Option<Bytes>>>,
    ) -> FjordResult<()> {
        let want_reply = reply.is_some();
        t.send_message(&ConnectionMessage::GlobalRequest {
            request,
            want_reply,
        })?;
        if let Some(reply) = reply {
            self.outgoing_globals.push_back(reply);
        }
        Ok(())
    }

    pub(crate) fn channel_data(&mut self, t: &mut Transport, id: u32, ext: Option<u32>, data: Bytes) -> FjordResult<()> {
        match self.channels.get_mut(&id) {
            Some(entry) => entry.send_data(t, ext, data),
            None => Ok(()),
        }
    }

    pub(crate) fn channel_consumed(&mut self, t: &mut Transport, id: u32, len: u32) -> FjordResult<()> {
        match self.channels.get_mut(&id) {
            Some(entry) => entry.consumed(t, len),
            None => Ok(()),
        }
    }

    pub(crate) fn channel_eof(&mut self, t: &mut Transport, id: u32) -> FjordResult<()> {
        match self.channels.get_mut(&id) {
            Some(entry) => entry.send_eof(t),
            None => Ok(()),
        }
    }

    pub(crate) fn channel_request(
        &mut self,
        t: &mut Transport,
        id: u32,
        request: ChannelRequestType,
        reply: Option<SshFuture<bool>>,
    ) -> FjordResult<()> {
        match self.channels.get_mut(&id) {
            Some(entry) => entry.send_request(t, request, reply),
            None => {
                if let Some(reply) = reply {
                    reply.set_value(Err(FjordError::Closed(format!("Channel {} closed", id))));
                }
                Ok(())
            }
        }
    }

    pub(crate) fn channel_reply(&mut self, t: &mut Transport, id: u32, success: bool) -> FjordResult<()> {
        match self.channels.get_mut(&id) {
            Some(entry) => entry.send_reply(t, success),
            None => Ok(()),
        }
    }

    /// Closes a channel on request of its owner.
    pub(crate) fn channel_close(
        &mut self,
        t: &mut Transport,
        config: &SshConfig,
        id: u32,
        immediately: bool,
    ) -> FjordResult<()> {
        let Some(entry) = self.channels.get_mut(&id) else {
            return Ok(());
        };
        if entry.remote_id.is_none() {
            // the open is still pending, a late confirmation gets a CLOSE
            self.finalize(id, None);
            return Ok(());
        }
        if !immediately {
            entry.send_eof(t)?;
        }
        entry.send_close(t, Instant::now() + config.close_timeout)?;
        if immediately || entry.close_received() {
            self.finalize(id, None);
        }
        Ok(())
    }

    /// A server side program finished.
    pub(crate) fn command_exited(
        &mut self,
        t: &mut Transport,
        config: &SshConfig,
        id: u32,
        status: u32,
    ) -> FjordResult<()> {
        let Some(entry) = self.channels.get_mut(&id) else {
            return Ok(());
        };
        let first = entry.server.as_mut().map_or(false, |s| s.mark_exited());
        if !first {
            return Ok(());
        }
        debug!("Channel {} command exited with status {}", id, status);
        if !entry.close_sent() {
            entry.send_request(t, ChannelRequestType::ExitStatus { status }, None)?;
            entry.send_eof(t)?;
            entry.send_close(t, Instant::now() + config.close_timeout)?;
        }
        if entry.close_received() {
            self.finalize(id, None);
        }
        Ok(())
    }

    /// Forces closure of channels whose close or command exit wait expired.
    pub(crate) fn expire(&mut self, now: Instant) {
        let expired: Vec<u32> = self
            .channels
            .values()
            .filter(|e| match e.server.as_ref().filter(|s| s.awaits_exit()) {
                // a running command is bounded by the exit timeout, not the close timeout
                Some(server) => server.exit_expired(now),
                None => e.close_expired(now),
            })
            .map(|e| e.id)
            .collect();
        for id in expired {
            debug!("Channel {} close timed out, forcing closure", id);
            self.finalize(id, None);
        }
    }

    /// Starts a graceful shutdown: no new channels, CLOSE on every channel.
    pub(crate) fn begin_close(&mut self, t: &mut Transport, config: &SshConfig) -> FjordResult<()> {
        self.closing = true;
        let deadline = Instant::now() + config.close_timeout;
        let pending: Vec<u32> = self
            .channels
            .values()
            .filter(|e| e.remote_id.is_none())
            .map(|e| e.id)
            .collect();
        for id in pending {
            self.finalize(id, Some(FjordError::Closed("session closing".to_string())));
        }
        for entry in self.channels.values_mut() {
            entry.send_close(t, deadline)?;
        }
        Ok(())
    }

    /// Fails everything still open with `error`.
    pub(crate) fn abort(&mut self, error: &FjordError) {
        self.closing = true;
        for (_, entry) in std::mem::take(&mut self.channels) {
            entry.finalize(Some(error.clone()));
        }
        for future in self.outgoing_globals.drain(..) {
            future.set_value(Err(error.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::algorithms::hostkey::Ed25519HostKey;
    use crate::ssh::channel::command::{
        Command, CommandFactory, Environment, ExitCallback, PipeIo, Program, ProgramRequest,
    };
    use crate::ssh::channel::window::RemoteWindow;
    use crate::ssh::config::ServerConfig;
    use crate::ssh::future::{CloseFuture, OpenFuture};
    use crate::ssh::session::handle::Msg;
    use std::sync::Arc;
    use std::time::Duration;

    /// A program that never reports an exit.
    struct Stuck;

    impl Command for Stuck {
        fn start(&mut self, _env: &Environment, _io: PipeIo, _exit: ExitCallback) -> FjordResult<()> {
            Ok(())
        }
    }

    struct StuckFactory;

    impl CommandFactory for StuckFactory {
        fn create_command(&self, _request: &ProgramRequest) -> FjordResult<Program> {
            Ok(Program::Blocking(Box::new(Stuck)))
        }
    }

    /// A server service with one exec channel (local id 0) whose program hangs.
    fn stuck_exec(
        ssh: SshConfig,
    ) -> (ConnectionService, Transport, SessionContext, mpsc::UnboundedReceiver<Msg>) {
        let config = ServerConfig::new(Arc::new(Ed25519HostKey::generate()))
            .with_ssh(ssh)
            .with_command_factory(Arc::new(StuckFactory));
        let (ctx, rx) = crate::ssh::session::tests::server_context(config);
        let mut t = crate::ssh::session::tests::sink_transport();
        let mut service = ConnectionService::new(ctx.config.ssh());
        service
            .process(
                &mut t,
                &ctx,
                ConnectionMessage::ChannelOpen {
                    channel_type: ChannelType::Session,
                    sender: 7,
                    window: 1 << 20,
                    max_packet: 32 * 1024,
                },
            )
            .unwrap();
        service
            .process(
                &mut t,
                &ctx,
                ConnectionMessage::Request {
                    recipient: 0,
                    request: ChannelRequestType::Exec {
                        command: "sleep forever".to_string(),
                    },
                    want_reply: false,
                },
            )
            .unwrap();
        (service, t, ctx, rx)
    }

    fn setup() -> (ChannelSetup, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ChannelSetup {
                channel_type: ChannelType::Session,
                events: tx,
                remote: Arc::new(RemoteWindow::new()),
                open_future: OpenFuture::new("open"),
                close_future: CloseFuture::new("close"),
            },
            rx,
        )
    }

    #[tokio::test]
    async fn test_ids_are_unique_and_increasing() {
        let config = SshConfig::default();
        let mut t = crate::ssh::session::tests::sink_transport();
        let mut service = ConnectionService::new(&config);
        let mut ids = Vec::new();
        for _ in 0..5 {
            let (s, _rx) = setup();
            ids.push(service.register(&mut t, &config, s).unwrap());
        }
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
        assert!(service.unregister(2).is_some());
        assert!(service.unregister(2).is_none());
        let (s, _rx) = setup();
        assert_eq!(service.register(&mut t, &config, s).unwrap(), 5);
    }

    #[tokio::test]
    async fn test_register_while_closing_signals_channel() {
        let config = SshConfig::default();
        let mut t = crate::ssh::session::tests::sink_transport();
        let mut service = ConnectionService::new(&config);
        service.begin_close(&mut t, &config).unwrap();
        let (s, _rx) = setup();
        let open = s.open_future.clone();
        let close = s.close_future.clone();
        assert!(service.register(&mut t, &config, s).is_err());
        match open.peek() {
            Some(Err(FjordError::Closed(msg))) => assert_eq!(msg, "session closing"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(close.is_done());
    }

    #[tokio::test]
    async fn test_max_channels_enforced() {
        let config = SshConfig::default().with_max_channels(1);
        let mut t = crate::ssh::session::tests::sink_transport();
        let mut service = ConnectionService::new(&config);
        let (s, _rx) = setup();
        service.register(&mut t, &config, s).unwrap();
        let (s, _rx) = setup();
        assert!(matches!(
            service.register(&mut t, &config, s),
            Err(FjordError::ChannelOpen { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_recipient_is_protocol_error() {
        let config = SshConfig::default();
        let mut t = crate::ssh::session::tests::sink_transport();
        let (ctx, _rx) = crate::ssh::session::tests::client_context();
        let mut service = ConnectionService::new(&config);
        let err = service
            .process(
                &mut t,
                &ctx,
                ConnectionMessage::Data {
                    recipient: 42,
                    data: Bytes::from_static(b"x"),
                },
            )
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Protocol error: Received SSH_MSG_CHANNEL_DATA(94) for unknown channel 42"
        );
    }

    #[tokio::test]
    async fn test_window_overflow_closes_only_that_channel() {
        let config = SshConfig::default();
        let mut t = crate::ssh::session::tests::sink_transport();
        let (ctx, _rx) = crate::ssh::session::tests::client_context();
        let mut service = ConnectionService::new(&config);
        let (first, _rx1) = setup();
        let first_close = first.close_future.clone();
        let (second, _rx2) = setup();
        let a = service.register(&mut t, &config, first).unwrap();
        let b = service.register(&mut t, &config, second).unwrap();
        for (id, peer) in [(a, 10), (b, 11)] {
            service
                .process(
                    &mut t,
                    &ctx,
                    ConnectionMessage::ChannelOpenConfirmation {
                        recipient: id,
                        sender: peer,
                        window: u32::MAX - 10,
                        max_packet: 1024,
                    },
                )
                .unwrap();
        }
        service
            .process(
                &mut t,
                &ctx,
                ConnectionMessage::WindowAdjust {
                    recipient: a,
                    bytes_to_add: 100,
                },
            )
            .unwrap();
        assert!(first_close.is_done());
        assert_eq!(service.channel_count(), 1);
        // the peer's CLOSE for the dropped channel is still accepted
        service
            .process(&mut t, &ctx, ConnectionMessage::Close { recipient: a })
            .unwrap();
    }

    #[tokio::test]
    async fn test_incoming_session_refused_on_client() {
        let config = SshConfig::default();
        let mut t = crate::ssh::session::tests::sink_transport();
        let (ctx, _rx) = crate::ssh::session::tests::client_context();
        let mut service = ConnectionService::new(&config);
        service
            .process(
                &mut t,
                &ctx,
                ConnectionMessage::ChannelOpen {
                    channel_type: ChannelType::Session,
                    sender: 7,
                    window: 1000,
                    max_packet: 100,
                },
            )
            .unwrap();
        assert_eq!(service.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_command_exit_timeout_outlasts_close_timeout() {
        let ssh = SshConfig::default()
            .with_command_exit_timeout(Duration::from_secs(60))
            .with_close_timeout(Duration::from_secs(1));
        let (mut service, mut t, ctx, _rx) = stuck_exec(ssh);
        let close = service.channels[&0].close_future.clone();

        let now = Instant::now();
        service
            .process(&mut t, &ctx, ConnectionMessage::Close { recipient: 0 })
            .unwrap();
        assert_eq!(service.channel_count(), 1);

        service.expire(now + Duration::from_secs(2));
        assert_eq!(service.channel_count(), 1);
        assert!(!close.is_done());

        service.expire(now + Duration::from_secs(61));
        assert_eq!(service.channel_count(), 0);
        assert!(matches!(close.peek(), Some(Ok(()))));
    }

    #[tokio::test]
    async fn test_command_exit_after_peer_close_finalizes() {
        let (mut service, mut t, ctx, _rx) = stuck_exec(SshConfig::default());
        let close = service.channels[&0].close_future.clone();
        service
            .process(&mut t, &ctx, ConnectionMessage::Close { recipient: 0 })
            .unwrap();
        assert!(!close.is_done());

        service.command_exited(&mut t, ctx.config.ssh(), 0, 0).unwrap();
        assert_eq!(service.channel_count(), 0);
        assert!(close.is_done());
    }

    #[tokio::test]
    async fn test_server_request_without_server_config() {
        let config = SshConfig::default();
        let mut t = crate::ssh::session::tests::sink_transport();
        let (ctx, _rx) = crate::ssh::session::tests::client_context();
        let mut service = ConnectionService::new(&config);
        let (s, _events) = setup();
        let id = service.register(&mut t, &config, s).unwrap();
        service
            .process(
                &mut t,
                &ctx,
                ConnectionMessage::ChannelOpenConfirmation {
                    recipient: id,
                    sender: 3,
                    window: 1000,
                    max_packet: 100,
                },
            )
            .unwrap();
        if let Some(entry) = service.channels.get_mut(&id) {
            server::attach(entry, None);
        }

        let before = t.encoder().sequence();
        let request = |want_reply| ConnectionMessage::Request {
            recipient: id,
            request: ChannelRequestType::Shell,
            want_reply,
        };
        service.process(&mut t, &ctx, request(false)).unwrap();
        assert_eq!(t.encoder().sequence(), before);
        service.process(&mut t, &ctx, request(true)).unwrap();
        assert_eq!(t.encoder().sequence(), before + 1);
    }

    #[tokio::test]
    async fn test_closed_ids_are_bounded() {
        let config = SshConfig::default();
        let mut t = crate::ssh::session::tests::sink_transport();
        let mut service = ConnectionService::new(&config);
        let total = MAX_CLOSED_IDS as u32 + 10;
        for _ in 0..total {
            let (s, _rx) = setup();
            let id = service.register(&mut t, &config, s).unwrap();
            service.channel_close(&mut t, &config, id, true).unwrap();
        }
        assert_eq!(service.channel_count(), 0);
        assert_eq!(service.closed_ids.len(), MAX_CLOSED_IDS);
        assert!(!service.closed_ids.contains(&0));
        assert!(service.closed_ids.contains(&(total - 1)));
    }
}
