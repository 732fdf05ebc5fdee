//! Server side `session` channels.
//!
//! Requests are offered first to the configured handlers, then to the PuTTY
//! handler, then to the built-ins below. A `shell`, `exec` or `subsystem`
//! request starts a program from the configured [`CommandFactory`]; the
//! program reports its exit status once, after which the channel sends
//! `exit-status`, EOF and CLOSE.
//!
//! [`CommandFactory`]: super::command::CommandFactory

use super::command::{
    Environment, ExitCallback, PipeIo, Program, ProgramRequest, PtyInfo, RunningCommand,
    StreamIo, parse_pty_modes,
};
use super::engine::{ChannelEntry, DataReceiver};
use super::request::{
    run_chain, ChannelRequestContext, ChannelRequestHandler, PuttyRequestHandler, RequestResult,
};
use super::stream::{ChannelReader, ChannelWriter};
use crate::ssh::config::ServerConfig;
use crate::ssh::connection::messages::{ChannelRequestType, EXTENDED_DATA_STDERR};
use crate::ssh::session::transport::Transport;
use crate::ssh::session::SessionContext;
use fjord_platform::{FjordError, FjordResult};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Server state of one session channel.
pub(crate) struct ServerSession {
    env: Environment,
    command: Option<RunningCommand>,
    exited: bool,
    exit_deadline: Option<Instant>,
}

impl ServerSession {
    pub(crate) fn new(user: Option<String>) -> Self {
        Self {
            env: Environment::new(user),
            command: None,
            exited: false,
            exit_deadline: None,
        }
    }

    fn is_running(&self) -> bool {
        self.command.is_some() && !self.exited
    }

    /// The peer closed the channel. Returns true if the channel can be
    /// finalized now, false if a blocking command gets until `deadline`.
    pub(crate) fn peer_closed(&mut self, deadline: Instant) -> bool {
        if !self.is_running() {
            return true;
        }
        let gone = self.command.as_mut().map_or(true, RunningCommand::destroy);
        if gone {
            self.exited = true;
            true
        } else {
            self.exit_deadline = Some(deadline);
            false
        }
    }

    /// Records the program's exit. Returns false if it was already recorded.
    pub(crate) fn mark_exited(&mut self) -> bool {
        !std::mem::replace(&mut self.exited, true)
    }

    /// True while a closed channel still waits for its program to exit.
    pub(crate) fn awaits_exit(&self) -> bool {
        self.exit_deadline.is_some() && !self.exited
    }

    pub(crate) fn exit_expired(&self, now: Instant) -> bool {
        self.exit_deadline.map_or(false, |d| now >= d)
    }

    /// Stops whatever still runs; called when the channel is finalized.
    pub(crate) fn abort(&mut self) {
        if self.is_running() {
            if let Some(command) = self.command.as_mut() {
                command.destroy();
            }
            self.exited = true;
        }
    }
}

/// Handles a request on a server session channel and sends the reply.
pub(crate) fn handle_request(
    entry: &mut ChannelEntry,
    t: &mut Transport,
    ctx: &SessionContext,
    request: ChannelRequestType,
    want_reply: bool,
) -> FjordResult<()> {
    let Some(config) = ctx.config.server().cloned() else {
        if want_reply {
            entry.send_reply(t, false)?;
        }
        return Ok(());
    };
    let rctx = ChannelRequestContext {
        channel_id: entry.id,
        channel_type: entry.channel_type.name().to_string(),
        session: ctx.handle.clone(),
    };
    let putty = PuttyRequestHandler;
    let mut chain: Vec<&dyn ChannelRequestHandler> = config
        .channel_request_handlers
        .iter()
        .map(|h| h.as_ref())
        .collect();
    chain.push(&putty);

    let result = match run_chain(&chain, &rctx, &request, want_reply) {
        Ok(RequestResult::Unsupported) => builtin(entry, ctx, &config, &request),
        other => other,
    };
    let result = result.unwrap_or_else(|e| {
        warn!("Channel {} request '{}' failed: {}", entry.id, request.name(), e);
        RequestResult::ReplyFailure
    });
    debug!(
        "Channel {} request '{}' (want_reply={}): {:?}",
        entry.id,
        request.name(),
        want_reply,
        result
    );
    match result {
        RequestResult::ReplySuccess if want_reply => entry.send_reply(t, true),
        RequestResult::ReplyFailure | RequestResult::Unsupported if want_reply => {
            entry.send_reply(t, false)
        }
        _ => Ok(()),
    }
}

fn builtin(
    entry: &mut ChannelEntry,
    ctx: &SessionContext,
    config: &Arc<ServerConfig>,
    request: &ChannelRequestType,
) -> FjordResult<RequestResult> {
    let id = entry.id;
    let Some(server) = entry.server.as_mut() else {
        return Ok(RequestResult::Unsupported);
    };
    let result = match request {
        ChannelRequestType::Env { name, value } => {
            server.env.set_var(name.clone(), value.clone());
            RequestResult::ReplySuccess
        }
        ChannelRequestType::PtyReq {
            term,
            columns,
            rows,
            width_px,
            height_px,
            modes,
        } => {
            server.env.set_pty(PtyInfo {
                term: term.clone(),
                columns: *columns,
                rows: *rows,
                width_px: *width_px,
                height_px: *height_px,
                modes: parse_pty_modes(modes),
            });
            RequestResult::ReplySuccess
        }
        ChannelRequestType::WindowChange {
            columns,
            rows,
            width_px,
            height_px,
        } => {
            if !server.env.resize(*columns, *rows, *width_px, *height_px) {
                return Ok(RequestResult::ReplyFailure);
            }
            if server.is_running() {
                if let Some(command) = server.command.as_mut() {
                    command.signal("WINCH");
                }
            }
            RequestResult::ReplySuccess
        }
        ChannelRequestType::Signal { name } => deliver_signal(server, name),
        ChannelRequestType::Break { .. } => deliver_signal(server, "INT"),
        ChannelRequestType::Shell => return start_program(entry, ctx, config, ProgramRequest::Shell),
        ChannelRequestType::Exec { command } => {
            return start_program(entry, ctx, config, ProgramRequest::Exec(command.clone()))
        }
        ChannelRequestType::Subsystem { name } => {
            return start_program(entry, ctx, config, ProgramRequest::Subsystem(name.clone()))
        }
        ChannelRequestType::AuthAgent => {
            if !config
                .forwarding_filter
                .can_forward_agent(&ctx.handle, request.name())
            {
                debug!("Agent forwarding refused for channel {}", id);
                return Ok(RequestResult::ReplyFailure);
            }
            let path = ctx.handle.agent_support().initialize()?;
            server.env.set_var("SSH_AUTH_SOCK", path);
            RequestResult::ReplySuccess
        }
        ChannelRequestType::X11Req {
            single_connection,
            auth_protocol,
            auth_cookie,
            screen,
        } => {
            if !config
                .forwarding_filter
                .can_forward_x11(&ctx.handle, request.name())
            {
                debug!("X11 forwarding refused for channel {}", id);
                return Ok(RequestResult::ReplyFailure);
            }
            let display = ctx.handle.x11_support().create_display(
                *single_connection,
                auth_protocol,
                auth_cookie,
                *screen,
            )?;
            server.env.set_var("DISPLAY", display);
            RequestResult::ReplySuccess
        }
        _ => RequestResult::Unsupported,
    };
    Ok(result)
}

fn deliver_signal(server: &mut ServerSession, name: &str) -> RequestResult {
    if !server.is_running() {
        return RequestResult::ReplyFailure;
    }
    if let Some(command) = server.command.as_mut() {
        debug!("Delivering signal {}", name);
        command.signal(name);
    }
    RequestResult::ReplySuccess
}

fn start_program(
    entry: &mut ChannelEntry,
    ctx: &SessionContext,
    config: &Arc<ServerConfig>,
    request: ProgramRequest,
) -> FjordResult<RequestResult> {
    let id = entry.id;
    let Some(server) = entry.server.as_mut() else {
        return Ok(RequestResult::Unsupported);
    };
    if server.command.is_some() {
        return Err(FjordError::IllegalState(format!(
            "Channel {} already runs a program",
            id
        )));
    }
    let Some(factory) = config.command_factory.as_ref() else {
        return Ok(RequestResult::ReplyFailure);
    };
    let program = factory.create_command(&request)?;
    info!("Channel {} starting {:?}", id, request);

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let stdin = ChannelReader::new(id, ctx.handle.clone(), events_rx);
    let stdout = ChannelWriter::new(
        id,
        ctx.handle.clone(),
        Arc::clone(&entry.remote_window),
        None,
    );
    let stderr = stdout.extended(EXTENDED_DATA_STDERR);
    let exit = ExitCallback::new(id, ctx.handle.clone());

    let running = match program {
        Program::Blocking(mut command) => {
            let io = PipeIo {
                stdin,
                stdout,
                stderr,
            };
            command.start(&server.env, io, exit)?;
            RunningCommand::Blocking(command)
        }
        Program::Async(mut command) => {
            let io = StreamIo {
                stdin,
                stdout,
                stderr,
            };
            let (signals, signals_rx) = mpsc::unbounded_channel();
            let env = server.env.clone();
            let task = tokio::spawn(async move {
                let status = command.run(env, io, signals_rx).await;
                exit.on_exit(status);
            });
            RunningCommand::Async { signals, task }
        }
    };
    server.command = Some(running);
    entry.receiver.install(events_tx);
    Ok(RequestResult::ReplySuccess)
}

/// Installs the server state on a freshly accepted session channel.
pub(crate) fn attach(entry: &mut ChannelEntry, user: Option<String>) {
    entry.server = Some(ServerSession::new(user));
    entry.receiver = DataReceiver::Pending(Vec::new());
}
