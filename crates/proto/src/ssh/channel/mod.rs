//! Channels (RFC 4254 Section 5).
//!
//! The session loop owns every channel's protocol state in a
//! [`engine::ChannelEntry`], stored by id in the connection service's table.
//! Applications hold a [`Channel`]: the id, a sender into the loop, the
//! shared send window and a queue of [`ChannelEvent`]s. A channel therefore
//! never references its session strongly from inside the loop, and the loop
//! never hands out references into its table.
//!
//! # Example
//!
//! ```rust,no_run
//! use fjord_proto::ssh::channel::ChannelEvent;
//! use fjord_proto::ssh::connection::messages::ChannelType;
//! # async fn demo(session: fjord_proto::ssh::session::SessionHandle) -> fjord_platform::FjordResult<()> {
//! let mut channel = session.open_channel_confirmed(ChannelType::Session).await?;
//! channel.exec("uname -a").await?;
//! while let Some(event) = channel.next_event().await {
//!     match event {
//!         ChannelEvent::Data(data) => print!("{}", String::from_utf8_lossy(&data)),
//!         ChannelEvent::ExitStatus(status) => println!("exit {}", status),
//!         ChannelEvent::Closed => break,
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod command;
pub(crate) mod engine;
pub mod request;
pub(crate) mod server;
pub mod stream;
pub mod window;

use crate::ssh::connection::messages::{ChannelRequestType, ChannelType, EXTENDED_DATA_STDERR};
use crate::ssh::future::{CloseFuture, OpenFuture, SshFuture};
use crate::ssh::session::handle::Msg;
use crate::ssh::session::SessionHandle;
use bytes::Bytes;
use fjord_platform::{FjordError, FjordResult};
use std::sync::Arc;
use stream::{ChannelReader, ChannelStream, ChannelWriter};
use tokio::sync::mpsc;
use window::RemoteWindow;

/// Lifecycle of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    /// Not yet registered
    #[default]
    Unopened,
    /// Open request sent or received, not yet confirmed
    OpenPending,
    /// Data may flow
    Open,
    /// CLOSE sent, waiting for the peer's CLOSE or a running command
    Closing,
    /// Gone from the channel table
    Closed,
}

/// Something that happened on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Regular data
    Data(Bytes),
    /// Extended data (code 1 is stderr)
    ExtendedData {
        /// Data type code
        code: u32,
        /// Data
        data: Bytes,
    },
    /// The peer will send no more data
    Eof,
    /// Remote command exit status
    ExitStatus(u32),
    /// Remote command killed by a signal
    ExitSignal {
        /// Signal name without `SIG`
        signal: String,
        /// Core dumped
        core_dumped: bool,
        /// Error message
        message: String,
    },
    /// The channel is closed; no further events follow
    Closed,
}

/// Everything the loop needs to register a locally opened channel.
pub(crate) struct ChannelSetup {
    pub(crate) channel_type: ChannelType,
    pub(crate) events: mpsc::UnboundedSender<ChannelEvent>,
    pub(crate) remote: Arc<RemoteWindow>,
    pub(crate) open_future: OpenFuture,
    pub(crate) close_future: CloseFuture,
}

/// Application handle to one channel.
pub struct Channel {
    id: u32,
    channel_type: ChannelType,
    session: SessionHandle,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    remote: Arc<RemoteWindow>,
    open_future: OpenFuture,
    close_future: CloseFuture,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("type", &self.channel_type.name())
            .field("open", &self.open_future.is_done())
            .field("closed", &self.close_future.is_done())
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(
        id: u32,
        channel_type: ChannelType,
        session: SessionHandle,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
        remote: Arc<RemoteWindow>,
        open_future: OpenFuture,
        close_future: CloseFuture,
    ) -> Self {
        Self {
            id,
            channel_type,
            session,
            events,
            remote,
            open_future,
            close_future,
        }
    }

    /// Local channel id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Channel type and its open data.
    pub fn channel_type(&self) -> &ChannelType {
        &self.channel_type
    }

    /// Session this channel belongs to.
    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    /// Completes when the peer confirmed or rejected the open.
    pub fn open_future(&self) -> &OpenFuture {
        &self.open_future
    }

    /// Completes when the channel is closed.
    pub fn close_future(&self) -> &CloseFuture {
        &self.close_future
    }

    /// Bytes we may currently send.
    pub fn remote_window_size(&self) -> u32 {
        self.remote.size()
    }

    /// Next event, or `None` once the channel is gone.
    ///
    /// Receiving data hands its window space back to the peer.
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        let event = self.events.recv().await?;
        let len = match &event {
            ChannelEvent::Data(data) => data.len(),
            ChannelEvent::ExtendedData { data, .. } => data.len(),
            _ => 0,
        };
        if len > 0 {
            // a finished session no longer tracks windows
            let _ = self.session.send(Msg::ChannelConsumed {
                id: self.id,
                len: len as u32,
            });
        }
        Some(event)
    }

    /// Clonable writer for regular data.
    pub fn writer(&self) -> ChannelWriter {
        ChannelWriter::new(self.id, self.session.clone(), Arc::clone(&self.remote), None)
    }

    /// Clonable writer for stderr data.
    pub fn stderr_writer(&self) -> ChannelWriter {
        self.writer().extended(EXTENDED_DATA_STDERR)
    }

    /// Sends data, waiting for window space as needed.
    pub async fn write(&self, data: &[u8]) -> FjordResult<()> {
        self.writer().write_all(data).await
    }

    /// Sends extended data of type `code`.
    pub async fn write_extended(&self, code: u32, data: &[u8]) -> FjordResult<()> {
        self.writer().extended(code).write_all(data).await
    }

    /// Sends EOF.
    pub fn eof(&self) -> FjordResult<()> {
        self.session.send(Msg::ChannelEof { id: self.id })
    }

    /// Closes the channel.
    ///
    /// A graceful close sends EOF and CLOSE and completes once the peer's
    /// CLOSE arrives; an immediate close completes right away.
    pub fn close(&self, immediately: bool) -> CloseFuture {
        if self.session.send(Msg::ChannelClose {
            id: self.id,
            immediately,
        })
        .is_err()
        {
            self.close_future.set_value(Ok(()));
        }
        self.close_future.clone()
    }

    /// Sends a channel request. With `want_reply` the future yields the
    /// peer's answer, otherwise it completes with `true` once queued.
    pub fn request(&self, request: ChannelRequestType, want_reply: bool) -> SshFuture<bool> {
        let future: SshFuture<bool> = SshFuture::new("channel request");
        let reply = want_reply.then(|| future.clone());
        match self.session.send(Msg::ChannelRequest {
            id: self.id,
            request,
            reply,
        }) {
            Ok(()) => {
                if !want_reply {
                    future.set_value(Ok(true));
                }
            }
            Err(e) => {
                future.set_value(Err(e));
            }
        }
        future
    }

    async fn request_checked(&self, request: ChannelRequestType) -> FjordResult<()> {
        let name = request.name().to_string();
        if self.request(request, true).verify(None).await? {
            Ok(())
        } else {
            Err(FjordError::Protocol(format!(
                "Channel request '{}' rejected by peer",
                name
            )))
        }
    }

    /// Runs a command.
    pub async fn exec(&self, command: &str) -> FjordResult<()> {
        self.request_checked(ChannelRequestType::Exec {
            command: command.to_string(),
        })
        .await
    }

    /// Starts the user's shell.
    pub async fn shell(&self) -> FjordResult<()> {
        self.request_checked(ChannelRequestType::Shell).await
    }

    /// Starts a subsystem.
    pub async fn subsystem(&self, name: &str) -> FjordResult<()> {
        self.request_checked(ChannelRequestType::Subsystem {
            name: name.to_string(),
        })
        .await
    }

    /// Sets an environment variable. Servers commonly refuse these, so the
    /// answer is returned rather than turned into an error.
    pub async fn env(&self, name: &str, value: &str) -> FjordResult<bool> {
        self.request(
            ChannelRequestType::Env {
                name: name.to_string(),
                value: value.to_string(),
            },
            true,
        )
        .verify(None)
        .await
    }

    /// Requests a pseudo-terminal. `modes` are `(opcode, value)` pairs.
    pub async fn request_pty(
        &self,
        term: &str,
        columns: u32,
        rows: u32,
        modes: &[(u8, u32)],
    ) -> FjordResult<()> {
        let mut encoded = Vec::with_capacity(modes.len() * 5 + 1);
        for (opcode, value) in modes {
            encoded.push(*opcode);
            encoded.extend_from_slice(&value.to_be_bytes());
        }
        encoded.push(0);
        self.request_checked(ChannelRequestType::PtyReq {
            term: term.to_string(),
            columns,
            rows,
            width_px: 0,
            height_px: 0,
            modes: Bytes::from(encoded),
        })
        .await
    }

    /// Reports a terminal size change.
    pub fn window_change(&self, columns: u32, rows: u32, width_px: u32, height_px: u32) -> FjordResult<()> {
        self.request(
            ChannelRequestType::WindowChange {
                columns,
                rows,
                width_px,
                height_px,
            },
            false,
        )
        .peek()
        .unwrap_or(Ok(true))
        .map(|_| ())
    }

    /// Delivers a signal (name without `SIG`) to the remote command.
    pub fn signal(&self, name: &str) -> FjordResult<()> {
        self.request(
            ChannelRequestType::Signal {
                name: name.to_string(),
            },
            false,
        )
        .peek()
        .unwrap_or(Ok(true))
        .map(|_| ())
    }

    /// Asks the server to forward agent connections back over this session.
    pub async fn request_agent_forwarding(&self) -> FjordResult<()> {
        self.request_checked(ChannelRequestType::AuthAgent).await
    }

    /// Asks the server to forward X11 connections back over this session.
    pub async fn request_x11_forwarding(
        &self,
        single_connection: bool,
        auth_protocol: &str,
        auth_cookie: &str,
        screen: u32,
    ) -> FjordResult<()> {
        self.request_checked(ChannelRequestType::X11Req {
            single_connection,
            auth_protocol: auth_protocol.to_string(),
            auth_cookie: auth_cookie.to_string(),
            screen,
        })
        .await
    }

    /// Converts into a byte stream for bridging.
    pub fn into_stream(self) -> ChannelStream {
        let writer = self.writer();
        let reader = ChannelReader::new(self.id, self.session, self.events);
        ChannelStream::new(reader, writer)
    }
}
