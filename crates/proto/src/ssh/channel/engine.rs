//! Per channel protocol state, owned by the session loop.

use super::server::ServerSession;
use super::window::{LocalWindow, RemoteWindow};
use super::{ChannelEvent, ChannelSetup, ChannelState};
use crate::ssh::config::SshConfig;
use crate::ssh::connection::messages::{ChannelRequestType, ChannelType, ConnectionMessage};
use crate::ssh::future::{CloseFuture, OpenFuture, SshFuture};
use crate::ssh::message::ChannelOpenFailureReason;
use crate::ssh::session::transport::Transport;
use bytes::Bytes;
use fjord_platform::{FjordError, FjordResult};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Where incoming events go.
///
/// Peer opened channels may receive data before anybody consumes it; those
/// events are kept until a consumer is installed.
pub(crate) enum DataReceiver {
    Pending(Vec<ChannelEvent>),
    Installed(mpsc::UnboundedSender<ChannelEvent>),
}

impl DataReceiver {
    fn deliver(&mut self, event: ChannelEvent) {
        match self {
            DataReceiver::Pending(events) => events.push(event),
            DataReceiver::Installed(tx) => {
                // a dropped consumer just stops listening
                let _ = tx.send(event);
            }
        }
    }

    /// Installs the consumer, replaying anything received so far.
    pub(crate) fn install(&mut self, tx: mpsc::UnboundedSender<ChannelEvent>) {
        if let DataReceiver::Pending(events) = self {
            for event in events.drain(..) {
                let _ = tx.send(event);
            }
        }
        *self = DataReceiver::Installed(tx);
    }
}

pub(crate) struct ChannelEntry {
    pub(crate) id: u32,
    pub(crate) channel_type: ChannelType,
    pub(crate) remote_id: Option<u32>,
    pub(crate) state: ChannelState,
    pub(crate) local_window: LocalWindow,
    pub(crate) remote_window: Arc<RemoteWindow>,
    pub(crate) open_future: OpenFuture,
    pub(crate) close_future: CloseFuture,
    pub(crate) receiver: DataReceiver,
    pub(crate) server: Option<ServerSession>,
    eof_sent: bool,
    eof_received: bool,
    close_sent: bool,
    close_received: bool,
    pending_replies: VecDeque<SshFuture<bool>>,
    close_deadline: Option<Instant>,
}

impl ChannelEntry {
    /// Channel opened by us.
    pub(crate) fn outgoing(id: u32, setup: ChannelSetup, config: &SshConfig) -> Self {
        Self {
            id,
            channel_type: setup.channel_type,
            remote_id: None,
            state: ChannelState::OpenPending,
            local_window: LocalWindow::new(config.window_size, config.max_packet_size),
            remote_window: setup.remote,
            open_future: setup.open_future,
            close_future: setup.close_future,
            receiver: DataReceiver::Installed(setup.events),
            server: None,
            eof_sent: false,
            eof_received: false,
            close_sent: false,
            close_received: false,
            pending_replies: VecDeque::new(),
            close_deadline: None,
        }
    }

    /// Channel opened by the peer. It stays pending until confirmed.
    pub(crate) fn incoming(
        id: u32,
        channel_type: ChannelType,
        remote_id: u32,
        window: u32,
        max_packet: u32,
        config: &SshConfig,
    ) -> Self {
        let remote_window = Arc::new(RemoteWindow::new());
        remote_window.init(window, max_packet);
        Self {
            id,
            channel_type,
            remote_id: Some(remote_id),
            state: ChannelState::OpenPending,
            local_window: LocalWindow::new(config.window_size, config.max_packet_size),
            remote_window,
            open_future: OpenFuture::new("channel open"),
            close_future: CloseFuture::new("channel close"),
            receiver: DataReceiver::Pending(Vec::new()),
            server: None,
            eof_sent: false,
            eof_received: false,
            close_sent: false,
            close_received: false,
            pending_replies: VecDeque::new(),
            close_deadline: None,
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state == ChannelState::Open
    }

    pub(crate) fn close_received(&self) -> bool {
        self.close_received
    }

    pub(crate) fn close_sent(&self) -> bool {
        self.close_sent
    }

    pub(crate) fn open_message(&self) -> ConnectionMessage {
        ConnectionMessage::ChannelOpen {
            channel_type: self.channel_type.clone(),
            sender: self.id,
            window: self.local_window.size(),
            max_packet: self.local_window.packet_size(),
        }
    }

    /// Confirms a peer opened channel.
    pub(crate) fn confirm(&mut self, t: &mut Transport) -> FjordResult<()> {
        let Some(recipient) = self.remote_id else {
            return Err(FjordError::IllegalState(format!(
                "Channel {} has no peer id to confirm",
                self.id
            )));
        };
        t.send_message(&ConnectionMessage::ChannelOpenConfirmation {
            recipient,
            sender: self.id,
            window: self.local_window.size(),
            max_packet: self.local_window.packet_size(),
        })?;
        self.state = ChannelState::Open;
        self.open_future.set_value(Ok(()));
        debug!("Channel {} ({}) opened by peer", self.id, self.channel_type.name());
        Ok(())
    }

    /// Rejects a peer opened channel.
    pub(crate) fn reject(
        &mut self,
        t: &mut Transport,
        reason: ChannelOpenFailureReason,
        description: &str,
    ) -> FjordResult<()> {
        if let Some(recipient) = self.remote_id {
            t.send_message(&ConnectionMessage::ChannelOpenFailure {
                recipient,
                reason: reason as u32,
                description: description.to_string(),
                language: String::new(),
            })?;
        }
        self.open_future
            .set_value(Err(reason.into_error(description)));
        Ok(())
    }

    pub(crate) fn handle_open_confirmation(&mut self, sender: u32, window: u32, max_packet: u32) -> FjordResult<()> {
        if self.state != ChannelState::OpenPending || self.remote_id.is_some() {
            return Err(FjordError::Protocol(format!(
                "Unexpected open confirmation for channel {}",
                self.id
            )));
        }
        self.remote_id = Some(sender);
        self.remote_window.init(window, max_packet);
        self.state = ChannelState::Open;
        self.open_future.set_value(Ok(()));
        debug!(
            "Channel {} ({}) confirmed, remote id {}, window {}, packet {}",
            self.id,
            self.channel_type.name(),
            sender,
            window,
            max_packet
        );
        Ok(())
    }

    pub(crate) fn handle_open_failure(&mut self, reason: u32, description: &str) {
        let reason = ChannelOpenFailureReason::from_u32(reason)
            .unwrap_or(ChannelOpenFailureReason::ConnectFailed);
        debug!("Channel {} open failed: {} ({})", self.id, description, reason.as_str());
        self.open_future
            .set_value(Err(reason.into_error(description)));
    }

    /// Charges incoming data to the local window and hands it on.
    pub(crate) fn handle_data(&mut self, ext: Option<u32>, data: Bytes) -> FjordResult<()> {
        if self.eof_received || self.close_received {
            return Err(FjordError::Protocol(format!(
                "Data received on channel {} after EOF or CLOSE",
                self.id
            )));
        }
        self.local_window.consume(data.len() as u32)?;
        trace!("Channel {} received {} bytes", self.id, data.len());
        let event = match ext {
            None => ChannelEvent::Data(data),
            Some(code) => ChannelEvent::ExtendedData { code, data },
        };
        self.receiver.deliver(event);
        Ok(())
    }

    /// The consumer drained `len` bytes.
    pub(crate) fn consumed(&mut self, t: &mut Transport, len: u32) -> FjordResult<()> {
        if let Some(bytes_to_add) = self.local_window.release(len) {
            if let (Some(recipient), false) = (self.remote_id, self.close_sent) {
                t.send_message(&ConnectionMessage::WindowAdjust {
                    recipient,
                    bytes_to_add,
                })?;
            }
        }
        Ok(())
    }

    pub(crate) fn handle_window_adjust(&mut self, bytes_to_add: u32) -> FjordResult<()> {
        self.remote_window.expand(bytes_to_add)
    }

    /// Sends data already reserved against the remote window.
    pub(crate) fn send_data(&mut self, t: &mut Transport, ext: Option<u32>, data: Bytes) -> FjordResult<()> {
        let Some(recipient) = self.remote_id else {
            return Ok(());
        };
        if !self.is_open() || self.eof_sent || self.close_sent {
            trace!("Dropping {} bytes for channel {} that no longer sends", data.len(), self.id);
            return Ok(());
        }
        let message = match ext {
            None => ConnectionMessage::Data { recipient, data },
            Some(data_type) => ConnectionMessage::ExtendedData {
                recipient,
                data_type,
                data,
            },
        };
        t.send_message(&message)
    }

    pub(crate) fn send_eof(&mut self, t: &mut Transport) -> FjordResult<()> {
        if self.eof_sent || self.close_sent {
            return Ok(());
        }
        let Some(recipient) = self.remote_id else {
            return Ok(());
        };
        self.eof_sent = true;
        t.send_message(&ConnectionMessage::Eof { recipient })
    }

    /// Sends CLOSE once. The peer's CLOSE is awaited until `deadline`.
    pub(crate) fn send_close(&mut self, t: &mut Transport, deadline: Instant) -> FjordResult<()> {
        if self.close_sent {
            return Ok(());
        }
        self.close_sent = true;
        self.state = ChannelState::Closing;
        self.close_deadline.get_or_insert(deadline);
        match self.remote_id {
            Some(recipient) => t.send_message(&ConnectionMessage::Close { recipient }),
            None => Ok(()),
        }
    }

    pub(crate) fn send_request(
        &mut self,
        t: &mut Transport,
        request: ChannelRequestType,
        reply: Option<SshFuture<bool>>,
    ) -> FjordResult<()> {
        let Some(recipient) = self.remote_id.filter(|_| self.is_open()) else {
            if let Some(reply) = reply {
                reply.set_value(Err(FjordError::IllegalState(format!(
                    "Channel {} is not open",
                    self.id
                ))));
            }
            return Ok(());
        };
        let want_reply = reply.is_some();
        if let Some(reply) = reply {
            self.pending_replies.push_back(reply);
        }
        t.send_message(&ConnectionMessage::Request {
            recipient,
            request,
            want_reply,
        })
    }

    pub(crate) fn send_reply(&mut self, t: &mut Transport, success: bool) -> FjordResult<()> {
        let Some(recipient) = self.remote_id else {
            return Ok(());
        };
        if self.close_sent {
            return Ok(());
        }
        let message = if success {
            ConnectionMessage::Success { recipient }
        } else {
            ConnectionMessage::Failure { recipient }
        };
        t.send_message(&message)
    }

    pub(crate) fn handle_reply(&mut self, success: bool) -> FjordResult<()> {
        match self.pending_replies.pop_front() {
            Some(reply) => {
                reply.set_value(Ok(success));
                Ok(())
            }
            None => Err(FjordError::Protocol(format!(
                "Unexpected request reply on channel {}",
                self.id
            ))),
        }
    }

    /// Client side status requests from the peer become events.
    pub(crate) fn deliver(&mut self, event: ChannelEvent) {
        self.receiver.deliver(event);
    }

    pub(crate) fn handle_eof(&mut self) {
        if !self.eof_received {
            self.eof_received = true;
            self.receiver.deliver(ChannelEvent::Eof);
        }
    }

    pub(crate) fn handle_close(&mut self) {
        self.close_received = true;
        self.remote_window.close();
    }

    pub(crate) fn close_expired(&self, now: Instant) -> bool {
        self.close_deadline.map_or(false, |d| now >= d)
    }

    /// Releases everything waiting on this channel. `error` fails an
    /// unfinished open and any pending request replies.
    pub(crate) fn finalize(mut self, error: Option<FjordError>) {
        self.state = ChannelState::Closed;
        self.remote_window.close();
        let error = error.unwrap_or_else(|| FjordError::Closed(format!("Channel {} closed", self.id)));
        if !self.open_future.is_done() {
            self.open_future.set_value(Err(error.clone()));
        }
        for reply in self.pending_replies.drain(..) {
            reply.set_value(Err(error.clone()));
        }
        if let Some(server) = self.server.as_mut() {
            server.abort();
        }
        self.receiver.deliver(ChannelEvent::Closed);
        self.close_future.set_value(Ok(()));
        debug!("Channel {} ({}) closed", self.id, self.channel_type.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(config: &SshConfig) -> (ChannelEntry, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let setup = ChannelSetup {
            channel_type: ChannelType::Session,
            events: tx,
            remote: Arc::new(RemoteWindow::new()),
            open_future: OpenFuture::new("open"),
            close_future: CloseFuture::new("close"),
        };
        (ChannelEntry::outgoing(3, setup, config), rx)
    }

    #[test]
    fn test_confirmation_opens_channel() {
        let config = SshConfig::default();
        let (mut entry, _rx) = entry(&config);
        entry.handle_open_confirmation(9, 1000, 100).unwrap();
        assert!(entry.is_open());
        assert_eq!(entry.remote_id, Some(9));
        assert_eq!(entry.remote_window.size(), 1000);
        assert!(matches!(entry.open_future.peek(), Some(Ok(()))));
        assert!(entry.handle_open_confirmation(9, 1000, 100).is_err());
    }

    #[test]
    fn test_data_beyond_window_is_rejected_before_delivery() {
        let config = SshConfig::default().with_window_size(16).with_max_packet_size(16);
        let (mut entry, mut rx) = entry(&config);
        entry.handle_open_confirmation(1, 100, 100).unwrap();
        entry.handle_data(None, Bytes::from_static(b"0123456789")).unwrap();
        assert!(entry
            .handle_data(None, Bytes::from_static(b"0123456789"))
            .is_err());
        assert_eq!(rx.try_recv().unwrap(), ChannelEvent::Data(Bytes::from_static(b"0123456789")));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_finalize_releases_waiters() {
        let config = SshConfig::default();
        let (mut entry, mut rx) = entry(&config);
        let close = entry.close_future.clone();
        let open = entry.open_future.clone();
        entry.handle_eof();
        entry.finalize(None);
        assert!(matches!(open.peek(), Some(Err(FjordError::Closed(_)))));
        assert!(matches!(close.peek(), Some(Ok(()))));
        assert_eq!(rx.try_recv().unwrap(), ChannelEvent::Eof);
        assert_eq!(rx.try_recv().unwrap(), ChannelEvent::Closed);
    }

    #[test]
    fn test_pending_receiver_replays_on_install() {
        let config = SshConfig::default();
        let mut entry = ChannelEntry::incoming(0, ChannelType::Session, 4, 100, 100, &config);
        entry.state = ChannelState::Open;
        entry.handle_data(None, Bytes::from_static(b"early")).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        entry.receiver.install(tx);
        entry.handle_data(None, Bytes::from_static(b"late")).unwrap();
        assert_eq!(rx.try_recv().unwrap(), ChannelEvent::Data(Bytes::from_static(b"early")));
        assert_eq!(rx.try_recv().unwrap(), ChannelEvent::Data(Bytes::from_static(b"late")));
    }
}
