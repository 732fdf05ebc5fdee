//! Byte stream views of a channel.
//!
//! [`ChannelReader`] yields the channel's data; reading is what releases
//! local window space back to the peer. [`ChannelWriter`] reserves remote
//! window space before queueing each chunk, so a writer that outruns the
//! peer waits instead of buffering without bound.
//!
//! Both halves work from async code (tokio `AsyncRead`/`AsyncWrite`) and from
//! plain threads (`std::io::Read`/`Write`). The blocking forms must not be
//! used on a runtime worker thread.

use super::window::RemoteWindow;
use super::ChannelEvent;
use crate::ssh::session::handle::Msg;
use crate::ssh::session::SessionHandle;
use bytes::{Buf, Bytes};
use fjord_platform::{FjordError, FjordResult};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

fn to_io(err: FjordError) -> io::Error {
    match err {
        FjordError::Io(e) => e,
        FjordError::Closed(msg) => io::Error::new(io::ErrorKind::BrokenPipe, msg),
        FjordError::Timeout(msg) => io::Error::new(io::ErrorKind::TimedOut, msg),
        other => io::Error::new(io::ErrorKind::Other, other.to_string()),
    }
}

/// Read half of a channel.
///
/// Only regular data is returned; extended data is acknowledged and dropped
/// and status events are skipped. End of stream is reported on EOF or close.
pub struct ChannelReader {
    id: u32,
    session: SessionHandle,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    pending: Bytes,
    eof: bool,
}

impl ChannelReader {
    pub(crate) fn new(
        id: u32,
        session: SessionHandle,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> Self {
        Self {
            id,
            session,
            events,
            pending: Bytes::new(),
            eof: false,
        }
    }

    fn consumed(&self, len: usize) {
        if len > 0 {
            // after the session ended window accounting no longer matters
            let _ = self.session.send(Msg::ChannelConsumed {
                id: self.id,
                len: len as u32,
            });
        }
    }

    fn accept(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Data(data) => {
                self.consumed(data.len());
                self.pending = data;
            }
            ChannelEvent::ExtendedData { data, .. } => self.consumed(data.len()),
            ChannelEvent::Eof | ChannelEvent::Closed => self.eof = true,
            _ => {}
        }
    }

    fn copy_pending(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.pending.len());
        out[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        n
    }
}

impl AsyncRead for ChannelReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            if !this.pending.is_empty() {
                let n = buf.remaining().min(this.pending.len());
                buf.put_slice(&this.pending[..n]);
                this.pending.advance(n);
                return Poll::Ready(Ok(()));
            }
            if this.eof {
                return Poll::Ready(Ok(()));
            }
            match this.events.poll_recv(cx) {
                Poll::Ready(Some(event)) => this.accept(event),
                Poll::Ready(None) => this.eof = true,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl io::Read for ChannelReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        loop {
            if !self.pending.is_empty() {
                return Ok(self.copy_pending(out));
            }
            if self.eof || out.is_empty() {
                return Ok(0);
            }
            match self.events.blocking_recv() {
                Some(event) => self.accept(event),
                None => self.eof = true,
            }
        }
    }
}

/// Write half of a channel, clonable.
///
/// A writer created for extended data sends `SSH_MSG_CHANNEL_EXTENDED_DATA`
/// with its type code (stderr is 1).
#[derive(Clone)]
pub struct ChannelWriter {
    id: u32,
    session: SessionHandle,
    remote: Arc<RemoteWindow>,
    ext: Option<u32>,
}

impl std::fmt::Debug for ChannelWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelWriter")
            .field("id", &self.id)
            .field("ext", &self.ext)
            .finish()
    }
}

impl ChannelWriter {
    pub(crate) fn new(
        id: u32,
        session: SessionHandle,
        remote: Arc<RemoteWindow>,
        ext: Option<u32>,
    ) -> Self {
        Self {
            id,
            session,
            remote,
            ext,
        }
    }

    /// Same channel, writing extended data of type `code`.
    pub fn extended(&self, code: u32) -> Self {
        Self {
            ext: Some(code),
            ..self.clone()
        }
    }

    fn send_chunk(&self, chunk: &[u8]) -> FjordResult<()> {
        self.session.send(Msg::ChannelData {
            id: self.id,
            ext: self.ext,
            data: Bytes::copy_from_slice(chunk),
        })
    }

    /// Writes all of `data`, waiting for window space as needed.
    pub async fn write_all(&self, mut data: &[u8]) -> FjordResult<()> {
        while !data.is_empty() {
            let n = self.remote.reserve(data.len()).await? as usize;
            self.send_chunk(&data[..n])?;
            data = &data[n..];
        }
        Ok(())
    }

    /// Blocking form of [`ChannelWriter::write_all`].
    pub fn write_all_blocking(&self, mut data: &[u8], timeout: Option<Duration>) -> FjordResult<()> {
        while !data.is_empty() {
            let n = self.remote.reserve_blocking(data.len(), timeout)? as usize;
            self.send_chunk(&data[..n])?;
            data = &data[n..];
        }
        Ok(())
    }

    /// Sends EOF. Extended data writers have no EOF of their own.
    pub fn eof(&self) -> FjordResult<()> {
        if self.ext.is_some() {
            return Ok(());
        }
        self.session.send(Msg::ChannelEof { id: self.id })
    }
}

impl AsyncWrite for ChannelWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.remote.poll_reserve(cx, buf.len()) {
            Poll::Ready(Ok(n)) => {
                let n = n as usize;
                if n > 0 {
                    self.send_chunk(&buf[..n]).map_err(to_io)?;
                }
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(to_io(e))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.eof().map_err(to_io))
    }
}

impl io::Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = self
            .remote
            .reserve_blocking(buf.len(), None)
            .map_err(to_io)? as usize;
        self.send_chunk(&buf[..n]).map_err(to_io)?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Blocking stdin of a command.
pub type ChannelPipeReader = ChannelReader;
/// Blocking stdout or stderr of a command.
pub type ChannelPipeWriter = ChannelWriter;
/// Async stdin of a command.
pub type ChannelInput = ChannelReader;
/// Async stdout or stderr of a command.
pub type ChannelOutput = ChannelWriter;

/// Full duplex byte stream over one channel.
///
/// Shutting down the write side sends EOF. Closing the channel is left to
/// the owner of the [`Channel`](super::Channel) handle or its close future.
pub struct ChannelStream {
    reader: ChannelReader,
    writer: ChannelWriter,
}

impl ChannelStream {
    pub(crate) fn new(reader: ChannelReader, writer: ChannelWriter) -> Self {
        Self { reader, writer }
    }

    /// Local channel id.
    pub fn id(&self) -> u32 {
        self.reader.id
    }

    /// Sends CLOSE for the channel.
    pub fn close(&self) {
        // nothing to close once the session is gone
        let _ = self.writer.session.send(Msg::ChannelClose {
            id: self.reader.id,
            immediately: false,
        });
    }

    /// Splits into independent halves.
    pub fn into_split(self) -> (ChannelReader, ChannelWriter) {
        (self.reader, self.writer)
    }
}

impl AsyncRead for ChannelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for ChannelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}
