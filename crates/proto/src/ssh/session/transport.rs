//! Outgoing half of the binary packet protocol.
//!
//! While a key exchange runs only transport messages may be sent; any other
//! payload is held back and flushed in order once our NEWKEYS is out.

use crate::ssh::connection::messages::ConnectionMessage;
use crate::ssh::future::WriteFuture;
use crate::ssh::io::IoWriter;
use crate::ssh::message::MessageType;
use crate::ssh::packet::{DirectionKeys, PacketEncoder};
use bytes::Bytes;
use fjord_platform::FjordResult;
use std::collections::VecDeque;
use tracing::trace;

pub(crate) struct Transport {
    encoder: PacketEncoder,
    writer: IoWriter,
    kex_in_flight: bool,
    pending: VecDeque<Bytes>,
    last_write: Option<WriteFuture>,
}

impl Transport {
    pub(crate) fn new(writer: IoWriter) -> Self {
        Self {
            encoder: PacketEncoder::new(),
            writer,
            kex_in_flight: false,
            pending: VecDeque::new(),
            last_write: None,
        }
    }

    /// Sends a payload, holding it back if a key exchange is running and
    /// the message is not a transport message.
    pub(crate) fn send(&mut self, payload: Bytes) -> FjordResult<()> {
        let opcode = payload.first().copied().unwrap_or(0);
        if self.kex_in_flight && !MessageType::is_transport(opcode) {
            trace!("Holding {} until key exchange completes", MessageType::describe(opcode));
            self.pending.push_back(payload);
            return Ok(());
        }
        self.write(payload)
    }

    pub(crate) fn send_message(&mut self, message: &ConnectionMessage) -> FjordResult<()> {
        self.send(message.encode())
    }

    fn write(&mut self, payload: Bytes) -> FjordResult<()> {
        let packet = self.encoder.encode(payload)?;
        self.last_write = Some(self.writer.write(packet));
        Ok(())
    }

    pub(crate) fn set_kex_in_flight(&mut self, in_flight: bool) {
        self.kex_in_flight = in_flight;
    }

    pub(crate) fn kex_in_flight(&self) -> bool {
        self.kex_in_flight
    }

    /// Installs new outgoing keys and releases held back payloads.
    pub(crate) fn activate_keys(&mut self, keys: DirectionKeys) -> FjordResult<()> {
        self.encoder.set_keys(keys);
        self.kex_in_flight = false;
        while let Some(payload) = self.pending.pop_front() {
            self.write(payload)?;
        }
        Ok(())
    }

    pub(crate) fn encoder(&self) -> &PacketEncoder {
        &self.encoder
    }

    /// Future of the most recent socket write.
    pub(crate) fn last_write(&self) -> Option<WriteFuture> {
        self.last_write.clone()
    }

    pub(crate) fn writer_mut(&mut self) -> &mut IoWriter {
        &mut self.writer
    }
}
