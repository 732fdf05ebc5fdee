//! SSH connection protocol messages (RFC 4254).
//!
//! Every message in the 80-100 range decodes into a [`ConnectionMessage`].
//! Channel open type-specific data and channel/global request payloads are
//! parsed into typed enums; names this implementation does not know are kept
//! as raw bytes so pluggable handlers can still interpret them.
//!
//! # Example
//!
//! ```rust
//! use fjord_proto::ssh::connection::messages::{ChannelType, ConnectionMessage};
//!
//! let open = ConnectionMessage::ChannelOpen {
//!     channel_type: ChannelType::Session,
//!     sender: 0,
//!     window: 1048576,
//!     max_packet: 32768,
//! };
//! let decoded = ConnectionMessage::decode(open.encode()).unwrap();
//! assert_eq!(decoded, open);
//! ```

use crate::ssh::buffer::{self, SshReader, SshWrite};
use crate::ssh::message::MessageType;
use bytes::{BufMut, Bytes};
use fjord_platform::{FjordError, FjordResult};

/// Extended data type code for stderr.
pub const EXTENDED_DATA_STDERR: u32 = 1;

/// Channel type with its type-specific open data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelType {
    /// Session channel (interactive shell, exec, subsystem).
    Session,
    /// Direct TCP/IP channel (local port forwarding).
    DirectTcpip {
        /// Host to connect to
        host: String,
        /// Port to connect to
        port: u32,
        /// Originator IP address
        originator_address: String,
        /// Originator port
        originator_port: u32,
    },
    /// Forwarded TCP/IP channel (remote port forwarding).
    ForwardedTcpip {
        /// Address that was connected
        connected_address: String,
        /// Port that was connected
        connected_port: u32,
        /// Originator IP address
        originator_address: String,
        /// Originator port
        originator_port: u32,
    },
    /// X11 connection.
    X11 {
        /// Originator IP address
        originator_address: String,
        /// Originator port
        originator_port: u32,
    },
    /// Agent connection (`auth-agent@openssh.com`).
    AuthAgent,
    /// Any other type; the open data is kept raw.
    Other {
        /// Type name
        name: String,
        /// Type-specific data
        data: Bytes,
    },
}

impl ChannelType {
    /// Returns the channel type name.
    pub fn name(&self) -> &str {
        match self {
            ChannelType::Session => "session",
            ChannelType::DirectTcpip { .. } => "direct-tcpip",
            ChannelType::ForwardedTcpip { .. } => "forwarded-tcpip",
            ChannelType::X11 { .. } => "x11",
            ChannelType::AuthAgent => "auth-agent@openssh.com",
            ChannelType::Other { name, .. } => name,
        }
    }

    fn encode_data(&self, buf: &mut impl BufMut) {
        match self {
            ChannelType::Session | ChannelType::AuthAgent => {}
            ChannelType::DirectTcpip {
                host,
                port,
                originator_address,
                originator_port,
            } => {
                buf.put_utf8(host);
                buf.put_u32(*port);
                buf.put_utf8(originator_address);
                buf.put_u32(*originator_port);
            }
            ChannelType::ForwardedTcpip {
                connected_address,
                connected_port,
                originator_address,
                originator_port,
            } => {
                buf.put_utf8(connected_address);
                buf.put_u32(*connected_port);
                buf.put_utf8(originator_address);
                buf.put_u32(*originator_port);
            }
            ChannelType::X11 {
                originator_address,
                originator_port,
            } => {
                buf.put_utf8(originator_address);
                buf.put_u32(*originator_port);
            }
            ChannelType::Other { data, .. } => buf.put_slice(data),
        }
    }

    fn decode(name: String, r: &mut SshReader) -> FjordResult<Self> {
        Ok(match name.as_str() {
            "session" => ChannelType::Session,
            "direct-tcpip" => ChannelType::DirectTcpip {
                host: r.get_utf8()?,
                port: r.get_u32()?,
                originator_address: r.get_utf8()?,
                originator_port: r.get_u32()?,
            },
            "forwarded-tcpip" => ChannelType::ForwardedTcpip {
                connected_address: r.get_utf8()?,
                connected_port: r.get_u32()?,
                originator_address: r.get_utf8()?,
                originator_port: r.get_u32()?,
            },
            "x11" => ChannelType::X11 {
                originator_address: r.get_utf8()?,
                originator_port: r.get_u32()?,
            },
            "auth-agent@openssh.com" => ChannelType::AuthAgent,
            _ => ChannelType::Other {
                name,
                data: r.take_rest(),
            },
        })
    }
}

/// Channel request with its request-specific data (RFC 4254 Section 6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequestType {
    /// Pseudo-terminal request.
    PtyReq {
        /// TERM environment variable value
        term: String,
        /// Terminal width, characters
        columns: u32,
        /// Terminal height, rows
        rows: u32,
        /// Terminal width, pixels
        width_px: u32,
        /// Terminal height, pixels
        height_px: u32,
        /// Encoded terminal modes
        modes: Bytes,
    },
    /// X11 forwarding request.
    X11Req {
        /// Only one connection is forwarded
        single_connection: bool,
        /// X11 authentication protocol
        auth_protocol: String,
        /// X11 authentication cookie
        auth_cookie: String,
        /// X11 screen number
        screen: u32,
    },
    /// Agent forwarding request.
    AuthAgent,
    /// Environment variable.
    Env {
        /// Variable name
        name: String,
        /// Variable value
        value: String,
    },
    /// Start a shell.
    Shell,
    /// Execute a command.
    Exec {
        /// Command line
        command: String,
    },
    /// Start a subsystem.
    Subsystem {
        /// Subsystem name
        name: String,
    },
    /// Terminal size change.
    WindowChange {
        /// Terminal width, characters
        columns: u32,
        /// Terminal height, rows
        rows: u32,
        /// Terminal width, pixels
        width_px: u32,
        /// Terminal height, pixels
        height_px: u32,
    },
    /// Deliver a signal, name without the `SIG` prefix.
    Signal {
        /// Signal name
        name: String,
    },
    /// Break (RFC 4335).
    Break {
        /// Break length in milliseconds
        length_ms: u32,
    },
    /// Command exit status.
    ExitStatus {
        /// Exit status
        status: u32,
    },
    /// Command terminated by a signal.
    ExitSignal {
        /// Signal name without `SIG`
        signal: String,
        /// Core dumped
        core_dumped: bool,
        /// Error message
        message: String,
        /// Language tag
        language: String,
    },
    /// Any other request; the data is kept raw.
    Other {
        /// Request name
        name: String,
        /// Request-specific data
        data: Bytes,
    },
}

impl ChannelRequestType {
    /// Returns the request name.
    pub fn name(&self) -> &str {
        match self {
            ChannelRequestType::PtyReq { .. } => "pty-req",
            ChannelRequestType::X11Req { .. } => "x11-req",
            ChannelRequestType::AuthAgent => "auth-agent-req@openssh.com",
            ChannelRequestType::Env { .. } => "env",
            ChannelRequestType::Shell => "shell",
            ChannelRequestType::Exec { .. } => "exec",
            ChannelRequestType::Subsystem { .. } => "subsystem",
            ChannelRequestType::WindowChange { .. } => "window-change",
            ChannelRequestType::Signal { .. } => "signal",
            ChannelRequestType::Break { .. } => "break",
            ChannelRequestType::ExitStatus { .. } => "exit-status",
            ChannelRequestType::ExitSignal { .. } => "exit-signal",
            ChannelRequestType::Other { name, .. } => name,
        }
    }

    fn encode_data(&self, buf: &mut impl BufMut) {
        match self {
            ChannelRequestType::PtyReq {
                term,
                columns,
                rows,
                width_px,
                height_px,
                modes,
            } => {
                buf.put_utf8(term);
                buf.put_u32(*columns);
                buf.put_u32(*rows);
                buf.put_u32(*width_px);
                buf.put_u32(*height_px);
                buf.put_ssh_string(modes);
            }
            ChannelRequestType::X11Req {
                single_connection,
                auth_protocol,
                auth_cookie,
                screen,
            } => {
                buf.put_bool(*single_connection);
                buf.put_utf8(auth_protocol);
                buf.put_utf8(auth_cookie);
                buf.put_u32(*screen);
            }
            ChannelRequestType::AuthAgent | ChannelRequestType::Shell => {}
            ChannelRequestType::Env { name, value } => {
                buf.put_utf8(name);
                buf.put_utf8(value);
            }
            ChannelRequestType::Exec { command } => buf.put_utf8(command),
            ChannelRequestType::Subsystem { name } => buf.put_utf8(name),
            ChannelRequestType::WindowChange {
                columns,
                rows,
                width_px,
                height_px,
            } => {
                buf.put_u32(*columns);
                buf.put_u32(*rows);
                buf.put_u32(*width_px);
                buf.put_u32(*height_px);
            }
            ChannelRequestType::Signal { name } => buf.put_utf8(name),
            ChannelRequestType::Break { length_ms } => buf.put_u32(*length_ms),
            ChannelRequestType::ExitStatus { status } => buf.put_u32(*status),
            ChannelRequestType::ExitSignal {
                signal,
                core_dumped,
                message,
                language,
            } => {
                buf.put_utf8(signal);
                buf.put_bool(*core_dumped);
                buf.put_utf8(message);
                buf.put_utf8(language);
            }
            ChannelRequestType::Other { data, .. } => buf.put_slice(data),
        }
    }

    fn decode(name: String, r: &mut SshReader) -> FjordResult<Self> {
        Ok(match name.as_str() {
            "pty-req" => ChannelRequestType::PtyReq {
                term: r.get_utf8()?,
                columns: r.get_u32()?,
                rows: r.get_u32()?,
                width_px: r.get_u32()?,
                height_px: r.get_u32()?,
                modes: r.get_string()?,
            },
            "x11-req" => ChannelRequestType::X11Req {
                single_connection: r.get_bool()?,
                auth_protocol: r.get_utf8()?,
                auth_cookie: r.get_utf8()?,
                screen: r.get_u32()?,
            },
            "auth-agent-req@openssh.com" => ChannelRequestType::AuthAgent,
            "env" => ChannelRequestType::Env {
                name: r.get_utf8()?,
                value: r.get_utf8()?,
            },
            "shell" => ChannelRequestType::Shell,
            "exec" => ChannelRequestType::Exec {
                command: r.get_utf8()?,
            },
            "subsystem" => ChannelRequestType::Subsystem {
                name: r.get_utf8()?,
            },
            "window-change" => ChannelRequestType::WindowChange {
                columns: r.get_u32()?,
                rows: r.get_u32()?,
                width_px: r.get_u32()?,
                height_px: r.get_u32()?,
            },
            "signal" => ChannelRequestType::Signal {
                name: r.get_utf8()?,
            },
            "break" => ChannelRequestType::Break {
                length_ms: r.get_u32()?,
            },
            "exit-status" => ChannelRequestType::ExitStatus {
                status: r.get_u32()?,
            },
            "exit-signal" => ChannelRequestType::ExitSignal {
                signal: r.get_utf8()?,
                core_dumped: r.get_bool()?,
                message: r.get_utf8()?,
                language: r.get_utf8()?,
            },
            _ => ChannelRequestType::Other {
                name,
                data: r.take_rest(),
            },
        })
    }
}

/// Global request with its request-specific data (RFC 4254 Section 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobalRequestType {
    /// Ask the peer to listen and forward connections back.
    TcpipForward {
        /// Address to bind
        address: String,
        /// Port to bind, 0 for any
        port: u32,
    },
    /// Cancel a previous `tcpip-forward`.
    CancelTcpipForward {
        /// Bound address
        address: String,
        /// Bound port
        port: u32,
    },
    /// OpenSSH heartbeat.
    KeepAlive,
    /// OpenSSH: no further session channels will be opened.
    NoMoreSessions,
    /// Any other request.
    Other {
        /// Request name
        name: String,
        /// Request-specific data
        data: Bytes,
    },
}

impl GlobalRequestType {
    /// Returns the request name.
    pub fn name(&self) -> &str {
        match self {
            GlobalRequestType::TcpipForward { .. } => "tcpip-forward",
            GlobalRequestType::CancelTcpipForward { .. } => "cancel-tcpip-forward",
            GlobalRequestType::KeepAlive => "keepalive@openssh.com",
            GlobalRequestType::NoMoreSessions => "no-more-sessions@openssh.com",
            GlobalRequestType::Other { name, .. } => name,
        }
    }

    fn encode_data(&self, buf: &mut impl BufMut) {
        match self {
            GlobalRequestType::TcpipForward { address, port }
            | GlobalRequestType::CancelTcpipForward { address, port } => {
                buf.put_utf8(address);
                buf.put_u32(*port);
            }
            GlobalRequestType::KeepAlive | GlobalRequestType::NoMoreSessions => {}
            GlobalRequestType::Other { data, .. } => buf.put_slice(data),
        }
    }

    fn decode(name: String, r: &mut SshReader) -> FjordResult<Self> {
        Ok(match name.as_str() {
            "tcpip-forward" => GlobalRequestType::TcpipForward {
                address: r.get_utf8()?,
                port: r.get_u32()?,
            },
            "cancel-tcpip-forward" => GlobalRequestType::CancelTcpipForward {
                address: r.get_utf8()?,
                port: r.get_u32()?,
            },
            "keepalive@openssh.com" => GlobalRequestType::KeepAlive,
            "no-more-sessions@openssh.com" => GlobalRequestType::NoMoreSessions,
            _ => GlobalRequestType::Other {
                name,
                data: r.take_rest(),
            },
        })
    }
}

/// Any message of the connection protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionMessage {
    /// SSH_MSG_GLOBAL_REQUEST
    GlobalRequest {
        /// Request
        request: GlobalRequestType,
        /// Reply expected
        want_reply: bool,
    },
    /// SSH_MSG_REQUEST_SUCCESS
    RequestSuccess {
        /// Response-specific data (bound port for `tcpip-forward` on port 0)
        data: Bytes,
    },
    /// SSH_MSG_REQUEST_FAILURE
    RequestFailure,
    /// SSH_MSG_CHANNEL_OPEN
    ChannelOpen {
        /// Type and type-specific data
        channel_type: ChannelType,
        /// Sender channel
        sender: u32,
        /// Initial window size
        window: u32,
        /// Maximum packet size
        max_packet: u32,
    },
    /// SSH_MSG_CHANNEL_OPEN_CONFIRMATION
    ChannelOpenConfirmation {
        /// Recipient channel
        recipient: u32,
        /// Sender channel
        sender: u32,
        /// Initial window size
        window: u32,
        /// Maximum packet size
        max_packet: u32,
    },
    /// SSH_MSG_CHANNEL_OPEN_FAILURE
    ChannelOpenFailure {
        /// Recipient channel
        recipient: u32,
        /// Reason code
        reason: u32,
        /// Description
        description: String,
        /// Language tag
        language: String,
    },
    /// SSH_MSG_CHANNEL_WINDOW_ADJUST
    WindowAdjust {
        /// Recipient channel
        recipient: u32,
        /// Bytes to add
        bytes_to_add: u32,
    },
    /// SSH_MSG_CHANNEL_DATA
    Data {
        /// Recipient channel
        recipient: u32,
        /// Data
        data: Bytes,
    },
    /// SSH_MSG_CHANNEL_EXTENDED_DATA
    ExtendedData {
        /// Recipient channel
        recipient: u32,
        /// Data type code (1 = stderr)
        data_type: u32,
        /// Data
        data: Bytes,
    },
    /// SSH_MSG_CHANNEL_EOF
    Eof {
        /// Recipient channel
        recipient: u32,
    },
    /// SSH_MSG_CHANNEL_CLOSE
    Close {
        /// Recipient channel
        recipient: u32,
    },
    /// SSH_MSG_CHANNEL_REQUEST
    Request {
        /// Recipient channel
        recipient: u32,
        /// Request
        request: ChannelRequestType,
        /// Reply expected
        want_reply: bool,
    },
    /// SSH_MSG_CHANNEL_SUCCESS
    Success {
        /// Recipient channel
        recipient: u32,
    },
    /// SSH_MSG_CHANNEL_FAILURE
    Failure {
        /// Recipient channel
        recipient: u32,
    },
}

impl ConnectionMessage {
    /// Message type of this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            ConnectionMessage::GlobalRequest { .. } => MessageType::GlobalRequest,
            ConnectionMessage::RequestSuccess { .. } => MessageType::RequestSuccess,
            ConnectionMessage::RequestFailure => MessageType::RequestFailure,
            ConnectionMessage::ChannelOpen { .. } => MessageType::ChannelOpen,
            ConnectionMessage::ChannelOpenConfirmation { .. } => {
                MessageType::ChannelOpenConfirmation
            }
            ConnectionMessage::ChannelOpenFailure { .. } => MessageType::ChannelOpenFailure,
            ConnectionMessage::WindowAdjust { .. } => MessageType::ChannelWindowAdjust,
            ConnectionMessage::Data { .. } => MessageType::ChannelData,
            ConnectionMessage::ExtendedData { .. } => MessageType::ChannelExtendedData,
            ConnectionMessage::Eof { .. } => MessageType::ChannelEof,
            ConnectionMessage::Close { .. } => MessageType::ChannelClose,
            ConnectionMessage::Request { .. } => MessageType::ChannelRequest,
            ConnectionMessage::Success { .. } => MessageType::ChannelSuccess,
            ConnectionMessage::Failure { .. } => MessageType::ChannelFailure,
        }
    }

    /// Local channel id the message is addressed to, if any.
    pub fn recipient(&self) -> Option<u32> {
        match self {
            ConnectionMessage::ChannelOpenConfirmation { recipient, .. }
            | ConnectionMessage::ChannelOpenFailure { recipient, .. }
            | ConnectionMessage::WindowAdjust { recipient, .. }
            | ConnectionMessage::Data { recipient, .. }
            | ConnectionMessage::ExtendedData { recipient, .. }
            | ConnectionMessage::Eof { recipient }
            | ConnectionMessage::Close { recipient }
            | ConnectionMessage::Request { recipient, .. }
            | ConnectionMessage::Success { recipient }
            | ConnectionMessage::Failure { recipient } => Some(*recipient),
            _ => None,
        }
    }

    /// Encodes the payload, opcode included.
    pub fn encode(&self) -> Bytes {
        let mut buf = buffer::payload(self.message_type() as u8);
        match self {
            ConnectionMessage::GlobalRequest {
                request,
                want_reply,
            } => {
                buf.put_utf8(request.name());
                buf.put_bool(*want_reply);
                request.encode_data(&mut buf);
            }
            ConnectionMessage::RequestSuccess { data } => buf.put_slice(data),
            ConnectionMessage::RequestFailure => {}
            ConnectionMessage::ChannelOpen {
                channel_type,
                sender,
                window,
                max_packet,
            } => {
                buf.put_utf8(channel_type.name());
                buf.put_u32(*sender);
                buf.put_u32(*window);
                buf.put_u32(*max_packet);
                channel_type.encode_data(&mut buf);
            }
            ConnectionMessage::ChannelOpenConfirmation {
                recipient,
                sender,
                window,
                max_packet,
            } => {
                buf.put_u32(*recipient);
                buf.put_u32(*sender);
                buf.put_u32(*window);
                buf.put_u32(*max_packet);
            }
            ConnectionMessage::ChannelOpenFailure {
                recipient,
                reason,
                description,
                language,
            } => {
                buf.put_u32(*recipient);
                buf.put_u32(*reason);
                buf.put_utf8(description);
                buf.put_utf8(language);
            }
            ConnectionMessage::WindowAdjust {
                recipient,
                bytes_to_add,
            } => {
                buf.put_u32(*recipient);
                buf.put_u32(*bytes_to_add);
            }
            ConnectionMessage::Data { recipient, data } => {
                buf.put_u32(*recipient);
                buf.put_ssh_string(data);
            }
            ConnectionMessage::ExtendedData {
                recipient,
                data_type,
                data,
            } => {
                buf.put_u32(*recipient);
                buf.put_u32(*data_type);
                buf.put_ssh_string(data);
            }
            ConnectionMessage::Eof { recipient }
            | ConnectionMessage::Close { recipient }
            | ConnectionMessage::Success { recipient }
            | ConnectionMessage::Failure { recipient } => buf.put_u32(*recipient),
            ConnectionMessage::Request {
                recipient,
                request,
                want_reply,
            } => {
                buf.put_u32(*recipient);
                buf.put_utf8(request.name());
                buf.put_bool(*want_reply);
                request.encode_data(&mut buf);
            }
        }
        buf.freeze()
    }

    /// Decodes a payload, opcode included.
    pub fn decode(payload: Bytes) -> FjordResult<Self> {
        let mut r = SshReader::new(payload);
        let opcode = r.get_u8()?;
        let msg_type = MessageType::from_u8(opcode).ok_or_else(|| {
            FjordError::Protocol(format!(
                "Not a connection protocol message: {}",
                MessageType::describe(opcode)
            ))
        })?;
        let msg = match msg_type {
            MessageType::GlobalRequest => {
                let name = r.get_utf8()?;
                let want_reply = r.get_bool()?;
                ConnectionMessage::GlobalRequest {
                    request: GlobalRequestType::decode(name, &mut r)?,
                    want_reply,
                }
            }
            MessageType::RequestSuccess => ConnectionMessage::RequestSuccess {
                data: r.take_rest(),
            },
            MessageType::RequestFailure => ConnectionMessage::RequestFailure,
            MessageType::ChannelOpen => {
                let name = r.get_utf8()?;
                let sender = r.get_u32()?;
                let window = r.get_u32()?;
                let max_packet = r.get_u32()?;
                ConnectionMessage::ChannelOpen {
                    channel_type: ChannelType::decode(name, &mut r)?,
                    sender,
                    window,
                    max_packet,
                }
            }
            MessageType::ChannelOpenConfirmation => ConnectionMessage::ChannelOpenConfirmation {
                recipient: r.get_u32()?,
                sender: r.get_u32()?,
                window: r.get_u32()?,
                max_packet: r.get_u32()?,
            },
            MessageType::ChannelOpenFailure => {
                let recipient = r.get_u32()?;
                let reason = r.get_u32()?;
                let description = r.get_utf8()?;
                // some implementations omit the language tag
                let language = if r.remaining() > 0 {
                    r.get_utf8()?
                } else {
                    String::new()
                };
                ConnectionMessage::ChannelOpenFailure {
                    recipient,
                    reason,
                    description,
                    language,
                }
            }
            MessageType::ChannelWindowAdjust => ConnectionMessage::WindowAdjust {
                recipient: r.get_u32()?,
                bytes_to_add: r.get_u32()?,
            },
            MessageType::ChannelData => ConnectionMessage::Data {
                recipient: r.get_u32()?,
                data: r.get_string()?,
            },
            MessageType::ChannelExtendedData => ConnectionMessage::ExtendedData {
                recipient: r.get_u32()?,
                data_type: r.get_u32()?,
                data: r.get_string()?,
            },
            MessageType::ChannelEof => ConnectionMessage::Eof {
                recipient: r.get_u32()?,
            },
            MessageType::ChannelClose => ConnectionMessage::Close {
                recipient: r.get_u32()?,
            },
            MessageType::ChannelRequest => {
                let recipient = r.get_u32()?;
                let name = r.get_utf8()?;
                let want_reply = r.get_bool()?;
                ConnectionMessage::Request {
                    recipient,
                    request: ChannelRequestType::decode(name, &mut r)?,
                    want_reply,
                }
            }
            MessageType::ChannelSuccess => ConnectionMessage::Success {
                recipient: r.get_u32()?,
            },
            MessageType::ChannelFailure => ConnectionMessage::Failure {
                recipient: r.get_u32()?,
            },
            other => {
                return Err(FjordError::Protocol(format!(
                    "Not a connection protocol message: {}",
                    other
                )))
            }
        };
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::packet::{PacketDecoder, PacketEncoder};
    use bytes::BytesMut;

    fn through_codec(msg: &ConnectionMessage) -> ConnectionMessage {
        let mut encoder = PacketEncoder::new();
        let mut decoder = PacketDecoder::new();
        let wire = encoder.encode(msg.encode()).unwrap();
        let mut input = BytesMut::from(&wire[..]);
        let payload = decoder.decode(&mut input).unwrap().unwrap();
        assert_eq!(payload[0], msg.message_type() as u8);
        ConnectionMessage::decode(payload).unwrap()
    }

    #[test]
    fn test_channel_messages_survive_framing() {
        let messages = vec![
            ConnectionMessage::ChannelOpen {
                channel_type: ChannelType::DirectTcpip {
                    host: "10.0.0.5".into(),
                    port: 22,
                    originator_address: "127.0.0.1".into(),
                    originator_port: 50000,
                },
                sender: 3,
                window: 2 * 1024 * 1024,
                max_packet: 32768,
            },
            ConnectionMessage::Request {
                recipient: 9,
                request: ChannelRequestType::PtyReq {
                    term: "xterm".into(),
                    columns: 80,
                    rows: 24,
                    width_px: 0,
                    height_px: 0,
                    modes: Bytes::from_static(&[53, 0, 0, 0, 1, 0]),
                },
                want_reply: true,
            },
            ConnectionMessage::Data {
                recipient: 9,
                data: Bytes::from_static(b"\x00\x01binary\xff"),
            },
            ConnectionMessage::ExtendedData {
                recipient: 9,
                data_type: EXTENDED_DATA_STDERR,
                data: Bytes::from_static(b"oops"),
            },
        ];
        for msg in &messages {
            assert_eq!(&through_codec(msg), msg);
        }
    }

    #[test]
    fn test_unknown_names_are_kept_raw() {
        let msg = ConnectionMessage::Request {
            recipient: 1,
            request: ChannelRequestType::Other {
                name: "winadj@putty.projects.tartarus.org".into(),
                data: Bytes::new(),
            },
            want_reply: true,
        };
        assert_eq!(ConnectionMessage::decode(msg.encode()).unwrap(), msg);

        let open = ConnectionMessage::ChannelOpen {
            channel_type: ChannelType::Other {
                name: "custom@example.com".into(),
                data: Bytes::from_static(b"\x01\x02"),
            },
            sender: 0,
            window: 10,
            max_packet: 10,
        };
        assert_eq!(ConnectionMessage::decode(open.encode()).unwrap(), open);
    }

    #[test]
    fn test_global_request_layout() {
        let msg = ConnectionMessage::GlobalRequest {
            request: GlobalRequestType::TcpipForward {
                address: "0.0.0.0".into(),
                port: 0,
            },
            want_reply: true,
        };
        let payload = msg.encode();
        assert_eq!(payload[0], 80);
        assert_eq!(&payload[5..18], b"tcpip-forward");
        assert_eq!(ConnectionMessage::decode(payload).unwrap(), msg);
    }

    #[test]
    fn test_recipient_and_truncation() {
        let eof = ConnectionMessage::Eof { recipient: 42 };
        assert_eq!(eof.recipient(), Some(42));
        assert_eq!(ConnectionMessage::RequestFailure.recipient(), None);

        let payload = eof.encode();
        assert!(ConnectionMessage::decode(payload.slice(..3)).is_err());
        assert!(ConnectionMessage::decode(Bytes::from_static(&[21])).is_err());
    }

    #[test]
    fn test_open_failure_without_language() {
        let mut raw = buffer::payload(MessageType::ChannelOpenFailure as u8);
        raw.put_u32(4);
        raw.put_u32(2);
        raw.put_utf8("refused");
        match ConnectionMessage::decode(raw.freeze()).unwrap() {
            ConnectionMessage::ChannelOpenFailure {
                recipient,
                reason,
                description,
                language,
            } => {
                assert_eq!((recipient, reason), (4, 2));
                assert_eq!(description, "refused");
                assert!(language.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
