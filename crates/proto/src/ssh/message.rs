//! SSH protocol message numbers and reason codes (RFC 4253, RFC 4254).
//!
//! # Message Categories
//!
//! - **Transport Layer Generic** (1-19): Disconnect, ignore, debug, service
//! - **Algorithm Negotiation** (20-29): Key exchange initialization
//! - **Key Exchange Method** (30-49): Method-specific messages, routed to the KEX algorithm
//! - **User Authentication** (50-79): Authentication protocol
//! - **Connection Protocol** (80-127): Global requests and channels
//!
//! # Example
//!
//! ```rust
//! use fjord_proto::ssh::message::MessageType;
//!
//! let msg_type = MessageType::KexInit;
//! assert_eq!(msg_type as u8, 20);
//! assert!(MessageType::is_kex_method(31));
//! ```

use fjord_platform::FjordError;

/// First opcode reserved for key exchange method messages.
pub const KEX_METHOD_FIRST: u8 = 30;
/// Last opcode reserved for key exchange method messages.
pub const KEX_METHOD_LAST: u8 = 49;

/// SSH message types as defined in RFC 4253 Section 12 and RFC 4254 Section 9.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    // Transport layer generic (1-19)
    /// Disconnect message - terminates the connection.
    Disconnect = 1,
    /// Ignore message - can be used for padding or keep-alive.
    Ignore = 2,
    /// Unimplemented message - response to unknown message type.
    Unimplemented = 3,
    /// Debug message - debugging information.
    Debug = 4,
    /// Service request - request a service (e.g., "ssh-userauth").
    ServiceRequest = 5,
    /// Service accept - service request accepted.
    ServiceAccept = 6,

    // Algorithm negotiation (20-29)
    /// Key exchange init - algorithm negotiation.
    KexInit = 20,
    /// New keys - signals transition to new keys.
    NewKeys = 21,

    // Key exchange method specific (30-49)
    /// Diffie-Hellman/ECDH key exchange init (both use same message number).
    KexdhInit = 30,
    /// Diffie-Hellman/ECDH key exchange reply (both use same message number).
    KexdhReply = 31,

    // User authentication generic (50-79)
    /// User authentication request.
    UserauthRequest = 50,
    /// User authentication failure.
    UserauthFailure = 51,
    /// User authentication success.
    UserauthSuccess = 52,
    /// User authentication banner.
    UserauthBanner = 53,
    /// Public key OK (server accepts public key for authentication).
    UserauthPkOk = 60,

    // Connection protocol generic (80-127)
    /// Global request.
    GlobalRequest = 80,
    /// Request success.
    RequestSuccess = 81,
    /// Request failure.
    RequestFailure = 82,
    /// Channel open.
    ChannelOpen = 90,
    /// Channel open confirmation.
    ChannelOpenConfirmation = 91,
    /// Channel open failure.
    ChannelOpenFailure = 92,
    /// Channel window adjust.
    ChannelWindowAdjust = 93,
    /// Channel data.
    ChannelData = 94,
    /// Channel extended data (stderr).
    ChannelExtendedData = 95,
    /// Channel EOF.
    ChannelEof = 96,
    /// Channel close.
    ChannelClose = 97,
    /// Channel request.
    ChannelRequest = 98,
    /// Channel success.
    ChannelSuccess = 99,
    /// Channel failure.
    ChannelFailure = 100,
}

impl MessageType {
    /// Converts a byte to a message type.
    ///
    /// ```rust
    /// use fjord_proto::ssh::message::MessageType;
    ///
    /// assert_eq!(MessageType::from_u8(20), Some(MessageType::KexInit));
    /// assert_eq!(MessageType::from_u8(255), None);
    /// ```
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(MessageType::Disconnect),
            2 => Some(MessageType::Ignore),
            3 => Some(MessageType::Unimplemented),
            4 => Some(MessageType::Debug),
            5 => Some(MessageType::ServiceRequest),
            6 => Some(MessageType::ServiceAccept),
            20 => Some(MessageType::KexInit),
            21 => Some(MessageType::NewKeys),
            30 => Some(MessageType::KexdhInit),
            31 => Some(MessageType::KexdhReply),
            50 => Some(MessageType::UserauthRequest),
            51 => Some(MessageType::UserauthFailure),
            52 => Some(MessageType::UserauthSuccess),
            53 => Some(MessageType::UserauthBanner),
            60 => Some(MessageType::UserauthPkOk),
            80 => Some(MessageType::GlobalRequest),
            81 => Some(MessageType::RequestSuccess),
            82 => Some(MessageType::RequestFailure),
            90 => Some(MessageType::ChannelOpen),
            91 => Some(MessageType::ChannelOpenConfirmation),
            92 => Some(MessageType::ChannelOpenFailure),
            93 => Some(MessageType::ChannelWindowAdjust),
            94 => Some(MessageType::ChannelData),
            95 => Some(MessageType::ChannelExtendedData),
            96 => Some(MessageType::ChannelEof),
            97 => Some(MessageType::ChannelClose),
            98 => Some(MessageType::ChannelRequest),
            99 => Some(MessageType::ChannelSuccess),
            100 => Some(MessageType::ChannelFailure),
            _ => None,
        }
    }

    /// Returns true for opcodes owned by the negotiated key exchange method.
    pub fn is_kex_method(opcode: u8) -> bool {
        (KEX_METHOD_FIRST..=KEX_METHOD_LAST).contains(&opcode)
    }

    /// Returns true for transport-level opcodes that may be sent while a key
    /// exchange is in flight (everything below the user authentication range).
    pub fn is_transport(opcode: u8) -> bool {
        opcode < MessageType::UserauthRequest as u8
            && opcode != MessageType::ServiceRequest as u8
            && opcode != MessageType::ServiceAccept as u8
    }

    /// Returns the message type name.
    pub fn name(&self) -> &'static str {
        match self {
            MessageType::Disconnect => "SSH_MSG_DISCONNECT",
            MessageType::Ignore => "SSH_MSG_IGNORE",
            MessageType::Unimplemented => "SSH_MSG_UNIMPLEMENTED",
            MessageType::Debug => "SSH_MSG_DEBUG",
            MessageType::ServiceRequest => "SSH_MSG_SERVICE_REQUEST",
            MessageType::ServiceAccept => "SSH_MSG_SERVICE_ACCEPT",
            MessageType::KexInit => "SSH_MSG_KEXINIT",
            MessageType::NewKeys => "SSH_MSG_NEWKEYS",
            MessageType::KexdhInit => "SSH_MSG_KEXDH_INIT",
            MessageType::KexdhReply => "SSH_MSG_KEXDH_REPLY",
            MessageType::UserauthRequest => "SSH_MSG_USERAUTH_REQUEST",
            MessageType::UserauthFailure => "SSH_MSG_USERAUTH_FAILURE",
            MessageType::UserauthSuccess => "SSH_MSG_USERAUTH_SUCCESS",
            MessageType::UserauthBanner => "SSH_MSG_USERAUTH_BANNER",
            MessageType::UserauthPkOk => "SSH_MSG_USERAUTH_PK_OK",
            MessageType::GlobalRequest => "SSH_MSG_GLOBAL_REQUEST",
            MessageType::RequestSuccess => "SSH_MSG_REQUEST_SUCCESS",
            MessageType::RequestFailure => "SSH_MSG_REQUEST_FAILURE",
            MessageType::ChannelOpen => "SSH_MSG_CHANNEL_OPEN",
            MessageType::ChannelOpenConfirmation => "SSH_MSG_CHANNEL_OPEN_CONFIRMATION",
            MessageType::ChannelOpenFailure => "SSH_MSG_CHANNEL_OPEN_FAILURE",
            MessageType::ChannelWindowAdjust => "SSH_MSG_CHANNEL_WINDOW_ADJUST",
            MessageType::ChannelData => "SSH_MSG_CHANNEL_DATA",
            MessageType::ChannelExtendedData => "SSH_MSG_CHANNEL_EXTENDED_DATA",
            MessageType::ChannelEof => "SSH_MSG_CHANNEL_EOF",
            MessageType::ChannelClose => "SSH_MSG_CHANNEL_CLOSE",
            MessageType::ChannelRequest => "SSH_MSG_CHANNEL_REQUEST",
            MessageType::ChannelSuccess => "SSH_MSG_CHANNEL_SUCCESS",
            MessageType::ChannelFailure => "SSH_MSG_CHANNEL_FAILURE",
        }
    }

    /// Renders an arbitrary opcode for log and error messages.
    pub fn describe(opcode: u8) -> String {
        match Self::from_u8(opcode) {
            Some(t) => t.to_string(),
            None => format!("SSH_MSG_UNKNOWN({})", opcode),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}

/// Disconnect reason codes (RFC 4253 Section 11.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DisconnectReason {
    /// Host not allowed to connect
    HostNotAllowedToConnect = 1,
    /// Protocol error
    ProtocolError = 2,
    /// Key exchange failed
    KeyExchangeFailed = 3,
    /// Reserved
    Reserved = 4,
    /// MAC error
    MacError = 5,
    /// Compression error
    CompressionError = 6,
    /// Service not available
    ServiceNotAvailable = 7,
    /// Protocol version not supported
    ProtocolVersionNotSupported = 8,
    /// Host key not verifiable
    HostKeyNotVerifiable = 9,
    /// Connection lost
    ConnectionLost = 10,
    /// Disconnected by application
    ByApplication = 11,
    /// Too many connections
    TooManyConnections = 12,
    /// Auth cancelled by user
    AuthCancelledByUser = 13,
    /// No more auth methods available
    NoMoreAuthMethodsAvailable = 14,
    /// Illegal user name
    IllegalUserName = 15,
}

impl DisconnectReason {
    /// Converts from the wire value.
    pub fn from_u32(value: u32) -> Option<Self> {
        use DisconnectReason::*;
        Some(match value {
            1 => HostNotAllowedToConnect,
            2 => ProtocolError,
            3 => KeyExchangeFailed,
            4 => Reserved,
            5 => MacError,
            6 => CompressionError,
            7 => ServiceNotAvailable,
            8 => ProtocolVersionNotSupported,
            9 => HostKeyNotVerifiable,
            10 => ConnectionLost,
            11 => ByApplication,
            12 => TooManyConnections,
            13 => AuthCancelledByUser,
            14 => NoMoreAuthMethodsAvailable,
            15 => IllegalUserName,
            _ => return None,
        })
    }

    /// Returns the RFC name of the reason.
    pub fn as_str(&self) -> &'static str {
        use DisconnectReason::*;
        match self {
            HostNotAllowedToConnect => "host not allowed to connect",
            ProtocolError => "protocol error",
            KeyExchangeFailed => "key exchange failed",
            Reserved => "reserved",
            MacError => "MAC error",
            CompressionError => "compression error",
            ServiceNotAvailable => "service not available",
            ProtocolVersionNotSupported => "protocol version not supported",
            HostKeyNotVerifiable => "host key not verifiable",
            ConnectionLost => "connection lost",
            ByApplication => "by application",
            TooManyConnections => "too many connections",
            AuthCancelledByUser => "auth cancelled by user",
            NoMoreAuthMethodsAvailable => "no more auth methods available",
            IllegalUserName => "illegal user name",
        }
    }

    /// Picks the disconnect code that best describes a local failure.
    pub fn for_error(err: &FjordError) -> Self {
        match err {
            FjordError::Disconnect { reason, .. } => {
                Self::from_u32(*reason).unwrap_or(DisconnectReason::ProtocolError)
            }
            FjordError::Security(msg) => {
                let msg = msg.to_ascii_lowercase();
                if msg.contains("mac") {
                    DisconnectReason::MacError
                } else if msg.contains("host key") {
                    DisconnectReason::HostKeyNotVerifiable
                } else if msg.contains("auth") {
                    DisconnectReason::NoMoreAuthMethodsAvailable
                } else {
                    DisconnectReason::KeyExchangeFailed
                }
            }
            FjordError::Protocol(msg) if msg.contains("compress") => {
                DisconnectReason::CompressionError
            }
            FjordError::Protocol(msg) if msg.contains("version") => {
                DisconnectReason::ProtocolVersionNotSupported
            }
            FjordError::Io(_) => DisconnectReason::ConnectionLost,
            FjordError::Closed(_) | FjordError::Timeout(_) => DisconnectReason::ByApplication,
            _ => DisconnectReason::ProtocolError,
        }
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.as_str(), *self as u32)
    }
}

/// Channel open failure reason codes (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ChannelOpenFailureReason {
    /// Administratively prohibited
    AdministrativelyProhibited = 1,
    /// Connect failed
    ConnectFailed = 2,
    /// Unknown channel type
    UnknownChannelType = 3,
    /// Resource shortage
    ResourceShortage = 4,
}

impl ChannelOpenFailureReason {
    /// Converts from u32.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::AdministrativelyProhibited),
            2 => Some(Self::ConnectFailed),
            3 => Some(Self::UnknownChannelType),
            4 => Some(Self::ResourceShortage),
            _ => None,
        }
    }

    /// Returns the reason as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdministrativelyProhibited => "Administratively prohibited",
            Self::ConnectFailed => "Connect failed",
            Self::UnknownChannelType => "Unknown channel type",
            Self::ResourceShortage => "Resource shortage",
        }
    }

    /// Builds the error surfaced on a channel's open future.
    pub fn into_error(self, message: impl Into<String>) -> FjordError {
        FjordError::ChannelOpen {
            reason: self as u32,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::from_u8(20), Some(MessageType::KexInit));
        assert_eq!(MessageType::from_u8(21), Some(MessageType::NewKeys));
        assert_eq!(MessageType::from_u8(255), None);
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Disconnect as u8, 1);
        assert_eq!(MessageType::KexInit as u8, 20);
        assert_eq!(MessageType::ChannelData as u8, 94);
        assert_eq!(MessageType::ChannelFailure as u8, 100);
    }

    #[test]
    fn test_message_ranges() {
        assert!(MessageType::is_kex_method(30));
        assert!(MessageType::is_kex_method(49));
        assert!(!MessageType::is_kex_method(20));
        assert!(!MessageType::is_kex_method(50));

        assert!(MessageType::is_transport(MessageType::KexInit as u8));
        assert!(MessageType::is_transport(MessageType::Disconnect as u8));
        assert!(!MessageType::is_transport(MessageType::ServiceRequest as u8));
        assert!(!MessageType::is_transport(MessageType::ChannelData as u8));
    }

    #[test]
    fn test_message_type_display() {
        assert_eq!(format!("{}", MessageType::KexInit), "SSH_MSG_KEXINIT(20)");
        assert_eq!(MessageType::describe(200), "SSH_MSG_UNKNOWN(200)");
    }

    #[test]
    fn test_disconnect_reason_mapping() {
        for code in 1..=15 {
            let reason = DisconnectReason::from_u32(code).unwrap();
            assert_eq!(reason as u32, code);
        }
        assert_eq!(DisconnectReason::from_u32(16), None);

        let mac = FjordError::Security("MAC verification failed".into());
        assert_eq!(DisconnectReason::for_error(&mac), DisconnectReason::MacError);

        let proto = FjordError::Protocol("bad length".into());
        assert_eq!(
            DisconnectReason::for_error(&proto),
            DisconnectReason::ProtocolError
        );

        let hk = FjordError::Security("Server host key rejected".into());
        assert_eq!(
            DisconnectReason::for_error(&hk),
            DisconnectReason::HostKeyNotVerifiable
        );
    }

    #[test]
    fn test_open_failure_reason() {
        assert_eq!(
            ChannelOpenFailureReason::from_u32(2),
            Some(ChannelOpenFailureReason::ConnectFailed)
        );
        match ChannelOpenFailureReason::ResourceShortage.into_error("full") {
            FjordError::ChannelOpen { reason, message } => {
                assert_eq!(reason, 4);
                assert_eq!(message, "full");
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
