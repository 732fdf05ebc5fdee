//! Error types for Fjord

use std::fmt;

/// Unified error type for all Fjord operations
#[derive(Debug)]
pub enum FjordError {
    /// I/O error
    Io(std::io::Error),

    /// Configuration error
    Config(String),

    /// Protocol error (malformed frames, unexpected messages, window violations)
    Protocol(String),

    /// Security error (authentication, host key verification, MAC failures)
    Security(String),

    /// Not implemented
    NotImplemented(String),

    /// The transport was torn down with an SSH disconnect message.
    Disconnect {
        /// RFC 4253 reason code
        reason: u32,
        /// Human readable description sent (or received) with the disconnect
        message: String,
    },

    /// A channel open request was rejected by the peer or locally.
    ChannelOpen {
        /// RFC 4254 open failure reason code
        reason: u32,
        /// Description carried by the failure message
        message: String,
    },

    /// Operation is not valid in the current state
    IllegalState(String),

    /// A bounded wait elapsed
    Timeout(String),

    /// The resource (session, channel, forwarder) is already closed or closing
    Closed(String),

    /// Several independent failures, e.g. from a listener fan-out
    Aggregate(Vec<FjordError>),

    /// Other error
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl FjordError {
    /// Collapses a list of failures into a single result.
    ///
    /// No errors yields `Ok(())`, one error is returned as-is, several are
    /// wrapped in [`FjordError::Aggregate`] in the order they occurred.
    pub fn aggregate(mut errors: Vec<FjordError>) -> FjordResult<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(FjordError::Aggregate(errors)),
        }
    }

    /// Returns true if this error (or every member of an aggregate) is a timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            FjordError::Timeout(_) => true,
            FjordError::Aggregate(errs) => !errs.is_empty() && errs.iter().all(|e| e.is_timeout()),
            _ => false,
        }
    }
}

impl Clone for FjordError {
    fn clone(&self) -> Self {
        match self {
            FjordError::Io(e) => FjordError::Io(std::io::Error::new(e.kind(), e.to_string())),
            FjordError::Config(msg) => FjordError::Config(msg.clone()),
            FjordError::Protocol(msg) => FjordError::Protocol(msg.clone()),
            FjordError::Security(msg) => FjordError::Security(msg.clone()),
            FjordError::NotImplemented(msg) => FjordError::NotImplemented(msg.clone()),
            FjordError::Disconnect { reason, message } => FjordError::Disconnect {
                reason: *reason,
                message: message.clone(),
            },
            FjordError::ChannelOpen { reason, message } => FjordError::ChannelOpen {
                reason: *reason,
                message: message.clone(),
            },
            FjordError::IllegalState(msg) => FjordError::IllegalState(msg.clone()),
            FjordError::Timeout(msg) => FjordError::Timeout(msg.clone()),
            FjordError::Closed(msg) => FjordError::Closed(msg.clone()),
            FjordError::Aggregate(errs) => FjordError::Aggregate(errs.clone()),
            FjordError::Other(e) => FjordError::Other(e.to_string().into()),
        }
    }
}

impl fmt::Display for FjordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FjordError::Io(e) => write!(f, "IO error: {}", e),
            FjordError::Config(msg) => write!(f, "Configuration error: {}", msg),
            FjordError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            FjordError::Security(msg) => write!(f, "Security error: {}", msg),
            FjordError::NotImplemented(msg) => write!(f, "Not implemented: {}", msg),
            FjordError::Disconnect { reason, message } => {
                write!(f, "Disconnected (reason {}): {}", reason, message)
            }
            FjordError::ChannelOpen { reason, message } => {
                write!(f, "Channel open failed (reason {}): {}", reason, message)
            }
            FjordError::IllegalState(msg) => write!(f, "Illegal state: {}", msg),
            FjordError::Timeout(msg) => write!(f, "Timed out: {}", msg),
            FjordError::Closed(msg) => write!(f, "Closed: {}", msg),
            FjordError::Aggregate(errs) => {
                write!(f, "{} errors:", errs.len())?;
                for (i, e) in errs.iter().enumerate() {
                    write!(f, " [{}] {}", i + 1, e)?;
                }
                Ok(())
            }
            FjordError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for FjordError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FjordError::Io(e) => Some(e),
            FjordError::Aggregate(errs) => errs.first().map(|e| e as _),
            FjordError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for FjordError {
    fn from(err: std::io::Error) -> Self {
        FjordError::Io(err)
    }
}

impl From<FjordError> for std::io::Error {
    fn from(err: FjordError) -> Self {
        match err {
            FjordError::Io(e) => e,
            FjordError::Timeout(msg) => std::io::Error::new(std::io::ErrorKind::TimedOut, msg),
            FjordError::Closed(msg) => std::io::Error::new(std::io::ErrorKind::BrokenPipe, msg),
            other => std::io::Error::new(std::io::ErrorKind::Other, other.to_string()),
        }
    }
}

/// Result type for Fjord operations
pub type FjordResult<T> = Result<T, FjordError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FjordError::Config("Invalid configuration".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: Invalid configuration"
        );

        let err = FjordError::Disconnect {
            reason: 2,
            message: "bad packet".to_string(),
        };
        assert_eq!(err.to_string(), "Disconnected (reason 2): bad packet");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let fjord_err: FjordError = io_err.into();
        assert!(matches!(fjord_err, FjordError::Io(_)));

        let back: std::io::Error = FjordError::Timeout("open".into()).into();
        assert_eq!(back.kind(), std::io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_aggregate() {
        assert!(FjordError::aggregate(Vec::new()).is_ok());

        let single = FjordError::aggregate(vec![FjordError::Protocol("x".into())]);
        assert!(matches!(single, Err(FjordError::Protocol(_))));

        let many = FjordError::aggregate(vec![
            FjordError::Protocol("a".into()),
            FjordError::Config("b".into()),
        ]);
        match many {
            Err(FjordError::Aggregate(errs)) => assert_eq!(errs.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_clone_preserves_variant() {
        let err = FjordError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        match err.clone() {
            FjordError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::ConnectionReset),
            other => panic!("unexpected {:?}", other),
        }
        assert!(FjordError::Timeout("t".into()).clone().is_timeout());
    }
}
