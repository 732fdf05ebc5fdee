//! Addresses used by port forwarding.

use fjord_platform::{FjordError, FjordResult};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Host and port of a forwarding endpoint.
///
/// The host may be a name, an IP address, or empty / `0.0.0.0` / `::` for
/// "all interfaces".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ForwardAddr {
    /// Host or IP address
    pub host: String,
    /// Port number, 0 for "pick one"
    pub port: u16,
}

impl ForwardAddr {
    /// Creates a new forward address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Converts to a socket address if the host is an IP address.
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        self.host
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, self.port))
    }

    /// True for the "all interfaces" spellings.
    pub fn is_wildcard(&self) -> bool {
        matches!(self.host.as_str(), "" | "*" | "0.0.0.0" | "::")
    }

    /// Address to hand to a socket bind.
    pub(crate) fn bind_host(&self) -> &str {
        match self.host.as_str() {
            "" | "*" => "0.0.0.0",
            "localhost" => "127.0.0.1",
            host => host,
        }
    }
}

impl fmt::Display for ForwardAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl From<SocketAddr> for ForwardAddr {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

/// Parses a forward address from a string.
///
/// Accepts formats:
/// - "host:port" - e.g., "localhost:8080"
/// - "[host]:port" - e.g., "[::1]:8080" for IPv6
///
/// # Example
///
/// ```rust
/// use fjord_proto::ssh::forward::types::parse_forward_addr;
///
/// let addr = parse_forward_addr("localhost:8080").unwrap();
/// assert_eq!(addr.host, "localhost");
/// assert_eq!(addr.port, 8080);
///
/// let addr = parse_forward_addr("[::1]:22").unwrap();
/// assert_eq!(addr.host, "::1");
/// ```
pub fn parse_forward_addr(addr: &str) -> FjordResult<ForwardAddr> {
    if let Some(rest) = addr.strip_prefix('[') {
        let end = rest.find(']').ok_or_else(|| {
            FjordError::Config(format!("Invalid IPv6 address: missing ']': {}", addr))
        })?;
        let host = rest[..end].to_string();
        let port = rest[end + 1..].strip_prefix(':').ok_or_else(|| {
            FjordError::Config(format!(
                "Invalid address format: missing ':' after ']': {}",
                addr
            ))
        })?;
        return Ok(ForwardAddr::new(host, parse_port(port)?));
    }

    let (host, port) = addr.rsplit_once(':').ok_or_else(|| {
        FjordError::Config(format!(
            "Invalid address format: expected 'host:port', got '{}'",
            addr
        ))
    })?;
    Ok(ForwardAddr::new(host, parse_port(port)?))
}

fn parse_port(port: &str) -> FjordResult<u16> {
    port.parse::<u16>()
        .map_err(|_| FjordError::Config(format!("Invalid port number: {}", port)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_localhost() {
        let addr = parse_forward_addr("localhost:8080").unwrap();
        assert_eq!(addr.host, "localhost");
        assert_eq!(addr.port, 8080);
    }

    #[test]
    fn test_parse_ipv6() {
        let addr = parse_forward_addr("[2001:db8::1]:22").unwrap();
        assert_eq!(addr.host, "2001:db8::1");
        assert_eq!(addr.port, 22);
        assert_eq!(addr.to_string(), "[2001:db8::1]:22");
    }

    #[test]
    fn test_parse_invalid() {
        assert!(parse_forward_addr("localhost").is_err());
        assert!(parse_forward_addr("localhost:99999").is_err());
        assert!(parse_forward_addr("[::1]8080").is_err());
    }

    #[test]
    fn test_wildcard_and_bind_host() {
        let any = ForwardAddr::new("", 0);
        assert!(any.is_wildcard());
        assert_eq!(any.bind_host(), "0.0.0.0");
        let local = ForwardAddr::new("localhost", 22);
        assert!(!local.is_wildcard());
        assert_eq!(local.bind_host(), "127.0.0.1");
        assert!(local.to_socket_addr().is_none());
        assert_eq!(
            ForwardAddr::new("127.0.0.1", 22).to_socket_addr(),
            Some("127.0.0.1:22".parse().unwrap())
        );
    }
}
