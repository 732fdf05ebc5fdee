//! SOCKS4, SOCKS4a and SOCKS5 (no authentication, CONNECT only) handshakes
//! for dynamic forwarding.

use super::types::ForwardAddr;
use fjord_platform::{FjordError, FjordResult};
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

const SOCKS4_GRANTED: u8 = 0x5a;
const SOCKS4_REJECTED: u8 = 0x5b;
const SOCKS5_SUCCEEDED: u8 = 0x00;
const SOCKS5_GENERAL_FAILURE: u8 = 0x01;
const SOCKS5_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const MAX_FIELD: usize = 255;

/// Protocol version spoken by a SOCKS client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SocksVersion {
    V4,
    V5,
}

/// Reads the client's greeting and CONNECT request.
pub(crate) async fn handshake<S>(stream: &mut S) -> FjordResult<(SocksVersion, ForwardAddr)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = stream.read_u8().await?;
    match version {
        4 => {
            let target = socks4_request(stream).await?;
            Ok((SocksVersion::V4, target))
        }
        5 => {
            let target = socks5_request(stream).await?;
            Ok((SocksVersion::V5, target))
        }
        other => Err(FjordError::Protocol(format!(
            "Invalid SOCKS version: {}",
            other
        ))),
    }
}

async fn read_cstring<S: AsyncRead + Unpin>(stream: &mut S) -> FjordResult<String> {
    let mut out = Vec::new();
    loop {
        let b = stream.read_u8().await?;
        if b == 0 {
            break;
        }
        if out.len() == MAX_FIELD {
            return Err(FjordError::Protocol("SOCKS4 field too long".to_string()));
        }
        out.push(b);
    }
    String::from_utf8(out).map_err(|_| FjordError::Protocol("SOCKS4 field is not UTF-8".to_string()))
}

async fn socks4_request<S>(stream: &mut S) -> FjordResult<ForwardAddr>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let command = stream.read_u8().await?;
    let port = stream.read_u16().await?;
    let mut ip = [0u8; 4];
    stream.read_exact(&mut ip).await?;
    let _user = read_cstring(stream).await?;
    if command != 1 {
        reply(stream, SocksVersion::V4, false).await?;
        return Err(FjordError::Protocol(format!(
            "Unsupported SOCKS4 command: {}",
            command
        )));
    }
    // 0.0.0.x with x != 0 announces a SOCKS4a host name
    let host = if ip[..3] == [0, 0, 0] && ip[3] != 0 {
        read_cstring(stream).await?
    } else {
        Ipv4Addr::from(ip).to_string()
    };
    debug!("SOCKS4 request: {}:{}", host, port);
    Ok(ForwardAddr::new(host, port))
}

async fn socks5_request<S>(stream: &mut S) -> FjordResult<ForwardAddr>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let nmethods = stream.read_u8().await? as usize;
    if nmethods == 0 {
        return Err(FjordError::Protocol(
            "No authentication methods provided".to_string(),
        ));
    }
    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&0) {
        // no acceptable methods
        stream.write_all(&[5, 0xff]).await?;
        return Err(FjordError::Protocol(
            "SOCKS5 client does not offer 'no authentication'".to_string(),
        ));
    }
    stream.write_all(&[5, 0]).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != 5 {
        return Err(FjordError::Protocol(
            "Invalid SOCKS version in request".to_string(),
        ));
    }
    let host = match head[3] {
        1 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            Ipv4Addr::from(ip).to_string()
        }
        3 => {
            let len = stream.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).to_string()
        }
        4 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            Ipv6Addr::from(ip).to_string()
        }
        other => {
            return Err(FjordError::Protocol(format!(
                "Invalid address type: {}",
                other
            )))
        }
    };
    let port = stream.read_u16().await?;
    if head[1] != 1 {
        write_socks5_status(stream, SOCKS5_COMMAND_NOT_SUPPORTED).await?;
        return Err(FjordError::Protocol(format!(
            "Unsupported SOCKS command: {} (only CONNECT supported)",
            head[1]
        )));
    }
    debug!("SOCKS5 request: {}:{}", host, port);
    Ok(ForwardAddr::new(host, port))
}

async fn write_socks5_status<S: AsyncWrite + Unpin>(stream: &mut S, status: u8) -> FjordResult<()> {
    // version, status, reserved, IPv4, bound address 0.0.0.0, bound port 0
    stream
        .write_all(&[5, status, 0, 1, 0, 0, 0, 0, 0, 0])
        .await?;
    Ok(())
}

/// Answers the CONNECT request.
pub(crate) async fn reply<S>(stream: &mut S, version: SocksVersion, success: bool) -> FjordResult<()>
where
    S: AsyncWrite + Unpin,
{
    match version {
        SocksVersion::V4 => {
            let status = if success { SOCKS4_GRANTED } else { SOCKS4_REJECTED };
            stream.write_all(&[0, status, 0, 0, 0, 0, 0, 0]).await?;
        }
        SocksVersion::V5 => {
            let status = if success {
                SOCKS5_SUCCEEDED
            } else {
                SOCKS5_GENERAL_FAILURE
            };
            write_socks5_status(stream, status).await?;
        }
    }
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_socks5_domain_connect() {
        let (mut client, mut server) = duplex(256);
        let task = tokio::spawn(async move { handshake(&mut server).await });

        client.write_all(&[5, 1, 0]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [5, 0]);

        let mut request = vec![5, 1, 0, 3, 11];
        request.extend_from_slice(b"example.com");
        request.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let (version, target) = task.await.unwrap().unwrap();
        assert_eq!(version, SocksVersion::V5);
        assert_eq!(target, ForwardAddr::new("example.com", 443));
    }

    #[tokio::test]
    async fn test_socks5_ipv6_and_reply() {
        let (mut client, mut server) = duplex(256);
        let task = tokio::spawn(async move {
            let result = handshake(&mut server).await;
            reply(&mut server, SocksVersion::V5, true).await.unwrap();
            result
        });
        client.write_all(&[5, 1, 0]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        let mut request = vec![5, 1, 0, 4];
        request.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        request.extend_from_slice(&22u16.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut answer = [0u8; 10];
        client.read_exact(&mut answer).await.unwrap();
        assert_eq!(answer[..2], [5, 0]);
        let (_, target) = task.await.unwrap().unwrap();
        assert_eq!(target, ForwardAddr::new("::1", 22));
    }

    #[tokio::test]
    async fn test_socks4a_host_name() {
        let (mut client, mut server) = duplex(256);
        let task = tokio::spawn(async move { handshake(&mut server).await });
        let mut request = vec![4, 1];
        request.extend_from_slice(&8080u16.to_be_bytes());
        request.extend_from_slice(&[0, 0, 0, 1]);
        request.extend_from_slice(b"user\0db.internal\0");
        client.write_all(&request).await.unwrap();

        let (version, target) = task.await.unwrap().unwrap();
        assert_eq!(version, SocksVersion::V4);
        assert_eq!(target, ForwardAddr::new("db.internal", 8080));
    }

    #[tokio::test]
    async fn test_socks4_ipv4() {
        let (mut client, mut server) = duplex(256);
        let task = tokio::spawn(async move { handshake(&mut server).await });
        let mut request = vec![4, 1];
        request.extend_from_slice(&22u16.to_be_bytes());
        request.extend_from_slice(&[10, 0, 0, 5]);
        request.push(0);
        client.write_all(&request).await.unwrap();
        let (_, target) = task.await.unwrap().unwrap();
        assert_eq!(target, ForwardAddr::new("10.0.0.5", 22));
    }

    #[tokio::test]
    async fn test_bad_version() {
        let (mut client, mut server) = duplex(16);
        client.write_all(&[6]).await.unwrap();
        assert!(handshake(&mut server).await.is_err());
    }
}
