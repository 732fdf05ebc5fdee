//! Bridging channels to sockets.

use super::types::ForwardAddr;
use crate::ssh::channel::stream::{ChannelReader, ChannelStream, ChannelWriter};
use crate::ssh::channel::window::RemoteWindow;
use crate::ssh::channel::ChannelEvent;
use crate::ssh::session::handle::Msg;
use crate::ssh::session::SessionHandle;
use fjord_platform::FjordResult;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Local endpoint of a peer opened channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TunnelTarget {
    Tcp(ForwardAddr),
    Unix(PathBuf),
}

trait Socket: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Socket for T {}

async fn connect(target: &TunnelTarget) -> FjordResult<Box<dyn Socket>> {
    match target {
        TunnelTarget::Tcp(address) => {
            let stream = TcpStream::connect((address.host.as_str(), address.port)).await?;
            // latency matters more than throughput for interactive tunnels
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        TunnelTarget::Unix(path) => Ok(Box::new(tokio::net::UnixStream::connect(path).await?)),
        #[cfg(not(unix))]
        TunnelTarget::Unix(path) => Err(fjord_platform::FjordError::NotImplemented(format!(
            "Unix socket {} not supported on this platform",
            path.display()
        ))),
    }
}

/// Copies both ways until both sides are done, then closes the channel.
pub(crate) async fn bridge<S>(mut channel: ChannelStream, mut socket: S)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let id = channel.id();
    match tokio::io::copy_bidirectional(&mut socket, &mut channel).await {
        Ok((up, down)) => debug!("Channel {} tunnel done: {} bytes up, {} bytes down", id, up, down),
        Err(e) => debug!("Channel {} tunnel ended: {}", id, e),
    }
    channel.close();
}

/// Connects a peer opened channel to `target` and bridges it.
///
/// The session loop confirms or rejects the open once the connect outcome
/// arrives.
pub(crate) fn spawn_inbound(
    session: SessionHandle,
    id: u32,
    target: TunnelTarget,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    remote: Arc<RemoteWindow>,
) {
    tokio::spawn(async move {
        let socket = match connect(&target).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!("Channel {}: cannot connect to {:?}: {}", id, target, e);
                let _ = session.send(Msg::ChannelOpenResult {
                    id,
                    result: Err(e),
                });
                return;
            }
        };
        if session
            .send(Msg::ChannelOpenResult { id, result: Ok(()) })
            .is_err()
        {
            return;
        }
        debug!("Channel {} connected to {:?}", id, target);
        let reader = ChannelReader::new(id, session.clone(), events);
        let writer = ChannelWriter::new(id, session, remote, None);
        bridge(ChannelStream::new(reader, writer), socket).await;
    });
}
