//! Server side X11 forwarding.
//!
//! On `x11-req` the server listens on the first free display port from
//! `localhost:10` up and returns the display name for `DISPLAY`. Every
//! connection to that port becomes an `x11` channel to the client.
//! No xauth entry is written; clients need an X server that accepts the
//! connection as is.

use crate::ssh::connection::messages::ChannelType;
use crate::ssh::forward::tunnel;
use crate::ssh::session::WeakSession;
use fjord_platform::{FjordError, FjordResult};
use std::sync::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// First TCP port of X11 displays.
pub const X11_BASE_PORT: u16 = 6000;
/// First display number handed out.
pub const X11_DISPLAY_OFFSET: u16 = 10;
/// Number of display numbers tried.
pub const X11_MAX_DISPLAYS: u16 = 1000;

struct Display {
    number: u16,
    task: JoinHandle<()>,
}

/// X11 display allocator of one session.
pub struct X11ForwardSupport {
    session: WeakSession,
    displays: Mutex<Vec<Display>>,
}

impl std::fmt::Debug for X11ForwardSupport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let numbers: Vec<u16> = self.displays().iter().map(|d| d.number).collect();
        f.debug_struct("X11ForwardSupport")
            .field("displays", &numbers)
            .finish()
    }
}

impl X11ForwardSupport {
    pub(crate) fn new(session: WeakSession) -> Self {
        Self {
            session,
            displays: Mutex::new(Vec::new()),
        }
    }

    fn displays(&self) -> std::sync::MutexGuard<'_, Vec<Display>> {
        self.displays
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Binds a display and returns its name (`localhost:N.screen`).
    pub(crate) fn create_display(
        &self,
        single_connection: bool,
        auth_protocol: &str,
        auth_cookie: &str,
        screen: u32,
    ) -> FjordResult<String> {
        debug!(
            "X11 request: single={}, protocol={}, cookie length={}",
            single_connection,
            auth_protocol,
            auth_cookie.len()
        );
        let (number, listener) = bind_display()?;
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        let task = tokio::spawn(accept_loop(listener, self.session.clone(), single_connection));
        self.displays().push(Display { number, task });
        let name = format!("localhost:{}.{}", number, screen);
        info!("X11 display {} ready", name);
        Ok(name)
    }

    /// Stops every display listener.
    pub fn close(&self) {
        for display in self.displays().drain(..) {
            display.task.abort();
        }
    }
}

impl Drop for X11ForwardSupport {
    fn drop(&mut self) {
        self.close();
    }
}

fn bind_display() -> FjordResult<(u16, std::net::TcpListener)> {
    for number in X11_DISPLAY_OFFSET..X11_DISPLAY_OFFSET + X11_MAX_DISPLAYS {
        match std::net::TcpListener::bind(("127.0.0.1", X11_BASE_PORT + number)) {
            Ok(listener) => return Ok((number, listener)),
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(FjordError::Io(std::io::Error::new(
        std::io::ErrorKind::AddrInUse,
        "No free X11 display",
    )))
}

async fn accept_loop(listener: TcpListener, session: WeakSession, single_connection: bool) {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("X11 accept failed: {}", e);
                return;
            }
        };
        let Some(handle) = session.upgrade() else {
            return;
        };
        let channel_type = ChannelType::X11 {
            originator_address: peer.ip().to_string(),
            originator_port: peer.port() as u32,
        };
        let tunnel = tokio::spawn(async move {
            match handle.open_channel_confirmed(channel_type).await {
                Ok(channel) => tunnel::bridge(channel.into_stream(), socket).await,
                Err(e) => debug!("Client refused X11 channel: {}", e),
            }
        });
        if single_connection {
            let _ = tunnel.await;
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_display_skips_used_ports() {
        let (first, _held) = bind_display().unwrap();
        let (second, _other) = bind_display().unwrap();
        assert!(first >= X11_DISPLAY_OFFSET);
        assert_ne!(first, second);
    }
}
