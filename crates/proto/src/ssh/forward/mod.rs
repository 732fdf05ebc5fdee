//! TCP/IP port forwarding.
//!
//! Each session has one [`TcpipForwarder`], created on first use through
//! [`SessionHandle::forwarder`]. It manages three kinds of tunnels:
//!
//! - **Local**: binds a local port; each accepted connection becomes a
//!   `direct-tcpip` channel to a fixed remote target.
//! - **Remote**: asks the peer (`tcpip-forward`) to listen; connections the
//!   peer accepts arrive as `forwarded-tcpip` channels and are bridged to a
//!   local target.
//! - **Dynamic**: binds a local SOCKS4/5 proxy; the target of each
//!   `direct-tcpip` channel comes from the SOCKS handshake.
//!
//! On the server side the same forwarder serves the client's
//! `tcpip-forward` requests.
//!
//! # Example
//!
//! ```rust,no_run
//! use fjord_proto::ssh::forward::types::ForwardAddr;
//! # async fn demo(session: fjord_proto::ssh::session::SessionHandle) -> fjord_platform::FjordResult<()> {
//! let forwarder = session.forwarder();
//! let bound = forwarder
//!     .start_local_port_forwarding(
//!         ForwardAddr::new("127.0.0.1", 0),
//!         ForwardAddr::new("10.0.0.5", 22),
//!     )
//!     .await?;
//! println!("listening on {}", bound);
//! # Ok(())
//! # }
//! ```
//!
//! [`SessionHandle::forwarder`]: crate::ssh::session::SessionHandle::forwarder

pub mod agent;
pub mod filter;
pub mod listener;
pub(crate) mod socks;
pub(crate) mod tunnel;
pub mod types;
pub mod x11;

use crate::ssh::buffer::SshReader;
use crate::ssh::config::RoleConfig;
use crate::ssh::connection::messages::{ChannelType, GlobalRequestType};
use crate::ssh::session::{SessionHandle, WeakSession};
use fjord_platform::{FjordError, FjordResult};
use listener::{ForwardingKind, ListenerRegistry, TunnelEvent};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use types::ForwardAddr;

/// Accept loop of one bound port.
#[derive(Debug)]
struct Acceptor {
    bound: ForwardAddr,
    task: JoinHandle<()>,
}

impl Acceptor {
    fn stop(&self) {
        self.task.abort();
    }
}

/// A port the server listens on for the client.
#[derive(Debug)]
struct LocalForwardingEntry {
    requested: ForwardAddr,
    acceptor: Acceptor,
}

impl LocalForwardingEntry {
    /// Matches the requested or the bound host, and the bound port, or the
    /// requested one when it was not 0. Host comparison is case sensitive.
    fn is_for(&self, address: &ForwardAddr) -> bool {
        let host = self.requested.host == address.host || self.acceptor.bound.host == address.host;
        let port = self.acceptor.bound.port == address.port
            || (self.requested.port != 0 && self.requested.port == address.port);
        host && port
    }
}

#[derive(Debug)]
struct RemoteEntry {
    requested: ForwardAddr,
    local: ForwardAddr,
}

#[derive(Debug, Default)]
struct ForwardMaps {
    local_to_remote: HashMap<u16, (ForwardAddr, Acceptor)>,
    remote_to_local: HashMap<u16, RemoteEntry>,
    dynamic: HashMap<u16, Acceptor>,
    local_forwards: Vec<LocalForwardingEntry>,
}

/// Port forwarding manager of one session.
pub struct TcpipForwarder {
    session: WeakSession,
    forward_request_timeout: Duration,
    events: ListenerRegistry,
    maps: Mutex<ForwardMaps>,
    bind_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for TcpipForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpipForwarder")
            .field("session", &self.session)
            .field("maps", &*self.maps())
            .finish()
    }
}

async fn bind(address: &ForwardAddr) -> FjordResult<(TcpListener, ForwardAddr)> {
    let listener = TcpListener::bind((address.bind_host(), address.port)).await?;
    let bound = ForwardAddr::from(listener.local_addr()?);
    Ok((listener, bound))
}

fn originator(socket: &TcpStream) -> (String, u32) {
    socket
        .peer_addr()
        .map(|a| (a.ip().to_string(), a.port() as u32))
        .unwrap_or_else(|_| ("0.0.0.0".to_string(), 0))
}

fn multiple_bindings(port: u16) -> FjordError {
    FjordError::IllegalState(format!(
        "Multiple local port forwarding bindings on port {}",
        port
    ))
}

impl TcpipForwarder {
    pub(crate) fn new(session: WeakSession, config: &RoleConfig) -> Self {
        Self {
            session,
            forward_request_timeout: config.ssh().forward_request_timeout,
            events: ListenerRegistry::default(),
            maps: Mutex::new(ForwardMaps::default()),
            bind_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn maps(&self) -> MutexGuard<'_, ForwardMaps> {
        self.maps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Listener registry for tunnel lifecycle events.
    pub fn events(&self) -> &ListenerRegistry {
        &self.events
    }

    /// Bound local ports of local and dynamic tunnels.
    pub fn bound_addresses(&self) -> Vec<ForwardAddr> {
        let maps = self.maps();
        maps.local_to_remote
            .values()
            .map(|(_, a)| a.bound.clone())
            .chain(maps.dynamic.values().map(|a| a.bound.clone()))
            .chain(maps.local_forwards.iter().map(|e| e.acceptor.bound.clone()))
            .collect()
    }

    fn session(&self) -> FjordResult<SessionHandle> {
        self.session.handle()
    }

    /// Emits `Established` after a bind attempt. On failure the bind error
    /// and any listener errors are returned together.
    fn established(
        &self,
        kind: ForwardingKind,
        local: &ForwardAddr,
        remote: Option<&ForwardAddr>,
        outcome: &FjordResult<ForwardAddr>,
    ) -> FjordResult<()> {
        self.events.notify(&TunnelEvent::Established {
            kind,
            local: local.clone(),
            remote: remote.cloned(),
            bound: outcome.as_ref().ok().cloned(),
            error: outcome.as_ref().err().map(ToString::to_string),
        })
    }

    fn establishing(&self, kind: ForwardingKind, local: &ForwardAddr, remote: Option<&ForwardAddr>) -> FjordResult<()> {
        self.events.notify(&TunnelEvent::Establishing {
            kind,
            local: local.clone(),
            remote: remote.cloned(),
        })
    }

    /// Tearing down, unbind, torn down; every failure is reported.
    fn tear_down<F>(&self, kind: ForwardingKind, address: &ForwardAddr, unbind: F) -> FjordResult<()>
    where
        F: FnOnce() -> FjordResult<()>,
    {
        let mut errors = Vec::new();
        if let Err(e) = self.events.notify(&TunnelEvent::TearingDown {
            kind,
            address: address.clone(),
        }) {
            errors.push(e);
        }
        let unbound = unbind();
        if let Err(e) = self.events.notify(&TunnelEvent::TornDown {
            kind,
            address: address.clone(),
            error: unbound.as_ref().err().map(ToString::to_string),
        }) {
            errors.push(e);
        }
        if let Err(e) = unbound {
            errors.insert(0, e);
        }
        FjordError::aggregate(errors)
    }

    /// Starts forwarding connections on `local` to `remote` through the
    /// peer. Returns the bound address.
    ///
    /// Starting the same mapping twice returns the existing binding; a
    /// different target on an already bound port fails and leaves the
    /// existing binding alone.
    pub async fn start_local_port_forwarding(
        &self,
        local: ForwardAddr,
        remote: ForwardAddr,
    ) -> FjordResult<ForwardAddr> {
        let _guard = self.bind_lock.lock().await;
        if local.port != 0 {
            let maps = self.maps();
            if let Some((target, acceptor)) = maps.local_to_remote.get(&local.port) {
                if *target == remote {
                    return Ok(acceptor.bound.clone());
                }
                return Err(multiple_bindings(local.port));
            }
            if maps.dynamic.contains_key(&local.port) {
                return Err(multiple_bindings(local.port));
            }
        }
        self.session()?;
        self.establishing(ForwardingKind::Local, &local, Some(&remote))?;

        let outcome = bind(&local).await;
        let result = outcome.as_ref().map(|(_, b)| b.clone()).map_err(FjordError::clone);
        let notified = self.established(ForwardingKind::Local, &local, Some(&remote), &result);
        let (listener, bound) = match (outcome, notified) {
            (Ok(ok), Ok(())) => ok,
            (Ok(_), Err(e)) => return Err(e),
            (Err(e), Ok(())) => return Err(e),
            (Err(e), Err(listener_error)) => {
                return Err(FjordError::Aggregate(vec![e, listener_error]))
            }
        };

        let task = tokio::spawn(run_local_acceptor(
            listener,
            self.session.clone(),
            remote.clone(),
        ));
        info!("Local forwarding {} -> {}", bound, remote);
        self.maps().local_to_remote.insert(
            bound.port,
            (
                remote,
                Acceptor {
                    bound: bound.clone(),
                    task,
                },
            ),
        );
        Ok(bound)
    }

    /// Stops a local tunnel by its bound address.
    pub async fn stop_local_port_forwarding(&self, bound: &ForwardAddr) -> FjordResult<()> {
        let _guard = self.bind_lock.lock().await;
        let Some((_, acceptor)) = self.maps().local_to_remote.remove(&bound.port) else {
            debug!("No local forwarding on {}", bound);
            return Ok(());
        };
        self.tear_down(ForwardingKind::Local, &acceptor.bound, || {
            acceptor.stop();
            Ok(())
        })
    }

    /// Asks the peer to listen on `remote` and forward connections to
    /// `local`. Returns the address the peer bound.
    pub async fn start_remote_port_forwarding(
        &self,
        remote: ForwardAddr,
        local: ForwardAddr,
    ) -> FjordResult<ForwardAddr> {
        let _guard = self.bind_lock.lock().await;
        if remote.port != 0 && self.maps().remote_to_local.contains_key(&remote.port) {
            return Err(FjordError::IllegalState(format!(
                "Remote port {} already forwarded",
                remote.port
            )));
        }
        let session = self.session()?;
        self.establishing(ForwardingKind::Remote, &local, Some(&remote))?;

        let reply = session
            .global_request(
                GlobalRequestType::TcpipForward {
                    address: remote.host.clone(),
                    port: remote.port as u32,
                },
                true,
            )
            .verify(Some(self.forward_request_timeout))
            .await;
        let result = match reply {
            Ok(Some(data)) if remote.port == 0 => SshReader::new(data)
                .get_u32()
                .and_then(|p| {
                    u16::try_from(p)
                        .map_err(|_| FjordError::Protocol(format!("Invalid bound port {}", p)))
                })
                .map(|port| ForwardAddr::new(remote.host.clone(), port)),
            Ok(Some(_)) => Ok(remote.clone()),
            Ok(None) => Err(FjordError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("Failed to setup remote port forwarding to {}", remote),
            ))),
            Err(e) => Err(e),
        };
        let notified = self.established(ForwardingKind::Remote, &local, Some(&remote), &result);
        let bound = match (result, notified) {
            (Ok(bound), Ok(())) => bound,
            (Ok(_), Err(e)) | (Err(e), Ok(())) => return Err(e),
            (Err(e), Err(listener_error)) => {
                return Err(FjordError::Aggregate(vec![e, listener_error]))
            }
        };
        info!("Remote forwarding {} -> {}", bound, local);
        self.maps().remote_to_local.insert(
            bound.port,
            RemoteEntry {
                requested: remote,
                local,
            },
        );
        Ok(bound)
    }

    /// Cancels a remote tunnel by the address the peer bound.
    pub async fn stop_remote_port_forwarding(&self, bound: &ForwardAddr) -> FjordResult<()> {
        let _guard = self.bind_lock.lock().await;
        let Some(entry) = self.maps().remote_to_local.remove(&bound.port) else {
            debug!("No remote forwarding on {}", bound);
            return Ok(());
        };
        let session = self.session()?;
        let reply = session.global_request(
            GlobalRequestType::CancelTcpipForward {
                address: entry.requested.host.clone(),
                port: bound.port as u32,
            },
            true,
        );
        let outcome = reply.verify(Some(self.forward_request_timeout)).await;
        self.tear_down(ForwardingKind::Remote, bound, || match outcome {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(FjordError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("Peer refused to cancel remote forwarding on {}", bound),
            ))),
            Err(e) => Err(e),
        })
    }

    /// Starts a SOCKS proxy on `local`. Returns the bound address.
    pub async fn start_dynamic_port_forwarding(&self, local: ForwardAddr) -> FjordResult<ForwardAddr> {
        let _guard = self.bind_lock.lock().await;
        if local.port != 0 {
            let maps = self.maps();
            if maps.dynamic.contains_key(&local.port) || maps.local_to_remote.contains_key(&local.port) {
                return Err(multiple_bindings(local.port));
            }
        }
        self.session()?;
        self.establishing(ForwardingKind::Dynamic, &local, None)?;

        let outcome = bind(&local).await;
        let result = outcome.as_ref().map(|(_, b)| b.clone()).map_err(FjordError::clone);
        let notified = self.established(ForwardingKind::Dynamic, &local, None, &result);
        let (listener, bound) = match (outcome, notified) {
            (Ok(ok), Ok(())) => ok,
            (Ok(_), Err(e)) | (Err(e), Ok(())) => return Err(e),
            (Err(e), Err(listener_error)) => {
                return Err(FjordError::Aggregate(vec![e, listener_error]))
            }
        };
        let task = tokio::spawn(run_dynamic_acceptor(listener, self.session.clone()));
        info!("SOCKS proxy on {}", bound);
        self.maps().dynamic.insert(
            bound.port,
            Acceptor {
                bound: bound.clone(),
                task,
            },
        );
        Ok(bound)
    }

    /// Stops a SOCKS proxy by its bound address.
    pub async fn stop_dynamic_port_forwarding(&self, bound: &ForwardAddr) -> FjordResult<()> {
        let _guard = self.bind_lock.lock().await;
        let Some(acceptor) = self.maps().dynamic.remove(&bound.port) else {
            debug!("No dynamic forwarding on {}", bound);
            return Ok(());
        };
        self.tear_down(ForwardingKind::Dynamic, &acceptor.bound, || {
            acceptor.stop();
            Ok(())
        })
    }

    /// Server side of `tcpip-forward`: listens on `local` for the client.
    pub(crate) async fn local_port_forwarding_requested(&self, local: ForwardAddr) -> FjordResult<ForwardAddr> {
        let _guard = self.bind_lock.lock().await;
        if let Some(existing) = self.maps().local_forwards.iter().find(|e| e.is_for(&local)) {
            if local.port != 0 {
                return Err(multiple_bindings(existing.acceptor.bound.port));
            }
        }
        self.session()?;
        self.establishing(ForwardingKind::Remote, &local, None)?;

        let outcome = bind(&local).await;
        let result = outcome.as_ref().map(|(_, b)| b.clone()).map_err(FjordError::clone);
        let notified = self.established(ForwardingKind::Remote, &local, None, &result);
        let (listener, bound) = match (outcome, notified) {
            (Ok(ok), Ok(())) => ok,
            (Ok(_), Err(e)) | (Err(e), Ok(())) => return Err(e),
            // report the listener failure alongside the bind failure
            (Err(e), Err(listener_error)) => {
                return Err(FjordError::Aggregate(vec![e, listener_error]))
            }
        };
        let task = tokio::spawn(run_forwarded_acceptor(
            listener,
            self.session.clone(),
            local.host.clone(),
        ));
        info!("Listening on {} for the client", bound);
        self.maps().local_forwards.push(LocalForwardingEntry {
            requested: local,
            acceptor: Acceptor {
                bound: bound.clone(),
                task,
            },
        });
        Ok(bound)
    }

    /// Server side of `cancel-tcpip-forward`.
    pub(crate) async fn local_port_forwarding_cancelled(&self, local: &ForwardAddr) -> FjordResult<()> {
        let _guard = self.bind_lock.lock().await;
        let entry = {
            let mut maps = self.maps();
            let index = maps.local_forwards.iter().position(|e| e.is_for(local));
            index.map(|i| maps.local_forwards.remove(i))
        };
        let Some(entry) = entry else {
            return Err(FjordError::IllegalState(format!(
                "No local port forwarding on {}",
                local
            )));
        };
        self.tear_down(ForwardingKind::Remote, &entry.acceptor.bound, || {
            entry.acceptor.stop();
            Ok(())
        })
    }

    /// Local target for a `forwarded-tcpip` channel the peer opened.
    pub(crate) fn remote_target(&self, address: &str, port: u32) -> Option<ForwardAddr> {
        let port = u16::try_from(port).ok()?;
        let maps = self.maps();
        let entry = maps.remote_to_local.get(&port)?;
        if entry.requested.host != address && !entry.requested.is_wildcard() {
            debug!(
                "Forwarded connection for {} matched binding {} by port",
                address, entry.requested
            );
        }
        Some(entry.local.clone())
    }

    /// Stops every tunnel, emitting teardown events.
    pub async fn close(&self) -> FjordResult<()> {
        let (local, dynamic, forwards) = {
            let mut maps = self.maps();
            (
                maps.local_to_remote.drain().map(|(_, (_, a))| a).collect::<Vec<_>>(),
                maps.dynamic.drain().map(|(_, a)| a).collect::<Vec<_>>(),
                maps.local_forwards.drain(..).collect::<Vec<_>>(),
            )
        };
        let mut errors = Vec::new();
        for acceptor in local {
            if let Err(e) = self.tear_down(ForwardingKind::Local, &acceptor.bound, || {
                acceptor.stop();
                Ok(())
            }) {
                errors.push(e);
            }
        }
        for acceptor in dynamic {
            if let Err(e) = self.tear_down(ForwardingKind::Dynamic, &acceptor.bound, || {
                acceptor.stop();
                Ok(())
            }) {
                errors.push(e);
            }
        }
        for entry in forwards {
            if let Err(e) = self.tear_down(ForwardingKind::Remote, &entry.acceptor.bound, || {
                entry.acceptor.stop();
                Ok(())
            }) {
                errors.push(e);
            }
        }
        let remotes: Vec<ForwardAddr> = self
            .maps()
            .remote_to_local
            .drain()
            .map(|(port, e)| ForwardAddr::new(e.requested.host, port))
            .collect();
        for bound in remotes {
            if let Err(e) = self.tear_down(ForwardingKind::Remote, &bound, || Ok(())) {
                errors.push(e);
            }
        }
        FjordError::aggregate(errors)
    }

    /// Stops every acceptor without events; used when the session ends.
    pub(crate) fn abort(&self) {
        let mut maps = self.maps();
        for (_, (_, acceptor)) in maps.local_to_remote.drain() {
            acceptor.stop();
        }
        for (_, acceptor) in maps.dynamic.drain() {
            acceptor.stop();
        }
        for entry in maps.local_forwards.drain(..) {
            entry.acceptor.stop();
        }
        maps.remote_to_local.clear();
    }
}

async fn run_local_acceptor(listener: TcpListener, session: WeakSession, target: ForwardAddr) {
    loop {
        let socket = match listener.accept().await {
            Ok((socket, _)) => socket,
            Err(e) => {
                warn!("Local forwarding accept failed: {}", e);
                return;
            }
        };
        let Some(handle) = session.upgrade() else {
            return;
        };
        let target = target.clone();
        tokio::spawn(async move {
            let (originator_address, originator_port) = originator(&socket);
            let channel_type = ChannelType::DirectTcpip {
                host: target.host.clone(),
                port: target.port as u32,
                originator_address,
                originator_port,
            };
            match handle.open_channel_confirmed(channel_type).await {
                Ok(channel) => tunnel::bridge(channel.into_stream(), socket).await,
                Err(e) => warn!("Cannot open tunnel to {}: {}", target, e),
            }
        });
    }
}

async fn run_dynamic_acceptor(listener: TcpListener, session: WeakSession) {
    loop {
        let mut socket = match listener.accept().await {
            Ok((socket, _)) => socket,
            Err(e) => {
                warn!("SOCKS accept failed: {}", e);
                return;
            }
        };
        let Some(handle) = session.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let (version, target) = match socks::handshake(&mut socket).await {
                Ok(request) => request,
                Err(e) => {
                    debug!("SOCKS handshake failed: {}", e);
                    return;
                }
            };
            let (originator_address, originator_port) = originator(&socket);
            let channel_type = ChannelType::DirectTcpip {
                host: target.host.clone(),
                port: target.port as u32,
                originator_address,
                originator_port,
            };
            match handle.open_channel_confirmed(channel_type).await {
                Ok(channel) => {
                    if socks::reply(&mut socket, version, true).await.is_ok() {
                        tunnel::bridge(channel.into_stream(), socket).await;
                    } else {
                        channel.close(true);
                    }
                }
                Err(e) => {
                    debug!("SOCKS tunnel to {} failed: {}", target, e);
                    let _ = socks::reply(&mut socket, version, false).await;
                }
            }
        });
    }
}

async fn run_forwarded_acceptor(listener: TcpListener, session: WeakSession, connected_address: String) {
    let connected_port = match listener.local_addr() {
        Ok(addr) => addr.port() as u32,
        Err(e) => {
            warn!("Forwarded listener has no address: {}", e);
            return;
        }
    };
    loop {
        let socket = match listener.accept().await {
            Ok((socket, _)) => socket,
            Err(e) => {
                warn!("Forwarded accept failed: {}", e);
                return;
            }
        };
        let Some(handle) = session.upgrade() else {
            return;
        };
        let connected_address = connected_address.clone();
        tokio::spawn(async move {
            let (originator_address, originator_port) = originator(&socket);
            let channel_type = ChannelType::ForwardedTcpip {
                connected_address,
                connected_port,
                originator_address,
                originator_port,
            };
            match handle.open_channel_confirmed(channel_type).await {
                Ok(channel) => tunnel::bridge(channel.into_stream(), socket).await,
                Err(e) => debug!("Client refused forwarded connection: {}", e),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(requested: ForwardAddr, bound: ForwardAddr) -> LocalForwardingEntry {
        LocalForwardingEntry {
            requested,
            acceptor: Acceptor {
                bound,
                task: tokio::spawn(async {}),
            },
        }
    }

    #[tokio::test]
    async fn test_local_forward_entry_matching() {
        let e = entry(
            ForwardAddr::new("localhost", 0),
            ForwardAddr::new("127.0.0.1", 40000),
        );
        assert!(e.is_for(&ForwardAddr::new("localhost", 40000)));
        assert!(e.is_for(&ForwardAddr::new("127.0.0.1", 40000)));
        assert!(!e.is_for(&ForwardAddr::new("LOCALHOST", 40000)));
        assert!(!e.is_for(&ForwardAddr::new("localhost", 0)));

        let fixed = entry(ForwardAddr::new("", 2222), ForwardAddr::new("0.0.0.0", 2222));
        assert!(fixed.is_for(&ForwardAddr::new("", 2222)));
        assert!(fixed.is_for(&ForwardAddr::new("0.0.0.0", 2222)));
    }

    #[tokio::test]
    async fn test_conflicting_local_binding_keeps_first() {
        let (session, _rx) = crate::ssh::session::tests::detached_handle();
        let forwarder = session.forwarder();
        let target = ForwardAddr::new("10.0.0.5", 22);
        let bound = forwarder
            .start_local_port_forwarding(ForwardAddr::new("127.0.0.1", 0), target.clone())
            .await
            .unwrap();
        assert_ne!(bound.port, 0);

        let again = ForwardAddr::new("127.0.0.1", bound.port);
        let err = forwarder
            .start_local_port_forwarding(again.clone(), ForwardAddr::new("10.0.0.6", 22))
            .await
            .unwrap_err();
        assert!(matches!(err, FjordError::IllegalState(_)));
        assert_eq!(
            err.to_string(),
            format!(
                "Illegal state: Multiple local port forwarding bindings on port {}",
                bound.port
            )
        );
        assert!(forwarder
            .start_dynamic_port_forwarding(again.clone())
            .await
            .is_err());

        // the same mapping again is the existing binding
        let same = forwarder
            .start_local_port_forwarding(again, target.clone())
            .await
            .unwrap();
        assert_eq!(same, bound);
        {
            let maps = forwarder.maps();
            assert_eq!(maps.local_to_remote.get(&bound.port).map(|(t, _)| t), Some(&target));
            assert!(!maps.dynamic.contains_key(&bound.port));
            assert!(!maps.remote_to_local.contains_key(&bound.port));
        }
        assert_eq!(forwarder.bound_addresses(), vec![bound.clone()]);
        forwarder.stop_local_port_forwarding(&bound).await.unwrap();
        assert!(forwarder.bound_addresses().is_empty());
    }
}
