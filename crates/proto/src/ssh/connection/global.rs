//! Global requests (RFC 4254 Section 4).
//!
//! Incoming requests walk the configured [`GlobalRequestHandler`]s and then
//! the built-in ones. Replies go out in the order the requests arrived, even
//! when a handler answers later through a [`DeferredReply`].

use crate::ssh::channel::request::{DeferredReply, RequestResult};
use crate::ssh::connection::messages::GlobalRequestType;
use crate::ssh::forward::types::ForwardAddr;
use crate::ssh::session::{Role, SessionContext, SessionHandle};
use bytes::{BufMut, Bytes, BytesMut};
use fjord_platform::FjordResult;
use std::collections::VecDeque;
use tracing::{debug, warn};

/// What a global request handler knows about the request.
#[derive(Debug)]
pub struct GlobalRequestContext {
    /// Session the request arrived on
    pub session: SessionHandle,
    /// Which side we are
    pub role: Role,
    /// True if the peer waits for an answer
    pub want_reply: bool,
    token: u64,
}

impl GlobalRequestContext {
    /// Reply handle for handlers that answer later.
    pub fn deferred_reply(&self) -> DeferredReply {
        DeferredReply::global(self.session.clone(), self.token)
    }
}

/// Handles global requests.
pub trait GlobalRequestHandler: Send + Sync {
    /// Processes one request.
    fn process(
        &self,
        ctx: &GlobalRequestContext,
        request: &GlobalRequestType,
    ) -> FjordResult<RequestResult>;
}

/// Replies owed to the peer, in arrival order.
#[derive(Debug, Default)]
pub(crate) struct ReplyQueue {
    next_token: u64,
    owed: VecDeque<(u64, Option<(bool, Bytes)>)>,
}

impl ReplyQueue {
    fn allocate(&mut self, want_reply: bool) -> u64 {
        let token = self.next_token;
        self.next_token += 1;
        if want_reply {
            self.owed.push_back((token, None));
        }
        token
    }

    /// Records an answer and returns every answer that may now be sent.
    pub(crate) fn complete(&mut self, token: u64, success: bool, data: Bytes) -> Vec<(bool, Bytes)> {
        if let Some(slot) = self.owed.iter_mut().find(|(t, _)| *t == token) {
            if slot.1.is_none() {
                slot.1 = Some((success, data));
            }
        }
        let mut ready = Vec::new();
        while let Some((_, Some(_))) = self.owed.front() {
            if let Some((_, Some(answer))) = self.owed.pop_front() {
                ready.push(answer);
            }
        }
        ready
    }
}

/// Outcome of an incoming global request.
pub(crate) struct Dispatched {
    pub(crate) token: u64,
    pub(crate) result: RequestResult,
}

/// Runs the handler chain for one incoming request.
pub(crate) fn dispatch(
    replies: &mut ReplyQueue,
    no_more_sessions: &mut bool,
    ctx: &SessionContext,
    request: &GlobalRequestType,
    want_reply: bool,
) -> Dispatched {
    let token = replies.allocate(want_reply);
    let gctx = GlobalRequestContext {
        session: ctx.handle.clone(),
        role: ctx.role,
        want_reply,
        token,
    };
    let configured = ctx
        .config
        .server()
        .map(|s| s.global_request_handlers.clone())
        .unwrap_or_default();
    for handler in &configured {
        match handler.process(&gctx, request) {
            Ok(RequestResult::Unsupported) => continue,
            Ok(result) => return Dispatched { token, result },
            Err(e) => {
                warn!("Global request '{}' handler failed: {}", request.name(), e);
                return Dispatched {
                    token,
                    result: RequestResult::ReplyFailure,
                };
            }
        }
    }
    let result = builtin(&gctx, ctx, no_more_sessions, request);
    debug!("Global request '{}' (want_reply={}): {:?}", request.name(), want_reply, result);
    Dispatched { token, result }
}

fn builtin(
    gctx: &GlobalRequestContext,
    ctx: &SessionContext,
    no_more_sessions: &mut bool,
    request: &GlobalRequestType,
) -> RequestResult {
    match request {
        // OpenSSH answers keepalives with failure
        GlobalRequestType::KeepAlive => RequestResult::ReplyFailure,
        GlobalRequestType::NoMoreSessions => {
            *no_more_sessions = true;
            RequestResult::ReplySuccess
        }
        GlobalRequestType::TcpipForward { address, port } => {
            let Some(server) = ctx.config.server() else {
                return RequestResult::Unsupported;
            };
            let Ok(port) = u16::try_from(*port) else {
                return RequestResult::ReplyFailure;
            };
            let requested = ForwardAddr::new(address.clone(), port);
            if !server.forwarding_filter.can_listen(&requested, &ctx.handle) {
                debug!("Refusing to listen on {}", requested);
                return RequestResult::ReplyFailure;
            }
            let forwarder = ctx.handle.forwarder();
            let reply = gctx.deferred_reply();
            tokio::spawn(async move {
                match forwarder.local_port_forwarding_requested(requested.clone()).await {
                    Ok(bound) => {
                        let mut data = BytesMut::new();
                        if requested.port == 0 {
                            data.put_u32(bound.port as u32);
                        }
                        reply.send(true, data.freeze());
                    }
                    Err(e) => {
                        warn!("Remote forwarding on {} failed: {}", requested, e);
                        reply.send(false, Bytes::new());
                    }
                }
            });
            RequestResult::Replied
        }
        GlobalRequestType::CancelTcpipForward { address, port } => {
            if ctx.config.server().is_none() {
                return RequestResult::Unsupported;
            }
            let Ok(port) = u16::try_from(*port) else {
                return RequestResult::ReplyFailure;
            };
            let local = ForwardAddr::new(address.clone(), port);
            let forwarder = ctx.handle.forwarder();
            let reply = gctx.deferred_reply();
            tokio::spawn(async move {
                let result = forwarder.local_port_forwarding_cancelled(&local).await;
                if let Err(e) = &result {
                    warn!("Cancelling remote forwarding on {} failed: {}", local, e);
                }
                reply.send(result.is_ok(), Bytes::new());
            });
            RequestResult::Replied
        }
        GlobalRequestType::Other { .. } => RequestResult::Unsupported,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replies_leave_in_arrival_order() {
        let mut queue = ReplyQueue::default();
        let first = queue.allocate(true);
        let silent = queue.allocate(false);
        let second = queue.allocate(true);
        assert_ne!(first, silent);

        assert!(queue.complete(second, true, Bytes::from_static(b"x")).is_empty());
        assert!(queue.complete(silent, true, Bytes::new()).is_empty());
        let ready = queue.complete(first, false, Bytes::new());
        assert_eq!(ready.len(), 2);
        assert!(!ready[0].0);
        assert_eq!(ready[1], (true, Bytes::from_static(b"x")));
        assert!(queue.complete(first, true, Bytes::new()).is_empty());
    }
}
