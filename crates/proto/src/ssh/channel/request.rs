//! Pluggable request handlers.
//!
//! Channel requests and global requests are offered to an ordered chain of
//! handlers. The first handler that returns anything other than
//! [`RequestResult::Unsupported`] ends the walk; if every handler passes, the
//! request is answered with a failure.

use crate::ssh::connection::messages::ChannelRequestType;
use crate::ssh::session::handle::Msg;
use crate::ssh::session::SessionHandle;
use bytes::Bytes;
use fjord_platform::FjordResult;

/// Outcome of a request handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestResult {
    /// Handled; answer with success if a reply was requested.
    ReplySuccess,
    /// Handled; answer with failure if a reply was requested.
    ReplyFailure,
    /// Not handled here; try the next handler.
    Unsupported,
    /// Handled; the handler sends (or has sent) the reply itself.
    Replied,
}

/// Where a deferred reply goes.
#[derive(Debug, Clone, Copy)]
enum ReplyTarget {
    Global(u64),
    Channel(u32),
}

/// Sends the answer for a request whose handler returned
/// [`RequestResult::Replied`].
#[derive(Debug, Clone)]
pub struct DeferredReply {
    session: SessionHandle,
    target: ReplyTarget,
}

impl DeferredReply {
    pub(crate) fn global(session: SessionHandle, token: u64) -> Self {
        Self {
            session,
            target: ReplyTarget::Global(token),
        }
    }

    pub(crate) fn channel(session: SessionHandle, id: u32) -> Self {
        Self {
            session,
            target: ReplyTarget::Channel(id),
        }
    }

    /// Sends the reply. `data` is only carried by global request successes.
    pub fn send(self, success: bool, data: Bytes) {
        match self.target {
            ReplyTarget::Global(token) => self.session.global_reply(token, success, data),
            ReplyTarget::Channel(id) => {
                // a closed session needs no reply
                let _ = self.session.send(Msg::ChannelReply { id, success });
            }
        }
    }
}

/// What a channel request handler knows about the request.
#[derive(Debug)]
pub struct ChannelRequestContext {
    /// Local channel id
    pub channel_id: u32,
    /// Channel type name
    pub channel_type: String,
    /// Session the channel belongs to
    pub session: SessionHandle,
}

impl ChannelRequestContext {
    /// Reply handle for handlers that answer later.
    pub fn deferred_reply(&self) -> DeferredReply {
        DeferredReply::channel(self.session.clone(), self.channel_id)
    }
}

/// Handles named requests on server side session channels.
///
/// Configured handlers run before the built-in ones, so they can override
/// any standard request.
pub trait ChannelRequestHandler: Send + Sync {
    /// Processes one request.
    fn process(
        &self,
        ctx: &ChannelRequestContext,
        request: &ChannelRequestType,
        want_reply: bool,
    ) -> FjordResult<RequestResult>;
}

/// Answers the PuTTY extensions `winadj@putty.projects.tartarus.org` and
/// `simple@putty.projects.tartarus.org`.
///
/// PuTTY sends `winadj` to check the window and only needs any reply.
#[derive(Debug, Default, Clone, Copy)]
pub struct PuttyRequestHandler;

/// Suffix shared by the PuTTY extension requests.
pub const PUTTY_REQUEST_SUFFIX: &str = "@putty.projects.tartarus.org";

impl ChannelRequestHandler for PuttyRequestHandler {
    fn process(
        &self,
        _ctx: &ChannelRequestContext,
        request: &ChannelRequestType,
        _want_reply: bool,
    ) -> FjordResult<RequestResult> {
        let name = request.name();
        let Some(prefix) = name.strip_suffix(PUTTY_REQUEST_SUFFIX) else {
            return Ok(RequestResult::Unsupported);
        };
        Ok(match prefix {
            "winadj" => RequestResult::ReplyFailure,
            "simple" => RequestResult::ReplySuccess,
            _ => RequestResult::Unsupported,
        })
    }
}

/// Walks `handlers` in order until one claims the request.
pub(crate) fn run_chain(
    handlers: &[&dyn ChannelRequestHandler],
    ctx: &ChannelRequestContext,
    request: &ChannelRequestType,
    want_reply: bool,
) -> FjordResult<RequestResult> {
    for handler in handlers {
        match handler.process(ctx, request, want_reply)? {
            RequestResult::Unsupported => continue,
            result => return Ok(result),
        }
    }
    Ok(RequestResult::Unsupported)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn other(name: &str) -> ChannelRequestType {
        ChannelRequestType::Other {
            name: name.to_string(),
            data: Bytes::new(),
        }
    }

    #[test]
    fn test_putty_requests() {
        let handler = PuttyRequestHandler;
        let ctx = crate::ssh::session::tests::dummy_request_context();
        assert_eq!(
            handler
                .process(&ctx, &other("winadj@putty.projects.tartarus.org"), true)
                .unwrap(),
            RequestResult::ReplyFailure
        );
        assert_eq!(
            handler
                .process(&ctx, &other("simple@putty.projects.tartarus.org"), false)
                .unwrap(),
            RequestResult::ReplySuccess
        );
        assert_eq!(
            handler
                .process(&ctx, &other("other@putty.projects.tartarus.org"), true)
                .unwrap(),
            RequestResult::Unsupported
        );
        assert_eq!(
            handler.process(&ctx, &ChannelRequestType::Shell, true).unwrap(),
            RequestResult::Unsupported
        );
    }

    struct Fixed(RequestResult);

    impl ChannelRequestHandler for Fixed {
        fn process(
            &self,
            _ctx: &ChannelRequestContext,
            _request: &ChannelRequestType,
            _want_reply: bool,
        ) -> FjordResult<RequestResult> {
            Ok(self.0)
        }
    }

    #[test]
    fn test_chain_stops_at_first_claim() {
        let ctx = crate::ssh::session::tests::dummy_request_context();
        let pass = Fixed(RequestResult::Unsupported);
        let claim = Fixed(RequestResult::Replied);
        let never = Fixed(RequestResult::ReplyFailure);
        let chain: Vec<&dyn ChannelRequestHandler> = vec![&pass, &claim, &never];
        assert_eq!(
            run_chain(&chain, &ctx, &ChannelRequestType::Shell, true).unwrap(),
            RequestResult::Replied
        );
        let empty: Vec<&dyn ChannelRequestHandler> = vec![&pass];
        assert_eq!(
            run_chain(&empty, &ctx, &ChannelRequestType::Shell, true).unwrap(),
            RequestResult::Unsupported
        );
    }
}
