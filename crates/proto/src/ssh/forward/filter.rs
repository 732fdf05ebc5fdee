//! Server side forwarding policy.

use super::types::ForwardAddr;
use crate::ssh::session::SessionHandle;

/// Decides which forwarding requests a server honours.
pub trait ForwardingFilter: Send + Sync {
    /// `auth-agent-req@openssh.com` on a session channel.
    fn can_forward_agent(&self, session: &SessionHandle, request_type: &str) -> bool;

    /// `x11-req` on a session channel.
    fn can_forward_x11(&self, session: &SessionHandle, request_type: &str) -> bool;

    /// `tcpip-forward`: listen on `address` for the client.
    fn can_listen(&self, address: &ForwardAddr, session: &SessionHandle) -> bool;

    /// `direct-tcpip`: connect to `address` for the client.
    fn can_connect(&self, channel_type: &str, address: &ForwardAddr, session: &SessionHandle) -> bool;
}

/// Allows everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllForwardingFilter;

impl ForwardingFilter for AcceptAllForwardingFilter {
    fn can_forward_agent(&self, _session: &SessionHandle, _request_type: &str) -> bool {
        true
    }

    fn can_forward_x11(&self, _session: &SessionHandle, _request_type: &str) -> bool {
        true
    }

    fn can_listen(&self, _address: &ForwardAddr, _session: &SessionHandle) -> bool {
        true
    }

    fn can_connect(&self, _channel_type: &str, _address: &ForwardAddr, _session: &SessionHandle) -> bool {
        true
    }
}

/// Refuses everything. The server default.
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectAllForwardingFilter;

impl ForwardingFilter for RejectAllForwardingFilter {
    fn can_forward_agent(&self, _session: &SessionHandle, _request_type: &str) -> bool {
        false
    }

    fn can_forward_x11(&self, _session: &SessionHandle, _request_type: &str) -> bool {
        false
    }

    fn can_listen(&self, _address: &ForwardAddr, _session: &SessionHandle) -> bool {
        false
    }

    fn can_connect(&self, _channel_type: &str, _address: &ForwardAddr, _session: &SessionHandle) -> bool {
        false
    }
}
