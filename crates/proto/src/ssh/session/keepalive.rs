//! Client heartbeat.
//!
//! Sends `keepalive@openssh.com` without requesting a reply at a fixed
//! interval once the session is authenticated, so idle connections are not
//! dropped by middleboxes. Without a reply requested the request completes
//! once it is handed to the session loop, so a failure here means the loop
//! is gone and stops the task. Socket write errors are not seen here; they
//! close the session, which the next tick notices through `is_open`.

use crate::ssh::connection::messages::GlobalRequestType;
use crate::ssh::session::WeakSession;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Heartbeat task of one session. Stops when dropped.
pub(crate) struct KeepaliveTask {
    task_handle: JoinHandle<()>,
}

impl KeepaliveTask {
    pub(crate) fn spawn(interval: Duration, session: WeakSession) -> Self {
        let task_handle = tokio::spawn(async move {
            debug!("Heartbeat started with interval {:?}", interval);
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let Some(handle) = session.upgrade() else {
                    break;
                };
                if !handle.is_open() {
                    break;
                }
                if !handle.is_authenticated() {
                    continue;
                }
                let sent = handle.global_request(GlobalRequestType::KeepAlive, false);
                if let Some(Err(e)) = sent.peek() {
                    debug!("Heartbeat failed: {}", e);
                    break;
                }
                trace!("Heartbeat sent");
            }
            debug!("Heartbeat stopped");
        });
        Self { task_handle }
    }

    pub(crate) fn is_running(&self) -> bool {
        !self.task_handle.is_finished()
    }
}

impl Drop for KeepaliveTask {
    fn drop(&mut self) {
        self.task_handle.abort();
    }
}
