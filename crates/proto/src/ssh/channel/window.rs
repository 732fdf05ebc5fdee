//! Channel flow control windows (RFC 4254 Section 5.2).
//!
//! Each channel has two windows:
//!
//! - [`LocalWindow`]: how much the peer may still send us. Owned by the
//!   session loop. Incoming data is checked and charged against it; bytes the
//!   application has drained are released back and announced with
//!   `SSH_MSG_CHANNEL_WINDOW_ADJUST` once half the window is in use.
//! - [`RemoteWindow`]: how much we may still send. Shared between the loop
//!   (which grows it on WINDOW_ADJUST) and writers (which reserve from it
//!   before queueing data). Writers wait asynchronously through a waker or
//!   synchronously through a condition variable.

use fjord_platform::{FjordError, FjordResult};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

/// Receive side window.
#[derive(Debug, Clone)]
pub struct LocalWindow {
    size: u32,
    max_size: u32,
    packet_size: u32,
    released: u32,
}

impl LocalWindow {
    /// Creates a window of `max_size` bytes accepting packets of at most
    /// `packet_size` bytes.
    pub fn new(max_size: u32, packet_size: u32) -> Self {
        Self {
            size: max_size,
            max_size,
            packet_size,
            released: 0,
        }
    }

    /// Bytes the peer may still send.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Initial and maximum size.
    pub fn max_size(&self) -> u32 {
        self.max_size
    }

    /// Largest accepted data packet.
    pub fn packet_size(&self) -> u32 {
        self.packet_size
    }

    /// Charges incoming data against the window.
    ///
    /// Data beyond the window or the packet size is a protocol violation and
    /// is rejected before anything reaches the application.
    pub fn consume(&mut self, len: u32) -> FjordResult<()> {
        if len > self.packet_size {
            return Err(FjordError::Protocol(format!(
                "Channel data of {} bytes exceeds maximum packet size {}",
                len, self.packet_size
            )));
        }
        if len > self.size {
            return Err(FjordError::Protocol(format!(
                "Channel data of {} bytes exceeds remaining window {}",
                len, self.size
            )));
        }
        self.size -= len;
        Ok(())
    }

    /// Returns bytes the application has drained.
    ///
    /// Returns the amount to announce in a WINDOW_ADJUST once the window has
    /// fallen to half its size or below.
    pub fn release(&mut self, len: u32) -> Option<u32> {
        let outstanding = self.max_size - self.size - self.released;
        self.released += len.min(outstanding);
        if self.released > 0 && self.size <= self.max_size / 2 {
            let adjust = self.released;
            self.size += adjust;
            self.released = 0;
            Some(adjust)
        } else {
            None
        }
    }
}

#[derive(Debug)]
struct RemoteState {
    size: u32,
    packet_size: u32,
    closed: bool,
    wakers: Vec<Waker>,
}

/// Send side window.
#[derive(Debug)]
pub struct RemoteWindow {
    state: Mutex<RemoteState>,
    cond: Condvar,
}

impl Default for RemoteWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteWindow {
    /// Creates an empty window. Writers wait until [`RemoteWindow::init`].
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RemoteState {
                size: 0,
                packet_size: 0,
                closed: false,
                wakers: Vec::new(),
            }),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RemoteState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn wake(&self, mut state: MutexGuard<'_, RemoteState>) {
        let wakers = std::mem::take(&mut state.wakers);
        drop(state);
        self.cond.notify_all();
        for waker in wakers {
            waker.wake();
        }
    }

    /// Sets the peer's initial window and packet size.
    pub fn init(&self, size: u32, packet_size: u32) {
        let mut state = self.lock();
        state.size = size;
        state.packet_size = packet_size.max(1);
        self.wake(state);
    }

    /// Bytes that may be sent right now.
    pub fn size(&self) -> u32 {
        self.lock().size
    }

    /// Peer's maximum packet size.
    pub fn packet_size(&self) -> u32 {
        self.lock().packet_size
    }

    /// Adds `len` bytes announced by a WINDOW_ADJUST.
    ///
    /// A window that would exceed 2^32 - 1 is rejected and left unchanged.
    pub fn expand(&self, len: u32) -> FjordResult<()> {
        let mut state = self.lock();
        let size = state.size.checked_add(len).ok_or_else(|| {
            FjordError::Protocol(format!(
                "Window adjust of {} overflows window of {}",
                len, state.size
            ))
        })?;
        state.size = size;
        self.wake(state);
        Ok(())
    }

    /// Fails all current and future reservations.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        self.wake(state);
    }

    /// True once closed.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn take(state: &mut RemoteState, want: usize) -> u32 {
        let want = u32::try_from(want).unwrap_or(u32::MAX);
        let n = want.min(state.size).min(state.packet_size);
        state.size -= n;
        n
    }

    /// Reserves up to `want` bytes, waiting for window space.
    ///
    /// The reservation never exceeds the peer's packet size, so every
    /// successful reservation fits in one CHANNEL_DATA message.
    pub fn poll_reserve(&self, cx: &mut Context<'_>, want: usize) -> Poll<FjordResult<u32>> {
        let mut state = self.lock();
        if state.closed {
            return Poll::Ready(Err(FjordError::Closed("Channel closed".to_string())));
        }
        if want == 0 {
            return Poll::Ready(Ok(0));
        }
        if state.size == 0 || state.packet_size == 0 {
            if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                state.wakers.push(cx.waker().clone());
            }
            return Poll::Pending;
        }
        Poll::Ready(Ok(Self::take(&mut state, want)))
    }

    /// Async form of [`RemoteWindow::poll_reserve`].
    pub async fn reserve(&self, want: usize) -> FjordResult<u32> {
        std::future::poll_fn(|cx| self.poll_reserve(cx, want)).await
    }

    /// Blocking form of [`RemoteWindow::poll_reserve`] for plain threads.
    ///
    /// Returns a timeout error if no space opened up in time.
    pub fn reserve_blocking(&self, want: usize, timeout: Option<Duration>) -> FjordResult<u32> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(FjordError::Closed("Channel closed".to_string()));
            }
            if want == 0 {
                return Ok(0);
            }
            if state.size > 0 && state.packet_size > 0 {
                return Ok(Self::take(&mut state, want));
            }
            state = match deadline {
                None => self
                    .cond
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(FjordError::Timeout(
                            "Remote window did not open in time".to_string(),
                        ));
                    }
                    self.cond
                        .wait_timeout(state, deadline - now)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|poisoned| poisoned.into_inner().0)
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_overrun_is_rejected() {
        // three packets totalling 40000 bytes into a 32768 byte window
        let mut window = LocalWindow::new(32768, 32768);
        window.consume(15000).unwrap();
        window.consume(15000).unwrap();
        match window.consume(10000) {
            Err(FjordError::Protocol(msg)) => assert!(msg.contains("exceeds remaining window")),
            other => panic!("unexpected {:?}", other),
        }
        // nothing was charged for the rejected packet
        assert_eq!(window.size(), 2768);
    }

    #[test]
    fn test_packet_size_enforced() {
        let mut window = LocalWindow::new(1 << 20, 1024);
        assert!(window.consume(1025).is_err());
        window.consume(1024).unwrap();
    }

    #[test]
    fn test_adjust_after_half_consumed() {
        let mut window = LocalWindow::new(1000, 1000);
        window.consume(400).unwrap();
        assert_eq!(window.release(400), None);
        window.consume(200).unwrap();
        // 400 remaining, at most half the window: adjust with everything drained
        assert_eq!(window.release(200), Some(600));
        assert_eq!(window.size(), 1000);
        // releasing more than was consumed never inflates the window
        assert_eq!(window.release(50), None);
        assert_eq!(window.size(), 1000);
    }

    #[test]
    fn test_remote_window_accounting() {
        let window = RemoteWindow::new();
        window.init(100, 40);
        assert_eq!(window.reserve_blocking(1000, None).unwrap(), 40);
        assert_eq!(window.reserve_blocking(1000, None).unwrap(), 40);
        assert_eq!(window.reserve_blocking(1000, None).unwrap(), 20);
        assert_eq!(window.size(), 0);
        assert!(matches!(
            window.reserve_blocking(1, Some(Duration::from_millis(10))),
            Err(FjordError::Timeout(_))
        ));
        window.expand(10).unwrap();
        assert_eq!(window.reserve_blocking(5, None).unwrap(), 5);
    }

    #[test]
    fn test_remote_window_overflow() {
        let window = RemoteWindow::new();
        window.init(u32::MAX - 5, 1024);
        assert!(window.expand(10).is_err());
        assert_eq!(window.size(), u32::MAX - 5);
        window.expand(5).unwrap();
        assert_eq!(window.size(), u32::MAX);
    }

    #[tokio::test]
    async fn test_async_reserve_wakes_on_adjust() {
        let window = Arc::new(RemoteWindow::new());
        let waiter = {
            let window = Arc::clone(&window);
            tokio::spawn(async move { window.reserve(64).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        window.init(32, 1024);
        assert_eq!(waiter.await.unwrap().unwrap(), 32);
    }

    #[tokio::test]
    async fn test_close_fails_waiters() {
        let window = Arc::new(RemoteWindow::new());
        let waiter = {
            let window = Arc::clone(&window);
            tokio::spawn(async move { window.reserve(64).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        window.close();
        assert!(matches!(waiter.await.unwrap(), Err(FjordError::Closed(_))));
    }
}
