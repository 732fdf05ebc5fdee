//! Single-assignment completion objects.
//!
//! Every long running SSH operation (channel open, channel close, key
//! exchange, authentication, socket writes) hands out an [`SshFuture`]. The
//! session loop completes it; application code either blocks on it from a
//! plain thread with [`SshFuture::await_blocking`], awaits it from async code
//! with [`SshFuture::wait`], or registers a listener.
//!
//! Completion is one-shot: the first [`SshFuture::set_value`] wins and later
//! calls are ignored. Listeners run outside the internal lock, and a
//! listener added after completion runs immediately on the caller's thread.
//!
//! ```rust
//! use fjord_proto::ssh::future::SshFuture;
//! use std::time::Duration;
//!
//! let future: SshFuture<u32> = SshFuture::new("example");
//! assert!(future.set_value(Ok(7)));
//! assert!(!future.set_value(Ok(8)));
//! let value = future.await_blocking(Some(Duration::from_millis(10))).unwrap();
//! assert_eq!(value.unwrap(), 7);
//! ```

use fjord_platform::{FjordError, FjordResult};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

type Listener<T> = Box<dyn FnOnce(&FjordResult<T>) + Send>;

struct State<T> {
    value: Option<FjordResult<T>>,
    listeners: Vec<Listener<T>>,
}

struct Inner<T> {
    name: &'static str,
    state: Mutex<State<T>>,
    cond: Condvar,
    notify: Notify,
}

/// One-shot completion shared between the session loop and its callers.
pub struct SshFuture<T> {
    inner: Arc<Inner<T>>,
}

/// Completion of a channel open handshake.
pub type OpenFuture = SshFuture<()>;
/// Completion of a channel or session close.
pub type CloseFuture = SshFuture<()>;
/// Completion of a key exchange (initial or rekey).
pub type KexFuture = SshFuture<()>;
/// Completion of user authentication.
pub type AuthFuture = SshFuture<()>;
/// Completion of a socket write; carries the number of bytes written.
pub type WriteFuture = SshFuture<usize>;

impl<T> Clone for SshFuture<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for SshFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshFuture")
            .field("name", &self.inner.name)
            .field("done", &self.is_done())
            .finish()
    }
}

impl<T> SshFuture<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        // A panicking listener never runs under the lock, so poisoning only
        // means a waiter panicked; the slot itself is still consistent.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Name used in timeout errors and logs.
    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Returns true once a value has been set.
    pub fn is_done(&self) -> bool {
        self.lock().value.is_some()
    }
}

impl<T: Clone + Send + 'static> SshFuture<T> {
    /// Creates a pending future.
    pub fn new(name: &'static str) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                state: Mutex::new(State {
                    value: None,
                    listeners: Vec::new(),
                }),
                cond: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    /// Creates a future that is already complete.
    pub fn completed(name: &'static str, value: FjordResult<T>) -> Self {
        let future = Self::new(name);
        future.set_value(value);
        future
    }

    /// Completes the future. Returns false if it was already complete, in
    /// which case `value` is dropped.
    pub fn set_value(&self, value: FjordResult<T>) -> bool {
        let listeners = {
            let mut state = self.lock();
            if state.value.is_some() {
                return false;
            }
            state.value = Some(value);
            std::mem::take(&mut state.listeners)
        };

        self.inner.cond.notify_all();
        self.inner.notify.notify_waiters();

        if !listeners.is_empty() {
            if let Some(value) = self.peek() {
                for listener in listeners {
                    listener(&value);
                }
            }
        }
        true
    }

    /// Returns a copy of the value if complete.
    pub fn peek(&self) -> Option<FjordResult<T>> {
        self.lock().value.clone()
    }

    /// Registers a completion callback. If the future is already complete the
    /// callback runs before this method returns.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: FnOnce(&FjordResult<T>) + Send + 'static,
    {
        let value = {
            let mut state = self.lock();
            match &state.value {
                Some(value) => value.clone(),
                None => {
                    state.listeners.push(Box::new(listener));
                    return;
                }
            }
        };
        listener(&value);
    }

    /// Blocks the current thread until completion.
    ///
    /// Returns `None` if `timeout` elapsed first. Must not be called from the
    /// session loop itself.
    pub fn await_blocking(&self, timeout: Option<Duration>) -> Option<FjordResult<T>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.lock();
        loop {
            if let Some(value) = &state.value {
                return Some(value.clone());
            }
            state = match deadline {
                None => self
                    .inner
                    .cond
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    self.inner
                        .cond
                        .wait_timeout(state, deadline - now)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|poisoned| poisoned.into_inner().0)
                }
            };
        }
    }

    /// Waits asynchronously for completion. Returns `None` on timeout.
    pub async fn wait(&self, timeout: Option<Duration>) -> Option<FjordResult<T>> {
        let wait = async {
            loop {
                let notified = self.inner.notify.notified();
                if let Some(value) = self.peek() {
                    return value;
                }
                notified.await;
            }
        };
        match timeout {
            None => Some(wait.await),
            Some(t) => tokio::time::timeout(t, wait).await.ok(),
        }
    }

    /// Waits and converts a timeout into [`FjordError::Timeout`].
    pub async fn verify(&self, timeout: Option<Duration>) -> FjordResult<T> {
        match self.wait(timeout).await {
            Some(result) => result,
            None => Err(FjordError::Timeout(format!(
                "{} not completed within {:?}",
                self.inner.name,
                timeout.unwrap_or_default()
            ))),
        }
    }

    /// Blocking counterpart of [`SshFuture::verify`].
    pub fn verify_blocking(&self, timeout: Option<Duration>) -> FjordResult<T> {
        match self.await_blocking(timeout) {
            Some(result) => result,
            None => Err(FjordError::Timeout(format!(
                "{} not completed within {:?}",
                self.inner.name,
                timeout.unwrap_or_default()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_single_assignment() {
        let future: SshFuture<u32> = SshFuture::new("test");
        assert!(!future.is_done());
        assert!(future.set_value(Ok(1)));
        assert!(!future.set_value(Ok(2)));
        assert!(!future.set_value(Err(FjordError::Closed("late".into()))));
        assert_eq!(future.peek().unwrap().unwrap(), 1);
    }

    #[test]
    fn test_blocking_wait_times_out_with_sentinel() {
        let future: SshFuture<()> = SshFuture::new("never");
        let start = Instant::now();
        assert!(future
            .await_blocking(Some(Duration::from_millis(30)))
            .is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));

        match future.verify_blocking(Some(Duration::from_millis(1))) {
            Err(FjordError::Timeout(msg)) => assert!(msg.contains("never")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_blocking_wait_across_threads() {
        let future: SshFuture<String> = SshFuture::new("cross");
        let setter = future.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            setter.set_value(Ok("done".to_string()));
        });
        let value = future.await_blocking(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(value.unwrap(), "done");
        handle.join().unwrap();
    }

    #[test]
    fn test_listeners() {
        let calls = Arc::new(AtomicUsize::new(0));
        let future: SshFuture<u8> = SshFuture::new("listeners");

        let c = calls.clone();
        future.add_listener(move |v| {
            assert_eq!(*v.as_ref().unwrap(), 3);
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        future.set_value(Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // added after completion: invoked synchronously from add_listener
        let c = calls.clone();
        future.add_listener(move |_| {
            c.fetch_add(10, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_listener_may_reenter_future() {
        let future: SshFuture<u8> = SshFuture::new("reenter");
        let inner = future.clone();
        future.add_listener(move |_| {
            // would deadlock if listeners ran under the lock
            assert!(inner.is_done());
        });
        future.set_value(Ok(0));
    }

    #[tokio::test]
    async fn test_async_wait() {
        let future: SshFuture<u32> = SshFuture::new("async");
        let setter = future.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            setter.set_value(Ok(42));
        });
        assert_eq!(future.verify(Some(Duration::from_secs(5))).await.unwrap(), 42);

        let pending: SshFuture<u32> = SshFuture::new("pending");
        assert!(pending.wait(Some(Duration::from_millis(10))).await.is_none());
        assert!(pending
            .verify(Some(Duration::from_millis(10)))
            .await
            .unwrap_err()
            .is_timeout());
    }

    #[test]
    fn test_completed() {
        let future = SshFuture::completed("ready", Ok(5u8));
        assert!(future.is_done());
        assert_eq!(future.await_blocking(None).unwrap().unwrap(), 5);
    }
}
