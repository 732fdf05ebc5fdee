//! Port forwarding lifecycle events.
//!
//! A forwarder notifies its own listeners plus every listener exposed by the
//! managers registered with it; managers may expose further managers. All
//! listeners run even if some fail, and the failures are returned together.

use super::types::ForwardAddr;
use fjord_platform::{FjordError, FjordResult};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// Kind of a forwarding tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardingKind {
    /// Local port to remote target over `direct-tcpip`
    Local,
    /// Remote port to local target over `forwarded-tcpip`
    Remote,
    /// Local SOCKS proxy over `direct-tcpip`
    Dynamic,
}

/// One step in a tunnel's life.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    /// About to bind or request the tunnel.
    Establishing {
        /// Tunnel kind
        kind: ForwardingKind,
        /// Listening side as requested
        local: ForwardAddr,
        /// Target, absent for dynamic tunnels
        remote: Option<ForwardAddr>,
    },
    /// Bind or request finished.
    Established {
        /// Tunnel kind
        kind: ForwardingKind,
        /// Listening side as requested
        local: ForwardAddr,
        /// Target, absent for dynamic tunnels
        remote: Option<ForwardAddr>,
        /// Actually bound address on success
        bound: Option<ForwardAddr>,
        /// Failure description
        error: Option<String>,
    },
    /// About to unbind or cancel.
    TearingDown {
        /// Tunnel kind
        kind: ForwardingKind,
        /// Bound address
        address: ForwardAddr,
    },
    /// Unbind or cancel finished.
    TornDown {
        /// Tunnel kind
        kind: ForwardingKind,
        /// Bound address
        address: ForwardAddr,
        /// Failure description
        error: Option<String>,
    },
}

/// Observes tunnel lifecycle events.
pub trait PortForwardingEventListener: Send + Sync {
    /// Called for every event. Errors are collected, not short-circuited.
    fn on_event(&self, event: &TunnelEvent) -> FjordResult<()>;
}

/// Something that exposes listeners, and possibly further managers.
pub trait PortForwardingEventListenerManager: Send + Sync {
    /// Listeners registered directly here.
    fn listeners(&self) -> Vec<Arc<dyn PortForwardingEventListener>>;

    /// Nested managers whose listeners also receive events.
    fn managers(&self) -> Vec<Arc<dyn PortForwardingEventListenerManager>> {
        Vec::new()
    }
}

fn key<T: ?Sized>(arc: &Arc<T>) -> usize {
    Arc::as_ptr(arc) as *const () as usize
}

/// Listener and manager registry with error aggregating fan-out.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: Mutex<Vec<Arc<dyn PortForwardingEventListener>>>,
    managers: Mutex<Vec<Arc<dyn PortForwardingEventListenerManager>>>,
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &lock(&self.listeners).len())
            .field("managers", &lock(&self.managers).len())
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ListenerRegistry {
    /// Adds a listener. Adding the same listener twice has no effect.
    pub fn add_listener(&self, listener: Arc<dyn PortForwardingEventListener>) {
        let mut listeners = lock(&self.listeners);
        if !listeners.iter().any(|l| key(l) == key(&listener)) {
            listeners.push(listener);
        }
    }

    /// Removes a listener. Returns false if it was not registered.
    pub fn remove_listener(&self, listener: &Arc<dyn PortForwardingEventListener>) -> bool {
        let mut listeners = lock(&self.listeners);
        let before = listeners.len();
        listeners.retain(|l| key(l) != key(listener));
        listeners.len() != before
    }

    /// Adds a manager whose listeners also get events.
    pub fn add_manager(&self, manager: Arc<dyn PortForwardingEventListenerManager>) {
        let mut managers = lock(&self.managers);
        if !managers.iter().any(|m| key(m) == key(&manager)) {
            managers.push(manager);
        }
    }

    /// Removes a manager. Returns false if it was not registered.
    pub fn remove_manager(&self, manager: &Arc<dyn PortForwardingEventListenerManager>) -> bool {
        let mut managers = lock(&self.managers);
        let before = managers.len();
        managers.retain(|m| key(m) != key(manager));
        managers.len() != before
    }

    /// Every listener reachable from here, each once.
    fn collect(&self) -> Vec<Arc<dyn PortForwardingEventListener>> {
        let mut seen_listeners = HashSet::new();
        let mut seen_managers = HashSet::new();
        let mut out = Vec::new();
        let mut stack: Vec<Arc<dyn PortForwardingEventListenerManager>> = Vec::new();

        for listener in lock(&self.listeners).iter() {
            if seen_listeners.insert(key(listener)) {
                out.push(Arc::clone(listener));
            }
        }
        stack.extend(lock(&self.managers).iter().cloned());

        while let Some(manager) = stack.pop() {
            if !seen_managers.insert(key(&manager)) {
                continue;
            }
            for listener in manager.listeners() {
                if seen_listeners.insert(key(&listener)) {
                    out.push(listener);
                }
            }
            stack.extend(manager.managers());
        }
        out
    }

    /// Delivers `event` to every listener and aggregates their failures.
    pub fn notify(&self, event: &TunnelEvent) -> FjordResult<()> {
        let errors: Vec<FjordError> = self
            .collect()
            .iter()
            .filter_map(|l| l.on_event(event).err())
            .collect();
        FjordError::aggregate(errors)
    }
}

impl PortForwardingEventListenerManager for ListenerRegistry {
    fn listeners(&self) -> Vec<Arc<dyn PortForwardingEventListener>> {
        lock(&self.listeners).clone()
    }

    fn managers(&self) -> Vec<Arc<dyn PortForwardingEventListenerManager>> {
        lock(&self.managers).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
        fail: bool,
    }

    impl Counting {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
            })
        }
    }

    impl PortForwardingEventListener for Counting {
        fn on_event(&self, _event: &TunnelEvent) -> FjordResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(FjordError::Other("listener failed".into()))
            } else {
                Ok(())
            }
        }
    }

    fn event() -> TunnelEvent {
        TunnelEvent::TearingDown {
            kind: ForwardingKind::Local,
            address: ForwardAddr::new("127.0.0.1", 1),
        }
    }

    #[test]
    fn test_all_listeners_run_and_errors_aggregate() {
        let registry = ListenerRegistry::default();
        let bad1 = Counting::new(true);
        let good = Counting::new(false);
        let bad2 = Counting::new(true);
        registry.add_listener(bad1.clone());
        registry.add_listener(good.clone());
        registry.add_listener(bad2.clone());

        match registry.notify(&event()) {
            Err(FjordError::Aggregate(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(good.calls.load(Ordering::SeqCst), 1);
        assert_eq!(bad2.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_nested_managers_with_cycle() {
        let outer = Arc::new(ListenerRegistry::default());
        let inner = Arc::new(ListenerRegistry::default());
        let listener = Counting::new(false);
        inner.add_listener(listener.clone());
        outer.add_listener(listener.clone());
        outer.add_manager(inner.clone());
        inner.add_manager(outer.clone());

        outer.notify(&event()).unwrap();
        assert_eq!(listener.calls.load(Ordering::SeqCst), 1);

        let as_manager: Arc<dyn PortForwardingEventListenerManager> = inner.clone();
        assert!(outer.remove_manager(&as_manager));
        assert!(!outer.remove_manager(&as_manager));
        // break the cycle so both registries are freed
        let as_manager: Arc<dyn PortForwardingEventListenerManager> = outer.clone();
        inner.remove_manager(&as_manager);
    }
}
