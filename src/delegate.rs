//! Connection lifecycle delegates.
//!
//! Delegates are held weakly: callers may come and go without the delegate
//! list keeping them alive, and stale entries are dropped silently at
//! dispatch time.

use std::sync::{Arc, Weak};

use crate::config::Deployment;
use crate::error::TransportError;

/// External subscriber to connection lifecycle events.
///
/// Exactly one of these callbacks fires per lifecycle event. All callbacks
/// default to no-ops.
pub trait ConnectionDelegate: Send + Sync {
    /// Both halves of the connection reached the connected state.
    fn did_connect(&self, host: &str) {
        let _ = host;
    }

    /// The connection closed without an error.
    fn did_disconnect(&self, host: &str) {
        let _ = host;
    }

    /// The connection is about to close because of `error`.
    fn will_disconnect(&self, host: &str, error: &TransportError) {
        let _ = (host, error);
    }

    /// The connection failed without closing.
    fn did_fail(&self, host: &str, error: &TransportError) {
        let _ = (host, error);
    }
}

/// The currently interested delegates for one connection.
///
/// Handheld mode keeps an ordered list and broadcasts to every live entry;
/// desktop mode admits a single entry. Both are views of the same contract:
/// notify whoever is still alive, in registration order.
pub(crate) struct DelegateSet {
    deployment: Deployment,
    delegates: Vec<Weak<dyn ConnectionDelegate>>,
}

impl DelegateSet {
    pub(crate) fn new(deployment: Deployment) -> Self {
        Self {
            deployment,
            delegates: Vec::new(),
        }
    }

    /// Add `delegate`. On desktop the new entry replaces any previous one;
    /// on handheld an already-registered delegate is not added twice.
    pub(crate) fn assign(&mut self, delegate: Weak<dyn ConnectionDelegate>) {
        match self.deployment {
            Deployment::Desktop => {
                self.delegates.clear();
                self.delegates.push(delegate);
            }
            Deployment::Handheld => {
                if !self.delegates.iter().any(|held| held.ptr_eq(&delegate)) {
                    self.delegates.push(delegate);
                }
            }
        }
    }

    /// Remove `delegate` (handheld) or clear the slot (desktop).
    pub(crate) fn resign(&mut self, delegate: &Weak<dyn ConnectionDelegate>) {
        match self.deployment {
            Deployment::Desktop => self.delegates.clear(),
            Deployment::Handheld => self.delegates.retain(|held| !held.ptr_eq(delegate)),
        }
    }

    /// Invoke `notify` on every live delegate, in registration order, and
    /// drop entries whose owners have gone away.
    ///
    /// The live set is snapshotted before the first call, so a delegate
    /// resigning from within its own callback does not disturb the rest of
    /// the broadcast.
    pub(crate) fn broadcast<F>(&mut self, notify: F)
    where
        F: Fn(&dyn ConnectionDelegate),
    {
        let live: Vec<Arc<dyn ConnectionDelegate>> = self
            .delegates
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        self.delegates.retain(|held| held.strong_count() > 0);
        for delegate in live {
            notify(&*delegate);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.delegates.len()
    }
}

impl std::fmt::Debug for DelegateSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegateSet")
            .field("deployment", &self.deployment)
            .field("entries", &self.delegates.len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        connects: AtomicUsize,
    }

    impl ConnectionDelegate for Counting {
        fn did_connect(&self, _host: &str) {
            self.connects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn weak(delegate: &Arc<Counting>) -> Weak<dyn ConnectionDelegate> {
        Arc::downgrade(delegate) as Weak<dyn ConnectionDelegate>
    }

    #[test]
    fn handheld_broadcasts_in_registration_order() {
        let first = Arc::new(Counting::default());
        let second = Arc::new(Counting::default());

        let mut set = DelegateSet::new(Deployment::Handheld);
        set.assign(weak(&first));
        set.assign(weak(&second));

        set.broadcast(|delegate| delegate.did_connect("origin"));
        assert_eq!(first.connects.load(Ordering::SeqCst), 1);
        assert_eq!(second.connects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handheld_does_not_double_register() {
        let delegate = Arc::new(Counting::default());

        let mut set = DelegateSet::new(Deployment::Handheld);
        set.assign(weak(&delegate));
        set.assign(weak(&delegate));

        set.broadcast(|delegate| delegate.did_connect("origin"));
        assert_eq!(delegate.connects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn desktop_keeps_only_the_latest() {
        let first = Arc::new(Counting::default());
        let second = Arc::new(Counting::default());

        let mut set = DelegateSet::new(Deployment::Desktop);
        set.assign(weak(&first));
        set.assign(weak(&second));

        set.broadcast(|delegate| delegate.did_connect("origin"));
        assert_eq!(first.connects.load(Ordering::SeqCst), 0);
        assert_eq!(second.connects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stale_entries_are_dropped_silently() {
        let kept = Arc::new(Counting::default());
        let dropped = Arc::new(Counting::default());

        let mut set = DelegateSet::new(Deployment::Handheld);
        set.assign(weak(&dropped));
        set.assign(weak(&kept));
        drop(dropped);

        set.broadcast(|delegate| delegate.did_connect("origin"));
        assert_eq!(kept.connects.load(Ordering::SeqCst), 1);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn resign_removes_the_entry() {
        let first = Arc::new(Counting::default());
        let second = Arc::new(Counting::default());

        let mut set = DelegateSet::new(Deployment::Handheld);
        set.assign(weak(&first));
        set.assign(weak(&second));
        set.resign(&weak(&first));

        set.broadcast(|delegate| delegate.did_connect("origin"));
        assert_eq!(first.connects.load(Ordering::SeqCst), 0);
        assert_eq!(second.connects.load(Ordering::SeqCst), 1);
    }
}
