//! Consumer-set-change callbacks and transition coalescing.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use uuid::Uuid;

/// Unique identifier for a client connection owning monitors.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Create a new random connection id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Notified when a monitored expression gains its first consumer or loses
/// its last one.
pub trait ConsumerSetChangeCallback: Send + Sync {
    /// `is_empty` is true when no consumer matches any more.
    fn consumer_set_change(&self, is_empty: bool);
}

impl<F> ConsumerSetChangeCallback for F
where
    F: Fn(bool) + Send + Sync,
{
    fn consumer_set_change(&self, is_empty: bool) {
        self(is_empty);
    }
}

#[derive(Debug, Default)]
struct TransitionState {
    // >0: net towards "has consumers", <0: net towards "empty".
    pending: i64,
    delivering: bool,
}

/// A registered callback plus its undelivered transitions.
pub struct WrappedCallback {
    connection: ConnectionId,
    callback: Arc<dyn ConsumerSetChangeCallback>,
    state: Mutex<TransitionState>,
}

impl fmt::Debug for WrappedCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrappedCallback")
            .field("connection", &self.connection)
            .field("callback", &Arc::as_ptr(&self.callback))
            .finish_non_exhaustive()
    }
}

impl WrappedCallback {
    /// Wraps `callback` for `connection`.
    #[must_use]
    pub fn new(connection: ConnectionId, callback: Arc<dyn ConsumerSetChangeCallback>) -> Self {
        Self {
            connection,
            callback,
            state: Mutex::new(TransitionState::default()),
        }
    }

    /// The owning connection.
    #[must_use]
    pub const fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Returns true if this wraps `callback` for `connection`.
    ///
    /// Callbacks are compared by identity, not by value.
    #[must_use]
    pub fn is_same(
        &self,
        connection: ConnectionId,
        callback: &Arc<dyn ConsumerSetChangeCallback>,
    ) -> bool {
        self.connection == connection
            && std::ptr::addr_eq(Arc::as_ptr(&self.callback), Arc::as_ptr(callback))
    }

    /// Records a transition. Called synchronously under the registry lock.
    pub fn transition_event(&self, is_empty: bool) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.pending += if is_empty { -1 } else { 1 };
    }

    /// Net undelivered transitions.
    #[must_use]
    pub fn pending(&self) -> i64 {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).pending
    }

    /// Delivers the net pending transition, if any.
    ///
    /// Only one thread delivers for a wrapper at a time; a concurrent caller
    /// returns immediately and the active deliverer picks up whatever was
    /// recorded meanwhile. Transitions that cancel out are never delivered.
    pub fn deliver(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.delivering {
                return;
            }
            state.delivering = true;
        }

        loop {
            let net = {
                let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                let net = std::mem::take(&mut state.pending);
                if net == 0 {
                    state.delivering = false;
                    return;
                }
                net
            };

            let is_empty = net < 0;
            debug!(connection = %self.connection, is_empty, "delivering consumer set change");
            let callback = Arc::clone(&self.callback);
            let outcome =
                panic::catch_unwind(AssertUnwindSafe(|| callback.consumer_set_change(is_empty)));
            if outcome.is_err() {
                error!(
                    connection = %self.connection,
                    is_empty,
                    "consumer set change callback panicked"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<bool>>,
    }

    impl ConsumerSetChangeCallback for Recorder {
        fn consumer_set_change(&self, is_empty: bool) {
            self.calls.lock().unwrap().push(is_empty);
        }
    }

    #[test]
    fn single_transition_is_delivered_once() {
        let rec = Arc::new(Recorder::default());
        let w = WrappedCallback::new(ConnectionId::new(), rec.clone());
        w.transition_event(false);
        w.deliver();
        w.deliver();
        assert_eq!(*rec.calls.lock().unwrap(), vec![false]);
    }

    #[test]
    fn opposite_transitions_cancel() {
        let rec = Arc::new(Recorder::default());
        let w = WrappedCallback::new(ConnectionId::new(), rec.clone());
        w.transition_event(false);
        w.transition_event(true);
        assert_eq!(w.pending(), 0);
        w.deliver();
        assert!(rec.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn net_direction_wins() {
        let rec = Arc::new(Recorder::default());
        let w = WrappedCallback::new(ConnectionId::new(), rec.clone());
        w.transition_event(true);
        w.transition_event(false);
        w.transition_event(true);
        w.deliver();
        assert_eq!(*rec.calls.lock().unwrap(), vec![true]);
    }

    #[test]
    fn identity_comparison() {
        let conn = ConnectionId::new();
        let a: Arc<dyn ConsumerSetChangeCallback> = Arc::new(Recorder::default());
        let b: Arc<dyn ConsumerSetChangeCallback> = Arc::new(Recorder::default());
        let w = WrappedCallback::new(conn, Arc::clone(&a));
        assert!(w.is_same(conn, &a));
        assert!(!w.is_same(conn, &b));
        assert!(!w.is_same(ConnectionId::new(), &a));
    }

    #[test]
    fn panicking_callback_does_not_poison_delivery() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let cb: Arc<dyn ConsumerSetChangeCallback> = Arc::new(move |_is_empty: bool| {
            seen.fetch_add(1, Ordering::SeqCst);
            panic!("boom");
        });
        let w = WrappedCallback::new(ConnectionId::new(), cb);
        w.transition_event(false);
        w.deliver();
        w.transition_event(true);
        w.deliver();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
