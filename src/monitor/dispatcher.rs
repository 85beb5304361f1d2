//! Callback delivery pool.
//!
//! Registry mutations run under the engine lock and must never wait on user
//! code. They record the transition on the wrapper and hand the wrapper to
//! this pool with a non-blocking `try_send`; a worker thread then drains the
//! wrapper's net transition.
//!
//! A wrapper turned away by a full queue is parked on a deferred list. Every
//! worker empties that list after each delivery, and the queue was full when
//! the wrapper was parked, so some worker always gets to it.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, warn};

use super::callback::WrappedCallback;

/// Bounded worker pool delivering consumer-set-change callbacks.
#[derive(Debug)]
pub struct CallbackDispatcher {
    tx: Option<Sender<Arc<WrappedCallback>>>,
    deferred: Arc<Mutex<Vec<Arc<WrappedCallback>>>>,
    workers: Vec<JoinHandle<()>>,
    queue_capacity: usize,
}

fn take_deferred(deferred: &Mutex<Vec<Arc<WrappedCallback>>>) -> Vec<Arc<WrappedCallback>> {
    std::mem::take(&mut *deferred.lock().unwrap_or_else(PoisonError::into_inner))
}

impl CallbackDispatcher {
    /// Starts `workers` threads sharing a queue of `queue_capacity`.
    #[must_use]
    pub fn start(workers: usize, queue_capacity: usize) -> Self {
        let workers = workers.max(1);
        let queue_capacity = queue_capacity.max(1);
        let (tx, rx) = bounded::<Arc<WrappedCallback>>(queue_capacity);
        let deferred = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::with_capacity(workers);
        for idx in 0..workers {
            let rx: Receiver<Arc<WrappedCallback>> = rx.clone();
            let deferred = Arc::clone(&deferred);
            let handle = thread::Builder::new()
                .name(format!("kyromatch-callback-{idx}"))
                .spawn(move || {
                    while let Ok(wrapped) = rx.recv() {
                        wrapped.deliver();
                        for late in take_deferred(&deferred) {
                            late.deliver();
                        }
                    }
                })
                .expect("failed to spawn kyromatch callback worker");
            handles.push(handle);
        }

        Self {
            tx: Some(tx),
            deferred,
            workers: handles,
            queue_capacity,
        }
    }

    /// Queues delivery for `wrapped` without blocking.
    ///
    /// On a full queue the wrapper is parked and delivered by the next worker
    /// to finish. A closed queue is logged and ignored.
    pub fn schedule(&self, wrapped: Arc<WrappedCallback>) {
        let Some(tx) = &self.tx else {
            return;
        };
        // Held across try_send so no worker can empty the list between a
        // full queue and the park.
        let mut deferred = self.deferred.lock().unwrap_or_else(PoisonError::into_inner);
        match tx.try_send(wrapped) {
            Ok(()) => {}
            Err(TrySendError::Full(w)) => {
                warn!(
                    connection = %w.connection(),
                    capacity = self.queue_capacity,
                    "callback queue full; delivery deferred"
                );
                if !deferred.iter().any(|parked| Arc::ptr_eq(parked, &w)) {
                    deferred.push(w);
                }
            }
            Err(TrySendError::Disconnected(w)) => warn!(
                connection = %w.connection(),
                "callback pool shut down; delivery dropped"
            ),
        }
    }

    /// Maximum queued deliveries.
    #[must_use]
    pub const fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Wrappers currently parked behind a full queue.
    #[must_use]
    pub fn deferred_len(&self) -> usize {
        self.deferred.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Drop for CallbackDispatcher {
    fn drop(&mut self) {
        // Closing the channel lets workers drain queued deliveries then exit.
        drop(self.tx.take());
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("callback worker exited with a panic");
            }
        }
        for late in take_deferred(&self.deferred) {
            late.deliver();
        }
        debug!("callback pool stopped");
    }
}
