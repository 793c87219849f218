#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Live registry of passive observers with best-effort broadcast.
//!
//! [`ObserverHub::broadcast`] snapshots the registry, delivers to every
//! observer independently, and prunes exactly those whose delivery
//! failed. Nothing is retried and no ordering is promised across
//! observers. Failures never reach the caller as errors; they only change
//! membership.
//!
//! The registry lock is held only to snapshot or to prune, never while
//! delivering, so a slow observer cannot block registration.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Why a delivery failed.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// The observer's connection is gone.
    #[error("observer closed")]
    Closed,
    /// The observer is not draining its queue.
    #[error("observer queue full")]
    Saturated,
}

/// Something that can receive broadcast messages.
pub trait Observer<M>: Send + Sync {
    /// Hands `message` to the observer without waiting on it.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError`] if the observer can no longer accept
    /// messages.
    fn deliver(&self, message: &M) -> Result<(), DeliveryError>;
}

/// Observer backed by a bounded channel whose receiver is drained by the
/// observer's connection task.
pub struct ChannelObserver<M> {
    tx: mpsc::Sender<M>,
}

impl<M> ChannelObserver<M> {
    /// Wraps the sending half of an observer's queue.
    #[must_use]
    pub const fn new(tx: mpsc::Sender<M>) -> Self {
        Self { tx }
    }
}

impl<M: Clone + Send + Sync> Observer<M> for ChannelObserver<M> {
    fn deliver(&self, message: &M) -> Result<(), DeliveryError> {
        self.tx.try_send(message.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
            mpsc::error::TrySendError::Full(_) => DeliveryError::Saturated,
        })
    }
}

/// Handle returned by [`ObserverHub::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObserverId(Uuid);

impl std::fmt::Display for ObserverId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Observers that accepted the message.
    pub delivered: usize,
    /// Observers removed because delivery failed.
    pub pruned: usize,
}

/// Registry of observers for messages of type `M`.
pub struct ObserverHub<M> {
    observers: Mutex<BTreeMap<ObserverId, Arc<dyn Observer<M>>>>,
}

impl<M> Default for ObserverHub<M> {
    fn default() -> Self {
        Self {
            observers: Mutex::new(BTreeMap::new()),
        }
    }
}

impl<M> ObserverHub<M> {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<ObserverId, Arc<dyn Observer<M>>>> {
        // A panicking observer cannot leave the map half-updated.
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds an observer.
    pub fn register(&self, observer: Arc<dyn Observer<M>>) -> ObserverId {
        let id = ObserverId(Uuid::new_v4());
        let total = {
            let mut observers = self.lock();
            observers.insert(id, observer);
            observers.len()
        };
        log::debug!("Registered observer {id} ({total} connected)");
        id
    }

    /// Removes an observer. Returns `false` if it was already gone.
    pub fn unregister(&self, id: ObserverId) -> bool {
        let removed = self.lock().remove(&id).is_some();
        if removed {
            log::debug!("Unregistered observer {id}");
        }
        removed
    }

    /// Number of registered observers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no observers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Delivers `message` to a snapshot of the current observers and
    /// prunes those that failed.
    pub fn broadcast(&self, message: &M) -> BroadcastReport {
        let snapshot: Vec<(ObserverId, Arc<dyn Observer<M>>)> = self
            .lock()
            .iter()
            .map(|(id, observer)| (*id, Arc::clone(observer)))
            .collect();

        let mut delivered = 0;
        let mut failed = Vec::new();

        for (id, observer) in snapshot {
            match observer.deliver(message) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    log::debug!("Dropping observer {id}: {e}");
                    failed.push(id);
                }
            }
        }

        let pruned = if failed.is_empty() {
            0
        } else {
            let mut observers = self.lock();
            failed
                .iter()
                .filter(|id| observers.remove(id).is_some())
                .count()
        };

        BroadcastReport { delivered, pruned }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recording {
        received: Mutex<Vec<String>>,
        attempts: AtomicUsize,
        fail: bool,
    }

    impl Recording {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                received: Mutex::new(Vec::new()),
                attempts: AtomicUsize::new(0),
                fail,
            })
        }
    }

    impl Observer<String> for Recording {
        fn deliver(&self, message: &String) -> Result<(), DeliveryError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(DeliveryError::Closed);
            }
            self.received.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    #[test]
    fn one_failure_prunes_only_that_observer() {
        let hub = ObserverHub::<String>::new();
        let healthy: Vec<Arc<Recording>> = (0..4).map(|_| Recording::new(false)).collect();
        let broken = Recording::new(true);

        for observer in &healthy {
            hub.register(observer.clone());
        }
        hub.register(broken.clone());
        assert_eq!(hub.len(), 5);

        let report = hub.broadcast(&"bins initialized".to_string());
        assert_eq!(report, BroadcastReport {
            delivered: 4,
            pruned: 1,
        });
        assert_eq!(hub.len(), 4);

        let report = hub.broadcast(&"point".to_string());
        assert_eq!(report.delivered, 4);
        assert_eq!(broken.attempts.load(Ordering::SeqCst), 1);

        for observer in &healthy {
            assert_eq!(
                *observer.received.lock().unwrap(),
                vec!["bins initialized".to_string(), "point".to_string()]
            );
        }
    }

    #[test]
    fn unregistered_observer_receives_nothing() {
        let hub = ObserverHub::<String>::new();
        let observer = Recording::new(false);
        let id = hub.register(observer.clone());

        assert!(hub.unregister(id));
        assert!(!hub.unregister(id));
        assert!(hub.is_empty());

        assert_eq!(hub.broadcast(&"ignored".to_string()), BroadcastReport::default());
        assert_eq!(observer.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn channel_observer_reports_closed_and_full() {
        let hub = ObserverHub::<u32>::new();

        let (open_tx, mut open_rx) = mpsc::channel(4);
        let (closed_tx, closed_rx) = mpsc::channel(4);
        let (full_tx, _full_rx) = mpsc::channel(1);
        drop(closed_rx);

        hub.register(Arc::new(ChannelObserver::new(open_tx)));
        hub.register(Arc::new(ChannelObserver::new(closed_tx)));
        hub.register(Arc::new(ChannelObserver::new(full_tx)));

        let first = hub.broadcast(&1);
        assert_eq!(first.delivered, 2);
        assert_eq!(first.pruned, 1);

        // The single-slot queue is still holding `1`.
        let second = hub.broadcast(&2);
        assert_eq!(second.delivered, 1);
        assert_eq!(second.pruned, 1);

        assert_eq!(open_rx.recv().await, Some(1));
        assert_eq!(open_rx.recv().await, Some(2));
        assert_eq!(hub.len(), 1);
    }
}
