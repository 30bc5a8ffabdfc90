//! Lifecycle observer lists.
//!
//! Subscribers are invoked synchronously, in registration order, on the
//! task that fires the signal. Firing clones the subscriber list first, so
//! a subscriber may subscribe further observers while being invoked.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

use crate::error::HydraError;
use crate::types::{EpochId, PeerId};

/// A boxed, non-`Send` future.
pub type LocalBoxFuture<T> = Pin<Box<dyn Future<Output = T>>>;

/// Observer list for values of type `T`.
pub struct Signal<T> {
    subscribers: RefCell<Vec<Rc<dyn Fn(&T)>>>,
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self {
            subscribers: RefCell::new(Vec::new()),
        }
    }
}

impl<T> Signal<T> {
    /// Register an observer.
    pub fn subscribe(&self, subscriber: impl Fn(&T) + 'static) {
        self.subscribers.borrow_mut().push(Rc::new(subscriber));
    }

    /// Invoke every observer with `value`.
    pub fn fire(&self, value: &T) {
        let subscribers = self.subscribers.borrow().clone();
        for subscriber in subscribers {
            subscriber(value);
        }
    }

    /// Number of observers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.borrow().len()
    }
}

/// Observer list whose observers each return a future; firing succeeds
/// once all of them do.
#[derive(Default)]
pub struct AsyncSignal {
    subscribers: RefCell<Vec<Rc<dyn Fn() -> LocalBoxFuture<Result<(), HydraError>>>>>,
}

impl AsyncSignal {
    /// Register an observer.
    pub fn subscribe(
        &self,
        subscriber: impl Fn() -> LocalBoxFuture<Result<(), HydraError>> + 'static,
    ) {
        self.subscribers.borrow_mut().push(Rc::new(subscriber));
    }

    /// Run every observer in order and return the first failure.
    pub async fn fire(&self) -> Result<(), HydraError> {
        let subscribers = self.subscribers.borrow().clone();
        for subscriber in subscribers {
            subscriber().await?;
        }
        Ok(())
    }
}

/// Lifecycle signals of one [`HydraManager`](crate::HydraManager).
#[derive(Default)]
pub struct HydraSignals {
    /// Elected leader; leader recovery starts.
    pub start_leading: Signal<EpochId>,
    /// Leader recovery finished; mutations are accepted once the lease is
    /// valid.
    pub leader_recovery_complete: Signal<EpochId>,
    /// First valid lease of the epoch.
    pub leader_active: Signal<EpochId>,
    /// Leadership lost, with the cause.
    pub stop_leading: Signal<HydraError>,
    /// Following a leader; follower recovery starts.
    pub start_following: Signal<EpochId>,
    /// Follower recovery finished; live replication continues.
    pub follower_recovery_complete: Signal<EpochId>,
    /// Stopped following, with the cause.
    pub stop_following: Signal<HydraError>,
    /// External liveness checks run before each lease renewal.
    pub leader_lease_check: AsyncSignal,
    /// The set of peers that answered the last lease check changed.
    pub alive_peer_set_changed: Signal<BTreeSet<PeerId>>,
}
