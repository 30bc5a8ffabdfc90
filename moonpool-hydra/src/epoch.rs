//! Epoch context.
//!
//! An [`EpochContext`] lives exactly as long as this peer holds one role
//! (leader or follower) in one epoch. Every task started on behalf of the
//! epoch is raced against the context's [`CancellationToken`]: stopping the
//! epoch cancels the token and all of them unwind at their next suspension
//! point, before they can touch state belonging to a newer epoch.
//!
//! Components that detect a fatal condition (lease expiry, flush failure,
//! out-of-order delivery) never tear the epoch down themselves. They call
//! [`EpochContext::request_restart`], which cancels the token once and
//! hands the error to the election layer.

use std::cell::Cell;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::HydraError;
use crate::types::{CellConfig, EpochId, PeerId};

/// Per-epoch state shared by the recovery, committer and lease tasks.
pub struct EpochContext {
    epoch_id: EpochId,
    leader_id: PeerId,
    self_id: PeerId,
    cell: Rc<CellConfig>,
    start_time: Duration,
    token: CancellationToken,
    restarting: Cell<bool>,
    on_restart: Box<dyn Fn(HydraError)>,
}

impl EpochContext {
    /// Create the context of a newly started epoch.
    pub fn new(
        epoch_id: EpochId,
        leader_id: PeerId,
        self_id: PeerId,
        cell: Rc<CellConfig>,
        start_time: Duration,
        on_restart: Box<dyn Fn(HydraError)>,
    ) -> Rc<Self> {
        Rc::new(Self {
            epoch_id,
            leader_id,
            self_id,
            cell,
            start_time,
            token: CancellationToken::new(),
            restarting: Cell::new(false),
            on_restart,
        })
    }

    /// The epoch.
    pub fn epoch_id(&self) -> EpochId {
        self.epoch_id
    }

    /// The leader of the epoch.
    pub fn leader_id(&self) -> PeerId {
        self.leader_id
    }

    /// This peer.
    pub fn self_id(&self) -> PeerId {
        self.self_id
    }

    /// Whether this peer leads the epoch.
    pub fn is_leader(&self) -> bool {
        self.leader_id == self.self_id
    }

    /// Cell membership.
    pub fn cell(&self) -> &CellConfig {
        &self.cell
    }

    /// Monotonic time at which the epoch started on this peer.
    pub fn start_time(&self) -> Duration {
        self.start_time
    }

    /// Token canceled when the epoch ends.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Whether the epoch has ended.
    pub fn is_canceled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// End the epoch locally. Idempotent.
    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            debug!(epoch = %self.epoch_id, "epoch canceled");
            self.token.cancel();
        }
    }

    /// Abandon the epoch because of `error`.
    ///
    /// Only the first request has an effect.
    pub fn request_restart(&self, error: HydraError) {
        if self.restarting.replace(true) || self.token.is_cancelled() {
            debug!(epoch = %self.epoch_id, %error, "restart already requested");
            return;
        }
        warn!(
            epoch = %self.epoch_id,
            peer = %self.self_id,
            leader = %self.leader_id,
            %error,
            "abandoning epoch"
        );
        self.token.cancel();
        (self.on_restart)(error);
    }

    /// Spawn a task that is dropped when the epoch ends.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + 'static,
    {
        let token = self.token.clone();
        tokio::task::spawn_local(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = future => {}
            }
        });
    }

    /// Run `future`, failing with an epoch-canceled error if the epoch ends
    /// first.
    pub async fn run<F, T>(&self, future: F) -> Result<T, HydraError>
    where
        F: Future<Output = Result<T, HydraError>>,
    {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(HydraError::epoch_canceled()),
            result = future => result,
        }
    }
}

impl std::fmt::Debug for EpochContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochContext")
            .field("epoch_id", &self.epoch_id)
            .field("leader_id", &self.leader_id)
            .field("self_id", &self.self_id)
            .field("canceled", &self.token.is_cancelled())
            .finish()
    }
}
