//! Leader lease.
//!
//! A leader may only accept mutations while it holds a **lease**: proof
//! that a quorum of the cell acknowledged it recently. Without it, a leader
//! cut off by a partition could keep accepting writes while a new leader is
//! already elected on the other side.
//!
//! ```text
//! Leader                                    Followers
//!   │── ping_follower(epoch) ─────────────────>│  every leader_lease_check_period
//!   │<── state ────────────────────────────────│
//!   │   quorum answered + lease checks passed  │
//!   │   => valid_until = check_start + leader_lease_timeout
//!   │                                          │
//!   │   ✗ (partition)                          │
//!   │   now >= valid_until => abandon epoch    │
//! ```
//!
//! Renewal uses the time the check *started*, not when it completed, so the
//! lease never outlives the acknowledgements backing it.
//!
//! ## Grace delay
//!
//! A new leader does not take its first lease before `leader_lease_grace_delay`
//! has passed since the epoch started. The grace delay exceeds the lease
//! timeout, so the lease of a deposed leader has run out by then.

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::rc::Rc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use crate::channel::{call_with_timeout, PeerChannels};
use crate::config::HydraConfig;
use crate::epoch::EpochContext;
use crate::error::HydraError;
use crate::providers::{Providers, TimeProvider};
use crate::signals::HydraSignals;
use crate::types::PeerId;

/// Timing of the leader lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// How long a successful check keeps the lease valid.
    pub lease_timeout: Duration,

    /// Minimum time between epoch start and the first valid lease.
    pub grace_delay: Duration,
}

impl LeaseConfig {
    /// Lease timing of a peer configuration.
    pub fn from_config(config: &HydraConfig) -> Self {
        Self {
            lease_timeout: config.leader_lease_timeout,
            grace_delay: config.effective_grace_delay(),
        }
    }

    /// Time after epoch start by which a lease must have been obtained.
    pub fn acquisition_deadline(&self) -> Duration {
        self.grace_delay + self.lease_timeout
    }
}

/// Validity window of the current lease.
#[derive(Debug, Clone)]
pub struct LeaseState {
    valid_until: Option<Duration>,
    config: LeaseConfig,
}

impl LeaseState {
    /// Create a lease state with no lease.
    pub fn new(config: LeaseConfig) -> Self {
        Self {
            valid_until: None,
            config,
        }
    }

    /// Extend the lease after a check that started at `check_start`.
    pub fn renew(&mut self, check_start: Duration) {
        let until = check_start + self.config.lease_timeout;
        self.valid_until = Some(self.valid_until.map_or(until, |current| current.max(until)));
    }

    /// Whether the lease is valid at `now`.
    pub fn is_valid(&self, now: Duration) -> bool {
        self.valid_until.map_or(false, |until| now < until)
    }

    /// Whether a lease was ever obtained.
    pub fn was_acquired(&self) -> bool {
        self.valid_until.is_some()
    }

    /// Remaining validity, zero if expired.
    pub fn remaining(&self, now: Duration) -> Duration {
        self.valid_until
            .map_or(Duration::ZERO, |until| until.saturating_sub(now))
    }

    /// Lease configuration.
    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }
}

/// Keeps the leader lease alive for one epoch.
pub struct LeaseTracker<P: Providers> {
    epoch: Rc<EpochContext>,
    config: Rc<HydraConfig>,
    providers: P,
    channels: Rc<dyn PeerChannels>,
    signals: Rc<HydraSignals>,
    lease: RefCell<LeaseState>,
    alive: RefCell<BTreeSet<PeerId>>,
    activated: Cell<bool>,
}

impl<P: Providers> LeaseTracker<P> {
    /// Create the tracker of a leader epoch.
    pub fn new(
        epoch: Rc<EpochContext>,
        config: Rc<HydraConfig>,
        providers: P,
        channels: Rc<dyn PeerChannels>,
        signals: Rc<HydraSignals>,
    ) -> Rc<Self> {
        let lease = LeaseState::new(LeaseConfig::from_config(&config));
        Rc::new(Self {
            epoch,
            config,
            providers,
            channels,
            signals,
            lease: RefCell::new(lease),
            alive: RefCell::new(BTreeSet::new()),
            activated: Cell::new(false),
        })
    }

    /// Whether the lease is valid now.
    pub fn is_valid(&self) -> bool {
        self.lease.borrow().is_valid(self.providers.time().now())
    }

    /// Check loop. Runs until the epoch ends or the lease is lost.
    pub async fn run(self: Rc<Self>) {
        let time = self.providers.time().clone();
        loop {
            let check_start = time.now();
            let confirmed = self.check().await;
            if self.epoch.is_canceled() {
                return;
            }

            let grace_passed = check_start >= self.epoch.start_time() + self.lease.borrow().config().grace_delay;
            if confirmed && grace_passed {
                self.lease.borrow_mut().renew(check_start);
                trace!(epoch = %self.epoch.epoch_id(), "lease renewed");
                if !self.activated.replace(true) {
                    info!(epoch = %self.epoch.epoch_id(), "leader lease acquired");
                    self.signals.leader_active.fire(&self.epoch.epoch_id());
                }
            }

            let now = time.now();
            let deadline = self.epoch.start_time() + self.lease.borrow().config().acquisition_deadline();
            if now >= deadline && !self.lease.borrow().is_valid(now) {
                let acquired = self.lease.borrow().was_acquired();
                warn!(epoch = %self.epoch.epoch_id(), acquired, "leader lease lost");
                self.epoch.request_restart(HydraError::LeaseExpired);
                return;
            }

            time.sleep(self.config.leader_lease_check_period).await;
        }
    }

    /// Ping every follower and run the lease check observers. Returns
    /// whether the lease may be renewed.
    async fn check(&self) -> bool {
        let epoch_id = self.epoch.epoch_id();
        let leader_id = self.epoch.self_id();
        let mut pings = JoinSet::new();
        for peer in self.epoch.cell().others(leader_id) {
            let channel = self.channels.channel(peer);
            let time = self.providers.time().clone();
            let timeout = self.config.commit_flush_rpc_timeout;
            pings.spawn_local(async move {
                let result = call_with_timeout(
                    &time,
                    timeout,
                    "ping follower",
                    channel.ping_follower(epoch_id, leader_id),
                )
                .await;
                (peer, result)
            });
        }

        let mut alive = BTreeSet::from([leader_id]);
        while let Some(joined) = pings.join_next().await {
            let Ok((peer, result)) = joined else {
                continue;
            };
            match result {
                Ok(response) if response.state.is_follower() => {
                    alive.insert(peer);
                }
                Ok(response) => {
                    trace!(%peer, state = %response.state, "peer is not following");
                }
                Err(error) => {
                    trace!(%peer, %error, "ping failed");
                }
            }
        }

        let quorum = alive.len() >= self.epoch.cell().quorum_count();
        let changed = *self.alive.borrow() != alive;
        if changed {
            debug!(epoch = %epoch_id, alive = ?alive, "alive peer set changed");
            *self.alive.borrow_mut() = alive.clone();
            self.signals.alive_peer_set_changed.fire(&alive);
        }
        if !quorum {
            return false;
        }
        match self.signals.leader_lease_check.fire().await {
            Ok(()) => true,
            Err(error) => {
                debug!(epoch = %epoch_id, %error, "lease check observer failed");
                false
            }
        }
    }
}
