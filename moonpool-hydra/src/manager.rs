//! The Hydra manager.
//!
//! [`HydraManager`] is the facade a hosting service talks to. It owns the
//! decorated automaton, reacts to role changes from the election layer,
//! serves peer calls and exposes the public commit, sync and snapshot
//! operations.
//!
//! ## Role lifecycle
//!
//! ```text
//!                 on_start_leading                      recovery done
//!   Elections ───────────────────────> LeaderRecovery ─────────────────> Leading
//!       ^                                                                  │
//!       │ on_stop_leading / on_stop_following                              │
//!       └──────────────────────────────────────────────────────────────────┤
//!       │         on_start_following                    recovery done      │
//!   Elections ───────────────────────> FollowerRecovery ───────────────> Following
//! ```
//!
//! Each role runs inside an [`EpochContext`] exclusively owned by the
//! manager. Stopping a role cancels the context; every task of the epoch
//! unwinds and every pending commit fails with `InvalidState`.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::automaton::Automaton;
use crate::changelog::{ChangelogStore, ChangelogWriter};
use crate::channel::{
    call_with_timeout, AcceptMutationsRequest, AcceptMutationsResponse, ChangelogInfo,
    HydraService, PeerChannels, PingFollowerResponse, SyncState,
};
use crate::committer::{FollowerCommitter, LeaderCommitter};
use crate::config::HydraConfig;
use crate::decorated::DecoratedAutomaton;
use crate::election::{ElectionCallbacks, ElectionEpoch, ElectionManager, ElectionPriority};
use crate::epoch::EpochContext;
use crate::error::HydraError;
use crate::lease::LeaseTracker;
use crate::providers::{Providers, TimeProvider};
use crate::recovery::{
    open_existing, reachable_priority, record_epoch, FollowerRecovery, LeaderRecovery,
    RecoveryContext,
};
use crate::signals::HydraSignals;
use crate::snapshot::SnapshotStore;
use crate::types::{
    CellConfig, EpochId, MutationRequest, MutationResponse, PeerId, PeerState, Version,
};

/// Everything a manager needs from its host.
pub struct HydraDependencies<P: Providers> {
    /// This peer.
    pub self_id: PeerId,
    /// Peers of the cell.
    pub cell: CellConfig,
    /// Engine configuration.
    pub config: HydraConfig,
    /// Time and randomness.
    pub providers: P,
    /// The replicated business automaton.
    pub automaton: Box<dyn Automaton>,
    /// Local changelog segments.
    pub changelog_store: Rc<dyn ChangelogStore>,
    /// Local snapshots.
    pub snapshot_store: Rc<dyn SnapshotStore>,
    /// Calls to the other peers.
    pub channels: Rc<dyn PeerChannels>,
    /// The election layer.
    pub election: Rc<dyn ElectionManager>,
}

enum Role<P: Providers> {
    LeaderRecovery,
    Leader {
        committer: Rc<LeaderCommitter<P>>,
        lease: Rc<LeaseTracker<P>>,
    },
    Follower {
        committer: Rc<FollowerCommitter<P>>,
    },
}

impl<P: Providers> Clone for Role<P> {
    fn clone(&self) -> Self {
        match self {
            Self::LeaderRecovery => Self::LeaderRecovery,
            Self::Leader { committer, lease } => Self::Leader {
                committer: Rc::clone(committer),
                lease: Rc::clone(lease),
            },
            Self::Follower { committer } => Self::Follower {
                committer: Rc::clone(committer),
            },
        }
    }
}

struct ActiveEpoch<P: Providers> {
    context: Rc<EpochContext>,
    role: Role<P>,
}

/// One peer of a Hydra cell.
pub struct HydraManager<P: Providers> {
    this: Weak<Self>,
    self_id: PeerId,
    cell: Rc<CellConfig>,
    config: Rc<HydraConfig>,
    providers: P,
    decorated: Rc<DecoratedAutomaton<P>>,
    changelog_store: Rc<dyn ChangelogStore>,
    snapshot_store: Rc<dyn SnapshotStore>,
    channels: Rc<dyn PeerChannels>,
    election: Rc<dyn ElectionManager>,
    signals: Rc<HydraSignals>,
    control_state: Cell<PeerState>,
    priority: Cell<ElectionPriority>,
    epoch: RefCell<Option<ActiveEpoch<P>>>,
}

impl<P: Providers> HydraManager<P> {
    /// Create a stopped manager.
    pub fn new(dependencies: HydraDependencies<P>) -> Rc<Self> {
        let HydraDependencies {
            self_id,
            cell,
            config,
            providers,
            automaton,
            changelog_store,
            snapshot_store,
            channels,
            election,
        } = dependencies;
        let config = Rc::new(config);
        let decorated = DecoratedAutomaton::new(
            self_id,
            config.clone(),
            providers.clone(),
            automaton,
            snapshot_store.clone(),
        );
        Rc::new_cyclic(|this| Self {
            this: this.clone(),
            self_id,
            cell: Rc::new(cell),
            config,
            providers,
            decorated,
            changelog_store,
            snapshot_store,
            channels,
            election,
            signals: Rc::new(HydraSignals::default()),
            control_state: Cell::new(PeerState::Stopped),
            priority: Cell::new(ElectionPriority::default()),
            epoch: RefCell::new(None),
        })
    }

    /// Compute the reachable state of the local stores and join elections.
    pub async fn initialize(&self) -> Result<(), HydraError> {
        let priority =
            reachable_priority(self.changelog_store.as_ref(), self.snapshot_store.as_ref()).await?;
        self.priority.set(priority);
        self.set_state(PeerState::Elections);
        info!(peer = %self.self_id, %priority, "hydra peer initialized");
        let callbacks: Weak<dyn ElectionCallbacks> = self.this.clone();
        self.election.participate(self.self_id, callbacks);
        Ok(())
    }

    /// Leave elections and stop the current role.
    pub fn finalize(&self) {
        self.election.leave(self.self_id);
        self.stop_epoch(HydraError::invalid_state("Hydra peer is finalizing"));
        self.set_state(PeerState::Stopped);
        info!(peer = %self.self_id, "hydra peer finalized");
    }

    // ========================================================================
    // Public operations
    // ========================================================================

    /// Replicate and apply a mutation.
    ///
    /// Fails with [`HydraError::ReadOnly`] in read-only mode and with an
    /// invalid-state error unless this peer is an active leader (or a
    /// follower asked to forward to its leader).
    pub async fn commit_mutation(
        &self,
        request: MutationRequest,
    ) -> Result<MutationResponse, HydraError> {
        if self.decorated.is_read_only() {
            return Err(HydraError::ReadOnly);
        }
        let state = self.decorated.state();
        match self.current() {
            Some((context, Role::Leader { committer, lease })) => {
                if state != PeerState::Leading {
                    return Err(HydraError::wrong_state(state, "commit mutation"));
                }
                if !lease.is_valid() {
                    return Err(HydraError::invalid_state("leader lease is not valid"));
                }
                if let Some(epoch_id) = request.epoch_id {
                    if epoch_id != context.epoch_id() {
                        return Err(HydraError::InvalidEpoch {
                            expected: context.epoch_id(),
                            received: epoch_id,
                        });
                    }
                }
                if let Some(response) = request
                    .mutation_id
                    .and_then(|id| self.decorated.find_kept_response(&id))
                {
                    debug!(mutation_id = ?request.mutation_id, "returning kept response");
                    return Ok(response);
                }
                committer.commit(&request).await
            }
            Some((context, Role::Follower { .. })) if request.allow_leader_forwarding => {
                let leader = self.channels.channel(context.leader_id());
                let mut forwarded = request;
                forwarded.allow_leader_forwarding = false;
                debug!(leader = %context.leader_id(), "forwarding mutation to leader");
                let call = call_with_timeout(
                    self.providers.time(),
                    self.config.commit_flush_rpc_timeout,
                    "commit forwarded",
                    leader.commit_forwarded(forwarded),
                );
                context.run(call).await
            }
            _ => Err(HydraError::wrong_state(state, "commit mutation")),
        }
    }

    /// Wait until this peer has applied everything the leader committed
    /// when the call was made. Resolves at once on the leader.
    pub async fn sync_with_leader(&self) -> Result<(), HydraError> {
        let state = self.decorated.state();
        match self.current() {
            Some((_, Role::Leader { .. })) if state == PeerState::Leading => Ok(()),
            Some((context, Role::Follower { .. })) if state == PeerState::Following => {
                let leader = self.channels.channel(context.leader_id());
                let call = call_with_timeout(
                    self.providers.time(),
                    self.config.commit_flush_rpc_timeout,
                    "get committed sequence number",
                    leader.get_committed_sequence_number(context.epoch_id()),
                );
                let committed = context.run(call).await?;
                debug!(committed, applied = self.decorated.applied_sequence_number(), "syncing with leader");
                context.run(self.decorated.wait_applied(committed)).await
            }
            _ => Err(HydraError::wrong_state(state, "sync with leader")),
        }
    }

    /// Rotate the changelog and build a distributed snapshot.
    ///
    /// With `set_read_only` the automaton stops accepting mutations first.
    /// Returns the snapshot id, after the local snapshot is stored when
    /// `wait_for_completion` is set.
    pub async fn build_snapshot(
        &self,
        set_read_only: bool,
        wait_for_completion: bool,
    ) -> Result<u32, HydraError> {
        let state = self.decorated.state();
        let Some((context, Role::Leader { committer, .. })) = self.current() else {
            return Err(HydraError::wrong_state(state, "build snapshot"));
        };
        if state != PeerState::Leading {
            return Err(HydraError::wrong_state(state, "build snapshot"));
        }
        if set_read_only {
            self.set_read_only(true);
        }
        let (snapshot_id, built) = committer.start_checkpoint()?;
        if wait_for_completion {
            context.run(built).await?;
        }
        Ok(snapshot_id)
    }

    /// Enter or leave read-only mode.
    pub fn set_read_only(&self, read_only: bool) {
        if self.decorated.is_read_only() != read_only {
            info!(peer = %self.self_id, read_only, "read-only mode changed");
        }
        self.decorated.set_read_only(read_only);
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// This peer.
    pub fn self_id(&self) -> PeerId {
        self.self_id
    }

    /// Role state as driven by the election layer.
    pub fn get_control_state(&self) -> PeerState {
        self.control_state.get()
    }

    /// State of the automaton.
    pub fn get_automaton_state(&self) -> PeerState {
        self.decorated.state()
    }

    /// Leading with a valid lease.
    pub fn is_active_leader(&self) -> bool {
        matches!(
            self.current(),
            Some((_, Role::Leader { lease, .. }))
                if self.decorated.state() == PeerState::Leading && lease.is_valid()
        )
    }

    /// Following with recovery complete.
    pub fn is_active_follower(&self) -> bool {
        matches!(
            self.current(),
            Some((_, Role::Follower { committer }))
                if self.decorated.state() == PeerState::Following && committer.is_ready()
        )
    }

    /// Whether mutations reach the automaton through the log rather than
    /// through recovery replay.
    pub fn is_mutation_logging_enabled(&self) -> bool {
        self.decorated.state().is_active()
    }

    /// Current epoch, if any.
    pub fn epoch_id(&self) -> Option<EpochId> {
        self.epoch
            .borrow()
            .as_ref()
            .map(|active| active.context.epoch_id())
    }

    /// Version of the applied state.
    pub fn get_automaton_version(&self) -> Version {
        self.decorated.automaton_version()
    }

    /// Committed version marker.
    pub fn get_committed_version(&self) -> Version {
        self.decorated.committed_version()
    }

    /// Logged version marker.
    pub fn get_logged_version(&self) -> Version {
        self.decorated.logged_version()
    }

    /// Sequence number of the last applied mutation.
    pub fn applied_sequence_number(&self) -> u64 {
        self.decorated.applied_sequence_number()
    }

    /// Whether read-only mode is active.
    pub fn get_read_only(&self) -> bool {
        self.decorated.is_read_only()
    }

    /// Reign reported by the business automaton.
    pub fn get_current_reign(&self) -> u32 {
        self.decorated.current_reign()
    }

    /// Lifecycle signals.
    pub fn signals(&self) -> &Rc<HydraSignals> {
        &self.signals
    }

    /// Run a read-only closure against the business automaton.
    pub fn with_automaton<R>(&self, f: impl FnOnce(&dyn Automaton) -> R) -> R {
        self.decorated.with_automaton(f)
    }

    // ========================================================================
    // Roles
    // ========================================================================

    fn set_state(&self, state: PeerState) {
        self.control_state.set(state);
        self.decorated.set_state(state);
    }

    fn current(&self) -> Option<(Rc<EpochContext>, Role<P>)> {
        self.epoch
            .borrow()
            .as_ref()
            .map(|active| (Rc::clone(&active.context), active.role.clone()))
    }

    fn new_epoch_context(&self, epoch: ElectionEpoch) -> Rc<EpochContext> {
        let election = Rc::clone(&self.election);
        let self_id = self.self_id;
        let epoch_id = epoch.epoch_id;
        EpochContext::new(
            epoch_id,
            epoch.leader_id,
            self_id,
            Rc::clone(&self.cell),
            self.providers.time().now(),
            Box::new(move |error| election.abandon(self_id, epoch_id, error)),
        )
    }

    fn recovery_context(&self, context: &Rc<EpochContext>) -> RecoveryContext<P> {
        RecoveryContext {
            decorated: Rc::clone(&self.decorated),
            changelogs: Rc::clone(&self.changelog_store),
            snapshots: Rc::clone(&self.snapshot_store),
            epoch: Rc::clone(context),
            config: Rc::clone(&self.config),
            providers: self.providers.clone(),
        }
    }

    /// Bind the automaton to a fresh changelog writer; automaton failures
    /// abandon the epoch.
    fn bind_automaton(&self, context: &Rc<EpochContext>) {
        let writer = ChangelogWriter::spawn(
            Rc::clone(&self.changelog_store),
            context.token().child_token(),
        );
        let weak = Rc::downgrade(context);
        self.decorated.start_epoch(
            context.epoch_id(),
            writer,
            Rc::new(move |error| {
                if let Some(context) = weak.upgrade() {
                    context.request_restart(error);
                }
            }),
        );
    }

    fn is_current(&self, context: &Rc<EpochContext>) -> bool {
        self.epoch
            .borrow()
            .as_ref()
            .map_or(false, |active| Rc::ptr_eq(&active.context, context))
    }

    /// Stop the previous epoch and install a new one with `role`.
    fn start_role(
        &self,
        epoch: ElectionEpoch,
        state: PeerState,
        role: impl FnOnce(&Rc<EpochContext>) -> Role<P>,
    ) -> Rc<EpochContext> {
        self.stop_epoch(HydraError::invalid_state("new epoch started"));
        let context = self.new_epoch_context(epoch);
        *self.epoch.borrow_mut() = Some(ActiveEpoch {
            context: Rc::clone(&context),
            role: role(&context),
        });
        self.set_state(state);
        context
    }

    async fn run_leader(&self, context: &Rc<EpochContext>) -> Result<(), HydraError> {
        let recovery = LeaderRecovery::new(self.recovery_context(context));
        recovery.run().await?;

        self.bind_automaton(context);
        let (version, rotated) = self.decorated.rotate_changelog()?;
        context.run(rotated).await?;
        if !self.is_current(context) {
            return Err(HydraError::epoch_canceled());
        }

        let committer = LeaderCommitter::new(
            Rc::clone(context),
            Rc::clone(&self.config),
            self.providers.clone(),
            Rc::clone(&self.decorated),
            Rc::clone(&self.channels),
        );
        let lease = LeaseTracker::new(
            Rc::clone(context),
            Rc::clone(&self.config),
            self.providers.clone(),
            Rc::clone(&self.channels),
            Rc::clone(&self.signals),
        );
        if let Some(active) = self.epoch.borrow_mut().as_mut() {
            active.role = Role::Leader {
                committer: Rc::clone(&committer),
                lease: Rc::clone(&lease),
            };
        }
        self.set_state(PeerState::Leading);
        context.spawn(committer.run());
        context.spawn(lease.run());

        info!(
            peer = %self.self_id,
            epoch = %context.epoch_id(),
            %version,
            "leader recovery complete"
        );
        self.signals.leader_recovery_complete.fire(&context.epoch_id());
        Ok(())
    }

    async fn run_follower(
        &self,
        context: &Rc<EpochContext>,
        committer: Rc<FollowerCommitter<P>>,
    ) -> Result<(), HydraError> {
        let recovery = FollowerRecovery::new(self.recovery_context(context), self.channels.as_ref());
        let sync = recovery.run().await?;
        if !self.is_current(context) {
            return Err(HydraError::epoch_canceled());
        }

        self.bind_automaton(context);
        self.set_state(PeerState::Following);
        committer.set_ready();
        context.spawn(Rc::clone(&committer).watchdog());

        info!(
            peer = %self.self_id,
            epoch = %context.epoch_id(),
            leader = %context.leader_id(),
            version = %sync.version,
            "follower recovery complete"
        );
        self.signals
            .follower_recovery_complete
            .fire(&context.epoch_id());
        Ok(())
    }

    /// Tear down the current epoch. Returns whether one was active.
    fn stop_epoch(&self, error: HydraError) -> bool {
        let active = self.epoch.borrow_mut().take();
        let Some(active) = active else {
            return false;
        };
        info!(
            peer = %self.self_id,
            epoch = %active.context.epoch_id(),
            %error,
            "stopping epoch"
        );
        active.context.cancel();
        self.decorated.stop_epoch();
        self.set_state(PeerState::Elections);
        self.refresh_priority();
        true
    }

    /// Recompute the election priority from the local stores.
    fn refresh_priority(&self) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        tokio::task::spawn_local(async move {
            match reachable_priority(this.changelog_store.as_ref(), this.snapshot_store.as_ref())
                .await
            {
                Ok(priority) => this.priority.set(priority),
                Err(error) => warn!(peer = %this.self_id, %error, "cannot compute election priority"),
            }
        });
    }

    fn follower_committer(&self) -> Result<Rc<FollowerCommitter<P>>, HydraError> {
        match self.current() {
            Some((_, Role::Follower { committer })) => Ok(committer),
            _ => Err(HydraError::wrong_state(self.decorated.state(), "accept leader calls")),
        }
    }

    fn leader_committer(&self, epoch_id: EpochId) -> Result<Rc<LeaderCommitter<P>>, HydraError> {
        let state = self.decorated.state();
        match self.current() {
            Some((context, Role::Leader { committer, .. })) if state == PeerState::Leading => {
                if context.epoch_id() != epoch_id {
                    return Err(HydraError::InvalidEpoch {
                        expected: context.epoch_id(),
                        received: epoch_id,
                    });
                }
                Ok(committer)
            }
            _ => Err(HydraError::wrong_state(state, "serve followers")),
        }
    }
}

impl<P: Providers> ElectionCallbacks for HydraManager<P> {
    fn on_start_leading(&self, epoch: ElectionEpoch) {
        info!(peer = %self.self_id, epoch = %epoch.epoch_id, "starting leading");
        let context = self.start_role(epoch, PeerState::LeaderRecovery, |_| Role::LeaderRecovery);
        self.signals.start_leading.fire(&epoch.epoch_id);

        let Some(this) = self.this.upgrade() else {
            return;
        };
        let task_context = Rc::clone(&context);
        context.spawn(async move {
            if let Err(error) = this.run_leader(&task_context).await {
                warn!(peer = %this.self_id, %error, "leader recovery failed");
                task_context.request_restart(error);
            }
        });
    }

    fn on_stop_leading(&self, error: HydraError) {
        if self.stop_epoch(error.clone()) {
            self.signals.stop_leading.fire(&error);
        }
    }

    fn on_start_following(&self, epoch: ElectionEpoch) {
        info!(
            peer = %self.self_id,
            epoch = %epoch.epoch_id,
            leader = %epoch.leader_id,
            "starting following"
        );
        // The committer exists from the start so the leader is told "not
        // ready" while recovery runs.
        let mut committer = None;
        let context = self.start_role(epoch, PeerState::FollowerRecovery, |context| {
            let follower = FollowerCommitter::new(
                Rc::clone(context),
                Rc::clone(&self.config),
                self.providers.clone(),
                Rc::clone(&self.decorated),
            );
            committer = Some(Rc::clone(&follower));
            Role::Follower {
                committer: follower,
            }
        });
        let Some(committer) = committer else {
            return;
        };
        self.signals.start_following.fire(&epoch.epoch_id);

        let Some(this) = self.this.upgrade() else {
            return;
        };
        let task_context = Rc::clone(&context);
        context.spawn(async move {
            if let Err(error) = this.run_follower(&task_context, committer).await {
                warn!(peer = %this.self_id, %error, "follower recovery failed");
                task_context.request_restart(error);
            }
        });
    }

    fn on_stop_following(&self, error: HydraError) {
        if self.stop_epoch(error.clone()) {
            self.signals.stop_following.fire(&error);
        }
    }

    fn priority(&self) -> ElectionPriority {
        // The stores may lag behind records logged in the running epoch.
        let live = ElectionPriority {
            epoch: self.decorated.last_epoch(),
            version: self.decorated.logged_version(),
        };
        self.priority.get().max(live)
    }
}

#[async_trait(?Send)]
impl<P: Providers> HydraService for HydraManager<P> {
    async fn accept_mutations(
        &self,
        request: AcceptMutationsRequest,
    ) -> Result<AcceptMutationsResponse, HydraError> {
        let committer = self.follower_committer()?;
        committer.accept_mutations(request).await
    }

    async fn ping_follower(
        &self,
        epoch_id: EpochId,
        leader_id: PeerId,
    ) -> Result<PingFollowerResponse, HydraError> {
        self.follower_committer()?.ping(epoch_id, leader_id)
    }

    async fn get_sync_state(&self, epoch_id: EpochId) -> Result<SyncState, HydraError> {
        self.leader_committer(epoch_id)?.sync_state()
    }

    async fn lookup_changelog(
        &self,
        changelog_id: u32,
    ) -> Result<Option<ChangelogInfo>, HydraError> {
        let Some(changelog) = open_existing(self.changelog_store.as_ref(), changelog_id).await?
        else {
            return Ok(None);
        };
        let epoch = record_epoch(changelog.as_ref(), 0).await?;
        Ok(Some(ChangelogInfo {
            record_count: changelog.record_count(),
            epoch,
        }))
    }

    async fn read_changelog(
        &self,
        changelog_id: u32,
        first_record_id: u32,
        max_records: u32,
    ) -> Result<Vec<Vec<u8>>, HydraError> {
        let changelog = self.changelog_store.open_changelog(changelog_id).await?;
        Ok(changelog.read(first_record_id, max_records).await?)
    }

    async fn get_committed_sequence_number(&self, epoch_id: EpochId) -> Result<u64, HydraError> {
        Ok(self.leader_committer(epoch_id)?.committed_sequence_number())
    }

    async fn force_restart(&self, epoch_id: EpochId, reason: String) -> Result<(), HydraError> {
        let Some((context, _)) = self.current() else {
            return Err(HydraError::wrong_state(self.decorated.state(), "restart"));
        };
        if context.epoch_id() != epoch_id {
            return Err(HydraError::InvalidEpoch {
                expected: context.epoch_id(),
                received: epoch_id,
            });
        }
        if context.is_leader() {
            return Err(HydraError::invalid_state("leader cannot be restarted by a peer"));
        }
        info!(peer = %self.self_id, %epoch_id, %reason, "restart forced by leader");
        context.request_restart(HydraError::invalid_state(reason));
        Ok(())
    }

    async fn commit_forwarded(
        &self,
        request: MutationRequest,
    ) -> Result<MutationResponse, HydraError> {
        self.commit_mutation(request).await
    }
}
