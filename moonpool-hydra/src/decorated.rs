//! The decorated automaton.
//!
//! [`DecoratedAutomaton`] wraps the business [`Automaton`] and is the single
//! source of truth for its version. It turns the asynchronous replication
//! pipeline into a strictly ordered sequence of synchronous applications.
//!
//! ## Versions
//!
//! Three next-position markers are tracked:
//!
//! ```text
//!            applied          committed          logged
//!   ─────────────┼────────────────┼─────────────────┼──────>
//!   automaton_version  <=  committed_version  <=  logged_version
//! ```
//!
//! - **logged**: where the next record will be written
//! - **committed**: records before it are durable on a quorum
//! - **automaton**: records before it have been applied
//!
//! The chain holds on every active peer. During recovery records are
//! applied straight from the changelog and the chain is rebuilt by
//! [`DecoratedAutomaton::finish_recovery`].
//!
//! ## Pending mutations
//!
//! Logged but not yet applied mutations wait in a FIFO queue. Leader
//! mutations carry a commit promise; follower mutations do not.
//! [`DecoratedAutomaton::commit_mutations`] pops the queue in order and
//! applies every entry positioned before the committed version.
//!
//! Applying a record requires its sequence number to be exactly one past
//! the last applied one, so nothing is applied twice or out of order.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use crate::automaton::{Automaton, AutomatonError, MutationContext};
use crate::changelog::ChangelogWriter;
use crate::config::HydraConfig;
use crate::error::HydraError;
use crate::lock::AutomatonLocks;
use crate::kept::ResponseKeeper;
use crate::promise::{promise, Promise, PromiseFuture};
use crate::providers::{Providers, RandomProvider, TimeProvider};
use crate::snapshot::{split_snapshot_envelope, SnapshotMeta, SnapshotParams, SnapshotStore};
use crate::snapshot_builder::{persist_snapshot, snapshot_builder};
use crate::types::{
    EpochId, MutationId, MutationRequest, MutationResponse, PeerId, PeerState, Version,
};
use crate::wire::{deserialize_mutation_record, serialize_mutation_record, MutationHeader};

/// Mutation type of the empty heartbeat mutation. Never reaches the
/// business automaton.
pub const HEARTBEAT_MUTATION_TYPE: &str = "hydra.heartbeat";

/// Result of applying one mutation. The error is a deterministic
/// handler failure; the record was consumed either way.
pub type MutationOutcome = Result<MutationResponse, HydraError>;

/// A logged mutation waiting to be applied.
#[derive(Debug)]
pub struct PendingMutation {
    /// Decoded record header.
    pub header: MutationHeader,
    /// Business payload.
    pub payload: Vec<u8>,
    promise: Option<Promise<MutationResponse>>,
}

/// What logging a leader mutation produces.
#[derive(Debug)]
pub struct LoggedMutation {
    /// Position of the record.
    pub version: Version,
    /// Global index of the record.
    pub sequence_number: u64,
    /// Serialized record, as shipped to followers.
    pub record: Vec<u8>,
    /// Resolves once the record is durable locally.
    pub flushed: PromiseFuture<()>,
    /// Resolves once the mutation is applied.
    pub committed: PromiseFuture<MutationResponse>,
}

struct EpochBinding {
    epoch_id: EpochId,
    writer: ChangelogWriter,
    on_failure: Rc<dyn Fn(HydraError)>,
}

struct SnapshotRequest {
    snapshot_id: u32,
    sequence_number: u64,
    version: Version,
    promise: Promise<SnapshotParams>,
}

/// Resets the committing flag when the apply loop ends or is dropped.
struct CommitLoopGuard<'a>(&'a Cell<bool>);

impl Drop for CommitLoopGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// Business automaton plus version bookkeeping and the pending queue.
pub struct DecoratedAutomaton<P: Providers> {
    self_id: PeerId,
    config: Rc<HydraConfig>,
    providers: P,
    automaton: RefCell<Box<dyn Automaton>>,
    snapshot_store: Rc<dyn SnapshotStore>,
    locks: Rc<AutomatonLocks>,
    kept: RefCell<ResponseKeeper>,

    state: Cell<PeerState>,
    automaton_version: Cell<Version>,
    committed_version: Cell<Version>,
    logged_version: Cell<Version>,
    applied_sequence_number: Cell<u64>,
    logged_sequence_number: Cell<u64>,
    last_random_seed: Cell<u64>,
    last_logged_random_seed: Cell<u64>,
    last_logged_timestamp: Cell<u64>,
    last_epoch: Cell<EpochId>,
    segment_data_size: Cell<u64>,
    read_only: Cell<bool>,
    committing: Cell<bool>,

    binding: RefCell<Option<EpochBinding>>,
    pending: RefCell<VecDeque<PendingMutation>>,
    snapshot_request: RefCell<Option<SnapshotRequest>>,
    applied: watch::Sender<u64>,
}

impl<P: Providers> DecoratedAutomaton<P> {
    /// Wrap a business automaton at the genesis version.
    pub fn new(
        self_id: PeerId,
        config: Rc<HydraConfig>,
        providers: P,
        automaton: Box<dyn Automaton>,
        snapshot_store: Rc<dyn SnapshotStore>,
    ) -> Rc<Self> {
        let (applied, _) = watch::channel(0);
        Rc::new(Self {
            self_id,
            kept: RefCell::new(ResponseKeeper::new(config.max_kept_responses)),
            config,
            providers,
            automaton: RefCell::new(automaton),
            snapshot_store,
            locks: AutomatonLocks::new(),
            state: Cell::new(PeerState::Stopped),
            automaton_version: Cell::new(Version::ZERO),
            committed_version: Cell::new(Version::ZERO),
            logged_version: Cell::new(Version::ZERO),
            applied_sequence_number: Cell::new(0),
            logged_sequence_number: Cell::new(0),
            last_random_seed: Cell::new(0),
            last_logged_random_seed: Cell::new(0),
            last_logged_timestamp: Cell::new(0),
            last_epoch: Cell::new(EpochId::NONE),
            segment_data_size: Cell::new(0),
            read_only: Cell::new(false),
            committing: Cell::new(false),
            binding: RefCell::new(None),
            pending: RefCell::new(VecDeque::new()),
            snapshot_request: RefCell::new(None),
            applied,
        })
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Current automaton state.
    pub fn state(&self) -> PeerState {
        self.state.get()
    }

    /// Set the automaton state. Driven by the manager only.
    pub fn set_state(&self, state: PeerState) {
        if self.state.replace(state) != state {
            debug!(peer = %self.self_id, %state, "automaton state changed");
        }
    }

    /// Records before this version have been applied.
    pub fn automaton_version(&self) -> Version {
        self.automaton_version.get()
    }

    /// Records before this version are durable on a quorum.
    pub fn committed_version(&self) -> Version {
        self.committed_version.get()
    }

    /// The next record will be logged here.
    pub fn logged_version(&self) -> Version {
        self.logged_version.get()
    }

    /// Sequence number of the last applied record.
    pub fn applied_sequence_number(&self) -> u64 {
        self.applied_sequence_number.get()
    }

    /// Sequence number of the last logged record.
    pub fn logged_sequence_number(&self) -> u64 {
        self.logged_sequence_number.get()
    }

    /// Random seed of the last applied record.
    pub fn last_random_seed(&self) -> u64 {
        self.last_random_seed.get()
    }

    /// Epoch of the last record logged or applied.
    pub fn last_epoch(&self) -> EpochId {
        self.last_epoch.get()
    }

    /// Bytes logged into the current segment.
    pub fn segment_data_size(&self) -> u64 {
        self.segment_data_size.get()
    }

    /// Number of logged, unapplied mutations.
    pub fn pending_count(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Whether new mutations are rejected.
    pub fn is_read_only(&self) -> bool {
        self.read_only.get()
    }

    /// Enter or leave read-only mode.
    pub fn set_read_only(&self, read_only: bool) {
        if self.read_only.replace(read_only) != read_only {
            info!(peer = %self.self_id, read_only, "read-only mode changed");
        }
    }

    /// Reign of the business automaton.
    pub fn current_reign(&self) -> u32 {
        self.automaton.borrow().current_reign()
    }

    /// Lock counters of the business automaton.
    pub fn locks(&self) -> &Rc<AutomatonLocks> {
        &self.locks
    }

    /// The response kept for a mutation id.
    pub fn find_kept_response(&self, id: &MutationId) -> Option<MutationResponse> {
        self.kept.borrow().find(id).cloned()
    }

    /// Committed version marker after record `sequence_number` is applied.
    ///
    /// Returns `None` for records that are neither applied nor pending.
    pub fn version_after_sequence(&self, sequence_number: u64) -> Option<Version> {
        if sequence_number == self.applied_sequence_number.get() {
            return Some(self.automaton_version.get());
        }
        self.pending
            .borrow()
            .iter()
            .find(|mutation| mutation.header.sequence_number == sequence_number)
            .map(|mutation| mutation.header.version.advance())
    }

    /// Run a read-only closure against the business automaton.
    pub fn with_automaton<R>(&self, f: impl FnOnce(&dyn Automaton) -> R) -> R {
        f(self.automaton.borrow().as_ref())
    }

    /// Resolves once record `sequence_number` has been applied.
    pub async fn wait_applied(&self, sequence_number: u64) -> Result<(), HydraError> {
        let mut receiver = self.applied.subscribe();
        receiver
            .wait_for(|applied| *applied >= sequence_number)
            .await
            .map(|_| ())
            .map_err(|_| HydraError::invalid_state("automaton dropped"))
    }

    // ========================================================================
    // Epoch lifecycle
    // ========================================================================

    /// Attach the changelog writer of a new epoch.
    pub fn start_epoch(
        &self,
        epoch_id: EpochId,
        writer: ChangelogWriter,
        on_failure: Rc<dyn Fn(HydraError)>,
    ) {
        *self.binding.borrow_mut() = Some(EpochBinding {
            epoch_id,
            writer,
            on_failure,
        });
    }

    /// Epoch the automaton is currently logging for.
    pub fn epoch_id(&self) -> Option<EpochId> {
        self.binding.borrow().as_ref().map(|binding| binding.epoch_id)
    }

    /// Detach from the epoch and fail everything still pending.
    ///
    /// Logged but unapplied records stay in the changelog; the next
    /// recovery decides their fate.
    pub fn stop_epoch(&self) {
        self.binding.borrow_mut().take();
        let pending: Vec<PendingMutation> = self.pending.borrow_mut().drain(..).collect();
        let failed = pending.len();
        for mutation in pending {
            if let Some(promise) = mutation.promise {
                promise.set_error(HydraError::invalid_state("Hydra peer has stopped"));
            }
        }
        if let Some(request) = self.snapshot_request.borrow_mut().take() {
            request
                .promise
                .set_error(HydraError::invalid_state("Hydra peer has stopped"));
        }

        self.committed_version.set(self.automaton_version.get());
        self.logged_version.set(self.automaton_version.get());
        self.logged_sequence_number
            .set(self.applied_sequence_number.get());
        self.last_logged_random_seed.set(self.last_random_seed.get());
        self.segment_data_size.set(0);
        debug!(
            peer = %self.self_id,
            version = %self.automaton_version.get(),
            failed,
            "automaton detached from epoch"
        );
    }

    /// Rebuild the version chain after recovery replayed up to `version`.
    pub fn finish_recovery(&self, version: Version) {
        let version = version.max(self.automaton_version.get());
        self.automaton_version.set(version);
        self.committed_version.set(version);
        self.logged_version.set(version);
        self.logged_sequence_number
            .set(self.applied_sequence_number.get());
        self.last_logged_random_seed.set(self.last_random_seed.get());
        self.segment_data_size.set(0);
        info!(
            peer = %self.self_id,
            %version,
            sequence_number = self.applied_sequence_number.get(),
            "automaton recovered"
        );
    }

    /// Reset to the genesis state.
    pub fn clear(&self) -> Result<(), HydraError> {
        if !self.pending.borrow().is_empty() {
            return Err(HydraError::invalid_state(
                "cannot clear automaton with pending mutations",
            ));
        }
        let _guard = self.locks.acquire_system();
        self.automaton.borrow_mut().clear();
        self.kept.borrow_mut().clear();
        self.automaton_version.set(Version::ZERO);
        self.committed_version.set(Version::ZERO);
        self.logged_version.set(Version::ZERO);
        self.applied_sequence_number.set(0);
        self.logged_sequence_number.set(0);
        self.last_random_seed.set(0);
        self.last_logged_random_seed.set(0);
        self.last_epoch.set(EpochId::NONE);
        self.segment_data_size.set(0);
        self.applied.send_replace(0);
        warn!(peer = %self.self_id, "automaton cleared");
        Ok(())
    }

    // ========================================================================
    // Logging
    // ========================================================================

    /// Assign the next version to a leader mutation and log it.
    ///
    /// The returned futures resolve when the record is durable locally and
    /// when the mutation has been applied after reaching a quorum.
    pub fn log_leader_mutation(
        &self,
        request: &MutationRequest,
    ) -> Result<LoggedMutation, HydraError> {
        let state = self.state.get();
        if state != PeerState::Leading {
            return Err(HydraError::wrong_state(state, "log leader mutation"));
        }
        if self.read_only.get() && request.mutation_type != HEARTBEAT_MUTATION_TYPE {
            return Err(HydraError::ReadOnly);
        }
        let binding = self.binding.borrow();
        let binding = binding
            .as_ref()
            .ok_or_else(|| HydraError::invalid_state("automaton is not bound to an epoch"))?;
        if let Some(epoch_id) = request.epoch_id {
            if epoch_id != binding.epoch_id {
                return Err(HydraError::InvalidEpoch {
                    expected: binding.epoch_id,
                    received: epoch_id,
                });
            }
        }

        let version = self.logged_version.get();
        let sequence_number = self.logged_sequence_number.get() + 1;
        let random_seed: u64 = self.providers.random().random();
        let wall_micros = self.providers.time().wall_time().as_micros() as u64;
        let timestamp_micros = wall_micros.max(self.last_logged_timestamp.get() + 1);
        let header = MutationHeader {
            mutation_type: request.mutation_type.clone(),
            reign: request
                .reign
                .unwrap_or_else(|| self.automaton.borrow().current_reign()),
            mutation_id: request.mutation_id,
            timestamp_micros,
            random_seed,
            prev_random_seed: self.last_logged_random_seed.get(),
            version,
            sequence_number,
            epoch: binding.epoch_id,
        };
        let record = serialize_mutation_record(&header, &request.payload)?;
        let flushed = binding.writer.append(version, record.clone());
        let (commit_promise, committed) = promise();

        self.pending.borrow_mut().push_back(PendingMutation {
            header,
            payload: request.payload.clone(),
            promise: Some(commit_promise),
        });
        self.logged_version.set(version.advance());
        self.logged_sequence_number.set(sequence_number);
        self.last_logged_random_seed.set(random_seed);
        self.last_logged_timestamp.set(timestamp_micros);
        self.last_epoch.set(binding.epoch_id);
        self.segment_data_size
            .set(self.segment_data_size.get() + record.len() as u64);
        trace!(
            %version,
            sequence_number,
            mutation_type = %request.mutation_type,
            "leader mutation logged"
        );

        Ok(LoggedMutation {
            version,
            sequence_number,
            record,
            flushed,
            committed,
        })
    }

    /// Log a record received from the leader.
    ///
    /// Fails with [`HydraError::OutOfOrder`] unless the record directly
    /// follows the last logged one.
    pub fn log_follower_mutation(&self, record: Vec<u8>) -> Result<PromiseFuture<()>, HydraError> {
        let state = self.state.get();
        if state != PeerState::Following {
            return Err(HydraError::wrong_state(state, "log follower mutation"));
        }
        let binding = self.binding.borrow();
        let binding = binding
            .as_ref()
            .ok_or_else(|| HydraError::invalid_state("automaton is not bound to an epoch"))?;

        let (header, payload) = deserialize_mutation_record(&record)?;
        let expected = self.logged_sequence_number.get() + 1;
        if header.sequence_number != expected {
            return Err(HydraError::OutOfOrder {
                expected,
                received: header.sequence_number,
            });
        }
        let logged_version = self.logged_version.get();
        if header.version < logged_version {
            return Err(HydraError::recovery(format!(
                "record {} precedes logged version {logged_version}",
                header.version
            )));
        }
        if header.version.segment_id != logged_version.segment_id {
            self.segment_data_size.set(0);
        }

        let version = header.version;
        let flushed = binding.writer.append(version, record.clone());
        self.logged_version.set(version.advance());
        self.logged_sequence_number.set(header.sequence_number);
        self.last_logged_random_seed.set(header.random_seed);
        self.last_logged_timestamp.set(header.timestamp_micros);
        self.last_epoch.set(header.epoch);
        self.segment_data_size
            .set(self.segment_data_size.get() + record.len() as u64);
        trace!(%version, sequence_number = header.sequence_number, "follower mutation logged");

        self.pending.borrow_mut().push_back(PendingMutation {
            header,
            payload,
            promise: None,
        });
        Ok(flushed)
    }

    /// Close the current segment and start logging into the next one.
    ///
    /// Returns the first version of the new segment.
    pub fn rotate_changelog(&self) -> Result<(Version, PromiseFuture<()>), HydraError> {
        let binding = self.binding.borrow();
        let binding = binding
            .as_ref()
            .ok_or_else(|| HydraError::invalid_state("automaton is not bound to an epoch"))?;
        let version = self.logged_version.get().rotate();
        let rotated = binding.writer.rotate(version.segment_id);
        self.logged_version.set(version);
        self.segment_data_size.set(0);
        info!(peer = %self.self_id, %version, "changelog rotation requested");
        Ok((version, rotated))
    }

    // ========================================================================
    // Applying
    // ========================================================================

    /// Replay one changelog record during recovery.
    ///
    /// Records that were already applied are skipped, so replaying a
    /// segment twice is harmless.
    pub fn apply_mutation_during_recovery(&self, record: &[u8]) -> Result<(), HydraError> {
        let state = self.state.get();
        if !state.is_recovery() {
            return Err(HydraError::wrong_state(state, "apply mutation during recovery"));
        }
        let (header, payload) = deserialize_mutation_record(record)?;
        if header.sequence_number <= self.applied_sequence_number.get() {
            trace!(
                sequence_number = header.sequence_number,
                "skipping already applied record"
            );
            return Ok(());
        }
        if let Err(error) = self.apply(&header, &payload)? {
            debug!(%error, version = %header.version, "replayed mutation failed");
        }
        Ok(())
    }

    /// Apply every pending mutation positioned before `version`.
    ///
    /// Mutations are applied one at a time, in log order. With `may_yield`
    /// the loop yields to other tasks once it has run for
    /// `max_commit_batch_duration`. A second call while a loop is running
    /// only raises the committed version; the running loop picks it up.
    pub async fn commit_mutations(&self, version: Version, may_yield: bool) -> Result<(), HydraError> {
        let bounded = version.min(self.logged_version.get());
        if bounded > self.committed_version.get() {
            self.committed_version.set(bounded);
        }
        if self.committing.replace(true) {
            return Ok(());
        }
        let _guard = CommitLoopGuard(&self.committing);

        let mut batch_start = self.providers.time().now();
        loop {
            if self.locks.is_system_locked() {
                self.locks.wait_system_released().await;
            }
            let mutation = {
                let mut pending = self.pending.borrow_mut();
                match pending.front() {
                    Some(front) if front.header.version < self.committed_version.get() => {
                        pending.pop_front()
                    }
                    _ => None,
                }
            };
            let Some(mutation) = mutation else {
                return Ok(());
            };

            match self.apply(&mutation.header, &mutation.payload) {
                Ok(outcome) => {
                    if let Err(error) = &outcome {
                        if self.state.get().is_leader() && self.config.step_down_on_mutation_failure {
                            self.report_failure(error.clone());
                        }
                    }
                    if let Some(promise) = mutation.promise {
                        promise.set(outcome);
                    }
                }
                Err(fatal) => {
                    if let Some(promise) = mutation.promise {
                        promise.set_error(fatal.clone());
                    }
                    self.report_failure(fatal.clone());
                    return Err(fatal);
                }
            }
            self.maybe_start_snapshot();

            if may_yield {
                let now = self.providers.time().now();
                if now.saturating_sub(batch_start) >= self.config.max_commit_batch_duration {
                    tokio::task::yield_now().await;
                    batch_start = self.providers.time().now();
                }
            }
        }
    }

    /// Apply one record. The outer error is fatal (order violation); the
    /// inner one is a deterministic handler failure.
    fn apply(
        &self,
        header: &MutationHeader,
        payload: &[u8],
    ) -> Result<MutationOutcome, HydraError> {
        let expected = self.applied_sequence_number.get() + 1;
        if header.sequence_number != expected {
            error!(
                alert = true,
                expected,
                received = header.sequence_number,
                "mutation applied out of order"
            );
            return Err(HydraError::OutOfOrder {
                expected,
                received: header.sequence_number,
            });
        }
        let automaton_version = self.automaton_version.get();
        if header.version < automaton_version {
            error!(
                alert = true,
                version = %header.version,
                %automaton_version,
                "mutation version precedes automaton version"
            );
            return Err(HydraError::recovery(format!(
                "mutation {} precedes automaton version {automaton_version}",
                header.version
            )));
        }
        if header.prev_random_seed != self.last_random_seed.get() {
            error!(
                alert = true,
                version = %header.version,
                expected = self.last_random_seed.get(),
                received = header.prev_random_seed,
                "random seed chain broken"
            );
        }

        let _guard = self
            .locks
            .try_acquire_user()
            .ok_or_else(|| HydraError::invalid_state("automaton is locked"))?;

        let kept = header
            .mutation_id
            .and_then(|id| self.kept.borrow().find(&id).cloned());
        let outcome = if header.mutation_type == HEARTBEAT_MUTATION_TYPE {
            Ok(MutationResponse::default())
        } else if let Some(response) = kept {
            debug!(version = %header.version, "mutation already applied, returning kept response");
            Ok(response)
        } else {
            let mut context = MutationContext::new(
                &header.mutation_type,
                payload,
                header.version,
                header.sequence_number,
                header.epoch,
                header.reign,
                header.mutation_id,
                std::time::Duration::from_micros(header.timestamp_micros),
                header.random_seed,
            );
            let result = self.automaton.borrow_mut().apply_mutation(&mut context);
            match result {
                Ok(data) => {
                    let response = MutationResponse::new(data);
                    if let Some(id) = header.mutation_id {
                        self.kept.borrow_mut().register(id, response.clone());
                    }
                    Ok(response)
                }
                Err(AutomatonError { message }) => {
                    error!(
                        alert = true,
                        peer = %self.self_id,
                        version = %header.version,
                        mutation_type = %header.mutation_type,
                        reason = %message,
                        "mutation handler failed"
                    );
                    Err(HydraError::MutationFailed {
                        mutation_type: header.mutation_type.clone(),
                        reason: message,
                    })
                }
            }
        };

        self.automaton_version.set(header.version.advance());
        self.applied_sequence_number.set(header.sequence_number);
        self.last_random_seed.set(header.random_seed);
        self.last_epoch.set(self.last_epoch.get().max(header.epoch));
        self.applied.send_replace(header.sequence_number);
        Ok(outcome)
    }

    fn report_failure(&self, error: HydraError) {
        let on_failure = self
            .binding
            .borrow()
            .as_ref()
            .map(|binding| binding.on_failure.clone());
        if let Some(on_failure) = on_failure {
            on_failure(error);
        }
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    /// Build a snapshot once record `sequence_number` has been applied.
    ///
    /// The snapshot is recorded at `version`, which is the first position of
    /// segment `snapshot_id`. Fails at once if the automaton is already past
    /// `sequence_number`.
    pub fn build_snapshot(
        &self,
        snapshot_id: u32,
        sequence_number: u64,
        version: Version,
    ) -> PromiseFuture<SnapshotParams> {
        let (snapshot_promise, future) = promise();
        let applied = self.applied_sequence_number.get();
        if sequence_number < applied {
            snapshot_promise.set_error(HydraError::invalid_state(format!(
                "snapshot point {sequence_number} already passed, automaton at {applied}"
            )));
            return future;
        }
        let previous = self.snapshot_request.borrow_mut().replace(SnapshotRequest {
            snapshot_id,
            sequence_number,
            version,
            promise: snapshot_promise,
        });
        if let Some(previous) = previous {
            previous
                .promise
                .set_error(HydraError::invalid_state("snapshot superseded"));
        }
        debug!(snapshot_id, sequence_number, %version, "snapshot scheduled");
        self.maybe_start_snapshot();
        future
    }

    fn maybe_start_snapshot(&self) {
        let applied = self.applied_sequence_number.get();
        let ready = matches!(
            &*self.snapshot_request.borrow(),
            Some(request) if request.sequence_number == applied
        );
        if !ready {
            return;
        }
        let Some(request) = self.snapshot_request.borrow_mut().take() else {
            return;
        };

        let kept = match self.kept.borrow().encode() {
            Ok(kept) => kept,
            Err(error) => {
                request.promise.set_error(AutomatonError::from(error).into());
                return;
            }
        };
        let job = snapshot_builder(self.config.snapshot_strategy).capture(
            self.automaton.borrow().as_ref(),
            kept,
            &self.locks,
        );
        let job = match job {
            Ok(job) => job,
            Err(error) => {
                request.promise.set_error(error);
                return;
            }
        };

        let meta = SnapshotMeta {
            snapshot_id: request.snapshot_id,
            version: request.version,
            sequence_number: request.sequence_number,
            random_seed: self.last_random_seed.get(),
            timestamp_micros: self.providers.time().wall_time().as_micros() as u64,
            checksum: 0,
        };
        let store = self.snapshot_store.clone();
        let time = self.providers.time().clone();
        let timeout = self.config.snapshot_build_timeout;
        tokio::task::spawn_local(async move {
            let result = persist_snapshot(&time, timeout, store.as_ref(), meta, job).await;
            if let Err(error) = &result {
                warn!(snapshot_id = request.snapshot_id, %error, "snapshot build failed");
            }
            request.promise.set(result);
        });
    }

    /// Replace the automaton state with a snapshot.
    ///
    /// Sets all three versions to the snapshot version. Only legal while no
    /// mutation is pending.
    pub fn load_snapshot(&self, meta: &SnapshotMeta, data: &[u8]) -> Result<(), HydraError> {
        if !self.pending.borrow().is_empty() {
            return Err(HydraError::invalid_state(
                "cannot load snapshot with pending mutations",
            ));
        }
        let (kept, state) = split_snapshot_envelope(meta.snapshot_id, data)?;
        let _guard = self.locks.acquire_system();
        {
            let mut automaton = self.automaton.borrow_mut();
            automaton.clear();
            let mut reader: &[u8] = state;
            automaton.load_snapshot(&mut reader)?;
        }
        self.kept
            .borrow_mut()
            .decode(kept)
            .map_err(AutomatonError::from)?;

        self.automaton_version.set(meta.version);
        self.committed_version.set(meta.version);
        self.logged_version.set(meta.version);
        self.applied_sequence_number.set(meta.sequence_number);
        self.logged_sequence_number.set(meta.sequence_number);
        self.last_random_seed.set(meta.random_seed);
        self.last_logged_random_seed.set(meta.random_seed);
        self.segment_data_size.set(0);
        self.applied.send_replace(meta.sequence_number);
        info!(
            peer = %self.self_id,
            snapshot_id = meta.snapshot_id,
            version = %meta.version,
            sequence_number = meta.sequence_number,
            "snapshot loaded"
        );
        Ok(())
    }
}
