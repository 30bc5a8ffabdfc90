//! Leader and follower committers.
//!
//! The leader committer turns locally logged mutations into committed ones.
//! Every record the leader logs is queued and shipped to the followers in
//! `AcceptMutations` batches; a record is committed once a quorum of peers
//! (leader included) has it durably logged.
//!
//! ```text
//! Leader                                       Follower
//!   │ log_leader_mutation(seq 7)                   │
//!   │── AcceptMutations(start=7, committed=6) ────>│ log, flush
//!   │<── logged=7 ─────────────────────────────────│ commit up to 6
//!   │ quorum logged 7 => committed = 7             │
//!   │ commit_mutations(apply 7)                    │
//!   │── AcceptMutations(start=8, committed=7) ────>│ commit up to 7
//! ```
//!
//! At most one batch per follower is in flight. A follower that is still
//! recovering answers "not ready" and is retried after `restart_backoff`;
//! a follower that needs records already dropped from the queue is told to
//! restart.
//!
//! ## Checkpoints
//!
//! When the current segment grows past its limits (or the snapshot period
//! elapses) the leader rotates the changelog and schedules a distributed
//! snapshot: every peer snapshots the automaton at the same sequence
//! number, and followers report back the checksum of what they stored.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, trace, warn};

use crate::channel::{
    call_with_timeout, AcceptMutationsRequest, AcceptMutationsResponse, PeerChannels,
    PingFollowerResponse, SnapshotReport, SnapshotRequest, SyncState,
};
use crate::config::HydraConfig;
use crate::decorated::{DecoratedAutomaton, HEARTBEAT_MUTATION_TYPE};
use crate::epoch::EpochContext;
use crate::error::HydraError;
use crate::promise::{promise, PromiseFuture};
use crate::providers::{Providers, TimeProvider};
use crate::types::{EpochId, MutationRequest, MutationResponse, PeerId, Version};

// ============================================================================
// Leader committer
// ============================================================================

struct QueuedRecord {
    sequence_number: u64,
    record: Vec<u8>,
}

/// Replication progress of one follower.
#[derive(Debug, Default)]
struct FollowerProgress {
    /// Last sequence number the follower reported logged. `None` until it
    /// answers as ready, and again after every failure.
    logged: Option<u64>,
    in_flight: bool,
    retry_at: Duration,
    last_sent_committed: u64,
    reported_snapshot: Option<u32>,
}

/// Distributed snapshot waiting for follower reports.
struct PendingCheckpoint {
    snapshot_id: u32,
    sequence_number: u64,
    version: Version,
    leader_checksum: Option<u32>,
    reports: BTreeMap<PeerId, Option<u32>>,
}

enum NextBatch {
    Send(AcceptMutationsRequest),
    Restart(u64),
}

/// Replicates leader mutations and advances the committed sequence number.
pub struct LeaderCommitter<P: Providers> {
    epoch: Rc<EpochContext>,
    config: Rc<HydraConfig>,
    providers: P,
    decorated: Rc<DecoratedAutomaton<P>>,
    channels: Rc<dyn PeerChannels>,

    queue: RefCell<VecDeque<QueuedRecord>>,
    followers: RefCell<BTreeMap<PeerId, FollowerProgress>>,
    self_logged: Cell<u64>,
    committed: Cell<u64>,
    wakeup: Notify,

    checkpoint: RefCell<Option<PendingCheckpoint>>,
    checkpointing: Cell<bool>,
    last_checkpoint: Cell<Duration>,
    last_mutation: Cell<Duration>,
}

impl<P: Providers> LeaderCommitter<P> {
    /// Create the committer of a recovered leader.
    pub fn new(
        epoch: Rc<EpochContext>,
        config: Rc<HydraConfig>,
        providers: P,
        decorated: Rc<DecoratedAutomaton<P>>,
        channels: Rc<dyn PeerChannels>,
    ) -> Rc<Self> {
        let followers = epoch
            .cell()
            .others(epoch.self_id())
            .map(|peer| (peer, FollowerProgress::default()))
            .collect();
        let now = providers.time().now();
        Rc::new(Self {
            self_logged: Cell::new(decorated.logged_sequence_number()),
            committed: Cell::new(decorated.applied_sequence_number()),
            epoch,
            config,
            providers,
            decorated,
            channels,
            queue: RefCell::new(VecDeque::new()),
            followers: RefCell::new(followers),
            wakeup: Notify::new(),
            checkpoint: RefCell::new(None),
            checkpointing: Cell::new(false),
            last_checkpoint: Cell::new(now),
            last_mutation: Cell::new(now),
        })
    }

    /// Last sequence number known to be durable on a quorum.
    pub fn committed_sequence_number(&self) -> u64 {
        self.committed.get()
    }

    /// Committed position of the leader, served to recovering followers.
    pub fn sync_state(&self) -> Result<SyncState, HydraError> {
        let sequence_number = self.committed.get();
        let version = self
            .decorated
            .version_after_sequence(sequence_number)
            .ok_or_else(|| HydraError::invalid_state("committed state is not known yet"))?;
        Ok(SyncState {
            version,
            sequence_number,
        })
    }

    /// Log `request`, replicate it and wait until it is applied.
    pub async fn commit(
        self: &Rc<Self>,
        request: &MutationRequest,
    ) -> Result<MutationResponse, HydraError> {
        let logged = self.decorated.log_leader_mutation(request)?;
        self.last_mutation.set(self.providers.time().now());
        self.enqueue(logged.sequence_number, logged.record);
        self.watch_flush(logged.sequence_number, logged.flushed);
        self.maybe_checkpoint();
        self.wakeup.notify_one();
        self.epoch.run(logged.committed).await
    }

    /// Replication loop. Runs until the epoch ends.
    pub async fn run(self: Rc<Self>) {
        let time = self.providers.time().clone();
        info!(epoch = %self.epoch.epoch_id(), "leader committer started");
        loop {
            self.replicate();
            self.maybe_heartbeat();
            self.maybe_checkpoint();
            tokio::select! {
                _ = self.wakeup.notified() => {}
                _ = time.sleep(self.config.max_commit_batch_delay) => {}
            }
        }
    }

    fn enqueue(&self, sequence_number: u64, record: Vec<u8>) {
        let mut queue = self.queue.borrow_mut();
        queue.push_back(QueuedRecord {
            sequence_number,
            record,
        });
        while queue.len() > self.config.max_queued_mutation_count {
            if let Some(dropped) = queue.pop_front() {
                trace!(sequence_number = dropped.sequence_number, "replication queue overflow");
            }
        }
    }

    fn watch_flush(self: &Rc<Self>, sequence_number: u64, flushed: PromiseFuture<()>) {
        let this = Rc::clone(self);
        self.epoch.spawn(async move {
            match flushed.await {
                Ok(()) => {
                    if sequence_number > this.self_logged.get() {
                        this.self_logged.set(sequence_number);
                    }
                    this.maybe_promote();
                }
                Err(error) => {
                    error!(sequence_number, %error, "leader changelog flush failed");
                    this.epoch.request_restart(error);
                }
            }
        });
    }

    // ------------------------------------------------------------------------
    // Replication
    // ------------------------------------------------------------------------

    fn replicate(self: &Rc<Self>) {
        let now = self.providers.time().now();
        let peers: Vec<PeerId> = self.followers.borrow().keys().copied().collect();
        for peer in peers {
            match self.next_batch(peer, now) {
                Some(NextBatch::Send(request)) => self.send(peer, request),
                Some(NextBatch::Restart(needed)) => self.restart_follower(peer, needed, now),
                None => {}
            }
        }
    }

    fn next_batch(&self, peer: PeerId, now: Duration) -> Option<NextBatch> {
        let followers = self.followers.borrow();
        let progress = followers.get(&peer)?;
        if progress.in_flight || now < progress.retry_at {
            return None;
        }

        let committed = self.committed.get();
        let snapshot_request = self.checkpoint.borrow().as_ref().and_then(|checkpoint| {
            (progress.reported_snapshot != Some(checkpoint.snapshot_id)).then(|| SnapshotRequest {
                snapshot_id: checkpoint.snapshot_id,
                sequence_number: checkpoint.sequence_number,
                version: checkpoint.version,
            })
        });

        let Some(logged) = progress.logged else {
            // Probe: learn where the follower stands.
            return Some(NextBatch::Send(self.batch(committed, committed + 1, Vec::new(), None)));
        };

        let leader_logged = self.decorated.logged_sequence_number();
        let has_records = logged < leader_logged;
        if !has_records && progress.last_sent_committed >= committed && snapshot_request.is_none() {
            return None;
        }

        let start = logged + 1;
        let queue = self.queue.borrow();
        let mut records = Vec::new();
        if has_records {
            let front = queue.front().map_or(leader_logged + 1, |front| front.sequence_number);
            if start < front {
                return Some(NextBatch::Restart(start));
            }
            let skip = (start - front) as usize;
            records = queue
                .iter()
                .skip(skip)
                .take(self.config.max_commit_batch_record_count)
                .map(|queued| queued.record.clone())
                .collect();
        }
        Some(NextBatch::Send(self.batch(committed, start, records, snapshot_request)))
    }

    fn batch(
        &self,
        committed: u64,
        start: u64,
        records: Vec<Vec<u8>>,
        snapshot_request: Option<SnapshotRequest>,
    ) -> AcceptMutationsRequest {
        AcceptMutationsRequest {
            epoch_id: self.epoch.epoch_id(),
            leader_id: self.epoch.self_id(),
            start_sequence_number: start,
            committed_sequence_number: committed,
            records,
            snapshot_request,
        }
    }

    fn send(self: &Rc<Self>, peer: PeerId, request: AcceptMutationsRequest) {
        if let Some(progress) = self.followers.borrow_mut().get_mut(&peer) {
            progress.in_flight = true;
        }
        let committed = request.committed_sequence_number;
        let count = request.records.len();
        trace!(%peer, start = request.start_sequence_number, count, committed, "sending mutations");

        let this = Rc::clone(self);
        self.epoch.spawn(async move {
            let channel = this.channels.channel(peer);
            let result = call_with_timeout(
                this.providers.time(),
                this.config.commit_flush_rpc_timeout,
                "accept mutations",
                channel.accept_mutations(request),
            )
            .await;
            this.on_response(peer, committed, result);
        });
    }

    fn on_response(
        self: &Rc<Self>,
        peer: PeerId,
        committed: u64,
        result: Result<AcceptMutationsResponse, HydraError>,
    ) {
        let now = self.providers.time().now();
        let mut report = None;
        {
            let mut followers = self.followers.borrow_mut();
            let Some(progress) = followers.get_mut(&peer) else {
                return;
            };
            progress.in_flight = false;
            match result {
                Ok(response) if response.ready => {
                    progress.logged = Some(response.logged_sequence_number);
                    progress.last_sent_committed = committed;
                    report = response.last_snapshot;
                }
                Ok(_) => {
                    trace!(%peer, "follower is not ready");
                    progress.logged = None;
                    progress.retry_at = now + self.config.restart_backoff_time;
                }
                Err(error) => {
                    debug!(%peer, %error, "follower did not accept mutations");
                    progress.logged = None;
                    progress.retry_at = now + self.config.restart_backoff_time;
                }
            }
        }
        if let Some(report) = report {
            self.record_snapshot_report(peer, report);
        }
        self.maybe_promote();
        self.trim_queue();
        self.wakeup.notify_one();
    }

    fn restart_follower(self: &Rc<Self>, peer: PeerId, needed: u64, now: Duration) {
        if let Some(progress) = self.followers.borrow_mut().get_mut(&peer) {
            progress.in_flight = true;
            progress.logged = None;
            progress.retry_at = now + self.config.restart_backoff_time;
        }
        warn!(%peer, needed, "follower needs records no longer queued, forcing restart");

        let this = Rc::clone(self);
        self.epoch.spawn(async move {
            let channel = this.channels.channel(peer);
            let reason = format!("record {needed} is no longer available for replication");
            let result = call_with_timeout(
                this.providers.time(),
                this.config.commit_flush_rpc_timeout,
                "force restart",
                channel.force_restart(this.epoch.epoch_id(), reason),
            )
            .await;
            if let Err(error) = result {
                debug!(%peer, %error, "force restart failed");
            }
            if let Some(progress) = this.followers.borrow_mut().get_mut(&peer) {
                progress.in_flight = false;
            }
        });
    }

    /// Advance the committed sequence number to the quorum-th largest
    /// logged one and apply what became committed.
    fn maybe_promote(self: &Rc<Self>) {
        let self_logged = self.self_logged.get();
        let mut logged: Vec<u64> = self
            .followers
            .borrow()
            .values()
            .map(|progress| progress.logged.unwrap_or(0))
            .collect();
        logged.push(self_logged);
        logged.sort_unstable_by(|a, b| b.cmp(a));
        let quorum = self.epoch.cell().quorum_count();
        let candidate = logged
            .get(quorum.saturating_sub(1))
            .copied()
            .unwrap_or(0)
            .min(self_logged);
        if candidate <= self.committed.get() {
            return;
        }
        let Some(version) = self.decorated.version_after_sequence(candidate) else {
            return;
        };
        self.committed.set(candidate);
        trace!(sequence_number = candidate, %version, "mutations committed");

        let decorated = Rc::clone(&self.decorated);
        self.epoch.spawn(async move {
            if let Err(error) = decorated.commit_mutations(version, true).await {
                debug!(%error, "leader commit stopped");
            }
        });
        self.wakeup.notify_one();
    }

    fn trim_queue(&self) {
        let replicated = self
            .followers
            .borrow()
            .values()
            .map(|progress| progress.logged.unwrap_or(0))
            .min()
            .unwrap_or(u64::MAX)
            .min(self.committed.get());
        let mut queue = self.queue.borrow_mut();
        while queue
            .front()
            .map_or(false, |front| front.sequence_number <= replicated)
        {
            queue.pop_front();
        }
    }

    // ------------------------------------------------------------------------
    // Heartbeats and checkpoints
    // ------------------------------------------------------------------------

    fn maybe_heartbeat(self: &Rc<Self>) {
        let Some(period) = self.config.heartbeat_mutation_period else {
            return;
        };
        let now = self.providers.time().now();
        if now.saturating_sub(self.last_mutation.get()) < period
            || !self.decorated.state().is_active()
        {
            return;
        }
        self.last_mutation.set(now);
        let this = Rc::clone(self);
        self.epoch.spawn(async move {
            let request = MutationRequest::new(HEARTBEAT_MUTATION_TYPE, Vec::new());
            if let Err(error) = this.commit(&request).await {
                debug!(%error, "heartbeat mutation failed");
            }
        });
    }

    fn maybe_checkpoint(self: &Rc<Self>) {
        if self.checkpointing.get() || !self.decorated.state().is_active() {
            return;
        }
        let logged = self.decorated.logged_version();
        let now = self.providers.time().now();
        let records_full = logged.record_id >= self.config.max_changelog_record_count;
        let data_full = self.decorated.segment_data_size() >= self.config.max_changelog_data_size;
        let period_elapsed = logged.record_id > 0
            && self.config.snapshot_build_period.map_or(false, |period| {
                now.saturating_sub(self.last_checkpoint.get()) >= period
            });
        if !(records_full || data_full || period_elapsed) {
            return;
        }
        info!(
            %logged,
            records_full,
            data_full,
            period_elapsed,
            "changelog limit reached, starting checkpoint"
        );
        if let Err(error) = self.start_checkpoint() {
            warn!(%error, "checkpoint not started");
        }
    }

    /// Rotate the changelog and build a distributed snapshot at the current
    /// tail of the log.
    ///
    /// Returns the snapshot id at once; the future resolves with it when the
    /// local snapshot is stored.
    pub fn start_checkpoint(self: &Rc<Self>) -> Result<(u32, PromiseFuture<u32>), HydraError> {
        if self.checkpointing.replace(true) {
            return Err(HydraError::invalid_state("snapshot is already being built"));
        }
        let (version, rotated) = match self.decorated.rotate_changelog() {
            Ok(rotation) => rotation,
            Err(error) => {
                self.checkpointing.set(false);
                return Err(error);
            }
        };
        let sequence_number = self.decorated.logged_sequence_number();
        let snapshot_id = version.segment_id;
        let built = self
            .decorated
            .build_snapshot(snapshot_id, sequence_number, version);
        *self.checkpoint.borrow_mut() = Some(PendingCheckpoint {
            snapshot_id,
            sequence_number,
            version,
            leader_checksum: None,
            reports: BTreeMap::new(),
        });
        self.last_checkpoint.set(self.providers.time().now());
        info!(snapshot_id, sequence_number, %version, "distributed snapshot started");

        let (result, future) = promise();
        let this = Rc::clone(self);
        self.epoch.spawn(async move {
            let outcome = async {
                rotated.await?;
                built.await
            }
            .await;
            this.checkpointing.set(false);
            match outcome {
                Ok(params) => {
                    info!(snapshot_id, checksum = params.checksum, size = params.size, "leader snapshot stored");
                    if let Some(checkpoint) = this.checkpoint.borrow_mut().as_mut() {
                        if checkpoint.snapshot_id == snapshot_id {
                            checkpoint.leader_checksum = Some(params.checksum);
                        }
                    }
                    this.maybe_finish_checkpoint();
                    result.set_value(snapshot_id);
                }
                Err(error) => {
                    warn!(snapshot_id, %error, "leader snapshot failed");
                    this.checkpoint.borrow_mut().take();
                    result.set_error(error);
                }
            }
        });
        self.wakeup.notify_one();
        Ok((snapshot_id, future))
    }

    fn record_snapshot_report(&self, peer: PeerId, report: SnapshotReport) {
        if let Some(progress) = self.followers.borrow_mut().get_mut(&peer) {
            progress.reported_snapshot = Some(report.snapshot_id);
        }
        {
            let mut checkpoint = self.checkpoint.borrow_mut();
            let Some(checkpoint) = checkpoint.as_mut() else {
                return;
            };
            if checkpoint.snapshot_id != report.snapshot_id {
                return;
            }
            checkpoint.reports.insert(peer, report.checksum);
        }
        self.maybe_finish_checkpoint();
    }

    fn maybe_finish_checkpoint(&self) {
        let mut slot = self.checkpoint.borrow_mut();
        let complete = slot.as_ref().map_or(false, |checkpoint| {
            checkpoint.leader_checksum.is_some()
                && checkpoint.reports.len() == self.followers.borrow().len()
        });
        if !complete {
            return;
        }
        let Some(checkpoint) = slot.take() else {
            return;
        };
        let Some(expected) = checkpoint.leader_checksum else {
            return;
        };
        for (peer, checksum) in &checkpoint.reports {
            match checksum {
                Some(checksum) if *checksum != expected => {
                    error!(
                        alert = true,
                        %peer,
                        snapshot_id = checkpoint.snapshot_id,
                        expected,
                        received = checksum,
                        "snapshot checksum mismatch"
                    );
                }
                Some(_) => {}
                None => {
                    warn!(%peer, snapshot_id = checkpoint.snapshot_id, "follower did not build snapshot");
                }
            }
        }
        info!(snapshot_id = checkpoint.snapshot_id, "distributed snapshot complete");
    }
}

// ============================================================================
// Follower committer
// ============================================================================

/// Accepts leader batches on a follower.
pub struct FollowerCommitter<P: Providers> {
    epoch: Rc<EpochContext>,
    config: Rc<HydraConfig>,
    providers: P,
    decorated: Rc<DecoratedAutomaton<P>>,
    ready: Cell<bool>,
    last_contact: Cell<Duration>,
    requested_snapshot: Cell<Option<u32>>,
    last_snapshot: Rc<RefCell<Option<SnapshotReport>>>,
}

impl<P: Providers> FollowerCommitter<P> {
    /// Create the committer of a follower epoch. It stays not ready until
    /// recovery completes.
    pub fn new(
        epoch: Rc<EpochContext>,
        config: Rc<HydraConfig>,
        providers: P,
        decorated: Rc<DecoratedAutomaton<P>>,
    ) -> Rc<Self> {
        let now = providers.time().now();
        Rc::new(Self {
            epoch,
            config,
            providers,
            decorated,
            ready: Cell::new(false),
            last_contact: Cell::new(now),
            requested_snapshot: Cell::new(None),
            last_snapshot: Rc::new(RefCell::new(None)),
        })
    }

    /// Start accepting live mutations.
    pub fn set_ready(&self) {
        self.touch();
        self.ready.set(true);
    }

    /// Whether recovery has completed.
    pub fn is_ready(&self) -> bool {
        self.ready.get()
    }

    fn touch(&self) {
        self.last_contact.set(self.providers.time().now());
    }

    fn check_epoch(&self, epoch_id: EpochId, leader_id: PeerId) -> Result<(), HydraError> {
        if epoch_id != self.epoch.epoch_id() {
            return Err(HydraError::InvalidEpoch {
                expected: self.epoch.epoch_id(),
                received: epoch_id,
            });
        }
        if leader_id != self.epoch.leader_id() {
            return Err(HydraError::invalid_state(format!(
                "{leader_id} is not the leader of {epoch_id}"
            )));
        }
        Ok(())
    }

    /// Answer a lease ping.
    pub fn ping(&self, epoch_id: EpochId, leader_id: PeerId) -> Result<PingFollowerResponse, HydraError> {
        self.check_epoch(epoch_id, leader_id)?;
        self.touch();
        Ok(PingFollowerResponse {
            state: self.decorated.state(),
        })
    }

    /// Log a leader batch, wait until it is durable and apply what the
    /// leader reports committed.
    pub async fn accept_mutations(
        &self,
        request: AcceptMutationsRequest,
    ) -> Result<AcceptMutationsResponse, HydraError> {
        self.check_epoch(request.epoch_id, request.leader_id)?;
        self.touch();
        if !self.ready.get() {
            return Ok(AcceptMutationsResponse {
                ready: false,
                logged_sequence_number: 0,
                last_snapshot: None,
            });
        }
        if let Some(snapshot) = request.snapshot_request {
            self.maybe_build_snapshot(snapshot);
        }

        let logged = self.decorated.logged_sequence_number();
        let start = request.start_sequence_number;
        let mut last_flush = None;
        if !request.records.is_empty() {
            if start > logged + 1 {
                let error = HydraError::OutOfOrder {
                    expected: logged + 1,
                    received: start,
                };
                self.epoch.request_restart(error.clone());
                return Err(error);
            }
            let skip = (logged + 1 - start) as usize;
            if skip > 0 {
                trace!(skip, "skipping already logged records");
            }
            for record in request.records.into_iter().skip(skip) {
                match self.decorated.log_follower_mutation(record) {
                    Ok(flushed) => last_flush = Some(flushed),
                    Err(error) => {
                        self.epoch.request_restart(error.clone());
                        return Err(error);
                    }
                }
            }
        }
        if let Some(flushed) = last_flush {
            if let Err(error) = self.epoch.run(flushed).await {
                warn!(%error, "follower changelog flush failed");
                self.epoch.request_restart(error.clone());
                return Err(error);
            }
        }

        let logged = self.decorated.logged_sequence_number();
        let committed = request.committed_sequence_number.min(logged);
        if committed > self.decorated.applied_sequence_number() {
            if let Some(version) = self.decorated.version_after_sequence(committed) {
                let decorated = Rc::clone(&self.decorated);
                self.epoch.spawn(async move {
                    if let Err(error) = decorated.commit_mutations(version, true).await {
                        debug!(%error, "follower commit stopped");
                    }
                });
            }
        }

        Ok(AcceptMutationsResponse {
            ready: true,
            logged_sequence_number: logged,
            last_snapshot: self.last_snapshot.borrow().clone(),
        })
    }

    fn maybe_build_snapshot(&self, request: SnapshotRequest) {
        if self.requested_snapshot.get() == Some(request.snapshot_id) {
            return;
        }
        self.requested_snapshot.set(Some(request.snapshot_id));
        debug!(
            snapshot_id = request.snapshot_id,
            sequence_number = request.sequence_number,
            "follower snapshot requested"
        );
        let built = self.decorated.build_snapshot(
            request.snapshot_id,
            request.sequence_number,
            request.version,
        );
        let last_snapshot = Rc::clone(&self.last_snapshot);
        self.epoch.spawn(async move {
            let checksum = match built.await {
                Ok(params) => Some(params.checksum),
                Err(error) => {
                    warn!(snapshot_id = request.snapshot_id, %error, "follower snapshot failed");
                    None
                }
            };
            *last_snapshot.borrow_mut() = Some(SnapshotReport {
                snapshot_id: request.snapshot_id,
                checksum,
            });
        });
    }

    /// Abandon the epoch when the leader goes silent. Runs until the epoch
    /// ends.
    pub async fn watchdog(self: Rc<Self>) {
        let time = self.providers.time().clone();
        loop {
            time.sleep(self.config.leader_lease_check_period).await;
            if !self.ready.get() {
                continue;
            }
            let silent = time.now().saturating_sub(self.last_contact.get());
            if silent >= self.config.leader_lease_timeout {
                warn!(
                    epoch = %self.epoch.epoch_id(),
                    leader = %self.epoch.leader_id(),
                    silent_ms = silent.as_millis() as u64,
                    "leader went silent"
                );
                self.epoch.request_restart(HydraError::Timeout {
                    operation: "leader contact".to_string(),
                });
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use tokio::task::LocalSet;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::automaton::{Automaton, AutomatonError, MutationContext};
    use crate::changelog::{ChangelogStore, ChangelogWriter, InMemoryChangelogStore};
    use crate::providers::SeededProviders;
    use crate::snapshot::InMemorySnapshotStore;
    use crate::types::{CellConfig, PeerState};

    #[derive(Default)]
    struct Counter(u64);

    impl Automaton for Counter {
        fn apply_mutation(
            &mut self,
            _context: &mut MutationContext<'_>,
        ) -> Result<Vec<u8>, AutomatonError> {
            self.0 += 1;
            Ok(self.0.to_le_bytes().to_vec())
        }

        fn save_snapshot(&self, writer: &mut dyn Write) -> Result<(), AutomatonError> {
            writer
                .write_all(&self.0.to_le_bytes())
                .map_err(|e| AutomatonError::new(e.to_string()))
        }

        fn load_snapshot(&mut self, reader: &mut dyn Read) -> Result<(), AutomatonError> {
            let mut bytes = [0u8; 8];
            reader
                .read_exact(&mut bytes)
                .map_err(|e| AutomatonError::new(e.to_string()))?;
            self.0 = u64::from_le_bytes(bytes);
            Ok(())
        }

        fn clear(&mut self) {
            self.0 = 0;
        }
    }

    fn follower(
        state: PeerState,
    ) -> (Rc<FollowerCommitter<SeededProviders>>, Rc<DecoratedAutomaton<SeededProviders>>) {
        let config = Rc::new(HydraConfig::for_simulation());
        let providers = SeededProviders::new(1);
        let decorated = DecoratedAutomaton::new(
            PeerId(1),
            config.clone(),
            providers.clone(),
            Box::new(Counter::default()),
            Rc::new(InMemorySnapshotStore::new()),
        );
        let epoch = EpochContext::new(
            EpochId(3),
            PeerId(0),
            PeerId(1),
            Rc::new(CellConfig::with_peer_count(3)),
            Duration::ZERO,
            Box::new(|_| {}),
        );
        let store: Rc<dyn ChangelogStore> = Rc::new(InMemoryChangelogStore::new());
        let writer = ChangelogWriter::spawn(store, CancellationToken::new());
        decorated.start_epoch(EpochId(3), writer, Rc::new(|_| {}));
        decorated.set_state(state);
        let committer = FollowerCommitter::new(epoch, config, providers, decorated.clone());
        (committer, decorated)
    }

    /// Records as a leader at epoch 3 would log them.
    fn leader_records(count: usize) -> Vec<Vec<u8>> {
        let config = Rc::new(HydraConfig::for_simulation());
        let leader = DecoratedAutomaton::new(
            PeerId(0),
            config,
            SeededProviders::new(0),
            Box::new(Counter::default()),
            Rc::new(InMemorySnapshotStore::new()),
        );
        let store: Rc<dyn ChangelogStore> = Rc::new(InMemoryChangelogStore::new());
        leader.start_epoch(EpochId(3), ChangelogWriter::spawn(store, CancellationToken::new()), Rc::new(|_| {}));
        leader.set_state(PeerState::Leading);
        (0..count)
            .map(|_| {
                leader
                    .log_leader_mutation(&MutationRequest::new("inc", Vec::new()))
                    .expect("log")
                    .record
            })
            .collect()
    }

    fn batch(start: u64, committed: u64, records: Vec<Vec<u8>>) -> AcceptMutationsRequest {
        AcceptMutationsRequest {
            epoch_id: EpochId(3),
            leader_id: PeerId(0),
            start_sequence_number: start,
            committed_sequence_number: committed,
            records,
            snapshot_request: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_ready_while_recovering() {
        LocalSet::new()
            .run_until(async {
                let (committer, _) = follower(PeerState::FollowerRecovery);
                let response = committer
                    .accept_mutations(batch(1, 0, leader_records(1)))
                    .await
                    .expect("accept");
                assert!(!response.ready);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_logs_and_commits() {
        LocalSet::new()
            .run_until(async {
                let (committer, decorated) = follower(PeerState::Following);
                committer.set_ready();
                let records = leader_records(3);

                let response = committer
                    .accept_mutations(batch(1, 0, records.clone()))
                    .await
                    .expect("accept");
                assert!(response.ready);
                assert_eq!(response.logged_sequence_number, 3);
                assert_eq!(decorated.applied_sequence_number(), 0);

                // Resending overlapping records is harmless.
                let response = committer
                    .accept_mutations(batch(2, 2, records[1..].to_vec()))
                    .await
                    .expect("accept");
                assert_eq!(response.logged_sequence_number, 3);
                decorated.wait_applied(2).await.expect("applied");
                assert_eq!(decorated.automaton_version(), Version::new(0, 2));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_gap_is_rejected() {
        LocalSet::new()
            .run_until(async {
                let (committer, decorated) = follower(PeerState::Following);
                committer.set_ready();
                let records = leader_records(3);
                let error = committer
                    .accept_mutations(batch(3, 0, records[2..].to_vec()))
                    .await
                    .expect_err("gap");
                assert_eq!(
                    error,
                    HydraError::OutOfOrder {
                        expected: 1,
                        received: 3
                    }
                );
                assert_eq!(decorated.logged_sequence_number(), 0);
                assert!(committer.epoch.is_canceled());
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_epoch_is_rejected() {
        LocalSet::new()
            .run_until(async {
                let (committer, _) = follower(PeerState::Following);
                committer.set_ready();
                let mut request = batch(1, 0, Vec::new());
                request.epoch_id = EpochId(2);
                let error = committer.accept_mutations(request).await.expect_err("epoch");
                assert!(error.is_invalid_state());
                assert!(committer.ping(EpochId(3), PeerId(2)).is_err());
                assert_eq!(
                    committer.ping(EpochId(3), PeerId(0)).expect("ping").state,
                    PeerState::Following
                );
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_abandons_silent_leader() {
        LocalSet::new()
            .run_until(async {
                let (committer, _) = follower(PeerState::Following);
                committer.set_ready();
                tokio::task::spawn_local(Rc::clone(&committer).watchdog());
                tokio::time::sleep(Duration::from_millis(100)).await;
                assert!(!committer.epoch.is_canceled());
                tokio::time::sleep(Duration::from_millis(300)).await;
                assert!(committer.epoch.is_canceled());
            })
            .await;
    }
}
