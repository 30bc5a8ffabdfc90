//! Leader and follower recovery.
//!
//! Recovery brings the automaton of a peer that just got a role up to the
//! point where live replication can take over.
//!
//! ```text
//! leader:    local snapshot ─> local changelogs ─> reachable version
//!
//! follower:  GetSyncState(leader) = (V, N)
//!              ├─ clear local state if it diverged from the leader
//!              ├─ local snapshot not newer than V
//!              ├─ reconcile segments: truncate extra records,
//!              │  download missing ones from the leader
//!              └─ replay local changelogs up to V
//! ```
//!
//! Both paths replay through
//! [`DecoratedAutomaton::apply_mutation_during_recovery`], in batches, checking
//! for epoch cancellation between batches. Segments missing from the store
//! count as empty.

use std::rc::Rc;

use tracing::{debug, info, warn};

use crate::changelog::{open_or_create_changelog, Changelog, ChangelogError, ChangelogStore};
use crate::channel::{call_with_timeout, HydraService, PeerChannels, SyncState};
use crate::config::HydraConfig;
use crate::decorated::DecoratedAutomaton;
use crate::election::ElectionPriority;
use crate::epoch::EpochContext;
use crate::error::HydraError;
use crate::providers::{Providers, TimeProvider};
use crate::snapshot::SnapshotStore;
use crate::types::{EpochId, Version};
use crate::wire::deserialize_mutation_record;

/// Records read from a changelog per batch.
const RECOVERY_BATCH_SIZE: u32 = 256;

/// Position the local stores let this peer reach, and the epoch of the
/// last record they hold.
pub async fn reachable_priority(
    changelogs: &dyn ChangelogStore,
    snapshots: &dyn SnapshotStore,
) -> Result<ElectionPriority, HydraError> {
    let mut version = Version::ZERO;
    let mut epoch = EpochId::NONE;
    if let Some(latest) = changelogs.latest_changelog_id().await? {
        let changelog = changelogs.open_changelog(latest).await?;
        version = Version::new(latest, changelog.record_count());

        let mut segment = Some(latest);
        while let Some(id) = segment {
            let changelog = match open_existing(changelogs, id).await? {
                Some(changelog) => changelog,
                None => break,
            };
            let count = changelog.record_count();
            if count > 0 {
                epoch = record_epoch(changelog.as_ref(), count - 1)
                    .await?
                    .unwrap_or(EpochId::NONE);
                break;
            }
            segment = id.checked_sub(1);
        }
    }
    if let Some(snapshot_id) = snapshots.latest_snapshot_id(None).await? {
        version = version.max(Version::new(snapshot_id, 0));
    }
    Ok(ElectionPriority { epoch, version })
}

/// Reachable version of the local stores.
pub async fn reachable_version(
    changelogs: &dyn ChangelogStore,
    snapshots: &dyn SnapshotStore,
) -> Result<Version, HydraError> {
    Ok(reachable_priority(changelogs, snapshots).await?.version)
}

pub(crate) async fn open_existing(
    changelogs: &dyn ChangelogStore,
    changelog_id: u32,
) -> Result<Option<Rc<dyn Changelog>>, HydraError> {
    match changelogs.open_changelog(changelog_id).await {
        Ok(changelog) => Ok(Some(changelog)),
        Err(ChangelogError::NotFound { .. }) => Ok(None),
        Err(error) => Err(error.into()),
    }
}

/// Epoch stamped on record `record_id` of a changelog.
pub(crate) async fn record_epoch(
    changelog: &dyn Changelog,
    record_id: u32,
) -> Result<Option<EpochId>, HydraError> {
    let records = changelog.read(record_id, 1).await?;
    match records.first() {
        Some(record) => Ok(Some(deserialize_mutation_record(record)?.0.epoch)),
        None => Ok(None),
    }
}

/// Everything recovery touches.
pub struct RecoveryContext<P: Providers> {
    /// Automaton being recovered.
    pub decorated: Rc<DecoratedAutomaton<P>>,
    /// Local changelogs.
    pub changelogs: Rc<dyn ChangelogStore>,
    /// Local snapshots.
    pub snapshots: Rc<dyn SnapshotStore>,
    /// Epoch recovery runs in.
    pub epoch: Rc<EpochContext>,
    /// Peer configuration.
    pub config: Rc<HydraConfig>,
    /// Time and randomness.
    pub providers: P,
}

impl<P: Providers> RecoveryContext<P> {
    /// Load the latest snapshot not newer than `max_segment` if it is ahead
    /// of the automaton.
    async fn load_snapshot_if_ahead(&self, max_segment: u32) -> Result<(), HydraError> {
        let Some(snapshot_id) = self.snapshots.latest_snapshot_id(Some(max_segment)).await? else {
            return Ok(());
        };
        if Version::new(snapshot_id, 0) <= self.decorated.automaton_version() {
            return Ok(());
        }
        let mut reader = self.snapshots.create_reader(snapshot_id).await?;
        let data = reader.read_all().await?;
        self.ensure_live()?;
        self.decorated.locks().wait_system_released().await;
        self.decorated.load_snapshot(reader.meta(), &data)
    }

    /// Replay local changelogs from the automaton version up to `target`.
    async fn replay(&self, target: Version) -> Result<(), HydraError> {
        let start = self.decorated.automaton_version();
        for segment in start.segment_id..=target.segment_id {
            let Some(changelog) = open_existing(self.changelogs.as_ref(), segment).await? else {
                continue;
            };
            let count = changelog.record_count();
            let limit = if segment == target.segment_id {
                if count < target.record_id {
                    return Err(HydraError::recovery(format!(
                        "changelog {segment} holds {count} records, {} expected",
                        target.record_id
                    )));
                }
                target.record_id
            } else {
                count
            };
            let automaton = self.decorated.automaton_version();
            let mut record_id = if automaton.segment_id == segment {
                automaton.record_id.min(limit)
            } else {
                0
            };
            while record_id < limit {
                self.ensure_live()?;
                self.decorated.locks().wait_system_released().await;
                let records = changelog
                    .read(record_id, RECOVERY_BATCH_SIZE.min(limit - record_id))
                    .await?;
                if records.is_empty() {
                    return Err(HydraError::recovery(format!(
                        "changelog {segment} ended at record {record_id}"
                    )));
                }
                for record in &records {
                    self.decorated.apply_mutation_during_recovery(record)?;
                }
                record_id += records.len() as u32;
                debug!(segment, record_id, "replayed changelog batch");
                tokio::task::yield_now().await;
            }
        }
        Ok(())
    }

    fn ensure_live(&self) -> Result<(), HydraError> {
        if self.epoch.is_canceled() {
            return Err(HydraError::epoch_canceled());
        }
        Ok(())
    }
}

// ============================================================================
// Leader recovery
// ============================================================================

/// Replays the local stores up to the reachable version.
pub struct LeaderRecovery<P: Providers> {
    context: RecoveryContext<P>,
}

impl<P: Providers> LeaderRecovery<P> {
    /// Prepare leader recovery.
    pub fn new(context: RecoveryContext<P>) -> Self {
        Self { context }
    }

    /// Run recovery; returns the version the automaton was brought to.
    pub async fn run(&self) -> Result<Version, HydraError> {
        let context = &self.context;
        let target = reachable_version(context.changelogs.as_ref(), context.snapshots.as_ref()).await?;
        info!(
            epoch = %context.epoch.epoch_id(),
            %target,
            from = %context.decorated.automaton_version(),
            "leader recovery started"
        );
        context.load_snapshot_if_ahead(target.segment_id).await?;
        context.replay(target).await?;
        context.ensure_live()?;
        context.decorated.finish_recovery(target);
        info!(epoch = %context.epoch.epoch_id(), %target, "leader recovery complete");
        Ok(target)
    }
}

// ============================================================================
// Follower recovery
// ============================================================================

/// Brings a follower to the applied state of its leader.
pub struct FollowerRecovery<P: Providers> {
    context: RecoveryContext<P>,
    leader: Rc<dyn HydraService>,
}

impl<P: Providers> FollowerRecovery<P> {
    /// Prepare follower recovery against the epoch leader.
    pub fn new(context: RecoveryContext<P>, channels: &dyn PeerChannels) -> Self {
        let leader = channels.channel(context.epoch.leader_id());
        Self { context, leader }
    }

    /// Run recovery; returns the leader state the automaton was brought to.
    pub async fn run(&self) -> Result<SyncState, HydraError> {
        let context = &self.context;
        let sync = self.sync_state().await?;
        info!(
            epoch = %context.epoch.epoch_id(),
            target = %sync.version,
            sequence_number = sync.sequence_number,
            from = %context.decorated.automaton_version(),
            "follower recovery started"
        );

        if self.diverged(&sync).await? {
            warn!(
                epoch = %context.epoch.epoch_id(),
                version = %context.decorated.automaton_version(),
                leader_version = %sync.version,
                "local state diverged from leader, recovering from scratch"
            );
            context.decorated.clear()?;
        }
        context.load_snapshot_if_ahead(sync.version.segment_id).await?;
        self.reconcile(&sync).await?;
        context.replay(sync.version).await?;
        context.ensure_live()?;

        let applied = context.decorated.applied_sequence_number();
        if applied != sync.sequence_number {
            return Err(HydraError::recovery(format!(
                "replayed up to sequence number {applied}, leader is at {}",
                sync.sequence_number
            )));
        }
        context.decorated.finish_recovery(sync.version);
        info!(epoch = %context.epoch.epoch_id(), version = %sync.version, "follower recovery complete");
        Ok(sync)
    }

    /// Ask the leader for its applied state, retrying while it recovers.
    async fn sync_state(&self) -> Result<SyncState, HydraError> {
        let context = &self.context;
        let epoch_id = context.epoch.epoch_id();
        loop {
            let call = call_with_timeout(
                context.providers.time(),
                context.config.commit_flush_rpc_timeout,
                "get sync state",
                self.leader.get_sync_state(epoch_id),
            );
            match context.epoch.run(call).await {
                Ok(sync) => return Ok(sync),
                Err(error) => {
                    context.ensure_live()?;
                    debug!(epoch = %epoch_id, %error, "leader not ready for sync, backing off");
                }
            }
            let backoff = context
                .providers
                .time()
                .sleep(context.config.restart_backoff_time);
            context
                .epoch
                .run(async {
                    backoff.await;
                    Ok(())
                })
                .await?;
        }
    }

    async fn leader_call<T, F>(&self, operation: &str, call: F) -> Result<T, HydraError>
    where
        F: std::future::Future<Output = Result<T, HydraError>>,
    {
        let context = &self.context;
        let call = call_with_timeout(
            context.providers.time(),
            context.config.commit_flush_rpc_timeout,
            operation,
            call,
        );
        context.epoch.run(call).await
    }

    /// Whether the automaton holds records the leader does not.
    async fn diverged(&self, sync: &SyncState) -> Result<bool, HydraError> {
        let decorated = &self.context.decorated;
        let automaton = decorated.automaton_version();
        if decorated.applied_sequence_number() > sync.sequence_number || automaton > sync.version {
            return Ok(true);
        }
        if automaton.record_id == 0 {
            return Ok(false);
        }
        let segment = automaton.segment_id;
        let leader = self
            .leader_call("lookup changelog", self.leader.lookup_changelog(segment))
            .await?;
        let Some(leader) = leader else {
            return Ok(true);
        };
        if leader.record_count < automaton.record_id {
            return Ok(true);
        }
        let local_epoch = match open_existing(self.context.changelogs.as_ref(), segment).await? {
            Some(changelog) => record_epoch(changelog.as_ref(), 0).await?,
            None => None,
        };
        Ok(local_epoch.is_some() && local_epoch != leader.epoch)
    }

    /// Make local segments match the leader's up to `sync.version`.
    async fn reconcile(&self, sync: &SyncState) -> Result<(), HydraError> {
        let context = &self.context;
        let first = context.decorated.automaton_version().segment_id;
        let local_latest = context
            .changelogs
            .latest_changelog_id()
            .await?
            .unwrap_or(first);
        let last = sync.version.segment_id.max(local_latest);

        for segment in first..=last {
            context.ensure_live()?;
            let leader_info = if segment <= sync.version.segment_id {
                self.leader_call("lookup changelog", self.leader.lookup_changelog(segment))
                    .await?
            } else {
                None
            };
            let leader_count = if segment < sync.version.segment_id {
                leader_info.map_or(0, |info| info.record_count)
            } else if segment == sync.version.segment_id {
                sync.version.record_id
            } else {
                0
            };
            let leader_epoch = leader_info.and_then(|info| info.epoch);

            let local = open_existing(context.changelogs.as_ref(), segment).await?;
            let mut local_count = 0;
            if let Some(changelog) = &local {
                local_count = changelog.record_count();
                if local_count > 0 {
                    let local_epoch = record_epoch(changelog.as_ref(), 0).await?;
                    if leader_count > 0 && local_epoch != leader_epoch {
                        warn!(segment, ?local_epoch, ?leader_epoch, "changelog written in another epoch, truncating");
                        changelog.truncate(0).await?;
                        local_count = 0;
                    } else if local_count > leader_count {
                        warn!(segment, local_count, leader_count, "truncating changelog to leader");
                        changelog.truncate(leader_count).await?;
                        local_count = leader_count;
                    }
                }
            }

            if local_count < leader_count {
                let changelog = match local {
                    Some(changelog) => changelog,
                    None => open_or_create_changelog(context.changelogs.as_ref(), segment).await?,
                };
                self.download(segment, changelog.as_ref(), local_count, leader_count)
                    .await?;
            }
        }
        Ok(())
    }

    async fn download(
        &self,
        segment: u32,
        changelog: &dyn Changelog,
        mut record_id: u32,
        record_count: u32,
    ) -> Result<(), HydraError> {
        info!(segment, from = record_id, to = record_count, "downloading changelog from leader");
        while record_id < record_count {
            let max_records = RECOVERY_BATCH_SIZE.min(record_count - record_id);
            let records = self
                .leader_call(
                    "read changelog",
                    self.leader.read_changelog(segment, record_id, max_records),
                )
                .await?;
            if records.is_empty() {
                return Err(HydraError::recovery(format!(
                    "leader changelog {segment} ended at record {record_id}"
                )));
            }
            changelog.append(&records).await?;
            changelog.flush().await?;
            record_id += records.len() as u32;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::io::{Read, Write};

    use tokio::task::LocalSet;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::automaton::{Automaton, AutomatonError, MutationContext};
    use crate::changelog::{ChangelogWriter, InMemoryChangelogStore};
    use crate::providers::SeededProviders;
    use crate::snapshot::InMemorySnapshotStore;
    use crate::types::{CellConfig, MutationRequest, PeerId, PeerState};

    #[derive(Default)]
    struct Sum(u64);

    impl Automaton for Sum {
        fn apply_mutation(
            &mut self,
            context: &mut MutationContext<'_>,
        ) -> Result<Vec<u8>, AutomatonError> {
            self.0 += context.payload.len() as u64;
            Ok(Vec::new())
        }

        fn save_snapshot(&self, writer: &mut dyn Write) -> Result<(), AutomatonError> {
            writer.write_all(&self.0.to_le_bytes())?;
            Ok(())
        }

        fn load_snapshot(&mut self, reader: &mut dyn Read) -> Result<(), AutomatonError> {
            let mut bytes = [0u8; 8];
            reader.read_exact(&mut bytes)?;
            self.0 = u64::from_le_bytes(bytes);
            Ok(())
        }

        fn clear(&mut self) {
            self.0 = 0;
        }
    }

    struct Peer {
        decorated: Rc<DecoratedAutomaton<SeededProviders>>,
        changelogs: InMemoryChangelogStore,
        snapshots: InMemorySnapshotStore,
    }

    fn peer() -> Peer {
        let snapshots = InMemorySnapshotStore::new();
        Peer {
            decorated: DecoratedAutomaton::new(
                PeerId(0),
                Rc::new(HydraConfig::for_simulation()),
                SeededProviders::new(3),
                Box::new(Sum::default()),
                Rc::new(snapshots.clone()),
            ),
            changelogs: InMemoryChangelogStore::new(),
            snapshots,
        }
    }

    fn epoch() -> Rc<EpochContext> {
        EpochContext::new(
            EpochId(2),
            PeerId(0),
            PeerId(0),
            Rc::new(CellConfig::with_peer_count(1)),
            std::time::Duration::ZERO,
            Box::new(|_| {}),
        )
    }

    fn recovery_context(peer: &Peer, epoch: Rc<EpochContext>) -> RecoveryContext<SeededProviders> {
        RecoveryContext {
            decorated: peer.decorated.clone(),
            changelogs: Rc::new(peer.changelogs.clone()),
            snapshots: Rc::new(peer.snapshots.clone()),
            epoch,
            config: Rc::new(HydraConfig::for_simulation()),
            providers: SeededProviders::new(3),
        }
    }

    /// Log and apply `payloads` as leader of epoch 1, one segment per entry.
    async fn write_history(peer: &Peer, segments: &[&[&str]]) {
        peer.decorated.set_state(PeerState::Leading);
        peer.decorated.start_epoch(
            EpochId(1),
            ChangelogWriter::spawn(Rc::new(peer.changelogs.clone()), CancellationToken::new()),
            Rc::new(|_| {}),
        );
        for (index, payloads) in segments.iter().enumerate() {
            if index > 0 {
                peer.decorated.rotate_changelog().expect("rotate");
            }
            for payload in payloads.iter() {
                peer.decorated
                    .log_leader_mutation(&MutationRequest::new("add", *payload))
                    .expect("log");
            }
        }
        let (_, barrier) = peer.decorated.rotate_changelog().expect("rotate");
        barrier.await.expect("flushed");
        peer.decorated
            .commit_mutations(peer.decorated.logged_version(), false)
            .await
            .expect("commit");
        peer.decorated.stop_epoch();
    }

    fn sum(peer: &Peer) -> u64 {
        let out = RefCell::new(0);
        peer.decorated.with_automaton(|automaton| {
            let mut bytes = Vec::new();
            automaton.save_snapshot(&mut bytes).expect("save");
            *out.borrow_mut() = u64::from_le_bytes(bytes[..8].try_into().expect("8 bytes"));
        });
        out.into_inner()
    }

    #[tokio::test]
    async fn test_reachable_priority() {
        LocalSet::new()
            .run_until(async {
                let source = peer();
                write_history(&source, &[&["a", "bb"], &["ccc"]]).await;
                let priority = reachable_priority(&source.changelogs, &source.snapshots)
                    .await
                    .expect("priority");
                // The closing rotation left an empty segment 2.
                assert_eq!(priority.version, Version::new(2, 0));
                assert_eq!(priority.epoch, EpochId(1));

                let empty = peer();
                let priority = reachable_priority(&empty.changelogs, &empty.snapshots)
                    .await
                    .expect("priority");
                assert_eq!(priority, ElectionPriority::default());
            })
            .await;
    }

    #[tokio::test]
    async fn test_leader_recovery_replays_changelogs() {
        LocalSet::new()
            .run_until(async {
                let source = peer();
                write_history(&source, &[&["a", "bb"], &["ccc"]]).await;

                let fresh = Peer {
                    changelogs: source.changelogs.clone(),
                    ..peer()
                };
                fresh.decorated.set_state(PeerState::LeaderRecovery);
                let target = LeaderRecovery::new(recovery_context(&fresh, epoch()))
                    .run()
                    .await
                    .expect("recovered");
                assert_eq!(target, Version::new(2, 0));
                assert_eq!(sum(&fresh), 6);
                assert_eq!(fresh.decorated.applied_sequence_number(), 3);
                assert_eq!(fresh.decorated.logged_version(), Version::new(2, 0));
            })
            .await;
    }

    #[tokio::test]
    async fn test_leader_recovery_starts_from_snapshot() {
        LocalSet::new()
            .run_until(async {
                let source = peer();
                write_history(&source, &[&["a", "bb"]]).await;
                source.decorated.set_state(PeerState::Leading);
                source.decorated.start_epoch(
                    EpochId(1),
                    ChangelogWriter::spawn(Rc::new(source.changelogs.clone()), CancellationToken::new()),
                    Rc::new(|_| {}),
                );
                let (version, _) = source.decorated.rotate_changelog().expect("rotate");
                let params = source
                    .decorated
                    .build_snapshot(version.segment_id, 2, version)
                    .await
                    .expect("snapshot");
                assert_eq!(params.snapshot_id, 1);

                // Segments are gone; the snapshot alone carries the state.
                let fresh = Peer {
                    snapshots: source.snapshots.clone(),
                    ..peer()
                };
                fresh.decorated.set_state(PeerState::LeaderRecovery);
                let target = LeaderRecovery::new(recovery_context(&fresh, epoch()))
                    .run()
                    .await
                    .expect("recovered");
                assert_eq!(target, Version::new(1, 0));
                assert_eq!(sum(&fresh), 3);
                assert_eq!(fresh.decorated.applied_sequence_number(), 2);
            })
            .await;
    }

    #[tokio::test]
    async fn test_recovery_stops_on_cancel() {
        LocalSet::new()
            .run_until(async {
                let source = peer();
                write_history(&source, &[&["a"]]).await;
                let fresh = Peer {
                    changelogs: source.changelogs.clone(),
                    ..peer()
                };
                fresh.decorated.set_state(PeerState::LeaderRecovery);
                let epoch = epoch();
                epoch.cancel();
                let result = LeaderRecovery::new(recovery_context(&fresh, epoch)).run().await;
                assert!(result.expect_err("canceled").is_invalid_state());
                assert_eq!(fresh.decorated.applied_sequence_number(), 0);
            })
            .await;
    }
}
