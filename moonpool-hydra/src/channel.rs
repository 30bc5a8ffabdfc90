//! Peer-to-peer RPC surface.
//!
//! Hydra peers talk to each other through [`HydraService`]. The transport is
//! not part of the engine: a deployment implements [`PeerChannels`] over its
//! own network stack and routes incoming calls to the local
//! [`HydraManager`](crate::HydraManager), which implements the service.
//!
//! | Call | Caller | Purpose |
//! |---|---|---|
//! | `accept_mutations` | leader | replicate records, publish the committed sequence number, request snapshots |
//! | `ping_follower` | leader | lease check |
//! | `get_sync_state` | follower | find the leader's applied state to recover to |
//! | `lookup_changelog` / `read_changelog` | follower | download records during recovery |
//! | `get_committed_sequence_number` | follower | `sync_with_leader` |
//! | `force_restart` | leader | make a follower re-run recovery |
//! | `commit_forwarded` | follower | forward a client mutation to the leader |
//!
//! All messages derive `serde` so a network transport can frame them
//! directly.
//!
//! [`LocalChannels`] connects peers living in the same process. It can kill
//! a peer (every call to or from it fails with
//! [`HydraError::Unavailable`]) and hold one (calls to it wait until
//! released), which is what the cluster tests use to partition and delay
//! peers.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::rc::{Rc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::trace;

use crate::error::HydraError;
use crate::providers::TimeProvider;
use crate::types::{EpochId, MutationRequest, MutationResponse, PeerId, PeerState, Version};

/// Snapshot the leader asks a follower to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRequest {
    /// Id of the snapshot, equal to the segment it opens.
    pub snapshot_id: u32,
    /// Build once this record has been applied.
    pub sequence_number: u64,
    /// Version recorded in the snapshot.
    pub version: Version,
}

/// Outcome of the last snapshot a follower built on request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotReport {
    /// Id of the snapshot.
    pub snapshot_id: u32,
    /// Checksum of the persisted snapshot, `None` if building failed.
    pub checksum: Option<u32>,
}

/// Replication batch sent by the leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptMutationsRequest {
    /// Epoch of the sending leader.
    pub epoch_id: EpochId,
    /// The sending leader.
    pub leader_id: PeerId,
    /// Sequence number of the first record in `records`.
    pub start_sequence_number: u64,
    /// Records up to this sequence number are committed.
    pub committed_sequence_number: u64,
    /// Serialized mutation records, consecutive.
    pub records: Vec<Vec<u8>>,
    /// Snapshot to build, if one is in progress.
    pub snapshot_request: Option<SnapshotRequest>,
}

/// Follower reply to a replication batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptMutationsResponse {
    /// `false` while the follower is still recovering.
    pub ready: bool,
    /// Last record durably logged by the follower.
    pub logged_sequence_number: u64,
    /// Last snapshot built on request.
    pub last_snapshot: Option<SnapshotReport>,
}

/// Follower reply to a lease ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingFollowerResponse {
    /// State of the follower.
    pub state: PeerState,
}

/// Applied state of the leader, the target of follower recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    /// Automaton version of the leader.
    pub version: Version,
    /// Last record applied by the leader.
    pub sequence_number: u64,
}

/// Shape of one changelog segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangelogInfo {
    /// Records in the segment.
    pub record_count: u32,
    /// Epoch that logged the first record, `None` if the segment is empty.
    pub epoch: Option<EpochId>,
}

/// Calls one Hydra peer serves to the others.
#[async_trait(?Send)]
pub trait HydraService {
    /// Log a batch of records and advance the committed sequence number.
    async fn accept_mutations(
        &self,
        request: AcceptMutationsRequest,
    ) -> Result<AcceptMutationsResponse, HydraError>;

    /// Confirm the follower still follows `leader_id` in `epoch_id`.
    async fn ping_follower(
        &self,
        epoch_id: EpochId,
        leader_id: PeerId,
    ) -> Result<PingFollowerResponse, HydraError>;

    /// Applied state of an active leader.
    async fn get_sync_state(&self, epoch_id: EpochId) -> Result<SyncState, HydraError>;

    /// Shape of a local changelog segment, `None` if it does not exist.
    async fn lookup_changelog(&self, changelog_id: u32)
        -> Result<Option<ChangelogInfo>, HydraError>;

    /// Read records from a local changelog segment.
    async fn read_changelog(
        &self,
        changelog_id: u32,
        first_record_id: u32,
        max_records: u32,
    ) -> Result<Vec<Vec<u8>>, HydraError>;

    /// Last committed sequence number of an active leader.
    async fn get_committed_sequence_number(&self, epoch_id: EpochId) -> Result<u64, HydraError>;

    /// Make a follower abandon `epoch_id` and recover again.
    async fn force_restart(&self, epoch_id: EpochId, reason: String) -> Result<(), HydraError>;

    /// Commit a mutation forwarded by a follower.
    async fn commit_forwarded(
        &self,
        request: MutationRequest,
    ) -> Result<MutationResponse, HydraError>;
}

/// Bound a peer call by `timeout`.
pub async fn call_with_timeout<T, R, F>(
    time: &T,
    timeout: Duration,
    operation: &str,
    call: F,
) -> Result<R, HydraError>
where
    T: TimeProvider,
    F: Future<Output = Result<R, HydraError>>,
{
    time.timeout(timeout, call).await.unwrap_or_else(|_| {
        Err(HydraError::Timeout {
            operation: operation.to_string(),
        })
    })
}

/// Resolves peers to service handles.
pub trait PeerChannels {
    /// Handle to `peer`.
    fn channel(&self, peer: PeerId) -> Rc<dyn HydraService>;
}

// ============================================================================
// In-process channels
// ============================================================================

#[derive(Default)]
struct Registry {
    services: HashMap<PeerId, Weak<dyn HydraService>>,
    dead: BTreeSet<PeerId>,
    held: BTreeSet<PeerId>,
}

/// In-process network connecting the peers of one cell.
#[derive(Clone, Default)]
pub struct LocalChannels {
    registry: Rc<RefCell<Registry>>,
    released: Rc<Notify>,
}

impl LocalChannels {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route calls for `peer` to `service`.
    pub fn register(&self, peer: PeerId, service: Weak<dyn HydraService>) {
        self.registry.borrow_mut().services.insert(peer, service);
    }

    /// Cut `peer` off. Calls to and from it fail.
    pub fn kill(&self, peer: PeerId) {
        self.registry.borrow_mut().dead.insert(peer);
        self.released.notify_waiters();
    }

    /// Reconnect `peer`.
    pub fn revive(&self, peer: PeerId) {
        self.registry.borrow_mut().dead.remove(&peer);
    }

    /// Delay every call to `peer` until [`LocalChannels::release`].
    pub fn hold(&self, peer: PeerId) {
        self.registry.borrow_mut().held.insert(peer);
    }

    /// Deliver the calls held for `peer`.
    pub fn release(&self, peer: PeerId) {
        self.registry.borrow_mut().held.remove(&peer);
        self.released.notify_waiters();
    }

    /// Whether `peer` is cut off.
    pub fn is_dead(&self, peer: PeerId) -> bool {
        self.registry.borrow().dead.contains(&peer)
    }

    /// Channels as seen from `self_id`.
    pub fn for_peer(&self, self_id: PeerId) -> Rc<dyn PeerChannels> {
        Rc::new(LocalPeerChannels {
            network: self.clone(),
            self_id,
        })
    }

    /// Wait until the call from `from` to `to` may be delivered, then
    /// resolve the target service.
    async fn deliver(&self, from: PeerId, to: PeerId) -> Result<Rc<dyn HydraService>, HydraError> {
        loop {
            let released = self.released.notified();
            {
                let registry = self.registry.borrow();
                if registry.dead.contains(&from) || registry.dead.contains(&to) {
                    return Err(HydraError::Unavailable { peer: to });
                }
                if !registry.held.contains(&to) {
                    return registry
                        .services
                        .get(&to)
                        .and_then(Weak::upgrade)
                        .ok_or(HydraError::Unavailable { peer: to });
                }
            }
            trace!(%from, %to, "call held");
            released.await;
        }
    }

    /// Fail a reply if either side died while the call ran.
    fn reply<T>(&self, from: PeerId, to: PeerId, result: Result<T, HydraError>) -> Result<T, HydraError> {
        let registry = self.registry.borrow();
        if registry.dead.contains(&from) || registry.dead.contains(&to) {
            return Err(HydraError::Unavailable { peer: to });
        }
        result
    }
}

struct LocalPeerChannels {
    network: LocalChannels,
    self_id: PeerId,
}

impl PeerChannels for LocalPeerChannels {
    fn channel(&self, peer: PeerId) -> Rc<dyn HydraService> {
        Rc::new(LocalClient {
            network: self.network.clone(),
            from: self.self_id,
            to: peer,
        })
    }
}

struct LocalClient {
    network: LocalChannels,
    from: PeerId,
    to: PeerId,
}

#[async_trait(?Send)]
impl HydraService for LocalClient {
    async fn accept_mutations(
        &self,
        request: AcceptMutationsRequest,
    ) -> Result<AcceptMutationsResponse, HydraError> {
        let service = self.network.deliver(self.from, self.to).await?;
        let result = service.accept_mutations(request).await;
        self.network.reply(self.from, self.to, result)
    }

    async fn ping_follower(
        &self,
        epoch_id: EpochId,
        leader_id: PeerId,
    ) -> Result<PingFollowerResponse, HydraError> {
        let service = self.network.deliver(self.from, self.to).await?;
        let result = service.ping_follower(epoch_id, leader_id).await;
        self.network.reply(self.from, self.to, result)
    }

    async fn get_sync_state(&self, epoch_id: EpochId) -> Result<SyncState, HydraError> {
        let service = self.network.deliver(self.from, self.to).await?;
        let result = service.get_sync_state(epoch_id).await;
        self.network.reply(self.from, self.to, result)
    }

    async fn lookup_changelog(
        &self,
        changelog_id: u32,
    ) -> Result<Option<ChangelogInfo>, HydraError> {
        let service = self.network.deliver(self.from, self.to).await?;
        let result = service.lookup_changelog(changelog_id).await;
        self.network.reply(self.from, self.to, result)
    }

    async fn read_changelog(
        &self,
        changelog_id: u32,
        first_record_id: u32,
        max_records: u32,
    ) -> Result<Vec<Vec<u8>>, HydraError> {
        let service = self.network.deliver(self.from, self.to).await?;
        let result = service
            .read_changelog(changelog_id, first_record_id, max_records)
            .await;
        self.network.reply(self.from, self.to, result)
    }

    async fn get_committed_sequence_number(&self, epoch_id: EpochId) -> Result<u64, HydraError> {
        let service = self.network.deliver(self.from, self.to).await?;
        let result = service.get_committed_sequence_number(epoch_id).await;
        self.network.reply(self.from, self.to, result)
    }

    async fn force_restart(&self, epoch_id: EpochId, reason: String) -> Result<(), HydraError> {
        let service = self.network.deliver(self.from, self.to).await?;
        let result = service.force_restart(epoch_id, reason).await;
        self.network.reply(self.from, self.to, result)
    }

    async fn commit_forwarded(
        &self,
        request: MutationRequest,
    ) -> Result<MutationResponse, HydraError> {
        let service = self.network.deliver(self.from, self.to).await?;
        let result = service.commit_forwarded(request).await;
        self.network.reply(self.from, self.to, result)
    }
}
