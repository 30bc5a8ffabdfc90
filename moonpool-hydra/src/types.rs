//! Core types for the Hydra replicated state machine.
//!
//! This module defines the building blocks shared by every other module:
//!
//! - [`Version`]: position in the mutation log (segment id, record id)
//! - [`MutationId`]: client-chosen identifier used for idempotent retries
//! - [`PeerId`], [`EpochId`]: who participates and in which term
//! - [`PeerState`]: the role a peer currently plays
//! - [`MutationRequest`], [`MutationResponse`]: the unit of replication
//! - [`CellConfig`]: the static set of voting peers

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::providers::RandomProvider;

/// A position in the mutation log.
///
/// Versions are ordered lexicographically: first by segment (changelog id),
/// then by record inside that segment. A version is a *next position*
/// marker: an automaton at version `(s, r)` has applied every record that
/// precedes `(s, r)` and will apply the record logged at `(s, r)` next.
///
/// # Invariants
///
/// - Versions never decrease over the lifetime of a cell.
/// - Rotating the changelog moves from `(s, r)` to `(s + 1, 0)`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Version {
    /// Changelog segment id.
    pub segment_id: u32,
    /// Record index inside the segment.
    pub record_id: u32,
}

impl Version {
    /// The genesis version: empty segment zero.
    pub const ZERO: Self = Self::new(0, 0);

    /// Create a new version.
    pub const fn new(segment_id: u32, record_id: u32) -> Self {
        Self {
            segment_id,
            record_id,
        }
    }

    /// The version following a single record logged at `self`.
    pub const fn advance(self) -> Self {
        Self::new(self.segment_id, self.record_id + 1)
    }

    /// The first version of the next segment.
    pub const fn rotate(self) -> Self {
        Self::new(self.segment_id + 1, 0)
    }

    /// Encode the version as a single integer, segment in the high bits.
    ///
    /// Used as the election priority of a peer.
    pub const fn to_revision(self) -> u64 {
        ((self.segment_id as u64) << 32) | self.record_id as u64
    }

    /// Decode a version produced by [`Version::to_revision`].
    pub const fn from_revision(revision: u64) -> Self {
        Self::new((revision >> 32) as u32, (revision & 0xffff_ffff) as u32)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment_id, self.record_id)
    }
}

/// Identifier of a mutation, chosen by the client.
///
/// Two 64-bit halves, like a UUID. Resubmitting a request with the same id
/// after a failover returns the response kept from the first application
/// instead of applying it a second time.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct MutationId {
    /// High half.
    pub first: u64,
    /// Low half.
    pub second: u64,
}

impl MutationId {
    /// Create a mutation id from its two halves.
    pub const fn new(first: u64, second: u64) -> Self {
        Self { first, second }
    }

    /// Draw a fresh random mutation id.
    pub fn random<R: RandomProvider>(random: &R) -> Self {
        Self::new(random.random(), random.random())
    }

    /// Draw a fresh random mutation id from any RNG.
    pub fn from_rng<G: Rng>(rng: &mut G) -> Self {
        Self::new(rng.random(), rng.random())
    }
}

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}-{:016x}", self.first, self.second)
    }
}

/// Identifier of a peer inside the cell.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct PeerId(pub u32);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer({})", self.0)
    }
}

/// Identifier of an election epoch (term).
///
/// Issued by the election layer; strictly increasing across epochs.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct EpochId(pub u64);

impl EpochId {
    /// Placeholder epoch carried by records logged before any election.
    pub const NONE: Self = Self(0);

    /// The epoch following this one.
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for EpochId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "epoch({})", self.0)
    }
}

/// The role a peer currently plays.
///
/// Transitions are driven by election callbacks and by recovery completion,
/// never by user calls:
///
/// ```text
/// Stopped ──initialize──> Elections ──start leading───> LeaderRecovery ──> Leading ──┐
///                            ^     └──start following─> FollowerRecovery ─> Following ┤
///                            └────────────────────── stop leading / following ───────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PeerState {
    /// Not participating.
    #[default]
    Stopped,
    /// Participating in elections without a role.
    Elections,
    /// Elected leader, replaying the local log.
    LeaderRecovery,
    /// Leader with a recovered automaton.
    Leading,
    /// Following, catching up with the leader.
    FollowerRecovery,
    /// Follower applying the leader's mutation stream.
    Following,
}

impl PeerState {
    /// Whether this is one of the two leader states.
    pub fn is_leader(self) -> bool {
        matches!(self, Self::LeaderRecovery | Self::Leading)
    }

    /// Whether this is one of the two follower states.
    pub fn is_follower(self) -> bool {
        matches!(self, Self::FollowerRecovery | Self::Following)
    }

    /// Whether the peer is replaying its log.
    pub fn is_recovery(self) -> bool {
        matches!(self, Self::LeaderRecovery | Self::FollowerRecovery)
    }

    /// Whether the peer is past recovery in either role.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Leading | Self::Following)
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Elections => "elections",
            Self::LeaderRecovery => "leader_recovery",
            Self::Leading => "leading",
            Self::FollowerRecovery => "follower_recovery",
            Self::Following => "following",
        };
        f.write_str(name)
    }
}

/// A mutation submitted for replication.
///
/// The payload is opaque to the consensus core; only the business
/// automaton interprets it, keyed by `mutation_type`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MutationRequest {
    /// Handler name the business automaton dispatches on.
    pub mutation_type: String,

    /// Opaque serialized arguments.
    pub payload: Vec<u8>,

    /// Optional id for idempotent retries.
    pub mutation_id: Option<MutationId>,

    /// Whether a follower may forward this request to the leader.
    pub allow_leader_forwarding: bool,

    /// Schema version of the mutation; defaults to the automaton's reign.
    pub reign: Option<u32>,

    /// Reject the request unless it is logged in this epoch.
    pub epoch_id: Option<EpochId>,
}

impl MutationRequest {
    /// Create a request with the given type and payload.
    pub fn new(mutation_type: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            mutation_type: mutation_type.into(),
            payload: payload.into(),
            ..Self::default()
        }
    }

    /// Attach a mutation id.
    pub fn with_mutation_id(mut self, mutation_id: MutationId) -> Self {
        self.mutation_id = Some(mutation_id);
        self
    }

    /// Allow followers to forward the request to the leader.
    pub fn with_leader_forwarding(mut self) -> Self {
        self.allow_leader_forwarding = true;
        self
    }

    /// Pin the request to an epoch.
    pub fn with_epoch(mut self, epoch_id: EpochId) -> Self {
        self.epoch_id = Some(epoch_id);
        self
    }
}

/// Response produced by the business automaton for a committed mutation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MutationResponse {
    /// Opaque serialized response.
    pub data: Vec<u8>,
}

impl MutationResponse {
    /// Wrap response bytes.
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self { data: data.into() }
    }
}

/// Static membership of a cell.
///
/// Every peer in the list votes. A quorum is a strict majority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellConfig {
    /// Voting peers, in id order.
    pub peers: Vec<PeerId>,
}

impl CellConfig {
    /// Create a cell of `count` peers numbered from zero.
    pub fn with_peer_count(count: u32) -> Self {
        Self {
            peers: (0..count).map(PeerId).collect(),
        }
    }

    /// Number of voting peers.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Smallest number of peers forming a strict majority.
    pub fn quorum_count(&self) -> usize {
        self.peers.len() / 2 + 1
    }

    /// Whether `peer` belongs to the cell.
    pub fn contains(&self, peer: PeerId) -> bool {
        self.peers.contains(&peer)
    }

    /// Every peer except `self_id`.
    pub fn others(&self, self_id: PeerId) -> impl Iterator<Item = PeerId> + '_ {
        self.peers.iter().copied().filter(move |peer| *peer != self_id)
    }
}
