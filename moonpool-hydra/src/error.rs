//! Error type for all Hydra operations.
//!
//! Callers of [`HydraManager::commit_mutation`](crate::HydraManager::commit_mutation)
//! only ever need to distinguish three outcomes:
//!
//! | Outcome | Check | Retry? |
//! |---|---|---|
//! | read-only mode | [`HydraError::is_read_only`] | later, same peer |
//! | wrong role or epoch changed | [`HydraError::is_invalid_state`] | against the current leader |
//! | anything else | the error itself carries the cause | caller's decision |
//!
//! Everything internal (changelog rotation, recovery, lease renewal) stays
//! invisible except through these.

use thiserror::Error;

use crate::automaton::AutomatonError;
use crate::changelog::ChangelogError;
use crate::snapshot::SnapshotError;
use crate::types::{EpochId, PeerId, PeerState};
use crate::wire::WireError;

/// Error type for Hydra operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HydraError {
    /// The automaton is in read-only mode.
    #[error("read-only mode is active")]
    ReadOnly,

    /// The peer is not in a state that allows the operation, or the epoch
    /// changed while the operation was in flight.
    #[error("invalid state: {reason}")]
    InvalidState {
        /// What was wrong.
        reason: String,
    },

    /// A request carried an epoch other than the current one.
    #[error("invalid epoch: expected {expected}, received {received}")]
    InvalidEpoch {
        /// The epoch this peer is in.
        expected: EpochId,
        /// The epoch named by the request.
        received: EpochId,
    },

    /// The business automaton failed to apply a mutation.
    #[error("mutation {mutation_type} failed: {reason}")]
    MutationFailed {
        /// Type of the failed mutation.
        mutation_type: String,
        /// Error reported by the handler.
        reason: String,
    },

    /// Replaying the snapshot or changelog failed.
    #[error("recovery failed: {reason}")]
    Recovery {
        /// What failed.
        reason: String,
    },

    /// A follower received records that do not continue its log.
    #[error("out of order mutations: expected sequence number {expected}, received {received}")]
    OutOfOrder {
        /// Next sequence number the follower can accept.
        expected: u64,
        /// First sequence number of the rejected batch.
        received: u64,
    },

    /// The leader failed to keep acknowledgement from a quorum.
    #[error("leader lease is no longer valid")]
    LeaseExpired,

    /// A peer could not be reached.
    #[error("{peer} is unavailable")]
    Unavailable {
        /// The unreachable peer.
        peer: PeerId,
    },

    /// An operation did not complete in time.
    #[error("{operation} timed out")]
    Timeout {
        /// The operation that timed out.
        operation: String,
    },

    /// Changelog storage failed.
    #[error(transparent)]
    Changelog(#[from] ChangelogError),

    /// Snapshot storage failed.
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    /// A mutation record could not be decoded.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The business automaton failed outside mutation application.
    #[error(transparent)]
    Automaton(#[from] AutomatonError),

    /// The configuration is inconsistent.
    #[error("invalid configuration: {reason}")]
    Config {
        /// What is inconsistent.
        reason: String,
    },
}

impl HydraError {
    /// Build an [`HydraError::InvalidState`] from any message.
    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::InvalidState {
            reason: reason.into(),
        }
    }

    /// The error observed by operations whose epoch was torn down.
    pub fn epoch_canceled() -> Self {
        Self::invalid_state("epoch canceled")
    }

    /// The error used when a peer is in the wrong role for a request.
    pub fn wrong_state(state: PeerState, operation: &str) -> Self {
        Self::invalid_state(format!("cannot {operation} while {state}"))
    }

    /// Build an [`HydraError::Recovery`] from any message.
    pub fn recovery(reason: impl Into<String>) -> Self {
        Self::Recovery {
            reason: reason.into(),
        }
    }

    /// Whether callers should retry against the current leader.
    pub fn is_invalid_state(&self) -> bool {
        matches!(
            self,
            Self::InvalidState { .. } | Self::InvalidEpoch { .. } | Self::LeaseExpired
        )
    }

    /// Whether the request was rejected because of read-only mode.
    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::ReadOnly)
    }
}
