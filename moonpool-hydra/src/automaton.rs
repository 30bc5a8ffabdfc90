//! The business automaton interface.
//!
//! The consensus core treats the replicated state machine as a capability
//! set: apply a mutation, save state, load state, clear state. It never
//! looks inside mutation payloads.
//!
//! Handlers must be deterministic. Everything a handler may legitimately
//! vary on (time, randomness, the mutation id) is carried by the
//! [`MutationContext`] and is identical on every peer.

use std::io::{Read, Write};
use std::time::Duration;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use thiserror::Error;

use crate::types::{EpochId, MutationId, Version};

/// Error reported by a business automaton.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct AutomatonError {
    /// Human readable cause.
    pub message: String,
}

impl AutomatonError {
    /// Create an error from any message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for AutomatonError {
    fn from(error: std::io::Error) -> Self {
        Self::new(error.to_string())
    }
}

impl From<serde_json::Error> for AutomatonError {
    fn from(error: serde_json::Error) -> Self {
        Self::new(error.to_string())
    }
}

/// Everything a handler may read while applying one mutation.
#[derive(Debug)]
pub struct MutationContext<'a> {
    /// Handler name.
    pub mutation_type: &'a str,
    /// Opaque mutation arguments.
    pub payload: &'a [u8],
    /// Position of the record in the log.
    pub version: Version,
    /// Global 1-based index of the record.
    pub sequence_number: u64,
    /// Epoch that logged the record.
    pub epoch: EpochId,
    /// Schema version the mutation was produced under.
    pub reign: u32,
    /// Client id, when the request carried one.
    pub mutation_id: Option<MutationId>,
    /// Logging time, identical on every peer.
    pub timestamp: Duration,
    /// Seed of this record.
    pub random_seed: u64,
    rng: ChaCha8Rng,
}

impl<'a> MutationContext<'a> {
    /// Build a context. The RNG is seeded from `random_seed`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mutation_type: &'a str,
        payload: &'a [u8],
        version: Version,
        sequence_number: u64,
        epoch: EpochId,
        reign: u32,
        mutation_id: Option<MutationId>,
        timestamp: Duration,
        random_seed: u64,
    ) -> Self {
        Self {
            mutation_type,
            payload,
            version,
            sequence_number,
            epoch,
            reign,
            mutation_id,
            timestamp,
            random_seed,
            rng: ChaCha8Rng::seed_from_u64(random_seed),
        }
    }

    /// Deterministic RNG; every peer draws the same values.
    pub fn rng(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }
}

/// A frozen copy of automaton state that can be serialized later.
///
/// Produced under the system lock by [`Automaton::snapshot_view`]; the
/// automaton keeps applying mutations while the view is written out.
pub trait SnapshotView {
    /// Serialize the frozen state.
    fn save(&self, writer: &mut dyn Write) -> Result<(), AutomatonError>;
}

/// A deterministic state machine replicated by Hydra.
pub trait Automaton {
    /// Apply one mutation and return the response bytes.
    ///
    /// An error is treated as a deterministic failure of this mutation: the
    /// version still advances on every peer and the caller sees
    /// `MutationFailed`.
    fn apply_mutation(&mut self, context: &mut MutationContext<'_>)
        -> Result<Vec<u8>, AutomatonError>;

    /// Serialize the full state.
    fn save_snapshot(&self, writer: &mut dyn Write) -> Result<(), AutomatonError>;

    /// Replace the state with a serialized one. Called on a cleared automaton.
    fn load_snapshot(&mut self, reader: &mut dyn Read) -> Result<(), AutomatonError>;

    /// Reset to the empty genesis state.
    fn clear(&mut self);

    /// Schema version stamped on newly logged mutations.
    fn current_reign(&self) -> u32 {
        0
    }

    /// Copy-on-write view for detached snapshots. `None` forces the
    /// blocking strategy.
    fn snapshot_view(&self) -> Option<Box<dyn SnapshotView>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::*;

    #[test]
    fn test_context_rng_is_seeded() {
        let mut a = MutationContext::new(
            "t",
            &[],
            Version::ZERO,
            1,
            EpochId(1),
            0,
            None,
            Duration::ZERO,
            77,
        );
        let mut b = MutationContext::new(
            "t",
            &[],
            Version::new(9, 9),
            2,
            EpochId(4),
            0,
            None,
            Duration::ZERO,
            77,
        );
        let x: u64 = a.rng().random();
        let y: u64 = b.rng().random();
        assert_eq!(x, y);
    }

    #[test]
    fn test_error_conversions() {
        let io = std::io::Error::other("disk");
        assert_eq!(AutomatonError::from(io).message, "disk");
        let json = serde_json::from_str::<u32>("x").expect_err("bad json");
        assert!(!AutomatonError::from(json).message.is_empty());
    }
}
