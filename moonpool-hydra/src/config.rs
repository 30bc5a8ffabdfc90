//! Configuration of a Hydra peer.
//!
//! [`HydraConfig`] is a plain serde struct. Production defaults follow the
//! table below; [`HydraConfig::for_simulation`] shrinks every timing so a
//! whole cell can run inside a unit test.
//!
//! | Setting | Default | Simulation |
//! |---|---|---|
//! | `max_commit_batch_delay` | 10ms | 1ms |
//! | `max_commit_batch_record_count` | 10 000 | 100 |
//! | `max_commit_batch_duration` | 100ms | 10ms |
//! | `leader_lease_check_period` | 2s | 20ms |
//! | `leader_lease_timeout` | 5s | 200ms |
//! | `leader_lease_grace_delay` | 6s | 250ms |
//! | `commit_flush_rpc_timeout` | 15s | 100ms |
//! | `restart_backoff_time` | 5s | 20ms |
//! | `snapshot_build_timeout` | 5min | 5s |
//! | `snapshot_build_period` | 60min | none |
//! | `max_changelog_record_count` | 1 000 000 | 1 000 000 |
//! | `max_changelog_data_size` | 1GiB | 1GiB |
//! | `heartbeat_mutation_period` | 60s | none |

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::HydraError;

/// How a snapshot isolates itself from concurrent mutation application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SnapshotStrategy {
    /// Serialize the automaton while holding the system lock.
    #[default]
    Blocking,
    /// Take a copy-on-write view under the system lock and serialize it in
    /// a background task. Falls back to `Blocking` when the automaton
    /// cannot produce a view.
    Detached,
}

/// Configuration for one Hydra peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HydraConfig {
    /// Upper bound on how long logged records wait before being sent to
    /// followers.
    pub max_commit_batch_delay: Duration,

    /// Maximum number of records in one replication batch.
    pub max_commit_batch_record_count: usize,

    /// How long `commit_mutations` may apply mutations before yielding.
    pub max_commit_batch_duration: Duration,

    /// Interval between lease checks on the leader.
    pub leader_lease_check_period: Duration,

    /// How long a successful lease check keeps the lease valid.
    ///
    /// Followers also give up on a silent leader after this long.
    pub leader_lease_timeout: Duration,

    /// Time a new leader waits after epoch start before its lease can
    /// become valid, so a deposed leader's lease has expired.
    pub leader_lease_grace_delay: Duration,

    /// Skip the grace delay. Only safe for single-peer cells and tests.
    pub disable_leader_lease_grace_delay: bool,

    /// Timeout of one replication or ping request.
    pub commit_flush_rpc_timeout: Duration,

    /// Back-off between attempts to reach a leader that is not ready yet.
    pub restart_backoff_time: Duration,

    /// Timeout for building one snapshot.
    pub snapshot_build_timeout: Duration,

    /// Build a snapshot at least this often.
    pub snapshot_build_period: Option<Duration>,

    /// Snapshot isolation strategy.
    pub snapshot_strategy: SnapshotStrategy,

    /// Rotate the changelog once it holds this many records.
    pub max_changelog_record_count: u32,

    /// Rotate the changelog once it holds this many bytes.
    pub max_changelog_data_size: u64,

    /// Commit an empty heartbeat mutation this often.
    pub heartbeat_mutation_period: Option<Duration>,

    /// Maximum number of records kept for replication on the leader.
    pub max_queued_mutation_count: usize,

    /// Maximum number of responses kept for idempotent retries.
    pub max_kept_responses: usize,

    /// Step down when the business automaton fails a mutation on the leader.
    pub step_down_on_mutation_failure: bool,
}

impl Default for HydraConfig {
    fn default() -> Self {
        Self {
            max_commit_batch_delay: Duration::from_millis(10),
            max_commit_batch_record_count: 10_000,
            max_commit_batch_duration: Duration::from_millis(100),
            leader_lease_check_period: Duration::from_secs(2),
            leader_lease_timeout: Duration::from_secs(5),
            leader_lease_grace_delay: Duration::from_secs(6),
            disable_leader_lease_grace_delay: false,
            commit_flush_rpc_timeout: Duration::from_secs(15),
            restart_backoff_time: Duration::from_secs(5),
            snapshot_build_timeout: Duration::from_secs(5 * 60),
            snapshot_build_period: Some(Duration::from_secs(60 * 60)),
            snapshot_strategy: SnapshotStrategy::Blocking,
            max_changelog_record_count: 1_000_000,
            max_changelog_data_size: 1 << 30,
            heartbeat_mutation_period: Some(Duration::from_secs(60)),
            max_queued_mutation_count: 100_000,
            max_kept_responses: 100_000,
            step_down_on_mutation_failure: true,
        }
    }
}

impl HydraConfig {
    /// Create a config suitable for in-process cells under test.
    pub fn for_simulation() -> Self {
        Self {
            max_commit_batch_delay: Duration::from_millis(1),
            max_commit_batch_record_count: 100,
            max_commit_batch_duration: Duration::from_millis(10),
            leader_lease_check_period: Duration::from_millis(20),
            leader_lease_timeout: Duration::from_millis(200),
            leader_lease_grace_delay: Duration::from_millis(250),
            commit_flush_rpc_timeout: Duration::from_millis(100),
            restart_backoff_time: Duration::from_millis(20),
            snapshot_build_timeout: Duration::from_secs(5),
            snapshot_build_period: None,
            heartbeat_mutation_period: None,
            ..Self::default()
        }
    }

    /// Parse a JSON document; missing fields take their default.
    pub fn from_json(json: &str) -> Result<Self, HydraError> {
        let config: Self = serde_json::from_str(json).map_err(|e| HydraError::Config {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the settings are consistent.
    pub fn validate(&self) -> Result<(), HydraError> {
        if !self.disable_leader_lease_grace_delay
            && self.leader_lease_grace_delay <= self.leader_lease_timeout
        {
            return Err(HydraError::Config {
                reason: "leader_lease_grace_delay must be larger than leader_lease_timeout"
                    .to_string(),
            });
        }
        if self.max_commit_batch_record_count == 0 {
            return Err(HydraError::Config {
                reason: "max_commit_batch_record_count must be positive".to_string(),
            });
        }
        if self.max_changelog_record_count == 0 {
            return Err(HydraError::Config {
                reason: "max_changelog_record_count must be positive".to_string(),
            });
        }
        if self.max_queued_mutation_count == 0 {
            return Err(HydraError::Config {
                reason: "max_queued_mutation_count must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Effective grace delay after epoch start.
    pub fn effective_grace_delay(&self) -> Duration {
        if self.disable_leader_lease_grace_delay {
            Duration::ZERO
        } else {
            self.leader_lease_grace_delay
        }
    }
}
