//! # Moonpool Hydra: replicated state-machine engine
//!
//! This crate replicates a deterministic business [`Automaton`] across a
//! small cell of peers. One peer leads each epoch: it assigns every mutation
//! a position in the log, ships it to the followers and applies it once a
//! quorum has it durably logged. Followers apply the same mutations in the
//! same order, so every peer holds the same state.
//!
//! The election layer is external: it decides who leads which epoch and
//! tells each peer through [`ElectionCallbacks`]. Hydra never runs its own
//! leader election.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       HydraManager                          │
//! │  commit_mutation · sync_with_leader · build_snapshot        │
//! │  ElectionCallbacks · HydraService (peer calls) · signals    │
//! └───────────────┬──────────────────────────────┬──────────────┘
//!                 │ per epoch (EpochContext)     │
//!   ┌─────────────┴────────────┐   ┌─────────────┴─────────────┐
//!   │ Leader                   │   │ Follower                  │
//!   │  LeaderRecovery          │   │  FollowerRecovery         │
//!   │  LeaderCommitter         │   │  FollowerCommitter        │
//!   │  LeaseTracker            │   │  (watchdog)               │
//!   └─────────────┬────────────┘   └─────────────┬─────────────┘
//!                 └──────────────┬───────────────┘
//!                                ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   DecoratedAutomaton                        │
//! │  versions · pending queue · locks · kept responses          │
//! └───────┬──────────────────────┬──────────────────────┬───────┘
//!         ▼                      ▼                      ▼
//!   business Automaton     ChangelogStore         SnapshotStore
//! ```
//!
//! ## Versions
//!
//! A [`Version`] `(segment_id, record_id)` names a position in the log. The
//! automaton, committed and logged versions of a peer are "next position"
//! markers and always satisfy `automaton <= committed <= logged` while the
//! peer is active. Every record also carries a global sequence number; a
//! record is applied only when its sequence number directly follows the
//! last applied one, so nothing is applied twice or out of order.
//!
//! ## Runtime
//!
//! A peer runs on a single-threaded tokio runtime inside a
//! [`tokio::task::LocalSet`]. Shared state lives in `Rc`/`RefCell`, async
//! traits are `?Send`, and all time and randomness goes through
//! [`Providers`], so a whole cell can run in one test with virtual time.
//!
//! ## Quick start
//!
//! ```text
//! let channels = LocalChannels::new();
//! let election = LocalElection::new(cell.clone(), TokioTimeProvider::new(), delay);
//! let manager = HydraManager::new(HydraDependencies { .. });
//! channels.register(peer, Rc::downgrade(&manager) as Weak<dyn HydraService>);
//! manager.initialize().await?;
//! manager.commit_mutation(MutationRequest::new("kv.set", payload)).await?;
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

pub mod automaton;
pub mod changelog;
pub mod channel;
pub mod committer;
pub mod config;
pub mod decorated;
pub mod election;
pub mod epoch;
pub mod error;
pub mod kept;
pub mod lease;
pub mod lock;
pub mod manager;
pub mod promise;
pub mod providers;
pub mod recovery;
pub mod signals;
pub mod snapshot;
pub mod snapshot_builder;
pub mod types;
pub mod wire;

pub use automaton::{Automaton, AutomatonError, MutationContext, SnapshotView};
pub use changelog::{Changelog, ChangelogError, ChangelogStore, InMemoryChangelogStore};
pub use channel::{HydraService, LocalChannels, PeerChannels};
pub use config::{HydraConfig, SnapshotStrategy};
pub use election::{
    ElectionCallbacks, ElectionEpoch, ElectionManager, ElectionPriority, LocalElection,
};
pub use error::HydraError;
pub use manager::{HydraDependencies, HydraManager};
pub use providers::{
    Providers, RandomProvider, SeededProviders, TimeProvider, TokioProviders, TokioTimeProvider,
};
pub use signals::HydraSignals;
pub use snapshot::{InMemorySnapshotStore, SnapshotError, SnapshotMeta, SnapshotStore};
pub use types::{
    CellConfig, EpochId, MutationId, MutationRequest, MutationResponse, PeerId, PeerState,
    Version,
};
