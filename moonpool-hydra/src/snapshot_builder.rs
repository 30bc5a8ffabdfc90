//! Snapshot builders.
//!
//! Building a snapshot has two halves: *capture* fixes the automaton state
//! at one sequence number, *persist* streams it into the snapshot store.
//! Capture always runs synchronously at the snapshot point, between two
//! mutation applications. The strategies differ in how long they keep the
//! automaton frozen:
//!
//! | Strategy | System lock held | Serialization |
//! |---|---|---|
//! | [`BlockingSnapshotBuilder`] | capture and persist | under the lock |
//! | [`DetachedSnapshotBuilder`] | capture only | from a copy-on-write [`SnapshotView`] |
//!
//! The detached builder is the in-process replacement for forking a child:
//! the automaton hands out a frozen view, mutation application resumes at
//! once, and the view is written out in the background. Automata that
//! cannot produce a view fall back to the blocking strategy.

use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, info};

use crate::automaton::{Automaton, SnapshotView};
use crate::config::SnapshotStrategy;
use crate::error::HydraError;
use crate::lock::{AutomatonLocks, SystemLockGuard};
use crate::providers::TimeProvider;
use crate::snapshot::{build_snapshot_envelope, SnapshotMeta, SnapshotParams, SnapshotStore};

/// Chunk size used when streaming into the store.
const WRITE_CHUNK_SIZE: usize = 64 * 1024;

/// State captured at the snapshot point, waiting to be persisted.
pub enum SnapshotJob {
    /// Already serialized; the system lock stays held until persisted.
    Serialized {
        /// Envelope bytes.
        data: Vec<u8>,
        /// Keeps new mutations out until the snapshot is durable.
        guard: SystemLockGuard,
    },
    /// Frozen view, serialized later without any lock.
    Detached {
        /// Encoded kept responses.
        kept: Vec<u8>,
        /// Frozen automaton state.
        view: Box<dyn SnapshotView>,
    },
}

/// Captures automaton state at a snapshot point.
pub trait SnapshotBuilder {
    /// Capture the current state. Called between two mutation applications.
    fn capture(
        &self,
        automaton: &dyn Automaton,
        kept: Vec<u8>,
        locks: &Rc<AutomatonLocks>,
    ) -> Result<SnapshotJob, HydraError>;
}

/// Serializes while holding the system lock.
#[derive(Debug, Default, Clone, Copy)]
pub struct BlockingSnapshotBuilder;

impl SnapshotBuilder for BlockingSnapshotBuilder {
    fn capture(
        &self,
        automaton: &dyn Automaton,
        kept: Vec<u8>,
        locks: &Rc<AutomatonLocks>,
    ) -> Result<SnapshotJob, HydraError> {
        let guard = locks.acquire_system();
        let mut state = Vec::new();
        automaton.save_snapshot(&mut state)?;
        Ok(SnapshotJob::Serialized {
            data: build_snapshot_envelope(&kept, &state),
            guard,
        })
    }
}

/// Takes a copy-on-write view under the system lock and serializes it
/// after releasing the lock.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedSnapshotBuilder;

impl SnapshotBuilder for DetachedSnapshotBuilder {
    fn capture(
        &self,
        automaton: &dyn Automaton,
        kept: Vec<u8>,
        locks: &Rc<AutomatonLocks>,
    ) -> Result<SnapshotJob, HydraError> {
        let view = {
            let _guard = locks.acquire_system();
            automaton.snapshot_view()
        };
        match view {
            Some(view) => Ok(SnapshotJob::Detached { kept, view }),
            None => {
                debug!("automaton has no snapshot view, building blocking snapshot");
                BlockingSnapshotBuilder.capture(automaton, kept, locks)
            }
        }
    }
}

/// The builder for a configured strategy.
pub fn snapshot_builder(strategy: SnapshotStrategy) -> Box<dyn SnapshotBuilder> {
    match strategy {
        SnapshotStrategy::Blocking => Box::new(BlockingSnapshotBuilder),
        SnapshotStrategy::Detached => Box::new(DetachedSnapshotBuilder),
    }
}

/// Write a captured job into the store, within `timeout`.
pub async fn persist_snapshot<T: TimeProvider>(
    time: &T,
    timeout: Duration,
    store: &dyn SnapshotStore,
    meta: SnapshotMeta,
    job: SnapshotJob,
) -> Result<SnapshotParams, HydraError> {
    let snapshot_id = meta.snapshot_id;
    let result = time
        .timeout(timeout, write_snapshot(store, meta, job))
        .await
        .map_err(|_| HydraError::Timeout {
            operation: format!("building snapshot {snapshot_id}"),
        })?;
    let params = result?;
    info!(
        snapshot_id,
        version = %params.version,
        sequence_number = params.sequence_number,
        checksum = params.checksum,
        "snapshot built"
    );
    Ok(params)
}

async fn write_snapshot(
    store: &dyn SnapshotStore,
    meta: SnapshotMeta,
    job: SnapshotJob,
) -> Result<SnapshotParams, HydraError> {
    let (data, _guard) = match job {
        SnapshotJob::Serialized { data, guard } => (data, Some(guard)),
        SnapshotJob::Detached { kept, view } => {
            let mut state = Vec::new();
            view.save(&mut state)?;
            (build_snapshot_envelope(&kept, &state), None)
        }
    };
    let mut writer = store.create_writer(meta).await?;
    for chunk in data.chunks(WRITE_CHUNK_SIZE) {
        writer.write(chunk).await?;
    }
    Ok(writer.close().await?)
}
