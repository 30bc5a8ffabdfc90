//! Snapshot storage.
//!
//! A snapshot is a full serialized copy of the automaton at a given
//! version. Its id is the id of the changelog segment that starts right
//! after it, so the snapshot with id `s` is always at version `(s, 0)` and
//! recovery only replays segments `>= s`.
//!
//! The stored bytes are an envelope:
//!
//! ```text
//! [kept_length:4][kept responses][automaton state]
//! ```
//!
//! and every snapshot carries a [`SnapshotMeta`] with the CRC32C of those
//! bytes, which peers compare to detect divergent automata.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::types::Version;

/// Snapshot storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    /// No snapshot with that id.
    #[error("snapshot {snapshot_id} not found")]
    NotFound {
        /// Requested snapshot.
        snapshot_id: u32,
    },

    /// A snapshot with that id was already written.
    #[error("snapshot {snapshot_id} already exists")]
    AlreadyExists {
        /// Requested snapshot.
        snapshot_id: u32,
    },

    /// The stored bytes do not match the recorded checksum or layout.
    #[error("snapshot {snapshot_id} is corrupted: {reason}")]
    Corrupted {
        /// Damaged snapshot.
        snapshot_id: u32,
        /// What is wrong.
        reason: String,
    },

    /// The backend failed.
    #[error("snapshot I/O error: {reason}")]
    Io {
        /// Backend error.
        reason: String,
    },
}

/// Metadata stored next to every snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Snapshot id, equal to the segment id of `version`.
    pub snapshot_id: u32,
    /// Automaton version captured by the snapshot.
    pub version: Version,
    /// Sequence number of the last record included.
    pub sequence_number: u64,
    /// Random seed of the last record included.
    pub random_seed: u64,
    /// Wall-clock time of the build, in microseconds since the unix epoch.
    pub timestamp_micros: u64,
    /// CRC32C of the stored bytes. Filled in when the writer closes.
    pub checksum: u32,
}

/// What a successful snapshot build reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotParams {
    /// Snapshot id.
    pub snapshot_id: u32,
    /// Automaton version captured.
    pub version: Version,
    /// Sequence number captured.
    pub sequence_number: u64,
    /// CRC32C of the stored bytes.
    pub checksum: u32,
    /// Size of the stored bytes.
    pub size: u64,
}

/// Streaming writer for one snapshot.
#[async_trait(?Send)]
pub trait SnapshotWriter {
    /// Append bytes.
    async fn write(&mut self, data: &[u8]) -> Result<(), SnapshotError>;

    /// Seal the snapshot. It becomes visible to readers only now.
    async fn close(self: Box<Self>) -> Result<SnapshotParams, SnapshotError>;
}

/// Reader for one snapshot.
#[async_trait(?Send)]
pub trait SnapshotReader {
    /// Metadata of the snapshot.
    fn meta(&self) -> &SnapshotMeta;

    /// Read and verify the whole snapshot.
    async fn read_all(&mut self) -> Result<Vec<u8>, SnapshotError>;
}

/// Where snapshots live.
#[async_trait(?Send)]
pub trait SnapshotStore {
    /// Start writing a snapshot described by `meta`.
    async fn create_writer(&self, meta: SnapshotMeta)
        -> Result<Box<dyn SnapshotWriter>, SnapshotError>;

    /// Open a sealed snapshot.
    async fn create_reader(&self, snapshot_id: u32) -> Result<Box<dyn SnapshotReader>, SnapshotError>;

    /// Newest sealed snapshot whose id is at most `max_snapshot_id`.
    async fn latest_snapshot_id(
        &self,
        max_snapshot_id: Option<u32>,
    ) -> Result<Option<u32>, SnapshotError>;
}

/// Split stored snapshot bytes into kept responses and automaton state.
pub fn split_snapshot_envelope(
    snapshot_id: u32,
    data: &[u8],
) -> Result<(&[u8], &[u8]), SnapshotError> {
    let corrupted = |reason: &str| SnapshotError::Corrupted {
        snapshot_id,
        reason: reason.to_string(),
    };
    let length_bytes: [u8; 4] = data
        .get(..4)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| corrupted("missing envelope header"))?;
    let kept_length = u32::from_le_bytes(length_bytes) as usize;
    let kept = data
        .get(4..4 + kept_length)
        .ok_or_else(|| corrupted("truncated kept responses"))?;
    Ok((kept, &data[4 + kept_length..]))
}

/// Prefix automaton state with the kept responses.
pub fn build_snapshot_envelope(kept: &[u8], state: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + kept.len() + state.len());
    data.extend_from_slice(&(kept.len() as u32).to_le_bytes());
    data.extend_from_slice(kept);
    data.extend_from_slice(state);
    data
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Debug, Clone)]
struct StoredSnapshot {
    meta: SnapshotMeta,
    data: Vec<u8>,
}

/// In-memory [`SnapshotStore`]. Clones share the same snapshots.
#[derive(Debug, Clone, Default)]
pub struct InMemorySnapshotStore {
    snapshots: Rc<RefCell<BTreeMap<u32, StoredSnapshot>>>,
}

impl InMemorySnapshotStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Metadata of every sealed snapshot, in id order.
    pub fn metas(&self) -> Vec<SnapshotMeta> {
        self.snapshots
            .borrow()
            .values()
            .map(|snapshot| snapshot.meta.clone())
            .collect()
    }

    /// Flip one byte of a stored snapshot.
    pub fn corrupt(&self, snapshot_id: u32) {
        if let Some(snapshot) = self.snapshots.borrow_mut().get_mut(&snapshot_id) {
            if let Some(byte) = snapshot.data.last_mut() {
                *byte ^= 0xff;
            }
        }
    }
}

#[async_trait(?Send)]
impl SnapshotStore for InMemorySnapshotStore {
    async fn create_writer(
        &self,
        meta: SnapshotMeta,
    ) -> Result<Box<dyn SnapshotWriter>, SnapshotError> {
        if self.snapshots.borrow().contains_key(&meta.snapshot_id) {
            return Err(SnapshotError::AlreadyExists {
                snapshot_id: meta.snapshot_id,
            });
        }
        Ok(Box::new(InMemorySnapshotWriter {
            meta,
            data: Vec::new(),
            checksum: 0,
            snapshots: self.snapshots.clone(),
        }))
    }

    async fn create_reader(
        &self,
        snapshot_id: u32,
    ) -> Result<Box<dyn SnapshotReader>, SnapshotError> {
        let snapshot = self
            .snapshots
            .borrow()
            .get(&snapshot_id)
            .cloned()
            .ok_or(SnapshotError::NotFound { snapshot_id })?;
        Ok(Box::new(InMemorySnapshotReader { snapshot }))
    }

    async fn latest_snapshot_id(
        &self,
        max_snapshot_id: Option<u32>,
    ) -> Result<Option<u32>, SnapshotError> {
        let snapshots = self.snapshots.borrow();
        let latest = match max_snapshot_id {
            Some(max) => snapshots.range(..=max).next_back(),
            None => snapshots.iter().next_back(),
        };
        Ok(latest.map(|(id, _)| *id))
    }
}

struct InMemorySnapshotWriter {
    meta: SnapshotMeta,
    data: Vec<u8>,
    checksum: u32,
    snapshots: Rc<RefCell<BTreeMap<u32, StoredSnapshot>>>,
}

#[async_trait(?Send)]
impl SnapshotWriter for InMemorySnapshotWriter {
    async fn write(&mut self, data: &[u8]) -> Result<(), SnapshotError> {
        self.checksum = crc32c::crc32c_append(self.checksum, data);
        self.data.extend_from_slice(data);
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<SnapshotParams, SnapshotError> {
        let this = *self;
        let mut meta = this.meta;
        meta.checksum = this.checksum;
        let params = SnapshotParams {
            snapshot_id: meta.snapshot_id,
            version: meta.version,
            sequence_number: meta.sequence_number,
            checksum: meta.checksum,
            size: this.data.len() as u64,
        };
        let mut snapshots = this.snapshots.borrow_mut();
        if snapshots.contains_key(&meta.snapshot_id) {
            return Err(SnapshotError::AlreadyExists {
                snapshot_id: meta.snapshot_id,
            });
        }
        debug!(
            snapshot_id = meta.snapshot_id,
            version = %meta.version,
            size = params.size,
            "snapshot sealed"
        );
        snapshots.insert(
            meta.snapshot_id,
            StoredSnapshot {
                meta,
                data: this.data,
            },
        );
        Ok(params)
    }
}

struct InMemorySnapshotReader {
    snapshot: StoredSnapshot,
}

#[async_trait(?Send)]
impl SnapshotReader for InMemorySnapshotReader {
    fn meta(&self) -> &SnapshotMeta {
        &self.snapshot.meta
    }

    async fn read_all(&mut self) -> Result<Vec<u8>, SnapshotError> {
        let actual = crc32c::crc32c(&self.snapshot.data);
        if actual != self.snapshot.meta.checksum {
            return Err(SnapshotError::Corrupted {
                snapshot_id: self.snapshot.meta.snapshot_id,
                reason: format!(
                    "checksum mismatch: expected {:#010x}, got {actual:#010x}",
                    self.snapshot.meta.checksum
                ),
            });
        }
        Ok(self.snapshot.data.clone())
    }
}
