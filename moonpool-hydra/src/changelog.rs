//! Changelog storage and the ordered changelog writer.
//!
//! A changelog is one append-only segment of the mutation log, addressed by
//! its segment id. The [`ChangelogStore`] trait abstracts where segments
//! live; [`InMemoryChangelogStore`] keeps them in memory behind an `Rc` so a
//! peer can be torn down and rebuilt on top of the same data.
//!
//! ## Writer
//!
//! During an epoch every record goes through a [`ChangelogWriter`], a local
//! task that owns the open segment:
//!
//! ```text
//! log_*_mutation ──Append──┐
//! rotate_changelog ─Rotate─┼──> [mpsc] ──> writer task ──> Changelog::append
//! barrier ─────────Barrier─┘                    │               Changelog::flush
//!                                               └── resolves flush promises in log order
//! ```
//!
//! Appends are batched: everything queued when the task wakes up is written
//! with one `append` and one `flush`. A record must land exactly at the
//! segment's current record count, so gaps and overlaps are detected at
//! write time. The first failure poisons the writer and every later command
//! fails with the same error.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::promise::{promise, Promise, PromiseFuture};
use crate::types::Version;

/// Changelog storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChangelogError {
    /// The segment does not exist.
    #[error("changelog {changelog_id} not found")]
    NotFound {
        /// Requested segment.
        changelog_id: u32,
    },

    /// The segment already exists.
    #[error("changelog {changelog_id} already exists")]
    AlreadyExists {
        /// Requested segment.
        changelog_id: u32,
    },

    /// The segment was closed.
    #[error("changelog {changelog_id} is closed")]
    Closed {
        /// Closed segment.
        changelog_id: u32,
    },

    /// A record does not continue the segment.
    #[error("changelog {changelog_id} expected record {expected}, received {received}")]
    Gap {
        /// Segment being written.
        changelog_id: u32,
        /// Current record count of the segment.
        expected: u32,
        /// Record id of the rejected record.
        received: u32,
    },

    /// The backend failed.
    #[error("changelog {changelog_id} I/O error: {reason}")]
    Io {
        /// Segment being accessed.
        changelog_id: u32,
        /// Backend error.
        reason: String,
    },

    /// The writer task is gone.
    #[error("changelog writer stopped")]
    WriterStopped,
}

/// One segment of the mutation log.
#[async_trait(?Send)]
pub trait Changelog {
    /// Segment id.
    fn id(&self) -> u32;

    /// Number of records in the segment, including unflushed ones.
    fn record_count(&self) -> u32;

    /// Total size of the records in bytes.
    fn data_size(&self) -> u64;

    /// Append records at the end of the segment.
    async fn append(&self, records: &[Vec<u8>]) -> Result<(), ChangelogError>;

    /// Make every appended record durable.
    async fn flush(&self) -> Result<(), ChangelogError>;

    /// Read up to `max_records` records starting at `first_record_id`.
    async fn read(
        &self,
        first_record_id: u32,
        max_records: u32,
    ) -> Result<Vec<Vec<u8>>, ChangelogError>;

    /// Drop every record at or after `record_count`.
    async fn truncate(&self, record_count: u32) -> Result<(), ChangelogError>;

    /// Close the segment; later appends fail.
    async fn close(&self) -> Result<(), ChangelogError>;
}

/// Where changelog segments live.
#[async_trait(?Send)]
pub trait ChangelogStore {
    /// Create a new, empty segment.
    async fn create_changelog(&self, changelog_id: u32)
        -> Result<Rc<dyn Changelog>, ChangelogError>;

    /// Open an existing segment.
    ///
    /// Fails with [`ChangelogError::NotFound`] if it does not exist.
    async fn open_changelog(&self, changelog_id: u32) -> Result<Rc<dyn Changelog>, ChangelogError>;

    /// Id of the newest segment, if any.
    async fn latest_changelog_id(&self) -> Result<Option<u32>, ChangelogError>;
}

/// Open a segment, creating it when missing.
pub async fn open_or_create_changelog(
    store: &dyn ChangelogStore,
    changelog_id: u32,
) -> Result<Rc<dyn Changelog>, ChangelogError> {
    match store.open_changelog(changelog_id).await {
        Err(ChangelogError::NotFound { .. }) => store.create_changelog(changelog_id).await,
        other => other,
    }
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Debug, Default)]
struct SegmentData {
    records: Vec<Vec<u8>>,
    data_size: u64,
}

#[derive(Debug, Default)]
struct StoreState {
    segments: BTreeMap<u32, Rc<RefCell<SegmentData>>>,
    failing: bool,
}

/// In-memory [`ChangelogStore`].
///
/// Clones share the same segments. Appends are durable as soon as they
/// return, so flush only reports injected faults.
#[derive(Debug, Clone, Default)]
pub struct InMemoryChangelogStore {
    state: Rc<RefCell<StoreState>>,
}

impl InMemoryChangelogStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every append and flush fail until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.state.borrow_mut().failing = failing;
    }

    /// Record counts of all segments, in id order.
    pub fn segment_sizes(&self) -> Vec<(u32, u32)> {
        self.state
            .borrow()
            .segments
            .iter()
            .map(|(id, data)| (*id, data.borrow().records.len() as u32))
            .collect()
    }

    fn handle(&self, changelog_id: u32, data: Rc<RefCell<SegmentData>>) -> Rc<dyn Changelog> {
        Rc::new(InMemoryChangelog {
            id: changelog_id,
            data,
            store: self.state.clone(),
            closed: Cell::new(false),
        })
    }
}

#[async_trait(?Send)]
impl ChangelogStore for InMemoryChangelogStore {
    async fn create_changelog(
        &self,
        changelog_id: u32,
    ) -> Result<Rc<dyn Changelog>, ChangelogError> {
        let data = {
            let mut state = self.state.borrow_mut();
            if state.segments.contains_key(&changelog_id) {
                return Err(ChangelogError::AlreadyExists { changelog_id });
            }
            let data = Rc::new(RefCell::new(SegmentData::default()));
            state.segments.insert(changelog_id, data.clone());
            data
        };
        debug!(changelog_id, "changelog created");
        Ok(self.handle(changelog_id, data))
    }

    async fn open_changelog(&self, changelog_id: u32) -> Result<Rc<dyn Changelog>, ChangelogError> {
        let data = self
            .state
            .borrow()
            .segments
            .get(&changelog_id)
            .cloned()
            .ok_or(ChangelogError::NotFound { changelog_id })?;
        Ok(self.handle(changelog_id, data))
    }

    async fn latest_changelog_id(&self) -> Result<Option<u32>, ChangelogError> {
        Ok(self.state.borrow().segments.keys().next_back().copied())
    }
}

struct InMemoryChangelog {
    id: u32,
    data: Rc<RefCell<SegmentData>>,
    store: Rc<RefCell<StoreState>>,
    closed: Cell<bool>,
}

impl InMemoryChangelog {
    fn check_writable(&self) -> Result<(), ChangelogError> {
        if self.closed.get() {
            return Err(ChangelogError::Closed {
                changelog_id: self.id,
            });
        }
        if self.store.borrow().failing {
            return Err(ChangelogError::Io {
                changelog_id: self.id,
                reason: "injected fault".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait(?Send)]
impl Changelog for InMemoryChangelog {
    fn id(&self) -> u32 {
        self.id
    }

    fn record_count(&self) -> u32 {
        self.data.borrow().records.len() as u32
    }

    fn data_size(&self) -> u64 {
        self.data.borrow().data_size
    }

    async fn append(&self, records: &[Vec<u8>]) -> Result<(), ChangelogError> {
        self.check_writable()?;
        let mut data = self.data.borrow_mut();
        for record in records {
            data.data_size += record.len() as u64;
            data.records.push(record.clone());
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), ChangelogError> {
        self.check_writable()
    }

    async fn read(
        &self,
        first_record_id: u32,
        max_records: u32,
    ) -> Result<Vec<Vec<u8>>, ChangelogError> {
        let data = self.data.borrow();
        Ok(data
            .records
            .iter()
            .skip(first_record_id as usize)
            .take(max_records as usize)
            .cloned()
            .collect())
    }

    async fn truncate(&self, record_count: u32) -> Result<(), ChangelogError> {
        let mut data = self.data.borrow_mut();
        if (record_count as usize) < data.records.len() {
            data.records.truncate(record_count as usize);
            data.data_size = data.records.iter().map(|r| r.len() as u64).sum();
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), ChangelogError> {
        self.closed.set(true);
        Ok(())
    }
}

// ============================================================================
// Writer
// ============================================================================

enum WriterCommand {
    Append {
        version: Version,
        record: Vec<u8>,
        done: Promise<()>,
    },
    Rotate {
        changelog_id: u32,
        done: Promise<()>,
    },
    Barrier {
        done: Promise<()>,
    },
}

/// Handle to the per-epoch changelog writer task.
///
/// Dropping every handle, or cancelling the token the writer was spawned
/// with, stops the task; commands still queued resolve with an abandoned
/// promise.
#[derive(Clone)]
pub struct ChangelogWriter {
    sender: mpsc::UnboundedSender<WriterCommand>,
    error: Rc<RefCell<Option<ChangelogError>>>,
}

impl ChangelogWriter {
    /// Spawn the writer on the current `LocalSet`.
    pub fn spawn(store: Rc<dyn ChangelogStore>, token: CancellationToken) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let error = Rc::new(RefCell::new(None));
        let task = WriterTask {
            store,
            current: None,
            error: error.clone(),
        };
        tokio::task::spawn_local(async move {
            tokio::select! {
                _ = token.cancelled() => trace!("changelog writer canceled"),
                _ = task.run(receiver) => trace!("changelog writer drained"),
            }
        });
        Self { sender, error }
    }

    /// The error that poisoned the writer, if any.
    pub fn error(&self) -> Option<ChangelogError> {
        self.error.borrow().clone()
    }

    /// Queue a record logged at `version`. Resolves once it is durable.
    pub fn append(&self, version: Version, record: Vec<u8>) -> PromiseFuture<()> {
        let (done, future) = promise();
        self.send(WriterCommand::Append {
            version,
            record,
            done,
        });
        future
    }

    /// Close the current segment and open the empty segment `changelog_id`.
    pub fn rotate(&self, changelog_id: u32) -> PromiseFuture<()> {
        let (done, future) = promise();
        self.send(WriterCommand::Rotate { changelog_id, done });
        future
    }

    /// Resolves once everything queued before it is durable.
    pub fn barrier(&self) -> PromiseFuture<()> {
        let (done, future) = promise();
        self.send(WriterCommand::Barrier { done });
        future
    }

    fn send(&self, command: WriterCommand) {
        if let Some(error) = self.error() {
            command.fail(error);
            return;
        }
        if let Err(mpsc::error::SendError(command)) = self.sender.send(command) {
            command.fail(ChangelogError::WriterStopped);
        }
    }
}

impl WriterCommand {
    fn fail(self, error: ChangelogError) {
        let done = match self {
            Self::Append { done, .. } | Self::Rotate { done, .. } | Self::Barrier { done } => done,
        };
        done.set_error(error.into());
    }
}

struct WriterTask {
    store: Rc<dyn ChangelogStore>,
    current: Option<Rc<dyn Changelog>>,
    error: Rc<RefCell<Option<ChangelogError>>>,
}

impl WriterTask {
    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<WriterCommand>) {
        let mut records = Vec::new();
        let mut waiters = Vec::new();
        while let Some(command) = receiver.recv().await {
            let mut batch = vec![command];
            while let Ok(command) = receiver.try_recv() {
                batch.push(command);
            }
            trace!(commands = batch.len(), "changelog writer batch");

            for command in batch {
                let poisoned = self.error.borrow().clone();
                if let Some(error) = poisoned {
                    command.fail(error);
                    continue;
                }
                let result = match command {
                    WriterCommand::Append {
                        version,
                        record,
                        done,
                    } => {
                        let placed = self.place(version, &mut records, &mut waiters).await;
                        match placed {
                            Ok(()) => {
                                records.push(record);
                                waiters.push(done);
                                Ok(())
                            }
                            Err(error) => {
                                done.set_error(error.clone().into());
                                Err(error)
                            }
                        }
                    }
                    WriterCommand::Rotate { changelog_id, done } => {
                        let result = match self.write(&mut records, &mut waiters).await {
                            Ok(()) => self.rotate(changelog_id).await,
                            Err(error) => Err(error),
                        };
                        done.set(result.clone().map_err(Into::into));
                        result
                    }
                    WriterCommand::Barrier { done } => {
                        let result = self.write(&mut records, &mut waiters).await;
                        done.set(result.clone().map_err(Into::into));
                        result
                    }
                };
                if let Err(error) = result {
                    self.poison(error, &mut records, &mut waiters);
                }
            }
            if let Err(error) = self.write(&mut records, &mut waiters).await {
                self.poison(error, &mut records, &mut waiters);
            }
        }
    }

    /// Make sure `version` is the next free slot, switching segments if needed.
    ///
    /// Records buffered for the current segment are written out before a
    /// switch; the new segment must then start at record 0.
    async fn place(
        &mut self,
        version: Version,
        records: &mut Vec<Vec<u8>>,
        waiters: &mut Vec<Promise<()>>,
    ) -> Result<(), ChangelogError> {
        let switch = self
            .current
            .as_ref()
            .map_or(true, |changelog| changelog.id() != version.segment_id);
        if switch {
            self.write(records, waiters).await?;
            if let Some(changelog) = self.current.take() {
                changelog.close().await?;
            }
            let changelog =
                open_or_create_changelog(self.store.as_ref(), version.segment_id).await?;
            self.current = Some(changelog);
        }
        let changelog = self.current.as_ref().ok_or(ChangelogError::WriterStopped)?;
        let expected = changelog.record_count() + records.len() as u32;
        if expected != version.record_id {
            return Err(ChangelogError::Gap {
                changelog_id: version.segment_id,
                expected,
                received: version.record_id,
            });
        }
        Ok(())
    }

    async fn rotate(&mut self, changelog_id: u32) -> Result<(), ChangelogError> {
        if let Some(changelog) = self.current.take() {
            changelog.close().await?;
        }
        let changelog = open_or_create_changelog(self.store.as_ref(), changelog_id).await?;
        if changelog.record_count() != 0 {
            return Err(ChangelogError::Gap {
                changelog_id,
                expected: 0,
                received: changelog.record_count(),
            });
        }
        debug!(changelog_id, "changelog rotated");
        self.current = Some(changelog);
        Ok(())
    }

    async fn write(
        &mut self,
        records: &mut Vec<Vec<u8>>,
        waiters: &mut Vec<Promise<()>>,
    ) -> Result<(), ChangelogError> {
        if records.is_empty() {
            return Ok(());
        }
        let changelog = self.current.clone().ok_or(ChangelogError::WriterStopped)?;
        changelog.append(records).await?;
        changelog.flush().await?;
        trace!(
            changelog_id = changelog.id(),
            records = records.len(),
            "changelog records flushed"
        );
        records.clear();
        for done in waiters.drain(..) {
            done.set_value(());
        }
        Ok(())
    }

    fn poison(
        &self,
        error: ChangelogError,
        records: &mut Vec<Vec<u8>>,
        waiters: &mut Vec<Promise<()>>,
    ) {
        warn!(%error, "changelog writer failed");
        records.clear();
        for done in waiters.drain(..) {
            done.set_error(error.clone().into());
        }
        *self.error.borrow_mut() = Some(error);
    }
}
