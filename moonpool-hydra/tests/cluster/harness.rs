//! Test cell builder and a key-value automaton.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::future::Future;
use std::io::{Read, Write};
use std::rc::Rc;
use std::time::Duration;

use moonpool_hydra::{
    Automaton, AutomatonError, CellConfig, HydraConfig, HydraDependencies, HydraError,
    HydraManager, HydraService, InMemoryChangelogStore, InMemorySnapshotStore, LocalChannels,
    LocalElection, MutationContext, MutationId, MutationRequest, MutationResponse, PeerId,
    SeededProviders, TokioTimeProvider, Version,
};

/// Sets a key: payload `key=value`, responds with the previous value.
pub const SET: &str = "kv.set";

/// Always fails in the handler.
pub const FAIL: &str = "kv.fail";

/// Install a test subscriber once; `RUST_LOG` selects the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Key-value automaton
// ============================================================================

/// One business application observed by a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    /// Position of the record.
    pub version: Version,
    /// Global record index.
    pub sequence_number: u64,
    /// Client id of the mutation.
    pub mutation_id: Option<MutationId>,
    /// Key that was set.
    pub key: String,
}

/// What a peer's automaton applied since it was last cleared.
#[derive(Debug, Default)]
pub struct Journal {
    /// Applications in order.
    pub applied: Vec<Applied>,
}

/// Shared view of one peer's key-value state.
pub type Entries = Rc<RefCell<BTreeMap<String, String>>>;

/// Deterministic key-value state machine.
pub struct KvAutomaton {
    entries: Entries,
    journal: Rc<RefCell<Journal>>,
}

impl KvAutomaton {
    /// Automaton writing into shared `entries` and `journal`.
    pub fn new(entries: Entries, journal: Rc<RefCell<Journal>>) -> Self {
        Self { entries, journal }
    }

    /// Standalone automaton, for replaying logs by hand.
    pub fn detached() -> Self {
        Self::new(Rc::default(), Rc::default())
    }

    /// Current entries.
    pub fn entries(&self) -> BTreeMap<String, String> {
        self.entries.borrow().clone()
    }
}

impl Automaton for KvAutomaton {
    fn apply_mutation(
        &mut self,
        context: &mut MutationContext<'_>,
    ) -> Result<Vec<u8>, AutomatonError> {
        match context.mutation_type {
            SET => {
                let payload = String::from_utf8_lossy(context.payload).to_string();
                let (key, value) = payload
                    .split_once('=')
                    .ok_or_else(|| AutomatonError::new(format!("malformed payload {payload}")))?;
                let previous = self
                    .entries
                    .borrow_mut()
                    .insert(key.to_string(), value.to_string());
                self.journal.borrow_mut().applied.push(Applied {
                    version: context.version,
                    sequence_number: context.sequence_number,
                    mutation_id: context.mutation_id,
                    key: key.to_string(),
                });
                Ok(previous.unwrap_or_default().into_bytes())
            }
            FAIL => Err(AutomatonError::new("refused by handler")),
            other => Err(AutomatonError::new(format!("unknown mutation {other}"))),
        }
    }

    fn save_snapshot(&self, writer: &mut dyn Write) -> Result<(), AutomatonError> {
        let bytes = serde_json::to_vec(&*self.entries.borrow())?;
        writer
            .write_all(&bytes)
            .map_err(|e| AutomatonError::new(e.to_string()))
    }

    fn load_snapshot(&mut self, reader: &mut dyn Read) -> Result<(), AutomatonError> {
        let mut bytes = Vec::new();
        reader
            .read_to_end(&mut bytes)
            .map_err(|e| AutomatonError::new(e.to_string()))?;
        *self.entries.borrow_mut() = serde_json::from_slice(&bytes)?;
        Ok(())
    }

    fn clear(&mut self) {
        self.entries.borrow_mut().clear();
        self.journal.borrow_mut().applied.clear();
    }
}

/// A `kv.set` request.
pub fn set(key: &str, value: &str) -> MutationRequest {
    MutationRequest::new(SET, format!("{key}={value}"))
}

// ============================================================================
// Cell
// ============================================================================

/// Durable state of one peer, reusable across restarts.
#[derive(Clone, Default)]
pub struct PeerStores {
    /// Changelog segments.
    pub changelogs: InMemoryChangelogStore,
    /// Snapshots.
    pub snapshots: InMemorySnapshotStore,
}

/// One peer of a test cell.
pub struct TestPeer {
    /// Peer id.
    pub id: PeerId,
    /// The manager under test.
    pub manager: Rc<HydraManager<SeededProviders>>,
    /// Durable stores.
    pub stores: PeerStores,
    /// Automaton state.
    pub entries: Entries,
    /// Automaton applications.
    pub journal: Rc<RefCell<Journal>>,
}

impl TestPeer {
    /// Value of `key` on this peer.
    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.borrow().get(key).cloned()
    }

    /// Every entry on this peer.
    pub fn entries(&self) -> BTreeMap<String, String> {
        self.entries.borrow().clone()
    }
}

/// A cell of peers on one in-process network.
pub struct TestCell {
    /// Configuration shared by every peer.
    pub config: HydraConfig,
    /// The network.
    pub channels: LocalChannels,
    /// The election layer.
    pub election: LocalElection<TokioTimeProvider>,
    /// The peers, indexed by id.
    pub peers: Vec<TestPeer>,
}

impl TestCell {
    /// Start `count` peers with simulation timings.
    pub async fn start(count: u32) -> Self {
        Self::start_with(HydraConfig::for_simulation(), count).await
    }

    /// Start `count` fresh peers with `config`.
    pub async fn start_with(config: HydraConfig, count: u32) -> Self {
        let stores = (0..count).map(|_| PeerStores::default()).collect();
        Self::start_on(config, stores).await
    }

    /// Start one peer per entry of `stores`, on top of their content.
    pub async fn start_on(config: HydraConfig, stores: Vec<PeerStores>) -> Self {
        init_tracing();
        let cell = CellConfig::with_peer_count(stores.len() as u32);
        let channels = LocalChannels::new();
        let election = LocalElection::new(
            cell.clone(),
            TokioTimeProvider::new(),
            config.restart_backoff_time,
        );

        let mut peers = Vec::new();
        for (index, stores) in stores.into_iter().enumerate() {
            let id = PeerId(index as u32);
            let entries = Entries::default();
            let journal = Rc::new(RefCell::new(Journal::default()));
            let manager = HydraManager::new(HydraDependencies {
                self_id: id,
                cell: cell.clone(),
                config: config.clone(),
                providers: SeededProviders::new(0x5eed + index as u64),
                automaton: Box::new(KvAutomaton::new(entries.clone(), journal.clone())),
                changelog_store: Rc::new(stores.changelogs.clone()),
                snapshot_store: Rc::new(stores.snapshots.clone()),
                channels: channels.for_peer(id),
                election: Rc::new(election.clone()),
            });
            let as_service: Rc<dyn HydraService> = manager.clone();
            channels.register(id, Rc::downgrade(&as_service));
            peers.push(TestPeer {
                id,
                manager,
                stores,
                entries,
                journal,
            });
        }
        for peer in &peers {
            peer.manager.initialize().await.expect("initialize peer");
        }
        Self {
            config,
            channels,
            election,
            peers,
        }
    }

    /// Index of the active leader, once there is one and `followers`
    /// followers have recovered.
    pub async fn wait_for_cell(&self, followers: usize) -> usize {
        wait_until("active leader and followers", || {
            self.leader().is_some() && self.active_followers() >= followers
        })
        .await;
        self.leader().expect("leader")
    }

    /// Index of the active leader.
    pub fn leader(&self) -> Option<usize> {
        self.peers
            .iter()
            .position(|peer| peer.manager.is_active_leader())
    }

    /// Number of recovered followers.
    pub fn active_followers(&self) -> usize {
        self.peers
            .iter()
            .filter(|peer| peer.manager.is_active_follower())
            .count()
    }

    /// Indices of every peer but `leader`.
    pub fn followers_of(&self, leader: usize) -> Vec<usize> {
        (0..self.peers.len()).filter(|index| *index != leader).collect()
    }

    /// Commit `key=value` through peer `index`.
    pub async fn set(
        &self,
        index: usize,
        key: &str,
        value: &str,
    ) -> Result<MutationResponse, HydraError> {
        self.peers[index].manager.commit_mutation(set(key, value)).await
    }

    /// Wait until every live peer holds the leader's entries.
    pub async fn wait_converged(&self, live: &[usize]) {
        wait_until("entries converged", || {
            let Some(leader) = self.leader() else {
                return false;
            };
            let expected = self.peers[leader].entries();
            live.iter()
                .all(|index| self.peers[*index].entries() == expected)
        })
        .await;
    }

    /// Crash peer `index`: unreachable and out of elections.
    pub fn kill(&self, index: usize) {
        let id = self.peers[index].id;
        self.channels.kill(id);
        self.election.kill(id);
    }

    /// Bring peer `index` back.
    pub fn revive(&self, index: usize) {
        let id = self.peers[index].id;
        self.channels.revive(id);
        self.election.revive(id);
    }

    /// Stop every peer and return their stores.
    pub fn shutdown(self) -> Vec<PeerStores> {
        for peer in &self.peers {
            peer.manager.finalize();
        }
        self.peers.into_iter().map(|peer| peer.stores).collect()
    }
}

/// Poll `condition` in virtual time until it holds.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Duration::from_secs(30);
    let polled = tokio::time::timeout(deadline, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}

/// Run `test` on a fresh `LocalSet`.
pub async fn local<F: Future<Output = ()>>(test: F) {
    tokio::task::LocalSet::new().run_until(test).await;
}
