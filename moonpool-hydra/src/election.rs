//! Election interface and an in-process election layer.
//!
//! The engine never decides who leads. An [`ElectionManager`] does, and
//! drives each peer through its [`ElectionCallbacks`]:
//!
//! ```text
//! ElectionManager                          HydraManager
//!   │── on_start_leading(epoch) ─────────────>│  leader recovery, then Leading
//!   │── on_start_following(epoch) ───────────>│  follower recovery, then Following
//!   │<── abandon(peer, epoch, error) ──────────│  lease lost, flush failed, out of sync
//!   │── on_stop_leading / on_stop_following ─>│  epoch torn down
//! ```
//!
//! [`LocalElection`] is the election layer used when all peers live in one
//! process. It picks the live participant with the highest
//! [`ElectionPriority`] as leader, provided a quorum of participants is
//! alive, and assigns monotonically increasing epoch ids. Callbacks are
//! always invoked from a freshly spawned task so a peer can call back into
//! the election from inside a callback.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::HydraError;
use crate::providers::TimeProvider;
use crate::types::{CellConfig, EpochId, PeerId, Version};

/// An epoch as assigned by the election layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionEpoch {
    /// Epoch id, increasing across elections.
    pub epoch_id: EpochId,
    /// Leader of the epoch.
    pub leader_id: PeerId,
}

/// How strongly a peer qualifies as leader. Compared lexicographically.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ElectionPriority {
    /// Epoch that logged the last record this peer holds.
    pub epoch: EpochId,
    /// Reachable version of this peer.
    pub version: Version,
}

impl fmt::Display for ElectionPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.version, self.epoch)
    }
}

/// Role changes delivered to one peer.
pub trait ElectionCallbacks {
    /// This peer leads `epoch`.
    fn on_start_leading(&self, epoch: ElectionEpoch);

    /// This peer stopped leading.
    fn on_stop_leading(&self, error: HydraError);

    /// This peer follows `epoch.leader_id` in `epoch`.
    fn on_start_following(&self, epoch: ElectionEpoch);

    /// This peer stopped following.
    fn on_stop_following(&self, error: HydraError);

    /// Current election priority.
    fn priority(&self) -> ElectionPriority;
}

/// The election layer as seen by a peer.
pub trait ElectionManager {
    /// Join elections.
    fn participate(&self, peer: PeerId, callbacks: Weak<dyn ElectionCallbacks>);

    /// Give up the current role in `epoch_id` because of `error`.
    fn abandon(&self, peer: PeerId, epoch_id: EpochId, error: HydraError);

    /// Leave elections.
    fn leave(&self, peer: PeerId);
}

// ============================================================================
// In-process election
// ============================================================================

struct Participant {
    callbacks: Weak<dyn ElectionCallbacks>,
    alive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Leading,
    Following,
}

struct ElectionState {
    cell: CellConfig,
    participants: BTreeMap<PeerId, Participant>,
    current: Option<ElectionEpoch>,
    roles: BTreeMap<PeerId, Role>,
    last_epoch: EpochId,
    forced_leader: Option<PeerId>,
    generation: u64,
}

enum Call {
    StartLeading(ElectionEpoch),
    StartFollowing(ElectionEpoch),
    StopLeading(HydraError),
    StopFollowing(HydraError),
}

/// In-process election layer for one cell.
pub struct LocalElection<T: TimeProvider> {
    state: Rc<RefCell<ElectionState>>,
    time: T,
    restart_delay: Duration,
}

impl<T: TimeProvider> Clone for LocalElection<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            time: self.time.clone(),
            restart_delay: self.restart_delay,
        }
    }
}

impl<T: TimeProvider + 'static> LocalElection<T> {
    /// Create the election layer of `cell`. Roles are restarted
    /// `restart_delay` after being abandoned.
    pub fn new(cell: CellConfig, time: T, restart_delay: Duration) -> Self {
        Self {
            state: Rc::new(RefCell::new(ElectionState {
                cell,
                participants: BTreeMap::new(),
                current: None,
                roles: BTreeMap::new(),
                last_epoch: EpochId::NONE,
                forced_leader: None,
                generation: 0,
            })),
            time,
            restart_delay,
        }
    }

    /// The current epoch, if any.
    pub fn current_epoch(&self) -> Option<ElectionEpoch> {
        self.state.borrow().current
    }

    /// Tear down the current epoch and elect again at once.
    pub fn elect(&self) {
        let calls = self.reelect(HydraError::invalid_state("new election"));
        dispatch(calls);
    }

    /// Tear down the current epoch and make `peer` the leader of the next
    /// one, provided it is alive and a quorum is available.
    pub fn elect_leader(&self, peer: PeerId) {
        self.state.borrow_mut().forced_leader = Some(peer);
        self.elect();
    }

    /// Crash `peer`: it loses its role and is not elected until revived.
    pub fn kill(&self, peer: PeerId) {
        let calls = {
            let mut state = self.state.borrow_mut();
            let Some(participant) = state.participants.get_mut(&peer) else {
                return;
            };
            participant.alive = false;
            info!(%peer, "election participant down");
            let is_leader = state.current.map(|epoch| epoch.leader_id) == Some(peer);
            drop(state);
            if is_leader {
                self.reelect(HydraError::Unavailable { peer })
            } else {
                let mut state = self.state.borrow_mut();
                stop_role(&mut state, peer, HydraError::Unavailable { peer })
                    .into_iter()
                    .collect()
            }
        };
        dispatch(calls);
        self.maybe_elect();
    }

    /// Bring `peer` back: it joins the current epoch as a follower.
    pub fn revive(&self, peer: PeerId) {
        {
            let mut state = self.state.borrow_mut();
            let Some(participant) = state.participants.get_mut(&peer) else {
                return;
            };
            participant.alive = true;
        }
        info!(%peer, "election participant up");
        self.join_current(peer);
        self.maybe_elect();
    }

    fn join_current(&self, peer: PeerId) {
        let call = {
            let mut state = self.state.borrow_mut();
            let Some(epoch) = state.current else {
                return;
            };
            if state.roles.contains_key(&peer) || epoch.leader_id == peer {
                return;
            }
            match state.participants.get(&peer) {
                Some(participant) if participant.alive => {}
                _ => return,
            }
            state.roles.insert(peer, Role::Following);
            participant_call(&state, peer, Call::StartFollowing(epoch))
        };
        dispatch(call.into_iter().collect());
    }

    /// Elect if there is no epoch and a quorum is alive.
    fn maybe_elect(&self) {
        let idle = self.state.borrow().current.is_none();
        if idle {
            let calls = self.reelect(HydraError::invalid_state("new election"));
            dispatch(calls);
        }
    }

    /// Stop every role, then start a new epoch if possible.
    fn reelect(&self, error: HydraError) -> Vec<(Weak<dyn ElectionCallbacks>, Call)> {
        let mut state = self.state.borrow_mut();
        state.generation += 1;
        let mut calls = Vec::new();
        let members: Vec<PeerId> = state.roles.keys().copied().collect();
        for peer in members {
            calls.extend(stop_role(&mut state, peer, error.clone()));
        }
        state.current = None;

        let alive: Vec<(PeerId, Weak<dyn ElectionCallbacks>)> = state
            .participants
            .iter()
            .filter(|(_, participant)| participant.alive)
            .map(|(peer, participant)| (*peer, participant.callbacks.clone()))
            .collect();
        if alive.len() < state.cell.quorum_count() {
            debug!(alive = alive.len(), "no quorum, election postponed");
            return calls;
        }

        let forced = state
            .forced_leader
            .take()
            .filter(|peer| alive.iter().any(|(candidate, _)| candidate == peer));
        let leader = match forced {
            Some(peer) => peer,
            None => {
                let mut best: Option<(ElectionPriority, PeerId)> = None;
                for (peer, callbacks) in &alive {
                    let Some(callbacks) = callbacks.upgrade() else {
                        continue;
                    };
                    let priority = callbacks.priority();
                    // Ties go to the lowest peer id.
                    if best.map_or(true, |(top, _)| priority > top) {
                        best = Some((priority, *peer));
                    }
                }
                match best {
                    Some((_, peer)) => peer,
                    None => return calls,
                }
            }
        };

        let epoch = ElectionEpoch {
            epoch_id: state.last_epoch.next(),
            leader_id: leader,
        };
        state.last_epoch = epoch.epoch_id;
        state.current = Some(epoch);
        info!(epoch = %epoch.epoch_id, leader = %leader, "leader elected");

        for (peer, callbacks) in alive {
            if peer == leader {
                state.roles.insert(peer, Role::Leading);
                calls.push((callbacks, Call::StartLeading(epoch)));
            } else {
                state.roles.insert(peer, Role::Following);
                calls.push((callbacks, Call::StartFollowing(epoch)));
            }
        }
        calls
    }

    /// Re-elect after the restart delay, unless something else happened in
    /// between.
    fn schedule_reelection(&self, error: HydraError) {
        let generation = self.state.borrow().generation;
        let this = self.clone();
        let stops = {
            let mut state = self.state.borrow_mut();
            let members: Vec<PeerId> = state.roles.keys().copied().collect();
            let mut calls = Vec::new();
            for peer in members {
                calls.extend(stop_role(&mut state, peer, error.clone()));
            }
            calls
        };
        dispatch(stops);
        tokio::task::spawn_local(async move {
            this.time.sleep(this.restart_delay).await;
            if this.state.borrow().generation == generation {
                let calls = this.reelect(error);
                dispatch(calls);
            }
        });
    }

    fn schedule_rejoin(&self, peer: PeerId, epoch_id: EpochId) {
        let this = self.clone();
        tokio::task::spawn_local(async move {
            this.time.sleep(this.restart_delay).await;
            let same_epoch = this.state.borrow().current.map(|epoch| epoch.epoch_id) == Some(epoch_id);
            if same_epoch {
                this.join_current(peer);
            }
        });
    }
}

impl<T: TimeProvider + 'static> ElectionManager for LocalElection<T> {
    fn participate(&self, peer: PeerId, callbacks: Weak<dyn ElectionCallbacks>) {
        self.state.borrow_mut().participants.insert(
            peer,
            Participant {
                callbacks,
                alive: true,
            },
        );
        debug!(%peer, "joined elections");
        self.join_current(peer);
        self.maybe_elect();
    }

    fn abandon(&self, peer: PeerId, epoch_id: EpochId, error: HydraError) {
        let (current, role) = {
            let state = self.state.borrow();
            (state.current, state.roles.get(&peer).copied())
        };
        if current.map(|epoch| epoch.epoch_id) != Some(epoch_id) {
            debug!(%peer, epoch = %epoch_id, "abandoning a stale epoch, ignored");
            return;
        }
        match role {
            Some(Role::Leading) => {
                warn!(%peer, epoch = %epoch_id, %error, "leader abandoned epoch");
                self.schedule_reelection(error);
            }
            Some(Role::Following) => {
                debug!(%peer, epoch = %epoch_id, %error, "follower abandoned epoch");
                let call = {
                    let mut state = self.state.borrow_mut();
                    stop_role(&mut state, peer, error)
                };
                dispatch(call.into_iter().collect());
                self.schedule_rejoin(peer, epoch_id);
            }
            None => {}
        }
    }

    fn leave(&self, peer: PeerId) {
        let is_leader = {
            let mut state = self.state.borrow_mut();
            state.participants.remove(&peer);
            state.roles.remove(&peer);
            state.current.map(|epoch| epoch.leader_id) == Some(peer)
        };
        debug!(%peer, "left elections");
        if is_leader {
            self.schedule_reelection(HydraError::invalid_state("leader left elections"));
        }
    }
}

/// Drop `peer`'s role and return the matching stop call.
fn stop_role(
    state: &mut ElectionState,
    peer: PeerId,
    error: HydraError,
) -> Option<(Weak<dyn ElectionCallbacks>, Call)> {
    let role = state.roles.remove(&peer)?;
    let call = match role {
        Role::Leading => Call::StopLeading(error),
        Role::Following => Call::StopFollowing(error),
    };
    participant_call(state, peer, call)
}

fn participant_call(
    state: &ElectionState,
    peer: PeerId,
    call: Call,
) -> Option<(Weak<dyn ElectionCallbacks>, Call)> {
    state
        .participants
        .get(&peer)
        .map(|participant| (participant.callbacks.clone(), call))
}

/// Deliver calls in order from a fresh task.
fn dispatch(calls: Vec<(Weak<dyn ElectionCallbacks>, Call)>) {
    if calls.is_empty() {
        return;
    }
    tokio::task::spawn_local(async move {
        for (callbacks, call) in calls {
            let Some(callbacks) = callbacks.upgrade() else {
                continue;
            };
            match call {
                Call::StartLeading(epoch) => callbacks.on_start_leading(epoch),
                Call::StartFollowing(epoch) => callbacks.on_start_following(epoch),
                Call::StopLeading(error) => callbacks.on_stop_leading(error),
                Call::StopFollowing(error) => callbacks.on_stop_following(error),
            }
        }
    });
}

impl<T: TimeProvider> fmt::Debug for LocalElection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        let alive: BTreeSet<PeerId> = state
            .participants
            .iter()
            .filter(|(_, participant)| participant.alive)
            .map(|(peer, _)| *peer)
            .collect();
        f.debug_struct("LocalElection")
            .field("current", &state.current)
            .field("alive", &alive)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use tokio::task::LocalSet;

    use super::*;
    use crate::providers::TokioTimeProvider;

    #[derive(Default)]
    struct Recorder {
        priority: Cell<ElectionPriority>,
        events: RefCell<Vec<String>>,
    }

    impl ElectionCallbacks for Recorder {
        fn on_start_leading(&self, epoch: ElectionEpoch) {
            self.events
                .borrow_mut()
                .push(format!("lead {}", epoch.epoch_id.0));
        }

        fn on_stop_leading(&self, _error: HydraError) {
            self.events.borrow_mut().push("stop lead".to_string());
        }

        fn on_start_following(&self, epoch: ElectionEpoch) {
            self.events
                .borrow_mut()
                .push(format!("follow {} {}", epoch.epoch_id.0, epoch.leader_id.0));
        }

        fn on_stop_following(&self, _error: HydraError) {
            self.events.borrow_mut().push("stop follow".to_string());
        }

        fn priority(&self) -> ElectionPriority {
            self.priority.get()
        }
    }

    fn cell(count: u32) -> (LocalElection<TokioTimeProvider>, Vec<Rc<Recorder>>) {
        let election = LocalElection::new(
            CellConfig::with_peer_count(count),
            TokioTimeProvider::new(),
            Duration::from_millis(10),
        );
        let peers: Vec<Rc<Recorder>> = (0..count).map(|_| Rc::new(Recorder::default())).collect();
        (election, peers)
    }

    fn join_peer(election: &LocalElection<TokioTimeProvider>, peers: &[Rc<Recorder>], index: usize) {
        let callbacks: Rc<dyn ElectionCallbacks> = peers[index].clone();
        election.participate(PeerId(index as u32), Rc::downgrade(&callbacks));
    }

    fn join(election: &LocalElection<TokioTimeProvider>, peers: &[Rc<Recorder>]) {
        for index in 0..peers.len() {
            join_peer(election, peers, index);
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_highest_priority_leads_once_quorum_joins() {
        LocalSet::new()
            .run_until(async {
                let (election, peers) = cell(3);
                peers[2].priority.set(ElectionPriority {
                    epoch: EpochId(1),
                    version: Version::new(1, 4),
                });
                join_peer(&election, &peers, 0);
                settle().await;
                assert!(election.current_epoch().is_none());

                join_peer(&election, &peers, 2);
                join_peer(&election, &peers, 1);
                settle().await;
                let epoch = election.current_epoch().expect("elected");
                assert_eq!(epoch.leader_id, PeerId(2));
                assert_eq!(*peers[2].events.borrow(), vec!["lead 1"]);
                assert_eq!(*peers[0].events.borrow(), vec!["follow 1 2"]);
                assert_eq!(*peers[1].events.borrow(), vec!["follow 1 2"]);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_epoch_beats_longer_log() {
        LocalSet::new()
            .run_until(async {
                let (election, peers) = cell(3);
                peers[0].priority.set(ElectionPriority {
                    epoch: EpochId(1),
                    version: Version::new(2, 9),
                });
                peers[1].priority.set(ElectionPriority {
                    epoch: EpochId(2),
                    version: Version::new(2, 1),
                });
                join(&election, &peers);
                settle().await;
                assert_eq!(election.current_epoch().map(|e| e.leader_id), Some(PeerId(1)));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_leader_abandon_reelects() {
        LocalSet::new()
            .run_until(async {
                let (election, peers) = cell(3);
                join(&election, &peers);
                settle().await;
                let first = election.current_epoch().expect("elected");
                assert_eq!(first.leader_id, PeerId(0));

                election.abandon(PeerId(0), first.epoch_id, HydraError::LeaseExpired);
                settle().await;
                let second = election.current_epoch().expect("reelected");
                assert_eq!(second.epoch_id, first.epoch_id.next());
                assert_eq!(
                    *peers[1].events.borrow(),
                    vec!["follow 1 0", "stop follow", "follow 2 0"]
                );
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_follower_abandon_rejoins_same_epoch() {
        LocalSet::new()
            .run_until(async {
                let (election, peers) = cell(3);
                join(&election, &peers);
                settle().await;
                let epoch = election.current_epoch().expect("elected");

                election.abandon(PeerId(2), epoch.epoch_id, HydraError::LeaseExpired);
                // A stale abandon is ignored.
                election.abandon(PeerId(1), EpochId(99), HydraError::LeaseExpired);
                settle().await;
                assert_eq!(election.current_epoch(), Some(epoch));
                assert_eq!(
                    *peers[2].events.borrow(),
                    vec!["follow 1 0", "stop follow", "follow 1 0"]
                );
                assert_eq!(*peers[1].events.borrow(), vec!["follow 1 0"]);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_kill_leader_and_lose_quorum() {
        LocalSet::new()
            .run_until(async {
                let (election, peers) = cell(3);
                join(&election, &peers);
                settle().await;

                election.kill(PeerId(0));
                settle().await;
                let epoch = election.current_epoch().expect("failover");
                assert_eq!(epoch.leader_id, PeerId(1));

                election.kill(PeerId(2));
                settle().await;
                assert_eq!(election.current_epoch(), Some(epoch));
                election.kill(PeerId(1));
                settle().await;
                assert!(election.current_epoch().is_none());

                election.revive(PeerId(0));
                election.revive(PeerId(2));
                settle().await;
                assert!(election.current_epoch().is_some());
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_leader() {
        LocalSet::new()
            .run_until(async {
                let (election, peers) = cell(3);
                join(&election, &peers);
                settle().await;
                election.elect_leader(PeerId(2));
                settle().await;
                let epoch = election.current_epoch().expect("elected");
                assert_eq!(epoch.leader_id, PeerId(2));
                assert_eq!(epoch.epoch_id, EpochId(2));
            })
            .await;
    }
}
