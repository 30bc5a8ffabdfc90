//! End-to-end scenarios on in-process cells.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use moonpool_hydra::automaton::Automaton;
use moonpool_hydra::providers::SeededRandomProvider;
use moonpool_hydra::snapshot::split_snapshot_envelope;
use moonpool_hydra::wire::deserialize_mutation_record;
use moonpool_hydra::{
    ChangelogError, ChangelogStore, HydraConfig, HydraError, MutationContext, MutationId,
    MutationRequest, SnapshotStore, Version,
};

use super::harness::{local, set, wait_until, KvAutomaton, PeerStores, TestCell, FAIL, SET};
use super::invariants::assert_invariants;

#[tokio::test(start_paused = true)]
async fn test_commit_replicates_to_every_peer() {
    local(async {
        let cell = TestCell::start(3).await;
        let leader = cell.wait_for_cell(2).await;

        for round in 0..5 {
            let response = cell
                .set(leader, &format!("key-{round}"), &format!("v{round}"))
                .await
                .expect("commit");
            assert!(response.data.is_empty());
        }
        let previous = cell.set(leader, "key-0", "w0").await.expect("overwrite");
        assert_eq!(previous.data, b"v0");

        // The leader rotates once recovered, so the first record opens
        // segment 1.
        let first = cell.peers[leader].journal.borrow().applied[0].clone();
        assert_eq!(first.version, Version::new(1, 0));
        assert_eq!(first.sequence_number, 1);

        cell.wait_converged(&[0, 1, 2]).await;
        for peer in &cell.peers {
            assert_eq!(peer.get("key-0").as_deref(), Some("w0"));
            assert_eq!(peer.entries().len(), 5);
        }
        assert_invariants(&cell);
        cell.shutdown();
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_sync_waits_for_held_follower() {
    local(async {
        let cell = TestCell::start(3).await;
        let leader = cell.wait_for_cell(2).await;
        let held = cell.followers_of(leader)[0];

        cell.channels.hold(cell.peers[held].id);
        cell.set(leader, "m1", "a").await.expect("quorum without the held follower");
        assert_eq!(cell.peers[held].get("m1"), None);

        let manager = cell.peers[held].manager.clone();
        let sync = tokio::task::spawn_local(async move { manager.sync_with_leader().await });
        // Shorter than the follower's leader watchdog.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!sync.is_finished(), "sync resolved before the record arrived");

        cell.channels.release(cell.peers[held].id);
        sync.await.expect("join").expect("sync with leader");
        assert_eq!(cell.peers[held].get("m1").as_deref(), Some("a"));
        assert_invariants(&cell);
        cell.shutdown();
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_sync_on_leader_resolves_at_once() {
    local(async {
        let cell = TestCell::start(3).await;
        let leader = cell.wait_for_cell(2).await;
        cell.peers[leader]
            .manager
            .sync_with_leader()
            .await
            .expect("leader is always in sync");
        cell.shutdown();
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_minority_failure_keeps_cell_available() {
    local(async {
        let cell = TestCell::start(5).await;
        let leader = cell.wait_for_cell(4).await;
        let followers = cell.followers_of(leader);
        let (down, up) = followers.split_at(2);

        for index in down {
            cell.kill(*index);
        }
        for round in 0..10 {
            cell.set(leader, &format!("k{round}"), "during-failure")
                .await
                .expect("commit with a bare quorum");
        }
        for index in down {
            assert_eq!(cell.peers[*index].get("k9"), None);
        }

        for index in down {
            cell.revive(*index);
        }
        cell.wait_for_cell(4).await;
        let mut everyone = vec![leader];
        everyone.extend_from_slice(down);
        everyone.extend_from_slice(up);
        cell.wait_converged(&everyone).await;
        for peer in &cell.peers {
            assert_eq!(peer.entries().len(), 10);
        }
        assert_invariants(&cell);
        cell.shutdown();
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_epoch_change_fails_pending_commit() {
    local(async {
        let cell = TestCell::start(3).await;
        let leader = cell.wait_for_cell(2).await;
        let followers = cell.followers_of(leader);
        let id = MutationId::random(&SeededRandomProvider::new(7));

        for index in &followers {
            cell.channels.hold(cell.peers[*index].id);
        }
        let manager = cell.peers[leader].manager.clone();
        let request = set("pending", "x").with_mutation_id(id);
        let pending = tokio::task::spawn_local(async move { manager.commit_mutation(request).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!pending.is_finished());

        cell.election.elect();
        let error = pending
            .await
            .expect("join")
            .expect_err("commit must fail when its epoch ends");
        assert!(error.is_invalid_state(), "unexpected error {error}");
        for index in &followers {
            cell.channels.release(cell.peers[*index].id);
        }

        // Retrying with the same id applies the mutation exactly once,
        // whether or not the new leader kept the record.
        let leader = cell.wait_for_cell(2).await;
        cell.peers[leader]
            .manager
            .commit_mutation(set("pending", "x").with_mutation_id(id))
            .await
            .expect("retry");
        cell.wait_converged(&[0, 1, 2]).await;
        let applications = cell.peers[leader]
            .journal
            .borrow()
            .applied
            .iter()
            .filter(|applied| applied.mutation_id == Some(id))
            .count();
        assert_eq!(applications, 1);
        assert_invariants(&cell);
        cell.shutdown();
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_mutation_id_returns_kept_response() {
    local(async {
        let cell = TestCell::start(3).await;
        let leader = cell.wait_for_cell(2).await;
        let id = MutationId::random(&SeededRandomProvider::new(11));

        cell.set(leader, "k", "a").await.expect("first");
        let request = set("k", "b").with_mutation_id(id);
        let first = cell.peers[leader]
            .manager
            .commit_mutation(request.clone())
            .await
            .expect("commit");
        cell.set(leader, "k", "c").await.expect("overwrite");
        let retried = cell.peers[leader]
            .manager
            .commit_mutation(request)
            .await
            .expect("retry");

        assert_eq!(first.data, b"a");
        assert_eq!(retried, first);
        assert_eq!(cell.peers[leader].get("k").as_deref(), Some("c"));
        cell.shutdown();
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_distributed_snapshot_matches_log_replay() {
    local(async {
        let cell = TestCell::start(3).await;
        let leader = cell.wait_for_cell(2).await;
        for round in 0..20 {
            cell.set(leader, &format!("k{}", round % 7), &format!("v{round}"))
                .await
                .expect("commit");
        }

        let snapshot_id = cell.peers[leader]
            .manager
            .build_snapshot(false, true)
            .await
            .expect("snapshot");

        // The snapshot holds exactly the segments before it.
        let stores = &cell.peers[leader].stores;
        let mut reader = stores
            .snapshots
            .create_reader(snapshot_id)
            .await
            .expect("reader");
        let data = reader.read_all().await.expect("read snapshot");
        let (_, state) = split_snapshot_envelope(snapshot_id, &data).expect("envelope");
        let mut loaded = KvAutomaton::detached();
        let mut state_reader: &[u8] = state;
        loaded.load_snapshot(&mut state_reader).expect("load");

        let mut replayed = KvAutomaton::detached();
        for segment in 0..snapshot_id {
            let changelog = match stores.changelogs.open_changelog(segment).await {
                Ok(changelog) => changelog,
                Err(ChangelogError::NotFound { .. }) => continue,
                Err(error) => panic!("open segment {segment}: {error}"),
            };
            let records = changelog
                .read(0, changelog.record_count())
                .await
                .expect("read segment");
            for record in records {
                let (header, payload) = deserialize_mutation_record(&record).expect("decode");
                let mut context = MutationContext::new(
                    &header.mutation_type,
                    &payload,
                    header.version,
                    header.sequence_number,
                    header.epoch,
                    header.reign,
                    header.mutation_id,
                    Duration::from_micros(header.timestamp_micros),
                    header.random_seed,
                );
                replayed.apply_mutation(&mut context).expect("replay");
            }
        }
        assert_eq!(loaded.entries(), replayed.entries());
        assert_eq!(loaded.entries(), cell.peers[leader].entries());

        let leader_meta = stores
            .snapshots
            .metas()
            .into_iter()
            .find(|meta| meta.snapshot_id == snapshot_id)
            .expect("leader snapshot meta");
        for index in cell.followers_of(leader) {
            let snapshots = cell.peers[index].stores.snapshots.clone();
            wait_until("follower snapshot", || {
                snapshots
                    .metas()
                    .iter()
                    .any(|meta| meta.snapshot_id == snapshot_id)
            })
            .await;
            let meta = snapshots
                .metas()
                .into_iter()
                .find(|meta| meta.snapshot_id == snapshot_id)
                .expect("follower snapshot meta");
            assert_eq!(meta.checksum, leader_meta.checksum);
            assert_eq!(meta.version, leader_meta.version);
            assert_eq!(meta.sequence_number, leader_meta.sequence_number);
        }
        cell.shutdown();
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_read_only_rejects_mutations() {
    local(async {
        let cell = TestCell::start(3).await;
        let leader = cell.wait_for_cell(2).await;
        let manager = &cell.peers[leader].manager;

        manager.set_read_only(true);
        assert!(manager.get_read_only());
        let error = cell.set(leader, "k", "v").await.expect_err("read-only");
        assert_eq!(error, HydraError::ReadOnly);

        manager.set_read_only(false);
        cell.set(leader, "k", "v").await.expect("writable again");

        let snapshot = manager.build_snapshot(true, true).await.expect("snapshot");
        assert!(snapshot > 0);
        assert!(manager.get_read_only());
        assert!(cell.set(leader, "k", "w").await.is_err());
        cell.shutdown();
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_restart_recovers_from_stores() {
    local(async {
        let cell = TestCell::start_with(HydraConfig::for_simulation(), 3).await;
        let leader = cell.wait_for_cell(2).await;
        for round in 0..8 {
            cell.set(leader, &format!("k{round}"), &format!("v{round}"))
                .await
                .expect("commit");
        }
        cell.peers[leader]
            .manager
            .build_snapshot(false, true)
            .await
            .expect("snapshot");
        cell.set(leader, "after-snapshot", "yes").await.expect("commit");
        cell.wait_converged(&[0, 1, 2]).await;
        let expected = cell.peers[leader].entries();
        let config = cell.config.clone();
        let stores: Vec<PeerStores> = cell.shutdown();

        let cell = TestCell::start_on(config, stores).await;
        let leader = cell.wait_for_cell(2).await;
        assert_eq!(cell.peers[leader].entries(), expected);
        cell.set(leader, "after-restart", "yes").await.expect("commit");
        cell.wait_converged(&[0, 1, 2]).await;
        assert_invariants(&cell);
        cell.shutdown();
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_isolated_leader_loses_lease() {
    local(async {
        let cell = TestCell::start(3).await;
        let leader = cell.wait_for_cell(2).await;
        let stops = Rc::new(RefCell::new(Vec::new()));
        {
            let stops = stops.clone();
            cell.peers[leader]
                .manager
                .signals()
                .stop_leading
                .subscribe(move |error: &HydraError| stops.borrow_mut().push(error.clone()));
        }

        cell.channels.kill(cell.peers[leader].id);
        wait_until("lease expiry", || {
            stops.borrow().contains(&HydraError::LeaseExpired)
        })
        .await;
        assert!(!cell.peers[leader].manager.is_active_leader());

        cell.channels.revive(cell.peers[leader].id);
        let leader = cell.wait_for_cell(2).await;
        cell.set(leader, "k", "v").await.expect("commit after healing");
        assert_invariants(&cell);
        cell.shutdown();
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_follower_forwards_to_leader() {
    local(async {
        let cell = TestCell::start(3).await;
        let leader = cell.wait_for_cell(2).await;
        let follower = cell.followers_of(leader)[0];

        let error = cell.set(follower, "k", "v").await.expect_err("not a leader");
        assert!(error.is_invalid_state());

        let forwarded = MutationRequest::new(SET, "k=v").with_leader_forwarding();
        cell.peers[follower]
            .manager
            .commit_mutation(forwarded)
            .await
            .expect("forwarded commit");
        assert_eq!(cell.peers[leader].get("k").as_deref(), Some("v"));
        cell.peers[follower]
            .manager
            .sync_with_leader()
            .await
            .expect("sync");
        assert_eq!(cell.peers[follower].get("k").as_deref(), Some("v"));
        cell.shutdown();
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_handler_failure_steps_leader_down() {
    local(async {
        let cell = TestCell::start(3).await;
        let leader = cell.wait_for_cell(2).await;
        let stops = Rc::new(RefCell::new(Vec::new()));
        {
            let stops = stops.clone();
            cell.peers[leader]
                .manager
                .signals()
                .stop_leading
                .subscribe(move |error: &HydraError| stops.borrow_mut().push(error.clone()));
        }

        cell.set(leader, "before", "1").await.expect("commit");
        let failed = cell.peers[leader]
            .manager
            .commit_mutation(MutationRequest::new(FAIL, ""))
            .await;
        assert!(failed.is_err());
        wait_until("leader steps down", || !stops.borrow().is_empty()).await;

        let leader = cell.wait_for_cell(2).await;
        cell.set(leader, "after", "2").await.expect("commit after step down");
        cell.wait_converged(&[0, 1, 2]).await;

        // The failed record consumed its position on every peer.
        for peer in &cell.peers {
            let journal = peer.journal.borrow();
            let sequence = |key: &str| {
                journal
                    .applied
                    .iter()
                    .find(|applied| applied.key == key)
                    .map(|applied| applied.sequence_number)
            };
            if let (Some(before), Some(after)) = (sequence("before"), sequence("after")) {
                assert!(after > before + 1, "{}: {before} then {after}", peer.id);
            }
        }
        assert_invariants(&cell);
        cell.shutdown();
    })
    .await;
}

type Stops = Rc<RefCell<Vec<HydraError>>>;

/// Errors peer `index` stops leading and stops following with.
fn record_stops(cell: &TestCell, index: usize) -> (Stops, Stops) {
    let leading = Rc::new(RefCell::new(Vec::new()));
    let following = Rc::new(RefCell::new(Vec::new()));
    let signals = cell.peers[index].manager.signals();
    {
        let leading = leading.clone();
        signals
            .stop_leading
            .subscribe(move |error: &HydraError| leading.borrow_mut().push(error.clone()));
    }
    {
        let following = following.clone();
        signals
            .stop_following
            .subscribe(move |error: &HydraError| following.borrow_mut().push(error.clone()));
    }
    (leading, following)
}

fn is_io_failure(error: &HydraError) -> bool {
    matches!(error, HydraError::Changelog(ChangelogError::Io { .. }))
}

#[tokio::test(start_paused = true)]
async fn test_lagging_follower_catches_up_across_checkpoint() {
    local(async {
        let cell = TestCell::start(3).await;
        let leader = cell.wait_for_cell(2).await;
        let lagging = cell.followers_of(leader)[0];
        let (_, stops) = record_stops(&cell, lagging);

        cell.channels.hold(cell.peers[lagging].id);
        cell.set(leader, "x", "1").await.expect("commit x");
        cell.set(leader, "a", "2").await.expect("commit a");
        cell.peers[leader]
            .manager
            .build_snapshot(false, false)
            .await
            .expect("checkpoint");
        cell.set(leader, "b", "3").await.expect("commit b");

        // The held follower now receives records from both segments at once.
        cell.channels.release(cell.peers[lagging].id);
        let follower = cell.peers[lagging].manager.clone();
        follower.sync_with_leader().await.expect("sync");
        assert_eq!(cell.peers[lagging].get("b").as_deref(), Some("3"));
        assert!(stops.borrow().is_empty(), "follower re-synced: {:?}", stops.borrow());
        assert!(follower.is_active_follower());
        assert_invariants(&cell);
        cell.shutdown();
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_leader_flush_failure_steps_down() {
    local(async {
        let cell = TestCell::start(3).await;
        let leader = cell.wait_for_cell(2).await;
        cell.set(leader, "before", "1").await.expect("commit before fault");
        let (stops, _) = record_stops(&cell, leader);

        cell.peers[leader].stores.changelogs.set_failing(true);
        let error = cell
            .set(leader, "during", "2")
            .await
            .expect_err("local flush failed");
        assert!(error.is_invalid_state(), "unexpected error {error}");
        wait_until("leader step-down", || stops.borrow().iter().any(is_io_failure)).await;
        assert!(!cell.peers[leader].manager.is_active_leader());

        // Keep the faulty peer out until someone else leads.
        cell.kill(leader);
        let next = cell.wait_for_cell(1).await;
        assert_ne!(next, leader);
        cell.set(next, "after", "3").await.expect("commit on new leader");

        cell.peers[leader].stores.changelogs.set_failing(false);
        cell.revive(leader);
        cell.wait_for_cell(2).await;
        cell.wait_converged(&[0, 1, 2]).await;
        assert_eq!(cell.peers[leader].get("after").as_deref(), Some("3"));
        assert_invariants(&cell);
        cell.shutdown();
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_follower_flush_failure_resyncs() {
    local(async {
        let cell = TestCell::start(3).await;
        let leader = cell.wait_for_cell(2).await;
        let faulty = cell.followers_of(leader)[0];
        let (_, stops) = record_stops(&cell, faulty);

        cell.peers[faulty].stores.changelogs.set_failing(true);
        cell.set(leader, "k", "v").await.expect("quorum without the faulty follower");
        wait_until("follower abandons its epoch", || {
            stops.borrow().iter().any(is_io_failure)
        })
        .await;

        cell.peers[faulty].stores.changelogs.set_failing(false);
        wait_until("follower recovered", || {
            cell.peers[faulty].manager.is_active_follower()
                || cell.peers[faulty].manager.is_active_leader()
        })
        .await;
        cell.wait_for_cell(2).await;
        cell.wait_converged(&[0, 1, 2]).await;
        assert_eq!(cell.peers[faulty].get("k").as_deref(), Some("v"));
        assert_invariants(&cell);
        cell.shutdown();
    })
    .await;
}
