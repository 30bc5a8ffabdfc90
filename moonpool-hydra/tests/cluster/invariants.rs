//! Replication invariants checked across a test cell.

use std::collections::BTreeMap;

use moonpool_hydra::Version;

use super::harness::{Applied, TestCell};

/// Every active peer satisfies `automaton <= committed <= logged`.
pub fn assert_version_order(cell: &TestCell) {
    for peer in &cell.peers {
        let manager = &peer.manager;
        if !manager.get_control_state().is_active() {
            continue;
        }
        let automaton = manager.get_automaton_version();
        let committed = manager.get_committed_version();
        let logged = manager.get_logged_version();
        assert!(
            automaton <= committed && committed <= logged,
            "{}: automaton {automaton}, committed {committed}, logged {logged}",
            peer.id
        );
    }
}

/// Each peer applied strictly increasing sequence numbers at strictly
/// increasing versions since its last reset.
pub fn assert_applied_in_order(cell: &TestCell) {
    for peer in &cell.peers {
        let journal = peer.journal.borrow();
        for pair in journal.applied.windows(2) {
            assert!(
                pair[0].sequence_number < pair[1].sequence_number,
                "{}: sequence {} applied after {}",
                peer.id,
                pair[1].sequence_number,
                pair[0].sequence_number
            );
            assert!(
                pair[0].version < pair[1].version,
                "{}: version {} applied after {}",
                peer.id,
                pair[1].version,
                pair[0].version
            );
        }
    }
}

/// Peers that applied the same sequence number applied the same record.
pub fn assert_peers_agree(cell: &TestCell) {
    let mut seen: BTreeMap<u64, (Version, Applied)> = BTreeMap::new();
    for peer in &cell.peers {
        for applied in &peer.journal.borrow().applied {
            match seen.get(&applied.sequence_number) {
                Some((version, first)) => {
                    assert_eq!(
                        (*version, &first.key, first.mutation_id),
                        (applied.version, &applied.key, applied.mutation_id),
                        "{} disagrees on sequence {}",
                        peer.id,
                        applied.sequence_number
                    );
                }
                None => {
                    seen.insert(applied.sequence_number, (applied.version, applied.clone()));
                }
            }
        }
    }
}

/// All of the above.
pub fn assert_invariants(cell: &TestCell) {
    assert_version_order(cell);
    assert_applied_in_order(cell);
    assert_peers_agree(cell);
}
