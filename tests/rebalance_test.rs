use binmatrix::domain::{Leg, MemberId, Money};
use binmatrix::engine::{
    EngineConfig, MatrixState, PlacementRequest, RebalanceOutcome, SpilloverPolicy,
};
use chrono::{DateTime, Utc};

fn now() -> DateTime<Utc> {
    DateTime::from_timestamp(1_705_000_000, 0).unwrap()
}

fn m(units: i64) -> Money {
    Money::from_units(units)
}

struct Lopsided {
    state: MatrixState,
    root: MemberId,
    left: MemberId,
    right: MemberId,
    a: MemberId,
    b: MemberId,
    c: MemberId,
}

/// ```text
///            root
///          /      \
///       left      right
///      /    \
///     a(500) b(100)
///            /
///           c
/// ```
fn lopsided(config: EngineConfig) -> Lopsided {
    let mut state = MatrixState::new(EngineConfig {
        policy: SpilloverPolicy::Manual,
        ..config
    });
    let members: Vec<MemberId> = (0..6).map(|_| MemberId::random()).collect();
    let (root, left, right, a, b, c) = (
        members[0], members[1], members[2], members[3], members[4], members[5],
    );
    state.place(&PlacementRequest::root(root), now()).unwrap();
    for (member, path) in [
        (left, vec![Leg::Left]),
        (right, vec![Leg::Right]),
        (a, vec![Leg::Left, Leg::Left]),
        (b, vec![Leg::Left, Leg::Right]),
        (c, vec![Leg::Left, Leg::Right, Leg::Left]),
    ] {
        state
            .place(&PlacementRequest::under(member, root).with_path(path), now())
            .unwrap();
    }
    state.record_volume(&a, m(500), now()).unwrap();
    state.record_volume(&b, m(100), now()).unwrap();
    Lopsided {
        state,
        root,
        left,
        right,
        a,
        b,
        c,
    }
}

#[test]
fn test_rebalance_moves_smallest_subtree_to_light_leg() {
    let Lopsided {
        mut state,
        root,
        left,
        right,
        b,
        c,
        ..
    } = lopsided(EngineConfig::default());
    let before = state.stats(&root).unwrap();
    assert_eq!((before.left_volume, before.right_volume), (m(600), m(0)));

    let outcome = state.rebalance(&root, now()).unwrap();
    let moves = match outcome {
        RebalanceOutcome::Moved { moves } => moves,
        other => panic!("expected a move, got {:?}", other),
    };
    assert_eq!(moves.len(), 1);
    let record = &moves[0];
    assert_eq!(record.member_id, b);
    assert_eq!(record.pivot_member_id, root);
    assert_eq!(record.old_parent_id, state.get_position(&left).unwrap().id);
    assert_eq!(record.new_parent_id, state.get_position(&right).unwrap().id);
    assert_eq!(record.moved_volume, m(100));

    let after = state.stats(&root).unwrap();
    assert_eq!((after.left_volume, after.right_volume), (m(500), m(100)));
    assert_eq!(after.total_volume, before.total_volume);
    assert_eq!(after.left_count + after.right_count, before.left_count + before.right_count);

    // the moved subtree keeps its shape and is re-levelled
    let moved = state.get_position(&b).unwrap();
    assert_eq!(moved.level, 2);
    let child = state.get_position(&c).unwrap();
    assert_eq!(child.parent_id, Some(moved.id));
    assert_eq!(child.level, 3);

    assert!(state.audit().is_clean());
    assert_eq!(state.rebalance_history(&root).unwrap(), moves);
}

#[test]
fn test_rebalance_respects_threshold() {
    let Lopsided {
        mut state, root, ..
    } = lopsided(EngineConfig {
        rebalance_threshold: m(600),
        ..EngineConfig::default()
    });
    assert_eq!(
        state.rebalance(&root, now()).unwrap(),
        RebalanceOutcome::NothingToRebalance
    );
    assert!(state.rebalance_history(&root).unwrap().is_empty());
}

#[test]
fn test_rebalance_stops_when_no_move_helps() {
    let Lopsided {
        mut state, root, ..
    } = lopsided(EngineConfig {
        rebalance_max_moves: 5,
        ..EngineConfig::default()
    });
    let outcome = state.rebalance(&root, now()).unwrap();
    match outcome {
        RebalanceOutcome::Moved { moves } => assert_eq!(moves.len(), 1),
        other => panic!("expected a move, got {:?}", other),
    }
    assert_eq!(
        state.rebalance(&root, now()).unwrap(),
        RebalanceOutcome::NothingToRebalance
    );
}

#[test]
fn test_balanced_tree_has_nothing_to_rebalance() {
    let Lopsided {
        mut state,
        root,
        right,
        a,
        ..
    } = lopsided(EngineConfig::default());
    // a carries 500 on the left, top up the right so no pivot has a
    // movable subtree smaller than its differential
    state.record_volume(&right, m(600), now()).unwrap();
    let before = state.stats(&root).unwrap();
    assert_eq!(before.left_volume, before.right_volume);

    let outcome = state.rebalance(&a, now()).unwrap();
    assert_eq!(outcome, RebalanceOutcome::NothingToRebalance);
    assert_eq!(
        state.rebalance(&root, now()).unwrap(),
        RebalanceOutcome::NothingToRebalance
    );
}

#[test]
fn test_history_is_scoped_to_subtree() {
    let Lopsided {
        mut state,
        root,
        left,
        ..
    } = lopsided(EngineConfig::default());
    state.rebalance(&root, now()).unwrap();
    assert_eq!(state.rebalance_history(&root).unwrap().len(), 1);
    // pivot was the root, which is not inside left's subtree
    assert!(state.rebalance_history(&left).unwrap().is_empty());
}

#[test]
fn test_rebalance_change_set_covers_moved_positions() {
    let Lopsided {
        mut state, root, ..
    } = lopsided(EngineConfig::default());
    state.take_changes();
    state.rebalance(&root, now()).unwrap();
    let changes = state.take_changes();
    assert_eq!(changes.rebalances.len(), 1);
    // moved root, its child and both parents
    assert!(changes.positions.len() >= 4);
}
