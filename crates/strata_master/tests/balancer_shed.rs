//! Balancer shedding driven through a heartbeat with nothing to assign.

mod common;

use std::sync::Arc;

use common::{manager_with, server, settle_root, user_region, FixedFleet, RecordingSession};
use strata_master::{LifecycleState, RegionInfo, RegionManagerConfig, RegionMessage, OVERLOADED};

#[test]
fn overloaded_server_sheds_its_most_loaded_regions() {
    let session = Arc::new(RecordingSession::default());
    // Fleet average is 10; s5 reports 20, past ceil(10 * 1.3).
    let manager = manager_with(
        FixedFleet::new(&[(5, "s1"), (10, "s2"), (10, "s3"), (5, "s4"), (20, "s5")]),
        session,
        RegionManagerConfig::default(),
    );
    let s5 = server("s5", 20);
    settle_root(&manager, &s5);

    // One reported region is already mid-close on another server and must
    // be skipped by the shedding pass.
    let stuck = user_region(0);
    manager.set_closing("s1,6020,1", None, &stuck, false);

    let mut most_loaded = vec![RegionInfo::root(), RegionInfo::meta(b"".to_vec(), b"".to_vec(), 90)];
    most_loaded.push(stuck.clone());
    most_loaded.extend((1..=11).map(user_region));

    let out = manager.process_heartbeat(&s5, &most_loaded);

    let closes: Vec<&RegionMessage> = out
        .iter()
        .filter(|m| matches!(m, RegionMessage::Close { .. }))
        .collect();
    assert_eq!(closes.len(), 10);
    for msg in &closes {
        match msg {
            RegionMessage::Close { region, reason } => {
                assert!(!region.is_root() && !region.is_meta_table());
                assert_ne!(region, &stuck);
                assert_eq!(reason.as_deref(), Some(OVERLOADED));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    // Every shed region is marked pending close on s5.
    let transitions = manager.regions_in_transition();
    let pending: Vec<_> = transitions
        .values()
        .filter(|v| v.state == LifecycleState::PendingClose)
        .collect();
    assert_eq!(pending.len(), 10);
    for view in pending {
        assert_eq!(view.server_name.as_deref(), Some("s5,6020,1"));
    }
}

#[test]
fn shed_cap_bounds_one_heartbeat() {
    let session = Arc::new(RecordingSession::default());
    let mut config = RegionManagerConfig::default();
    config.balancer.max_regions_to_close = 4;
    let manager = manager_with(
        FixedFleet::new(&[(5, "s1"), (10, "s2"), (10, "s3"), (5, "s4"), (20, "s5")]),
        session,
        config,
    );
    let s5 = server("s5", 20);
    settle_root(&manager, &s5);

    let most_loaded: Vec<_> = (1..=12).map(user_region).collect();
    let out = manager.process_heartbeat(&s5, &most_loaded);
    let closes = out
        .iter()
        .filter(|m| matches!(m, RegionMessage::Close { .. }))
        .count();
    assert_eq!(closes, 4);
}

#[test]
fn balanced_server_is_left_alone() {
    let session = Arc::new(RecordingSession::default());
    let manager = manager_with(
        FixedFleet::new(&[(9, "s1"), (10, "s2"), (11, "s3")]),
        session,
        RegionManagerConfig::default(),
    );
    let s2 = server("s2", 10);
    settle_root(&manager, &s2);

    let most_loaded: Vec<_> = (1..=12).map(user_region).collect();
    let out = manager.process_heartbeat(&s2, &most_loaded);
    assert!(out.is_empty());
}
