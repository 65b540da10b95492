//! End-to-end assignment flows driven through the public heartbeat entry
//! point, with the coordination mirror observed through an in-memory session.

mod common;

use std::sync::Arc;

use common::{manager_with, server, settle_root, user_region, FixedFleet, RecordingSession};
use strata_master::{
    LifecycleState, RegionInfo, RegionManagerConfig, RegionMessage, TransitionEvent,
    EVENT_REGION_OFFLINE,
};

#[test]
fn cold_start_offers_root_to_first_server() {
    let session = Arc::new(RecordingSession::default());
    let manager = manager_with(
        FixedFleet::new(&[(0, "s1")]),
        session.clone(),
        RegionManagerConfig::default(),
    );

    let s1 = server("s1", 0);
    let out = manager.process_heartbeat(&s1, &[]);
    assert!(matches!(&out[..], [RegionMessage::Open(r)] if r.is_root()));

    let root_name = RegionInfo::root().region_name_string();
    let transitions = manager.regions_in_transition();
    let root_view = transitions.get(&root_name).expect("root in transition");
    assert_eq!(root_view.state, LifecycleState::PendingOpen);
    assert_eq!(root_view.server_name.as_deref(), Some("s1,6020,1"));
}

#[test]
fn root_ack_settles_catalog_and_empties_mirror() {
    let session = Arc::new(RecordingSession::default());
    let manager = manager_with(
        FixedFleet::new(&[(0, "s1")]),
        session.clone(),
        RegionManagerConfig::default(),
    );

    let s1 = server("s1", 0);
    settle_root(&manager, &s1);

    assert_eq!(manager.root_region_location(), Some(s1.address.clone()));
    assert_eq!(session.root_writes.lock().unwrap().len(), 1);
    assert!(manager.regions_in_transition().is_empty());
    assert!(session.nodes.lock().unwrap().is_empty());
}

#[test]
fn every_transition_entry_has_a_wellformed_mirror_node() {
    let session = Arc::new(RecordingSession::default());
    let manager = manager_with(
        FixedFleet::new(&[(0, "s1"), (0, "s2")]),
        session.clone(),
        RegionManagerConfig::default(),
    );
    let s1 = server("s1", 0);
    settle_root(&manager, &s1);

    for i in 0..8 {
        manager.set_unassigned(&user_region(i), false);
    }
    let _ = manager.process_heartbeat(&s1, &[]);

    let nodes = session.nodes.lock().unwrap();
    for i in 0..8 {
        let region = user_region(i);
        assert!(manager.region_is_in_transition(&region.region_name_string()));
        let path = format!("unassigned/{}", region.encoded_name());
        let payload = nodes.get(&path).expect("mirror node for transition entry");
        let event = TransitionEvent::decode(payload).expect("well-formed payload");
        assert_eq!(event.kind, EVENT_REGION_OFFLINE);
        assert_eq!(event.sender, "master");
    }
}

#[test]
fn concurrent_heartbeats_never_double_assign() {
    let session = Arc::new(RecordingSession::default());
    let manager = manager_with(
        FixedFleet::new(&[(0, "s1"), (0, "s2")]),
        session,
        RegionManagerConfig::default(),
    );
    let s1 = server("s1", 0);
    settle_root(&manager, &s1);

    for i in 0..6 {
        manager.set_unassigned(&user_region(i), false);
    }

    // Two back-to-back heartbeats race over the same candidate pool; a
    // region handed to s1 is pending-open and must not be offered to s2.
    let out1 = manager.process_heartbeat(&server("s1", 0), &[]);
    let out2 = manager.process_heartbeat(&server("s2", 0), &[]);

    let mut opened = Vec::new();
    for msg in out1.iter().chain(out2.iter()) {
        if let RegionMessage::Open(region) = msg {
            assert!(
                !opened.contains(region),
                "region {region} opened on two servers"
            );
            opened.push(region.clone());
        }
    }

    for (_, view) in manager.regions_in_transition() {
        if view.state == LifecycleState::PendingOpen {
            assert!(view.server_name.is_some());
        }
    }
}

#[test]
fn closed_region_comes_back_as_unassigned() {
    let session = Arc::new(RecordingSession::default());
    let manager = manager_with(
        FixedFleet::new(&[(0, "s1"), (0, "s2")]),
        session,
        RegionManagerConfig::default(),
    );
    let s1 = server("s1", 0);
    settle_root(&manager, &s1);

    let region = user_region(1);
    let name = region.region_name_string();
    manager.set_closing(&s1.server_name, Some(&s1.address), &region, false);
    manager.set_pending_close(&name);
    manager.set_closed(&name).expect("pending close to closed");

    // Not offlined: removal recreates the region as unassigned.
    manager.remove_region(&region);
    assert!(manager.is_unassigned(&region));

    // Offlined: removal is final.
    let gone = user_region(2);
    manager.set_closing(&s1.server_name, Some(&s1.address), &gone, true);
    manager.set_pending_close(&gone.region_name_string());
    manager
        .set_closed(&gone.region_name_string())
        .expect("pending close to closed");
    manager.remove_region(&gone);
    assert!(!manager.region_is_in_transition(&gone.region_name_string()));
}
