//! 协调器复合动作的设备调用序列

mod common;

use asrs_control::{ErrorKind, LocationStore, Parking};
use asrs_driver::ConveyorRoute;
use asrs_protocol::{Coord, LiftTaskKind};
use common::{Event, Rig, assert_lift_guarded, assert_subsequence};

#[test]
fn test_cross_layer_task_numbers_and_kinds() {
    let rig = Rig::new(Coord::new(2, 2, 1));
    rig.with(|w| w.lift_floor = 4);
    let mut coord = rig.coordinator();

    let arrived = coord.cross_layer(10, 3).unwrap();
    assert_eq!(arrived, Coord::new(5, 3, 3));
    assert_eq!(rig.with(|w| w.shuttle), Coord::new(5, 3, 3));

    let events = rig.events();
    let lifts: Vec<&Event> = events.iter().filter(|e| matches!(e, Event::LiftMove { .. })).collect();
    assert_eq!(
        lifts,
        vec![
            &Event::LiftMove {
                task_no: 10,
                floor: 1,
                kind: LiftTaskKind::Idle
            },
            &Event::LiftMove {
                task_no: 13,
                floor: 3,
                kind: LiftTaskKind::Car
            },
        ]
    );
    let relocates: Vec<&Event> = events.iter().filter(|e| matches!(e, Event::Relocate { .. })).collect();
    assert_eq!(
        relocates,
        vec![&Event::Relocate {
            task_no: 14,
            coord: Coord::lift(3)
        }]
    );
    let moves: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            Event::Move { task_no, .. } => Some(*task_no),
            _ => None,
        })
        .collect();
    assert_eq!(moves, vec![11, 12, 15]);

    assert_eq!(events.iter().filter(|e| **e == Event::PlcConnect).count(), 1);
    assert_eq!(events.last(), Some(&Event::ShuttleDisconnect));
    assert_lift_guarded(&events, Coord::new(2, 2, 1));
}

#[test]
fn test_cross_layer_noop_on_same_layer() {
    let rig = Rig::new(Coord::new(1, 2, 2));
    let mut coord = rig.coordinator();
    assert_eq!(coord.cross_layer(10, 2).unwrap(), Coord::new(1, 2, 2));
    assert!(rig.events().iter().all(|e| !e.is_motion()));
    assert!(!rig.events().contains(&Event::PlcConnect));
}

#[test]
fn test_cross_layer_rejects_bad_layer() {
    let rig = Rig::new(Coord::new(1, 2, 2));
    let mut coord = rig.coordinator();
    let err = coord.cross_layer(10, 5).unwrap_err();
    assert_eq!(err.kind, ErrorKind::PreconditionFailed);
    assert!(rig.events().is_empty());
}

#[test]
fn test_busy_lift_blocks_exit_from_car() {
    let rig = Rig::new(Coord::lift(1));
    rig.with(|w| w.lift_busy = true);
    let mut coord = rig.coordinator();

    let err = coord.cross_layer(10, 2).unwrap_err();
    assert_eq!(err.kind, ErrorKind::IllegalLiftState);
    let events = rig.events();
    assert!(!events.iter().any(|e| matches!(e, Event::Move { .. })));
    assert_eq!(events.last(), Some(&Event::ShuttleDisconnect));
    assert_eq!(events[events.len() - 2], Event::PlcDisconnect);
}

#[test]
fn test_inbound_from_other_layer() {
    let rig = Rig::new(Coord::lift(1));
    rig.present_at_entry("P1001");
    let states = rig.store.states().unwrap();
    let mut coord = rig.coordinator();

    coord.task_inband(40, Coord::new(1, 1, 2), &states).unwrap();

    assert_subsequence(
        &rig.labels(),
        &[
            "plc.connect",
            "plc.check",
            "relocate(6,3,2)",
            "lift(1)",
            "convey(entry->lift)",
            "lift(2)",
            "convey(lift->floor 2)",
            "move(5,3,2)",
            "pick_in_progress(2)",
            "good_move(1,1,2)",
            "pick_complete(2)",
            "plc.disconnect",
        ],
    );
    let events = rig.events();
    assert_eq!(events.iter().find(|e| e.is_plc()), Some(&Event::PlcConnect));
    assert_eq!(events.iter().rev().find(|e| e.is_plc()), Some(&Event::PlcDisconnect));
    assert_lift_guarded(&events, Coord::lift(1));

    let kinds: Vec<LiftTaskKind> = events
        .iter()
        .filter_map(|e| match e {
            Event::LiftMove { kind, .. } => Some(*kind),
            _ => None,
        })
        .collect();
    assert_eq!(
        kinds,
        vec![LiftTaskKind::Car, LiftTaskKind::Car, LiftTaskKind::Idle, LiftTaskKind::Good]
    );
    rig.with(|w| {
        assert!(w.pallets.contains(&Coord::new(1, 1, 2)));
        assert!(!w.entry_pallet);
    });
}

#[test]
fn test_inbound_leaves_car_before_moving_lift() {
    let rig = Rig::new(Coord::lift(1));
    rig.present_at_entry("P1002");
    let states = rig.store.states().unwrap();
    let mut coord = rig.coordinator();

    coord.task_inband(40, Coord::new(2, 4, 1), &states).unwrap();
    let labels = rig.labels();
    assert_subsequence(&labels, &["state(1)", "move(5,3,1)", "lift(1)", "convey(entry->lift)"]);
    assert!(!labels.iter().any(|l| l.starts_with("relocate")));
    assert_lift_guarded(&rig.events(), Coord::lift(1));
}

#[test]
fn test_outbound_trace() {
    let rig = Rig::new(Coord::pre_lift(2));
    rig.stock(Coord::new(3, 1, 2), "P7");
    let states = rig.store.states().unwrap();
    let mut coord = rig.coordinator();

    coord.task_outband(60, Coord::new(3, 1, 2), &states).unwrap();
    assert_subsequence(
        &rig.labels(),
        &[
            "plc.connect",
            "move(3,1,2)",
            "feed_in_progress(2)",
            "good_move(5,3,2)",
            "feed_complete(2)",
            "lift(2)",
            "convey(floor 2->lift)",
            "lift(1)",
            "convey(lift->gate)",
            "plc.disconnect",
        ],
    );
    let last_convey = rig
        .events()
        .into_iter()
        .filter_map(|e| match e {
            Event::Convey(route) => Some(route),
            _ => None,
        })
        .last();
    assert_eq!(last_convey, Some(ConveyorRoute::LiftToGate));
    rig.with(|w| {
        assert_eq!(w.delivered, 1);
        assert!(w.pallets.is_empty());
    });
}

#[test]
fn test_outbound_rejects_empty_source() {
    let rig = Rig::new(Coord::pre_lift(2));
    let states = rig.store.states().unwrap();
    let mut coord = rig.coordinator();
    let err = coord.task_outband(60, Coord::new(3, 1, 2), &states).unwrap_err();
    assert_eq!(err.kind, ErrorKind::PreconditionFailed);
    assert!(rig.events().is_empty());
}

#[test]
fn test_inbound_rejects_buffer_and_occupied() {
    let rig = Rig::new(Coord::pre_lift(2));
    rig.stock(Coord::new(1, 1, 2), "P1");
    let states = rig.store.states().unwrap();
    let mut coord = rig.coordinator();

    let err = coord.task_inband(40, Coord::new(2, 3, 2), &states).unwrap_err();
    assert_eq!(err.kind, ErrorKind::PreconditionFailed);
    let err = coord.task_inband(40, Coord::new(1, 1, 2), &states).unwrap_err();
    assert_eq!(err.kind, ErrorKind::PreconditionFailed);
    let err = coord.task_inband(40, Coord::new(4, 2, 2), &states).unwrap_err();
    assert_eq!(err.kind, ErrorKind::PreconditionFailed);
    assert!(rig.events().is_empty());
}

#[test]
fn test_plan_parking_ranks_by_highway_distance() {
    let rig = Rig::new(Coord::pre_lift(2));
    rig.stock(Coord::new(1, 1, 2), "P1");
    rig.stock(Coord::new(2, 1, 2), "B2");
    rig.stock(Coord::new(3, 1, 2), "B3");
    let states = rig.store.states().unwrap();
    let coord = rig.coordinator();

    let plan = coord
        .plan_parking(Coord::new(1, 1, 2), Coord::pre_lift(2), &states)
        .unwrap();
    assert_eq!(
        plan,
        vec![
            Parking {
                blocker: Coord::new(3, 1, 2),
                staging: Coord::new(1, 3, 2)
            },
            Parking {
                blocker: Coord::new(2, 1, 2),
                staging: Coord::new(2, 3, 2)
            },
        ]
    );
}

#[test]
fn test_plan_parking_skips_occupied_staging() {
    let rig = Rig::new(Coord::pre_lift(2));
    rig.stock(Coord::new(1, 1, 2), "P1");
    rig.stock(Coord::new(3, 1, 2), "B3");
    rig.stock(Coord::new(1, 3, 2), "S1");
    let states = rig.store.states().unwrap();
    let coord = rig.coordinator();

    let plan = coord
        .plan_parking(Coord::new(1, 1, 2), Coord::pre_lift(2), &states)
        .unwrap();
    assert_eq!(
        plan,
        vec![Parking {
            blocker: Coord::new(3, 1, 2),
            staging: Coord::new(2, 3, 2)
        }]
    );
}

#[test]
fn test_plan_parking_avoids_staging_behind_stored_pallet() {
    let rig = Rig::new(Coord::pre_lift(2));
    rig.stock(Coord::new(1, 1, 2), "P1");
    rig.stock(Coord::new(3, 1, 2), "B3");
    rig.stock(Coord::new(2, 3, 2), "S2");
    let states = rig.store.states().unwrap();
    let coord = rig.coordinator();

    // (1,3,2) 只能经过 (2,3,2) 到达
    let plan = coord
        .plan_parking(Coord::new(1, 1, 2), Coord::pre_lift(2), &states)
        .unwrap();
    assert_eq!(
        plan,
        vec![Parking {
            blocker: Coord::new(3, 1, 2),
            staging: Coord::new(3, 3, 2)
        }]
    );
}

#[test]
fn test_unreachable_staging_moves_nothing() {
    let rig = Rig::new(Coord::pre_lift(2));
    rig.stock(Coord::new(1, 1, 2), "P1");
    rig.stock(Coord::new(3, 1, 2), "B3");
    rig.stock(Coord::new(2, 3, 2), "S2");
    let states = rig.store.states().unwrap();
    let mut coord = rig.coordinator().with_staging(vec![[1, 3], [2, 3]]);

    let err = coord
        .task_outband_with_blocking(70, Coord::new(1, 1, 2), &states)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotEnoughStagingSpace);
    assert!(err.message.contains("3,1,2"), "{}", err.message);
    assert!(rig.events().iter().all(|e| !e.is_motion()));
}

#[test]
fn test_obstructed_outbound_parks_and_restores() {
    let rig = Rig::new(Coord::pre_lift(2));
    rig.stock(Coord::new(1, 1, 2), "P1");
    rig.stock(Coord::new(2, 1, 2), "B2");
    rig.stock(Coord::new(3, 1, 2), "B3");
    let states = rig.store.states().unwrap();
    let mut coord = rig.coordinator();

    let parked = coord
        .task_outband_with_blocking(70, Coord::new(1, 1, 2), &states)
        .unwrap();
    assert_eq!(parked.len(), 2);
    assert_eq!(
        rig.shuttle_moves(),
        vec![
            "move(3,1,2)",
            "good_move(1,3,2)",
            "move(2,1,2)",
            "good_move(2,3,2)",
            "move(1,1,2)",
            "good_move(5,3,2)",
            "move(2,3,2)",
            "good_move(2,1,2)",
            "move(1,3,2)",
            "good_move(3,1,2)",
        ]
    );
    assert_subsequence(
        &rig.labels(),
        &[
            "good_move(2,3,2)",
            "feed_in_progress(2)",
            "good_move(5,3,2)",
            "convey(lift->gate)",
            "good_move(2,1,2)",
        ],
    );
    rig.with(|w| {
        assert_eq!(
            w.pallets.iter().copied().collect::<Vec<_>>(),
            vec![Coord::new(2, 1, 2), Coord::new(3, 1, 2)]
        );
        assert_eq!(w.delivered, 1);
    });
}

#[test]
fn test_not_enough_staging_moves_nothing() {
    let rig = Rig::new(Coord::pre_lift(2));
    rig.stock(Coord::new(1, 1, 2), "P1");
    rig.stock(Coord::new(2, 1, 2), "B2");
    rig.stock(Coord::new(3, 1, 2), "B3");
    let states = rig.store.states().unwrap();
    let mut coord = rig.coordinator().with_staging(vec![[1, 3]]);

    let err = coord
        .task_outband_with_blocking(70, Coord::new(1, 1, 2), &states)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotEnoughStagingSpace);
    assert!(rig.events().iter().all(|e| !e.is_motion()));
}

#[test]
fn test_partial_failure_lists_parked_blockers() {
    let rig = Rig::new(Coord::pre_lift(2));
    rig.stock(Coord::new(1, 1, 2), "P1");
    rig.stock(Coord::new(2, 1, 2), "B2");
    rig.stock(Coord::new(3, 1, 2), "B3");
    rig.with(|w| w.fail = Some("convey(floor 2->lift)".to_string()));
    let states = rig.store.states().unwrap();
    let mut coord = rig.coordinator();

    let err = coord
        .task_outband_with_blocking(70, Coord::new(1, 1, 2), &states)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Timeout);
    assert!(
        err.message
            .contains("parked blockers: 3,1,2 -> 1,3,2, 2,1,2 -> 2,3,2"),
        "{}",
        err.message
    );
    assert_eq!(rig.events().last(), Some(&Event::ShuttleDisconnect));
    assert!(!rig.labels().contains(&"good_move(2,1,2)".to_string()));
}

#[test]
fn test_good_move_with_blocking_crosses_layer_first() {
    let rig = Rig::new(Coord::pre_lift(1));
    rig.stock(Coord::new(1, 1, 2), "P1");
    rig.stock(Coord::new(3, 1, 2), "B3");
    let states = rig.store.states().unwrap();
    let mut coord = rig.coordinator();

    let parked = coord
        .good_move_with_blocking(90, Coord::new(1, 1, 2), Coord::new(1, 5, 2), &states)
        .unwrap();
    assert_eq!(
        parked,
        vec![Parking {
            blocker: Coord::new(3, 1, 2),
            staging: Coord::new(1, 3, 2)
        }]
    );
    let moves = rig.shuttle_moves();
    let tail: Vec<&str> = moves[moves.len() - 6..].iter().map(String::as_str).collect();
    assert_eq!(
        tail,
        vec![
            "move(3,1,2)",
            "good_move(1,3,2)",
            "move(1,1,2)",
            "good_move(1,5,2)",
            "move(1,3,2)",
            "good_move(3,1,2)",
        ]
    );
    assert!(moves.contains(&"relocate(6,3,2)".to_string()));
    assert_lift_guarded(&rig.events(), Coord::pre_lift(1));
    rig.with(|w| {
        assert!(w.pallets.contains(&Coord::new(1, 5, 2)));
        assert!(w.pallets.contains(&Coord::new(3, 1, 2)));
        assert!(!w.pallets.contains(&Coord::new(1, 1, 2)));
    });
}

#[test]
fn test_good_move_by_start_end_crosses_layer_first() {
    let rig = Rig::new(Coord::pre_lift(1));
    rig.stock(Coord::new(1, 1, 2), "P1");
    let mut coord = rig.coordinator();

    coord
        .good_move_by_start_end(90, Coord::new(1, 1, 2), Coord::new(1, 5, 2))
        .unwrap();
    let moves = rig.shuttle_moves();
    assert!(moves.contains(&"relocate(6,3,2)".to_string()));
    let tail: Vec<&str> = moves[moves.len() - 2..].iter().map(String::as_str).collect();
    assert_eq!(tail, vec!["move(1,1,2)", "good_move(1,5,2)"]);
    assert_lift_guarded(&rig.events(), Coord::pre_lift(1));
    assert_eq!(rig.events().last(), Some(&Event::ShuttleDisconnect));
    rig.with(|w| {
        assert_eq!(w.pallets.iter().copied().collect::<Vec<_>>(), vec![Coord::new(1, 5, 2)]);
    });
}

#[test]
fn test_good_move_by_start_end_rejects_different_layers() {
    let rig = Rig::new(Coord::pre_lift(2));
    rig.stock(Coord::new(1, 1, 2), "P1");
    let mut coord = rig.coordinator();
    let err = coord
        .good_move_by_start_end(90, Coord::new(1, 1, 2), Coord::new(2, 2, 3))
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::DifferentLayer);
    assert!(rig.events().is_empty());
}

#[test]
fn test_unobstructed_good_move_with_blocking_parks_nothing() {
    let rig = Rig::new(Coord::pre_lift(2));
    rig.stock(Coord::new(1, 1, 2), "P1");
    let states = rig.store.states().unwrap();
    let mut coord = rig.coordinator();

    let parked = coord
        .good_move_with_blocking(90, Coord::new(1, 1, 2), Coord::new(2, 5, 2), &states)
        .unwrap();
    assert!(parked.is_empty());
    assert_eq!(rig.shuttle_moves(), vec!["move(1,1,2)", "good_move(2,5,2)"]);
}

#[test]
fn test_good_move_rejects_different_layers() {
    let rig = Rig::new(Coord::pre_lift(2));
    rig.stock(Coord::new(1, 1, 2), "P1");
    let states = rig.store.states().unwrap();
    let mut coord = rig.coordinator();
    let err = coord
        .good_move_with_blocking(90, Coord::new(1, 1, 2), Coord::new(1, 1, 3), &states)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::DifferentLayer);
    assert!(rig.events().is_empty());
}

#[test]
fn test_move_car_rejects_other_layer() {
    let rig = Rig::new(Coord::new(2, 2, 1));
    let mut coord = rig.coordinator();
    let err = coord.move_car(5, Coord::new(1, 1, 2)).unwrap_err();
    assert_eq!(err.kind, ErrorKind::DifferentLayer);
    assert!(rig.events().iter().all(|e| !e.is_motion()));
}

#[test]
fn test_move_car_into_lift_reads_state_first() {
    let rig = Rig::new(Coord::new(2, 2, 1));
    let mut coord = rig.coordinator();
    assert_eq!(coord.move_car(5, Coord::lift(1)).unwrap(), Coord::lift(1));
    let events = rig.events();
    assert_lift_guarded(&events, Coord::new(2, 2, 1));
    assert_eq!(events.last(), Some(&Event::ShuttleDisconnect));
}

#[test]
fn test_move_car_on_layer_skips_plc() {
    let rig = Rig::new(Coord::new(2, 2, 1));
    let mut coord = rig.coordinator();
    coord.move_car(5, Coord::new(1, 5, 1)).unwrap();
    assert!(!rig.events().contains(&Event::PlcConnect));
    assert_eq!(rig.shuttle_moves(), vec!["move(1,5,1)"]);
}

#[test]
fn test_lift_move_reports_task() {
    let rig = Rig::new(Coord::new(2, 2, 1));
    let mut coord = rig.coordinator();
    let lift = coord.lift(33, 4).unwrap();
    assert_eq!((lift.task_no, lift.floor, lift.kind), (33, 4, LiftTaskKind::Idle));
    assert_eq!(
        rig.labels(),
        vec!["plc.connect", "plc.check", "lift(4)", "plc.disconnect", "shuttle.disconnect"]
    );
}

#[test]
fn test_qrcode_without_code() {
    let rig = Rig::new(Coord::new(2, 2, 1));
    let mut coord = rig.coordinator();
    assert_eq!(coord.qrcode().unwrap_err().kind, ErrorKind::NoCode);
    rig.with(|w| w.qr = Some("P42".to_string()));
    assert_eq!(coord.qrcode().unwrap(), "P42");
}

#[test]
fn test_cancel_stops_at_next_step() {
    let rig = Rig::new(Coord::new(2, 2, 1));
    let mut coord = rig.coordinator();
    coord.cancel_token().cancel();
    let err = coord.cross_layer(10, 3).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Canceled);
    assert!(rig.events().iter().all(|e| !e.is_motion()));
    assert_eq!(rig.events().last(), Some(&Event::ShuttleDisconnect));
}
