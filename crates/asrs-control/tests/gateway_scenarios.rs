//! 网关：操作锁、库位提交与前置条件

mod common;

use asrs_control::{Command, ErrorKind, LocationStore, LockState};
use asrs_planner::CellState;
use asrs_protocol::Coord;
use common::{BASE, Event, Rig, assert_subsequence};
use crossbeam_channel::bounded;
use serde_json::json;
use std::thread;
use std::time::Duration;

fn inband(cell: Coord, pallet: &str) -> Command {
    Command::TaskInbandWithBlocking {
        target_cell: cell,
        pallet_id: pallet.to_string(),
    }
}

fn outband(cell: Coord, pallet: &str) -> Command {
    Command::TaskOutbandWithBlocking {
        target_cell: cell,
        pallet_id: pallet.to_string(),
    }
}

#[test]
fn test_inbound_commits_pallet() {
    let rig = Rig::new(Coord::lift(1));
    rig.present_at_entry("P1001");
    let gateway = rig.gateway();

    let response = gateway.execute(inband(Coord::new(1, 1, 2), "P1001"));
    assert!(response.success, "{}", response.message);

    let record = rig.store.find_pallet("P1001").unwrap().unwrap();
    assert_eq!(record.location, Coord::new(1, 1, 2));
    assert_eq!(record.status, CellState::Occupied);
    assert_subsequence(
        &rig.labels(),
        &[
            "plc.connect",
            "scan",
            "plc.disconnect",
            "plc.connect",
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
    assert_eq!(gateway.lock().state(), LockState::Released);
}

#[test]
fn test_task_numbers_drawn_per_command() {
    let rig = Rig::new(Coord::new(2, 2, 1));
    let gateway = rig.gateway();
    assert!(gateway.execute(Command::Lift { target_layer: 2 }).success);
    assert!(gateway.execute(Command::Lift { target_layer: 3 }).success);
    let tasks: Vec<u16> = rig
        .events()
        .iter()
        .filter_map(|e| match e {
            Event::LiftMove { task_no, .. } => Some(*task_no),
            _ => None,
        })
        .collect();
    assert_eq!(tasks, vec![u16::from(BASE), u16::from(BASE) + 32]);
}

#[test]
fn test_outbound_releases_cell() {
    let rig = Rig::new(Coord::pre_lift(2));
    rig.stock(Coord::new(1, 1, 2), "P1");
    rig.stock(Coord::new(2, 1, 2), "B2");
    rig.stock(Coord::new(3, 1, 2), "B3");
    let gateway = rig.gateway();

    let response = gateway.execute(outband(Coord::new(1, 1, 2), "P1"));
    assert!(response.success, "{}", response.message);
    assert!(rig.store.find_pallet("P1").unwrap().is_none());
    assert_eq!(rig.store.record(Coord::new(1, 1, 2)).unwrap().status, CellState::Free);
    assert_eq!(
        rig.store.find_pallet("B2").unwrap().unwrap().location,
        Coord::new(2, 1, 2)
    );
    assert_eq!(
        rig.store.find_pallet("B3").unwrap().unwrap().location,
        Coord::new(3, 1, 2)
    );
}

#[test]
fn test_failed_outbound_keeps_store() {
    let rig = Rig::new(Coord::pre_lift(2));
    rig.stock(Coord::new(1, 1, 2), "P1");
    rig.stock(Coord::new(3, 1, 2), "B3");
    rig.with(|w| w.fail = Some("convey(lift->gate)".to_string()));
    let gateway = rig.gateway();

    let response = gateway.execute(outband(Coord::new(1, 1, 2), "P1"));
    assert!(!response.success);
    assert_eq!(response.kind, Some(ErrorKind::Timeout));
    assert!(response.message.contains("parked blockers: 3,1,2 -> 1,3,2"));
    assert_eq!(
        rig.store.find_pallet("P1").unwrap().unwrap().location,
        Coord::new(1, 1, 2)
    );
    assert_eq!(gateway.lock().state(), LockState::Released);
}

#[test]
fn test_already_stored_touches_no_device() {
    let rig = Rig::new(Coord::pre_lift(2));
    rig.stock(Coord::new(1, 1, 2), "P1");
    rig.present_at_entry("P1");
    let gateway = rig.gateway();

    let response = gateway.execute(inband(Coord::new(2, 2, 2), "P1"));
    assert_eq!(response.kind, Some(ErrorKind::PalletAlreadyStored));
    assert!(rig.events().is_empty());
}

#[test]
fn test_pallet_lookup_errors() {
    let rig = Rig::new(Coord::pre_lift(2));
    rig.stock(Coord::new(1, 1, 2), "P1");
    let gateway = rig.gateway();

    let response = gateway.execute(outband(Coord::new(1, 2, 2), "P1"));
    assert_eq!(response.kind, Some(ErrorKind::PalletCellMismatch));
    let response = gateway.execute(outband(Coord::new(1, 1, 2), "PX"));
    assert_eq!(response.kind, Some(ErrorKind::PalletNotFound));
    let response = gateway.execute(Command::GoodMoveWithBlocking {
        pallet_id: "P1".to_string(),
        source: Coord::new(1, 1, 2),
        target: Coord::new(1, 1, 3),
    });
    assert_eq!(response.kind, Some(ErrorKind::DifferentLayer));
    assert!(rig.events().is_empty());
}

#[test]
fn test_qr_mismatch_moves_nothing() {
    let rig = Rig::new(Coord::pre_lift(2));
    rig.present_at_entry("P9");
    let gateway = rig.gateway();

    let response = gateway.execute(inband(Coord::new(1, 1, 2), "P1"));
    assert_eq!(response.kind, Some(ErrorKind::QrMismatch));
    assert!(rig.events().contains(&Event::Scan));
    assert!(rig.events().iter().all(|e| !e.is_motion()));
    assert!(rig.store.find_pallet("P1").unwrap().is_none());
}

#[test]
fn test_good_move_updates_store() {
    let rig = Rig::new(Coord::pre_lift(2));
    rig.stock(Coord::new(1, 1, 2), "P1");
    let gateway = rig.gateway();

    let response = gateway.execute(Command::GoodMoveWithBlocking {
        pallet_id: "P1".to_string(),
        source: Coord::new(1, 1, 2),
        target: Coord::new(2, 5, 2),
    });
    assert!(response.success, "{}", response.message);
    assert_eq!(
        rig.store.find_pallet("P1").unwrap().unwrap().location,
        Coord::new(2, 5, 2)
    );
    assert_eq!(rig.shuttle_moves(), vec!["move(1,1,2)", "good_move(2,5,2)"]);
}

#[test]
fn test_move_goods_follows_pallet() {
    let rig = Rig::new(Coord::new(1, 1, 2));
    rig.stock(Coord::new(1, 1, 2), "P1");
    let gateway = rig.gateway();

    let response = gateway.execute(Command::MoveGoods {
        target: Coord::new(2, 2, 2),
    });
    assert!(response.success, "{}", response.message);
    assert_eq!(response.data, Some(json!({ "from": "1,1,2", "to": "2,2,2" })));
    assert_eq!(
        rig.store.find_pallet("P1").unwrap().unwrap().location,
        Coord::new(2, 2, 2)
    );

    let response = gateway.execute(Command::MoveGoods {
        target: Coord::new(4, 2, 2),
    });
    assert_eq!(response.kind, Some(ErrorKind::PreconditionFailed));
}

#[test]
fn test_read_only_commands() {
    let rig = Rig::new(Coord::new(2, 2, 1));
    let gateway = rig.gateway();

    let response = gateway.execute(Command::GetCarLocation);
    assert_eq!(response.data, Some(json!("2,2,1")));
    let response = gateway.execute(Command::GetCarBattery);
    assert_eq!(response.data, Some(json!(87)));
    let response = gateway.execute(Command::GetLiftState);
    assert!(response.success);
    assert_eq!(response.data.unwrap()["current_floor"], json!(1));

    let response = gateway.execute(Command::ReadLocations);
    assert_eq!(response.data.unwrap().as_array().unwrap().len(), 104);
    assert_eq!(gateway.execute(Command::Qrcode).kind, Some(ErrorKind::NoCode));
    assert_eq!(
        gateway.execute(Command::Lift { target_layer: 0 }).kind,
        Some(ErrorKind::PreconditionFailed)
    );
}

#[test]
fn test_nearest_free_cell_avoids_path() {
    let rig = Rig::new(Coord::new(2, 2, 1));
    rig.stock(Coord::new(3, 2, 1), "P1");
    let gateway = rig.gateway();

    let response = gateway.execute(Command::NearestFreeCell {
        source: Coord::new(1, 1, 1),
        target: Coord::pre_lift(1),
        anchor: Coord::new(3, 1, 1),
    });
    assert!(response.success, "{}", response.message);
    let cell: Coord = response.data.unwrap().as_str().unwrap().parse().unwrap();
    let path = rig.planner.shortest_path(Coord::new(1, 1, 1), Coord::pre_lift(1)).unwrap();
    assert!(!path.contains(&cell));
    assert_ne!(cell, Coord::new(3, 2, 1));
    assert_eq!(rig.store.record(cell).unwrap().status, CellState::Free);
    assert!(rig.events().is_empty());
}

#[test]
fn test_second_command_is_busy() {
    let rig = Rig::new(Coord::new(2, 2, 1));
    let (release, gate) = bounded(1);
    let (entered_tx, entered) = bounded(1);
    let gateway = rig.gateway();
    assert!(gateway.execute(Command::GetCarLocation).success);
    rig.clear_trace();
    rig.with(|w| {
        w.gate = Some(gate);
        w.entered = Some(entered_tx);
    });

    thread::scope(|s| {
        let first = s.spawn(|| gateway.execute(Command::Lift { target_layer: 3 }));
        entered.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(gateway.lock().state(), LockState::InProgress);
        assert_eq!(gateway.lock().holder(), Some("lift"));

        let second = gateway.execute(Command::CrossLayer { target_layer: 2 });
        assert_eq!(second.kind, Some(ErrorKind::Busy));
        assert!(second.message.contains("lift"));

        // 只读查询改由看板应答
        let location = gateway.execute(Command::GetCarLocation);
        assert_eq!(location.data, Some(json!("2,2,1")));
        let lift = gateway.execute(Command::GetLiftState);
        assert_eq!(lift.kind, Some(ErrorKind::Busy));

        release.send(()).unwrap();
        assert!(first.join().unwrap().success);
    });

    assert_eq!(
        rig.labels(),
        vec!["plc.connect", "plc.check", "lift(3)", "plc.disconnect", "shuttle.disconnect"]
    );
    assert_eq!(gateway.lock().state(), LockState::Released);
    assert!(gateway.execute(Command::CrossLayer { target_layer: 2 }).success);
}

#[test]
fn test_cancel_in_flight() {
    let rig = Rig::new(Coord::new(2, 2, 1));
    let (release, gate) = bounded(1);
    let (entered_tx, entered) = bounded(1);
    rig.with(|w| {
        w.gate = Some(gate);
        w.entered = Some(entered_tx);
    });
    let gateway = rig.gateway();

    thread::scope(|s| {
        let first = s.spawn(|| gateway.execute(Command::CrossLayer { target_layer: 3 }));
        entered.recv_timeout(Duration::from_secs(5)).unwrap();
        gateway.cancel();
        release.send(()).unwrap();
        let response = first.join().unwrap();
        assert_eq!(response.kind, Some(ErrorKind::Canceled));
    });

    assert!(rig.events().iter().all(|e| !e.is_motion()));
    assert_eq!(rig.events().last(), Some(&Event::ShuttleDisconnect));
    assert_eq!(gateway.lock().state(), LockState::Released);

    let retry = gateway.execute(Command::CrossLayer { target_layer: 3 });
    assert!(retry.success, "{}", retry.message);
    assert_eq!(rig.with(|w| w.shuttle), Coord::pre_lift(3));
}

#[test]
fn test_shutdown_refuses_new_commands() {
    let rig = Rig::new(Coord::new(2, 2, 1));
    let gateway = rig.gateway();
    assert!(gateway.execute(Command::GetCarLocation).success);
    rig.clear_trace();

    assert!(gateway.shutdown());
    assert!(gateway.is_closing());
    assert_eq!(rig.labels(), vec!["plc.disconnect", "shuttle.disconnect"]);

    let response = gateway.execute(Command::MoveCar {
        target: Coord::new(1, 1, 1),
    });
    assert_eq!(response.kind, Some(ErrorKind::Canceled));
    assert_eq!(
        gateway.execute(Command::GetCarLocation).kind,
        Some(ErrorKind::Canceled)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_async_facade() {
    let rig = Rig::new(Coord::new(2, 2, 1));
    let gateway = asrs_control::AsyncGateway::new(rig.gateway());

    let (a, b) = tokio::join!(
        gateway.execute(Command::GetCarLocation),
        gateway.execute(Command::ReadLocations)
    );
    assert_eq!(a.data, Some(json!("2,2,1")));
    assert!(b.success);

    let moved = gateway
        .execute(Command::MoveCar {
            target: Coord::new(1, 5, 1),
        })
        .await;
    assert_eq!(moved.data, Some(json!("1,5,1")));
    assert!(gateway.shutdown().await);
}
