//! 记录型设备
//!
//! 车辆与 PLC 共享一个小型仓库模型：托盘位置、轿厢位置与载荷、入口托盘。
//! 每次设备调用都追加一条 [`Event`]，动作违反物理约束时返回驱动错误。

#![allow(dead_code)]

use asrs_control::{CommandGateway, DeviceCoordinator, LocationStore, MemoryLocationStore, TaskNumbers};
use asrs_driver::{ConveyorRoute, DriverError, LiftMove, PlcDevice, ShuttleDevice, StatusBoard, next_task_no};
use asrs_planner::{GridMap, PathPlanner};
use asrs_protocol::{Coord, FloorSignal, HeartbeatStatus, LiftState, LiftTaskKind, ShuttleStatus};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// 网关测试的固定任务号起点
pub const BASE: u8 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    PlcConnect,
    PlcDisconnect,
    ShuttleDisconnect,
    Checker,
    LiftState { floor: u8, idle: bool },
    LiftMove { task_no: u16, floor: u8, kind: LiftTaskKind },
    WaitLift(u8),
    Convey(ConveyorRoute),
    Signal(FloorSignal, u8),
    Scan,
    Move { task_no: u8, target: Coord },
    GoodMove { task_no: u8, target: Coord },
    Relocate { task_no: u8, coord: Coord },
}

impl Event {
    pub fn label(&self) -> String {
        match self {
            Event::PlcConnect => "plc.connect".to_string(),
            Event::PlcDisconnect => "plc.disconnect".to_string(),
            Event::ShuttleDisconnect => "shuttle.disconnect".to_string(),
            Event::Checker => "plc.check".to_string(),
            Event::LiftState { floor, .. } => format!("state({})", floor),
            Event::LiftMove { floor, .. } => format!("lift({})", floor),
            Event::WaitLift(floor) => format!("wait_lift({})", floor),
            Event::Convey(route) => format!("convey({})", route),
            Event::Signal(signal, floor) => format!("{}({})", signal.name(), floor),
            Event::Scan => "scan".to_string(),
            Event::Move { target, .. } => format!("move({})", target),
            Event::GoodMove { target, .. } => format!("good_move({})", target),
            Event::Relocate { coord, .. } => format!("relocate({})", coord),
        }
    }

    pub fn is_motion(&self) -> bool {
        matches!(
            self,
            Event::Move { .. } | Event::GoodMove { .. } | Event::Relocate { .. } | Event::LiftMove { .. } | Event::Convey(_)
        )
    }

    pub fn is_plc(&self) -> bool {
        !matches!(
            self,
            Event::ShuttleDisconnect | Event::Move { .. } | Event::GoodMove { .. } | Event::Relocate { .. }
        )
    }
}

/// 仓库模型
pub struct World {
    pub shuttle: Coord,
    pub car_in_lift: bool,
    pub lift_floor: u8,
    pub lift_busy: bool,
    pub lift_cargo: bool,
    pub last_task_no: u16,
    pub pallets: BTreeSet<Coord>,
    pub entry_pallet: bool,
    pub delivered: usize,
    pub qr: Option<String>,
    pub battery: u8,
    /// 标签与之相同的动作返回超时
    pub fail: Option<String>,
    /// 前置检查时先通知 `entered`，再阻塞到 `gate` 收到消息
    pub gate: Option<Receiver<()>>,
    pub entered: Option<Sender<()>>,
    pub trace: Vec<Event>,
}

impl World {
    fn record(&mut self, event: Event) -> Result<(), DriverError> {
        let label = event.label();
        self.trace.push(event);
        if self.fail.as_deref() == Some(label.as_str()) {
            return Err(DriverError::Timeout {
                what: label,
                timeout: Duration::from_secs(1),
            });
        }
        Ok(())
    }

    fn lift_snapshot(&self) -> LiftState {
        LiftState {
            current_floor: u16::from(self.lift_floor),
            running: false,
            idle: !self.lift_busy,
            no_cargo: !self.lift_cargo,
            has_pallet: self.lift_cargo,
            has_car: self.car_in_lift,
            fault: false,
            auto_mode: true,
            last_task_no: self.last_task_no,
            pallet_ready: 0,
        }
    }
}

fn conveyor_stuck(route: ConveyorRoute) -> DriverError {
    DriverError::Timeout {
        what: format!("conveyor {}", route),
        timeout: Duration::from_secs(1),
    }
}

pub struct MockShuttle {
    world: Arc<Mutex<World>>,
    planner: Arc<PathPlanner>,
}

impl MockShuttle {
    fn travel(&self, world: &mut World, target: Coord, carrying: bool) -> Result<(), DriverError> {
        let from = world.shuttle;
        if world.car_in_lift && from.z != world.lift_floor {
            return Err(DriverError::IllegalLiftState(format!(
                "shuttle reports {} but the car is at floor {}",
                from, world.lift_floor
            )));
        }
        if target.is_lift_cell() && (world.lift_floor != target.z || world.lift_busy) {
            return Err(DriverError::IllegalLiftState(format!(
                "drove into the shaft at {}, car at floor {}",
                target, world.lift_floor
            )));
        }
        if target.z != from.z {
            return Err(DriverError::InvalidInput(format!("{} and {} are on different floors", from, target)));
        }
        let path = self.planner.shortest_path(from, target)?;
        if carrying {
            if !world.pallets.contains(&from) {
                return Err(DriverError::UnexpectedResponse(format!("no pallet at {}", from)));
            }
            let inner = path.iter().skip(1).filter(|c| **c != target);
            if let Some(cell) = inner.chain(std::iter::once(&target)).find(|c| world.pallets.contains(*c)) {
                return Err(DriverError::UnexpectedResponse(format!(
                    "pallet at {} blocks {} -> {}",
                    cell, from, target
                )));
            }
            world.pallets.remove(&from);
            world.pallets.insert(target);
        }
        world.shuttle = target;
        world.car_in_lift = target.is_lift_cell();
        Ok(())
    }
}

impl ShuttleDevice for MockShuttle {
    fn connect(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    fn disconnect(&mut self) {
        self.world.lock().trace.push(Event::ShuttleDisconnect);
    }

    fn heartbeat(&mut self) -> Result<HeartbeatStatus, DriverError> {
        let world = self.world.lock();
        Ok(HeartbeatStatus {
            cmd_no: 0,
            result: 0,
            position: world.shuttle,
            segment_no: 0,
            barcode: 0,
            car_status: ShuttleStatus::Ready,
            pallet_status: 0,
            reverse_status: 0,
            drive_direction: 0,
            status_desc: 0,
            have_pallet: world.pallets.contains(&world.shuttle),
            driver_warning: false,
            power: Some(world.battery),
        })
    }

    fn battery(&mut self) -> Result<u8, DriverError> {
        Ok(self.world.lock().battery)
    }

    fn relocate(&mut self, task_no: u8, coord: Coord) -> Result<(), DriverError> {
        let mut world = self.world.lock();
        world.record(Event::Relocate { task_no, coord })?;
        if !world.car_in_lift || !coord.is_lift_cell() || coord.z != world.lift_floor {
            return Err(DriverError::InvalidInput(format!("cannot relocate to {}", coord)));
        }
        world.shuttle = coord;
        Ok(())
    }

    fn move_to(&mut self, task_no: u8, target: Coord) -> Result<(), DriverError> {
        let mut world = self.world.lock();
        world.record(Event::Move { task_no, target })?;
        self.travel(&mut world, target, false)
    }

    fn good_move(&mut self, task_no: u8, target: Coord) -> Result<(), DriverError> {
        let mut world = self.world.lock();
        world.record(Event::GoodMove { task_no, target })?;
        self.travel(&mut world, target, true)
    }

    fn wait_arrived(&mut self, target: Coord, timeout: Duration) -> Result<(), DriverError> {
        let world = self.world.lock();
        if world.shuttle == target {
            Ok(())
        } else {
            Err(DriverError::Timeout {
                what: format!("arrival at {} (at {})", target, world.shuttle),
                timeout,
            })
        }
    }

    fn action_timeout(&self) -> Duration {
        Duration::from_secs(1)
    }
}

pub struct MockPlc {
    world: Arc<Mutex<World>>,
}

impl PlcDevice for MockPlc {
    fn connect(&mut self) -> Result<(), DriverError> {
        self.world.lock().trace.push(Event::PlcConnect);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.world.lock().trace.push(Event::PlcDisconnect);
    }

    fn lift_state(&mut self) -> Result<LiftState, DriverError> {
        let mut world = self.world.lock();
        let state = world.lift_snapshot();
        let (floor, idle) = (world.lift_floor, !world.lift_busy);
        world.record(Event::LiftState { floor, idle })?;
        Ok(state)
    }

    fn plc_checker(&mut self) -> Result<(), DriverError> {
        let (entered, gate) = {
            let mut world = self.world.lock();
            world.record(Event::Checker)?;
            (world.entered.take(), world.gate.take())
        };
        if let Some(entered) = entered {
            let _ = entered.send(());
        }
        if let Some(gate) = gate {
            let _ = gate.recv();
        }
        Ok(())
    }

    fn lift_move_by_layer(&mut self, task_no: u16, floor: u8) -> Result<LiftMove, DriverError> {
        let mut world = self.world.lock();
        let state = world.lift_snapshot();
        let kind = state
            .task_kind()
            .ok_or_else(|| DriverError::IllegalLiftState("no task kind for lift state".to_string()))?;
        let task_no = next_task_no(task_no, world.last_task_no);
        world.record(Event::LiftMove { task_no, floor, kind })?;
        world.last_task_no = task_no;
        world.lift_floor = floor;
        Ok(LiftMove { task_no, kind, floor })
    }

    fn wait_lift_at(&mut self, floor: u8) -> Result<LiftState, DriverError> {
        let mut world = self.world.lock();
        world.record(Event::WaitLift(floor))?;
        let state = world.lift_snapshot();
        if state.is_idle_at(floor) {
            Ok(state)
        } else {
            Err(DriverError::Timeout {
                what: format!("lift idle at floor {}", floor),
                timeout: Duration::from_secs(1),
            })
        }
    }

    fn convey(&mut self, route: ConveyorRoute) -> Result<(), DriverError> {
        let mut world = self.world.lock();
        world.record(Event::Convey(route))?;
        match route {
            ConveyorRoute::EntryToLift => {
                if world.lift_floor != 1 || !world.entry_pallet || world.lift_cargo {
                    return Err(conveyor_stuck(route));
                }
                world.entry_pallet = false;
                world.lift_cargo = true;
            },
            ConveyorRoute::LiftToFloor(n) => {
                if world.lift_floor != n || !world.lift_cargo || !world.pallets.insert(Coord::pre_lift(n)) {
                    return Err(conveyor_stuck(route));
                }
                world.lift_cargo = false;
            },
            ConveyorRoute::FloorToLift(n) => {
                if world.lift_floor != n || world.lift_cargo || !world.pallets.remove(&Coord::pre_lift(n)) {
                    return Err(conveyor_stuck(route));
                }
                world.lift_cargo = true;
            },
            ConveyorRoute::LiftToGate => {
                if world.lift_floor != 1 || !world.lift_cargo {
                    return Err(conveyor_stuck(route));
                }
                world.lift_cargo = false;
                world.delivered += 1;
            },
        }
        Ok(())
    }

    fn pulse_floor_signal(&mut self, signal: FloorSignal, floor: u8) -> Result<(), DriverError> {
        self.world.lock().record(Event::Signal(signal, floor))
    }

    fn scan_qrcode(&mut self) -> Result<Option<String>, DriverError> {
        let mut world = self.world.lock();
        world.record(Event::Scan)?;
        Ok(world.qr.clone())
    }
}

pub type MockGateway = CommandGateway<MockShuttle, MockPlc>;

/// 一套共享模型的设备、库位存储与规划器
pub struct Rig {
    pub world: Arc<Mutex<World>>,
    pub planner: Arc<PathPlanner>,
    pub store: Arc<MemoryLocationStore>,
}

impl Rig {
    /// 车辆停在 `shuttle`，提升机空载停在一层
    pub fn new(shuttle: Coord) -> Self {
        let map = GridMap::warehouse().unwrap();
        let store = Arc::new(MemoryLocationStore::new(&map));
        let world = World {
            shuttle,
            car_in_lift: shuttle.is_lift_cell() && shuttle.z == 1,
            lift_floor: 1,
            lift_busy: false,
            lift_cargo: false,
            last_task_no: 0,
            pallets: BTreeSet::new(),
            entry_pallet: false,
            delivered: 0,
            qr: None,
            battery: 87,
            fail: None,
            gate: None,
            entered: None,
            trace: Vec::new(),
        };
        Self {
            world: Arc::new(Mutex::new(world)),
            planner: Arc::new(PathPlanner::new(map)),
            store,
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut World) -> R) -> R {
        f(&mut self.world.lock())
    }

    /// 在库位存储与仓库模型中同时放一个托盘
    pub fn stock(&self, cell: Coord, pallet_id: &str) {
        self.store.store_pallet(cell, Some(pallet_id)).unwrap();
        self.world.lock().pallets.insert(cell);
    }

    /// 入口放一个带条码的托盘
    pub fn present_at_entry(&self, code: &str) {
        let mut world = self.world.lock();
        world.entry_pallet = true;
        world.qr = Some(code.to_string());
    }

    pub fn devices(&self) -> (MockShuttle, MockPlc) {
        (
            MockShuttle {
                world: self.world.clone(),
                planner: self.planner.clone(),
            },
            MockPlc {
                world: self.world.clone(),
            },
        )
    }

    pub fn coordinator(&self) -> DeviceCoordinator<MockShuttle, MockPlc> {
        let (shuttle, plc) = self.devices();
        DeviceCoordinator::new(shuttle, plc, self.planner.clone())
    }

    pub fn gateway(&self) -> MockGateway {
        self.gateway_from(self.coordinator())
    }

    pub fn gateway_from(&self, coordinator: DeviceCoordinator<MockShuttle, MockPlc>) -> MockGateway {
        let store: Arc<dyn LocationStore> = self.store.clone();
        CommandGateway::new(coordinator, store, StatusBoard::new())
            .with_task_numbers(TaskNumbers::starting_at(BASE))
            .with_shutdown_timeout(Duration::from_secs(2))
    }

    pub fn events(&self) -> Vec<Event> {
        self.world.lock().trace.clone()
    }

    pub fn labels(&self) -> Vec<String> {
        self.events().iter().map(Event::label).collect()
    }

    /// 车辆动作的标签序列
    pub fn shuttle_moves(&self) -> Vec<String> {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::Move { .. } | Event::GoodMove { .. } | Event::Relocate { .. }))
            .map(Event::label)
            .collect()
    }

    pub fn clear_trace(&self) {
        self.world.lock().trace.clear();
    }
}

/// `expected` 按顺序出现在 `labels` 中（可以不连续）
pub fn assert_subsequence(labels: &[String], expected: &[&str]) {
    let mut rest = labels.iter();
    for want in expected {
        assert!(
            rest.any(|l| l == want),
            "'{}' missing or out of order in {:#?}",
            want,
            labels
        );
    }
}

/// 每次进出轿厢的车辆动作之前，紧邻一次读到轿厢空闲停在该层的状态读取
pub fn assert_lift_guarded(events: &[Event], start: Coord) {
    let mut position = start;
    for (i, event) in events.iter().enumerate() {
        match event {
            Event::Move { target, .. } | Event::GoodMove { target, .. } => {
                let lift_cell = if target.is_lift_cell() {
                    Some(*target)
                } else if position.is_lift_cell() && *target != position {
                    Some(position)
                } else {
                    None
                };
                if let Some(cell) = lift_cell {
                    assert!(
                        i > 0
                            && events[i - 1]
                                == Event::LiftState {
                                    floor: cell.z,
                                    idle: true
                                },
                        "{} at #{} not preceded by an idle lift read at floor {}: {:#?}",
                        event.label(),
                        i,
                        cell.z,
                        events
                    );
                }
                position = *target;
            },
            Event::Relocate { coord, .. } => position = *coord,
            _ => {},
        }
    }
}
