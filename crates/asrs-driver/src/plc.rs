//! 提升机与输送线控制器
//!
//! 所有动作都表达为对 DB12 的写入加上对 DB11 状态位的等待，地址见
//! [`asrs_protocol::plc_map`]。

use crate::board::StatusBoard;
use crate::device::PlcDevice;
use crate::error::DriverError;
use asrs_link::{PlcLink, PlcTransport};
use asrs_protocol::coord::FLOOR_COUNT;
use asrs_protocol::plc_map::{DB_STATUS, GATE, command, remote, status};
use asrs_protocol::{FloorSignal, LiftState, LiftTaskKind, Station};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// PLC 动作默认截止时间
pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(30);

/// 一次提升机移动的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LiftMove {
    /// 实际写入的任务号（防重放后可能已递增）
    pub task_no: u16,
    pub kind: LiftTaskKind,
    pub floor: u8,
}

/// 输送线复合流程
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConveyorRoute {
    /// 一层入口 → 提升机
    EntryToLift,
    /// 提升机 → 某层接驳线
    LiftToFloor(u8),
    /// 某层接驳线 → 提升机
    FloorToLift(u8),
    /// 提升机 → 出库口
    LiftToGate,
}

impl ConveyorRoute {
    /// 流程结束时应到位的站台
    pub fn destination(self) -> Station {
        match self {
            ConveyorRoute::EntryToLift | ConveyorRoute::FloorToLift(_) => Station::Lift,
            ConveyorRoute::LiftToFloor(n) => Station::Floor(n),
            ConveyorRoute::LiftToGate => Station::Man,
        }
    }
}

impl fmt::Display for ConveyorRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConveyorRoute::EntryToLift => write!(f, "entry->lift"),
            ConveyorRoute::LiftToFloor(n) => write!(f, "lift->floor {}", n),
            ConveyorRoute::FloorToLift(n) => write!(f, "floor {}->lift", n),
            ConveyorRoute::LiftToGate => write!(f, "lift->gate"),
        }
    }
}

fn check_floor(floor: u8) -> Result<(), DriverError> {
    if (1..=FLOOR_COUNT).contains(&floor) {
        Ok(())
    } else {
        Err(DriverError::InvalidInput(format!(
            "floor {} out of range 1..={}",
            floor, FLOOR_COUNT
        )))
    }
}

/// 防重放：与 PLC 记录的上一个任务号相同则递增（跳过 0）
pub fn next_task_no(intended: u16, last_seen: u16) -> u16 {
    if intended != last_seen {
        return intended;
    }
    match intended.wrapping_add(1) {
        0 => 1,
        n => n,
    }
}

/// 提升机与输送线控制器
pub struct PlcController<T: PlcTransport> {
    link: PlcLink<T>,
    action_timeout: Duration,
    board: Option<Arc<StatusBoard>>,
}

impl<T: PlcTransport> PlcController<T> {
    pub fn new(link: PlcLink<T>) -> Self {
        Self {
            link,
            action_timeout: DEFAULT_ACTION_TIMEOUT,
            board: None,
        }
    }

    pub fn with_action_timeout(mut self, timeout: Duration) -> Self {
        self.action_timeout = timeout;
        self
    }

    pub fn with_board(mut self, board: Arc<StatusBoard>) -> Self {
        self.board = Some(board);
        self
    }

    pub fn link(&self) -> &PlcLink<T> {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut PlcLink<T> {
        &mut self.link
    }

    pub fn action_timeout(&self) -> Duration {
        self.action_timeout
    }

    fn read_bit(&mut self, addr: asrs_protocol::BitAddr) -> Result<bool, DriverError> {
        self.link.read_bit(addr).map_err(DriverError::Plc)
    }

    fn write_u16(&mut self, addr: asrs_protocol::WordAddr, value: u16) -> Result<(), DriverError> {
        self.link.write_u16(addr, value).map_err(DriverError::Plc)
    }

    fn pulse(&mut self, addr: asrs_protocol::BitAddr, settle: bool) -> Result<(), DriverError> {
        self.link.pulse(addr, settle).map_err(DriverError::Plc)
    }

    fn wait_ready(&mut self, station: Station) -> Result<(), DriverError> {
        let addr = station.ready_bit();
        debug!("Waiting for pallet ready at {} ({})", station, addr);
        self.link
            .wait_bit(addr, true, self.action_timeout)
            .map_err(DriverError::Plc)
    }

    /// 写入站台的路由目标
    fn route(&mut self, from: Station, to: u16) -> Result<(), DriverError> {
        let target = from
            .route_target()
            .ok_or_else(|| DriverError::InvalidInput(format!("station {} has no route target", from)))?;
        debug!("Route {} -> {} via {}", from, to, target);
        self.write_u16(target, to)
    }

    fn station_code(station: Station) -> Result<u16, DriverError> {
        station
            .code()
            .ok_or_else(|| DriverError::InvalidInput(format!("station {} has no code", station)))
    }

    /// 指定站台是否到位（单次读取）
    pub fn is_pallet_ready(&mut self, station: Station) -> Result<bool, DriverError> {
        self.read_bit(station.ready_bit())
    }
}

impl<T: PlcTransport> PlcDevice for PlcController<T> {
    fn connect(&mut self) -> Result<(), DriverError> {
        self.link.connect().map_err(DriverError::Plc)
    }

    fn disconnect(&mut self) {
        self.link.disconnect();
    }

    fn lift_state(&mut self) -> Result<LiftState, DriverError> {
        let block = self
            .link
            .read_block(DB_STATUS, 0, status::SNAPSHOT_LEN)
            .map_err(DriverError::Plc)?;
        let state = LiftState::decode(&block)?;
        if let Some(board) = &self.board {
            board.record_lift(state);
        }
        Ok(state)
    }

    fn plc_checker(&mut self) -> Result<(), DriverError> {
        let state = self.lift_state()?;
        let remote_online = self.read_bit(remote::REMOTE_ONLINE)?;
        let conveyor_online = self.read_bit(remote::CONVEYOR_ONLINE)?;

        let mut failures = Vec::new();
        if state.fault {
            failures.push("lift fault");
        }
        if !state.auto_mode {
            failures.push("not in auto mode");
        }
        if !remote_online {
            failures.push("remote offline");
        }
        if !conveyor_online {
            failures.push("conveyor offline");
        }
        if failures.is_empty() {
            debug!("PLC check passed");
            Ok(())
        } else {
            warn!("PLC check failed: {}", failures.join(", "));
            Err(DriverError::PlcPrecondition(failures.join(", ")))
        }
    }

    fn lift_move_by_layer(&mut self, task_no: u16, floor: u8) -> Result<LiftMove, DriverError> {
        check_floor(floor)?;
        let state = self.lift_state()?;
        let task_no = next_task_no(task_no, state.last_task_no);
        let kind = state.task_kind().ok_or_else(|| {
            DriverError::IllegalLiftState(format!(
                "running={} idle={} no_cargo={} has_cargo={} has_car={}",
                u8::from(state.running),
                u8::from(state.idle),
                u8::from(state.no_cargo),
                u8::from(state.has_pallet),
                u8::from(state.has_car)
            ))
        })?;

        info!(
            "Lift task {} ({:?}): floor {} -> {}",
            task_no, kind, state.current_floor, floor
        );
        self.write_u16(command::TASK_TYPE, kind.into())?;
        self.write_u16(command::TASK_NO, task_no)?;
        self.write_u16(command::TARGET_FLOOR, u16::from(floor))?;
        self.pulse(command::TASK_START, false)?;

        self.link
            .wait_bit(status::RUNNING, false, self.action_timeout)
            .map_err(DriverError::Plc)?;
        self.pulse(command::TARGET_LAYER_ARRIVED, true)?;

        let arrived = self.lift_state()?;
        if arrived.current_floor != u16::from(floor) {
            return Err(DriverError::WrongFloor {
                expected: floor,
                actual: arrived.current_floor,
            });
        }
        Ok(LiftMove { task_no, kind, floor })
    }

    fn wait_lift_at(&mut self, floor: u8) -> Result<LiftState, DriverError> {
        check_floor(floor)?;
        let timing = *self.link.timing();
        let timeout = self.action_timeout;
        let start = Instant::now();
        let deadline = start + timeout;
        std::thread::sleep(timing.initial_grace.min(timeout));

        loop {
            let state = self.lift_state()?;
            if state.is_idle_at(floor) {
                debug!("Lift idle at floor {} after {:?}", floor, start.elapsed());
                return Ok(state);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(DriverError::Timeout {
                    what: format!("lift idle at floor {} (at {}, running={})", floor, state.current_floor, state.running),
                    timeout,
                });
            }
            std::thread::sleep(timing.poll_interval.min(deadline - now));
        }
    }

    fn convey(&mut self, route: ConveyorRoute) -> Result<(), DriverError> {
        info!("Conveyor {}", route);
        match route {
            ConveyorRoute::EntryToLift => {
                self.route(Station::Entry, Self::station_code(Station::Lift)?)?;
                self.pulse(command::ENTRY_FEED_COMPLETE, true)?;
            },
            ConveyorRoute::LiftToFloor(n) => {
                check_floor(n)?;
                self.route(Station::Lift, Self::station_code(Station::Floor(n))?)?;
            },
            ConveyorRoute::FloorToLift(n) => {
                check_floor(n)?;
                self.route(Station::Floor(n), Self::station_code(Station::Lift)?)?;
            },
            ConveyorRoute::LiftToGate => {
                self.pulse(command::TARGET_LAYER_ARRIVED, true)?;
                self.route(Station::Lift, GATE)?;
            },
        }
        self.wait_ready(route.destination())
    }

    fn pulse_floor_signal(&mut self, signal: FloorSignal, floor: u8) -> Result<(), DriverError> {
        check_floor(floor)?;
        let addr = signal.addr(floor)?;
        debug!("Pulse {} floor {} ({})", signal.name(), floor, addr);
        self.pulse(addr, signal.is_latched())
    }

    fn scan_qrcode(&mut self) -> Result<Option<String>, DriverError> {
        if !self.read_bit(status::SCAN_CODE_READY)? {
            return Ok(None);
        }
        let raw = self
            .link
            .read_block(DB_STATUS, status::QR_OFFSET, status::QR_LEN)
            .map_err(DriverError::Plc)?;
        let bytes: Vec<u8> = raw.into_iter().filter(|b| *b != 0).collect();
        let code = String::from_utf8_lossy(&bytes).trim().to_string();
        if code.is_empty() {
            return Ok(None);
        }
        debug!("Scanned {}", code);
        Ok(Some(code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimPlc, fast_plc_timing};
    use asrs_link::mock::PlcWrite;
    use asrs_protocol::BitAddr;

    fn controller(sim: &SimPlc) -> PlcController<asrs_link::mock::MemoryPlc> {
        let mut plc = PlcController::new(PlcLink::new(sim.transport()).with_timing(fast_plc_timing()))
            .with_action_timeout(Duration::from_millis(200));
        plc.connect().unwrap();
        plc
    }

    #[test]
    fn test_next_task_no() {
        assert_eq!(next_task_no(5, 4), 5);
        assert_eq!(next_task_no(5, 5), 6);
        assert_eq!(next_task_no(u16::MAX, u16::MAX), 1);
    }

    #[test]
    fn test_plc_checker() {
        let sim = SimPlc::healthy();
        let mut plc = controller(&sim);
        plc.plc_checker().unwrap();

        sim.handle().set_bit(status::FAULT, true);
        sim.handle().set_bit(remote::CONVEYOR_ONLINE, false);
        match plc.plc_checker() {
            Err(DriverError::PlcPrecondition(msg)) => {
                assert!(msg.contains("lift fault"));
                assert!(msg.contains("conveyor offline"));
                assert!(!msg.contains("remote offline"));
            },
            other => panic!("Expected PlcPrecondition, got {:?}", other),
        }
    }

    #[test]
    fn test_lift_move_writes_command_block() {
        let sim = SimPlc::healthy();
        let mut plc = controller(&sim);
        let moved = plc.lift_move_by_layer(21, 3).unwrap();
        assert_eq!(
            moved,
            LiftMove {
                task_no: 21,
                kind: LiftTaskKind::Idle,
                floor: 3
            }
        );

        let h = sim.handle();
        assert_eq!(h.with_memory(|m| m.read_u16(12, 0)), 4);
        assert_eq!(h.with_memory(|m| m.read_u16(12, 2)), 21);
        assert_eq!(h.with_memory(|m| m.read_u16(12, 4)), 3);
        assert_eq!(h.with_memory(|m| m.read_u16(11, 2)), 3);
        assert_eq!(h.bit_writes(command::TASK_START), vec![true, false]);
        assert_eq!(h.bit_writes(command::TARGET_LAYER_ARRIVED), vec![true, false]);
    }

    #[test]
    fn test_lift_move_anti_replay() {
        let sim = SimPlc::healthy();
        sim.handle().with_memory(|m| m.write_u16(11, 4, 21));
        let mut plc = controller(&sim);
        let moved = plc.lift_move_by_layer(21, 2).unwrap();
        assert_eq!(moved.task_no, 22);
    }

    #[test]
    fn test_lift_move_task_kind_follows_state() {
        let sim = SimPlc::healthy();
        sim.set_lift_load(true, true);
        let mut plc = controller(&sim);
        assert_eq!(plc.lift_move_by_layer(1, 2).unwrap().kind, LiftTaskKind::GoodAndCar);

        sim.set_lift_load(false, true);
        assert_eq!(plc.lift_move_by_layer(2, 3).unwrap().kind, LiftTaskKind::Car);
    }

    #[test]
    fn test_lift_move_illegal_state() {
        let sim = SimPlc::healthy();
        sim.handle().set_bit(status::RUNNING, true);
        let mut plc = controller(&sim);
        assert!(matches!(
            plc.lift_move_by_layer(1, 2),
            Err(DriverError::IllegalLiftState(_))
        ));
        // 未写入任何指令
        assert!(sim.handle().journal().is_empty());
    }

    #[test]
    fn test_lift_move_wrong_floor() {
        let sim = SimPlc::healthy();
        sim.handle().set_write_hook(|_, _| {});
        let mut plc = controller(&sim);
        assert!(matches!(
            plc.lift_move_by_layer(1, 4),
            Err(DriverError::WrongFloor { expected: 4, actual: 1 })
        ));
    }

    #[test]
    fn test_lift_move_rejects_bad_floor() {
        let sim = SimPlc::healthy();
        let mut plc = controller(&sim);
        assert!(matches!(plc.lift_move_by_layer(1, 5), Err(DriverError::InvalidInput(_))));
        assert!(matches!(plc.lift_move_by_layer(1, 0), Err(DriverError::InvalidInput(_))));
    }

    #[test]
    fn test_entry_to_lift() {
        let sim = SimPlc::healthy();
        let mut plc = controller(&sim);
        plc.convey(ConveyorRoute::EntryToLift).unwrap();

        let h = sim.handle();
        assert_eq!(h.with_memory(|m| m.read_u16(12, 20)), 1020);
        assert_eq!(h.bit_writes(command::ENTRY_FEED_COMPLETE), vec![true, false]);
        assert!(h.bit(Station::Lift.ready_bit()));
        assert!(plc.is_pallet_ready(Station::Lift).unwrap());
    }

    #[test]
    fn test_lift_to_floor_and_back() {
        let sim = SimPlc::healthy();
        let mut plc = controller(&sim);
        plc.convey(ConveyorRoute::LiftToFloor(2)).unwrap();
        assert_eq!(sim.handle().with_memory(|m| m.read_u16(12, 22)), 1040);
        assert!(sim.handle().bit(Station::Floor(2).ready_bit()));

        plc.convey(ConveyorRoute::FloorToLift(4)).unwrap();
        assert_eq!(sim.handle().with_memory(|m| m.read_u16(12, 30)), 1020);
    }

    #[test]
    fn test_lift_to_gate_pulses_arrival_first() {
        let sim = SimPlc::healthy();
        let mut plc = controller(&sim);
        plc.convey(ConveyorRoute::LiftToGate).unwrap();

        let journal = sim.handle().journal();
        let pulse_at = journal
            .iter()
            .position(|w| matches!(w, PlcWrite::Bit { addr, value: true } if *addr == command::TARGET_LAYER_ARRIVED))
            .unwrap();
        let route_at = journal
            .iter()
            .position(|w| matches!(w, PlcWrite::Bytes { db: 12, offset: 22, .. }))
            .unwrap();
        assert!(pulse_at < route_at);
        assert_eq!(sim.handle().with_memory(|m| m.read_u16(12, 22)), GATE);
        assert!(sim.handle().bit(Station::Man.ready_bit()));
    }

    #[test]
    fn test_conveyor_wait_times_out() {
        let sim = SimPlc::healthy();
        sim.handle().set_write_hook(|_, _| {});
        let mut plc = controller(&sim);
        let err = plc.convey(ConveyorRoute::LiftToFloor(3)).unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_floor_signal_pulses() {
        let sim = SimPlc::healthy();
        let mut plc = controller(&sim);
        plc.pulse_floor_signal(FloorSignal::PickInProgress, 2).unwrap();
        plc.pulse_floor_signal(FloorSignal::FeedComplete, 4).unwrap();
        let h = sim.handle();
        assert_eq!(h.bit_writes(BitAddr::new(12, 16, 1)), vec![true, false]);
        assert_eq!(h.bit_writes(BitAddr::new(12, 10, 3)), vec![true, false]);
        assert!(!h.bit(BitAddr::new(12, 10, 3)));
    }

    #[test]
    fn test_scan_qrcode() {
        let sim = SimPlc::healthy();
        let mut plc = controller(&sim);
        assert_eq!(plc.scan_qrcode().unwrap(), None);

        sim.present_code("P1001");
        assert_eq!(plc.scan_qrcode().unwrap().as_deref(), Some("P1001"));
    }

    #[test]
    fn test_wait_lift_at() {
        let sim = SimPlc::healthy();
        let mut plc = controller(&sim);
        let state = plc.wait_lift_at(1).unwrap();
        assert_eq!(state.current_floor, 1);
        assert!(plc.wait_lift_at(2).unwrap_err().is_timeout());
    }

    #[test]
    fn test_lift_state_recorded_on_board() {
        let sim = SimPlc::healthy();
        let board = StatusBoard::new();
        let mut plc = controller(&sim).with_board(board.clone());
        plc.lift_state().unwrap();
        assert_eq!(board.lift().unwrap().value.current_floor, 1);
    }
}
