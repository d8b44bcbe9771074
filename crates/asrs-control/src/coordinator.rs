//! 设备协调器
//!
//! 把穿梭车与提升机/输送线的原子动作编排成复合动作：换层、入库、出库、
//! 带阻挡处理的搬运。协调器只依赖 [`ShuttleDevice`] / [`PlcDevice`]，
//! 操作锁由上层网关持有。
//!
//! # 安全约束
//!
//! 任何驶向 `(6,3,z)` 或从 `(6,3,z)` 驶出的车辆指令之前，都必须紧接一次 PLC
//! 状态读取，确认轿厢停在 `z` 层且空闲。
//!
//! # 会话
//!
//! PLC 与车辆会话按复合动作建立，动作结束（无论成败）时断开。

use crate::error::{CommandError, ErrorKind};
use crate::lock::CancelToken;
use crate::task_no::TaskSeq;
use asrs_driver::{ConveyorRoute, LiftMove, PlcDevice, ShuttleDevice};
use asrs_planner::{CellState, PathPlanner, StateMap};
use asrs_protocol::coord::{FLOOR_COUNT, LIFT_Y, STAGING_XS};
use asrs_protocol::{Coord, FloorSignal, HeartbeatStatus, LiftState};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info};

/// 一个被临时挪开的阻挡托盘
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Parking {
    pub blocker: Coord,
    pub staging: Coord,
}

impl fmt::Display for Parking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.blocker, self.staging)
    }
}

fn describe(parked: &[Parking]) -> String {
    parked.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(", ")
}

/// 楼层范围检查
pub fn check_layer(layer: u8) -> Result<(), CommandError> {
    if (1..=FLOOR_COUNT).contains(&layer) {
        Ok(())
    } else {
        Err(CommandError::precondition(format!(
            "layer {} out of range 1..={}",
            layer, FLOOR_COUNT
        )))
    }
}

/// 设备协调器
pub struct DeviceCoordinator<S, P> {
    shuttle: S,
    plc: P,
    planner: Arc<PathPlanner>,
    staging: Vec<[u8; 2]>,
    cancel: CancelToken,
}

impl<S: ShuttleDevice, P: PlcDevice> DeviceCoordinator<S, P> {
    pub fn new(shuttle: S, plc: P, planner: Arc<PathPlanner>) -> Self {
        Self {
            shuttle,
            plc,
            planner,
            staging: STAGING_XS.iter().map(|x| [*x, LIFT_Y]).collect(),
            cancel: CancelToken::new(),
        }
    }

    /// 每层暂存位的 `[x, y]` 列表，顺序即使用顺序
    pub fn with_staging(mut self, staging: Vec<[u8; 2]>) -> Self {
        self.staging = staging;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn planner(&self) -> &Arc<PathPlanner> {
        &self.planner
    }

    pub fn shuttle_mut(&mut self) -> &mut S {
        &mut self.shuttle
    }

    pub fn plc_mut(&mut self) -> &mut P {
        &mut self.plc
    }

    /// 断开所有会话
    pub fn close(&mut self) {
        self.plc.disconnect();
        self.shuttle.disconnect();
    }

    pub fn staging_cells(&self, floor: u8) -> Vec<Coord> {
        self.staging.iter().map(|[x, y]| Coord::new(*x, *y, floor)).collect()
    }

    // ------------------------------------------------------------------
    // 只读查询
    // ------------------------------------------------------------------

    pub fn car_heartbeat(&mut self) -> Result<HeartbeatStatus, CommandError> {
        let hb = self.shuttle.heartbeat();
        self.shuttle.disconnect();
        Ok(hb?)
    }

    pub fn car_battery(&mut self) -> Result<u8, CommandError> {
        let power = self.shuttle.battery();
        self.shuttle.disconnect();
        Ok(power?)
    }

    pub fn lift_state(&mut self) -> Result<LiftState, CommandError> {
        self.with_plc(|c| Ok(c.plc.lift_state()?))
    }

    /// 读取入口扫码结果；未读到条码时返回 `NoCode`
    pub fn qrcode(&mut self) -> Result<String, CommandError> {
        self.with_plc(|c| {
            c.plc
                .scan_qrcode()?
                .ok_or_else(|| CommandError::new(ErrorKind::NoCode, "scanner has no code"))
        })
    }

    // ------------------------------------------------------------------
    // 会话与基本步骤
    // ------------------------------------------------------------------

    /// 建立 PLC 会话执行 `f`，所有退出路径上断开 PLC 与车辆
    fn with_plc<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R, CommandError>) -> Result<R, CommandError> {
        let out = match self.plc.connect() {
            Ok(()) => f(self),
            Err(e) => Err(e.into()),
        };
        self.close();
        out
    }

    /// 只需要车辆会话的动作
    fn with_shuttle<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R, CommandError>) -> Result<R, CommandError> {
        let out = f(self);
        self.shuttle.disconnect();
        out
    }

    fn step(&self) -> Result<(), CommandError> {
        self.cancel.check()
    }

    fn drive(&mut self, task_no: u8, target: Coord) -> Result<(), CommandError> {
        self.step()?;
        debug!("Drive to {} (task {})", target, task_no);
        self.shuttle.move_to(task_no, target)?;
        self.shuttle.wait_arrived(target, self.shuttle.action_timeout())?;
        Ok(())
    }

    fn carry(&mut self, task_no: u8, target: Coord) -> Result<(), CommandError> {
        self.step()?;
        debug!("Carry to {} (task {})", target, task_no);
        self.shuttle.good_move(task_no, target)?;
        self.shuttle.wait_arrived(target, self.shuttle.action_timeout())?;
        Ok(())
    }

    /// 确认轿厢停在 `floor` 且空闲
    fn ensure_lift_at(&mut self, floor: u8) -> Result<(), CommandError> {
        let state = self.plc.lift_state()?;
        if state.is_idle_at(floor) {
            Ok(())
        } else {
            Err(CommandError::new(
                ErrorKind::IllegalLiftState,
                format!(
                    "lift not idle at floor {} (at {}, running={}, idle={})",
                    floor, state.current_floor, state.running, state.idle
                ),
            ))
        }
    }

    /// 涉及提升机库位的行驶：出发前读一次 PLC 状态
    fn drive_through_lift(&mut self, task_no: u8, from: Coord, target: Coord, carrying: bool) -> Result<(), CommandError> {
        self.step()?;
        if target.is_lift_cell() {
            self.ensure_lift_at(target.z)?;
        } else if from.is_lift_cell() {
            self.ensure_lift_at(from.z)?;
        }
        if carrying {
            self.carry(task_no, target)
        } else {
            self.drive(task_no, target)
        }
    }

    fn lift_to(&mut self, seq: &mut TaskSeq, floor: u8) -> Result<LiftMove, CommandError> {
        self.step()?;
        Ok(self.plc.lift_move_by_layer(u16::from(seq.next()), floor)?)
    }

    fn convey(&mut self, route: ConveyorRoute) -> Result<(), CommandError> {
        self.step()?;
        Ok(self.plc.convey(route)?)
    }

    fn signal(&mut self, signal: FloorSignal, floor: u8) -> Result<(), CommandError> {
        self.step()?;
        Ok(self.plc.pulse_floor_signal(signal, floor)?)
    }

    // ------------------------------------------------------------------
    // 换层
    // ------------------------------------------------------------------

    /// 车辆换层，返回新位置 `(5,3,target_layer)`
    pub fn cross_layer(&mut self, task_no: u8, target_layer: u8) -> Result<Coord, CommandError> {
        check_layer(target_layer)?;
        let position = self.with_shuttle(|c| Ok(c.shuttle.position()?))?;
        if position.z == target_layer {
            info!("Shuttle already on layer {} at {}", target_layer, position);
            return Ok(position);
        }
        let mut seq = TaskSeq::new(task_no);
        self.with_plc(|c| c.cross_layer_steps(&mut seq, position, target_layer))
    }

    /// 换层脚本（调用方已建立 PLC 会话）
    ///
    /// 使用 `seq` 的连续 6 个任务号：
    /// 提升机到出发层、车到接驳位、车进轿厢、提升机到目标层、更新坐标、车出轿厢。
    fn cross_layer_steps(&mut self, seq: &mut TaskSeq, position: Coord, to: u8) -> Result<Coord, CommandError> {
        let from = position.z;
        info!("Cross layer {} -> {} from {} (task {})", from, to, position, seq.base());
        self.step()?;
        self.plc.plc_checker()?;

        self.lift_to(seq, from)?;
        self.drive_through_lift(seq.next(), position, Coord::pre_lift(from), false)?;
        self.step()?;
        self.plc.wait_lift_at(from)?;
        self.drive_through_lift(seq.next(), Coord::pre_lift(from), Coord::lift(from), false)?;

        self.lift_to(seq, to)?;
        self.step()?;
        self.plc.wait_lift_at(to)?;
        self.shuttle.relocate(seq.next(), Coord::lift(to))?;

        self.step()?;
        self.plc.wait_lift_at(to)?;
        self.drive_through_lift(seq.next(), Coord::lift(to), Coord::pre_lift(to), false)?;
        info!("Shuttle crossed to layer {}", to);
        Ok(Coord::pre_lift(to))
    }

    /// 车辆不在 `layer` 层时先换层；停在本层轿厢内时先驶出到接驳位
    fn bring_to_layer(&mut self, seq: &mut TaskSeq, layer: u8) -> Result<Coord, CommandError> {
        let position = self.shuttle.position()?;
        if position.z != layer {
            return self.cross_layer_steps(seq, position, layer);
        }
        if position.is_lift_cell() {
            let exit = Coord::pre_lift(layer);
            self.drive_through_lift(seq.next(), position, exit, false)?;
            return Ok(exit);
        }
        Ok(position)
    }

    // ------------------------------------------------------------------
    // 单步命令
    // ------------------------------------------------------------------

    /// 提升机单独换层
    pub fn lift(&mut self, task_no: u8, layer: u8) -> Result<LiftMove, CommandError> {
        check_layer(layer)?;
        let mut seq = TaskSeq::new(task_no);
        self.with_plc(|c| {
            c.plc.plc_checker()?;
            c.lift_to(&mut seq, layer)
        })
    }

    /// 同层空车行驶
    pub fn move_car(&mut self, task_no: u8, target: Coord) -> Result<Coord, CommandError> {
        self.ensure_known(target)?;
        self.move_on_layer(task_no, target, false).map(|(_, to)| to)
    }

    /// 同层载货搬运：在车辆当前位置顶升，运到 `target`；返回 `(起点, 终点)`
    pub fn move_goods(&mut self, task_no: u8, target: Coord) -> Result<(Coord, Coord), CommandError> {
        self.ensure_known(target)?;
        self.move_on_layer(task_no, target, true)
    }

    fn move_on_layer(&mut self, task_no: u8, target: Coord, carrying: bool) -> Result<(Coord, Coord), CommandError> {
        let from = self.with_shuttle(|c| Ok(c.shuttle.position()?))?;
        if from.z != target.z {
            return Err(CommandError::new(
                ErrorKind::DifferentLayer,
                format!("shuttle is on layer {}, target {} is not", from.z, target),
            ));
        }
        if from.is_lift_cell() || target.is_lift_cell() {
            self.with_plc(|c| c.drive_through_lift(task_no, from, target, carrying))?;
        } else {
            self.with_shuttle(|c| {
                if carrying {
                    c.carry(task_no, target)
                } else {
                    c.drive(task_no, target)
                }
            })?;
        }
        Ok((from, target))
    }

    // ------------------------------------------------------------------
    // 入库 / 出库
    // ------------------------------------------------------------------

    fn ensure_known(&self, cell: Coord) -> Result<(), CommandError> {
        if self.planner.map().contains(&cell) {
            Ok(())
        } else {
            Err(CommandError::precondition(format!("cell {} is not on the map", cell)))
        }
    }

    /// 存储目标：在地图上、不在缓冲区、当前空闲
    pub fn check_storage_target(&self, cell: Coord, states: &StateMap) -> Result<(), CommandError> {
        self.ensure_known(cell)?;
        if cell.is_buffer_cell() {
            return Err(CommandError::precondition(format!("cell {} is a buffer cell", cell)));
        }
        match states.get(&cell) {
            Some(CellState::Free) => Ok(()),
            Some(state) => Err(CommandError::precondition(format!("cell {} is {}", cell, state))),
            None => Err(CommandError::precondition(format!("cell {} has no state", cell))),
        }
    }

    /// 出库源：在地图上、不在缓冲区、有货
    pub fn check_storage_source(&self, cell: Coord, states: &StateMap) -> Result<(), CommandError> {
        self.ensure_known(cell)?;
        if cell.is_buffer_cell() {
            return Err(CommandError::precondition(format!("cell {} is a buffer cell", cell)));
        }
        match states.get(&cell) {
            Some(CellState::Occupied) => Ok(()),
            Some(state) => Err(CommandError::precondition(format!("cell {} is {}, expected occupied", cell, state))),
            None => Err(CommandError::precondition(format!("cell {} has no state", cell))),
        }
    }

    /// 入库：入口托盘经提升机送到 `target` 层，由车辆搬入 `target`
    pub fn task_inband(&mut self, task_no: u8, target: Coord, states: &StateMap) -> Result<(), CommandError> {
        self.check_storage_target(target, states)?;
        let mut seq = TaskSeq::new(task_no);
        self.with_plc(|c| {
            c.plc.plc_checker()?;
            c.bring_to_layer(&mut seq, target.z)?;
            c.inband_steps(&mut seq, target)
        })
    }

    fn inband_steps(&mut self, seq: &mut TaskSeq, target: Coord) -> Result<(), CommandError> {
        let layer = target.z;
        info!("Inbound to {} (task {})", target, seq.base());
        self.lift_to(seq, 1)?;
        self.convey(ConveyorRoute::EntryToLift)?;
        self.lift_to(seq, layer)?;
        self.convey(ConveyorRoute::LiftToFloor(layer))?;

        self.drive(seq.next(), Coord::pre_lift(layer))?;
        self.signal(FloorSignal::PickInProgress, layer)?;
        self.carry(seq.next(), target)?;
        self.signal(FloorSignal::PickComplete, layer)?;
        info!("Inbound to {} complete", target);
        Ok(())
    }

    /// 出库：车辆把 `source` 的托盘送到接驳位，经提升机与输送线送到出库口
    pub fn task_outband(&mut self, task_no: u8, source: Coord, states: &StateMap) -> Result<(), CommandError> {
        self.check_storage_source(source, states)?;
        let mut seq = TaskSeq::new(task_no);
        self.with_plc(|c| {
            c.plc.plc_checker()?;
            c.bring_to_layer(&mut seq, source.z)?;
            c.outband_steps(&mut seq, source)
        })
    }

    fn outband_steps(&mut self, seq: &mut TaskSeq, source: Coord) -> Result<(), CommandError> {
        let layer = source.z;
        info!("Outbound from {} (task {})", source, seq.base());
        self.drive(seq.next(), source)?;
        self.signal(FloorSignal::FeedInProgress, layer)?;
        self.carry(seq.next(), Coord::pre_lift(layer))?;
        self.signal(FloorSignal::FeedComplete, layer)?;

        self.lift_to(seq, layer)?;
        self.convey(ConveyorRoute::FloorToLift(layer))?;
        self.lift_to(seq, 1)?;
        self.convey(ConveyorRoute::LiftToGate)?;
        info!("Outbound from {} complete", source);
        Ok(())
    }

    /// 同层托盘搬运；车辆在其他层时先换层
    pub fn good_move_by_start_end(&mut self, task_no: u8, source: Coord, target: Coord) -> Result<(), CommandError> {
        self.check_same_layer(source, target)?;
        let mut seq = TaskSeq::new(task_no);
        self.with_plc(|c| {
            c.bring_to_layer(&mut seq, source.z)?;
            c.good_move_steps(&mut seq, source, target)
        })
    }

    fn good_move_steps(&mut self, seq: &mut TaskSeq, source: Coord, target: Coord) -> Result<(), CommandError> {
        info!("Move pallet {} -> {} (task {})", source, target, seq.base());
        self.drive(seq.next(), source)?;
        self.carry(seq.next(), target)
    }

    fn check_same_layer(&self, source: Coord, target: Coord) -> Result<(), CommandError> {
        self.ensure_known(source)?;
        self.ensure_known(target)?;
        if source.same_floor(&target) {
            Ok(())
        } else {
            Err(CommandError::new(
                ErrorKind::DifferentLayer,
                format!("{} and {} are on different layers", source, target),
            ))
        }
    }

    // ------------------------------------------------------------------
    // 阻挡处理
    // ------------------------------------------------------------------

    /// 为 `source → target` 的载货路径规划阻挡托盘的暂存
    ///
    /// 阻挡按离通道由近到远排序，依次分配第一个可达的空闲暂存位：
    /// 从阻挡到暂存位的载货路径上不能有仍在库的托盘（已规划挪走的阻挡
    /// 视为已腾空）。暂存位不够时在任何动作之前返回 `NotEnoughStagingSpace`。
    pub fn plan_parking(&self, source: Coord, target: Coord, states: &StateMap) -> Result<Vec<Parking>, CommandError> {
        let blockers = self.planner.find_blocking_nodes(source, target, states)?;
        if blockers.is_empty() {
            return Ok(Vec::new());
        }
        let ranked = self.planner.rank_by_highway(&blockers, states);
        let path = self.planner.shortest_path(source, target)?;
        let mut free: Vec<Coord> = self
            .staging_cells(source.z)
            .into_iter()
            .filter(|c| states.get(c) == Some(&CellState::Free))
            .filter(|c| !path.contains(c))
            .collect();
        if ranked.len() > free.len() {
            return Err(CommandError::new(
                ErrorKind::NotEnoughStagingSpace,
                format!(
                    "{} blockers between {} and {}, {} free staging cells",
                    ranked.len(),
                    source,
                    target,
                    free.len()
                ),
            ));
        }

        let mut after = states.clone();
        let mut plan = Vec::with_capacity(ranked.len());
        for blocker in ranked {
            let mut chosen = None;
            for (i, staging) in free.iter().enumerate() {
                if self.carry_is_clear(blocker, *staging, &after)? {
                    chosen = Some(i);
                    break;
                }
            }
            let Some(i) = chosen else {
                return Err(CommandError::new(
                    ErrorKind::NotEnoughStagingSpace,
                    format!("no staging cell reachable from blocker {} without passing a stored pallet", blocker),
                ));
            };
            let staging = free.remove(i);
            after.insert(blocker, CellState::Free);
            after.insert(staging, CellState::Occupied);
            plan.push(Parking { blocker, staging });
        }
        Ok(plan)
    }

    /// `from → to` 的载货路径（不含起点）上没有在库托盘
    fn carry_is_clear(&self, from: Coord, to: Coord, states: &StateMap) -> Result<bool, CommandError> {
        let path = self.planner.shortest_path(from, to)?;
        Ok(path
            .iter()
            .skip(1)
            .all(|c| states.get(c) != Some(&CellState::Occupied)))
    }

    fn park(&mut self, seq: &mut TaskSeq, plan: &[Parking], parked: &mut Vec<Parking>) -> Result<(), CommandError> {
        for p in plan {
            info!("Parking blocker {}", p);
            self.drive(seq.next(), p.blocker)?;
            self.carry(seq.next(), p.staging)?;
            parked.push(*p);
        }
        Ok(())
    }

    fn restore(&mut self, seq: &mut TaskSeq, parked: &mut Vec<Parking>) -> Result<(), CommandError> {
        while let Some(p) = parked.last().copied() {
            info!("Restoring blocker {} <- {}", p.blocker, p.staging);
            self.drive(seq.next(), p.staging)?;
            self.carry(seq.next(), p.blocker)?;
            parked.pop();
        }
        Ok(())
    }

    /// 挪开阻挡、执行 `op`、按相反顺序放回
    ///
    /// 失败时错误消息列出仍停在暂存位上的阻挡。
    fn with_blockers_parked(
        &mut self,
        seq: &mut TaskSeq,
        plan: Vec<Parking>,
        op: impl FnOnce(&mut Self, &mut TaskSeq) -> Result<(), CommandError>,
    ) -> Result<Vec<Parking>, CommandError> {
        let mut parked = Vec::with_capacity(plan.len());
        let result = self
            .park(seq, &plan, &mut parked)
            .and_then(|_| op(self, seq))
            .and_then(|_| self.restore(seq, &mut parked));
        match result {
            Ok(()) => Ok(plan),
            Err(e) if parked.is_empty() => Err(e),
            Err(e) => {
                error!("Aborted with parked blockers: {}", describe(&parked));
                Err(e.context(format!("parked blockers: {}", describe(&parked))))
            },
        }
    }

    /// 带阻挡处理的入库，返回挪动过的阻挡
    pub fn task_inband_with_blocking(
        &mut self,
        task_no: u8,
        target: Coord,
        states: &StateMap,
    ) -> Result<Vec<Parking>, CommandError> {
        self.check_storage_target(target, states)?;
        let plan = self.plan_parking(Coord::pre_lift(target.z), target, states)?;
        let mut seq = TaskSeq::new(task_no);
        self.with_plc(|c| {
            c.plc.plc_checker()?;
            c.bring_to_layer(&mut seq, target.z)?;
            c.with_blockers_parked(&mut seq, plan, |c, seq| c.inband_steps(seq, target))
        })
    }

    /// 带阻挡处理的出库
    pub fn task_outband_with_blocking(
        &mut self,
        task_no: u8,
        source: Coord,
        states: &StateMap,
    ) -> Result<Vec<Parking>, CommandError> {
        self.check_storage_source(source, states)?;
        let plan = self.plan_parking(source, Coord::pre_lift(source.z), states)?;
        let mut seq = TaskSeq::new(task_no);
        self.with_plc(|c| {
            c.plc.plc_checker()?;
            c.bring_to_layer(&mut seq, source.z)?;
            c.with_blockers_parked(&mut seq, plan, |c, seq| c.outband_steps(seq, source))
        })
    }

    /// 带阻挡处理的同层搬运
    pub fn good_move_with_blocking(
        &mut self,
        task_no: u8,
        source: Coord,
        target: Coord,
        states: &StateMap,
    ) -> Result<Vec<Parking>, CommandError> {
        self.check_same_layer(source, target)?;
        self.check_storage_source(source, states)?;
        self.check_storage_target(target, states)?;
        let plan = self.plan_parking(source, target, states)?;
        if plan.is_empty() {
            self.good_move_by_start_end(task_no, source, target)?;
            return Ok(plan);
        }
        let mut seq = TaskSeq::new(task_no);
        self.with_plc(|c| {
            c.bring_to_layer(&mut seq, source.z)?;
            c.with_blockers_parked(&mut seq, plan, |c, seq| c.good_move_steps(seq, source, target))
        })
    }
}
