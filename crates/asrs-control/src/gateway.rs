//! 命令网关
//!
//! 与传输无关的命令入口：校验输入、查询库位存储、取得操作锁、调用协调器，
//! 成功后提交库位变更。每条命令的结果都是 [`CommandResponse`]，
//! 不存在部分成功。
//!
//! 只读查询在操作锁被占用时改由 [`StatusBoard`] 的最近观测值应答；
//! 看板为空时与复合动作一样返回 `Busy`。

use crate::coordinator::{DeviceCoordinator, check_layer};
use crate::error::{CommandError, ErrorKind};
use crate::lock::{CancelToken, OperationLock};
use crate::store::{CellRecord, LocationStore};
use crate::task_no::TaskNumbers;
use asrs_driver::{PlcDevice, ShuttleDevice, StatusBoard};
use asrs_planner::{CellState, PathPlanner};
use asrs_protocol::{Coord, HeartbeatStatus};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// 每条命令预留的任务号数量
const TASK_SPAN: u8 = 32;

/// 网关命令
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    GetCarLocation,
    GetCarStatus,
    GetCarBattery,
    GetLiftState,
    ReadLocations,
    Qrcode,
    MoveCar {
        target: Coord,
    },
    MoveGoods {
        target: Coord,
    },
    Lift {
        target_layer: u8,
    },
    TaskInband {
        target_cell: Coord,
    },
    TaskOutband {
        target_cell: Coord,
    },
    CrossLayer {
        target_layer: u8,
    },
    TaskInbandWithBlocking {
        target_cell: Coord,
        pallet_id: String,
    },
    TaskOutbandWithBlocking {
        target_cell: Coord,
        pallet_id: String,
    },
    GoodMoveWithBlocking {
        pallet_id: String,
        source: Coord,
        target: Coord,
    },
    /// 离 `anchor` 最近、可直达、不在 `source → target` 路径上的空闲库位
    NearestFreeCell {
        source: Coord,
        target: Coord,
        anchor: Coord,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::GetCarLocation => "get_car_location",
            Command::GetCarStatus => "get_car_status",
            Command::GetCarBattery => "get_car_battery",
            Command::GetLiftState => "get_lift_state",
            Command::ReadLocations => "read_locations",
            Command::Qrcode => "qrcode",
            Command::MoveCar { .. } => "move_car",
            Command::MoveGoods { .. } => "move_goods",
            Command::Lift { .. } => "lift",
            Command::TaskInband { .. } => "task_inband",
            Command::TaskOutband { .. } => "task_outband",
            Command::CrossLayer { .. } => "cross_layer",
            Command::TaskInbandWithBlocking { .. } => "task_inband_with_blocking",
            Command::TaskOutbandWithBlocking { .. } => "task_outband_with_blocking",
            Command::GoodMoveWithBlocking { .. } => "good_move_with_blocking",
            Command::NearestFreeCell { .. } => "nearest_free_cell",
        }
    }

    /// 是否只读（不驱动设备动作）
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            Command::GetCarLocation
                | Command::GetCarStatus
                | Command::GetCarBattery
                | Command::GetLiftState
                | Command::ReadLocations
                | Command::NearestFreeCell { .. }
        )
    }
}

/// 命令结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl CommandResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            message: "ok".to_string(),
            kind: None,
            data: Some(data),
        }
    }

    pub fn failure(err: CommandError) -> Self {
        Self {
            success: false,
            message: err.message,
            kind: Some(err.kind),
            data: None,
        }
    }
}

impl From<Result<Value, CommandError>> for CommandResponse {
    fn from(result: Result<Value, CommandError>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(err) => Self::failure(err),
        }
    }
}

fn data<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|e| {
        warn!("Cannot encode command result: {}", e);
        Value::Null
    })
}

/// 命令网关
pub struct CommandGateway<S, P> {
    lock: OperationLock,
    coordinator: Mutex<DeviceCoordinator<S, P>>,
    planner: Arc<PathPlanner>,
    store: Arc<dyn LocationStore>,
    board: Arc<StatusBoard>,
    tasks: TaskNumbers,
    cancel: CancelToken,
    closing: AtomicBool,
    shutdown_timeout: Duration,
}

impl<S: ShuttleDevice, P: PlcDevice> CommandGateway<S, P> {
    pub fn new(coordinator: DeviceCoordinator<S, P>, store: Arc<dyn LocationStore>, board: Arc<StatusBoard>) -> Self {
        Self {
            lock: OperationLock::new(),
            planner: coordinator.planner().clone(),
            cancel: coordinator.cancel_token(),
            coordinator: Mutex::new(coordinator),
            store,
            board,
            tasks: TaskNumbers::new(),
            closing: AtomicBool::new(false),
            shutdown_timeout: Duration::from_secs(300),
        }
    }

    /// 固定任务号起点
    pub fn with_task_numbers(mut self, tasks: TaskNumbers) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn lock(&self) -> &OperationLock {
        &self.lock
    }

    pub fn store(&self) -> &Arc<dyn LocationStore> {
        &self.store
    }

    pub fn board(&self) -> &Arc<StatusBoard> {
        &self.board
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// 请求取消在途动作（在下一个挂起点生效）
    pub fn cancel(&self) {
        if let Some(holder) = self.lock.holder() {
            warn!("Cancel requested for '{}'", holder);
            self.cancel.cancel();
        }
    }

    /// 拒绝新命令，等待在途动作结束后断开所有会话
    ///
    /// 返回在途动作是否在超时前结束。
    pub fn shutdown(&self) -> bool {
        self.closing.store(true, Ordering::Release);
        info!("Gateway shutting down");
        let drained = self.lock.wait_released(self.shutdown_timeout);
        if drained {
            self.coordinator.lock().close();
            info!("Gateway closed");
        } else {
            warn!(
                "In-flight '{}' still running after {:?}",
                self.lock.holder().unwrap_or("unknown"),
                self.shutdown_timeout
            );
        }
        drained
    }

    /// 执行一条命令
    pub fn execute(&self, command: Command) -> CommandResponse {
        let name = command.name();
        debug!("Command {:?}", command);
        let result = self.dispatch(command);
        if let Err(e) = &result {
            match e.kind {
                ErrorKind::Busy => debug!("{} refused: {}", name, e),
                _ => warn!("{} failed: {}", name, e),
            }
        }
        result.into()
    }

    fn dispatch(&self, command: Command) -> Result<Value, CommandError> {
        let name = command.name();
        match command {
            Command::GetCarLocation => {
                let hb = self.shuttle_heartbeat(name)?;
                Ok(Value::String(hb.position.to_string()))
            },
            Command::GetCarStatus => Ok(data(&self.shuttle_heartbeat(name)?.car_status)),
            Command::GetCarBattery => {
                let power = self.read_or_board(name, |c| c.car_battery(), |b| b.battery())?;
                Ok(json!(power))
            },
            Command::GetLiftState => {
                let board = self.board.clone();
                let state = self.read_or_board(
                    name,
                    |c| {
                        let state = c.lift_state()?;
                        board.record_lift(state);
                        Ok(state)
                    },
                    |b| b.lift().map(|o| o.value),
                )?;
                Ok(data(&state))
            },
            Command::ReadLocations => Ok(data(&self.store.records()?)),
            Command::NearestFreeCell { source, target, anchor } => {
                let states = self.store.states()?;
                match self.planner.find_nearest_free_node(source, target, anchor, &states)? {
                    Some(cell) => Ok(Value::String(cell.to_string())),
                    None => Err(CommandError::precondition(format!(
                        "no reachable free cell near {}",
                        anchor
                    ))),
                }
            },
            Command::Qrcode => self.exclusive(name, |c, _| Ok(Value::String(c.qrcode()?))),
            Command::MoveCar { target } => self.exclusive(name, |c, task_no| {
                let position = c.move_car(task_no, target)?;
                Ok(Value::String(position.to_string()))
            }),
            Command::MoveGoods { target } => self.exclusive(name, |c, task_no| {
                let states = self.store.states()?;
                if states.get(&target) != Some(&CellState::Free) {
                    return Err(CommandError::precondition(format!("cell {} is not free", target)));
                }
                let (from, to) = c.move_goods(task_no, target)?;
                if self.store.record(from)?.status == CellState::Occupied {
                    self.store.move_pallet(from, to)?;
                }
                Ok(json!({ "from": from, "to": to }))
            }),
            Command::Lift { target_layer } => {
                check_layer(target_layer)?;
                self.exclusive(name, |c, task_no| Ok(data(&c.lift(task_no, target_layer)?)))
            },
            Command::CrossLayer { target_layer } => {
                check_layer(target_layer)?;
                self.exclusive(name, |c, task_no| {
                    Ok(Value::String(c.cross_layer(task_no, target_layer)?.to_string()))
                })
            },
            Command::TaskInband { target_cell } => self.exclusive(name, |c, task_no| {
                let states = self.store.states()?;
                c.task_inband(task_no, target_cell, &states)?;
                Ok(data(&self.store.store_pallet(target_cell, None)?))
            }),
            Command::TaskOutband { target_cell } => self.exclusive(name, |c, task_no| {
                let states = self.store.states()?;
                c.task_outband(task_no, target_cell, &states)?;
                Ok(data(&self.store.remove_pallet(target_cell)?))
            }),
            Command::TaskInbandWithBlocking { target_cell, pallet_id } => {
                self.exclusive(name, |c, task_no| {
                    if let Some(existing) = self.store.find_pallet(&pallet_id)? {
                        return Err(CommandError::new(
                            ErrorKind::PalletAlreadyStored,
                            format!("pallet {} is already stored at {}", pallet_id, existing.location),
                        ));
                    }
                    let states = self.store.states()?;
                    c.check_storage_target(target_cell, &states)?;
                    let scanned = c.qrcode()?;
                    if scanned != pallet_id {
                        return Err(CommandError::new(
                            ErrorKind::QrMismatch,
                            format!("scanned {}, ordered {}", scanned, pallet_id),
                        ));
                    }
                    let parked = c.task_inband_with_blocking(task_no, target_cell, &states)?;
                    debug!("Inbound moved {} blockers", parked.len());
                    Ok(data(&self.store.store_pallet(target_cell, Some(&pallet_id))?))
                })
            },
            Command::TaskOutbandWithBlocking { target_cell, pallet_id } => {
                self.exclusive(name, |c, task_no| {
                    self.pallet_at(&pallet_id, target_cell)?;
                    let states = self.store.states()?;
                    let parked = c.task_outband_with_blocking(task_no, target_cell, &states)?;
                    debug!("Outbound moved {} blockers", parked.len());
                    Ok(data(&self.store.remove_pallet(target_cell)?))
                })
            },
            Command::GoodMoveWithBlocking { pallet_id, source, target } => {
                self.exclusive(name, |c, task_no| {
                    self.pallet_at(&pallet_id, source)?;
                    let states = self.store.states()?;
                    let parked = c.good_move_with_blocking(task_no, source, target, &states)?;
                    debug!("Good move moved {} blockers", parked.len());
                    Ok(data(&self.store.move_pallet(source, target)?))
                })
            },
        }
    }

    /// 托盘必须存放在 `cell`
    fn pallet_at(&self, pallet_id: &str, cell: Coord) -> Result<CellRecord, CommandError> {
        match self.store.find_pallet(pallet_id)? {
            None => Err(CommandError::new(
                ErrorKind::PalletNotFound,
                format!("pallet {} is not stored", pallet_id),
            )),
            Some(record) if record.location != cell => Err(CommandError::new(
                ErrorKind::PalletCellMismatch,
                format!("pallet {} is at {}, not {}", pallet_id, record.location, cell),
            )),
            Some(record) => Ok(record),
        }
    }

    fn shuttle_heartbeat(&self, name: &'static str) -> Result<HeartbeatStatus, CommandError> {
        let board = self.board.clone();
        self.read_or_board(
            name,
            |c| {
                let hb = c.car_heartbeat()?;
                board.record_heartbeat(hb);
                Ok(hb)
            },
            |b| b.heartbeat().map(|o| o.value),
        )
    }

    /// 只读查询：取得锁时读设备，锁被占用时读看板
    fn read_or_board<R>(
        &self,
        name: &'static str,
        read: impl FnOnce(&mut DeviceCoordinator<S, P>) -> Result<R, CommandError>,
        fallback: impl FnOnce(&StatusBoard) -> Option<R>,
    ) -> Result<R, CommandError> {
        if self.is_closing() {
            return Err(CommandError::new(ErrorKind::Canceled, "gateway is shutting down"));
        }
        match self.lock.try_acquire(name) {
            Ok(guard) => {
                guard.begin();
                let mut coordinator = self.coordinator.lock();
                read(&mut coordinator)
            },
            Err(busy) => match fallback(&self.board) {
                Some(value) => {
                    debug!("{} served from status board", name);
                    Ok(value)
                },
                None => Err(busy),
            },
        }
    }

    /// 复合动作：持锁执行，任务号每条命令新取
    fn exclusive<R>(
        &self,
        name: &'static str,
        f: impl FnOnce(&mut DeviceCoordinator<S, P>, u8) -> Result<R, CommandError>,
    ) -> Result<R, CommandError> {
        if self.is_closing() {
            return Err(CommandError::new(ErrorKind::Canceled, "gateway is shutting down"));
        }
        let guard = self.lock.try_acquire(name)?;
        self.cancel.reset();
        let task_no = self.tasks.draw(TASK_SPAN);
        let mut coordinator = self.coordinator.lock();
        guard.begin();

        info!("{} started (task {})", name, task_no);
        let start = Instant::now();
        let result = f(&mut coordinator, task_no);
        match &result {
            Ok(_) => info!("{} finished in {:?}", name, start.elapsed()),
            Err(e) => error!("{} aborted after {:?}: {}", name, start.elapsed(), e),
        }
        result
    }
}
