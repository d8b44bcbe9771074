//! 驱动层模块
//!
//! 本模块提供立体库设备的驱动功能，包括：
//! - 穿梭车控制器：心跳、位置/状态/电量查询、路径任务下发、到位等待
//! - 提升机与输送线控制器：前置检查、提升机换层、输送线路由、握手脉冲、扫码
//! - 状态看板（ArcSwap 无锁读取）：最近一次观测到的设备状态
//!
//! # 使用场景
//!
//! 协调器只依赖 [`ShuttleDevice`] / [`PlcDevice`] 两个 trait；
//! 生产环境使用 [`ShuttleBuilder`] / [`PlcBuilder`] 构造 TCP 与 S7 控制器。

mod board;
mod builder;
pub mod device;
mod error;
pub mod plc;
pub mod shuttle;

#[cfg(any(test, feature = "mock"))]
pub mod sim;

pub use board::{Observed, StatusBoard};
pub use builder::{PlcBuilder, ShuttleBuilder};
pub use device::{PlcDevice, ShuttleDevice};
pub use error::DriverError;
pub use plc::{ConveyorRoute, LiftMove, PlcController, next_task_no};
pub use shuttle::{ShuttleController, ShuttleTiming};
