//! 协调与命令层
//!
//! 本模块把驱动层的原子动作编排为立体库的复合动作，并提供统一的命令入口：
//! - 全局操作锁（重入即 `Busy`）与协作式取消
//! - 设备协调器：换层、入库、出库、带阻挡处理的搬运
//! - 命令网关：输入校验、库位存储查询与提交、结果映射
//! - 系统配置（TOML）与真实设备装配
//!
//! # 使用场景
//!
//! 宿主程序用 [`build_gateway`] 按配置装配网关，再通过 [`CommandGateway::execute`]
//! 或异步外观 [`AsyncGateway`] 执行 [`Command`]。

pub mod config;
pub mod coordinator;
mod error;
pub mod gateway;
pub mod lock;
mod service;
pub mod store;
pub mod task_no;

pub use asrs_driver::{PlcDevice, ShuttleDevice};
pub use config::{ConfigError, SystemConfig};
pub use coordinator::{DeviceCoordinator, Parking};
pub use error::{CommandError, ErrorKind};
pub use gateway::{Command, CommandGateway, CommandResponse};
pub use lock::{CancelToken, LockState, OperationGuard, OperationLock};
pub use service::{AsyncGateway, LiveGateway, LivePlc, LiveShuttle, build_gateway};
pub use store::{CellRecord, JsonFileLocationStore, LocationStore, MemoryLocationStore, StoreError};
pub use task_no::{TaskNumbers, TaskSeq};
