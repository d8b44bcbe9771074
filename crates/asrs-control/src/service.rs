//! 网关的异步外观与真实设备装配
//!
//! 协调器本身是同步顺序执行的；异步只发生在边界上：每条命令放到
//! `spawn_blocking` 线程执行，事件循环可以同时应答只读查询。

use crate::config::{ConfigError, SystemConfig};
use crate::coordinator::DeviceCoordinator;
use crate::error::{CommandError, ErrorKind};
use crate::gateway::{Command, CommandGateway, CommandResponse};
use crate::store::{JsonFileLocationStore, LocationStore, MemoryLocationStore};
use asrs_driver::{PlcBuilder, PlcController, PlcDevice, ShuttleBuilder, ShuttleController, ShuttleDevice, StatusBoard};
use asrs_link::{S7Client, TcpShuttleLink};
use asrs_planner::PathPlanner;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub type LiveShuttle = ShuttleController<TcpShuttleLink>;
pub type LivePlc = PlcController<S7Client>;

/// 连接真实设备的网关
pub type LiveGateway = CommandGateway<LiveShuttle, LivePlc>;

/// 按配置装配真实设备网关（不建立连接）
pub fn build_gateway(config: &SystemConfig) -> Result<LiveGateway, ConfigError> {
    let map = config.load_map()?;
    config.validate(&map)?;
    let planner = Arc::new(PathPlanner::new(map));
    let board = StatusBoard::new();

    let sc = &config.shuttle;
    let shuttle = ShuttleBuilder::new(sc.host.clone(), planner.clone())
        .port(sc.port)
        .device_id(sc.device_id)
        .timing(sc.timing())
        .retry(sc.retry())
        .connect_timeout(Duration::from_millis(sc.connect_timeout_ms))
        .board(board.clone())
        .build();

    let pc = &config.plc;
    let plc = PlcBuilder::new(pc.host.clone())
        .port(pc.port)
        .rack(pc.rack)
        .slot(pc.slot)
        .timing(pc.timing())
        .retry(pc.retry())
        .action_timeout(pc.action_timeout())
        .io_timeouts(
            Duration::from_millis(pc.connect_timeout_ms),
            Duration::from_millis(pc.io_timeout_ms),
        )
        .board(board.clone())
        .build();

    let store: Arc<dyn LocationStore> = match &config.store.path {
        Some(path) => Arc::new(JsonFileLocationStore::open(path, planner.map())?),
        None => Arc::new(MemoryLocationStore::new(planner.map())),
    };

    info!(
        "Gateway: shuttle {}:{}, PLC {}:{} (rack {}, slot {})",
        sc.host, sc.port, pc.host, pc.port, pc.rack, pc.slot
    );
    let coordinator = DeviceCoordinator::new(shuttle, plc, planner).with_staging(config.coordinator.staging.clone());
    Ok(CommandGateway::new(coordinator, store, board).with_shutdown_timeout(config.coordinator.shutdown_timeout()))
}

/// 网关的异步外观
pub struct AsyncGateway<S, P> {
    inner: Arc<CommandGateway<S, P>>,
}

impl<S, P> Clone for AsyncGateway<S, P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S, P> AsyncGateway<S, P>
where
    S: ShuttleDevice + 'static,
    P: PlcDevice + 'static,
{
    pub fn new(gateway: CommandGateway<S, P>) -> Self {
        Self {
            inner: Arc::new(gateway),
        }
    }

    pub fn gateway(&self) -> &Arc<CommandGateway<S, P>> {
        &self.inner
    }

    pub async fn execute(&self, command: Command) -> CommandResponse {
        let inner = self.inner.clone();
        match tokio::task::spawn_blocking(move || inner.execute(command)).await {
            Ok(response) => response,
            Err(e) => CommandResponse::failure(CommandError::new(
                ErrorKind::Canceled,
                format!("command worker failed: {}", e),
            )),
        }
    }

    /// 等待在途动作结束并断开会话
    pub async fn shutdown(&self) -> bool {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.shutdown())
            .await
            .unwrap_or(false)
    }
}
