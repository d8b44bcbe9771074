//! Builder 模式实现
//!
//! 提供链式构造真实设备控制器（TCP 穿梭车、S7 PLC）的便捷方式。

use crate::board::StatusBoard;
use crate::plc::{DEFAULT_ACTION_TIMEOUT, PlcController};
use crate::shuttle::{ShuttleController, ShuttleTiming};
use asrs_link::tcp::DEFAULT_SHUTTLE_PORT;
use asrs_link::{PlcLink, PlcTiming, RetryPolicy, S7Client, TcpShuttleLink};
use asrs_planner::PathPlanner;
use asrs_protocol::DEFAULT_DEVICE_ID;
use asrs_protocol::s7::ISO_TCP_PORT;
use std::sync::Arc;
use std::time::Duration;

/// 穿梭车控制器 Builder
///
/// # Example
///
/// ```no_run
/// use asrs_driver::ShuttleBuilder;
/// use asrs_planner::{GridMap, PathPlanner};
/// use std::sync::Arc;
///
/// let planner = Arc::new(PathPlanner::new(GridMap::warehouse().unwrap()));
/// let shuttle = ShuttleBuilder::new("192.168.8.30", planner)
///     .port(2504)
///     .device_id(2)
///     .build();
/// ```
pub struct ShuttleBuilder {
    host: String,
    port: u16,
    device_id: u8,
    planner: Arc<PathPlanner>,
    timing: ShuttleTiming,
    retry: RetryPolicy,
    connect_timeout: Option<Duration>,
    board: Option<Arc<StatusBoard>>,
}

impl ShuttleBuilder {
    pub fn new(host: impl Into<String>, planner: Arc<PathPlanner>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_SHUTTLE_PORT,
            device_id: DEFAULT_DEVICE_ID,
            planner,
            timing: ShuttleTiming::default(),
            retry: RetryPolicy::default(),
            connect_timeout: None,
            board: None,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn device_id(mut self, device_id: u8) -> Self {
        self.device_id = device_id;
        self
    }

    pub fn timing(mut self, timing: ShuttleTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn board(mut self, board: Arc<StatusBoard>) -> Self {
        self.board = Some(board);
        self
    }

    /// 构建控制器（不建立连接，首次交互时连接）
    pub fn build(self) -> ShuttleController<TcpShuttleLink> {
        let mut link = TcpShuttleLink::new(self.host, self.port).with_retry_policy(self.retry);
        if let Some(timeout) = self.connect_timeout {
            link = link.with_connect_timeout(timeout);
        }
        let controller = ShuttleController::new(link, self.device_id, self.planner).with_timing(self.timing);
        match self.board {
            Some(board) => controller.with_board(board),
            None => controller,
        }
    }
}

/// PLC 控制器 Builder
///
/// # Example
///
/// ```no_run
/// use asrs_driver::PlcBuilder;
///
/// let plc = PlcBuilder::new("192.168.8.10").rack(0).slot(1).build();
/// ```
pub struct PlcBuilder {
    host: String,
    port: u16,
    rack: u8,
    slot: u8,
    timing: PlcTiming,
    retry: RetryPolicy,
    action_timeout: Duration,
    io_timeout: Option<(Duration, Duration)>,
    board: Option<Arc<StatusBoard>>,
}

impl PlcBuilder {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: ISO_TCP_PORT,
            rack: 0,
            slot: 1,
            timing: PlcTiming::default(),
            retry: RetryPolicy::default(),
            action_timeout: DEFAULT_ACTION_TIMEOUT,
            io_timeout: None,
            board: None,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn rack(mut self, rack: u8) -> Self {
        self.rack = rack;
        self
    }

    pub fn slot(mut self, slot: u8) -> Self {
        self.slot = slot;
        self
    }

    pub fn timing(mut self, timing: PlcTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn action_timeout(mut self, timeout: Duration) -> Self {
        self.action_timeout = timeout;
        self
    }

    /// 建连超时与单次读写超时
    pub fn io_timeouts(mut self, connect: Duration, io: Duration) -> Self {
        self.io_timeout = Some((connect, io));
        self
    }

    pub fn board(mut self, board: Arc<StatusBoard>) -> Self {
        self.board = Some(board);
        self
    }

    /// 构建控制器（不建立连接）
    pub fn build(self) -> PlcController<S7Client> {
        let mut client = S7Client::new(self.host, self.rack, self.slot).with_port(self.port);
        if let Some((connect, io)) = self.io_timeout {
            client = client.with_timeouts(connect, io);
        }
        let link = PlcLink::new(client)
            .with_retry_policy(self.retry)
            .with_timing(self.timing);
        let controller = PlcController::new(link).with_action_timeout(self.action_timeout);
        match self.board {
            Some(board) => controller.with_board(board),
            None => controller,
        }
    }
}
