//! 穿梭车控制器
//!
//! 一问一答：每发送一帧请求，从接收流中拼出一帧完整应答再返回。
//! 网络错误直接上抛，不在本层重试（连接阶段的重试由链路层负责）。

use crate::board::StatusBoard;
use crate::device::ShuttleDevice;
use crate::error::DriverError;
use asrs_link::{LinkError, MAX_RECV_LEN, ShuttleTransport};
use asrs_planner::PathPlanner;
use asrs_protocol::{
    Coord, FRAME_HEADER, FrameBuilder, HeartbeatStatus, ResponseBody, Segment, ShuttleFrame,
    ShuttleResponse, ShuttleStatus, transmitted_segment_count,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// 车辆交互节奏
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShuttleTiming {
    /// 到位轮询周期
    pub poll_interval: Duration,
    /// 第一次轮询前的宽限
    pub initial_grace: Duration,
    /// 单个动作的默认截止时间
    pub action_timeout: Duration,
    /// 等待单帧应答的时间
    pub response_timeout: Duration,
    /// 心跳尝试次数
    pub heartbeat_attempts: u32,
}

impl Default for ShuttleTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            initial_grace: Duration::from_secs(2),
            action_timeout: Duration::from_secs(120),
            response_timeout: Duration::from_secs(2),
            heartbeat_attempts: 3,
        }
    }
}

/// 穿梭车控制器
pub struct ShuttleController<T: ShuttleTransport> {
    transport: T,
    builder: FrameBuilder,
    planner: Arc<PathPlanner>,
    timing: ShuttleTiming,
    board: Option<Arc<StatusBoard>>,
    rx: Vec<u8>,
}

impl<T: ShuttleTransport> ShuttleController<T> {
    pub fn new(transport: T, device_id: u8, planner: Arc<PathPlanner>) -> Self {
        Self {
            transport,
            builder: FrameBuilder::new(device_id),
            planner,
            timing: ShuttleTiming::default(),
            board: None,
            rx: Vec::new(),
        }
    }

    pub fn with_timing(mut self, timing: ShuttleTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_board(mut self, board: Arc<StatusBoard>) -> Self {
        self.board = Some(board);
        self
    }

    pub fn timing(&self) -> &ShuttleTiming {
        &self.timing
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    fn ensure_connected(&mut self) -> Result<(), DriverError> {
        if self.transport.is_connected() {
            Ok(())
        } else {
            self.open()
        }
    }

    fn open(&mut self) -> Result<(), DriverError> {
        self.transport.connect().map_err(DriverError::Shuttle)?;
        self.builder.reset_life();
        self.rx.clear();
        Ok(())
    }

    /// 丢弃帧头之前的残余字节
    fn resync(&mut self) {
        if self.rx.starts_with(&FRAME_HEADER) {
            return;
        }
        let keep_from = self
            .rx
            .windows(2)
            .position(|w| w == FRAME_HEADER)
            .unwrap_or(self.rx.len().saturating_sub(1));
        if keep_from > 0 {
            debug!("Dropping {} stray bytes", keep_from);
            self.rx.drain(..keep_from);
        }
    }

    /// 发送一帧并等待同类型的应答
    fn exchange(&mut self, request: ShuttleFrame) -> Result<ShuttleResponse, DriverError> {
        self.ensure_connected()?;
        let bytes = request.encode()?;
        trace!("shuttle tx {}", hex::encode(&bytes));
        self.rx.clear();
        self.transport.send(&bytes).map_err(DriverError::Shuttle)?;

        let deadline = Instant::now() + self.timing.response_timeout;
        loop {
            self.resync();
            while let Some(len) = ShuttleFrame::complete_len(&self.rx) {
                let frame: Vec<u8> = self.rx.drain(..len).collect();
                trace!("shuttle rx {}", hex::encode(&frame));
                let response = ShuttleResponse::parse(&frame)?;
                if response.frame_type == request.frame_type {
                    return Ok(response);
                }
                debug!(
                    "Discarding {:?} response (life {}) while waiting for {:?}",
                    response.frame_type, response.life, request.frame_type
                );
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(DriverError::Shuttle(LinkError::Timeout));
            }
            let chunk = self
                .transport
                .recv(deadline - now, MAX_RECV_LEN)
                .map_err(DriverError::Shuttle)?;
            self.rx.extend_from_slice(&chunk);
        }
    }

    fn heartbeat_once(&mut self, with_battery: bool) -> Result<HeartbeatStatus, DriverError> {
        let request = if with_battery {
            self.builder.heartbeat_with_battery()
        } else {
            self.builder.heartbeat()
        };
        let response = self.exchange(request)?;
        let hb = response
            .heartbeat()
            .copied()
            .ok_or_else(|| DriverError::UnexpectedResponse(format!("{:?}", response.body)))?;
        if let Some(board) = &self.board {
            board.record_heartbeat(hb);
        }
        Ok(hb)
    }

    /// 最多尝试 `attempts` 次，返回第一次成功解析的心跳
    fn heartbeat_n(&mut self, attempts: u32, with_battery: bool) -> Result<HeartbeatStatus, DriverError> {
        let attempts = attempts.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            match self.heartbeat_once(with_battery) {
                Ok(hb) => return Ok(hb),
                Err(e) => {
                    warn!("Heartbeat attempt {}/{} failed: {}", attempt, attempts, e);
                    last_err = Some(e);
                },
            }
        }
        Err(last_err.unwrap_or_else(|| DriverError::Shuttle(LinkError::Timeout)))
    }

    fn expect_command_ack(response: ShuttleResponse, what: &'static str) -> Result<(), DriverError> {
        match response.body {
            ResponseBody::Command(ack) if ack.is_accepted() => Ok(()),
            ResponseBody::Command(ack) => Err(DriverError::Rejected {
                what,
                code: ack.result,
            }),
            other => Err(DriverError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    /// 下发任务段并确认执行
    pub fn send_task(&mut self, task_no: u8, segments: &[Segment]) -> Result<(), DriverError> {
        let frame = self.builder.task(task_no, segments)?;
        let count = frame.payload.get(1).copied().unwrap_or_default();
        match self.exchange(frame)?.body {
            ResponseBody::Task(ack) if ack.is_accepted() => {},
            ResponseBody::Task(ack) => {
                return Err(DriverError::Rejected {
                    what: "task",
                    code: ack.result,
                });
            },
            other => return Err(DriverError::UnexpectedResponse(format!("{:?}", other))),
        }
        debug!(
            "Task {} accepted ({} segments, {} transmitted)",
            task_no,
            segments.len(),
            transmitted_segment_count(segments)
        );

        let confirm = self.builder.confirm_task(task_no, count);
        let response = self.exchange(confirm)?;
        Self::expect_command_ack(response, "confirm_task")
    }

    fn plan_and_send(&mut self, task_no: u8, target: Coord, with_pallet: bool) -> Result<(), DriverError> {
        let hb = self.heartbeat()?;
        if hb.car_status == ShuttleStatus::Fault {
            warn!("Shuttle faulted at {}, task {} not sent", hb.position, task_no);
            return Err(DriverError::ShuttleFault {
                status: hb.car_status,
                position: hb.position,
            });
        }
        let current = hb.position;
        if current == target {
            debug!("Shuttle already at {}", target);
            return Ok(());
        }
        let segments = if with_pallet {
            self.planner.build_pick_task(current, target)?
        } else {
            self.planner.build_segments(current, target)?
        };
        info!(
            "Shuttle task {}: {} -> {} ({})",
            task_no,
            current,
            target,
            if with_pallet { "carrying" } else { "empty" }
        );
        self.send_task(task_no, &segments)
    }
}

impl<T: ShuttleTransport> ShuttleDevice for ShuttleController<T> {
    fn connect(&mut self) -> Result<(), DriverError> {
        self.open()
    }

    fn disconnect(&mut self) {
        self.transport.disconnect();
        self.rx.clear();
    }

    fn heartbeat(&mut self) -> Result<HeartbeatStatus, DriverError> {
        self.heartbeat_n(self.timing.heartbeat_attempts, false)
    }

    fn battery(&mut self) -> Result<u8, DriverError> {
        let hb = self.heartbeat_n(self.timing.heartbeat_attempts, true)?;
        hb.power
            .ok_or_else(|| DriverError::UnexpectedResponse("heartbeat without battery field".to_string()))
    }

    fn relocate(&mut self, task_no: u8, coord: Coord) -> Result<(), DriverError> {
        info!("Relocating shuttle to {} (task {})", coord, task_no);
        let frame = self.builder.relocate(task_no, coord);
        let response = self.exchange(frame)?;
        Self::expect_command_ack(response, "relocate")?;
        if let Some(board) = &self.board {
            board.record_position(coord);
        }
        Ok(())
    }

    fn move_to(&mut self, task_no: u8, target: Coord) -> Result<(), DriverError> {
        self.plan_and_send(task_no, target, false)
    }

    fn good_move(&mut self, task_no: u8, target: Coord) -> Result<(), DriverError> {
        self.plan_and_send(task_no, target, true)
    }

    fn wait_arrived(&mut self, target: Coord, timeout: Duration) -> Result<(), DriverError> {
        let start = Instant::now();
        let deadline = start + timeout;
        std::thread::sleep(self.timing.initial_grace.min(timeout));

        loop {
            let hb = self.heartbeat_n(1, false)?;
            if hb.car_status == ShuttleStatus::Fault {
                return Err(DriverError::ShuttleFault {
                    status: hb.car_status,
                    position: hb.position,
                });
            }
            if hb.position == target {
                debug!("Shuttle arrived at {} after {:?}", target, start.elapsed());
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(DriverError::Timeout {
                    what: format!("shuttle at {} (last seen {})", target, hb.position),
                    timeout,
                });
            }
            std::thread::sleep(self.timing.poll_interval.min(deadline - now));
        }
    }

    fn action_timeout(&self) -> Duration {
        self.timing.action_timeout
    }
}

impl<T: ShuttleTransport> Drop for ShuttleController<T> {
    fn drop(&mut self) {
        self.transport.disconnect();
    }
}
