//! 驱动层错误类型定义

use asrs_link::LinkError;
use asrs_planner::PlannerError;
use asrs_protocol::{Coord, ProtocolError, ShuttleStatus};
use std::time::Duration;
use thiserror::Error;

/// 驱动层错误类型
#[derive(Error, Debug)]
pub enum DriverError {
    /// 穿梭车链路错误
    #[error("Shuttle link error: {0}")]
    Shuttle(#[source] LinkError),

    /// PLC 链路错误
    #[error("PLC link error: {0}")]
    Plc(#[source] LinkError),

    /// 帧解析错误
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// 路径规划失败
    #[error("Planner error: {0}")]
    Planner(#[from] PlannerError),

    /// 车辆拒绝任务或指令
    #[error("Shuttle rejected {what} with code {code}")]
    Rejected { what: &'static str, code: u8 },

    /// 应答类型与请求不匹配
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// 车辆处于故障状态
    #[error("Shuttle reports {status:?} at {position}")]
    ShuttleFault { status: ShuttleStatus, position: Coord },

    /// PLC 前置条件不满足（故障、非自动、离线）
    #[error("PLC precondition failed: {0}")]
    PlcPrecondition(String),

    /// 提升机状态组合无对应任务类型
    #[error("Illegal lift state: {0}")]
    IllegalLiftState(String),

    /// 提升机停靠层与目标不符
    #[error("Lift stopped at floor {actual}, expected {expected}")]
    WrongFloor { expected: u8, actual: u16 },

    /// 轮询超时
    #[error("Timed out after {timeout:?} waiting for {what}")]
    Timeout { what: String, timeout: Duration },

    /// 无效输入
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl DriverError {
    pub fn is_timeout(&self) -> bool {
        match self {
            DriverError::Timeout { .. } => true,
            DriverError::Shuttle(e) | DriverError::Plc(e) => e.is_timeout(),
            _ => false,
        }
    }
}
