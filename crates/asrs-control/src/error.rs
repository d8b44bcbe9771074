//! 命令层错误类型定义
//!
//! 所有下层错误最终折叠为 [`CommandError`]：一个封闭的 [`ErrorKind`] 加上
//! 人类可读的消息。网关对外只暴露这一种失败形态。

use crate::store::StoreError;
use asrs_driver::DriverError;
use asrs_link::LinkError;
use asrs_planner::PlannerError;
use asrs_protocol::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// 错误分类（封闭集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    BadFrame,
    UnsupportedFrame,
    LinkError,
    Timeout,
    PlcPrecondition,
    PlcReadbackMismatch,
    IllegalLiftState,
    ShuttleError,
    DifferentLayer,
    /// 库位或托盘规则不满足
    PreconditionFailed,
    PalletAlreadyStored,
    PalletNotFound,
    PalletCellMismatch,
    QrMismatch,
    NotEnoughStagingSpace,
    /// 已有复合动作在执行
    Busy,
    Canceled,
    /// 扫码器未读到条码
    NoCode,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// 命令失败
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct CommandError {
    pub kind: ErrorKind,
    pub message: String,
}

impl CommandError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn busy(what: &str) -> Self {
        Self::new(ErrorKind::Busy, format!("operation '{}' is in progress", what))
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PreconditionFailed, message)
    }

    pub fn canceled() -> Self {
        Self::new(ErrorKind::Canceled, "operation canceled")
    }

    /// 在消息后追加上下文，保留分类
    pub fn context(mut self, context: impl fmt::Display) -> Self {
        self.message = format!("{}; {}", self.message, context);
        self
    }
}

fn protocol_kind(err: &ProtocolError) -> ErrorKind {
    match err {
        ProtocolError::UnsupportedFrame { .. } => ErrorKind::UnsupportedFrame,
        _ => ErrorKind::BadFrame,
    }
}

fn link_kind(err: &LinkError) -> ErrorKind {
    match err {
        LinkError::Timeout | LinkError::WaitTimeout { .. } => ErrorKind::Timeout,
        LinkError::ReadbackMismatch { .. } => ErrorKind::PlcReadbackMismatch,
        LinkError::Protocol(e) => protocol_kind(e),
        _ => ErrorKind::LinkError,
    }
}

impl From<DriverError> for CommandError {
    fn from(err: DriverError) -> Self {
        let kind = match &err {
            DriverError::Shuttle(e) | DriverError::Plc(e) => link_kind(e),
            DriverError::Protocol(e) => protocol_kind(e),
            DriverError::Planner(_) | DriverError::InvalidInput(_) => ErrorKind::PreconditionFailed,
            DriverError::Rejected { .. }
            | DriverError::UnexpectedResponse(_)
            | DriverError::ShuttleFault { .. } => ErrorKind::ShuttleError,
            DriverError::PlcPrecondition(_) => ErrorKind::PlcPrecondition,
            DriverError::IllegalLiftState(_) | DriverError::WrongFloor { .. } => {
                ErrorKind::IllegalLiftState
            },
            DriverError::Timeout { .. } => ErrorKind::Timeout,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<PlannerError> for CommandError {
    fn from(err: PlannerError) -> Self {
        Self::precondition(err.to_string())
    }
}

impl From<StoreError> for CommandError {
    fn from(err: StoreError) -> Self {
        let kind = match &err {
            StoreError::PalletAlreadyStored { .. } => ErrorKind::PalletAlreadyStored,
            StoreError::PalletNotFound(_) => ErrorKind::PalletNotFound,
            _ => ErrorKind::PreconditionFailed,
        };
        Self::new(kind, err.to_string())
    }
}
