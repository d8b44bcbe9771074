//! # ASRS Protocol
//!
//! 立体库核心协议定义（无硬件依赖）
//!
//! ## 模块
//!
//! - `coord`: 网格坐标 `(x, y, z)` 与固定库位（提升机、接驳位、暂存位）
//! - `crc`: CRC-16/MODBUS 校验
//! - `frame`: 穿梭车帧结构（帧头/帧尾、LEN、CRC）与生命计数器
//! - `request`: 穿梭车请求帧构建（心跳、任务、确认、工作指令）
//! - `feedback`: 穿梭车应答帧解析（心跳状态、任务/指令应答）
//! - `plc_map`: PLC 数据块地址表、站台编码、提升机状态解码
//! - `s7`: S7comm over ISO-on-TCP 报文编解码
//!
//! ## 字节序
//!
//! - 穿梭车帧：LEN 为大端，CRC 为小端（低字节在前）。
//! - PLC 数据块：所有 16 位字段均为大端。

pub mod coord;
pub mod crc;
pub mod feedback;
pub mod frame;
pub mod plc_map;
pub mod request;
pub mod s7;

// 重新导出常用类型
pub use coord::Coord;
pub use crc::crc16_modbus;
pub use feedback::*;
pub use frame::*;
pub use plc_map::{BitAddr, FloorSignal, LiftState, LiftTaskKind, Station, WordAddr};
pub use request::*;

use thiserror::Error;

/// 协议解析错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// 帧头/帧尾错误、长度不符或 CRC 校验失败
    #[error("Bad frame: {0}")]
    BadFrame(String),

    /// 未知帧类型（保留帧头信息以便上层记录）
    #[error("Unsupported frame: device_id={device_id}, life={life}, vt=0x{vt:02X}")]
    UnsupportedFrame { device_id: u8, life: u8, vt: u8 },

    #[error("Invalid body length for {what}: expected {expected}, got {actual}")]
    InvalidLength {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid value for field {field}: {value}")]
    InvalidValue { field: String, value: u32 },

    #[error("Invalid coordinate: {0}")]
    InvalidCoord(String),

    /// 整帧超出 LEN 字段能表示的长度
    #[error("Frame too long: {len} bytes exceeds {max}")]
    FrameTooLong { len: usize, max: usize },

    /// S7 报文层错误（TPKT/COTP/S7 头或数据项返回码）
    #[error("S7 error: {0}")]
    S7(String),
}

/// 大端字节序转 u16
pub fn bytes_to_u16_be(bytes: [u8; 2]) -> u16 {
    u16::from_be_bytes(bytes)
}

/// u16 转大端字节序
pub fn u16_to_bytes_be(value: u16) -> [u8; 2] {
    value.to_be_bytes()
}
