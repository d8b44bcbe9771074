//! # ASRS Link Layer
//!
//! 设备链路抽象层：穿梭车 TCP 会话与 PLC（S7 over ISO-on-TCP）会话。
//!
//! - [`ShuttleTransport`]：字节级收发，帧对齐由上层负责
//! - [`PlcTransport`]：DB 区字节/位读写
//! - [`PlcLink`]：在 `PlcTransport` 之上提供写后回读校验、`wait_bit`、`pulse`
//! - [`with_retry`]：连接阶段的固定间隔重试

use asrs_protocol::ProtocolError;
use asrs_protocol::plc_map::BitAddr;
use asrs_protocol::s7::CpuInfo;
use std::time::Duration;
use thiserror::Error;

pub mod plc_link;
pub mod retry;
pub mod s7_client;
pub mod tcp;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use plc_link::{PlcLink, PlcTiming};
pub use retry::{RetryPolicy, with_retry};
pub use s7_client::S7Client;
pub use tcp::TcpShuttleLink;

/// 单次接收的最大字节数
pub const MAX_RECV_LEN: usize = 4096;

/// 链路层统一错误类型
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Device Error: {0}")]
    Device(#[from] LinkDeviceError),
    #[error("Protocol Error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Read timeout")]
    Timeout,
    /// `wait_bit` 等轮询在截止时间内未观察到目标状态
    #[error("Timed out after {timeout:?} waiting for {what}")]
    WaitTimeout { what: String, timeout: Duration },
    #[error("Connection closed by peer")]
    Closed,
    #[error("Not connected")]
    NotConnected,
    /// 单次写入超出 S7 地址长度字段
    #[error("Block of {len} bytes exceeds the 16-bit length field")]
    BlockTooLarge { len: usize },
    /// 写入后回读不一致
    #[error("Readback mismatch at {addr}: wrote {expected}, read {actual}")]
    ReadbackMismatch {
        addr: String,
        expected: String,
        actual: String,
    },
}

impl LinkError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, LinkError::Timeout | LinkError::WaitTimeout { .. })
    }
}

/// 设备错误的结构化分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkDeviceErrorKind {
    Unknown,
    ConnectionRefused,
    Unreachable,
    InvalidResponse,
    AddressOutOfRange,
    ObjectNotFound,
    AccessDenied,
    /// 写入了只读诊断区
    ReadOnlyArea,
}

/// 结构化设备错误
#[derive(Error, Debug, Clone)]
#[error("{kind:?}: {message}")]
pub struct LinkDeviceError {
    pub kind: LinkDeviceErrorKind,
    pub message: String,
}

impl LinkDeviceError {
    pub fn new(kind: LinkDeviceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// 重试无意义的错误
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            LinkDeviceErrorKind::AccessDenied
                | LinkDeviceErrorKind::ReadOnlyArea
                | LinkDeviceErrorKind::ObjectNotFound
        )
    }
}

impl From<String> for LinkDeviceError {
    fn from(message: String) -> Self {
        Self::new(LinkDeviceErrorKind::Unknown, message)
    }
}

impl From<&str> for LinkDeviceError {
    fn from(message: &str) -> Self {
        Self::new(LinkDeviceErrorKind::Unknown, message)
    }
}

/// 穿梭车字节传输
///
/// 一问一答：调用方每次发送一帧请求，再读取一帧应答。
pub trait ShuttleTransport: Send {
    /// 建立连接（按实现自身的重试策略）
    fn connect(&mut self) -> Result<(), LinkError>;
    /// 断开连接；未连接时为空操作
    fn disconnect(&mut self);
    fn is_connected(&self) -> bool;
    /// 完整发送缓冲区；失败时会话被拆除
    fn send(&mut self, bytes: &[u8]) -> Result<(), LinkError>;
    /// 在截止时间内读取至多 `max` 字节；对端关闭返回 `Closed`
    fn recv(&mut self, timeout: Duration, max: usize) -> Result<Vec<u8>, LinkError>;
}

/// PLC 数据块传输
pub trait PlcTransport: Send {
    /// 建立新会话（总是丢弃旧会话）
    fn connect(&mut self) -> Result<(), LinkError>;
    fn disconnect(&mut self);
    fn is_connected(&self) -> bool;
    /// 读取 CPU 组件标识（活性检查）
    fn cpu_info(&mut self) -> Result<CpuInfo, LinkError>;
    fn read_area(&mut self, db: u16, start: u16, len: u16) -> Result<Vec<u8>, LinkError>;
    fn write_area(&mut self, db: u16, start: u16, data: &[u8]) -> Result<(), LinkError>;

    fn read_bit(&mut self, addr: BitAddr) -> Result<bool, LinkError> {
        let byte = self.read_area(addr.db, addr.byte, 1)?;
        let value = byte.first().ok_or_else(|| {
            LinkDeviceError::new(LinkDeviceErrorKind::InvalidResponse, "empty read")
        })?;
        Ok(value & (1 << addr.bit) != 0)
    }

    /// 默认实现为字节级读-改-写
    fn write_bit(&mut self, addr: BitAddr, value: bool) -> Result<(), LinkError> {
        let current = self.read_area(addr.db, addr.byte, 1)?;
        let mut byte = current.first().copied().unwrap_or(0);
        if value {
            byte |= 1 << addr.bit;
        } else {
            byte &= !(1 << addr.bit);
        }
        self.write_area(addr.db, addr.byte, &[byte])
    }
}

impl<T: ShuttleTransport + ?Sized> ShuttleTransport for Box<T> {
    fn connect(&mut self) -> Result<(), LinkError> {
        (**self).connect()
    }

    fn disconnect(&mut self) {
        (**self).disconnect()
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        (**self).send(bytes)
    }

    fn recv(&mut self, timeout: Duration, max: usize) -> Result<Vec<u8>, LinkError> {
        (**self).recv(timeout, max)
    }
}

impl<T: PlcTransport + ?Sized> PlcTransport for Box<T> {
    fn connect(&mut self) -> Result<(), LinkError> {
        (**self).connect()
    }

    fn disconnect(&mut self) {
        (**self).disconnect()
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn cpu_info(&mut self) -> Result<CpuInfo, LinkError> {
        (**self).cpu_info()
    }

    fn read_area(&mut self, db: u16, start: u16, len: u16) -> Result<Vec<u8>, LinkError> {
        (**self).read_area(db, start, len)
    }

    fn write_area(&mut self, db: u16, start: u16, data: &[u8]) -> Result<(), LinkError> {
        (**self).write_area(db, start, data)
    }

    fn read_bit(&mut self, addr: BitAddr) -> Result<bool, LinkError> {
        (**self).read_bit(addr)
    }

    fn write_bit(&mut self, addr: BitAddr, value: bool) -> Result<(), LinkError> {
        (**self).write_bit(addr, value)
    }
}
