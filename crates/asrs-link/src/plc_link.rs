//! PLC 会话
//!
//! 在 [`PlcTransport`] 之上提供：
//! - 幂等的 `connect` / `disconnect`，建连后读取 CPU 标识确认活性
//! - 写后回读校验的 `write_block` / `write_u16`
//! - 大端 `read_u16` / `write_u16`
//! - `wait_bit`：初始宽限后按固定周期轮询，截止时间到返回超时
//! - `pulse`：置位、回读确认、（可选稳定延时）、清零

use crate::retry::{RetryPolicy, with_retry};
use crate::{LinkDeviceError, LinkDeviceErrorKind, LinkError, PlcTransport};
use asrs_protocol::plc_map::{BitAddr, DB_RESERVED, WordAddr};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace};

/// 轮询节奏
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlcTiming {
    /// 轮询周期
    pub poll_interval: Duration,
    /// 第一次读取前的宽限
    pub initial_grace: Duration,
    /// 上升沿锁存信号在清零前的稳定延时
    pub settle: Duration,
}

impl Default for PlcTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            initial_grace: Duration::from_secs(2),
            settle: Duration::from_secs(1),
        }
    }
}

pub struct PlcLink<T: PlcTransport> {
    transport: T,
    retry: RetryPolicy,
    timing: PlcTiming,
    connected: bool,
}

impl<T: PlcTransport> PlcLink<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            retry: RetryPolicy::default(),
            timing: PlcTiming::default(),
            connected: false,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timing(mut self, timing: PlcTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn timing(&self) -> &PlcTiming {
        &self.timing
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn is_connected(&self) -> bool {
        self.connected && self.transport.is_connected()
    }

    /// 建立会话；已连接时为空操作
    pub fn connect(&mut self) -> Result<(), LinkError> {
        if self.is_connected() {
            return Ok(());
        }
        let transport = &mut self.transport;
        let info = with_retry(&self.retry, "PLC connect", |_| {
            // 总是丢弃旧会话，避免半开连接
            transport.disconnect();
            transport.connect()?;
            transport.cpu_info()
        })?;
        info!(
            "PLC online: module={} type={} serial={}",
            info.module_name, info.module_type, info.serial_number
        );
        self.connected = true;
        Ok(())
    }

    /// 断开会话；可重复调用
    pub fn disconnect(&mut self) {
        if self.connected || self.transport.is_connected() {
            self.transport.disconnect();
            debug!("PLC disconnected");
        }
        self.connected = false;
    }

    fn ensure_connected(&self) -> Result<(), LinkError> {
        if self.is_connected() { Ok(()) } else { Err(LinkError::NotConnected) }
    }

    fn ensure_writable(db: u16) -> Result<(), LinkError> {
        if DB_RESERVED.contains(&db) {
            return Err(LinkDeviceError::new(
                LinkDeviceErrorKind::ReadOnlyArea,
                format!("DB{} is read-only", db),
            )
            .into());
        }
        Ok(())
    }

    pub fn read_block(&mut self, db: u16, offset: u16, size: u16) -> Result<Vec<u8>, LinkError> {
        self.ensure_connected()?;
        let data = self.transport.read_area(db, offset, size)?;
        trace!("read DB{}.{}+{}: {}", db, offset, size, hex::encode(&data));
        Ok(data)
    }

    /// 写入并回读比较
    pub fn write_block(&mut self, db: u16, offset: u16, bytes: &[u8]) -> Result<(), LinkError> {
        self.ensure_connected()?;
        Self::ensure_writable(db)?;
        let len = u16::try_from(bytes.len()).map_err(|_| LinkError::BlockTooLarge { len: bytes.len() })?;
        self.transport.write_area(db, offset, bytes)?;
        let readback = self.transport.read_area(db, offset, len)?;
        if readback != bytes {
            error!(
                "Readback mismatch at DB{}.{}: wrote {}, read {}",
                db,
                offset,
                hex::encode(bytes),
                hex::encode(&readback)
            );
            return Err(LinkError::ReadbackMismatch {
                addr: format!("DB{}.{}", db, offset),
                expected: hex::encode(bytes),
                actual: hex::encode(&readback),
            });
        }
        trace!("wrote DB{}.{}: {}", db, offset, hex::encode(bytes));
        Ok(())
    }

    pub fn read_bit(&mut self, addr: BitAddr) -> Result<bool, LinkError> {
        self.ensure_connected()?;
        self.transport.read_bit(addr)
    }

    pub fn write_bit(&mut self, addr: BitAddr, value: bool) -> Result<(), LinkError> {
        self.ensure_connected()?;
        Self::ensure_writable(addr.db)?;
        self.transport.write_bit(addr, value)?;
        trace!("wrote {} = {}", addr, u8::from(value));
        Ok(())
    }

    pub fn read_u16(&mut self, addr: WordAddr) -> Result<u16, LinkError> {
        let bytes = self.read_block(addr.db, addr.offset, 2)?;
        match bytes.as_slice() {
            [hi, lo] => Ok(u16::from_be_bytes([*hi, *lo])),
            _ => Err(LinkDeviceError::new(
                LinkDeviceErrorKind::InvalidResponse,
                format!("{}: expected 2 bytes, got {}", addr, bytes.len()),
            )
            .into()),
        }
    }

    pub fn write_u16(&mut self, addr: WordAddr, value: u16) -> Result<(), LinkError> {
        self.write_block(addr.db, addr.offset, &value.to_be_bytes())
    }

    /// 等待位变为 `target`
    ///
    /// 先等待初始宽限，之后按轮询周期读取；首次匹配即返回。
    /// 宽限计入 `timeout`。
    pub fn wait_bit(&mut self, addr: BitAddr, target: bool, timeout: Duration) -> Result<(), LinkError> {
        self.ensure_connected()?;
        let start = Instant::now();
        let deadline = start + timeout;
        std::thread::sleep(self.timing.initial_grace.min(timeout));

        loop {
            if self.transport.read_bit(addr)? == target {
                debug!("{} == {} after {:?}", addr, u8::from(target), start.elapsed());
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(LinkError::WaitTimeout {
                    what: format!("{} == {}", addr, u8::from(target)),
                    timeout,
                });
            }
            std::thread::sleep(self.timing.poll_interval.min(deadline - now));
        }
    }

    /// 上升沿脉冲：置 1，回读确认，`settle` 时等待稳定延时，再清 0
    pub fn pulse(&mut self, addr: BitAddr, settle: bool) -> Result<(), LinkError> {
        self.write_bit(addr, true)?;
        if !self.transport.read_bit(addr)? {
            error!("Pulse on {} not latched", addr);
            return Err(LinkError::ReadbackMismatch {
                addr: addr.to_string(),
                expected: "1".to_string(),
                actual: "0".to_string(),
            });
        }
        if settle {
            std::thread::sleep(self.timing.settle);
        }
        self.write_bit(addr, false)?;
        debug!("Pulsed {}", addr);
        Ok(())
    }

    /// 置 1 并回读确认（不清零）
    pub fn set_and_verify(&mut self, addr: BitAddr) -> Result<(), LinkError> {
        self.write_bit(addr, true)?;
        if self.transport.read_bit(addr)? {
            Ok(())
        } else {
            Err(LinkError::ReadbackMismatch {
                addr: addr.to_string(),
                expected: "1".to_string(),
                actual: "0".to_string(),
            })
        }
    }
}

impl<T: PlcTransport> Drop for PlcLink<T> {
    fn drop(&mut self) {
        self.disconnect();
    }
}
