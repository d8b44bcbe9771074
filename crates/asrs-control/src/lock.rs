//! 全局操作锁与取消令牌
//!
//! 操作锁是进程内唯一的互斥令牌：任何复合动作在发出第一条设备 I/O 之前
//! 取得它，在所有退出路径上释放（由 [`OperationGuard`] 的 `Drop` 保证）。
//! 重入不会阻塞，而是立即返回 `Busy`。

use crate::error::CommandError;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// 操作锁状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Released,
    /// 已取得，尚未发出设备 I/O
    Acquired,
    InProgress,
}

#[derive(Debug)]
struct Slot {
    state: LockState,
    holder: Option<&'static str>,
}

/// 操作锁
#[derive(Debug)]
pub struct OperationLock {
    slot: Mutex<Slot>,
    released: Condvar,
}

impl Default for OperationLock {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationLock {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                state: LockState::Released,
                holder: None,
            }),
            released: Condvar::new(),
        }
    }

    pub fn state(&self) -> LockState {
        self.slot.lock().state
    }

    /// 当前持有者的操作名
    pub fn holder(&self) -> Option<&'static str> {
        self.slot.lock().holder
    }

    /// 尝试取得锁；已被持有时立即返回 `Busy`
    pub fn try_acquire(&self, operation: &'static str) -> Result<OperationGuard<'_>, CommandError> {
        let mut slot = self.slot.lock();
        if slot.state != LockState::Released {
            let holder = slot.holder.unwrap_or("unknown");
            debug!("Operation '{}' refused: '{}' holds the lock", operation, holder);
            return Err(CommandError::busy(holder));
        }
        slot.state = LockState::Acquired;
        slot.holder = Some(operation);
        debug!("Operation lock acquired by '{}'", operation);
        Ok(OperationGuard { lock: self })
    }

    /// 等待锁被释放；超时返回 `false`
    pub fn wait_released(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        while slot.state != LockState::Released {
            if self.released.wait_until(&mut slot, deadline).timed_out() {
                return slot.state == LockState::Released;
            }
        }
        true
    }

    fn release(&self) {
        let mut slot = self.slot.lock();
        debug!("Operation lock released by '{}'", slot.holder.unwrap_or("unknown"));
        slot.state = LockState::Released;
        slot.holder = None;
        self.released.notify_all();
    }
}

/// 持锁凭证，析构时释放
#[must_use = "the operation lock is released when the guard is dropped"]
pub struct OperationGuard<'a> {
    lock: &'a OperationLock,
}

impl OperationGuard<'_> {
    /// 标记开始设备 I/O
    pub fn begin(&self) {
        let mut slot = self.lock.slot.lock();
        if slot.state == LockState::Acquired {
            slot.state = LockState::InProgress;
        }
    }
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            warn!("Releasing operation lock while unwinding");
        }
        self.lock.release();
    }
}

/// 协作式取消令牌
///
/// 只在挂起点之间检查；被取消的动作仍然走完释放路径。
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub fn check(&self) -> Result<(), CommandError> {
        if self.is_canceled() {
            Err(CommandError::canceled())
        } else {
            Ok(())
        }
    }
}
