//! 连接重试策略
//!
//! 只用于链路层的建连；协调层看到的只有成功或结构化失败。

use crate::LinkError;
use std::time::Duration;
use tracing::warn;

/// 固定间隔重试
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 总尝试次数（至少 1 次）
    pub attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    /// 只尝试一次
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

/// 按策略执行 `op`，返回第一次成功的结果或最后一次错误
///
/// `op` 接收当前尝试序号（从 1 开始）。致命设备错误不再重试。
pub fn with_retry<T, F>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T, LinkError>
where
    F: FnMut(u32) -> Result<T, LinkError>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(LinkError::Device(e)) if e.is_fatal() => return Err(LinkError::Device(e)),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                warn!(
                    "{} failed (attempt {}/{}): {}, retrying in {:?}",
                    what, attempt, attempts, e, policy.interval
                );
                std::thread::sleep(policy.interval);
                attempt += 1;
            },
        }
    }
}
