//! 设备状态看板
//!
//! 记录最近一次观测到的车辆心跳与提升机状态。写入方为持有设备会话的控制器，
//! 读取方（只读查询）无需打开设备会话，也不争用操作锁。

use arc_swap::ArcSwapOption;
use asrs_protocol::{Coord, HeartbeatStatus, LiftState, ShuttleStatus};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 带观测时间的快照
#[derive(Debug, Clone, Copy)]
pub struct Observed<T> {
    pub value: T,
    pub at: Instant,
}

impl<T> Observed<T> {
    pub fn age(&self) -> Duration {
        self.at.elapsed()
    }
}

/// 最近观测到的设备状态（无锁读取）
#[derive(Debug, Default)]
pub struct StatusBoard {
    shuttle: ArcSwapOption<Observed<HeartbeatStatus>>,
    lift: ArcSwapOption<Observed<LiftState>>,
    battery: ArcSwapOption<Observed<u8>>,
}

impl StatusBoard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_heartbeat(&self, hb: HeartbeatStatus) {
        if let Some(power) = hb.power {
            self.battery.store(Some(Arc::new(Observed {
                value: power,
                at: Instant::now(),
            })));
        }
        self.shuttle.store(Some(Arc::new(Observed {
            value: hb,
            at: Instant::now(),
        })));
    }

    pub fn record_lift(&self, state: LiftState) {
        self.lift.store(Some(Arc::new(Observed {
            value: state,
            at: Instant::now(),
        })));
    }

    /// 坐标重定位后同步看板中的车辆位置
    pub fn record_position(&self, position: Coord) {
        if let Some(last) = self.shuttle.load_full() {
            let mut hb = last.value;
            hb.position = position;
            self.shuttle.store(Some(Arc::new(Observed { value: hb, at: last.at })));
        }
    }

    pub fn heartbeat(&self) -> Option<Observed<HeartbeatStatus>> {
        self.shuttle.load().as_deref().copied()
    }

    pub fn position(&self) -> Option<Coord> {
        self.heartbeat().map(|o| o.value.position)
    }

    pub fn shuttle_status(&self) -> Option<ShuttleStatus> {
        self.heartbeat().map(|o| o.value.car_status)
    }

    pub fn battery(&self) -> Option<u8> {
        self.battery.load().as_deref().map(|o| o.value)
    }

    pub fn lift(&self) -> Option<Observed<LiftState>> {
        self.lift.load().as_deref().copied()
    }

    pub fn clear(&self) {
        self.shuttle.store(None);
        self.lift.store(None);
        self.battery.store(None);
    }
}
