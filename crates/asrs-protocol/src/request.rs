//! 穿梭车请求帧构建
//!
//! 负载布局：
//! - 心跳 / 带电量心跳：空负载
//! - 任务帧：`task_no | segment_count | (x y z action) × n`
//! - 工作指令：`cmd_no | cmd_id | task_no | p0 p1 p2 p3`

use crate::coord::Coord;
use crate::frame::{FrameType, LifeCounter, ShuttleFrame};
use crate::ProtocolError;

/// 默认设备号
pub const DEFAULT_DEVICE_ID: u8 = 2;

/// 工作指令 ID
pub mod cmd_id {
    /// 更新坐标（仅在提升机内部使用）
    pub const UPDATE_COORDINATES: u8 = 0x50;
    /// 确认执行已下发的任务
    pub const CONFIRM_TASK: u8 = 0x9D;
}

/// 段动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, num_enum::TryFromPrimitive, num_enum::IntoPrimitive)]
#[repr(u8)]
pub enum SegmentAction {
    /// 直行
    #[default]
    Straight = 0,
    /// 顶升取货
    Pick = 1,
    /// 下降放货
    Drop = 2,
    /// 换向到 x 轴行驶
    XTurn = 5,
    /// 换向到 y 轴行驶
    YTurn = 6,
}

/// 任务段（路径关键点 + 到达后的动作）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Segment {
    pub x: u8,
    pub y: u8,
    pub z: u8,
    pub action: SegmentAction,
}

impl Segment {
    pub fn new(coord: Coord, action: SegmentAction) -> Self {
        Self {
            x: coord.x,
            y: coord.y,
            z: coord.z,
            action,
        }
    }

    pub fn coord(&self) -> Coord {
        Coord::new(self.x, self.y, self.z)
    }
}

/// 固件口径的段数：原始段数 + 每个非直行动作额外计 1
pub fn transmitted_segment_count(segments: &[Segment]) -> usize {
    segments.len()
        + segments
            .iter()
            .filter(|s| s.action != SegmentAction::Straight)
            .count()
}

/// 请求帧构建器
///
/// 持有设备号和会话生命计数器，每构建一帧生命值递增一次。
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    device_id: u8,
    life: LifeCounter,
}

impl FrameBuilder {
    pub fn new(device_id: u8) -> Self {
        Self {
            device_id,
            life: LifeCounter::new(),
        }
    }

    pub fn device_id(&self) -> u8 {
        self.device_id
    }

    /// 会话重建时复位生命计数器
    pub fn reset_life(&mut self) {
        self.life.reset();
    }

    fn frame(&mut self, frame_type: FrameType, payload: Vec<u8>) -> ShuttleFrame {
        ShuttleFrame::new(self.device_id, self.life.next_life(), frame_type, payload)
    }

    pub fn heartbeat(&mut self) -> ShuttleFrame {
        self.frame(FrameType::Heartbeat, Vec::new())
    }

    pub fn heartbeat_with_battery(&mut self) -> ShuttleFrame {
        self.frame(FrameType::HeartbeatWithBattery, Vec::new())
    }

    /// 路径任务帧
    ///
    /// # 错误
    /// 段数（固件口径）超过 255 时返回 `InvalidValue`。
    pub fn task(&mut self, task_no: u8, segments: &[Segment]) -> Result<ShuttleFrame, ProtocolError> {
        let count = transmitted_segment_count(segments);
        let count = u8::try_from(count).map_err(|_| ProtocolError::InvalidValue {
            field: "segment_count".to_string(),
            value: count as u32,
        })?;

        let mut payload = Vec::with_capacity(2 + segments.len() * 4);
        payload.push(task_no);
        payload.push(count);
        for s in segments {
            payload.extend_from_slice(&[s.x, s.y, s.z, s.action.into()]);
        }
        Ok(self.frame(FrameType::Task, payload))
    }

    /// 任务确认（通知车辆开始执行）
    pub fn confirm_task(&mut self, task_no: u8, segment_count: u8) -> ShuttleFrame {
        self.work_command(task_no, task_no, cmd_id::CONFIRM_TASK, [segment_count, 0, 0, 0])
    }

    /// 坐标重定位（UPDATE_COORDINATES）
    pub fn relocate(&mut self, task_no: u8, coord: Coord) -> ShuttleFrame {
        self.work_command(
            task_no,
            task_no,
            cmd_id::UPDATE_COORDINATES,
            [coord.x, coord.y, coord.z, 0],
        )
    }

    pub fn work_command(&mut self, task_no: u8, cmd_no: u8, cmd_id: u8, params: [u8; 4]) -> ShuttleFrame {
        let mut payload = vec![cmd_no, cmd_id, task_no];
        payload.extend_from_slice(&params);
        self.frame(FrameType::Command, payload)
    }
}

impl Default for FrameBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_DEVICE_ID)
    }
}
