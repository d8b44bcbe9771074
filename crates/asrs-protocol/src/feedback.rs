//! 穿梭车应答帧解析
//!
//! 心跳应答体（16 字节，带电量变体追加 1 字节）：
//!
//! ```text
//! 0  cmd_no
//! 1  result
//! 2  x   3 y   4 z
//! 5  segment_no
//! 6..10  barcode (u32, BE)
//! 10 car_status
//! 11 [pallet_status:高4位 | reverse_status:低4位]
//! 12 drive_direction
//! 13 status_desc
//! 14 have_pallet
//! 15 driver_warning
//! 16 power（仅带电量心跳）
//! ```

use crate::coord::Coord;
use crate::frame::{FrameType, ShuttleFrame};
use crate::ProtocolError;
use bilge::prelude::*;

// ============================================================================
// 枚举类型定义
// ============================================================================

/// 车辆状态
///
/// 未知取值按故障处理。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, num_enum::FromPrimitive, num_enum::IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[repr(u8)]
pub enum ShuttleStatus {
    TaskRunning = 0,
    CmdRunning = 1,
    Ready = 2,
    Paused = 3,
    Charging = 4,
    #[num_enum(default)]
    Fault = 5,
    Sleeping = 6,
    NodeStandby = 7,
}

impl ShuttleStatus {
    pub fn is_fault(self) -> bool {
        self == ShuttleStatus::Fault
    }

    /// 可以接受新任务
    pub fn is_idle(self) -> bool {
        matches!(self, ShuttleStatus::Ready | ShuttleStatus::NodeStandby)
    }
}

// ============================================================================
// 位域结构定义（使用 bilge）
// ============================================================================

/// 心跳 Byte 11：顶升状态（高 4 位）与换向状态（低 4 位）
///
/// bilge 默认 LSB first，第一个字段对应低 4 位。
#[bitsize(8)]
#[derive(FromBits, DebugBits, Clone, Copy, Default)]
pub struct PalletReverseNibbles {
    pub reverse_status: u4, // Bit 0-3
    pub pallet_status: u4,  // Bit 4-7
}

// ============================================================================
// 应答结构体
// ============================================================================

/// 心跳状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HeartbeatStatus {
    pub cmd_no: u8,
    pub result: u8,
    pub position: Coord,
    pub segment_no: u8,
    pub barcode: u32,
    pub car_status: ShuttleStatus,
    pub pallet_status: u8,
    pub reverse_status: u8,
    pub drive_direction: u8,
    pub status_desc: u8,
    pub have_pallet: bool,
    pub driver_warning: bool,
    /// 电量百分比（仅带电量心跳）
    pub power: Option<u8>,
}

impl HeartbeatStatus {
    /// 普通心跳应答体长度
    pub const BODY_LEN: usize = 16;

    /// 从应答体解析
    pub fn parse(body: &[u8], with_battery: bool) -> Result<Self, ProtocolError> {
        let expected = Self::BODY_LEN + usize::from(with_battery);
        if body.len() < expected {
            return Err(ProtocolError::InvalidLength {
                what: "heartbeat body",
                expected,
                actual: body.len(),
            });
        }

        let nibbles = PalletReverseNibbles::from(u8::new(body[11]));
        Ok(Self {
            cmd_no: body[0],
            result: body[1],
            position: Coord::new(body[2], body[3], body[4]),
            segment_no: body[5],
            barcode: u32::from_be_bytes([body[6], body[7], body[8], body[9]]),
            car_status: ShuttleStatus::from(body[10]),
            pallet_status: nibbles.pallet_status().value(),
            reverse_status: nibbles.reverse_status().value(),
            drive_direction: body[12],
            status_desc: body[13],
            have_pallet: body[14] != 0,
            driver_warning: body[15] != 0,
            power: with_battery.then(|| body[16]),
        })
    }

    /// 编码为应答体（车辆模拟器与测试使用）
    pub fn encode_body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(Self::BODY_LEN + 1);
        body.extend_from_slice(&[
            self.cmd_no,
            self.result,
            self.position.x,
            self.position.y,
            self.position.z,
            self.segment_no,
        ]);
        body.extend_from_slice(&self.barcode.to_be_bytes());
        body.push(self.car_status.into());
        body.push(((self.pallet_status & 0x0F) << 4) | (self.reverse_status & 0x0F));
        body.extend_from_slice(&[
            self.drive_direction,
            self.status_desc,
            u8::from(self.have_pallet),
            u8::from(self.driver_warning),
        ]);
        if let Some(power) = self.power {
            body.push(power);
        }
        body
    }

    /// 以给定位置和状态构造一条“就绪”心跳（模拟器使用）
    pub fn ready_at(position: Coord) -> Self {
        Self {
            cmd_no: 0,
            result: 0,
            position,
            segment_no: 0,
            barcode: 0,
            car_status: ShuttleStatus::Ready,
            pallet_status: 0,
            reverse_status: 0,
            drive_direction: 0,
            status_desc: 0,
            have_pallet: false,
            driver_warning: false,
            power: None,
        }
    }
}

/// 任务帧应答
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskAck {
    pub task_no: u8,
    pub result: u8,
}

/// 工作指令应答
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandAck {
    pub cmd_no: u8,
    pub result: u8,
}

/// 应答结果码：0 表示接受
pub const RESULT_ACCEPTED: u8 = 0;

impl TaskAck {
    pub fn is_accepted(&self) -> bool {
        self.result == RESULT_ACCEPTED
    }
}

impl CommandAck {
    pub fn is_accepted(&self) -> bool {
        self.result == RESULT_ACCEPTED
    }
}

fn parse_ack(body: &[u8], what: &'static str) -> Result<(u8, u8), ProtocolError> {
    if body.len() < 2 {
        return Err(ProtocolError::InvalidLength {
            what,
            expected: 2,
            actual: body.len(),
        });
    }
    Ok((body[0], body[1]))
}

/// 应答体
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    Heartbeat(HeartbeatStatus),
    Task(TaskAck),
    Command(CommandAck),
    Debug(Vec<u8>),
}

/// 解析后的应答帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShuttleResponse {
    pub device_id: u8,
    pub life: u8,
    pub frame_type: FrameType,
    pub body: ResponseBody,
}

impl ShuttleResponse {
    /// 从线上字节解析（只解析缓冲区中的第一帧）
    pub fn parse(buf: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = ShuttleFrame::decode(buf)?;
        Self::try_from(frame)
    }

    pub fn heartbeat(&self) -> Option<&HeartbeatStatus> {
        match &self.body {
            ResponseBody::Heartbeat(hb) => Some(hb),
            _ => None,
        }
    }
}

impl TryFrom<ShuttleFrame> for ShuttleResponse {
    type Error = ProtocolError;

    fn try_from(frame: ShuttleFrame) -> Result<Self, Self::Error> {
        let body = match frame.frame_type {
            FrameType::Heartbeat => ResponseBody::Heartbeat(HeartbeatStatus::parse(&frame.payload, false)?),
            FrameType::HeartbeatWithBattery => {
                ResponseBody::Heartbeat(HeartbeatStatus::parse(&frame.payload, true)?)
            },
            FrameType::Task => {
                let (task_no, result) = parse_ack(&frame.payload, "task ack")?;
                ResponseBody::Task(TaskAck { task_no, result })
            },
            FrameType::Command => {
                let (cmd_no, result) = parse_ack(&frame.payload, "command ack")?;
                ResponseBody::Command(CommandAck { cmd_no, result })
            },
            FrameType::Debug => ResponseBody::Debug(frame.payload),
        };
        Ok(Self {
            device_id: frame.device_id,
            life: frame.life,
            frame_type: frame.frame_type,
            body,
        })
    }
}
