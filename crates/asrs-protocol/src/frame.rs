//! 穿梭车帧结构
//!
//! ```text
//! HDR(2)=02 FD | DEVICE_ID(1) | LIFE(1) | VT(1) | PAYLOAD(N) | LEN(2,BE) | CRC(2,LE) | FTR(2)=03 FC
//! ```
//!
//! - `VT` 高 4 位为协议版本（1），低 4 位为帧类型。
//! - `LEN` 为整帧字节数（含帧头、帧尾、LEN、CRC）。
//! - `CRC` 覆盖 CRC 字节之前的全部内容。

use crate::ProtocolError;
use crate::crc::crc16_modbus;
use bytes::BufMut;

pub const FRAME_HEADER: [u8; 2] = [0x02, 0xFD];
pub const FRAME_FOOTER: [u8; 2] = [0x03, 0xFC];

/// 协议版本（VT 高 4 位）
pub const PROTOCOL_VERSION: u8 = 1;

/// 空负载帧长度：HDR(2) + DEV(1) + LIFE(1) + VT(1) + LEN(2) + CRC(2) + FTR(2)
pub const FRAME_OVERHEAD: usize = 11;

/// 单帧最大长度（LEN 字段上限）
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// 帧类型（VT 低 4 位）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, num_enum::TryFromPrimitive, num_enum::IntoPrimitive)]
#[repr(u8)]
pub enum FrameType {
    Heartbeat = 0,
    Task = 1,
    Command = 2,
    Debug = 3,
    HeartbeatWithBattery = 10,
}

impl FrameType {
    /// VT 字节：版本在高 4 位，类型在低 4 位
    pub fn vt(self) -> u8 {
        (PROTOCOL_VERSION << 4) | u8::from(self)
    }
}

/// 原始帧（已剥离帧头/帧尾/LEN/CRC）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShuttleFrame {
    pub device_id: u8,
    pub life: u8,
    pub frame_type: FrameType,
    pub payload: Vec<u8>,
}

impl ShuttleFrame {
    pub fn new(device_id: u8, life: u8, frame_type: FrameType, payload: Vec<u8>) -> Self {
        Self {
            device_id,
            life,
            frame_type,
            payload,
        }
    }

    /// 编码后的整帧长度
    pub fn encoded_len(&self) -> usize {
        FRAME_OVERHEAD + self.payload.len()
    }

    /// 编码为线上字节
    ///
    /// 整帧长度超过 `u16::MAX` 时返回 `FrameTooLong`。
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let total = self.encoded_len();
        let len = u16::try_from(total).map_err(|_| ProtocolError::FrameTooLong {
            len: total,
            max: usize::from(u16::MAX),
        })?;
        let mut buf = Vec::with_capacity(total);
        buf.put_slice(&FRAME_HEADER);
        buf.put_u8(self.device_id);
        buf.put_u8(self.life);
        buf.put_u8(self.frame_type.vt());
        buf.put_slice(&self.payload);
        buf.put_u16(len);
        let crc = crc16_modbus(&buf);
        buf.put_u16_le(crc);
        buf.put_slice(&FRAME_FOOTER);
        Ok(buf)
    }

    /// 从缓冲区开头解码一帧
    ///
    /// 返回帧和消耗的字节数。缓冲区可以包含后续帧或残余字节。
    ///
    /// # 错误
    /// - `BadFrame`: 帧头错误、找不到与 LEN 一致的帧尾、CRC 不符
    /// - `UnsupportedFrame`: 校验通过但版本或帧类型未知
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), ProtocolError> {
        if buf.len() < FRAME_OVERHEAD {
            return Err(ProtocolError::BadFrame(format!(
                "too short: {} bytes",
                buf.len()
            )));
        }
        if buf[..2] != FRAME_HEADER {
            return Err(ProtocolError::BadFrame(format!(
                "bad header {:02X} {:02X}",
                buf[0], buf[1]
            )));
        }

        let end = find_frame_end(buf)?;
        let crc_pos = end - 4;
        let expected = crc16_modbus(&buf[..crc_pos]);
        let actual = u16::from_le_bytes([buf[crc_pos], buf[crc_pos + 1]]);
        if expected != actual {
            return Err(ProtocolError::BadFrame(format!(
                "crc mismatch: expected 0x{:04X}, got 0x{:04X}",
                expected, actual
            )));
        }

        let device_id = buf[2];
        let life = buf[3];
        let vt = buf[4];
        let unsupported = ProtocolError::UnsupportedFrame { device_id, life, vt };
        if vt >> 4 != PROTOCOL_VERSION {
            return Err(unsupported);
        }
        let frame_type = FrameType::try_from(vt & 0x0F).map_err(|_| unsupported)?;

        let payload = buf[5..end - 6].to_vec();
        Ok((Self::new(device_id, life, frame_type, payload), end))
    }
}

impl ShuttleFrame {
    /// 缓冲区开头是否已包含一帧完整的字节（不校验 CRC）
    ///
    /// 流式接收时用于判断是否需要继续读取。
    pub fn complete_len(buf: &[u8]) -> Option<usize> {
        if buf.len() < FRAME_OVERHEAD || buf[..2] != FRAME_HEADER {
            return None;
        }
        find_frame_end(buf).ok()
    }
}

/// 查找第一个与 LEN 字段自洽的帧尾，返回帧结束位置（不含）
fn find_frame_end(buf: &[u8]) -> Result<usize, ProtocolError> {
    let mut saw_footer = false;
    let mut end = FRAME_OVERHEAD;
    while end <= buf.len().min(MAX_FRAME_LEN) {
        if buf[end - 2..end] == FRAME_FOOTER {
            saw_footer = true;
            let len = u16::from_be_bytes([buf[end - 6], buf[end - 5]]) as usize;
            if len == end {
                return Ok(end);
            }
        }
        end += 1;
    }
    Err(ProtocolError::BadFrame(if saw_footer {
        "length field does not match frame".to_string()
    } else {
        "missing footer".to_string()
    }))
}

/// 生命计数器
///
/// 每个会话独立；每次出站帧递增，1..=255 循环，永不为 0。
#[derive(Debug, Clone, Default)]
pub struct LifeCounter {
    current: u8,
}

impl LifeCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 取下一个生命值
    pub fn next_life(&mut self) -> u8 {
        self.current = if self.current >= 255 { 1 } else { self.current + 1 };
        self.current
    }

    /// 最近一次发出的生命值（尚未发出时为 0）
    pub fn current(&self) -> u8 {
        self.current
    }

    /// 会话重建时复位
    pub fn reset(&mut self) {
        self.current = 0;
    }
}
