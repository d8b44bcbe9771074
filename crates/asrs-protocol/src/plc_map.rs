//! PLC 数据块地址表
//!
//! - `DB2`：远程 / 输送线在线标志
//! - `DB11`：提升机与输送线状态输入（运行、空闲、有货、有车、故障、自动、各站台到位、扫码缓冲）
//! - `DB12`：命令输出（任务类型/编号/目标层、启动、到层、各层送料/取货信号、站台路由目标）
//!
//! `DB5` 与 `DB9` 为只读诊断区，不写入。所有 16 位字段为大端。

use crate::ProtocolError;
use crate::coord::FLOOR_COUNT;
use bilge::prelude::*;
use std::fmt;

pub const DB_REMOTE: u16 = 2;
pub const DB_STATUS: u16 = 11;
pub const DB_COMMAND: u16 = 12;
/// 诊断区（只读）
pub const DB_RESERVED: [u16; 2] = [5, 9];

/// 位地址 `DBn.byte.bit`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BitAddr {
    pub db: u16,
    pub byte: u16,
    pub bit: u8,
}

impl BitAddr {
    pub const fn new(db: u16, byte: u16, bit: u8) -> Self {
        Self { db, byte, bit }
    }

    /// S7 位寻址（字节偏移 * 8 + 位号）
    pub fn bit_offset(&self) -> u32 {
        u32::from(self.byte) * 8 + u32::from(self.bit)
    }
}

impl fmt::Display for BitAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DB{}.{}.{}", self.db, self.byte, self.bit)
    }
}

/// 16 位字地址 `DBn.offset`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WordAddr {
    pub db: u16,
    pub offset: u16,
}

impl WordAddr {
    pub const fn new(db: u16, offset: u16) -> Self {
        Self { db, offset }
    }
}

impl fmt::Display for WordAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DB{}.W{}", self.db, self.offset)
    }
}

/// DB2 在线标志
pub mod remote {
    use super::{BitAddr, DB_REMOTE};

    pub const REMOTE_ONLINE: BitAddr = BitAddr::new(DB_REMOTE, 0, 0);
    pub const CONVEYOR_ONLINE: BitAddr = BitAddr::new(DB_REMOTE, 0, 1);
}

/// DB11 状态输入
pub mod status {
    use super::{BitAddr, DB_STATUS, WordAddr};

    pub const RUNNING: BitAddr = BitAddr::new(DB_STATUS, 0, 0);
    pub const IDLE: BitAddr = BitAddr::new(DB_STATUS, 0, 1);
    pub const NO_CARGO: BitAddr = BitAddr::new(DB_STATUS, 0, 2);
    pub const HAS_CARGO: BitAddr = BitAddr::new(DB_STATUS, 0, 3);
    pub const HAS_CAR: BitAddr = BitAddr::new(DB_STATUS, 0, 4);
    pub const FAULT: BitAddr = BitAddr::new(DB_STATUS, 0, 5);
    pub const AUTO_MODE: BitAddr = BitAddr::new(DB_STATUS, 0, 6);

    pub const CURRENT_FLOOR: WordAddr = WordAddr::new(DB_STATUS, 2);
    pub const LAST_TASK_NO: WordAddr = WordAddr::new(DB_STATUS, 4);

    /// 站台到位字节（bit 0..6 依次为 1010/1020/1030/1040/1050/1060/MAN）
    pub const PALLET_READY_BYTE: u16 = 6;

    pub const SCAN_CODE_READY: BitAddr = BitAddr::new(DB_STATUS, 22, 0);
    pub const QR_OFFSET: u16 = 24;
    pub const QR_LEN: u16 = 20;

    /// 状态快照长度（字节 0..8：状态位、当前层、上次任务号、到位位）
    pub const SNAPSHOT_LEN: u16 = 8;
}

/// DB12 命令输出
pub mod command {
    use super::{BitAddr, DB_COMMAND, WordAddr};

    pub const TASK_TYPE: WordAddr = WordAddr::new(DB_COMMAND, 0);
    pub const TASK_NO: WordAddr = WordAddr::new(DB_COMMAND, 2);
    pub const TARGET_FLOOR: WordAddr = WordAddr::new(DB_COMMAND, 4);

    pub const TASK_START: BitAddr = BitAddr::new(DB_COMMAND, 6, 0);
    pub const TARGET_LAYER_ARRIVED: BitAddr = BitAddr::new(DB_COMMAND, 8, 0);

    /// 入口输送线送料完成
    pub const ENTRY_FEED_COMPLETE: BitAddr = BitAddr::new(DB_COMMAND, 10, 4);

    pub const FEED_COMPLETE_BYTE: u16 = 10;
    pub const FEED_IN_PROGRESS_BYTE: u16 = 12;
    pub const PICK_COMPLETE_BYTE: u16 = 14;
    pub const PICK_IN_PROGRESS_BYTE: u16 = 16;

    pub const ROUTE_ENTRY: WordAddr = WordAddr::new(DB_COMMAND, 20);
    pub const ROUTE_LIFT: WordAddr = WordAddr::new(DB_COMMAND, 22);
    pub const ROUTE_FLOOR_BASE: u16 = 24;
}

fn check_floor(floor: u8) -> Result<(), ProtocolError> {
    if (1..=FLOOR_COUNT).contains(&floor) {
        Ok(())
    } else {
        Err(ProtocolError::InvalidValue {
            field: "floor".to_string(),
            value: u32::from(floor),
        })
    }
}

// ============================================================================
// 站台
// ============================================================================

/// 出库口路由编码
pub const GATE: u16 = 1010;

/// 输送线站台
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Station {
    /// 一层入口 1010
    Entry,
    /// 提升机轿厢 1020
    Lift,
    /// 各层接驳输送线 1030/1040/1050/1060
    Floor(u8),
    /// 人工出库口
    Man,
}

impl Station {
    pub fn floor(floor: u8) -> Result<Self, ProtocolError> {
        check_floor(floor)?;
        Ok(Station::Floor(floor))
    }

    /// 路由编码（人工口无编码，经 `GATE` 到达）
    pub fn code(self) -> Option<u16> {
        match self {
            Station::Entry => Some(1010),
            Station::Lift => Some(1020),
            Station::Floor(n) => Some(1020 + 10 * u16::from(n)),
            Station::Man => None,
        }
    }

    fn ready_index(self) -> u8 {
        match self {
            Station::Entry => 0,
            Station::Lift => 1,
            Station::Floor(n) => 1 + n,
            Station::Man => 6,
        }
    }

    /// 站台到位位 `DB11.6.x`
    pub fn ready_bit(self) -> BitAddr {
        BitAddr::new(DB_STATUS, status::PALLET_READY_BYTE, self.ready_index())
    }

    /// 本站台的路由目标字（写入下一站编码）
    pub fn route_target(self) -> Option<WordAddr> {
        match self {
            Station::Entry => Some(command::ROUTE_ENTRY),
            Station::Lift => Some(command::ROUTE_LIFT),
            Station::Floor(n) => Some(WordAddr::new(
                DB_COMMAND,
                command::ROUTE_FLOOR_BASE + 2 * (u16::from(n) - 1),
            )),
            Station::Man => None,
        }
    }
}

impl fmt::Display for Station {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code() {
            Some(code) => write!(f, "{}", code),
            None => write!(f, "MAN"),
        }
    }
}

// ============================================================================
// 各层握手信号
// ============================================================================

/// 每层一位的握手信号（`DB12.<byte>.<floor-1>`）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FloorSignal {
    FeedComplete,
    FeedInProgress,
    PickComplete,
    PickInProgress,
}

impl FloorSignal {
    pub fn addr(self, floor: u8) -> Result<BitAddr, ProtocolError> {
        check_floor(floor)?;
        let byte = match self {
            FloorSignal::FeedComplete => command::FEED_COMPLETE_BYTE,
            FloorSignal::FeedInProgress => command::FEED_IN_PROGRESS_BYTE,
            FloorSignal::PickComplete => command::PICK_COMPLETE_BYTE,
            FloorSignal::PickInProgress => command::PICK_IN_PROGRESS_BYTE,
        };
        Ok(BitAddr::new(DB_COMMAND, byte, floor - 1))
    }

    /// PLC 按上升沿锁存，清零前需要稳定延时
    pub fn is_latched(self) -> bool {
        matches!(self, FloorSignal::FeedComplete | FloorSignal::PickComplete)
    }

    pub fn name(self) -> &'static str {
        match self {
            FloorSignal::FeedComplete => "feed_complete",
            FloorSignal::FeedInProgress => "feed_in_progress",
            FloorSignal::PickComplete => "pick_complete",
            FloorSignal::PickInProgress => "pick_in_progress",
        }
    }
}

// ============================================================================
// 提升机状态
// ============================================================================

/// 提升机任务类型（写入 `DB12.W0`）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, num_enum::TryFromPrimitive, num_enum::IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u16)]
pub enum LiftTaskKind {
    Good = 1,
    Car = 2,
    GoodAndCar = 3,
    Idle = 4,
}

impl LiftTaskKind {
    /// 由 `(running, idle, no_cargo, has_cargo, has_car)` 选择任务类型
    ///
    /// 其余组合为非法状态，返回 `None`。
    pub fn select(running: bool, idle: bool, no_cargo: bool, has_cargo: bool, has_car: bool) -> Option<Self> {
        match (running, idle, no_cargo, has_cargo, has_car) {
            (false, true, true, false, false) => Some(LiftTaskKind::Idle),
            (false, true, true, false, true) => Some(LiftTaskKind::Car),
            (false, true, false, true, false) => Some(LiftTaskKind::Good),
            (false, true, false, true, true) => Some(LiftTaskKind::GoodAndCar),
            _ => None,
        }
    }
}

/// DB11 Byte 0：提升机状态位
#[bitsize(8)]
#[derive(FromBits, DebugBits, Clone, Copy, Default)]
pub struct LiftStatusBits {
    pub running: bool,   // Bit 0
    pub idle: bool,      // Bit 1
    pub no_cargo: bool,  // Bit 2
    pub has_cargo: bool, // Bit 3
    pub has_car: bool,   // Bit 4
    pub fault: bool,     // Bit 5
    pub auto_mode: bool, // Bit 6
    pub reserved: u1,    // Bit 7
}

/// DB11 Byte 6：站台到位位
#[bitsize(8)]
#[derive(FromBits, DebugBits, Clone, Copy, Default)]
pub struct PalletReadyBits {
    pub entry_1010: bool,  // Bit 0
    pub lift_1020: bool,   // Bit 1
    pub floor_1030: bool,  // Bit 2
    pub floor_1040: bool,  // Bit 3
    pub floor_1050: bool,  // Bit 4
    pub floor_1060: bool,  // Bit 5
    pub man: bool,         // Bit 6
    pub reserved: u1,      // Bit 7
}

/// 提升机状态快照（由 DB11 前 8 字节解码）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LiftState {
    pub current_floor: u16,
    pub running: bool,
    pub idle: bool,
    pub no_cargo: bool,
    pub has_pallet: bool,
    pub has_car: bool,
    pub fault: bool,
    pub auto_mode: bool,
    pub last_task_no: u16,
    /// 站台到位位原始字节
    pub pallet_ready: u8,
}

impl LiftState {
    pub fn decode(block: &[u8]) -> Result<Self, ProtocolError> {
        let expected = status::SNAPSHOT_LEN as usize;
        if block.len() < expected {
            return Err(ProtocolError::InvalidLength {
                what: "lift status block",
                expected,
                actual: block.len(),
            });
        }

        let bits = LiftStatusBits::from(u8::new(block[0]));
        Ok(Self {
            current_floor: u16::from_be_bytes([block[2], block[3]]),
            running: bits.running(),
            idle: bits.idle(),
            no_cargo: bits.no_cargo(),
            has_pallet: bits.has_cargo(),
            has_car: bits.has_car(),
            fault: bits.fault(),
            auto_mode: bits.auto_mode(),
            last_task_no: u16::from_be_bytes([block[4], block[5]]),
            pallet_ready: block[6],
        })
    }

    pub fn task_kind(&self) -> Option<LiftTaskKind> {
        LiftTaskKind::select(self.running, self.idle, self.no_cargo, self.has_pallet, self.has_car)
    }

    /// 停靠在指定层且空闲（允许车辆驶入轿厢）
    pub fn is_idle_at(&self, floor: u8) -> bool {
        self.current_floor == u16::from(floor) && self.idle && !self.running
    }

    pub fn is_pallet_ready(&self, station: Station) -> bool {
        self.pallet_ready & (1 << station.ready_bit().bit) != 0
    }

    pub fn ready_bits(&self) -> PalletReadyBits {
        PalletReadyBits::from(u8::new(self.pallet_ready))
    }
}
