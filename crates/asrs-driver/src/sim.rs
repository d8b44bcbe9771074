//! PLC 程序模型
//!
//! 在 [`MemoryPlc`] 上挂一个写入钩子，按地址表模拟提升机与输送线的响应：
//! - 任务启动位上升沿：提升机立即停到目标层，记录任务号
//! - 路由目标写入：货物到达下一站，置位该站到位位
//!
//! 只用于测试与离线演示。

use asrs_link::PlcLink;
use asrs_link::mock::{MemoryPlc, MemoryPlcHandle, PlcMemory, PlcWrite};
use asrs_link::PlcTiming;
use asrs_protocol::plc_map::{DB_COMMAND, GATE, command, remote, status};
use asrs_protocol::Station;
use std::time::Duration;

/// 测试用的快速轮询节奏
pub fn fast_plc_timing() -> PlcTiming {
    PlcTiming {
        poll_interval: Duration::from_millis(5),
        initial_grace: Duration::from_millis(5),
        settle: Duration::from_millis(1),
    }
}

/// 带提升机与输送线模型的模拟 PLC
#[derive(Clone)]
pub struct SimPlc {
    handle: MemoryPlcHandle,
}

impl SimPlc {
    /// 在线、自动模式、提升机空载停在一层
    pub fn healthy() -> Self {
        let plc = MemoryPlc::new();
        let handle = plc.handle();
        handle.with_memory(|m| {
            m.set_bit(remote::REMOTE_ONLINE, true);
            m.set_bit(remote::CONVEYOR_ONLINE, true);
            m.set_bit(status::IDLE, true);
            m.set_bit(status::NO_CARGO, true);
            m.set_bit(status::AUTO_MODE, true);
            m.write_u16(status::CURRENT_FLOOR.db, status::CURRENT_FLOOR.offset, 1);
        });
        handle.set_write_hook(plc_program);
        Self { handle }
    }

    pub fn handle(&self) -> MemoryPlcHandle {
        self.handle.clone()
    }

    /// 新的未连接客户端
    pub fn transport(&self) -> MemoryPlc {
        self.handle.transport()
    }

    /// 带快速节奏的会话
    pub fn link(&self) -> PlcLink<MemoryPlc> {
        PlcLink::new(self.transport()).with_timing(fast_plc_timing())
    }

    /// 设置轿厢内有无货物与车辆
    pub fn set_lift_load(&self, has_cargo: bool, has_car: bool) {
        self.handle.with_memory(|m| {
            m.set_bit(status::HAS_CARGO, has_cargo);
            m.set_bit(status::NO_CARGO, !has_cargo);
            m.set_bit(status::HAS_CAR, has_car);
        });
    }

    pub fn set_floor(&self, floor: u16) {
        self.handle
            .with_memory(|m| m.write_u16(status::CURRENT_FLOOR.db, status::CURRENT_FLOOR.offset, floor));
    }

    /// 扫码器读到条码
    pub fn present_code(&self, code: &str) {
        self.handle.with_memory(|m| {
            let mut buf = vec![0u8; usize::from(status::QR_LEN)];
            for (slot, b) in buf.iter_mut().zip(code.bytes()) {
                *slot = b;
            }
            m.write(status::SCAN_CODE_READY.db, status::QR_OFFSET, &buf);
            m.set_bit(status::SCAN_CODE_READY, true);
        });
    }
}

fn set_ready(m: &mut PlcMemory, station: Station, value: bool) {
    m.set_bit(station.ready_bit(), value);
}

fn set_cargo(m: &mut PlcMemory, has_cargo: bool) {
    m.set_bit(status::HAS_CARGO, has_cargo);
    m.set_bit(status::NO_CARGO, !has_cargo);
}

fn plc_program(m: &mut PlcMemory, write: &PlcWrite) {
    match write {
        PlcWrite::Bit { addr, value: true } if *addr == command::TASK_START => {
            let floor = m.read_u16(DB_COMMAND, command::TARGET_FLOOR.offset);
            let task_no = m.read_u16(DB_COMMAND, command::TASK_NO.offset);
            m.write_u16(status::CURRENT_FLOOR.db, status::CURRENT_FLOOR.offset, floor);
            m.write_u16(status::LAST_TASK_NO.db, status::LAST_TASK_NO.offset, task_no);
        },
        PlcWrite::Bytes { db, offset, data } if *db == DB_COMMAND && data.len() == 2 => {
            let value = u16::from_be_bytes([data[0], data[1]]);
            route(m, *offset, value);
        },
        _ => {},
    }
}

fn route(m: &mut PlcMemory, offset: u16, value: u16) {
    let lift = Station::Lift.code();
    if offset == command::ROUTE_LIFT.offset {
        set_ready(m, Station::Lift, false);
        set_cargo(m, false);
        if value == GATE {
            set_ready(m, Station::Man, true);
        } else if let Some(floor) = (1..=4).find(|n| Station::Floor(*n).code() == Some(value)) {
            set_ready(m, Station::Floor(floor), true);
        }
        return;
    }

    let from_floor = (1..=4u8).find(|n| {
        Station::Floor(*n)
            .route_target()
            .is_some_and(|addr| addr.offset == offset)
    });
    let from_entry = offset == command::ROUTE_ENTRY.offset;
    if (from_entry || from_floor.is_some()) && Some(value) == lift {
        if let Some(floor) = from_floor {
            set_ready(m, Station::Floor(floor), false);
        }
        set_ready(m, Station::Lift, true);
        set_cargo(m, true);
    }
}
