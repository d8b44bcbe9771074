//! 内存模拟设备
//!
//! - [`MemoryPlc`]：按 DB 号保存字节的 PLC 内存，记录写入流水，可挂写入钩子模拟 PLC 逻辑
//! - [`SimShuttle`]：用真实编解码应答请求帧的穿梭车
//!
//! 两者都通过共享句柄（`*Handle`）在测试中观察与注入状态。

use crate::{LinkError, PlcTransport, ShuttleTransport};
use asrs_protocol::plc_map::BitAddr;
use asrs_protocol::s7::CpuInfo;
use asrs_protocol::{
    Coord, FrameType, HeartbeatStatus, Segment, SegmentAction, ShuttleFrame, ShuttleStatus,
    cmd_id,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// PLC
// ============================================================================

/// PLC 内存
#[derive(Debug, Default, Clone)]
pub struct PlcMemory {
    blocks: HashMap<u16, Vec<u8>>,
}

impl PlcMemory {
    fn block_mut(&mut self, db: u16, end: usize) -> &mut Vec<u8> {
        let block = self.blocks.entry(db).or_default();
        if block.len() < end {
            block.resize(end, 0);
        }
        block
    }

    pub fn read(&self, db: u16, offset: u16, len: u16) -> Vec<u8> {
        let start = usize::from(offset);
        let end = start + usize::from(len);
        let mut out = vec![0u8; usize::from(len)];
        if let Some(block) = self.blocks.get(&db) {
            for (i, slot) in (start..end).enumerate() {
                if let Some(b) = block.get(slot) {
                    out[i] = *b;
                }
            }
        }
        out
    }

    pub fn write(&mut self, db: u16, offset: u16, data: &[u8]) {
        let start = usize::from(offset);
        let block = self.block_mut(db, start + data.len());
        block[start..start + data.len()].copy_from_slice(data);
    }

    pub fn bit(&self, addr: BitAddr) -> bool {
        self.read(addr.db, addr.byte, 1)[0] & (1 << addr.bit) != 0
    }

    pub fn set_bit(&mut self, addr: BitAddr, value: bool) {
        let block = self.block_mut(addr.db, usize::from(addr.byte) + 1);
        let byte = &mut block[usize::from(addr.byte)];
        if value {
            *byte |= 1 << addr.bit;
        } else {
            *byte &= !(1 << addr.bit);
        }
    }

    pub fn read_u16(&self, db: u16, offset: u16) -> u16 {
        let b = self.read(db, offset, 2);
        u16::from_be_bytes([b[0], b[1]])
    }

    pub fn write_u16(&mut self, db: u16, offset: u16, value: u16) {
        self.write(db, offset, &value.to_be_bytes());
    }
}

/// 客户端写入记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlcWrite {
    Bytes { db: u16, offset: u16, data: Vec<u8> },
    Bit { addr: BitAddr, value: bool },
}

/// 写入钩子：在客户端写入生效后调用，可修改内存以模拟 PLC 响应
pub type WriteHook = Box<dyn FnMut(&mut PlcMemory, &PlcWrite) + Send>;

struct PlcShared {
    memory: PlcMemory,
    hook: Option<WriteHook>,
    journal: Vec<PlcWrite>,
    offline: bool,
    connects: usize,
    cpu: CpuInfo,
}

/// 模拟 PLC 共享句柄
#[derive(Clone)]
pub struct MemoryPlcHandle {
    shared: Arc<Mutex<PlcShared>>,
}

impl MemoryPlcHandle {
    /// 新建一个共享同一块内存的客户端（未连接）
    pub fn transport(&self) -> MemoryPlc {
        MemoryPlc {
            shared: self.shared.clone(),
            connected: false,
        }
    }

    pub fn with_memory<R>(&self, f: impl FnOnce(&mut PlcMemory) -> R) -> R {
        f(&mut self.shared.lock().memory)
    }

    pub fn read(&self, db: u16, offset: u16, len: u16) -> Vec<u8> {
        self.shared.lock().memory.read(db, offset, len)
    }

    pub fn write(&self, db: u16, offset: u16, data: &[u8]) {
        self.shared.lock().memory.write(db, offset, data);
    }

    pub fn bit(&self, addr: BitAddr) -> bool {
        self.shared.lock().memory.bit(addr)
    }

    pub fn set_bit(&self, addr: BitAddr, value: bool) {
        self.shared.lock().memory.set_bit(addr, value);
    }

    pub fn set_write_hook(&self, hook: impl FnMut(&mut PlcMemory, &PlcWrite) + Send + 'static) {
        self.shared.lock().hook = Some(Box::new(hook));
    }

    /// 离线时连接与读写均失败
    pub fn set_offline(&self, offline: bool) {
        self.shared.lock().offline = offline;
    }

    pub fn connect_count(&self) -> usize {
        self.shared.lock().connects
    }

    pub fn journal(&self) -> Vec<PlcWrite> {
        self.shared.lock().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.shared.lock().journal.clear();
    }

    /// 某一位的写入序列
    pub fn bit_writes(&self, addr: BitAddr) -> Vec<bool> {
        self.shared
            .lock()
            .journal
            .iter()
            .filter_map(|w| match w {
                PlcWrite::Bit { addr: a, value } if *a == addr => Some(*value),
                _ => None,
            })
            .collect()
    }
}

/// 内存 PLC 传输
pub struct MemoryPlc {
    shared: Arc<Mutex<PlcShared>>,
    connected: bool,
}

impl MemoryPlc {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(PlcShared {
                memory: PlcMemory::default(),
                hook: None,
                journal: Vec::new(),
                offline: false,
                connects: 0,
                cpu: CpuInfo {
                    as_name: "SIM".to_string(),
                    module_name: "MEMORY-PLC".to_string(),
                    serial_number: "0000".to_string(),
                    module_type: "CPU SIM".to_string(),
                },
            })),
            connected: false,
        }
    }

    pub fn handle(&self) -> MemoryPlcHandle {
        MemoryPlcHandle {
            shared: self.shared.clone(),
        }
    }

    fn check(&self) -> Result<(), LinkError> {
        if !self.connected {
            return Err(LinkError::NotConnected);
        }
        if self.shared.lock().offline {
            return Err(LinkError::Closed);
        }
        Ok(())
    }

    fn apply(&self, write: PlcWrite) {
        let mut guard = self.shared.lock();
        let PlcShared {
            memory,
            hook,
            journal,
            ..
        } = &mut *guard;
        match &write {
            PlcWrite::Bytes { db, offset, data } => memory.write(*db, *offset, data),
            PlcWrite::Bit { addr, value } => memory.set_bit(*addr, *value),
        }
        if let Some(hook) = hook.as_mut() {
            hook(memory, &write);
        }
        journal.push(write);
    }
}

impl Default for MemoryPlc {
    fn default() -> Self {
        Self::new()
    }
}

impl PlcTransport for MemoryPlc {
    fn connect(&mut self) -> Result<(), LinkError> {
        let mut shared = self.shared.lock();
        if shared.offline {
            return Err(LinkError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "simulated PLC offline",
            )));
        }
        shared.connects += 1;
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn cpu_info(&mut self) -> Result<CpuInfo, LinkError> {
        self.check()?;
        Ok(self.shared.lock().cpu.clone())
    }

    fn read_area(&mut self, db: u16, start: u16, len: u16) -> Result<Vec<u8>, LinkError> {
        self.check()?;
        Ok(self.shared.lock().memory.read(db, start, len))
    }

    fn write_area(&mut self, db: u16, start: u16, data: &[u8]) -> Result<(), LinkError> {
        self.check()?;
        self.apply(PlcWrite::Bytes {
            db,
            offset: start,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn write_bit(&mut self, addr: BitAddr, value: bool) -> Result<(), LinkError> {
        self.check()?;
        self.apply(PlcWrite::Bit { addr, value });
        Ok(())
    }
}

// ============================================================================
// 穿梭车
// ============================================================================

/// 模拟穿梭车状态
#[derive(Debug, Clone)]
pub struct SimShuttleState {
    pub device_id: u8,
    pub position: Coord,
    pub status: ShuttleStatus,
    pub power: u8,
    pub have_pallet: bool,
    /// 确认任务后位置不变（用于超时测试）
    pub frozen: bool,
    /// 任务/指令应答结果码（0 表示接受）
    pub reject_code: u8,
    /// 离线时发送失败
    pub offline: bool,
    /// 应答拆成两段投递（测试接收端拼帧）
    pub split_responses: bool,
    /// 收到的请求帧
    pub received: Vec<ShuttleFrame>,
    pending: Option<(u8, Vec<Segment>)>,
    outbox: VecDeque<Vec<u8>>,
    connects: usize,
}

#[derive(Clone)]
pub struct SimShuttleHandle {
    shared: Arc<Mutex<SimShuttleState>>,
}

impl SimShuttleHandle {
    pub fn with_state<R>(&self, f: impl FnOnce(&mut SimShuttleState) -> R) -> R {
        f(&mut self.shared.lock())
    }

    pub fn position(&self) -> Coord {
        self.shared.lock().position
    }

    pub fn set_position(&self, position: Coord) {
        self.shared.lock().position = position;
    }

    pub fn set_status(&self, status: ShuttleStatus) {
        self.shared.lock().status = status;
    }

    pub fn received(&self) -> Vec<ShuttleFrame> {
        self.shared.lock().received.clone()
    }

    pub fn connect_count(&self) -> usize {
        self.shared.lock().connects
    }

    /// 最近一次下发的任务段
    pub fn last_task(&self) -> Option<Vec<Segment>> {
        self.shared.lock().received.iter().rev().find_map(|f| {
            (f.frame_type == FrameType::Task).then(|| parse_segments(&f.payload))
        })
    }
}

fn parse_segments(payload: &[u8]) -> Vec<Segment> {
    payload
        .get(2..)
        .unwrap_or_default()
        .chunks_exact(4)
        .map(|c| Segment {
            x: c[0],
            y: c[1],
            z: c[2],
            action: SegmentAction::try_from(c[3]).unwrap_or_default(),
        })
        .collect()
}

/// 模拟穿梭车传输
pub struct SimShuttle {
    shared: Arc<Mutex<SimShuttleState>>,
    connected: bool,
}

impl SimShuttle {
    pub fn new(position: Coord) -> Self {
        Self {
            shared: Arc::new(Mutex::new(SimShuttleState {
                device_id: 2,
                position,
                status: ShuttleStatus::Ready,
                power: 90,
                have_pallet: false,
                frozen: false,
                reject_code: 0,
                offline: false,
                split_responses: false,
                received: Vec::new(),
                pending: None,
                outbox: VecDeque::new(),
                connects: 0,
            })),
            connected: false,
        }
    }

    pub fn handle(&self) -> SimShuttleHandle {
        SimShuttleHandle {
            shared: self.shared.clone(),
        }
    }
}

impl SimShuttleState {
    fn heartbeat(&self, with_battery: bool) -> HeartbeatStatus {
        let mut hb = HeartbeatStatus::ready_at(self.position);
        hb.car_status = self.status;
        hb.have_pallet = self.have_pallet;
        hb.power = with_battery.then_some(self.power);
        hb
    }

    fn respond(&mut self, request: &ShuttleFrame) -> Option<Vec<u8>> {
        let body = match request.frame_type {
            FrameType::Heartbeat => self.heartbeat(false).encode_body(),
            FrameType::HeartbeatWithBattery => self.heartbeat(true).encode_body(),
            FrameType::Task => {
                let task_no = *request.payload.first()?;
                if self.reject_code == 0 {
                    self.pending = Some((task_no, parse_segments(&request.payload)));
                }
                vec![task_no, self.reject_code]
            },
            FrameType::Command => {
                let p = &request.payload;
                if p.len() < 7 {
                    return None;
                }
                let (cmd_no, id) = (p[0], p[1]);
                if self.reject_code == 0 {
                    match id {
                        cmd_id::CONFIRM_TASK => {
                            if let Some((_, segments)) = self.pending.take() {
                                self.execute(&segments);
                            }
                        },
                        cmd_id::UPDATE_COORDINATES => {
                            self.position = Coord::new(p[3], p[4], p[5]);
                        },
                        _ => {},
                    }
                }
                vec![cmd_no, self.reject_code]
            },
            FrameType::Debug => request.payload.clone(),
        };
        ShuttleFrame::new(self.device_id, request.life, request.frame_type, body).encode().ok()
    }

    fn execute(&mut self, segments: &[Segment]) {
        if self.frozen {
            return;
        }
        if let (Some(first), Some(last)) = (segments.first(), segments.last()) {
            self.position = last.coord();
            if last.action == SegmentAction::Drop {
                self.have_pallet = false;
            } else if first.action == SegmentAction::Pick {
                self.have_pallet = true;
            }
        }
    }
}

impl ShuttleTransport for SimShuttle {
    fn connect(&mut self) -> Result<(), LinkError> {
        let mut state = self.shared.lock();
        if state.offline {
            return Err(LinkError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "simulated shuttle offline",
            )));
        }
        state.connects += 1;
        state.outbox.clear();
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        if !self.connected {
            return Err(LinkError::NotConnected);
        }
        let mut state = self.shared.lock();
        if state.offline {
            self.connected = false;
            return Err(LinkError::Closed);
        }
        // 无法解析的请求不应答，由调用方超时
        if let Ok((frame, _)) = ShuttleFrame::decode(bytes) {
            if let Some(response) = state.respond(&frame) {
                if state.split_responses && response.len() > 4 {
                    let (head, tail) = response.split_at(4);
                    state.outbox.push_back(head.to_vec());
                    state.outbox.push_back(tail.to_vec());
                } else {
                    state.outbox.push_back(response);
                }
            }
            state.received.push(frame);
        }
        Ok(())
    }

    fn recv(&mut self, _timeout: Duration, max: usize) -> Result<Vec<u8>, LinkError> {
        if !self.connected {
            return Err(LinkError::NotConnected);
        }
        let mut state = self.shared.lock();
        match state.outbox.pop_front() {
            Some(mut bytes) => {
                if bytes.len() > max {
                    let rest = bytes.split_off(max);
                    state.outbox.push_front(rest);
                }
                Ok(bytes)
            },
            None => Err(LinkError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asrs_protocol::{FrameBuilder, ResponseBody, ShuttleResponse};

    #[test]
    fn test_memory_plc_hook_and_journal() {
        let mut plc = MemoryPlc::new();
        let handle = plc.handle();
        let start = BitAddr::new(12, 6, 0);
        let running = BitAddr::new(11, 0, 0);
        handle.set_write_hook(move |mem, write| {
            if let PlcWrite::Bit { addr, value: true } = write {
                if *addr == start {
                    mem.set_bit(running, true);
                }
            }
        });
        plc.connect().unwrap();
        plc.write_bit(start, true).unwrap();
        assert!(plc.read_bit(running).unwrap());
        assert_eq!(handle.bit_writes(start), vec![true]);
    }

    #[test]
    fn test_memory_plc_requires_connect() {
        let mut plc = MemoryPlc::new();
        assert!(matches!(plc.read_area(11, 0, 1), Err(LinkError::NotConnected)));
    }

    #[test]
    fn test_sim_shuttle_executes_confirmed_task() {
        let mut sim = SimShuttle::new(Coord::new(1, 1, 1));
        let handle = sim.handle();
        sim.connect().unwrap();
        let mut builder = FrameBuilder::default();

        let segments = [
            Segment::new(Coord::new(1, 1, 1), SegmentAction::Pick),
            Segment::new(Coord::new(4, 1, 1), SegmentAction::Drop),
        ];
        sim.send(&builder.task(5, &segments).unwrap().encode().unwrap()).unwrap();
        let ack = ShuttleResponse::parse(&sim.recv(Duration::ZERO, 4096).unwrap()).unwrap();
        assert!(matches!(ack.body, ResponseBody::Task(a) if a.task_no == 5 && a.is_accepted()));
        assert_eq!(handle.position(), Coord::new(1, 1, 1));

        sim.send(&builder.confirm_task(5, 4).encode().unwrap()).unwrap();
        let _ = sim.recv(Duration::ZERO, 4096).unwrap();
        assert_eq!(handle.position(), Coord::new(4, 1, 1));
        assert_eq!(handle.last_task().unwrap(), segments.to_vec());
    }

    #[test]
    fn test_sim_shuttle_relocate_and_timeout() {
        let mut sim = SimShuttle::new(Coord::lift(1));
        let handle = sim.handle();
        sim.connect().unwrap();
        let mut builder = FrameBuilder::default();
        sim.send(&builder.relocate(9, Coord::lift(3)).encode().unwrap()).unwrap();
        assert!(sim.recv(Duration::ZERO, 4096).is_ok());
        assert_eq!(handle.position(), Coord::lift(3));
        assert!(matches!(sim.recv(Duration::ZERO, 4096), Err(LinkError::Timeout)));
    }
}
