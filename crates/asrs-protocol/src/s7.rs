//! S7comm over ISO-on-TCP 报文编解码
//!
//! 报文分层：`TPKT(4) | COTP | S7 header | parameter | data`
//!
//! - 连接：COTP CR/CC，本地 TSAP `0x0100`，远端 TSAP `0x0100 | (rack * 0x20 + slot)`
//! - 会话：Setup Communication 协商 PDU 长度
//! - 数据：Read Var / Write Var 访问 DB 区（位地址 = 字节偏移 * 8 + 位号）
//! - 诊断：SZL 读取（`0x001C` 组件标识）用于连接后的活性检查
//!
//! 本模块只做无 I/O 的编解码；请求与应答两侧都实现，应答侧用于模拟 PLC。

use crate::ProtocolError;
use bytes::BufMut;

// ============================================================================
// 常量
// ============================================================================

pub const ISO_TCP_PORT: u16 = 102;
pub const TPKT_VERSION: u8 = 0x03;
pub const TPKT_HEADER_LEN: usize = 4;

pub const COTP_CR: u8 = 0xE0;
pub const COTP_CC: u8 = 0xD0;
pub const COTP_DT: u8 = 0xF0;
/// COTP DT 头：长度 2，DT，EOT
const COTP_DT_HEADER: [u8; 3] = [0x02, COTP_DT, 0x80];

pub const LOCAL_TSAP: u16 = 0x0100;

pub const S7_PROTOCOL_ID: u8 = 0x32;
pub const ROSCTR_JOB: u8 = 0x01;
pub const ROSCTR_ACK_DATA: u8 = 0x03;
pub const ROSCTR_USERDATA: u8 = 0x07;

pub const FUNC_SETUP_COMM: u8 = 0xF0;
pub const FUNC_READ_VAR: u8 = 0x04;
pub const FUNC_WRITE_VAR: u8 = 0x05;

/// 请求协商的 PDU 长度
pub const DEFAULT_PDU_LENGTH: u16 = 480;

/// DB 存储区
pub const AREA_DB: u8 = 0x84;

/// 变量规格中的传输类型
pub const TS_BIT: u8 = 0x01;
pub const TS_BYTE: u8 = 0x02;
/// 数据项中的传输类型
pub const DATA_TS_BIT: u8 = 0x03;
pub const DATA_TS_BYTE: u8 = 0x04;
pub const DATA_TS_OCTET: u8 = 0x09;

/// 数据项返回码：成功
pub const RETURN_OK: u8 = 0xFF;
/// 数据项返回码：地址越界
pub const RETURN_OUT_OF_RANGE: u8 = 0x05;
/// 数据项返回码：对象不存在
pub const RETURN_NOT_EXIST: u8 = 0x0A;

/// 组件标识 SZL
pub const SZL_COMPONENT_ID: u16 = 0x001C;

/// 读请求每个 PDU 的固定开销（S7 头 + 参数 + 数据项头）
pub const READ_OVERHEAD: u16 = 18;
/// 写请求每个 PDU 的固定开销
pub const WRITE_OVERHEAD: u16 = 28;

/// 远端 TSAP
pub fn remote_tsap(rack: u8, slot: u8) -> u16 {
    0x0100 | (u16::from(rack) * 0x20 + u16::from(slot))
}

/// 单次读请求可承载的最大字节数
pub fn max_read_chunk(pdu_length: u16) -> usize {
    usize::from(pdu_length.saturating_sub(READ_OVERHEAD)).max(1)
}

/// 单次写请求可承载的最大字节数
pub fn max_write_chunk(pdu_length: u16) -> usize {
    usize::from(pdu_length.saturating_sub(WRITE_OVERHEAD)).max(1)
}

fn s7_err(msg: impl Into<String>) -> ProtocolError {
    ProtocolError::S7(msg.into())
}

// ============================================================================
// 变量地址
// ============================================================================

/// DB 区变量地址
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarAddr {
    pub db: u16,
    pub byte: u16,
    /// `Some` 表示位访问（长度固定为 1）
    pub bit: Option<u8>,
    /// 字节长度（位访问时为 1）
    pub len: u16,
}

impl VarAddr {
    pub fn bytes(db: u16, byte: u16, len: u16) -> Self {
        Self { db, byte, bit: None, len }
    }

    pub fn bit(db: u16, byte: u16, bit: u8) -> Self {
        Self {
            db,
            byte,
            bit: Some(bit),
            len: 1,
        }
    }

    fn bit_address(&self) -> u32 {
        u32::from(self.byte) * 8 + u32::from(self.bit.unwrap_or(0))
    }

    fn transport(&self) -> u8 {
        if self.bit.is_some() { TS_BIT } else { TS_BYTE }
    }

    fn data_transport(&self) -> u8 {
        if self.bit.is_some() { DATA_TS_BIT } else { DATA_TS_BYTE }
    }

    /// 数据项长度字段（BIT/BYTE 传输以位计）
    fn data_length_field(&self) -> u16 {
        if self.bit.is_some() { 1 } else { self.len * 8 }
    }

    fn put_item(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&[0x12, 0x0A, 0x10, self.transport()]);
        buf.put_u16(self.len);
        buf.put_u16(self.db);
        buf.put_u8(AREA_DB);
        let addr = self.bit_address();
        buf.extend_from_slice(&[(addr >> 16) as u8, (addr >> 8) as u8, addr as u8]);
    }

    fn parse_item(item: &[u8]) -> Result<Self, ProtocolError> {
        if item.len() < 12 || item[0] != 0x12 || item[1] != 0x0A || item[2] != 0x10 {
            return Err(s7_err("malformed variable specification"));
        }
        if item[8] != AREA_DB {
            return Err(s7_err(format!("unsupported area 0x{:02X}", item[8])));
        }
        let len = u16::from_be_bytes([item[4], item[5]]);
        let db = u16::from_be_bytes([item[6], item[7]]);
        let addr = (u32::from(item[9]) << 16) | (u32::from(item[10]) << 8) | u32::from(item[11]);
        let byte = u16::try_from(addr / 8).map_err(|_| s7_err("address out of range"))?;
        match item[3] {
            TS_BIT => Ok(Self::bit(db, byte, (addr % 8) as u8)),
            TS_BYTE => Ok(Self::bytes(db, byte, len)),
            other => Err(s7_err(format!("unsupported transport size 0x{:02X}", other))),
        }
    }
}

// ============================================================================
// TPKT / COTP
// ============================================================================

/// 包装 TPKT 头
pub fn encode_tpkt(payload: &[u8]) -> Vec<u8> {
    let total = payload.len() + TPKT_HEADER_LEN;
    let mut buf = Vec::with_capacity(total);
    buf.put_u8(TPKT_VERSION);
    buf.put_u8(0);
    buf.put_u16(total as u16);
    buf.extend_from_slice(payload);
    buf
}

/// 由 TPKT 头得到整帧长度
pub fn tpkt_length(header: &[u8]) -> Result<usize, ProtocolError> {
    if header.len() < TPKT_HEADER_LEN {
        return Err(ProtocolError::InvalidLength {
            what: "TPKT header",
            expected: TPKT_HEADER_LEN,
            actual: header.len(),
        });
    }
    if header[0] != TPKT_VERSION {
        return Err(s7_err(format!("bad TPKT version 0x{:02X}", header[0])));
    }
    let len = usize::from(u16::from_be_bytes([header[2], header[3]]));
    if len < TPKT_HEADER_LEN + 3 {
        return Err(s7_err(format!("TPKT length {} too short", len)));
    }
    Ok(len)
}

fn tpkt_payload(frame: &[u8]) -> Result<&[u8], ProtocolError> {
    let len = tpkt_length(frame)?;
    if frame.len() < len {
        return Err(ProtocolError::InvalidLength {
            what: "TPKT frame",
            expected: len,
            actual: frame.len(),
        });
    }
    Ok(&frame[TPKT_HEADER_LEN..len])
}

fn cotp_connect(pdu_type: u8, src_tsap: u16, dst_tsap: u16) -> Vec<u8> {
    let mut cotp = Vec::with_capacity(18);
    cotp.put_u8(17);
    cotp.put_u8(pdu_type);
    cotp.put_u16(0x0000); // dst ref
    cotp.put_u16(0x0001); // src ref
    cotp.put_u8(0x00); // class 0
    cotp.extend_from_slice(&[0xC0, 0x01, 0x0A]); // TPDU size 1024
    cotp.extend_from_slice(&[0xC1, 0x02]);
    cotp.put_u16(src_tsap);
    cotp.extend_from_slice(&[0xC2, 0x02]);
    cotp.put_u16(dst_tsap);
    encode_tpkt(&cotp)
}

/// COTP 连接请求
pub fn connection_request(rack: u8, slot: u8) -> Vec<u8> {
    cotp_connect(COTP_CR, LOCAL_TSAP, remote_tsap(rack, slot))
}

/// COTP 连接确认（模拟器使用）
pub fn connection_confirm(rack: u8, slot: u8) -> Vec<u8> {
    cotp_connect(COTP_CC, remote_tsap(rack, slot), LOCAL_TSAP)
}

fn cotp_type(frame: &[u8]) -> Result<u8, ProtocolError> {
    let payload = tpkt_payload(frame)?;
    if payload.len() < 2 {
        return Err(s7_err("COTP header truncated"));
    }
    Ok(payload[1])
}

pub fn parse_connection_confirm(frame: &[u8]) -> Result<(), ProtocolError> {
    match cotp_type(frame)? {
        COTP_CC => Ok(()),
        other => Err(s7_err(format!(
            "connection refused (COTP type 0x{:02X})",
            other
        ))),
    }
}

// ============================================================================
// S7 PDU
// ============================================================================

/// 拆解后的 S7 PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S7Pdu<'a> {
    pub rosctr: u8,
    pub pdu_ref: u16,
    pub error_class: u8,
    pub error_code: u8,
    pub param: &'a [u8],
    pub data: &'a [u8],
}

fn encode_pdu(rosctr: u8, pdu_ref: u16, param: &[u8], data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(3 + 12 + param.len() + data.len());
    buf.extend_from_slice(&COTP_DT_HEADER);
    buf.put_u8(S7_PROTOCOL_ID);
    buf.put_u8(rosctr);
    buf.put_u16(0);
    buf.put_u16(pdu_ref);
    buf.put_u16(param.len() as u16);
    buf.put_u16(data.len() as u16);
    if rosctr == ROSCTR_ACK_DATA {
        buf.put_u16(0); // error class / code
    }
    buf.extend_from_slice(param);
    buf.extend_from_slice(data);
    encode_tpkt(&buf)
}

/// 拆解 TPKT + COTP DT + S7 头
pub fn parse_pdu(frame: &[u8]) -> Result<S7Pdu<'_>, ProtocolError> {
    let payload = tpkt_payload(frame)?;
    let cotp_len = usize::from(payload[0]) + 1;
    if payload.len() < cotp_len + 10 || payload[1] != COTP_DT {
        return Err(s7_err("expected COTP data transfer"));
    }
    let s7 = &payload[cotp_len..];
    if s7[0] != S7_PROTOCOL_ID {
        return Err(s7_err(format!("bad protocol id 0x{:02X}", s7[0])));
    }
    let rosctr = s7[1];
    let pdu_ref = u16::from_be_bytes([s7[4], s7[5]]);
    let param_len = usize::from(u16::from_be_bytes([s7[6], s7[7]]));
    let data_len = usize::from(u16::from_be_bytes([s7[8], s7[9]]));
    let (header_len, error_class, error_code) = match rosctr {
        ROSCTR_ACK_DATA | 0x02 => {
            if s7.len() < 12 {
                return Err(s7_err("ack header truncated"));
            }
            (12, s7[10], s7[11])
        },
        _ => (10, 0, 0),
    };
    if s7.len() < header_len + param_len + data_len {
        return Err(ProtocolError::InvalidLength {
            what: "S7 PDU",
            expected: header_len + param_len + data_len,
            actual: s7.len(),
        });
    }
    let param = &s7[header_len..header_len + param_len];
    let data = &s7[header_len + param_len..header_len + param_len + data_len];
    Ok(S7Pdu {
        rosctr,
        pdu_ref,
        error_class,
        error_code,
        param,
        data,
    })
}

fn expect_ack<'a>(frame: &'a [u8], function: u8) -> Result<S7Pdu<'a>, ProtocolError> {
    let pdu = parse_pdu(frame)?;
    if pdu.rosctr != ROSCTR_ACK_DATA {
        return Err(s7_err(format!("unexpected ROSCTR 0x{:02X}", pdu.rosctr)));
    }
    if pdu.error_class != 0 || pdu.error_code != 0 {
        return Err(s7_err(format!(
            "PLC rejected request: class 0x{:02X} code 0x{:02X}",
            pdu.error_class, pdu.error_code
        )));
    }
    if pdu.param.first() != Some(&function) {
        return Err(s7_err(format!("unexpected function in ack (wanted 0x{:02X})", function)));
    }
    Ok(pdu)
}

fn item_error(code: u8) -> ProtocolError {
    let reason = match code {
        RETURN_OUT_OF_RANGE => "address out of range",
        RETURN_NOT_EXIST => "object does not exist",
        0x03 => "access denied",
        0x06 => "data type not supported",
        0x07 => "data type inconsistent",
        _ => "item error",
    };
    s7_err(format!("{} (return code 0x{:02X})", reason, code))
}

// ---------------------------------------------------------------------------
// Setup Communication
// ---------------------------------------------------------------------------

pub fn setup_communication(pdu_ref: u16, pdu_length: u16) -> Vec<u8> {
    let mut param = vec![FUNC_SETUP_COMM, 0x00];
    param.put_u16(1); // max AmQ calling
    param.put_u16(1); // max AmQ called
    param.put_u16(pdu_length);
    encode_pdu(ROSCTR_JOB, pdu_ref, &param, &[])
}

/// 解析协商后的 PDU 长度
pub fn parse_setup_communication(frame: &[u8]) -> Result<u16, ProtocolError> {
    let pdu = expect_ack(frame, FUNC_SETUP_COMM)?;
    if pdu.param.len() < 8 {
        return Err(s7_err("setup communication ack truncated"));
    }
    Ok(u16::from_be_bytes([pdu.param[6], pdu.param[7]]))
}

// ---------------------------------------------------------------------------
// Read Var / Write Var
// ---------------------------------------------------------------------------

pub fn read_var_request(pdu_ref: u16, addr: &VarAddr) -> Vec<u8> {
    let mut param = vec![FUNC_READ_VAR, 0x01];
    addr.put_item(&mut param);
    encode_pdu(ROSCTR_JOB, pdu_ref, &param, &[])
}

/// 解析读应答，返回数据字节（位访问时为单字节 0/1）
pub fn parse_read_var_response(frame: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let pdu = expect_ack(frame, FUNC_READ_VAR)?;
    let data = pdu.data;
    if data.is_empty() {
        return Err(s7_err("read ack without data item"));
    }
    if data[0] != RETURN_OK {
        return Err(item_error(data[0]));
    }
    if data.len() < 4 {
        return Err(s7_err("read data item truncated"));
    }
    let raw_len = usize::from(u16::from_be_bytes([data[2], data[3]]));
    let len = match data[1] {
        DATA_TS_BIT => 1,
        DATA_TS_BYTE => raw_len.div_ceil(8),
        DATA_TS_OCTET => raw_len,
        other => return Err(s7_err(format!("unexpected data transport 0x{:02X}", other))),
    };
    if data.len() < 4 + len {
        return Err(ProtocolError::InvalidLength {
            what: "read data item",
            expected: 4 + len,
            actual: data.len(),
        });
    }
    Ok(data[4..4 + len].to_vec())
}

pub fn write_var_request(pdu_ref: u16, addr: &VarAddr, data: &[u8]) -> Vec<u8> {
    let mut param = vec![FUNC_WRITE_VAR, 0x01];
    addr.put_item(&mut param);
    let mut item = vec![0x00, addr.data_transport()];
    item.put_u16(addr.data_length_field());
    item.extend_from_slice(data);
    encode_pdu(ROSCTR_JOB, pdu_ref, &param, &item)
}

pub fn parse_write_var_response(frame: &[u8]) -> Result<(), ProtocolError> {
    let pdu = expect_ack(frame, FUNC_WRITE_VAR)?;
    match pdu.data.first() {
        Some(&RETURN_OK) => Ok(()),
        Some(&code) => Err(item_error(code)),
        None => Err(s7_err("write ack without return code")),
    }
}

// ---------------------------------------------------------------------------
// SZL（userdata）
// ---------------------------------------------------------------------------

pub fn read_szl_request(pdu_ref: u16, szl_id: u16, index: u16) -> Vec<u8> {
    // head, param len 4, method request, type request | group CPU functions, subfunction read SZL, seq
    let param = [0x00, 0x01, 0x12, 0x04, 0x11, 0x44, 0x01, 0x00];
    let mut data = vec![RETURN_OK, DATA_TS_OCTET];
    data.put_u16(4);
    data.put_u16(szl_id);
    data.put_u16(index);
    encode_pdu(ROSCTR_USERDATA, pdu_ref, &param, &data)
}

/// 解析 SZL 应答，返回 `szl_id | index | record_len | count | records`
pub fn parse_szl_response(frame: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let pdu = parse_pdu(frame)?;
    if pdu.rosctr != ROSCTR_USERDATA {
        return Err(s7_err(format!("unexpected ROSCTR 0x{:02X}", pdu.rosctr)));
    }
    let data = pdu.data;
    if data.len() < 4 {
        return Err(s7_err("SZL data truncated"));
    }
    if data[0] != RETURN_OK {
        return Err(item_error(data[0]));
    }
    let len = usize::from(u16::from_be_bytes([data[2], data[3]]));
    if data.len() < 4 + len {
        return Err(s7_err("SZL data shorter than declared"));
    }
    Ok(data[4..4 + len].to_vec())
}

/// CPU 组件标识（SZL `0x001C`）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuInfo {
    pub as_name: String,
    pub module_name: String,
    pub serial_number: String,
    pub module_type: String,
}

impl CpuInfo {
    /// 每条记录为 `index(2) | text`
    pub fn from_szl(szl: &[u8]) -> Result<Self, ProtocolError> {
        if szl.len() < 8 {
            return Err(s7_err("SZL 0x001C header truncated"));
        }
        let record_len = usize::from(u16::from_be_bytes([szl[4], szl[5]]));
        let count = usize::from(u16::from_be_bytes([szl[6], szl[7]]));
        if record_len < 2 {
            return Err(s7_err("SZL 0x001C record length invalid"));
        }

        let mut info = CpuInfo::default();
        for record in szl[8..].chunks_exact(record_len).take(count) {
            let text = String::from_utf8_lossy(&record[2..])
                .trim_matches(|c: char| c == '\0' || c.is_whitespace())
                .to_string();
            match u16::from_be_bytes([record[0], record[1]]) {
                1 => info.as_name = text,
                2 => info.module_name = text,
                5 => info.serial_number = text,
                7 => info.module_type = text,
                _ => {},
            }
        }
        Ok(info)
    }
}

// ============================================================================
// 应答侧（模拟 PLC）
// ============================================================================

/// 模拟器收到的请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum S7Request {
    Connect,
    Setup { pdu_ref: u16, pdu_length: u16 },
    Read { pdu_ref: u16, addr: VarAddr },
    Write { pdu_ref: u16, addr: VarAddr, data: Vec<u8> },
    ReadSzl { pdu_ref: u16, szl_id: u16, index: u16 },
}

/// 解析客户端请求（模拟器使用）
pub fn parse_request(frame: &[u8]) -> Result<S7Request, ProtocolError> {
    if cotp_type(frame)? == COTP_CR {
        return Ok(S7Request::Connect);
    }
    let pdu = parse_pdu(frame)?;
    match pdu.rosctr {
        ROSCTR_USERDATA => {
            if pdu.data.len() < 8 {
                return Err(s7_err("SZL request truncated"));
            }
            Ok(S7Request::ReadSzl {
                pdu_ref: pdu.pdu_ref,
                szl_id: u16::from_be_bytes([pdu.data[4], pdu.data[5]]),
                index: u16::from_be_bytes([pdu.data[6], pdu.data[7]]),
            })
        },
        ROSCTR_JOB => match pdu.param.first() {
            Some(&FUNC_SETUP_COMM) if pdu.param.len() >= 8 => Ok(S7Request::Setup {
                pdu_ref: pdu.pdu_ref,
                pdu_length: u16::from_be_bytes([pdu.param[6], pdu.param[7]]),
            }),
            Some(&FUNC_READ_VAR) if pdu.param.len() >= 14 => Ok(S7Request::Read {
                pdu_ref: pdu.pdu_ref,
                addr: VarAddr::parse_item(&pdu.param[2..14])?,
            }),
            Some(&FUNC_WRITE_VAR) if pdu.param.len() >= 14 => {
                let addr = VarAddr::parse_item(&pdu.param[2..14])?;
                if pdu.data.len() < 4 {
                    return Err(s7_err("write data item truncated"));
                }
                Ok(S7Request::Write {
                    pdu_ref: pdu.pdu_ref,
                    addr,
                    data: pdu.data[4..].to_vec(),
                })
            },
            _ => Err(s7_err("unsupported job function")),
        },
        other => Err(s7_err(format!("unexpected ROSCTR 0x{:02X}", other))),
    }
}

pub fn setup_communication_ack(pdu_ref: u16, pdu_length: u16) -> Vec<u8> {
    let mut param = vec![FUNC_SETUP_COMM, 0x00];
    param.put_u16(1);
    param.put_u16(1);
    param.put_u16(pdu_length);
    encode_pdu(ROSCTR_ACK_DATA, pdu_ref, &param, &[])
}

/// 读应答；`return_code != RETURN_OK` 时不带数据
pub fn read_var_ack(pdu_ref: u16, addr: &VarAddr, return_code: u8, payload: &[u8]) -> Vec<u8> {
    let mut data = vec![return_code];
    if return_code == RETURN_OK {
        data.put_u8(addr.data_transport());
        data.put_u16(addr.data_length_field());
        data.extend_from_slice(payload);
    } else {
        data.extend_from_slice(&[0x00, 0x00, 0x00]);
    }
    encode_pdu(ROSCTR_ACK_DATA, pdu_ref, &[FUNC_READ_VAR, 0x01], &data)
}

pub fn write_var_ack(pdu_ref: u16, return_code: u8) -> Vec<u8> {
    encode_pdu(ROSCTR_ACK_DATA, pdu_ref, &[FUNC_WRITE_VAR, 0x01], &[return_code])
}

/// SZL 应答，记录为 `(index, text)`，文本按 `record_len - 2` 补零
pub fn szl_ack(pdu_ref: u16, szl_id: u16, record_len: u16, records: &[(u16, &str)]) -> Vec<u8> {
    let param = [0x00, 0x01, 0x12, 0x08, 0x12, 0x84, 0x01, 0x01, 0x00, 0x00, 0x00, 0x00];
    let mut body = Vec::new();
    body.put_u16(szl_id);
    body.put_u16(0);
    body.put_u16(record_len);
    body.put_u16(records.len() as u16);
    for (index, text) in records {
        body.put_u16(*index);
        let mut bytes = text.as_bytes().to_vec();
        bytes.resize(usize::from(record_len.saturating_sub(2)), 0);
        body.extend_from_slice(&bytes);
    }
    let mut data = vec![RETURN_OK, DATA_TS_OCTET];
    data.put_u16(body.len() as u16);
    data.extend_from_slice(&body);
    encode_pdu(ROSCTR_USERDATA, pdu_ref, &param, &data)
}
