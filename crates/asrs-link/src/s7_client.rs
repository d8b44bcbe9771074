//! S7 TCP 客户端
//!
//! 每次 `connect` 都建立全新的 TCP 会话（COTP 连接 + PDU 协商），
//! 不复用可能处于半开状态的旧连接。超过协商 PDU 的读写自动分块。

use crate::{LinkDeviceError, LinkDeviceErrorKind, LinkError, PlcTransport};
use asrs_protocol::ProtocolError;
use asrs_protocol::plc_map::BitAddr;
use asrs_protocol::s7::{self, CpuInfo, VarAddr};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

#[derive(Debug)]
pub struct S7Client {
    host: String,
    port: u16,
    rack: u8,
    slot: u8,
    connect_timeout: Duration,
    io_timeout: Duration,
    requested_pdu: u16,
    pdu_length: u16,
    pdu_ref: u16,
    stream: Option<TcpStream>,
}

impl S7Client {
    pub fn new(host: impl Into<String>, rack: u8, slot: u8) -> Self {
        Self {
            host: host.into(),
            port: s7::ISO_TCP_PORT,
            rack,
            slot,
            connect_timeout: Duration::from_secs(3),
            io_timeout: Duration::from_secs(3),
            requested_pdu: s7::DEFAULT_PDU_LENGTH,
            pdu_length: s7::DEFAULT_PDU_LENGTH,
            pdu_ref: 0,
            stream: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_timeouts(mut self, connect: Duration, io: Duration) -> Self {
        self.connect_timeout = connect;
        self.io_timeout = io;
        self
    }

    pub fn with_pdu_length(mut self, pdu_length: u16) -> Self {
        self.requested_pdu = pdu_length;
        self
    }

    /// 协商后的 PDU 长度
    pub fn pdu_length(&self) -> u16 {
        self.pdu_length
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn next_ref(&mut self) -> u16 {
        self.pdu_ref = self.pdu_ref.wrapping_add(1).max(1);
        self.pdu_ref
    }

    fn open(&self) -> Result<TcpStream, LinkError> {
        let addrs: Vec<SocketAddr> = (self.host.as_str(), self.port).to_socket_addrs()?.collect();
        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    stream.set_read_timeout(Some(self.io_timeout))?;
                    stream.set_write_timeout(Some(self.io_timeout))?;
                    return Ok(stream);
                },
                Err(e) => last_err = Some(e),
            }
        }
        Err(match last_err {
            Some(e) if e.kind() == ErrorKind::ConnectionRefused => LinkDeviceError::new(
                LinkDeviceErrorKind::ConnectionRefused,
                format!("PLC {} refused connection", self.endpoint()),
            )
            .into(),
            Some(e) => LinkError::Io(e),
            None => LinkDeviceError::new(
                LinkDeviceErrorKind::Unreachable,
                format!("no address for {}", self.endpoint()),
            )
            .into(),
        })
    }

    /// 发送一帧请求并读取一帧完整 TPKT 应答
    fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>, LinkError> {
        let stream = self.stream.as_mut().ok_or(LinkError::NotConnected)?;
        trace!("s7 tx: {}", hex::encode(request));

        let result = (|| -> Result<Vec<u8>, LinkError> {
            stream.write_all(request)?;
            let mut header = [0u8; s7::TPKT_HEADER_LEN];
            stream.read_exact(&mut header)?;
            let len = s7::tpkt_length(&header)?;
            let mut frame = header.to_vec();
            frame.resize(len, 0);
            stream.read_exact(&mut frame[s7::TPKT_HEADER_LEN..])?;
            Ok(frame)
        })();

        match result {
            Ok(frame) => {
                trace!("s7 rx: {}", hex::encode(&frame));
                Ok(frame)
            },
            Err(LinkError::Io(e)) => {
                warn!("S7 exchange with {} failed: {}", self.endpoint(), e);
                self.teardown();
                Err(match e.kind() {
                    ErrorKind::WouldBlock | ErrorKind::TimedOut => LinkError::Timeout,
                    ErrorKind::UnexpectedEof => LinkError::Closed,
                    _ => LinkError::Io(e),
                })
            },
            Err(e) => {
                // 报文错位后会话不可再用
                self.teardown();
                Err(e)
            },
        }
    }

    fn teardown(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
            debug!("PLC session {} closed", self.endpoint());
        }
    }
}

/// S7 数据项返回码映射为结构化设备错误
fn classify(err: ProtocolError) -> LinkError {
    match &err {
        ProtocolError::S7(msg) if msg.contains("out of range") => {
            LinkDeviceError::new(LinkDeviceErrorKind::AddressOutOfRange, msg.clone()).into()
        },
        ProtocolError::S7(msg) if msg.contains("does not exist") => {
            LinkDeviceError::new(LinkDeviceErrorKind::ObjectNotFound, msg.clone()).into()
        },
        ProtocolError::S7(msg) if msg.contains("access denied") => {
            LinkDeviceError::new(LinkDeviceErrorKind::AccessDenied, msg.clone()).into()
        },
        _ => LinkError::Protocol(err),
    }
}

impl PlcTransport for S7Client {
    fn connect(&mut self) -> Result<(), LinkError> {
        self.teardown();
        self.stream = Some(self.open()?);

        let cc = self.exchange(&s7::connection_request(self.rack, self.slot))?;
        if let Err(e) = s7::parse_connection_confirm(&cc) {
            self.teardown();
            return Err(LinkDeviceError::new(LinkDeviceErrorKind::ConnectionRefused, e.to_string()).into());
        }

        let pdu_ref = self.next_ref();
        let ack = self.exchange(&s7::setup_communication(pdu_ref, self.requested_pdu))?;
        let negotiated = s7::parse_setup_communication(&ack).inspect_err(|_| self.teardown())?;
        self.pdu_length = negotiated.min(self.requested_pdu);
        info!(
            "PLC session established: {} rack={} slot={} pdu={}",
            self.endpoint(),
            self.rack,
            self.slot,
            self.pdu_length
        );
        Ok(())
    }

    fn disconnect(&mut self) {
        self.teardown();
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn cpu_info(&mut self) -> Result<CpuInfo, LinkError> {
        let pdu_ref = self.next_ref();
        let resp = self.exchange(&s7::read_szl_request(pdu_ref, s7::SZL_COMPONENT_ID, 0))?;
        let szl = s7::parse_szl_response(&resp).map_err(classify)?;
        Ok(CpuInfo::from_szl(&szl)?)
    }

    fn read_area(&mut self, db: u16, start: u16, len: u16) -> Result<Vec<u8>, LinkError> {
        let chunk = s7::max_read_chunk(self.pdu_length);
        let mut out = Vec::with_capacity(usize::from(len));
        let mut offset = 0usize;
        while offset < usize::from(len) {
            let n = chunk.min(usize::from(len) - offset);
            let addr = VarAddr::bytes(db, start + offset as u16, n as u16);
            let pdu_ref = self.next_ref();
            let resp = self.exchange(&s7::read_var_request(pdu_ref, &addr))?;
            let data = s7::parse_read_var_response(&resp).map_err(classify)?;
            if data.len() != n {
                return Err(LinkDeviceError::new(
                    LinkDeviceErrorKind::InvalidResponse,
                    format!("DB{}.{}: expected {} bytes, got {}", db, addr.byte, n, data.len()),
                )
                .into());
            }
            out.extend_from_slice(&data);
            offset += n;
        }
        Ok(out)
    }

    fn write_area(&mut self, db: u16, start: u16, data: &[u8]) -> Result<(), LinkError> {
        let chunk = s7::max_write_chunk(self.pdu_length);
        for (i, part) in data.chunks(chunk).enumerate() {
            let addr = VarAddr::bytes(db, start + (i * chunk) as u16, part.len() as u16);
            let pdu_ref = self.next_ref();
            let resp = self.exchange(&s7::write_var_request(pdu_ref, &addr, part))?;
            s7::parse_write_var_response(&resp).map_err(classify)?;
        }
        Ok(())
    }

    fn read_bit(&mut self, addr: BitAddr) -> Result<bool, LinkError> {
        let var = VarAddr::bit(addr.db, addr.byte, addr.bit);
        let pdu_ref = self.next_ref();
        let resp = self.exchange(&s7::read_var_request(pdu_ref, &var))?;
        let data = s7::parse_read_var_response(&resp).map_err(classify)?;
        Ok(data.first().is_some_and(|b| *b & 0x01 != 0))
    }

    fn write_bit(&mut self, addr: BitAddr, value: bool) -> Result<(), LinkError> {
        let var = VarAddr::bit(addr.db, addr.byte, addr.bit);
        let pdu_ref = self.next_ref();
        let resp = self.exchange(&s7::write_var_request(pdu_ref, &var, &[u8::from(value)]))?;
        s7::parse_write_var_response(&resp).map_err(classify)
    }
}

impl Drop for S7Client {
    fn drop(&mut self) {
        self.teardown();
    }
}
