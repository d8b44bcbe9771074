//! 穿梭车 TCP 会话
//!
//! 单连接；建连后设置 `SO_REUSEADDR`、`TCP_NODELAY` 与 `SO_KEEPALIVE`。任何发送失败或对端关闭都会拆除会话，
//! 下一次操作前需要重新 `connect`。

use crate::retry::{RetryPolicy, with_retry};
use crate::{LinkDeviceError, LinkDeviceErrorKind, LinkError, ShuttleTransport};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// 穿梭车默认端口
pub const DEFAULT_SHUTTLE_PORT: u16 = 2504;

#[derive(Debug)]
pub struct TcpShuttleLink {
    host: String,
    port: u16,
    connect_timeout: Duration,
    retry: RetryPolicy,
    stream: Option<TcpStream>,
}

impl TcpShuttleLink {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: Duration::from_secs(3),
            retry: RetryPolicy::default(),
            stream: None,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn resolve(&self) -> Result<Vec<SocketAddr>, LinkError> {
        let addrs: Vec<SocketAddr> = (self.host.as_str(), self.port).to_socket_addrs()?.collect();
        if addrs.is_empty() {
            return Err(LinkDeviceError::new(
                LinkDeviceErrorKind::Unreachable,
                format!("no address for {}", self.endpoint()),
            )
            .into());
        }
        Ok(addrs)
    }

    fn open(&self) -> Result<TcpStream, LinkError> {
        let mut last_err = None;
        for addr in self.resolve()? {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    configure_socket(&stream)?;
                    return Ok(stream);
                },
                Err(e) => last_err = Some(e),
            }
        }
        Err(match last_err {
            Some(e) if e.kind() == ErrorKind::ConnectionRefused => LinkDeviceError::new(
                LinkDeviceErrorKind::ConnectionRefused,
                format!("{} refused connection", self.endpoint()),
            )
            .into(),
            Some(e) => LinkError::Io(e),
            None => LinkError::NotConnected,
        })
    }

    fn teardown(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
            debug!("Shuttle session {} torn down", self.endpoint());
        }
    }
}

fn configure_socket(stream: &TcpStream) -> Result<(), LinkError> {
    stream.set_nodelay(true)?;

    #[cfg(unix)]
    {
        use nix::sys::socket::{setsockopt, sockopt};
        if let Err(e) = setsockopt(stream, sockopt::ReuseAddr, &true) {
            warn!("Failed to set SO_REUSEADDR: {}", e);
        }
        if let Err(e) = setsockopt(stream, sockopt::KeepAlive, &true) {
            // 失败只影响断线发现的时延，不阻塞建连
            warn!("Failed to set SO_KEEPALIVE: {}", e);
        }
    }

    Ok(())
}

impl ShuttleTransport for TcpShuttleLink {
    fn connect(&mut self) -> Result<(), LinkError> {
        self.teardown();
        let endpoint = self.endpoint();
        let stream = with_retry(&self.retry, &format!("connect {}", endpoint), |_| self.open())?;
        info!("Shuttle session established: {}", endpoint);
        self.stream = Some(stream);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.teardown();
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        let stream = self.stream.as_mut().ok_or(LinkError::NotConnected)?;
        trace!("shuttle tx: {}", hex::encode(bytes));
        // write_all 内部循环处理部分发送
        if let Err(e) = stream.write_all(bytes).and_then(|_| stream.flush()) {
            warn!("Shuttle send failed: {}", e);
            self.teardown();
            return Err(LinkError::Io(e));
        }
        Ok(())
    }

    fn recv(&mut self, timeout: Duration, max: usize) -> Result<Vec<u8>, LinkError> {
        let stream = self.stream.as_mut().ok_or(LinkError::NotConnected)?;
        // 零超时在 std 中表示非法参数
        stream.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;

        let mut buf = vec![0u8; max.max(1)];
        match stream.read(&mut buf) {
            Ok(0) => {
                warn!("Shuttle peer closed the connection");
                self.teardown();
                Err(LinkError::Closed)
            },
            Ok(n) => {
                buf.truncate(n);
                trace!("shuttle rx: {}", hex::encode(&buf));
                Ok(buf)
            },
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Err(LinkError::Timeout)
            },
            Err(e) => {
                self.teardown();
                Err(LinkError::Io(e))
            },
        }
    }
}

impl Drop for TcpShuttleLink {
    fn drop(&mut self) {
        self.teardown();
    }
}
