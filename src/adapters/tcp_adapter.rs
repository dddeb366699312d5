//! TCP transport for instruments behind serial device servers.

use crate::adapters::Transport;
use crate::error::{to_hex, CtlError, CtlResult};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Raw byte stream over TCP.
pub struct TcpTransport {
    channel: String,
    address: String,
    timeout: Duration,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    /// Connect to `address` (host:port).
    pub async fn connect(channel: &str, address: &str, timeout: Duration) -> CtlResult<Self> {
        let mut transport = Self {
            channel: channel.to_string(),
            address: address.to_string(),
            timeout,
            stream: None,
        };
        transport.establish().await?;
        Ok(transport)
    }

    async fn establish(&mut self) -> CtlResult<()> {
        let stream = tokio::time::timeout(Duration::from_secs(5), TcpStream::connect(&self.address))
            .await
            .map_err(|_| CtlError::transport(&self.channel, format!("connect to {} timed out", self.address)))?
            .map_err(|e| CtlError::transport(&self.channel, format!("connect to {} failed: {e}", self.address)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| CtlError::transport(&self.channel, e))?;
        self.stream = Some(stream);
        info!(channel = %self.channel, address = %self.address, "TCP transport connected");
        Ok(())
    }

    fn stream(&mut self) -> CtlResult<&mut TcpStream> {
        let channel = &self.channel;
        self.stream
            .as_mut()
            .ok_or_else(|| CtlError::transport(channel, "socket not connected"))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn write(&mut self, bytes: &[u8]) -> CtlResult<()> {
        let channel = self.channel.clone();
        let stream = self.stream()?;
        stream
            .write_all(bytes)
            .await
            .map_err(|e| CtlError::transport(&channel, format!("write failed: {e}")))?;
        debug!(channel = %channel, tx = %to_hex(bytes), "tcp write");
        Ok(())
    }

    async fn read(&mut self, max: usize) -> CtlResult<Vec<u8>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let timeout = self.timeout;
        let channel = self.channel.clone();
        let stream = self.stream()?;

        let mut buf = vec![0u8; max];
        match tokio::time::timeout(timeout, stream.read(&mut buf)).await {
            Err(_) => Ok(Vec::new()),
            Ok(Ok(0)) => Err(CtlError::transport(&channel, "connection closed by peer")),
            Ok(Ok(n)) => {
                buf.truncate(n);
                debug!(channel = %channel, rx = %to_hex(&buf), "tcp read");
                Ok(buf)
            }
            Ok(Err(e)) => Err(CtlError::transport(&channel, format!("read failed: {e}"))),
        }
    }

    async fn reopen(&mut self) -> CtlResult<()> {
        self.stream = None;
        self.establish().await
    }

    async fn close(&mut self) -> CtlResult<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("tcp {}", self.address)
    }
}
