//! Serial transport for RS-232/RS-485 instruments
//!
//! Wraps `tokio_serial::SerialStream`. Reads are bounded by the channel timeout
//! and return whatever arrived in that window, which is what the byte-oriented
//! instrument protocols expect (the L-protocol in particular polls with very
//! short timeouts at 115200 baud).

use crate::adapters::Transport;
use crate::config::Parity;
use crate::error::{to_hex, CtlError, CtlResult};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

#[cfg(feature = "tokio_serial")]
use tokio::io::{AsyncReadExt, AsyncWriteExt};
#[cfg(feature = "tokio_serial")]
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};

/// Serial port transport.
pub struct SerialTransport {
    /// Owning channel id, used in errors and logs
    channel: String,

    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    path: String,

    baud_rate: u32,
    parity: Parity,

    /// Per-read timeout
    timeout: Duration,

    #[cfg(feature = "tokio_serial")]
    stream: Option<SerialStream>,
}

impl SerialTransport {
    /// Create an unopened transport with default settings (no parity, 50 ms).
    pub fn new(channel: &str, path: &str, baud_rate: u32) -> Self {
        Self {
            channel: channel.to_string(),
            path: path.to_string(),
            baud_rate,
            parity: Parity::None,
            timeout: Duration::from_millis(50),
            #[cfg(feature = "tokio_serial")]
            stream: None,
        }
    }

    /// Set parity
    pub fn with_parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    /// Set read timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Open the port, consuming the unopened transport.
    pub async fn open(mut self) -> CtlResult<Self> {
        self.connect()?;
        Ok(self)
    }

    #[cfg(feature = "tokio_serial")]
    fn connect(&mut self) -> CtlResult<()> {
        let parity = match self.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        };

        let stream = tokio_serial::new(&self.path, self.baud_rate)
            .parity(parity)
            .data_bits(tokio_serial::DataBits::Eight)
            .stop_bits(tokio_serial::StopBits::One)
            .timeout(self.timeout)
            .open_native_async()
            .map_err(|e| {
                CtlError::transport(
                    &self.channel,
                    format!(
                        "failed to open serial port '{}' at {} baud: {}",
                        self.path, self.baud_rate, e
                    ),
                )
            })?;

        self.stream = Some(stream);
        info!(
            channel = %self.channel,
            port = %self.path,
            baud = self.baud_rate,
            "Serial port opened"
        );
        Ok(())
    }

    #[cfg(not(feature = "tokio_serial"))]
    fn connect(&mut self) -> CtlResult<()> {
        Err(CtlError::SerialFeatureDisabled)
    }

    #[cfg(feature = "tokio_serial")]
    fn stream(&mut self) -> CtlResult<&mut SerialStream> {
        let channel = &self.channel;
        self.stream
            .as_mut()
            .ok_or_else(|| CtlError::transport(channel, "serial port not open"))
    }
}

#[cfg(feature = "tokio_serial")]
#[async_trait]
impl Transport for SerialTransport {
    async fn write(&mut self, bytes: &[u8]) -> CtlResult<()> {
        let channel = self.channel.clone();
        let stream = self.stream()?;
        stream
            .write_all(bytes)
            .await
            .map_err(|e| CtlError::transport(&channel, format!("write failed: {e}")))?;
        stream
            .flush()
            .await
            .map_err(|e| CtlError::transport(&channel, format!("flush failed: {e}")))?;
        debug!(channel = %channel, tx = %to_hex(bytes), "serial write");
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
            // Silence within the window is not a fault
            Err(_) => Ok(Vec::new()),
            Ok(Ok(0)) => Err(CtlError::transport(&channel, "unexpected EOF from serial port")),
            Ok(Ok(n)) => {
                buf.truncate(n);
                debug!(channel = %channel, rx = %to_hex(&buf), "serial read");
                Ok(buf)
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::TimedOut => Ok(Vec::new()),
            Ok(Err(e)) => Err(CtlError::transport(&channel, format!("read failed: {e}"))),
        }
    }

    async fn reopen(&mut self) -> CtlResult<()> {
        self.stream = None;
        self.connect()
    }

    async fn close(&mut self) -> CtlResult<()> {
        if self.stream.take().is_some() {
            info!(channel = %self.channel, port = %self.path, "Serial port closed");
        }
        Ok(())
    }

    async fn set_baud_rate(&mut self, baud_rate: u32) -> CtlResult<()> {
        let channel = self.channel.clone();
        let stream = self.stream()?;
        stream
            .set_baud_rate(baud_rate)
            .map_err(|e| CtlError::transport(&channel, format!("baud change failed: {e}")))?;
        self.baud_rate = baud_rate;
        info!(channel = %channel, baud = baud_rate, "Serial baud rate changed");
        Ok(())
    }

    fn describe(&self) -> String {
        format!("serial {} @ {} baud", self.path, self.baud_rate)
    }
}

#[cfg(not(feature = "tokio_serial"))]
#[async_trait]
impl Transport for SerialTransport {
    async fn write(&mut self, _bytes: &[u8]) -> CtlResult<()> {
        Err(CtlError::SerialFeatureDisabled)
    }

    async fn read(&mut self, _max: usize) -> CtlResult<Vec<u8>> {
        Err(CtlError::SerialFeatureDisabled)
    }

    async fn reopen(&mut self) -> CtlResult<()> {
        Err(CtlError::SerialFeatureDisabled)
    }

    fn describe(&self) -> String {
        format!("serial {} @ {} baud (disabled)", self.path, self.baud_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_transport_builder() {
        let transport = SerialTransport::new("rs485", "/dev/ttyS0", 115200)
            .with_parity(Parity::Odd)
            .with_timeout(Duration::from_millis(2));

        assert_eq!(transport.timeout, Duration::from_millis(2));
        assert_eq!(transport.parity, Parity::Odd);
        assert_eq!(transport.baud_rate, 115200);
    }

    #[test]
    fn test_describe_string() {
        let transport = SerialTransport::new("rs232", "COM3", 9600);
        let info = transport.describe();
        assert!(info.contains("COM3"));
        assert!(info.contains("9600"));
    }

    #[tokio::test]
    async fn test_open_missing_port_is_transport_fault() {
        let result = SerialTransport::new("rs232", "/dev/does-not-exist-labctl", 9600)
            .open()
            .await;
        match result {
            Err(err) => assert!(
                err.is_transport_fault() || matches!(err, CtlError::SerialFeatureDisabled)
            ),
            Ok(_) => panic!("opening a missing port should fail"),
        }
    }
}
