//! Byte-level transports underneath a [`Channel`](crate::channel::Channel).
//!
//! A transport knows how to move bytes over one physical link and how to reopen
//! that link after a fault. It knows nothing about framing; protocol drivers
//! build and parse frames on top of it, always while holding the owning
//! channel's lock.

use crate::config::TransportConfig;
use crate::error::CtlResult;
use async_trait::async_trait;
use std::time::Duration;

pub mod mock_adapter;
pub mod serial_adapter;
pub mod tcp_adapter;

pub use mock_adapter::{MockEvent, MockTransport};
pub use serial_adapter::SerialTransport;
pub use tcp_adapter::TcpTransport;

/// One physical link (serial port, USB bridge, socket).
///
/// `read` never blocks past the transport's timeout: silence is reported as an
/// empty buffer, not as an error. Errors are reserved for faults of the handle
/// itself and are reported as [`CtlError::Transport`](crate::error::CtlError::Transport),
/// which is what makes the owning channel reopen the link.
#[async_trait]
pub trait Transport: Send {
    /// Write all bytes and flush.
    async fn write(&mut self, bytes: &[u8]) -> CtlResult<()>;

    /// Read at most `max` bytes, waiting no longer than the configured timeout.
    async fn read(&mut self, max: usize) -> CtlResult<Vec<u8>>;

    /// Close and reopen the underlying handle with the same settings.
    async fn reopen(&mut self) -> CtlResult<()>;

    /// Release the underlying handle. A later `reopen` brings it back.
    async fn close(&mut self) -> CtlResult<()> {
        Ok(())
    }

    /// Change the link speed. Links without a baud rate ignore this.
    async fn set_baud_rate(&mut self, _baud_rate: u32) -> CtlResult<()> {
        Ok(())
    }

    /// Human readable description for logs.
    fn describe(&self) -> String;
}

/// Open the transport described by a channel's configuration.
pub async fn open_transport(
    channel_id: &str,
    config: &TransportConfig,
) -> CtlResult<Box<dyn Transport>> {
    match config {
        TransportConfig::Serial {
            path,
            baud_rate,
            parity,
            timeout_ms,
        } => {
            let transport = SerialTransport::new(channel_id, path, *baud_rate)
                .with_parity(*parity)
                .with_timeout(Duration::from_millis(*timeout_ms))
                .open()
                .await?;
            Ok(Box::new(transport))
        }
        TransportConfig::Tcp {
            address,
            timeout_ms,
        } => {
            let transport = TcpTransport::connect(
                channel_id,
                address,
                Duration::from_millis(*timeout_ms),
            )
            .await?;
            Ok(Box::new(transport))
        }
        TransportConfig::Mock => Ok(Box::new(MockTransport::new(channel_id))),
    }
}
