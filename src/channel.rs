//! Exclusive access to one physical bus.
//!
//! A [`Channel`] owns the transport of one bus behind an async mutex. Every
//! request/response exchange, retries included, runs inside
//! [`Channel::with_exclusive_access`], so frames from devices sharing the bus
//! can never interleave on the wire. Waiters are served in arrival order
//! (`tokio::sync::Mutex` is fair).

use crate::adapters::{open_transport, Transport};
use crate::config::ChannelConfig;
use crate::error::CtlResult;
use futures::future::BoxFuture;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

/// Bus-level parameters shared by every device on a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelParams {
    /// Working baud rate, for serial links
    pub baud_rate: Option<u32>,
    /// Per-read timeout of the transport
    pub timeout: Duration,
    /// Attempts granted to exchanges that monitor their retries
    pub retry_budget: u32,
    /// Bound for exchanges that retry until they get an answer
    pub max_unmonitored_attempts: u32,
}

impl Default for ChannelParams {
    fn default() -> Self {
        Self {
            baud_rate: None,
            timeout: Duration::from_millis(50),
            retry_budget: 100,
            max_unmonitored_attempts: 1000,
        }
    }
}

impl From<&ChannelConfig> for ChannelParams {
    fn from(config: &ChannelConfig) -> Self {
        Self {
            baud_rate: config.baud_rate(),
            timeout: config.read_timeout(),
            retry_budget: config.retry_budget,
            max_unmonitored_attempts: config.max_unmonitored_attempts,
        }
    }
}

/// One physical bus and its lock.
pub struct Channel {
    id: String,
    params: ChannelParams,
    transport: Mutex<Box<dyn Transport>>,
}

impl Channel {
    /// Wrap an already opened transport.
    pub fn new(id: impl Into<String>, transport: Box<dyn Transport>, params: ChannelParams) -> Self {
        Self {
            id: id.into(),
            params,
            transport: Mutex::new(transport),
        }
    }

    /// Open the transport a channel configuration describes.
    pub async fn open(config: &ChannelConfig) -> CtlResult<Self> {
        let transport = open_transport(&config.id, &config.transport).await?;
        info!(channel = %config.id, transport = %transport.describe(), "Channel opened");
        Ok(Self::new(config.id.clone(), transport, ChannelParams::from(config)))
    }

    /// Channel id from the configuration.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Retry limits and bootstrap settings.
    pub fn params(&self) -> &ChannelParams {
        &self.params
    }

    /// Run `op` against the live transport while holding the channel lock.
    ///
    /// The lock is released on every exit path. If `op` fails with a transport
    /// fault, the transport is reopened and `op` runs once more; a failed
    /// reopen is returned to the caller.
    ///
    /// `op` may be called twice, so anything the returned future owns has to
    /// be cloned inside the closure:
    ///
    /// ```
    /// use labctl::adapters::MockTransport;
    /// use labctl::channel::{Channel, ChannelParams};
    ///
    /// # tokio_test::block_on(async {
    /// let mock = MockTransport::new("rs232").with_responder(|_: &[u8]| vec![b"0OK\r".to_vec()]);
    /// let channel = Channel::new("rs232", Box::new(mock), ChannelParams::default());
    ///
    /// let reply = channel
    ///     .with_exclusive_access(|port| {
    ///         Box::pin(async move {
    ///             port.write(b"#R38\n").await?;
    ///             port.read(50).await
    ///         })
    ///     })
    ///     .await
    ///     .unwrap();
    /// assert_eq!(reply, b"0OK\r");
    /// # })
    /// ```
    #[instrument(skip(self, op), fields(channel = %self.id))]
    pub async fn with_exclusive_access<T, F>(&self, mut op: F) -> CtlResult<T>
    where
        F: for<'t> FnMut(&'t mut dyn Transport) -> BoxFuture<'t, CtlResult<T>> + Send,
        T: Send,
    {
        let mut transport = self.transport.lock().await;
        match op(transport.as_mut()).await {
            Err(err) if err.is_transport_fault() => {
                warn!(channel = %self.id, error = %err, "Transport fault, reopening");
                if let Err(reopen_err) = transport.reopen().await {
                    warn!(channel = %self.id, error = %reopen_err, "Reopen failed");
                    return Err(reopen_err);
                }
                op(transport.as_mut()).await
            }
            other => other,
        }
    }

    /// Change the link speed of the bus.
    pub async fn set_baud_rate(&self, baud_rate: u32) -> CtlResult<()> {
        self.with_exclusive_access(|port| Box::pin(async move { port.set_baud_rate(baud_rate).await }))
            .await
    }

    /// Release the transport handle.
    pub async fn close(&self) -> CtlResult<()> {
        let mut transport = self.transport.lock().await;
        transport.close().await?;
        info!(channel = %self.id, "Channel closed");
        Ok(())
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MockEvent, MockTransport};
    use crate::error::CtlError;
    use std::sync::Arc;
    use std::time::Instant;
    use tracing_test::traced_test;

    fn channel_with(mock: &MockTransport) -> Channel {
        Channel::new("test", Box::new(mock.clone()), ChannelParams::default())
    }

    async fn ping(channel: &Channel) -> CtlResult<Vec<u8>> {
        channel
            .with_exclusive_access(|port| {
                Box::pin(async move {
                    port.write(b"ping").await?;
                    port.read(16).await
                })
            })
            .await
    }

    #[tokio::test]
    #[traced_test]
    async fn test_reopen_once_on_transport_fault() {
        let mock = MockTransport::new("test").with_responder(|w: &[u8]| vec![w.to_vec()]);
        mock.fail_next(1);
        let channel = channel_with(&mock);

        let reply = ping(&channel).await.unwrap();
        assert_eq!(reply, b"ping");
        assert_eq!(mock.reopen_count(), 1);
        assert!(logs_contain("Transport fault, reopening"));
    }

    #[tokio::test]
    async fn test_second_fault_is_surfaced() {
        let mock = MockTransport::new("test");
        mock.fail_next(2);
        let channel = channel_with(&mock);

        let err = ping(&channel).await.unwrap_err();
        assert!(err.is_transport_fault());
        assert_eq!(mock.reopen_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_reopen_is_surfaced() {
        let mock = MockTransport::new("test");
        mock.fail_next(1);
        mock.fail_reopen(true);
        let channel = channel_with(&mock);

        let err = ping(&channel).await.unwrap_err();
        assert!(matches!(err, CtlError::Transport { .. }));
        assert!(err.to_string().contains("reopen failed"));
    }

    #[tokio::test]
    async fn test_lock_released_after_error() {
        let mock = MockTransport::new("test");
        let channel = channel_with(&mock);

        let err = channel
            .with_exclusive_access(|_port| {
                Box::pin(async move { Err::<(), _>(CtlError::Config("boom".into())) })
            })
            .await;
        assert!(err.is_err());
        // A second exchange must not deadlock
        assert!(ping(&channel).await.is_ok());
        assert_eq!(mock.reopen_count(), 0);
    }

    #[tokio::test]
    async fn test_exchanges_do_not_overlap() {
        let mock = MockTransport::new("test")
            .with_latency(Duration::from_millis(10))
            .with_responder(|w: &[u8]| vec![w.to_vec()]);
        let channel = Arc::new(channel_with(&mock));

        let spans = Arc::new(parking_lot::Mutex::new(Vec::<(Instant, Instant)>::new()));
        let mut handles = Vec::new();
        for _ in 0..3 {
            let channel = Arc::clone(&channel);
            let spans = Arc::clone(&spans);
            handles.push(tokio::spawn(async move {
                channel
                    .with_exclusive_access(|port| {
                        let spans = Arc::clone(&spans);
                        Box::pin(async move {
                            let start = Instant::now();
                            port.write(b"x").await?;
                            port.read(1).await?;
                            spans.lock().push((start, Instant::now()));
                            Ok(())
                        })
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let mut spans = spans.lock().clone();
        spans.sort();
        assert_eq!(spans.len(), 3);
        for pair in spans.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "lock intervals overlap");
        }
    }

    #[tokio::test]
    async fn test_baud_rate_and_close_reach_transport() {
        let mock = MockTransport::new("test");
        let channel = channel_with(&mock);
        channel.set_baud_rate(9600).await.unwrap();
        channel.close().await.unwrap();
        assert_eq!(mock.events(), vec![MockEvent::BaudRate(9600), MockEvent::Close]);
    }
}
