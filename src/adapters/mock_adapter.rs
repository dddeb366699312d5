//! Scripted transport for testing
//!
//! `MockTransport` stands in for a serial port without requiring hardware.
//! It provides:
//! - Scripted replies, either queued up front or produced by a responder
//!   closure that sees every write
//! - Simulated per-operation latency
//! - Controllable transport fault injection (including failing reopen)
//! - A timestamped event log for test verification
//!
//! The handle is cheap to clone; clones share state, so a test keeps one clone
//! while the channel owns another.

use crate::adapters::Transport;
use crate::error::{CtlError, CtlResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Produces the reply chunks for one write.
pub type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

/// Something the transport was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    /// Bytes written
    Write(Vec<u8>),
    /// Bytes returned by a read, possibly empty
    Read(Vec<u8>),
    /// Transport reopened
    Reopen,
    /// Transport closed
    Close,
    /// Line speed changed
    BaudRate(u32),
}

struct MockState {
    pending: VecDeque<Vec<u8>>,
    responder: Option<Responder>,
    log: Vec<(Instant, MockEvent)>,
    fail_next: u32,
    fail_reopen: bool,
    reopen_count: u32,
    latency: Duration,
}

/// Mock transport for testing
///
/// # Example
///
/// ```
/// use labctl::adapters::{MockTransport, Transport};
///
/// # tokio_test::block_on(async {
/// let mock = MockTransport::new("rs232")
///     .with_responder(|written: &[u8]| vec![written.to_vec()]);
/// let mut port = mock.clone();
/// port.write(b"ping").await.unwrap();
/// assert_eq!(port.read(16).await.unwrap(), b"ping");
/// assert_eq!(mock.writes(), vec![b"ping".to_vec()]);
/// # })
/// ```
#[derive(Clone)]
pub struct MockTransport {
    channel: String,
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Create a silent mock with no latency.
    pub fn new(channel: &str) -> Self {
        Self {
            channel: channel.to_string(),
            state: Arc::new(Mutex::new(MockState {
                pending: VecDeque::new(),
                responder: None,
                log: Vec::new(),
                fail_next: 0,
                fail_reopen: false,
                reopen_count: 0,
                latency: Duration::ZERO,
            })),
        }
    }

    /// Set simulated latency, applied to every read and write.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.state.lock().latency = latency;
        self
    }

    /// Install a responder that turns each write into queued reply chunks.
    pub fn with_responder<F>(self, responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
    {
        self.set_responder(responder);
        self
    }

    /// Replace the responder.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
    {
        self.state.lock().responder = Some(Box::new(responder));
    }

    /// Queue one reply chunk; each read consumes at most one chunk.
    pub fn push_reply(&self, chunk: impl Into<Vec<u8>>) {
        self.state.lock().pending.push_back(chunk.into());
    }

    /// Fail the next `count` reads or writes with a transport fault.
    pub fn fail_next(&self, count: u32) {
        self.state.lock().fail_next = count;
    }

    /// Make reopen attempts fail.
    pub fn fail_reopen(&self, fail: bool) {
        self.state.lock().fail_reopen = fail;
    }

    /// Number of successful or attempted reopens.
    pub fn reopen_count(&self) -> u32 {
        self.state.lock().reopen_count
    }

    /// Get a copy of the event log
    pub fn events(&self) -> Vec<MockEvent> {
        self.state.lock().log.iter().map(|(_, e)| e.clone()).collect()
    }

    /// Event log with the instant each event happened.
    pub fn timed_events(&self) -> Vec<(Instant, MockEvent)> {
        self.state.lock().log.clone()
    }

    /// Every write, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .log
            .iter()
            .filter_map(|(_, e)| match e {
                MockEvent::Write(bytes) => Some(bytes.clone()),
                _ => None,
            })
            .collect()
    }

    /// Clear the event log
    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    async fn simulate_latency(&self) {
        let latency = self.state.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn injected_fault(&self, state: &mut MockState) -> Option<CtlError> {
        if state.fail_next > 0 {
            state.fail_next -= 1;
            Some(CtlError::transport(&self.channel, "device handle invalid"))
        } else {
            None
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn write(&mut self, bytes: &[u8]) -> CtlResult<()> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        if let Some(err) = self.injected_fault(&mut state) {
            return Err(err);
        }
        state.log.push((Instant::now(), MockEvent::Write(bytes.to_vec())));
        if let Some(responder) = state.responder.as_mut() {
            let chunks = responder(bytes);
            state.pending.extend(chunks);
        }
        Ok(())
    }

    async fn read(&mut self, max: usize) -> CtlResult<Vec<u8>> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        if let Some(err) = self.injected_fault(&mut state) {
            return Err(err);
        }
        let chunk = match state.pending.pop_front() {
            Some(mut chunk) if chunk.len() > max => {
                let rest = chunk.split_off(max);
                state.pending.push_front(rest);
                chunk
            }
            Some(chunk) => chunk,
            None => Vec::new(),
        };
        state.log.push((Instant::now(), MockEvent::Read(chunk.clone())));
        Ok(chunk)
    }

    async fn reopen(&mut self) -> CtlResult<()> {
        let mut state = self.state.lock();
        state.reopen_count += 1;
        state.log.push((Instant::now(), MockEvent::Reopen));
        if state.fail_reopen {
            return Err(CtlError::transport(&self.channel, "reopen failed"));
        }
        state.pending.clear();
        Ok(())
    }

    async fn close(&mut self) -> CtlResult<()> {
        let mut state = self.state.lock();
        state.log.push((Instant::now(), MockEvent::Close));
        state.pending.clear();
        Ok(())
    }

    async fn set_baud_rate(&mut self, baud_rate: u32) -> CtlResult<()> {
        self.state
            .lock()
            .log
            .push((Instant::now(), MockEvent::BaudRate(baud_rate)));
        Ok(())
    }

    fn describe(&self) -> String {
        format!("mock {}", self.channel)
    }
}
