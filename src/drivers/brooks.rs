//! Brooks digital mass-flow controllers on an RS-485 bus.
//!
//! The controllers speak the binary L-protocol (see
//! [`protocol::lprotocol`](crate::protocol::lprotocol)) and are addressed by a
//! one-byte MAC id. Several controllers share one bus and therefore one
//! [`Channel`].
//!
//! Setpoints are written with the "setpoint immediately" variable, which
//! carries the freeze flag, the setpoint code and the ramp time in one frame.

use crate::capabilities::{check_flow, FlowControl, FlowState};
use crate::channel::Channel;
use crate::error::{CtlResult, ProtocolError, ValidationError};
use crate::protocol::lprotocol::{
    self, decode_setpoint, encode_setpoint, functions, Exchange, Expect, Frame, Function,
    RetryPolicy,
};
use crate::protocol::repr;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Attempts granted to baud-rate and MAC id programming.
pub const PROGRAMMING_ATTEMPTS: u32 = 20;

/// Freeze flag: apply the new setpoint and ramp time now.
const APPLY_NOW: u8 = 0x01;

/// Source of the controller's setpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    /// Setpoint from the digital interface
    Digital,
    /// Setpoint from the analog input
    Analog,
}

impl IoMode {
    const LABELS: [&'static str; 2] = ["digital", "analog"];

    /// Wire value.
    pub fn code(self) -> u8 {
        match self {
            IoMode::Digital => 0x01,
            IoMode::Analog => 0x02,
        }
    }

    /// Inverse of [`IoMode::code`].
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(IoMode::Digital),
            0x02 => Some(IoMode::Analog),
            _ => None,
        }
    }
}

impl fmt::Display for IoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoMode::Digital => f.write_str("digital"),
            IoMode::Analog => f.write_str("analog"),
        }
    }
}

impl FromStr for IoMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "digital" => Ok(IoMode::Digital),
            "analog" => Ok(IoMode::Analog),
            other => Err(ValidationError::one_of("io mode", other, &Self::LABELS)),
        }
    }
}

#[derive(Debug)]
struct BrooksState {
    flow: FlowState,
    ramptime_ms: u16,
}

/// One L-protocol mass-flow controller.
pub struct BrooksMfc {
    channel: Arc<Channel>,
    mac_id: u8,
    init_val: f64,
    state: Mutex<BrooksState>,
}

impl BrooksMfc {
    /// Controller at `mac_id`; nothing is sent until `init_state`.
    pub fn new(channel: Arc<Channel>, mac_id: u8, fs_range: f64, init_val: f64) -> Self {
        Self {
            channel,
            mac_id,
            init_val,
            state: Mutex::new(BrooksState {
                flow: FlowState::new(fs_range),
                ramptime_ms: 0,
            }),
        }
    }

    /// Bus address.
    pub fn mac_id(&self) -> u8 {
        self.mac_id
    }

    async fn transact(
        &self,
        frame: Frame,
        expect: Expect,
        policy: RetryPolicy,
    ) -> CtlResult<Exchange> {
        self.channel
            .with_exclusive_access(move |port| {
                let frame = frame.clone();
                Box::pin(async move { lprotocol::exchange(port, &frame, expect, policy).await })
            })
            .await
    }

    /// Read a variable, retrying until the controller answers.
    async fn read(&self, function: Function, data_len: usize) -> CtlResult<Vec<u8>> {
        let policy = RetryPolicy::UntilAnswered(self.channel.params().max_unmonitored_attempts);
        let exchange = self
            .transact(
                Frame::read(self.mac_id, function),
                Expect::Packet { data_len },
                policy,
            )
            .await?;
        let reply = lprotocol::parse_reply(&exchange.reply, self.mac_id)?;
        if reply.data.len() < data_len {
            return Err(ProtocolError::malformed("reply data too short", &reply.data).into());
        }
        Ok(reply.data)
    }

    /// Write a variable within the channel's monitored retry budget.
    async fn write(&self, function: Function, data: Vec<u8>) -> CtlResult<Exchange> {
        let policy = RetryPolicy::Monitored(self.channel.params().retry_budget);
        self.transact(Frame::write(self.mac_id, function, data), Expect::Ack, policy)
            .await
    }

    /// Validate and write a setpoint, returning the exchange so callers can
    /// see how many attempts it took.
    #[instrument(skip(self), fields(mac_id = self.mac_id, attempts = tracing::field::Empty))]
    pub async fn write_setpoint(&self, flow: f64) -> CtlResult<Exchange> {
        let (fs_range, ramptime) = {
            let state = self.state.lock();
            (state.flow.fs_range, state.ramptime_ms)
        };
        check_flow(flow, fs_range)?;

        let mut data = vec![APPLY_NOW];
        data.extend_from_slice(&encode_setpoint(flow, fs_range).to_le_bytes());
        data.extend_from_slice(&ramptime.to_le_bytes());
        let exchange = self.write(functions::SETPOINT_IMMEDIATE, data).await?;

        self.state.lock().flow.curr_setp = flow;
        tracing::Span::current().record("attempts", exchange.attempts);
        debug!(flow, "Setpoint accepted");
        Ok(exchange)
    }

    /// Program the controller's baud rate.
    pub async fn set_cbr(&self, baud_rate: u32) -> CtlResult<Exchange> {
        self.transact(
            Frame::write(self.mac_id, functions::BAUD_RATE, baud_rate.to_le_bytes()),
            Expect::Ack,
            RetryPolicy::Monitored(PROGRAMMING_ATTEMPTS),
        )
        .await
    }

    /// Program the baud rate, logging rather than returning a failure. A
    /// controller that already runs at the target rate may not answer at the
    /// old one.
    pub async fn program_baud_rate(&self, baud_rate: u32) -> bool {
        match self.set_cbr(baud_rate).await {
            Ok(_) => true,
            Err(err) => {
                warn!(mac_id = self.mac_id, baud_rate, error = %err, "Baud rate not programmed");
                false
            }
        }
    }

    /// Store the ramp time used by subsequent setpoint writes.
    pub fn set_ramptime(&self, ms: f64) -> Result<u16, ValidationError> {
        if !(0.0..=f64::from(u16::MAX)).contains(&ms) {
            return Err(ValidationError::range("ramp time", repr(ms), 0.0, f64::from(u16::MAX)));
        }
        let ms = ms as u16;
        self.state.lock().ramptime_ms = ms;
        Ok(ms)
    }

    /// Setpoint after ramping has been applied.
    pub async fn filtered_setpoint(&self) -> CtlResult<f64> {
        let data = self.read(functions::FILTERED_SETPOINT, 2).await?;
        let fs_range = self.state.lock().flow.fs_range;
        Ok(decode_setpoint(u16_le(&data)?, fs_range))
    }

    /// Valve drive current in percent.
    pub async fn valve_current(&self) -> CtlResult<f64> {
        let data = self.read(functions::VALVE_CURRENT, 2).await?;
        Ok(f64::from(u16_le(&data)? as i16) / 327.68)
    }

    /// Calibration instance of the selected process gas.
    pub async fn gas_id(&self) -> CtlResult<u16> {
        let data = self.read(functions::GAS_ID, 2).await?;
        Ok(u16_le(&data)?)
    }

    /// Setpoint source.
    pub async fn io_mode(&self) -> CtlResult<IoMode> {
        let data = self.read(functions::IO_MODE, 1).await?;
        IoMode::from_code(data[0])
            .ok_or_else(|| ProtocolError::malformed("unknown io mode", &data).into())
    }

    /// Select the setpoint source.
    pub async fn set_io_mode(&self, mode: IoMode) -> CtlResult<Exchange> {
        self.write(functions::IO_MODE, vec![mode.code()]).await
    }

    /// Manufacturer, firmware, device details and serial number.
    pub async fn info(&self) -> CtlResult<Vec<String>> {
        let manufacturer = self.read(functions::MANUFACTURER, 1).await?;
        let firmware = self.read(functions::FIRMWARE, 1).await?;
        let details = self.read(functions::DETAILS, 1).await?;
        let serial = self.read(functions::SERIAL_NUMBER, 1).await?;

        let details = ["fullscale*10", "gasid", "calib1", "calib2"]
            .iter()
            .zip(details.chunks_exact(4))
            .map(|(label, b)| format!("{label}={}", u32::from_le_bytes([b[0], b[1], b[2], b[3]])))
            .collect::<Vec<_>>()
            .join(", ");

        Ok(vec![
            format!("Manufacturer ID: {}", text(&manufacturer)),
            format!("Firmware version: {}", text(&firmware)),
            format!("Device details: {details}"),
            format!("Serial no.: {}", text(&serial)),
        ])
    }
}

#[async_trait]
impl FlowControl for BrooksMfc {
    async fn init_state(&self) -> CtlResult<f64> {
        if let Some(baud_rate) = self.channel.params().baud_rate {
            self.program_baud_rate(baud_rate).await;
        }
        self.write_setpoint(self.init_val).await?;
        self.get_flow().await
    }

    async fn set_flow(&self, flow: f64) -> CtlResult<String> {
        self.write_setpoint(flow).await?;
        Ok(repr(flow))
    }

    async fn get_flow(&self) -> CtlResult<f64> {
        let data = self.read(functions::FLOW, 2).await?;
        let mut state = self.state.lock();
        state.flow.actv_flow = decode_setpoint(u16_le(&data)?, state.flow.fs_range);
        Ok(state.flow.actv_flow)
    }

    fn curr_setp(&self) -> f64 {
        self.state.lock().flow.curr_setp
    }

    async fn fs_range(&self) -> CtlResult<f64> {
        Ok(self.state.lock().flow.fs_range)
    }
}

fn u16_le(data: &[u8]) -> Result<u16, ProtocolError> {
    match data {
        [lo, hi, ..] => Ok(u16::from_le_bytes([*lo, *hi])),
        _ => Err(ProtocolError::malformed("expected two data bytes", data)),
    }
}

fn text(data: &[u8]) -> String {
    String::from_utf8_lossy(data)
        .trim_end_matches('\0')
        .trim()
        .to_string()
}
