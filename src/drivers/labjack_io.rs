//! Devices on LabJack digital and analog IO.
//!
//! - [`Switch`]: pneumatic valve on a digital line
//! - [`AnalogMfc`]: mass-flow controller read on an AIN and driven by a
//!   built-in DAC
//! - [`TickDacMfc`]: the same, driven by an LJTick-DAC accessory over I2C
//!
//! An invalid handle is a transport fault, so the owning channel reopens the
//! board and repeats the operation once.
//!
//! Analog conversions use the board's factory calibration, read once from its
//! calibration memory unless the configuration supplies constants.

use crate::capabilities::{check_flow, FlowControl, FlowState};
use crate::channel::Channel;
use crate::config::{AnalogCalibration, DacOutput, LabJackModel};
use crate::error::{CtlResult, ProtocolError, ValidationError};
use crate::protocol::labjack::{
    self, BoardCalibration, FeedbackOp, I2cRequest, LinearCal, TickDacCalibration, TICK_CAL_LEN,
    TICK_CAL_OFFSET, TICK_DAC_ADDRESS, TICK_EEPROM_ADDRESS, U3_CAL_LAYOUT, U6_CAL_LAYOUT,
};
use crate::protocol::repr;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

/// Gas state behind a switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwitchState {
    /// Gas flows
    Flow,
    /// Line closed
    #[default]
    NoFlow,
}

impl SwitchState {
    const LABELS: [&'static str; 2] = ["noflow", "flow"];

    /// Wire token of the state.
    pub fn label(self) -> &'static str {
        match self {
            SwitchState::Flow => "flow",
            SwitchState::NoFlow => "noflow",
        }
    }

    fn other(self) -> Self {
        match self {
            SwitchState::Flow => SwitchState::NoFlow,
            SwitchState::NoFlow => SwitchState::Flow,
        }
    }
}

impl fmt::Display for SwitchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for SwitchState {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "flow" => Ok(SwitchState::Flow),
            "noflow" => Ok(SwitchState::NoFlow),
            other => Err(ValidationError::one_of("requested state", other, &Self::LABELS)),
        }
    }
}

async fn feedback(channel: &Channel, ops: Vec<FeedbackOp>) -> CtlResult<Vec<u8>> {
    channel
        .with_exclusive_access(move |port| {
            let ops = ops.clone();
            Box::pin(async move { labjack::feedback(port, &ops).await })
        })
        .await
}

async fn i2c(channel: &Channel, request: I2cRequest) -> CtlResult<Vec<u8>> {
    channel
        .with_exclusive_access(move |port| {
            let request = request.clone();
            Box::pin(async move { labjack::i2c(port, &request).await })
        })
        .await
}

/// Pneumatic switch on one digital line.
///
/// The configured default state is driven by a low line, the other state by
/// a high line.
pub struct Switch {
    channel: Arc<Channel>,
    line: u8,
    default: SwitchState,
    init_val: Option<SwitchState>,
    current: Mutex<Option<SwitchState>>,
}

impl Switch {
    /// Switch on digital `line`; nothing is driven until `init_state`.
    pub fn new(
        channel: Arc<Channel>,
        line: u8,
        default: SwitchState,
        init_val: Option<SwitchState>,
    ) -> Self {
        Self {
            channel,
            line,
            default,
            init_val,
            current: Mutex::new(None),
        }
    }

    fn line_level(&self, state: SwitchState) -> bool {
        state != self.default
    }

    fn decode(&self, level: bool) -> SwitchState {
        if level {
            self.default.other()
        } else {
            self.default
        }
    }

    async fn drive(&self, state: SwitchState) -> CtlResult<SwitchState> {
        let op = FeedbackOp::BitStateWrite {
            line: self.line,
            state: self.line_level(state),
        };
        feedback(&self.channel, vec![op]).await?;
        *self.current.lock() = Some(state);
        debug!(line = self.line, %state, "Switch driven");
        Ok(state)
    }

    /// Drive the initial state, unless it is the default (the power-up state).
    pub async fn init_state(&self) -> CtlResult<SwitchState> {
        let state = self.init_val.unwrap_or(self.default);
        if state != self.default {
            self.drive(state).await?;
        }
        *self.current.lock() = Some(state);
        Ok(state)
    }

    /// Drive `state` onto the line.
    pub async fn set_state(&self, state: SwitchState) -> CtlResult<SwitchState> {
        self.drive(state).await
    }

    /// Return to the default state.
    pub async fn set_def_state(&self) -> CtlResult<SwitchState> {
        self.drive(self.default).await
    }

    /// Read the line back from the board.
    pub async fn get_state(&self) -> CtlResult<SwitchState> {
        let data = feedback(&self.channel, vec![FeedbackOp::BitStateRead { line: self.line }])
            .await?;
        let level = data
            .first()
            .map(|b| b & 0x01 == 1)
            .ok_or_else(|| ProtocolError::malformed("empty BitStateRead response", &data))?;
        let state = self.decode(level);
        *self.current.lock() = Some(state);
        Ok(state)
    }

    /// Last state driven or read.
    pub fn current(&self) -> Option<SwitchState> {
        *self.current.lock()
    }
}

/// Linear flow <-> voltage scaling of an analog MFC.
#[derive(Debug, Clone, Copy, PartialEq)]
struct AnalogScale {
    max_volt: f64,
}

impl AnalogScale {
    fn volts(&self, flow: f64, fs_range: f64) -> f64 {
        flow * self.max_volt / fs_range
    }

    fn flow(&self, volts: f64, fs_range: f64) -> f64 {
        volts * fs_range / self.max_volt
    }
}

fn from_config(calibration: &AnalogCalibration) -> BoardCalibration {
    BoardCalibration {
        ain: LinearCal {
            slope: calibration.ain_slope,
            offset: calibration.ain_offset,
        },
        dac0: LinearCal {
            slope: calibration.dac0_slope,
            offset: calibration.dac0_offset,
        },
        dac1: LinearCal {
            slope: calibration.dac1_slope,
            offset: calibration.dac1_offset,
        },
    }
}

/// Board calibration, fetched from the board on first use.
struct BoardCal {
    model: LabJackModel,
    cached: Mutex<Option<BoardCalibration>>,
}

impl BoardCal {
    fn new(model: LabJackModel, override_with: Option<&AnalogCalibration>) -> Self {
        Self {
            model,
            cached: Mutex::new(override_with.map(from_config)),
        }
    }

    async fn get(&self, channel: &Channel) -> CtlResult<BoardCalibration> {
        let cached = *self.cached.lock();
        if let Some(calibration) = cached {
            return Ok(calibration);
        }
        let layout = match self.model {
            LabJackModel::U3 => U3_CAL_LAYOUT,
            LabJackModel::U6 => U6_CAL_LAYOUT,
        };
        let calibration = channel
            .with_exclusive_access(move |port| {
                Box::pin(async move { labjack::read_board_calibration(port, layout).await })
            })
            .await?;
        info!(channel = channel.id(), ?calibration, "Board calibration loaded");
        *self.cached.lock() = Some(calibration);
        Ok(calibration)
    }
}

async fn read_ain(channel: &Channel, ain: u8, calibration: LinearCal) -> CtlResult<f64> {
    let data = feedback(channel, vec![FeedbackOp::ain(ain)]).await?;
    Ok(calibration.volts(labjack::ain24_counts(&data)?))
}

/// Analog MFC on an AIN and one of the board's DACs.
pub struct AnalogMfc {
    channel: Arc<Channel>,
    ain: u8,
    dac: u8,
    init_val: f64,
    scale: AnalogScale,
    calibration: BoardCal,
    state: Mutex<FlowState>,
}

impl AnalogMfc {
    /// MFC read on `ain` and driven by DAC `dac`. `calibration` replaces the
    /// constants stored on the board.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        channel: Arc<Channel>,
        ain: u8,
        dac: u8,
        fs_range: f64,
        init_val: f64,
        max_volt: f64,
        model: LabJackModel,
        calibration: Option<&AnalogCalibration>,
    ) -> Self {
        Self {
            channel,
            ain,
            dac,
            init_val,
            scale: AnalogScale { max_volt },
            calibration: BoardCal::new(model, calibration),
            state: Mutex::new(FlowState::new(fs_range)),
        }
    }

    /// Calibration in use, reading it from the board if needed.
    pub async fn calibration(&self) -> CtlResult<BoardCalibration> {
        self.calibration.get(&self.channel).await
    }
}

#[async_trait]
impl FlowControl for AnalogMfc {
    async fn init_state(&self) -> CtlResult<f64> {
        self.set_flow(self.init_val).await?;
        self.get_flow().await
    }

    async fn set_flow(&self, flow: f64) -> CtlResult<String> {
        let fs_range = self.state.lock().fs_range;
        check_flow(flow, fs_range)?;
        let dac_cal = self.calibration().await?.dac(self.dac);
        let value = dac_cal.dac_code(self.scale.volts(flow, fs_range));
        feedback(&self.channel, vec![FeedbackOp::Dac16 { dac: self.dac, value }]).await?;
        self.state.lock().curr_setp = flow;
        Ok(repr(flow))
    }

    async fn get_flow(&self) -> CtlResult<f64> {
        let ain_cal = self.calibration().await?.ain;
        let volts = read_ain(&self.channel, self.ain, ain_cal).await?;
        let mut state = self.state.lock();
        state.actv_flow = self.scale.flow(volts, state.fs_range);
        Ok(state.actv_flow)
    }

    fn curr_setp(&self) -> f64 {
        self.state.lock().curr_setp
    }

    async fn fs_range(&self) -> CtlResult<f64> {
        Ok(self.state.lock().fs_range)
    }
}

/// Analog MFC driven by an LJTick-DAC.
///
/// The accessory's calibration is read from its EEPROM on first use and kept
/// for the life of the device.
pub struct TickDacMfc {
    channel: Arc<Channel>,
    ain: u8,
    scl_pin: u8,
    output: DacOutput,
    init_val: f64,
    scale: AnalogScale,
    board: BoardCal,
    calibration: Mutex<Option<TickDacCalibration>>,
    state: Mutex<FlowState>,
}

impl TickDacMfc {
    /// MFC read on `ain` and driven by the accessory whose SCL is `scl_pin`
    /// (SDA is the next line). `calibration` replaces the board's AIN
    /// constants.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        channel: Arc<Channel>,
        ain: u8,
        scl_pin: u8,
        output: DacOutput,
        fs_range: f64,
        init_val: f64,
        max_volt: f64,
        model: LabJackModel,
        calibration: Option<&AnalogCalibration>,
    ) -> Self {
        Self {
            channel,
            ain,
            scl_pin,
            output,
            init_val,
            scale: AnalogScale { max_volt },
            board: BoardCal::new(model, calibration),
            calibration: Mutex::new(None),
            state: Mutex::new(FlowState::new(fs_range)),
        }
    }

    fn sda_pin(&self) -> u8 {
        self.scl_pin + 1
    }

    /// Calibration of the selected output, loading it if needed.
    pub async fn calibration(&self) -> CtlResult<LinearCal> {
        let cached = *self.calibration.lock();
        let calibration = match cached {
            Some(calibration) => calibration,
            None => {
                let block = i2c(
                    &self.channel,
                    I2cRequest {
                        address: TICK_EEPROM_ADDRESS,
                        sda_line: self.sda_pin(),
                        scl_line: self.scl_pin,
                        send: vec![TICK_CAL_OFFSET],
                        receive: TICK_CAL_LEN,
                    },
                )
                .await?;
                let calibration = TickDacCalibration::from_eeprom(&block)?;
                info!(scl = self.scl_pin, ?calibration, "LJTick-DAC calibration loaded");
                *self.calibration.lock() = Some(calibration);
                calibration
            }
        };
        Ok(match self.output {
            DacOutput::A => calibration.a,
            DacOutput::B => calibration.b,
        })
    }

    async fn write_volts(&self, volts: f64) -> CtlResult<()> {
        let calibration = self.calibration().await?;
        let code = calibration.dac_code(volts);
        let out_id = match self.output {
            DacOutput::A => 48,
            DacOutput::B => 49,
        };
        let [hi, lo] = code.to_be_bytes();
        i2c(
            &self.channel,
            I2cRequest {
                address: TICK_DAC_ADDRESS,
                sda_line: self.sda_pin(),
                scl_line: self.scl_pin,
                send: vec![out_id, hi, lo],
                receive: 0,
            },
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl FlowControl for TickDacMfc {
    async fn init_state(&self) -> CtlResult<f64> {
        self.set_flow(self.init_val).await?;
        self.get_flow().await
    }

    async fn set_flow(&self, flow: f64) -> CtlResult<String> {
        let fs_range = self.state.lock().fs_range;
        check_flow(flow, fs_range)?;
        self.write_volts(self.scale.volts(flow, fs_range)).await?;
        self.state.lock().curr_setp = flow;
        Ok(repr(flow))
    }

    async fn get_flow(&self) -> CtlResult<f64> {
        let ain_cal = self.board.get(&self.channel).await?.ain;
        let volts = read_ain(&self.channel, self.ain, ain_cal).await?;
        let mut state = self.state.lock();
        state.actv_flow = self.scale.flow(volts, state.fs_range);
        Ok(state.actv_flow)
    }

    fn curr_setp(&self) -> f64 {
        self.state.lock().curr_setp
    }

    async fn fs_range(&self) -> CtlResult<f64> {
        Ok(self.state.lock().fs_range)
    }
}
