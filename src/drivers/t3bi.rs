//! MKS Type T3Bi throttle valve controller.
//!
//! The controller regulates chamber pressure by moving a butterfly valve. It
//! holds five programmable setpoints (A-E), each either a valve position or a
//! pressure in percent of the sensor's full scale, and reads two pressure
//! sensors (high and low range).
//!
//! Commands and replies use the status-coded ASCII protocol in
//! [`protocol::status_ascii`](crate::protocol::status_ascii). Every argument is
//! checked against the controller's allowed values before it is sent, and the
//! cached state is only updated after the controller accepted a command.

use crate::channel::Channel;
use crate::error::{CtlError, CtlResult, ProtocolError, ValidationError};
use crate::protocol::repr;
use crate::protocol::status_ascii::{
    self, field, field_char, number_from, ActiveSensor, ControlMode, ControlResponse,
    PressureStatus, PressureUnits, SafetyState, SensorRange, SetpointMode, SetpointName,
    SlowpumpCondition, ValveStatus,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Password that unlocks the calibration commands.
const CALIBRATION_UNLOCK: &str = "CAL1234";
/// Return to user mode.
const CALIBRATION_EXIT: &str = "USR";

/// Allowed range of setpoint gain and phase.
pub const TUNING_RANGE: (i64, i64) = (1, 32767);

/// Target of one programmable setpoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Setpoint {
    /// Position or pressure control
    pub mode: SetpointMode,
    /// Percent of full scale (position or pressure)
    pub value: f64,
    /// Softstart rate in percent of full speed
    pub softstart: f64,
}

impl Default for Setpoint {
    fn default() -> Self {
        Self {
            mode: SetpointMode::Position,
            value: 0.0,
            softstart: 100.0,
        }
    }
}

impl Setpoint {
    /// Value within 0..=100 percent, softstart within 0.1..=100.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(0.0..=100.0).contains(&self.value) {
            return Err(ValidationError::range("setpoint value", repr(self.value), 0.0, 100.0));
        }
        if !(0.1..=100.0).contains(&self.softstart) {
            return Err(ValidationError::range(
                "softstart rate",
                repr(self.softstart),
                0.1,
                100.0,
            ));
        }
        Ok(())
    }
}

/// Setpoint programmed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SetpointInit {
    /// Setpoint slot
    pub name: SetpointName,
    /// Position or pressure control
    pub mode: SetpointMode,
    /// Percent of full scale
    pub value: f64,
    /// Softstart rate in percent of full speed
    #[serde(default = "default_softstart")]
    pub softstart: f64,
}

impl SetpointInit {
    /// The target without its slot.
    pub fn setpoint(&self) -> Setpoint {
        Setpoint {
            mode: self.mode,
            value: self.value,
            softstart: self.softstart,
        }
    }
}

fn default_softstart() -> f64 {
    100.0
}

/// Slowpump (gentle pump-down) settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Slowpump {
    /// Enabled, disabled or only below the threshold
    pub state: SlowpumpCondition,
    /// Torr/s
    pub rate: f64,
    /// Percent of the high range sensor
    pub pressure: f64,
}

impl Default for Slowpump {
    fn default() -> Self {
        Self {
            state: SlowpumpCondition::Disable,
            rate: 20.0,
            pressure: 0.0,
        }
    }
}

impl Slowpump {
    /// Positive rate, pressure within 0..=100 percent.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.rate.is_nan() || self.rate <= 0.0 {
            return Err(ValidationError::new("slowpump rate", repr(self.rate), "> 0"));
        }
        if !(0.0..=100.0).contains(&self.pressure) {
            return Err(ValidationError::range(
                "slowpump pressure",
                repr(self.pressure),
                0.0,
                100.0,
            ));
        }
        Ok(())
    }
}

/// Valve state forced before the setpoints are programmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ManualValve {
    /// Fully open
    Open,
    /// Fully closed
    #[default]
    Close,
}

/// Setpoint to activate at the end of initialisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ActiveSetpoint {
    /// Leave the valve under manual control
    #[default]
    Manual,
    /// Control on the named setpoint
    Setpoint(SetpointName),
}

impl TryFrom<String> for ActiveSetpoint {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value == "manual" {
            return Ok(ActiveSetpoint::Manual);
        }
        value.parse().map(ActiveSetpoint::Setpoint).map_err(|_| {
            ValidationError::one_of("active setpoint", &value, &["manual", "A", "B", "C", "D", "E"])
        })
    }
}

impl From<ActiveSetpoint> for String {
    fn from(value: ActiveSetpoint) -> Self {
        value.to_string()
    }
}

impl fmt::Display for ActiveSetpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActiveSetpoint::Manual => f.write_str("manual"),
            ActiveSetpoint::Setpoint(name) => write!(f, "{name}"),
        }
    }
}

/// Startup parameters of the valve controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct T3biInit {
    /// Manual valve state forced first
    pub manual_setp: ManualValve,
    /// Reprogram the sensor ranges (requires calibration mode)
    pub reset_sensor_range: bool,
    /// Full scale of the high range sensor
    pub high_sensor_fs_range: SensorRange,
    /// Full scale of the low range sensor
    pub low_sensor_fs_range: SensorRange,
    /// Slowpump settings
    pub slowpump: Slowpump,
    /// Valve state on loss of control
    pub fallback_state: SafetyState,
    /// Setpoints programmed in order
    pub setpoints: Vec<SetpointInit>,
    /// Setpoint left active
    pub actv_setpoint: ActiveSetpoint,
}

impl Default for T3biInit {
    fn default() -> Self {
        Self {
            manual_setp: ManualValve::Close,
            reset_sensor_range: false,
            high_sensor_fs_range: SensorRange::Torr1000,
            low_sensor_fs_range: SensorRange::Torr1,
            slowpump: Slowpump::default(),
            fallback_state: SafetyState::Close,
            setpoints: Vec::new(),
            actv_setpoint: ActiveSetpoint::Manual,
        }
    }
}

impl T3biInit {
    /// Check every setpoint and the slowpump settings.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for setpoint in &self.setpoints {
            setpoint.setpoint().validate()?;
        }
        self.slowpump.validate()
    }
}

/// Which of the two pressure sensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sensor {
    /// High range sensor
    High,
    /// Low range sensor
    Low,
}

impl Sensor {
    fn range_report(self) -> &'static str {
        match self {
            Sensor::High => "R33",
            Sensor::Low => "R55",
        }
    }

    fn range_command(self) -> &'static str {
        match self {
            Sensor::High => "EH",
            Sensor::Low => "EL",
        }
    }
}

/// Reply to the valve state report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValveState {
    /// What is controlling the valve
    pub control: ControlResponse,
    /// Open, closed or in between
    pub valve: ValveStatus,
    /// Pressure relative to setpoint
    pub pressure: PressureStatus,
    /// Sensor used for control
    pub sensor: ActiveSensor,
}

impl ValveState {
    fn parse(payload: &str) -> Result<Self, ProtocolError> {
        Ok(Self {
            control: ControlResponse::decode(field_char(payload, 1)?)?,
            valve: ValveStatus::decode(field_char(payload, 2)?)?,
            pressure: PressureStatus::decode(field_char(payload, 3)?)?,
            sensor: ActiveSensor::decode(field_char(payload, 4)?)?,
        })
    }

    /// Wire labels, in report order.
    pub fn labels(&self) -> Vec<String> {
        vec![
            self.control.to_string(),
            self.valve.to_string(),
            self.pressure.to_string(),
            self.sensor.to_string(),
        ]
    }
}

#[derive(Debug)]
struct TvcState {
    setpoints: [Setpoint; 5],
    /// gain, phase
    tuning: [(u16, u16); 5],
    high_fs: f64,
    low_fs: f64,
    active_channel: char,
    control: Option<ControlResponse>,
    valve: Option<ValveStatus>,
    slowpump: Slowpump,
    fallback: SafetyState,
}

impl Default for TvcState {
    fn default() -> Self {
        Self {
            setpoints: [Setpoint::default(); 5],
            tuning: [(10000, 20), (2000, 20), (1000, 20), (1000, 20), (1000, 20)],
            high_fs: 1000.0,
            low_fs: 1.0,
            active_channel: 'H',
            control: None,
            valve: None,
            slowpump: Slowpump::default(),
            fallback: SafetyState::Close,
        }
    }
}

/// Throttle valve controller.
pub struct Tvc {
    channel: Arc<Channel>,
    init: T3biInit,
    state: Mutex<TvcState>,
}

impl Tvc {
    /// Controller on `channel`; nothing is sent until `init_state`.
    pub fn new(channel: Arc<Channel>, init: T3biInit) -> Self {
        Self {
            channel,
            init,
            state: Mutex::new(TvcState::default()),
        }
    }

    /// Run `commands` back to back under one channel lock, returning every
    /// reply payload.
    async fn query_all(&self, commands: Vec<String>) -> CtlResult<Vec<String>> {
        self.channel
            .with_exclusive_access(move |port| {
                let commands = commands.clone();
                Box::pin(async move {
                    let mut replies = Vec::with_capacity(commands.len());
                    for command in &commands {
                        replies.push(status_ascii::query(port, command).await?);
                    }
                    Ok(replies)
                })
            })
            .await
    }

    async fn query(&self, command: String) -> CtlResult<String> {
        let mut replies = self.query_all(vec![command]).await?;
        replies
            .pop()
            .ok_or_else(|| ProtocolError::NoResponse { attempts: 1 }.into())
    }

    /// Commands the controller does not answer.
    async fn send(&self, command: &'static str) -> CtlResult<()> {
        self.channel
            .with_exclusive_access(move |port| {
                Box::pin(async move { status_ascii::send(port, command).await })
            })
            .await
    }

    /// Replay the configured startup sequence.
    #[instrument(skip(self))]
    pub async fn init_state(&self) -> CtlResult<Vec<String>> {
        let init = self.init.clone();
        match init.manual_setp {
            ManualValve::Open => self.valve_open().await?,
            ManualValve::Close => self.valve_close().await?,
        };
        if init.reset_sensor_range {
            self.program_sensor_range(Sensor::High, init.high_sensor_fs_range)
                .await?;
            self.program_sensor_range(Sensor::Low, init.low_sensor_fs_range)
                .await?;
        }
        self.sensor_ranges().await?;
        self.state.lock().slowpump = init.slowpump;
        self.set_safety_state(init.fallback_state).await?;
        for setpoint in &init.setpoints {
            self.set_setp_state(setpoint.name, setpoint.setpoint())
                .await?;
        }
        let reply = match init.actv_setpoint {
            ActiveSetpoint::Manual => vec![ActiveSetpoint::Manual.to_string()],
            ActiveSetpoint::Setpoint(name) => self.activate_setp(name).await?,
        };
        info!(active = %init.actv_setpoint, "Valve controller initialised");
        Ok(reply)
    }

    /// Open the valve fully.
    pub async fn valve_open(&self) -> CtlResult<Vec<String>> {
        self.send("O").await?;
        self.state.lock().valve = Some(ValveStatus::Open);
        Ok(vec![ValveStatus::Open.to_string()])
    }

    /// Close the valve fully.
    pub async fn valve_close(&self) -> CtlResult<Vec<String>> {
        self.send("C").await?;
        self.state.lock().valve = Some(ValveStatus::Close);
        Ok(vec![ValveStatus::Close.to_string()])
    }

    /// Stop the valve where it is.
    pub async fn valve_hold(&self) -> CtlResult<Vec<String>> {
        self.send("H").await?;
        self.state.lock().valve = None;
        Ok(vec!["hold".to_string()])
    }

    /// Pressure in Torr from the sensor last reported active.
    pub async fn pressure(&self) -> CtlResult<f64> {
        let payload = self.query("R5".to_string()).await?;
        let percent = pressure_percent(&payload)?;
        let state = self.state.lock();
        let full_scale = if state.active_channel == 'H' {
            state.high_fs
        } else {
            state.low_fs
        };
        Ok(0.01 * percent * full_scale)
    }

    /// Valve position in percent open.
    pub async fn position(&self) -> CtlResult<f64> {
        let payload = self.query("R6".to_string()).await?;
        Ok(number_from(&payload, 1)?)
    }

    /// Pressure and position in one locked exchange, formatted `p,v`.
    ///
    /// With automatic crossover the pressure report is always relative to the
    /// high range sensor.
    pub async fn pressure_position(&self) -> CtlResult<String> {
        let replies = self
            .query_all(vec!["R5".to_string(), "R6".to_string()])
            .await?;
        let (pressure, position) = match replies.as_slice() {
            [p, v] => (number_from(p, 2)?, number_from(v, 2)?),
            _ => return Err(ProtocolError::NoResponse { attempts: 1 }.into()),
        };
        let high_fs = self.state.lock().high_fs;
        Ok(format!("{:.5},{:.4}", 0.01 * pressure * high_fs, position))
    }

    /// Read back one setpoint's mode, value and softstart rate.
    pub async fn get_setp_state(&self, name: SetpointName) -> CtlResult<Vec<String>> {
        let replies = self
            .query_all(vec![
                format!("R{}", name.mode_report()),
                format!("R{}", name.value_report()),
                format!("R{}", name.softstart_report()),
            ])
            .await?;
        let setpoint = match replies.as_slice() {
            [mode, value, softstart] => Setpoint {
                mode: SetpointMode::decode(field_char(mode, 2)?)?,
                value: number_from(value, 2)?,
                softstart: number_from(softstart, 2)?,
            },
            _ => return Err(ProtocolError::NoResponse { attempts: 1 }.into()),
        };
        self.state.lock().setpoints[name.index()] = setpoint;
        Ok(setpoint_reply(name, &setpoint))
    }

    /// Program mode, value and softstart rate of one setpoint.
    #[instrument(skip(self))]
    pub async fn set_setp_state(
        &self,
        name: SetpointName,
        setpoint: Setpoint,
    ) -> CtlResult<Vec<String>> {
        setpoint.validate()?;
        let code = name.code();
        self.query_all(vec![
            format!("T{code}{}", setpoint.mode.code()),
            format!("S{code}{}", repr(setpoint.value)),
            format!("I{code}{}", repr(setpoint.softstart)),
        ])
        .await?;
        self.state.lock().setpoints[name.index()] = setpoint;
        debug!(setpoint = %name, ?setpoint, "Setpoint programmed");
        Ok(setpoint_reply(name, &setpoint))
    }

    /// Gain and phase of a setpoint.
    pub async fn get_setp_params(&self, name: SetpointName) -> CtlResult<Vec<String>> {
        let replies = self
            .query_all(vec![
                format!("R{}", name.gain_report()),
                format!("R{}", name.phase_report()),
            ])
            .await?;
        let (gain, phase) = match replies.as_slice() {
            [gain, phase] => (tuning_value(gain)?, tuning_value(phase)?),
            _ => return Err(ProtocolError::NoResponse { attempts: 1 }.into()),
        };
        self.state.lock().tuning[name.index()] = (gain, phase);
        Ok(vec![name.to_string(), gain.to_string(), phase.to_string()])
    }

    /// Program gain and phase of a setpoint.
    pub async fn set_setp_params(
        &self,
        name: SetpointName,
        gain: i64,
        phase: i64,
    ) -> CtlResult<Vec<String>> {
        let gain = check_tuning("gain", gain)?;
        let phase = check_tuning("phase", phase)?;
        let code = name.code();
        self.query_all(vec![format!("M{code}{gain}"), format!("X{code}{phase}")])
            .await?;
        self.state.lock().tuning[name.index()] = (gain, phase);
        Ok(vec![name.to_string(), gain.to_string(), phase.to_string()])
    }

    /// Make the controller follow a setpoint.
    pub async fn activate_setp(&self, name: SetpointName) -> CtlResult<Vec<String>> {
        self.query(format!("D{}", name.code())).await?;
        let mut state = self.state.lock();
        state.control = ControlResponse::from_code(name.code());
        Ok(setpoint_reply(name, &state.setpoints[name.index()]))
    }

    /// Report of the valve state; also refreshes which sensor is active.
    pub async fn valve_state(&self) -> CtlResult<ValveState> {
        let payload = self.query("R7".to_string()).await?;
        let report = ValveState::parse(&payload)?;
        let mut state = self.state.lock();
        state.control = Some(report.control);
        state.valve = Some(report.valve);
        state.active_channel = report.sensor.channel();
        Ok(report)
    }

    /// Full scale of the high and low range sensors, in Torr.
    pub async fn sensor_ranges(&self) -> CtlResult<(f64, f64)> {
        let replies = self
            .query_all(vec![
                Sensor::High.range_report().to_string(),
                Sensor::Low.range_report().to_string(),
            ])
            .await?;
        let (high, low) = match replies.as_slice() {
            [high, low] => (
                SensorRange::decode(field(high, 2, 4)?)?.torr(),
                SensorRange::decode(field(low, 2, 4)?)?.torr(),
            ),
            _ => return Err(ProtocolError::NoResponse { attempts: 1 }.into()),
        };
        let mut state = self.state.lock();
        state.high_fs = high;
        state.low_fs = low;
        Ok((high, low))
    }

    /// Change a sensor's full scale. The change is bracketed by entering and
    /// leaving calibration mode, all under one lock.
    pub async fn program_sensor_range(&self, sensor: Sensor, range: SensorRange) -> CtlResult<()> {
        let command = format!("{}{}", sensor.range_command(), range.code());
        self.channel
            .with_exclusive_access(move |port| {
                let command = command.clone();
                Box::pin(async move {
                    status_ascii::query(port, CALIBRATION_UNLOCK).await?;
                    let result = status_ascii::query(port, &command).await;
                    status_ascii::query(port, CALIBRATION_EXIT).await?;
                    result.map(|_| ())
                })
            })
            .await?;
        let mut state = self.state.lock();
        match sensor {
            Sensor::High => state.high_fs = range.torr(),
            Sensor::Low => state.low_fs = range.torr(),
        }
        Ok(())
    }

    /// Valve behaviour on loss of control, as reported.
    pub async fn safety_state(&self) -> CtlResult<SafetyState> {
        let payload = self.query("RSS".to_string()).await?;
        let safety = SafetyState::decode(field_char(&payload, 2)?)?;
        self.state.lock().fallback = safety;
        Ok(safety)
    }

    /// Valve behaviour on loss of control.
    pub async fn set_safety_state(&self, safety: SafetyState) -> CtlResult<SafetyState> {
        self.query(format!("SS{}", safety.code())).await?;
        self.state.lock().fallback = safety;
        Ok(safety)
    }

    /// Slowpump condition and rate from the controller, pressure from cache.
    pub async fn slowpump(&self) -> CtlResult<Slowpump> {
        let replies = self
            .query_all(vec!["RSE".to_string(), "RSR".to_string()])
            .await?;
        let (condition, rate) = match replies.as_slice() {
            [condition, rate] => (
                SlowpumpCondition::decode(field_char(condition, 2)?)?,
                number_from(rate, 2)?,
            ),
            _ => return Err(ProtocolError::NoResponse { attempts: 1 }.into()),
        };
        let mut state = self.state.lock();
        state.slowpump.state = condition;
        state.slowpump.rate = rate;
        Ok(state.slowpump)
    }

    /// Program slowpump condition and rate. The pressure threshold is kept
    /// locally: its command shares the setpoint A value mnemonic.
    pub async fn set_slowpump(&self, slowpump: Slowpump) -> CtlResult<Slowpump> {
        slowpump.validate()?;
        self.query_all(vec![
            format!("SE{}", slowpump.state.code()),
            format!("SR{:.1}", slowpump.rate),
        ])
        .await?;
        self.state.lock().slowpump = slowpump;
        Ok(slowpump)
    }

    /// Pressure unit of the sensor readings.
    pub async fn pressure_units(&self) -> CtlResult<PressureUnits> {
        let payload = self.query("R34".to_string()).await?;
        Ok(PressureUnits::decode(field(&payload, 1, 3)?)?)
    }

    /// Direct or reverse acting control.
    pub async fn control_mode(&self) -> CtlResult<ControlMode> {
        let payload = self.query("R51".to_string()).await?;
        Ok(ControlMode::decode(field_char(&payload, 1)?)?)
    }

    /// Firmware version string.
    pub async fn version(&self) -> CtlResult<String> {
        self.query("R38".to_string()).await
    }

    /// Cached copy of one setpoint.
    pub fn cached_setpoint(&self, name: SetpointName) -> Setpoint {
        self.state.lock().setpoints[name.index()]
    }
}

/// `[name, mode, value, softstart]`
fn setpoint_reply(name: SetpointName, setpoint: &Setpoint) -> Vec<String> {
    vec![
        name.to_string(),
        setpoint.mode.to_string(),
        repr(setpoint.value),
        repr(setpoint.softstart),
    ]
}

/// Number following the `P` marker of a pressure report.
fn pressure_percent(payload: &str) -> Result<f64, ProtocolError> {
    let start = payload
        .find('P')
        .ok_or_else(|| ProtocolError::malformed("pressure marker missing", payload.as_bytes()))?;
    number_from(payload, start + 1)
}

fn tuning_value(payload: &str) -> Result<u16, ProtocolError> {
    let value = number_from(payload, 2)?;
    if (0.0..=f64::from(u16::MAX)).contains(&value) {
        Ok(value.round() as u16)
    } else {
        Err(ProtocolError::malformed("tuning value out of range", payload.as_bytes()))
    }
}

fn check_tuning(field: &str, value: i64) -> Result<u16, CtlError> {
    let (lo, hi) = TUNING_RANGE;
    if (lo..=hi).contains(&value) {
        Ok(value as u16)
    } else {
        Err(ValidationError::new(field, value, format!("range({lo}, {hi})")).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockTransport;
    use crate::channel::ChannelParams;
    use std::collections::HashMap;

    /// Controller emulation: fixed reports, every setting acknowledged.
    fn emulator() -> MockTransport {
        let reports: HashMap<&str, &str> = [
            ("R5", "P+050.00"),
            ("R6", "V+045.00"),
            ("R7", "M5015"),
            ("R33", "H 10"),
            ("R55", "L 06"),
            ("R26", "T11"),
            ("R1", "S145.5"),
            ("R15", "I1 12.0"),
            ("R46", "M1 800"),
            ("R41", "X1 30"),
            ("RSS", "SS3"),
            ("RSE", "SE1"),
            ("RSR", "SR 5.0"),
            ("R34", "F00"),
            ("R51", "V1"),
            ("R38", "T3Bi 1.2"),
        ]
        .into_iter()
        .collect();
        MockTransport::new("rs232").with_responder(move |w: &[u8]| {
            let text = String::from_utf8_lossy(w);
            let command = text.trim_start_matches('#').trim_end();
            match command {
                "O" | "C" | "H" => Vec::new(),
                c if c.starts_with('R') => match reports.get(c) {
                    Some(payload) => vec![format!("0{payload}\r").into_bytes()],
                    None => vec![format!("1{c}\r").into_bytes()],
                },
                c => vec![format!("0{c}\r").into_bytes()],
            }
        })
    }

    fn tvc(mock: &MockTransport, init: T3biInit) -> Tvc {
        let channel = Channel::new("rs232", Box::new(mock.clone()), ChannelParams::default());
        Tvc::new(Arc::new(channel), init)
    }

    fn commands(mock: &MockTransport) -> Vec<String> {
        mock.writes()
            .iter()
            .map(|w| String::from_utf8_lossy(w).trim().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_pressure_scales_by_active_sensor() {
        let tvc = tvc(&emulator(), T3biInit::default());
        assert_eq!(tvc.pressure().await.unwrap(), 500.0);

        // R7 reports sensor code 5 (HAE); switch to the low sensor by hand
        tvc.state.lock().active_channel = 'L';
        assert!((tvc.pressure().await.unwrap() - 0.5).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_pressure_position_format() {
        let tvc = tvc(&emulator(), T3biInit::default());
        assert_eq!(tvc.pressure_position().await.unwrap(), "500.00000,45.0000");
        assert_eq!(tvc.position().await.unwrap(), 45.0);
    }

    #[tokio::test]
    async fn test_set_setp_state_programs_three_commands() {
        let mock = emulator();
        let tvc = tvc(&mock, T3biInit::default());
        let setpoint = Setpoint {
            mode: SetpointMode::Pressure,
            value: 12.5,
            softstart: 50.0,
        };
        let reply = tvc.set_setp_state(SetpointName::B, setpoint).await.unwrap();
        assert_eq!(reply, vec!["B", "Pressure", "12.5", "50.0"]);
        assert_eq!(commands(&mock), vec!["#T21", "#S212.5", "#I250.0"]);
        assert_eq!(tvc.cached_setpoint(SetpointName::B), setpoint);
    }

    #[tokio::test]
    async fn test_invalid_setpoint_is_rejected_before_io() {
        let mock = emulator();
        let tvc = tvc(&mock, T3biInit::default());
        let bad = Setpoint {
            mode: SetpointMode::Position,
            value: 101.0,
            softstart: 10.0,
        };
        assert!(tvc.set_setp_state(SetpointName::A, bad).await.is_err());
        let slow = Setpoint {
            softstart: 0.05,
            ..Setpoint::default()
        };
        assert!(tvc.set_setp_state(SetpointName::A, slow).await.is_err());
        assert!(tvc.set_setp_params(SetpointName::A, 0, 20).await.is_err());
        assert!(tvc.set_setp_params(SetpointName::A, 20, 40000).await.is_err());
        assert!(mock.writes().is_empty());
        assert_eq!(tvc.cached_setpoint(SetpointName::A), Setpoint::default());
    }

    #[tokio::test]
    async fn test_get_setp_state_reads_back() {
        let tvc = tvc(&emulator(), T3biInit::default());
        let reply = tvc.get_setp_state(SetpointName::A).await.unwrap();
        assert_eq!(reply, vec!["A", "Pressure", "45.5", "12.0"]);
        let params = tvc.get_setp_params(SetpointName::A).await.unwrap();
        assert_eq!(params, vec!["A", "800", "30"]);
    }

    #[tokio::test]
    async fn test_device_error_status_surfaces() {
        let tvc = tvc(&emulator(), T3biInit::default());
        // R27 is not emulated: status 1
        let err = tvc.get_setp_state(SetpointName::B).await.unwrap_err();
        assert!(err.to_string().starts_with("Unrecognised command"));
    }

    #[tokio::test]
    async fn test_sensor_range_change_is_bracketed() {
        let mock = emulator();
        let tvc = tvc(&mock, T3biInit::default());
        tvc.program_sensor_range(Sensor::Low, SensorRange::Torr10)
            .await
            .unwrap();
        assert_eq!(commands(&mock), vec!["#CAL1234", "#EL06", "#USR"]);
        assert_eq!(tvc.sensor_ranges().await.unwrap(), (1000.0, 10.0));
    }

    #[tokio::test]
    async fn test_init_sequence_order() {
        let mock = emulator();
        let init = T3biInit {
            manual_setp: ManualValve::Open,
            setpoints: vec![SetpointInit {
                name: SetpointName::A,
                mode: SetpointMode::Position,
                value: 30.0,
                softstart: 100.0,
            }],
            actv_setpoint: ActiveSetpoint::Setpoint(SetpointName::A),
            ..T3biInit::default()
        };
        let tvc = tvc(&mock, init);

        let reply = tvc.init_state().await.unwrap();
        assert_eq!(reply, vec!["A", "Position", "30.0", "100.0"]);
        assert_eq!(
            commands(&mock),
            vec!["#O", "#R33", "#R55", "#SS1", "#T10", "#S130.0", "#I1100.0", "#D1"]
        );
    }

    #[tokio::test]
    async fn test_state_reports() {
        let tvc = tvc(&emulator(), T3biInit::default());
        let state = tvc.valve_state().await.unwrap();
        assert_eq!(state.labels(), vec!["E", "controlling", ">10% FS", "HAE"]);
        assert_eq!(tvc.safety_state().await.unwrap(), SafetyState::Safe);
        assert_eq!(tvc.pressure_units().await.unwrap(), PressureUnits::Torr);
        assert_eq!(tvc.control_mode().await.unwrap(), ControlMode::Pid);
        assert_eq!(tvc.version().await.unwrap(), "T3Bi 1.2");
        let slowpump = tvc.slowpump().await.unwrap();
        assert_eq!(slowpump.state, SlowpumpCondition::Both);
        assert_eq!(slowpump.rate, 5.0);
    }

    #[test]
    fn test_init_deserializes_from_toml() {
        let init: T3biInit = toml::from_str(
            r#"
            manual_setp = "Open"
            fallback_state = "Hold"
            actv_setpoint = "B"
            high_sensor_fs_range = "1000"
            [[setpoints]]
            name = "B"
            mode = "Pressure"
            value = 3.0
            "#,
        )
        .unwrap();
        assert_eq!(init.actv_setpoint, ActiveSetpoint::Setpoint(SetpointName::B));
        assert_eq!(init.setpoints[0].softstart, 100.0);
        assert_eq!(init.fallback_state, SafetyState::Hold);
        assert!(init.validate().is_ok());
        assert!(toml::from_str::<T3biInit>("actv_setpoint = \"Z\"").is_err());
    }
}
