//! Named devices and their command tables.
//!
//! A [`Device`] binds a client-facing name to one driver instance. The driver
//! family is a closed enum selected once when the registry is built; commands
//! arrive as strings and are resolved against the family's operation table.
//!
//! Every operation returns the reply as a list of strings, the shape clients
//! receive in the `value` field of a response.

use crate::capabilities::FlowControl;
use crate::channel::Channel;
use crate::config::{DeviceConfig, DriverConfig, LabJackConfig};
use crate::drivers::t3bi::{Sensor, Setpoint, Slowpump};
use crate::drivers::{AnalogMfc, BrooksMfc, IoMode, SierraMfc, Switch, SwitchState, TickDacMfc, Tvc};
use crate::error::{CtlError, CtlResult, ValidationError};
use crate::protocol::repr;
use crate::protocol::status_ascii::{
    SafetyState, SensorRange, SetpointMode, SetpointName, SlowpumpCondition,
};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, field, instrument, Span};

/// Operations every flow controller answers, followed by `extra`.
macro_rules! flow_operations {
    ($($extra:literal),* $(,)?) => {
        &[
            "init_state",
            "get_flow",
            "set_flow",
            "get_curr_setp",
            "get_fs_range",
            $($extra,)*
        ]
    };
}

const FLOW_OPERATIONS: &[&str] = flow_operations!();

const BROOKS_OPERATIONS: &[&str] = flow_operations!(
    "set_ramptime",
    "get_filtered_setp",
    "get_valve_current",
    "get_gas_id",
    "get_io_mode",
    "set_io_mode",
    "set_cbr",
    "get_info",
);

const SIERRA_OPERATIONS: &[&str] = flow_operations!("get_gas_name", "get_units", "get_info");

const SWITCH_OPERATIONS: &[&str] = &["init_state", "get_state", "set_state", "set_def_state"];

const VALVE_OPERATIONS: &[&str] = &[
    "init_state",
    "get_pressure",
    "get_position",
    "get_pressure_position",
    "valve_open",
    "valve_close",
    "valve_hold",
    "get_valve_state",
    "get_active_setp",
    "get_setp_state",
    "set_setp_state",
    "get_setp_params",
    "set_setp_params",
    "activate_setp",
    "get_sensor_ranges",
    "set_sensor_range",
    "get_safety_state",
    "set_safety_state",
    "get_slowpump",
    "set_slowpump",
    "get_pressure_units",
    "get_control_mode",
    "get_version",
];

/// Driver behind a device.
pub enum DeviceDriver {
    /// L-protocol MFC on RS-485
    Brooks(BrooksMfc),
    /// Throttle valve controller
    T3bi(Tvc),
    /// LRC-framed MFC on RS-232
    Sierra(SierraMfc),
    /// MFC on the LabJack's own AIN and DAC
    AnalogMfc(AnalogMfc),
    /// MFC driven through an LJTick-DAC
    TickDacMfc(TickDacMfc),
    /// Pneumatic valve on a digital line
    Switch(Switch),
}

impl DeviceDriver {
    /// Short name of the driver family, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            DeviceDriver::Brooks(_) => "brooks",
            DeviceDriver::T3bi(_) => "t3bi",
            DeviceDriver::Sierra(_) => "sierra",
            DeviceDriver::AnalogMfc(_) => "analog_mfc",
            DeviceDriver::TickDacMfc(_) => "tick_dac_mfc",
            DeviceDriver::Switch(_) => "switch",
        }
    }
}

/// One named instrument.
pub struct Device {
    name: String,
    channel_id: String,
    driver: DeviceDriver,
}

impl Device {
    /// Bind `driver` on `channel` to `name`.
    pub fn new(name: impl Into<String>, channel: &Channel, driver: DeviceDriver) -> Self {
        Self {
            name: name.into(),
            channel_id: channel.id().to_string(),
            driver,
        }
    }

    /// Build the driver named in `config` on top of `channel`.
    pub fn from_config(
        config: &DeviceConfig,
        channel: Arc<Channel>,
        labjack: Option<&LabJackConfig>,
    ) -> Self {
        let driver = build_driver(&config.driver, Arc::clone(&channel), labjack);
        Self::new(config.name.clone(), &channel, driver)
    }

    /// Name clients address the device by.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Id of the channel the device sits on.
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Driver behind the device.
    pub fn driver(&self) -> &DeviceDriver {
        &self.driver
    }

    /// Commands this device accepts.
    pub fn operations(&self) -> &'static [&'static str] {
        match &self.driver {
            DeviceDriver::Brooks(_) => BROOKS_OPERATIONS,
            DeviceDriver::Sierra(_) => SIERRA_OPERATIONS,
            DeviceDriver::AnalogMfc(_) | DeviceDriver::TickDacMfc(_) => FLOW_OPERATIONS,
            DeviceDriver::Switch(_) => SWITCH_OPERATIONS,
            DeviceDriver::T3bi(_) => VALVE_OPERATIONS,
        }
    }

    /// True if `cmd` is in the device's operation table.
    pub fn supports(&self, cmd: &str) -> bool {
        self.operations().contains(&cmd)
    }

    /// Run one command.
    ///
    /// Commands that go through the L-protocol's monitored retry record the
    /// attempts they took as the span's `attempts` field.
    #[instrument(skip_all, fields(device = %self.name, cmd = %cmd, attempts = field::Empty))]
    pub async fn call(&self, cmd: &str, args: &[String]) -> CtlResult<Vec<String>> {
        if !self.supports(cmd) {
            return Err(CtlError::unknown_command(&self.name, cmd));
        }
        let reply = match &self.driver {
            DeviceDriver::Brooks(mfc) => match cmd {
                "set_flow" => {
                    let flow = number_arg(args, 0, "flow")?;
                    let exchange = mfc.write_setpoint(flow).await?;
                    Span::current().record("attempts", exchange.attempts);
                    vec![repr(flow)]
                }
                "set_ramptime" => {
                    let ms = number_arg(args, 0, "ramp time")?;
                    vec![mfc.set_ramptime(ms)?.to_string()]
                }
                "get_filtered_setp" => vec![flow_value(mfc.filtered_setpoint().await?)],
                "get_valve_current" => vec![format!("{:.3}", mfc.valve_current().await?)],
                "get_gas_id" => vec![mfc.gas_id().await?.to_string()],
                "get_io_mode" => vec![mfc.io_mode().await?.to_string()],
                "set_io_mode" => {
                    let mode: IoMode = parse_arg(args, 0, "io mode")?;
                    let exchange = mfc.set_io_mode(mode).await?;
                    Span::current().record("attempts", exchange.attempts);
                    vec![mode.to_string()]
                }
                "set_cbr" => {
                    let baud_rate = integer_arg(args, 0, "baud rate")?;
                    let baud_rate = u32::try_from(baud_rate).map_err(|_| {
                        ValidationError::range("baud rate", baud_rate, 0.0, f64::from(u32::MAX))
                    })?;
                    let exchange = mfc.set_cbr(baud_rate).await?;
                    Span::current().record("attempts", exchange.attempts);
                    vec![baud_rate.to_string()]
                }
                "get_info" => mfc.info().await?,
                _ => flow_call(mfc, &self.name, cmd, args).await?,
            },
            DeviceDriver::Sierra(mfc) => match cmd {
                "get_gas_name" => vec![mfc.gas_name().await?],
                "get_units" => vec![mfc.units().await?],
                "get_info" => mfc.info().await?,
                _ => flow_call(mfc, &self.name, cmd, args).await?,
            },
            DeviceDriver::AnalogMfc(mfc) => flow_call(mfc, &self.name, cmd, args).await?,
            DeviceDriver::TickDacMfc(mfc) => flow_call(mfc, &self.name, cmd, args).await?,
            DeviceDriver::Switch(switch) => switch_call(switch, &self.name, cmd, args).await?,
            DeviceDriver::T3bi(tvc) => valve_call(tvc, &self.name, cmd, args).await?,
        };
        debug!(?reply, "Command completed");
        Ok(reply)
    }
}

fn build_driver(
    config: &DriverConfig,
    channel: Arc<Channel>,
    labjack: Option<&LabJackConfig>,
) -> DeviceDriver {
    let model = labjack.map(|lj| lj.model).unwrap_or_default();
    let calibration = labjack.and_then(|lj| lj.calibration.as_ref());
    match config {
        DriverConfig::Brooks {
            mac_id,
            fs_range,
            init_val,
        } => DeviceDriver::Brooks(BrooksMfc::new(channel, *mac_id, *fs_range, *init_val)),
        DriverConfig::T3bi { init } => DeviceDriver::T3bi(Tvc::new(channel, init.clone())),
        DriverConfig::Sierra { fs_range, init_val } => {
            DeviceDriver::Sierra(SierraMfc::new(channel, *fs_range, *init_val))
        }
        DriverConfig::AnalogMfc {
            ain,
            dac,
            fs_range,
            init_val,
            max_volt,
        } => DeviceDriver::AnalogMfc(AnalogMfc::new(
            channel,
            *ain,
            *dac,
            *fs_range,
            *init_val,
            *max_volt,
            model,
            calibration,
        )),
        DriverConfig::TickDacMfc {
            ain,
            scl_pin,
            output,
            fs_range,
            init_val,
            max_volt,
        } => DeviceDriver::TickDacMfc(TickDacMfc::new(
            channel,
            *ain,
            *scl_pin,
            *output,
            *fs_range,
            *init_val,
            *max_volt,
            model,
            calibration,
        )),
        DriverConfig::Switch {
            line,
            default,
            init_val,
        } => DeviceDriver::Switch(Switch::new(channel, *line, *default, *init_val)),
    }
}

/// Measured flows are reported with three decimals.
fn flow_value(flow: f64) -> String {
    format!("{flow:.3}")
}

async fn flow_call(
    mfc: &dyn FlowControl,
    device: &str,
    cmd: &str,
    args: &[String],
) -> CtlResult<Vec<String>> {
    Ok(match cmd {
        "init_state" => vec![flow_value(mfc.init_state().await?)],
        "get_flow" => vec![flow_value(mfc.get_flow().await?)],
        "set_flow" => {
            let flow = number_arg(args, 0, "flow")?;
            vec![mfc.set_flow(flow).await?]
        }
        "get_curr_setp" => vec![repr(mfc.curr_setp())],
        "get_fs_range" => vec![repr(mfc.fs_range().await?)],
        _ => return Err(CtlError::unknown_command(device, cmd)),
    })
}

async fn switch_call(
    switch: &Switch,
    device: &str,
    cmd: &str,
    args: &[String],
) -> CtlResult<Vec<String>> {
    let state = match cmd {
        "init_state" => switch.init_state().await?,
        "get_state" => switch.get_state().await?,
        "set_state" => {
            let state: SwitchState = parse_arg(args, 0, "requested state")?;
            switch.set_state(state).await?
        }
        "set_def_state" => switch.set_def_state().await?,
        _ => return Err(CtlError::unknown_command(device, cmd)),
    };
    Ok(vec![state.to_string()])
}

async fn valve_call(tvc: &Tvc, device: &str, cmd: &str, args: &[String]) -> CtlResult<Vec<String>> {
    Ok(match cmd {
        "init_state" => tvc.init_state().await?,
        "get_pressure" => vec![repr(tvc.pressure().await?)],
        "get_position" => vec![repr(tvc.position().await?)],
        "get_pressure_position" => vec![tvc.pressure_position().await?],
        "valve_open" => tvc.valve_open().await?,
        "valve_close" => tvc.valve_close().await?,
        "valve_hold" => tvc.valve_hold().await?,
        "get_valve_state" => tvc.valve_state().await?.labels(),
        "get_active_setp" => vec![tvc.valve_state().await?.control.to_string()],
        "get_setp_state" => {
            let name: SetpointName = parse_arg(args, 0, "setpoint")?;
            tvc.get_setp_state(name).await?
        }
        "set_setp_state" => {
            let name: SetpointName = parse_arg(args, 0, "setpoint")?;
            let mode: SetpointMode = parse_arg(args, 1, "setpoint mode")?;
            let setpoint = Setpoint {
                mode,
                value: number_arg(args, 2, "setpoint value")?,
                softstart: number_arg(args, 3, "softstart rate")?,
            };
            tvc.set_setp_state(name, setpoint).await?
        }
        "get_setp_params" => {
            let name: SetpointName = parse_arg(args, 0, "setpoint")?;
            tvc.get_setp_params(name).await?
        }
        "set_setp_params" => {
            let name: SetpointName = parse_arg(args, 0, "setpoint")?;
            let gain = integer_arg(args, 1, "gain")?;
            let phase = integer_arg(args, 2, "phase")?;
            tvc.set_setp_params(name, gain, phase).await?
        }
        "activate_setp" => {
            let name: SetpointName = parse_arg(args, 0, "setpoint")?;
            tvc.activate_setp(name).await?
        }
        "get_sensor_ranges" => {
            let (high, low) = tvc.sensor_ranges().await?;
            vec![repr(high), repr(low)]
        }
        "set_sensor_range" => {
            let sensor = match arg(args, 0, "sensor")? {
                "high" => Sensor::High,
                "low" => Sensor::Low,
                other => return Err(ValidationError::one_of("sensor", other, &["high", "low"]).into()),
            };
            let range: SensorRange = parse_arg(args, 1, "sensor range")?;
            tvc.program_sensor_range(sensor, range).await?;
            vec![arg(args, 0, "sensor")?.to_string(), range.to_string()]
        }
        "get_safety_state" => vec![tvc.safety_state().await?.to_string()],
        "set_safety_state" => {
            let safety: SafetyState = parse_arg(args, 0, "safety state")?;
            vec![tvc.set_safety_state(safety).await?.to_string()]
        }
        "get_slowpump" => slowpump_reply(&tvc.slowpump().await?),
        "set_slowpump" => {
            let slowpump = Slowpump {
                state: parse_arg::<SlowpumpCondition>(args, 0, "slowpump condition")?,
                rate: number_arg(args, 1, "slowpump rate")?,
                pressure: number_arg(args, 2, "slowpump pressure")?,
            };
            slowpump_reply(&tvc.set_slowpump(slowpump).await?)
        }
        "get_pressure_units" => vec![tvc.pressure_units().await?.to_string()],
        "get_control_mode" => vec![tvc.control_mode().await?.to_string()],
        "get_version" => vec![tvc.version().await?],
        _ => return Err(CtlError::unknown_command(device, cmd)),
    })
}

fn slowpump_reply(slowpump: &Slowpump) -> Vec<String> {
    vec![
        slowpump.state.to_string(),
        repr(slowpump.rate),
        repr(slowpump.pressure),
    ]
}

fn arg<'a>(args: &'a [String], index: usize, field: &str) -> Result<&'a str, ValidationError> {
    args.get(index)
        .map(|a| a.trim())
        .ok_or_else(|| ValidationError::new(field, "<missing>", format!("argument {}", index + 1)))
}

fn parse_arg<T>(args: &[String], index: usize, field: &str) -> Result<T, ValidationError>
where
    T: FromStr<Err = ValidationError>,
{
    arg(args, index, field)?.parse()
}

fn number_arg(args: &[String], index: usize, field: &str) -> Result<f64, ValidationError> {
    let raw = arg(args, index, field)?;
    raw.parse()
        .map_err(|_| ValidationError::new(field, raw, "a number"))
}

fn integer_arg(args: &[String], index: usize, field: &str) -> Result<i64, ValidationError> {
    let raw = arg(args, index, field)?;
    raw.parse()
        .map_err(|_| ValidationError::new(field, raw, "an integer"))
}
