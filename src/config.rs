//! Server configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (channels, devices and server settings)
//! 2. environment variables prefixed with `LABCTL_`, nested with `__`
//!    (e.g. `LABCTL_SERVER__PORT=10000`)
//!
//! # Example
//! ```no_run
//! use labctl::config::ServerConfig;
//!
//! let config = ServerConfig::load_from("config/labctl.toml")?;
//! config.validate()?;
//! println!("listening on {}:{}", config.server.bind, config.server.port);
//! # Ok::<(), labctl::error::CtlError>(())
//! ```

use crate::drivers::labjack_io::SwitchState;
use crate::drivers::t3bi::T3biInit;
use crate::error::{CtlError, CtlResult};
use crate::logging::OutputFormat;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name reserved for the in-process log controller.
pub const CONTROLLER_DEVICE: &str = "controller";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listener and logging settings
    #[serde(default)]
    pub server: ServerSection,
    /// Physical buses
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    /// Logical instruments, initialised in this order
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// Listener and logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// Listen address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory for request/response log files
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Log file used when no experiment log is active
    #[serde(default = "default_log_file")]
    pub default_log_file: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Console log format
    #[serde(default = "default_log_format")]
    pub log_format: OutputFormat,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            log_dir: default_log_dir(),
            default_log_file: default_log_file(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// One physical bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Unique channel id (e.g. "rs485")
    pub id: String,
    /// Bus transport
    pub transport: TransportConfig,
    /// Attempts granted to exchanges that monitor their retries
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
    /// Upper bound for exchanges that would otherwise retry until success
    #[serde(default = "default_unmonitored_attempts")]
    pub max_unmonitored_attempts: u32,
    /// Baud rate the L-protocol devices power up at, if different from the
    /// channel's working rate
    #[serde(default)]
    pub bootstrap_baud: Option<u32>,
    /// Settings for LabJack buses
    #[serde(default)]
    pub labjack: Option<LabJackConfig>,
}

impl ChannelConfig {
    /// Per-read timeout of the transport
    pub fn read_timeout(&self) -> Duration {
        match &self.transport {
            TransportConfig::Serial { timeout_ms, .. } | TransportConfig::Tcp { timeout_ms, .. } => {
                Duration::from_millis(*timeout_ms)
            }
            TransportConfig::Mock => Duration::from_millis(default_timeout_ms()),
        }
    }

    /// Working baud rate, if the link has one
    pub fn baud_rate(&self) -> Option<u32> {
        match &self.transport {
            TransportConfig::Serial { baud_rate, .. } => Some(*baud_rate),
            _ => None,
        }
    }
}

/// How to reach the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Local serial port
    Serial {
        /// Device path, e.g. `/dev/ttyUSB0`
        path: String,
        /// Line speed
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        /// Parity bit
        #[serde(default)]
        parity: Parity,
        /// Read timeout
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
    /// Serial device server or other raw TCP bridge
    Tcp {
        /// `host:port` of the bridge
        address: String,
        /// Read timeout
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
    /// Scripted in-memory transport (tests, dry runs)
    Mock,
}

/// Serial parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

/// LabJack model on a bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabJackModel {
    /// U3-HV / U3-LV
    U3,
    /// U6 / U6-Pro
    #[default]
    U6,
}

/// LabJack bus settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabJackConfig {
    /// Board model, selects the calibration memory layout
    #[serde(default)]
    pub model: LabJackModel,
    /// Replaces the constants stored on the board. Normally absent, in which
    /// case they are read from the board's calibration memory.
    #[serde(default)]
    pub calibration: Option<AnalogCalibration>,
}

/// Linear conversion constants for the built-in analog IO.
///
/// Defaults are the U6 nominal values for the +/-10 V input range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnalogCalibration {
    /// Volts per AIN count
    pub ain_slope: f64,
    /// AIN reading at zero counts
    pub ain_offset: f64,
    /// DAC0 codes per volt
    pub dac0_slope: f64,
    /// DAC0 code at 0 V
    pub dac0_offset: f64,
    /// DAC1 codes per volt
    pub dac1_slope: f64,
    /// DAC1 code at 0 V
    pub dac1_offset: f64,
}

impl Default for AnalogCalibration {
    fn default() -> Self {
        Self {
            ain_slope: 3.158_057_8e-4,
            ain_offset: -10.586_956_522,
            dac0_slope: 13200.0,
            dac0_offset: 0.0,
            dac1_slope: 13200.0,
            dac1_offset: 0.0,
        }
    }
}

/// One logical instrument
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Name clients address the device by
    pub name: String,
    /// Channel id the device is attached to
    pub channel: String,
    /// Driver and its parameters
    #[serde(flatten)]
    pub driver: DriverConfig,
}

/// Which protocol driver backs a device, with its address and init parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "driver", rename_all = "snake_case")]
pub enum DriverConfig {
    /// Brooks mass-flow controller, binary L-protocol on RS-485
    Brooks {
        /// Bus address
        mac_id: u8,
        /// Full scale in sccm
        fs_range: f64,
        /// Setpoint written at init
        #[serde(default)]
        init_val: f64,
    },
    /// MKS T3Bi throttle valve controller, status-coded ASCII
    T3bi {
        /// Startup configuration
        #[serde(default)]
        init: T3biInit,
    },
    /// Sierra mass-flow controller, LRC-checksummed ASCII
    Sierra {
        /// Full scale in sccm
        fs_range: f64,
        /// Setpoint written at init
        #[serde(default)]
        init_val: f64,
    },
    /// Analog MFC on a LabJack AIN / built-in DAC pair
    AnalogMfc {
        /// Analog input carrying the flow signal
        ain: u8,
        /// Built-in DAC, 0 or 1
        dac: u8,
        /// Full scale in sccm
        fs_range: f64,
        /// Setpoint written at init
        #[serde(default)]
        init_val: f64,
        /// Voltage at full scale
        #[serde(default = "default_max_volt")]
        max_volt: f64,
    },
    /// Analog MFC driven through an LJTick-DAC
    TickDacMfc {
        /// Analog input carrying the flow signal
        ain: u8,
        /// Digital line wired to SCL; SDA is the next line
        scl_pin: u8,
        /// Accessory output
        output: DacOutput,
        /// Full scale in sccm
        fs_range: f64,
        /// Setpoint written at init
        #[serde(default)]
        init_val: f64,
        /// Voltage at full scale
        #[serde(default = "default_max_volt")]
        max_volt: f64,
    },
    /// Pneumatic switch on a LabJack digital line
    Switch {
        /// Digital line
        line: u8,
        /// State of a low line
        #[serde(default)]
        default: SwitchState,
        /// State driven at init; the default state when absent
        #[serde(default)]
        init_val: Option<SwitchState>,
    },
}

impl DriverConfig {
    /// Full scale of flow controllers
    pub fn fs_range(&self) -> Option<f64> {
        match self {
            DriverConfig::Brooks { fs_range, .. }
            | DriverConfig::Sierra { fs_range, .. }
            | DriverConfig::AnalogMfc { fs_range, .. }
            | DriverConfig::TickDacMfc { fs_range, .. } => Some(*fs_range),
            DriverConfig::T3bi { .. } | DriverConfig::Switch { .. } => None,
        }
    }

    fn init_flow(&self) -> Option<f64> {
        match self {
            DriverConfig::Brooks { init_val, .. }
            | DriverConfig::Sierra { init_val, .. }
            | DriverConfig::AnalogMfc { init_val, .. }
            | DriverConfig::TickDacMfc { init_val, .. } => Some(*init_val),
            DriverConfig::T3bi { .. } | DriverConfig::Switch { .. } => None,
        }
    }
}

/// LJTick-DAC output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DacOutput {
    /// DACA
    A,
    /// DACB
    B,
}

// Default value functions
fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9999
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("log")
}

fn default_log_file() -> String {
    "log_controlserver.txt".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> OutputFormat {
    OutputFormat::Compact
}

fn default_retry_budget() -> u32 {
    100
}

fn default_unmonitored_attempts() -> u32 {
    1000
}

fn default_baud_rate() -> u32 {
    115200
}

fn default_timeout_ms() -> u64 {
    50
}

fn default_max_volt() -> f64 {
    5.0
}

impl ServerConfig {
    /// Load configuration from a TOML file and `LABCTL_` environment variables
    pub fn load_from<P: AsRef<Path>>(path: P) -> CtlResult<Self> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("LABCTL_").split("__"))
            .extract()
            .map_err(CtlError::from)
    }

    /// Parse configuration from a TOML string (no environment overlay)
    pub fn from_toml_str(toml: &str) -> CtlResult<Self> {
        Figment::new()
            .merge(Toml::string(toml))
            .extract()
            .map_err(CtlError::from)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> CtlResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.server.log_level.as_str()) {
            return Err(CtlError::Config(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.server.log_level,
                valid_levels.join(", ")
            )));
        }

        let mut channel_ids = HashSet::new();
        for channel in &self.channels {
            if !channel_ids.insert(channel.id.as_str()) {
                return Err(CtlError::Config(format!(
                    "Duplicate channel id: {}",
                    channel.id
                )));
            }
            if channel.retry_budget == 0 || channel.max_unmonitored_attempts == 0 {
                return Err(CtlError::Config(format!(
                    "Channel '{}' needs a retry budget of at least one attempt",
                    channel.id
                )));
            }
        }

        let mut names = HashSet::new();
        for device in &self.devices {
            if device.name == CONTROLLER_DEVICE {
                return Err(CtlError::Config(format!(
                    "Device name '{CONTROLLER_DEVICE}' is reserved"
                )));
            }
            if !names.insert(device.name.as_str()) {
                return Err(CtlError::Config(format!(
                    "Duplicate device name: {}",
                    device.name
                )));
            }
            if !channel_ids.contains(device.channel.as_str()) {
                return Err(CtlError::Config(format!(
                    "Device '{}' refers to unknown channel '{}'",
                    device.name, device.channel
                )));
            }
            if let Some(fs) = device.driver.fs_range() {
                if fs.is_nan() || fs <= 0.0 {
                    return Err(CtlError::Config(format!(
                        "Device '{}' has non-positive fs_range {fs}",
                        device.name
                    )));
                }
                if let Some(init) = device.driver.init_flow() {
                    if !(0.0..=fs).contains(&init) {
                        return Err(CtlError::Config(format!(
                            "Device '{}' init_val {init} is outside range(0, {fs})",
                            device.name
                        )));
                    }
                }
            }
            if let DriverConfig::T3bi { init } = &device.driver {
                init.validate()
                    .map_err(|e| CtlError::Config(format!("Device '{}': {e}", device.name)))?;
            }
        }

        Ok(())
    }

    /// Channel settings by id
    pub fn channel(&self, id: &str) -> Option<&ChannelConfig> {
        self.channels.iter().find(|c| c.id == id)
    }
}
