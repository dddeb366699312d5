//! Status-coded ASCII protocol of the throttle valve controller.
//!
//! Requests are `#<mnemonic><args>\n`. With the `#` modifier the controller
//! answers with a status digit followed by the payload and a CR. Status `0`
//! means success; `1`..`4` are error categories.
//!
//! The controller's numeric codes are modelled as enums with a `code()` /
//! `from_code()` pair and a human-readable label used on the client side.

use crate::adapters::Transport;
use crate::error::{to_hex, CtlResult, ProtocolError, ValidationError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Modifier asking the controller to echo status and command.
pub const CMD_PREFIX: char = '#';
/// Largest reply the controller sends.
pub const REPLY_WINDOW: usize = 50;

/// Declares a closed code table: device code <-> variant <-> client label.
macro_rules! code_table {
    (
        $(#[$meta:meta])*
        $name:ident ($field:literal) {
            $($variant:ident = $code:literal => $label:literal,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $(
                #[doc = concat!("Code `", $code, "`, label `", $label, "`")]
                $variant,
            )+
        }

        impl $name {
            /// Every variant, in table order
            pub const ALL: &'static [$name] = &[$($name::$variant,)+];

            /// Code on the wire
            pub fn code(self) -> &'static str {
                match self {
                    $($name::$variant => $code,)+
                }
            }

            /// Variant for a wire code.
            pub fn from_code(code: &str) -> Option<Self> {
                match code {
                    $($code => Some($name::$variant),)+
                    _ => None,
                }
            }

            /// Name used by clients
            pub fn label(self) -> &'static str {
                match self {
                    $($name::$variant => $label,)+
                }
            }

            /// Every client label, in table order.
            pub fn labels() -> Vec<&'static str> {
                Self::ALL.iter().map(|v| v.label()).collect()
            }

            /// Decode a reply field, treating unknown codes as a malformed reply.
            pub fn decode(code: &str) -> Result<Self, ProtocolError> {
                Self::from_code(code).ok_or_else(|| {
                    ProtocolError::malformed(concat!("unknown ", $field, " code"), code.as_bytes())
                })
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.label())
            }
        }

        impl FromStr for $name {
            type Err = ValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::ALL
                    .iter()
                    .copied()
                    .find(|v| v.label() == s)
                    .ok_or_else(|| ValidationError::one_of($field, s, &Self::labels()))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.label())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let label = String::deserialize(deserializer)?;
                label.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

code_table! {
    /// Reply status digit
    Status ("status") {
        Ok = "0" => "No error",
        Unrecognised = "1" => "Unrecognised command",
        BadData = "2" => "Bad data value",
        Ignored = "3" => "Command ignored",
        Reserved = "4" => "Reserved for future use",
    }
}

code_table! {
    /// Programmable setpoint
    SetpointName ("setpoint") {
        A = "1" => "A",
        B = "2" => "B",
        C = "3" => "C",
        D = "4" => "D",
        E = "5" => "E",
    }
}

impl SetpointName {
    /// Report number of the setpoint's control mode
    pub fn mode_report(self) -> &'static str {
        match self {
            SetpointName::A => "26",
            SetpointName::B => "27",
            SetpointName::C => "28",
            SetpointName::D => "29",
            SetpointName::E => "30",
        }
    }

    /// Report number of the setpoint's value
    pub fn value_report(self) -> &'static str {
        match self {
            SetpointName::A => "1",
            SetpointName::B => "2",
            SetpointName::C => "3",
            SetpointName::D => "4",
            SetpointName::E => "10",
        }
    }

    /// Report number of the softstart rate.
    pub fn softstart_report(self) -> &'static str {
        match self {
            SetpointName::A => "15",
            SetpointName::B => "16",
            SetpointName::C => "17",
            SetpointName::D => "18",
            SetpointName::E => "19",
        }
    }

    /// Report number of the phase.
    pub fn phase_report(self) -> &'static str {
        match self {
            SetpointName::A => "41",
            SetpointName::B => "42",
            SetpointName::C => "43",
            SetpointName::D => "44",
            SetpointName::E => "45",
        }
    }

    /// Report number of the gain.
    pub fn gain_report(self) -> &'static str {
        match self {
            SetpointName::A => "46",
            SetpointName::B => "47",
            SetpointName::C => "48",
            SetpointName::D => "49",
            SetpointName::E => "50",
        }
    }

    /// Position in per-setpoint arrays
    pub fn index(self) -> usize {
        match self {
            SetpointName::A => 0,
            SetpointName::B => 1,
            SetpointName::C => 2,
            SetpointName::D => 3,
            SetpointName::E => 4,
        }
    }
}

code_table! {
    SetpointMode ("setpoint mode") {
        Position = "0" => "Position",
        Pressure = "1" => "Pressure",
    }
}

code_table! {
    /// What the controller is currently following
    ControlResponse ("control state") {
        Analog = "0" => "analog",
        A = "1" => "A",
        B = "2" => "B",
        C = "3" => "C",
        D = "4" => "D",
        E = "5" => "E",
        Open = "6" => "open",
        Close = "7" => "close",
        Stop = "8" => "stop",
        Learning = "9" => "learning",
    }
}

code_table! {
    ValveStatus ("valve status") {
        Controlling = "0" => "controlling",
        Open = "2" => "open",
        Close = "4" => "close",
    }
}

code_table! {
    PressureStatus ("pressure status") {
        Low = "0" => "<=10% FS",
        High = "1" => ">10% FS",
    }
}

code_table! {
    /// Sensor in use: (L)ow/(H)igh, crossover mode, (D)isabled/(E)nabled
    ActiveSensor ("active sensor") {
        Lad = "0" => "LAD",
        Had = "1" => "HAD",
        Hhd = "3" => "HHD",
        Lae = "4" => "LAE",
        Hae = "5" => "HAE",
        Hhe = "7" => "HHE",
        Lld = "8" => "LLD",
        Lle = ":" => "LLE",
    }
}

impl ActiveSensor {
    /// `'H'` or `'L'`
    pub fn channel(self) -> char {
        match self.label().chars().next() {
            Some('H') => 'H',
            _ => 'L',
        }
    }
}

code_table! {
    /// Valve state on loss of control
    SafetyState ("safety state") {
        Open = "0" => "Open",
        Close = "1" => "Close",
        Hold = "2" => "Hold",
        Safe = "3" => "Safe",
        Cycle = "4" => "Cycle",
    }
}

code_table! {
    /// Full scale of a pressure sensor
    SensorRange ("sensor range") {
        Torr1 = "03" => "1",
        Torr10 = "06" => "10",
        Torr100 = "08" => "100",
        Torr1000 = "10" => "1000",
    }
}

impl SensorRange {
    /// Full scale in torr.
    pub fn torr(self) -> f64 {
        match self {
            SensorRange::Torr1 => 1.0,
            SensorRange::Torr10 => 10.0,
            SensorRange::Torr100 => 100.0,
            SensorRange::Torr1000 => 1000.0,
        }
    }
}

code_table! {
    SlowpumpCondition ("slowpump condition") {
        Disable = "0" => "disable",
        Both = "1" => "both",
        Dec = "2" => "dec",
        Inc = "3" => "inc",
    }
}

code_table! {
    PressureUnits ("pressure units") {
        Torr = "00" => "Torr",
        MilliTorr = "01" => "mTorr",
        MilliBar = "02" => "mBar",
        MicroBar = "03" => "uBar",
        KiloPascal = "04" => "kPa",
        Pascal = "05" => "Pa",
        CmWater = "06" => "cm H2O",
        InWater = "07" => "in H2O",
    }
}

code_table! {
    ControlMode ("control mode") {
        Pid = "1" => "PID",
        Model = "0" => "Model",
    }
}

/// Frame a command.
pub fn encode_command(command: &str) -> Vec<u8> {
    format!("{CMD_PREFIX}{command}\n").into_bytes()
}

/// Check the status digit of a reply and return the payload after it.
pub fn parse_reply(raw: &[u8]) -> Result<String, ProtocolError> {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim_end_matches(['\r', '\n']);
    let mut chars = text.chars();
    let status = match chars.next() {
        Some(c) => c,
        None => return Err(ProtocolError::NoResponse { attempts: 1 }),
    };
    match Status::from_code(status.encode_utf8(&mut [0u8; 4])) {
        Some(Status::Ok) => Ok(chars.as_str().to_string()),
        Some(status) => Err(ProtocolError::DeviceStatus {
            category: status.label().to_string(),
            payload: text.to_string(),
        }),
        None => Err(ProtocolError::malformed("unknown status digit", raw)),
    }
}

/// Send a command that produces no reply (valve open/close/hold).
pub async fn send(port: &mut dyn Transport, command: &str) -> CtlResult<()> {
    debug!(command, "T3Bi send");
    port.write(&encode_command(command)).await
}

/// Send a command and return the payload of its reply.
pub async fn query(port: &mut dyn Transport, command: &str) -> CtlResult<String> {
    port.write(&encode_command(command)).await?;
    let mut raw = Vec::new();
    while raw.len() < REPLY_WINDOW {
        let chunk = port.read(REPLY_WINDOW - raw.len()).await?;
        if chunk.is_empty() {
            break;
        }
        raw.extend_from_slice(&chunk);
        if raw.ends_with(b"\r") || raw.ends_with(b"\n") {
            break;
        }
    }
    debug!(command, reply = %to_hex(&raw), "T3Bi query");
    Ok(parse_reply(&raw)?)
}

/// Character `index` of a reply payload.
pub fn field_char(payload: &str, index: usize) -> Result<&str, ProtocolError> {
    field(payload, index, index + 1)
}

/// Bytes `start..end` of a reply payload.
pub fn field(payload: &str, start: usize, end: usize) -> Result<&str, ProtocolError> {
    payload
        .get(start..end)
        .ok_or_else(|| ProtocolError::malformed("reply too short", payload.as_bytes()))
}

/// Payload from `start` on, parsed as a number.
pub fn number_from(payload: &str, start: usize) -> Result<f64, ProtocolError> {
    let text = payload
        .get(start..)
        .ok_or_else(|| ProtocolError::malformed("reply too short", payload.as_bytes()))?;
    text.trim()
        .parse()
        .map_err(|_| ProtocolError::malformed("expected a number", payload.as_bytes()))
}
