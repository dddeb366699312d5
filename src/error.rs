//! Error types for the control server.
//!
//! `CtlError` is the single error type returned by channels, protocol drivers,
//! devices and the dispatcher. It is split along the lines the server acts on:
//!
//! - **`Transport`**: the bus handle is invalid or closed. A [`Channel`] reopens
//!   the transport once and retries the operation when it sees this variant.
//! - **`Protocol`**: the device answered, but the answer was unusable (checksum
//!   mismatch, NAK, error status, short or malformed reply). Drivers retry these
//!   within their own budget before surfacing them.
//! - **`Validation`**: an argument was rejected locally. No bus I/O has happened.
//! - **`UnknownTarget`**: the device or command name is not in the registry.
//!
//! None of these are fatal to the server; the dispatcher turns every one of them
//! into a per-entry `Error` status.
//!
//! [`Channel`]: crate::channel::Channel

use std::fmt;
use thiserror::Error;

/// Convenience alias for results using the control server error type.
pub type CtlResult<T> = std::result::Result<T, CtlError>;

/// Every failure a channel, driver or dispatcher can report.
#[derive(Error, Debug)]
pub enum CtlError {
    /// Bus handle invalid or closed
    #[error("Transport fault on channel '{channel}': {message}")]
    Transport {
        /// Channel id
        channel: String,
        /// What the transport reported
        message: String,
    },

    /// Unusable answer from the device
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Argument rejected locally
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Name not in the registry
    #[error("Unknown {kind}: {name}")]
    UnknownTarget {
        /// Device or command
        kind: TargetKind,
        /// The name as requested
        name: String,
    },

    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Listener or log file I/O
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A serial channel was configured in a build without serial support
    #[error("Serial support not enabled. Rebuild with --features tokio_serial")]
    SerialFeatureDisabled,
}

impl CtlError {
    /// Build a transport fault for the named channel.
    pub fn transport(channel: impl Into<String>, message: impl fmt::Display) -> Self {
        CtlError::Transport {
            channel: channel.into(),
            message: message.to_string(),
        }
    }

    /// Unknown device name.
    pub fn unknown_device(name: impl Into<String>) -> Self {
        CtlError::UnknownTarget {
            kind: TargetKind::Device,
            name: name.into(),
        }
    }

    /// Unknown command for a known device.
    pub fn unknown_command(device: &str, command: &str) -> Self {
        CtlError::UnknownTarget {
            kind: TargetKind::Command,
            name: format!("{device}.{command}"),
        }
    }

    /// True when the fault lies with the bus handle rather than the device.
    pub fn is_transport_fault(&self) -> bool {
        matches!(self, CtlError::Transport { .. })
    }
}

impl From<figment::Error> for CtlError {
    fn from(value: figment::Error) -> Self {
        CtlError::Config(value.to_string())
    }
}

/// What kind of name failed to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    /// Device name
    Device,
    /// Command of a known device
    Command,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKind::Device => write!(f, "device"),
            TargetKind::Command => write!(f, "command"),
        }
    }
}

/// Device answered, but not with something usable.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// Reply checksum mismatch
    #[error("Checksum incorrect: expected {expected:#04x}, received {actual:#04x}")]
    Checksum {
        /// Computed over the received bytes
        expected: u8,
        /// Carried by the reply
        actual: u8,
    },

    /// NAK followed by a complete reply
    #[error("Command incorrect.")]
    CommandRejected,

    /// ACK followed by a NAK
    #[error("Failed to process command.")]
    FailedToProcess,

    /// Retry budget spent without a usable answer
    #[error("No response after {attempts} attempts")]
    NoResponse {
        /// Attempts made
        attempts: u32,
    },

    /// Error status reported by the device
    #[error("{category}: {payload:?}")]
    DeviceStatus {
        /// Error category of the status code
        category: String,
        /// Rest of the reply
        payload: String,
    },

    /// Reply that does not parse
    #[error("Malformed reply ({reason}): {raw}")]
    Malformed {
        /// What was wrong
        reason: String,
        /// Raw bytes as hex
        raw: String,
    },

    /// Stored calibration constants unusable
    #[error("Calibration data invalid: {0}")]
    Calibration(String),
}

impl ProtocolError {
    /// Malformed reply, rendering the raw bytes as colon separated hex.
    pub fn malformed(reason: impl Into<String>, raw: &[u8]) -> Self {
        ProtocolError::Malformed {
            reason: reason.into(),
            raw: to_hex(raw),
        }
    }
}

/// Argument rejected before any bus I/O.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Invalid {field} '{value}', allowed: {allowed}")]
pub struct ValidationError {
    /// Argument name
    pub field: String,
    /// Rejected value as received
    pub value: String,
    /// Accepted values or range
    pub allowed: String,
}

impl ValidationError {
    /// Rejection of `value` for `field`.
    pub fn new(
        field: impl Into<String>,
        value: impl fmt::Display,
        allowed: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            value: value.to_string(),
            allowed: allowed.into(),
        }
    }

    /// Out of a closed numeric range.
    pub fn range(field: impl Into<String>, value: impl fmt::Display, lo: f64, hi: f64) -> Self {
        Self::new(field, value, format!("range({lo:?}, {hi:?})"))
    }

    /// Not one of an enumerated set.
    pub fn one_of(field: impl Into<String>, value: impl fmt::Display, allowed: &[&str]) -> Self {
        Self::new(field, value, allowed.join("|"))
    }
}

/// Colon separated lowercase hex, for logging wire traffic.
pub fn to_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}
