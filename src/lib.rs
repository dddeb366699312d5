//! # labctl
//!
//! Command dispatcher and protocol drivers for a rack of serial/USB laboratory
//! instruments: mass-flow controllers, a throttle valve controller and
//! pneumatic switches.
//!
//! ## Crate Structure
//!
//! - **`error`**: the `CtlError` taxonomy shared by every layer.
//! - **`config`**: figment-loaded TOML and environment configuration of
//!   channels and devices.
//! - **`logging`**: tracing-subscriber setup and the switchable log file the
//!   `controller` pseudo-device drives.
//! - **`adapters`**: byte transports (serial, TCP, mock) under a channel.
//! - **`channel`**: exclusive access to one physical bus, with reopen-once on
//!   transport faults.
//! - **`protocol`**: framing, checksums and retry loops of each wire protocol.
//! - **`capabilities`**: the `FlowControl` trait shared by all mass-flow
//!   controllers.
//! - **`drivers`**: one driver per instrument family, holding device state.
//! - **`device`**: named devices and their command tables.
//! - **`registry`**: builds channels and devices and runs startup
//!   initialisation.
//! - **`dispatcher`**: batch execution and the newline-delimited JSON server.

pub mod adapters;
pub mod capabilities;
pub mod channel;
pub mod config;
pub mod device;
pub mod dispatcher;
pub mod drivers;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod registry;

pub use channel::{Channel, ChannelParams};
pub use config::ServerConfig;
pub use device::Device;
pub use dispatcher::{CommandRequest, CommandResponse, Dispatcher, Status};
pub use error::{CtlError, CtlResult};
pub use registry::DeviceRegistry;
