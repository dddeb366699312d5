//! Instrument drivers.
//!
//! A driver owns the cached state of one instrument and translates its typed
//! operations into protocol exchanges on a shared [`Channel`]. Drivers never
//! touch a transport outside [`Channel::with_exclusive_access`].
//!
//! [`Channel`]: crate::channel::Channel
//! [`Channel::with_exclusive_access`]: crate::channel::Channel::with_exclusive_access

pub mod brooks;
pub mod labjack_io;
pub mod sierra;
pub mod t3bi;

pub use brooks::{BrooksMfc, IoMode};
pub use labjack_io::{AnalogMfc, Switch, SwitchState, TickDacMfc};
pub use sierra::SierraMfc;
pub use t3bi::{T3biInit, Tvc};
