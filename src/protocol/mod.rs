//! Wire protocols spoken by the instruments.
//!
//! Each submodule owns framing, validation and the retry loop of one protocol
//! family. Everything here runs against a borrowed [`Transport`] and therefore
//! only ever executes inside [`Channel::with_exclusive_access`].
//!
//! [`Transport`]: crate::adapters::Transport
//! [`Channel::with_exclusive_access`]: crate::channel::Channel::with_exclusive_access

pub mod labjack;
pub mod lprotocol;
pub mod lrc;
pub mod status_ascii;

/// Render a float the way the instruments' clients expect (`25.0`, `0.1`).
pub(crate) fn repr(value: f64) -> String {
    format!("{value:?}")
}
