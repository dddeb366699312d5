//! Capability traits shared by device families.
//!
//! Every mass-flow controller, whatever bus it sits on, implements
//! [`FlowControl`]. The device layer formats replies for clients once, on top of
//! this trait, so the four MFC drivers agree on units and number formatting.

use crate::error::{CtlResult, ValidationError};
use crate::protocol::repr;
use async_trait::async_trait;

/// Capability: mass-flow control
///
/// # Contract
/// - Flows are in the controller's calibrated units (sccm)
/// - `set_flow` rejects values outside `[0, full scale]` before any bus I/O
/// - The cached setpoint only changes after the device accepted the new value
///
/// # Thread Safety
/// All methods take `&self`; drivers keep their cached state behind a mutex
/// that is never held across an await.
#[async_trait]
pub trait FlowControl: Send + Sync {
    /// Program the configured initial setpoint and read back the flow.
    async fn init_state(&self) -> CtlResult<f64>;

    /// Program a new setpoint and return the controller's acknowledgement.
    async fn set_flow(&self, flow: f64) -> CtlResult<String>;

    /// Measured flow.
    async fn get_flow(&self) -> CtlResult<f64>;

    /// Last setpoint accepted by the controller.
    fn curr_setp(&self) -> f64;

    /// Full scale of the controller. Drivers that can query it refresh the
    /// cached value.
    async fn fs_range(&self) -> CtlResult<f64>;
}

/// Reject flows outside `[0, full_scale]`.
pub fn check_flow(flow: f64, full_scale: f64) -> Result<(), ValidationError> {
    if (0.0..=full_scale).contains(&flow) {
        Ok(())
    } else {
        Err(ValidationError::range("flow", repr(flow), 0.0, full_scale))
    }
}

/// Cached state common to every flow controller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlowState {
    /// Full scale in sccm
    pub fs_range: f64,
    /// Last setpoint accepted by the device
    pub curr_setp: f64,
    /// Last flow read back
    pub actv_flow: f64,
}

impl FlowState {
    /// Zero setpoint and flow.
    pub fn new(fs_range: f64) -> Self {
        Self {
            fs_range,
            curr_setp: 0.0,
            actv_flow: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_flow_bounds() {
        assert!(check_flow(0.0, 50.0).is_ok());
        assert!(check_flow(50.0, 50.0).is_ok());
        let err = check_flow(60.0, 50.0).unwrap_err();
        assert_eq!(err.allowed, "range(0.0, 50.0)");
        assert!(check_flow(-0.1, 50.0).is_err());
        assert!(check_flow(f64::NAN, 50.0).is_err());
    }
}
