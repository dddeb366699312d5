//! Sierra SmartTrak mass-flow controller (LRC-checksummed ASCII on RS-232).

use crate::capabilities::{check_flow, FlowControl, FlowState};
use crate::channel::Channel;
use crate::error::{CtlResult, ProtocolError};
use crate::protocol::lrc;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug)]
struct SierraState {
    flow: FlowState,
    gas_name: Option<String>,
    units: Option<String>,
}

/// Sierra mass-flow controller on an RS-232 line.
pub struct SierraMfc {
    channel: Arc<Channel>,
    init_val: f64,
    state: Mutex<SierraState>,
}

impl SierraMfc {
    /// Controller with full scale `fs_range`; nothing is sent until `init_state`.
    pub fn new(channel: Arc<Channel>, fs_range: f64, init_val: f64) -> Self {
        Self {
            channel,
            init_val,
            state: Mutex::new(SierraState {
                flow: FlowState::new(fs_range),
                gas_name: None,
                units: None,
            }),
        }
    }

    async fn query(&self, command: String) -> CtlResult<String> {
        self.channel
            .with_exclusive_access(move |port| {
                let command = command.clone();
                Box::pin(async move { lrc::query(port, &command).await })
            })
            .await
    }

    async fn query_number(&self, command: &str) -> CtlResult<f64> {
        let value = self.query(command.to_string()).await?;
        value
            .trim()
            .parse()
            .map_err(|_| ProtocolError::malformed("expected a number", value.as_bytes()).into())
    }

    /// Name of the selected gas.
    pub async fn gas_name(&self) -> CtlResult<String> {
        let name = self.query("?Gnam".to_string()).await?;
        self.state.lock().gas_name = Some(name.clone());
        Ok(name)
    }

    /// Engineering units of flow readings.
    pub async fn units(&self) -> CtlResult<String> {
        let units = self.query("?Unts".to_string()).await?;
        self.state.lock().units = Some(units.clone());
        Ok(units)
    }

    /// Firmware version and serial number.
    pub async fn info(&self) -> CtlResult<Vec<String>> {
        let version = self.query("?Vern".to_string()).await?;
        let serial = self.query("?Srnm".to_string()).await?;
        Ok(vec![
            format!("Version no.: {version}"),
            format!("Serial No.: {serial}"),
        ])
    }
}

#[async_trait]
impl FlowControl for SierraMfc {
    async fn init_state(&self) -> CtlResult<f64> {
        self.set_flow(self.init_val).await?;
        self.get_flow().await
    }

    /// Returns the setpoint echoed by the controller.
    async fn set_flow(&self, flow: f64) -> CtlResult<String> {
        let fs_range = self.state.lock().flow.fs_range;
        check_flow(flow, fs_range)?;
        let echo = self.query(format!("!Setr{flow:.1}")).await?;
        self.state.lock().flow.curr_setp = flow;
        Ok(echo)
    }

    async fn get_flow(&self) -> CtlResult<f64> {
        let flow = self.query_number("?Flow").await?;
        self.state.lock().flow.actv_flow = flow;
        Ok(flow)
    }

    fn curr_setp(&self) -> f64 {
        self.state.lock().flow.curr_setp
    }

    async fn fs_range(&self) -> CtlResult<f64> {
        let fs_range = self.query_number("?Fscl").await?;
        self.state.lock().flow.fs_range = fs_range;
        Ok(fs_range)
    }
}
