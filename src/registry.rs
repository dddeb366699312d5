//! Device registry: channels and devices built from configuration.
//!
//! The registry is immutable once built. Devices are kept in configuration
//! order, which is also the order they are initialised in.

use crate::channel::Channel;
use crate::config::ServerConfig;
use crate::device::{Device, DeviceDriver};
use crate::error::{CtlError, CtlResult};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Outcome of the startup sequence.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct InitSummary {
    /// Devices whose init succeeded, in order
    pub initialized: Vec<String>,
    /// Device name and the error it reported
    pub failed: Vec<(String, String)>,
}

/// Channels and the devices attached to them, built once at startup.
pub struct DeviceRegistry {
    channels: Vec<Arc<Channel>>,
    devices: Vec<Arc<Device>>,
    index: HashMap<String, usize>,
    bootstrap_baud: HashMap<String, u32>,
}

impl DeviceRegistry {
    /// Open every configured channel and build its devices.
    pub async fn open(config: &ServerConfig) -> CtlResult<Self> {
        let mut channels = Vec::with_capacity(config.channels.len());
        for channel in &config.channels {
            channels.push(Channel::open(channel).await?);
        }
        Self::with_channels(config, channels)
    }

    /// Build devices on already opened channels. Every channel id named in
    /// `config` must be present in `channels`.
    pub fn with_channels(config: &ServerConfig, channels: Vec<Channel>) -> CtlResult<Self> {
        let channels: Vec<Arc<Channel>> = channels.into_iter().map(Arc::new).collect();
        let by_id: HashMap<&str, &Arc<Channel>> =
            channels.iter().map(|c| (c.id(), c)).collect();

        let mut devices = Vec::with_capacity(config.devices.len());
        let mut index = HashMap::new();
        for device_config in &config.devices {
            let channel = by_id.get(device_config.channel.as_str()).ok_or_else(|| {
                CtlError::Config(format!(
                    "Device '{}' refers to unknown channel '{}'",
                    device_config.name, device_config.channel
                ))
            })?;
            let labjack = config
                .channel(&device_config.channel)
                .and_then(|c| c.labjack.as_ref());
            let device = Device::from_config(device_config, Arc::clone(channel), labjack);
            if index
                .insert(device.name().to_string(), devices.len())
                .is_some()
            {
                return Err(CtlError::Config(format!(
                    "Duplicate device name: {}",
                    device.name()
                )));
            }
            devices.push(Arc::new(device));
        }

        let bootstrap_baud = config
            .channels
            .iter()
            .filter_map(|c| c.bootstrap_baud.map(|baud| (c.id.clone(), baud)))
            .collect();

        info!(
            channels = channels.len(),
            devices = devices.len(),
            "Device registry built"
        );
        Ok(Self {
            channels,
            devices,
            index,
            bootstrap_baud,
        })
    }

    /// Device by name.
    pub fn get(&self, name: &str) -> Option<Arc<Device>> {
        self.index.get(name).map(|&i| Arc::clone(&self.devices[i]))
    }

    /// Look up a device, reporting an unknown name as an error.
    pub fn device(&self, name: &str) -> CtlResult<Arc<Device>> {
        self.get(name).ok_or_else(|| CtlError::unknown_device(name))
    }

    /// Device names in configuration order.
    pub fn names(&self) -> Vec<&str> {
        self.devices.iter().map(|d| d.name()).collect()
    }

    /// Number of devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// True when no device is configured.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Channel by id.
    pub fn channel(&self, id: &str) -> Option<&Arc<Channel>> {
        self.channels.iter().find(|c| c.id() == id)
    }

    /// Move L-protocol controllers from their power-up baud rate to the
    /// channel's working rate.
    ///
    /// For each channel with a bootstrap rate: switch the port to it, program
    /// every controller on the bus, then switch the port back. Controllers
    /// that do not answer are logged and skipped. Returns the number of
    /// controllers programmed.
    pub async fn bootstrap_baud_rates(&self) -> CtlResult<usize> {
        let mut programmed = 0;
        for channel in &self.channels {
            let Some(&bootstrap) = self.bootstrap_baud.get(channel.id()) else {
                continue;
            };
            let Some(working) = channel.params().baud_rate else {
                warn!(channel = %channel.id(), "Bootstrap baud rate set on a link without one");
                continue;
            };
            info!(channel = %channel.id(), bootstrap, working, "Programming controller baud rates");
            channel.set_baud_rate(bootstrap).await?;
            for device in self.devices.iter().filter(|d| d.channel_id() == channel.id()) {
                if let DeviceDriver::Brooks(mfc) = device.driver() {
                    if mfc.program_baud_rate(working).await {
                        programmed += 1;
                    }
                }
            }
            channel.set_baud_rate(working).await?;
        }
        Ok(programmed)
    }

    /// Run `init_state` on every device that has one, one after another.
    ///
    /// A failing device is logged and does not stop the sequence.
    pub async fn initialize(&self) -> InitSummary {
        let mut summary = InitSummary::default();
        for device in &self.devices {
            if !device.supports("init_state") {
                continue;
            }
            info!(device = %device.name(), kind = device.driver().kind(), "Initialising");
            match device.call("init_state", &[]).await {
                Ok(reply) => {
                    info!(device = %device.name(), ?reply, "Initialised");
                    summary.initialized.push(device.name().to_string());
                }
                Err(err) => {
                    error!(device = %device.name(), error = %err, "Initialisation failed");
                    summary
                        .failed
                        .push((device.name().to_string(), err.to_string()));
                }
            }
        }
        summary
    }

    /// Release every channel.
    pub async fn shutdown(&self) {
        for channel in &self.channels {
            if let Err(err) = channel.close().await {
                warn!(channel = %channel.id(), error = %err, "Channel close failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MockEvent, MockTransport};
    use crate::channel::ChannelParams;

    const CONFIG: &str = r#"
        [[channels]]
        id = "rs485"
        transport = { kind = "mock" }
        bootstrap_baud = 9600

        [[channels]]
        id = "rs232"
        transport = { kind = "mock" }

        [[channels]]
        id = "u6"
        transport = { kind = "mock" }

        [[devices]]
        name = "mfc-ch4-2"
        channel = "rs485"
        driver = "brooks"
        mac_id = 33
        fs_range = 10.0

        [[devices]]
        name = "mfc-n2-1"
        channel = "rs232"
        driver = "sierra"
        fs_range = 50.0

        [[devices]]
        name = "sw-ventline"
        channel = "u6"
        driver = "switch"
        line = 9
    "#;

    struct Bench {
        rs485: MockTransport,
        rs232: MockTransport,
        u6: MockTransport,
        registry: DeviceRegistry,
    }

    fn bench() -> Bench {
        let config = ServerConfig::from_toml_str(CONFIG).unwrap();
        let rs485 = MockTransport::new("rs485");
        let rs232 = MockTransport::new("rs232");
        let u6 = MockTransport::new("u6");
        let serial = ChannelParams {
            baud_rate: Some(115200),
            retry_budget: 2,
            max_unmonitored_attempts: 2,
            ..ChannelParams::default()
        };
        let channels = vec![
            Channel::new("rs485", Box::new(rs485.clone()), serial.clone()),
            Channel::new("rs232", Box::new(rs232.clone()), serial),
            Channel::new("u6", Box::new(u6.clone()), ChannelParams::default()),
        ];
        let registry = DeviceRegistry::with_channels(&config, channels).unwrap();
        Bench {
            rs485,
            rs232,
            u6,
            registry,
        }
    }

    #[test]
    fn test_lookup_in_config_order() {
        let bench = bench();
        assert_eq!(
            bench.registry.names(),
            vec!["mfc-ch4-2", "mfc-n2-1", "sw-ventline"]
        );
        assert!(bench.registry.get("mfc-n2-1").is_some());
        let err = bench.registry.device("mfc-xx").err().unwrap();
        assert_eq!(err.to_string(), "Unknown device: mfc-xx");
    }

    #[test]
    fn test_missing_channel_is_config_error() {
        let config = ServerConfig::from_toml_str(CONFIG).unwrap();
        let result = DeviceRegistry::with_channels(&config, Vec::new());
        assert!(matches!(result, Err(CtlError::Config(_))));
    }

    #[tokio::test]
    async fn test_initialize_continues_after_failure() {
        let bench = bench();
        let summary = bench.registry.initialize().await;
        // Silent serial buses: both flow controllers fail, the switch at its
        // default state needs no I/O.
        assert_eq!(summary.initialized, vec!["sw-ventline"]);
        let failed: Vec<_> = summary.failed.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(failed, vec!["mfc-ch4-2", "mfc-n2-1"]);
        assert!(!bench.rs232.writes().is_empty());
        assert!(bench.u6.writes().is_empty());
    }

    #[tokio::test]
    async fn test_bootstrap_restores_working_baud() {
        let bench = bench();
        let programmed = bench.registry.bootstrap_baud_rates().await.unwrap();
        assert_eq!(programmed, 0);

        let events = bench.rs485.events();
        assert_eq!(events.first(), Some(&MockEvent::BaudRate(9600)));
        assert_eq!(events.last(), Some(&MockEvent::BaudRate(115200)));
        assert!(events.iter().any(|e| matches!(e, MockEvent::Write(_))));
        // Channels without a bootstrap rate are left alone
        assert!(bench.rs232.events().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_closes_channels() {
        let bench = bench();
        bench.registry.shutdown().await;
        assert_eq!(bench.u6.events(), vec![MockEvent::Close]);
    }
}
