//! CLI entry point for labctl
//!
//! # Usage
//!
//! Serve command batches on the configured port:
//! ```bash
//! labctl serve --config config/labctl.toml
//! ```
//!
//! Check a configuration file and print the effective settings:
//! ```bash
//! labctl check-config --config config/labctl.toml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use labctl::dispatcher::{self, Dispatcher};
use labctl::logging::{self, LogSwitch, LoggingConfig};
use labctl::{DeviceRegistry, ServerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "labctl")]
#[command(about = "Command server for serial/USB laboratory instruments", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialise the devices and serve command batches over TCP
    Serve {
        /// Configuration file
        #[arg(long, default_value = "config/labctl.toml")]
        config: PathBuf,

        /// Override the configured listening port
        #[arg(long)]
        port: Option<u16>,

        /// Do not run device initialisation at startup
        #[arg(long)]
        skip_init: bool,
    },

    /// Validate a configuration file and print it with defaults filled in
    CheckConfig {
        #[arg(long, default_value = "config/labctl.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            port,
            skip_init,
        } => serve(config, port, skip_init).await,
        Commands::CheckConfig { config } => check_config(config),
    }
}

fn load(path: &PathBuf) -> Result<ServerConfig> {
    let config = ServerConfig::load_from(path)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;
    Ok(config)
}

fn check_config(path: PathBuf) -> Result<()> {
    let config = load(&path)?;
    println!("{}", toml::to_string_pretty(&config)?);
    println!(
        "# {} channels, {} devices",
        config.channels.len(),
        config.devices.len()
    );
    Ok(())
}

async fn serve(path: PathBuf, port: Option<u16>, skip_init: bool) -> Result<()> {
    let mut config = load(&path)?;
    if let Some(port) = port {
        config.server.port = port;
    }

    let log_switch = LogSwitch::open(&config.server.log_dir, &config.server.default_log_file)
        .context("Failed to open the log directory")?;
    logging::init(
        LoggingConfig::from_server(&config.server)?,
        Some(log_switch.clone()),
    )?;
    info!(config = %path.display(), "labctl starting");

    let registry = Arc::new(DeviceRegistry::open(&config).await?);
    let programmed = registry.bootstrap_baud_rates().await?;
    if programmed > 0 {
        info!(programmed, "Controller baud rates programmed");
    }

    if skip_init {
        info!("Skipping device initialisation");
    } else {
        let summary = registry.initialize().await;
        info!(
            initialized = summary.initialized.len(),
            failed = summary.failed.len(),
            "Device initialisation finished"
        );
        for (device, error) in &summary.failed {
            warn!(%device, %error, "Device left uninitialised");
        }
    }

    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&registry)).with_log_switch(log_switch));
    let listener = dispatcher::bind(&config.server.bind, config.server.port).await?;
    dispatcher::serve(listener, dispatcher, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "Ctrl-C handler failed");
        }
    })
    .await?;

    registry.shutdown().await;
    info!("labctl stopped");
    Ok(())
}
