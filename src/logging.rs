//! Tracing setup and the switchable request log.
//!
//! Console output and the request/response log file are both driven by
//! `tracing`. The file layer writes through [`LogSwitch`], whose destination
//! the `controller` pseudo-device can swap at runtime (`startnew` / `stoplog`).
//!
//! # Example
//! ```no_run
//! use labctl::logging::{self, LoggingConfig, LogSwitch, OutputFormat};
//! use tracing::Level;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let switch = LogSwitch::open("log", "log_controlserver.txt")?;
//! let config = LoggingConfig::new(Level::DEBUG).with_format(OutputFormat::Compact);
//! logging::init(config, Some(switch.clone()))?;
//!
//! tracing::info!("server starting");
//! switch.start_new("run-42.txt")?;
//! # Ok(())
//! # }
//! ```

use crate::config::ServerSection;
use crate::error::{CtlError, CtlResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, MakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Name of the symlink kept pointing at the active log file.
pub const LOGVIEW_LINK: &str = "logview.txt";

/// Console output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Multi-line, colored (development)
    Pretty,
    /// Single line, no colors
    Compact,
    /// One JSON object per event
    Json,
}

/// Logging options
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Most verbose level emitted
    pub level: Level,
    /// Console format
    pub format: OutputFormat,
    /// Emit span NEW/CLOSE events
    pub with_span_events: bool,
    /// Colors on the console (Pretty only)
    pub with_ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Compact,
            with_span_events: false,
            with_ansi: true,
        }
    }
}

impl LoggingConfig {
    /// Defaults at `level`.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Build from the `[server]` section.
    pub fn from_server(server: &ServerSection) -> CtlResult<Self> {
        Ok(Self {
            level: parse_log_level(&server.log_level)?,
            format: server.log_format,
            ..Default::default()
        })
    }

    /// Console format.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` overrides the configured level. Calling this again after a
/// subscriber is installed is not an error.
pub fn init(config: LoggingConfig, file: Option<LogSwitch>) -> CtlResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let console = match config.format {
        OutputFormat::Pretty => fmt::layer()
            .pretty()
            .with_span_events(span_events)
            .with_ansi(config.with_ansi)
            .boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_span_events(span_events)
            .with_ansi(false)
            .boxed(),
        OutputFormat::Json => fmt::layer().json().with_span_events(span_events).boxed(),
    };

    let file_layer = file.map(|switch| {
        fmt::layer()
            .with_writer(switch)
            .with_ansi(false)
            .with_target(false)
            .boxed()
    });

    tracing_subscriber::registry()
        .with(console.and_then(file_layer).with_filter(env_filter))
        .try_init()
        .or_else(|e| {
            // Tests and embedding code may have installed one already
            if e.to_string().contains("a global default trace dispatcher has already been set") {
                Ok(())
            } else {
                Err(CtlError::Config(format!("Failed to initialize tracing: {e}")))
            }
        })
}

/// Parse a log level name, case-insensitively.
pub fn parse_log_level(level: &str) -> CtlResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(CtlError::Config(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        ))),
    }
}

struct LogTarget {
    dir: PathBuf,
    default_name: String,
    active: PathBuf,
    file: File,
}

/// Log file destination that can be swapped while the server runs.
///
/// Cloning yields another handle to the same destination.
#[derive(Clone)]
pub struct LogSwitch {
    target: Arc<Mutex<LogTarget>>,
}

impl LogSwitch {
    /// Create `dir` if needed and start writing to `dir/default_name`.
    pub fn open(dir: impl AsRef<Path>, default_name: &str) -> CtlResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let active = dir.join(default_name);
        let file = open_append(&active)?;
        update_logview(&dir, &active);
        Ok(Self {
            target: Arc::new(Mutex::new(LogTarget {
                dir,
                default_name: default_name.to_string(),
                active,
                file,
            })),
        })
    }

    /// Switch to `<log_dir>/<name>`. Only the file name component of `name`
    /// is used, so clients cannot write outside the log directory.
    pub fn start_new(&self, name: &str) -> CtlResult<PathBuf> {
        let file_name = Path::new(name)
            .file_name()
            .ok_or_else(|| CtlError::Config(format!("Invalid log file name '{name}'")))?;
        let path = self.target.lock().dir.join(file_name);
        self.switch_to(path)
    }

    /// Return to the default log file.
    pub fn reset(&self) -> CtlResult<PathBuf> {
        let path = {
            let target = self.target.lock();
            target.dir.join(&target.default_name)
        };
        self.switch_to(path)
    }

    /// File currently written to.
    pub fn active_path(&self) -> PathBuf {
        self.target.lock().active.clone()
    }

    fn switch_to(&self, path: PathBuf) -> CtlResult<PathBuf> {
        let file = open_append(&path)?;
        let mut target = self.target.lock();
        let _ = target.file.flush();
        target.file = file;
        target.active = path.clone();
        update_logview(&target.dir, &path);
        Ok(path)
    }
}

fn open_append(path: &Path) -> CtlResult<File> {
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

#[cfg(unix)]
fn update_logview(dir: &Path, active: &Path) {
    let link = dir.join(LOGVIEW_LINK);
    let _ = fs::remove_file(&link);
    // Relative target keeps the link valid if the log directory moves
    let target = active.file_name().map(PathBuf::from).unwrap_or_else(|| active.to_path_buf());
    if let Err(e) = std::os::unix::fs::symlink(&target, &link) {
        tracing::warn!(link = %link.display(), error = %e, "Could not update log symlink");
    }
}

#[cfg(not(unix))]
fn update_logview(_dir: &Path, _active: &Path) {}

/// Writer handed out to the fmt layer for one event.
pub struct LogSwitchWriter {
    target: Arc<Mutex<LogTarget>>,
}

impl Write for LogSwitchWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.target.lock().file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.target.lock().file.flush()
    }
}

impl<'a> MakeWriter<'a> for LogSwitch {
    type Writer = LogSwitchWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogSwitchWriter {
            target: Arc::clone(&self.target),
        }
    }
}
