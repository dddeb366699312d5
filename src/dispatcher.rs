//! Command dispatcher and the newline-delimited JSON server.
//!
//! A client sends one batch per line:
//!
//! ```text
//! [{"dev": "mfc-n2-1", "cmd": "set_flow", "args": ["25.0"]},
//!  {"dev": "tvc", "cmd": "get_pressure", "args": null}]
//! ```
//!
//! and receives one line with a response per request entry, in request order:
//!
//! ```text
//! [{"dev": "mfc-n2-1", "cmd": "set_flow", "status": "OK", "value": ["25.0"]},
//!  {"dev": "tvc", "cmd": "get_pressure", "status": "OK", "value": ["0.0123"]}]
//! ```
//!
//! Every entry runs in its own task. Entries for devices on different
//! channels proceed in parallel; entries sharing a channel queue on its lock.
//! The reserved `controller` device switches the server's log file and is
//! answered in place.

use crate::config::CONTROLLER_DEVICE;
use crate::error::{CtlError, CtlResult};
use crate::logging::LogSwitch;
use crate::registry::DeviceRegistry;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// One entry of a request batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Device name
    pub dev: String,
    /// Command name
    pub cmd: String,
    /// Positional arguments
    #[serde(default)]
    pub args: Option<Vec<String>>,
}

impl CommandRequest {
    /// Request for `cmd` on `dev`.
    pub fn new(dev: impl Into<String>, cmd: impl Into<String>, args: Option<Vec<String>>) -> Self {
        Self {
            dev: dev.into(),
            cmd: cmd.into(),
            args,
        }
    }
}

/// Outcome of one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// Serialized as `"OK"`
    #[serde(rename = "OK")]
    Ok,
    /// Message in `value[0]`
    Error,
}

/// One entry of a response batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    /// Device name echoed from the request
    pub dev: String,
    /// Command name echoed from the request
    pub cmd: String,
    /// Outcome
    pub status: Status,
    /// Reply values, or the error message
    pub value: Vec<String>,
}

impl CommandResponse {
    /// Successful entry.
    pub fn ok(dev: impl Into<String>, cmd: impl Into<String>, value: Vec<String>) -> Self {
        Self {
            dev: dev.into(),
            cmd: cmd.into(),
            status: Status::Ok,
            value,
        }
    }

    /// Failed entry carrying `message`.
    pub fn error(dev: impl Into<String>, cmd: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            dev: dev.into(),
            cmd: cmd.into(),
            status: Status::Error,
            value: vec![message.into()],
        }
    }

    fn from_result(dev: String, cmd: String, result: CtlResult<Vec<String>>) -> Self {
        match result {
            Ok(value) => Self::ok(dev, cmd, value),
            Err(err) => Self::error(dev, cmd, err.to_string()),
        }
    }

    /// True for an `OK` entry.
    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

/// Resolves request batches against the device registry.
pub struct Dispatcher {
    registry: Arc<DeviceRegistry>,
    log_switch: Option<LogSwitch>,
}

impl Dispatcher {
    /// Dispatcher over `registry` without log switching.
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self {
            registry,
            log_switch: None,
        }
    }

    /// Let the controller device switch log files through `switch`.
    pub fn with_log_switch(mut self, switch: LogSwitch) -> Self {
        self.log_switch = Some(switch);
        self
    }

    /// Devices this dispatcher serves.
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Run a batch and return its responses in request order.
    ///
    /// Failures, including a panicking command, become `Error` entries; the
    /// rest of the batch is unaffected.
    pub async fn execute(&self, batch: Vec<CommandRequest>) -> Vec<CommandResponse> {
        let mut results: Vec<Option<CommandResponse>> = vec![None; batch.len()];
        let mut tasks = Vec::with_capacity(batch.len());

        for (slot, request) in batch.into_iter().enumerate() {
            if request.dev == CONTROLLER_DEVICE {
                results[slot] = Some(self.controller(&request));
                continue;
            }
            let registry = Arc::clone(&self.registry);
            let span = info_span!("command", dev = %request.dev, cmd = %request.cmd);
            let (dev, cmd) = (request.dev.clone(), request.cmd.clone());
            let handle = tokio::spawn(
                async move {
                    let args = request.args.unwrap_or_default();
                    let result = match registry.device(&request.dev) {
                        Ok(device) => device.call(&request.cmd, &args).await,
                        Err(err) => Err(err),
                    };
                    if let Err(err) = &result {
                        warn!(error = %err, "Command failed");
                    }
                    CommandResponse::from_result(request.dev, request.cmd, result)
                }
                .instrument(span),
            );
            tasks.push(async move { (slot, dev, cmd, handle.await) });
        }

        for (slot, dev, cmd, joined) in join_all(tasks).await {
            results[slot] = Some(match joined {
                Ok(response) => response,
                Err(err) => {
                    error!(%dev, %cmd, error = %err, "Command task failed");
                    CommandResponse::error(dev, cmd, format!("Command task failed: {err}"))
                }
            });
        }

        results.into_iter().flatten().collect()
    }

    /// Log file control. Always answers OK with the active log path.
    fn controller(&self, request: &CommandRequest) -> CommandResponse {
        let Some(switch) = &self.log_switch else {
            debug!(cmd = %request.cmd, "No switchable log file configured");
            return CommandResponse::ok(CONTROLLER_DEVICE, request.cmd.clone(), Vec::new());
        };
        let result = match request.cmd.as_str() {
            "startnew" => match request.args.as_ref().and_then(|a| a.first()) {
                Some(name) => switch.start_new(name),
                None => Err(CtlError::Config("startnew needs a file name".to_string())),
            },
            "stoplog" => switch.reset(),
            other => Err(CtlError::unknown_command(CONTROLLER_DEVICE, other)),
        };
        let path = match result {
            Ok(path) => {
                info!(path = %path.display(), "Log file switched");
                path
            }
            Err(err) => {
                warn!(cmd = %request.cmd, error = %err, "Log file not switched");
                switch.active_path()
            }
        };
        CommandResponse::ok(
            CONTROLLER_DEVICE,
            request.cmd.clone(),
            vec![path.display().to_string()],
        )
    }

    /// Decode one request line, run it and encode the response line.
    ///
    /// A line that is not a valid batch yields a single `Error` entry.
    pub async fn handle_line(&self, line: &str) -> String {
        let responses = match serde_json::from_str::<Vec<CommandRequest>>(line) {
            Ok(batch) => self.execute(batch).await,
            Err(err) => vec![CommandResponse::error("", "", format!("Invalid request: {err}"))],
        };
        serde_json::to_string(&responses).unwrap_or_else(|err| {
            error!(error = %err, "Response encoding failed");
            "[]".to_string()
        })
    }
}

/// Bind the listener described by `bind` and `port`.
pub async fn bind(bind: &str, port: u16) -> CtlResult<TcpListener> {
    let listener = TcpListener::bind((bind, port)).await?;
    info!(address = %listener.local_addr()?, "Listening for command batches");
    Ok(listener)
}

/// Accept clients until `shutdown` resolves. Each client is served on its own
/// task; a failing client never affects the others.
pub async fn serve<F>(listener: TcpListener, dispatcher: Arc<Dispatcher>, shutdown: F) -> CtlResult<()>
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested, no longer accepting clients");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    let dispatcher = Arc::clone(&dispatcher);
                    tokio::spawn(
                        async move {
                            if let Err(err) = handle_client(socket, peer, &dispatcher).await {
                                warn!(error = %err, "Client error");
                            }
                        }
                        .instrument(info_span!("connection", %peer)),
                    );
                }
                Err(err) => error!(error = %err, "Accept failed"),
            }
        }
    }
}

async fn handle_client(socket: TcpStream, peer: SocketAddr, dispatcher: &Dispatcher) -> CtlResult<()> {
    info!(%peer, "Client connected");
    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        debug!(request = %line, "Request");
        let reply = dispatcher.handle_line(&line).await;
        debug!(response = %reply, "Response");
        writer.write_all(reply.as_bytes()).await?;
        writer.write_all(b"\n").await?;
    }

    info!(%peer, "Client disconnected");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockTransport;
    use crate::channel::{Channel, ChannelParams};
    use crate::config::ServerConfig;
    use tempfile::TempDir;

    fn dispatcher() -> (MockTransport, Dispatcher) {
        let config = ServerConfig::from_toml_str(
            r#"
            [[channels]]
            id = "u6"
            transport = { kind = "mock" }

            [[devices]]
            name = "sw-ventline"
            channel = "u6"
            driver = "switch"
            line = 9
            "#,
        )
        .unwrap();
        let mock = MockTransport::new("u6");
        let channel = Channel::new("u6", Box::new(mock.clone()), ChannelParams::default());
        let registry = DeviceRegistry::with_channels(&config, vec![channel]).unwrap();
        (mock, Dispatcher::new(Arc::new(registry)))
    }

    #[test]
    fn test_wire_format() {
        let request: Vec<CommandRequest> =
            serde_json::from_str(r#"[{"dev":"tvc","cmd":"get_pressure","args":null}]"#).unwrap();
        assert_eq!(request[0].args, None);
        let response = CommandResponse::ok("tvc", "get_pressure", vec!["0.5".into()]);
        assert_eq!(
            serde_json::to_string(&response).unwrap(),
            r#"{"dev":"tvc","cmd":"get_pressure","status":"OK","value":["0.5"]}"#
        );
    }

    #[tokio::test]
    async fn test_errors_stay_in_their_slot() {
        let (_mock, dispatcher) = dispatcher();
        let responses = dispatcher
            .execute(vec![
                CommandRequest::new("mfc-xx", "get_flow", None),
                CommandRequest::new("sw-ventline", "init_state", None),
                CommandRequest::new("sw-ventline", "fly", None),
            ])
            .await;
        assert_eq!(responses.len(), 3);
        assert_eq!(responses[0].status, Status::Error);
        assert_eq!(responses[0].value, vec!["Unknown device: mfc-xx"]);
        assert_eq!(responses[1].value, vec!["noflow"]);
        assert!(responses[1].is_ok());
        assert_eq!(responses[2].dev, "sw-ventline");
        assert_eq!(responses[2].value, vec!["Unknown command: sw-ventline.fly"]);
    }

    #[tokio::test]
    async fn test_invalid_json_is_single_error() {
        let (_mock, dispatcher) = dispatcher();
        let line = dispatcher.handle_line("{not json").await;
        let responses: Vec<CommandResponse> = serde_json::from_str(&line).unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].status, Status::Error);
        assert!(responses[0].value[0].starts_with("Invalid request"));
    }

    #[tokio::test]
    async fn test_controller_switches_log_file() {
        let dir = TempDir::new().unwrap();
        let switch = LogSwitch::open(dir.path(), "log_controlserver.txt").unwrap();
        let (mock, dispatcher) = dispatcher();
        let dispatcher = dispatcher.with_log_switch(switch.clone());

        let responses = dispatcher
            .execute(vec![
                CommandRequest::new("controller", "startnew", Some(vec!["run-7.txt".into()])),
                CommandRequest::new("sw-ventline", "get_curr_setp", None),
            ])
            .await;
        assert!(responses[0].is_ok());
        assert_eq!(responses[0].dev, "controller");
        assert_eq!(switch.active_path(), dir.path().join("run-7.txt"));
        assert_eq!(responses[1].status, Status::Error);

        let responses = dispatcher
            .execute(vec![CommandRequest::new("controller", "stoplog", None)])
            .await;
        assert_eq!(
            responses[0].value,
            vec![dir.path().join("log_controlserver.txt").display().to_string()]
        );
        // Missing file name still answers OK
        let responses = dispatcher
            .execute(vec![CommandRequest::new("controller", "startnew", None)])
            .await;
        assert!(responses[0].is_ok());
        assert!(mock.events().is_empty());
    }
}
