use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde_json::Value;
use std::collections::VecDeque;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

use crate::ipc::protocol::{
    execute_request_with_context, initialize_request, input_request, ping_request,
    shutdown_request, ContextMessage, InitializeInfo, LogLevel, Notification, RequestId,
    EXECUTE_TIMEOUT_MS, HEARTBEAT_TIMEOUT_MS, INPUT_ACK_TIMEOUT_MS, PING_INTERVAL_MS,
    PING_TIMEOUT_MS,
};
use crate::ipc::transport::{write_frame, TransportError};

use super::manifest::ManifestError;

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("timed out after {} ms waiting for {what}", .waited.as_millis())]
    Timeout { what: &'static str, waited: Duration },
    #[error("plugin closed its output")]
    Disconnected,
    #[error("plugin is not awaiting input")]
    NotAwaitingInput,
    #[error("plugin has been stopped")]
    Stopped,
    #[error("plugin sent an unexpected reply: {0}")]
    Protocol(String),
    #[error("plugin executable not found: {}", .0.display())]
    ExecutableNotFound(PathBuf),
    #[error("failed to launch '{program}': {source}")]
    Spawn { program: String, source: io::Error },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

/// Host-side view of the plugin's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Ready,
    Executing,
    AwaitingInput,
    Stopped,
}

/// Outcome of one `execute` or `input` exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginResponse {
    pub success: bool,
    /// Stream chunks concatenated, followed by a string `complete.data`.
    pub message: String,
    pub data: Value,
    pub awaiting_input: bool,
    pub error_code: Option<i64>,
}

impl PluginResponse {
    fn empty() -> Self {
        Self {
            success: false,
            message: String::new(),
            data: Value::Null,
            awaiting_input: false,
            error_code: None,
        }
    }
}

/// Engine side of the protocol.
///
/// Requests are written straight to `writer`; everything the plugin sends
/// arrives already decoded on `inbound` (see [`super::process::pump_frames`]).
pub struct PluginClient<W: Write> {
    writer: Option<W>,
    inbound: Receiver<Value>,
    // Notifications that showed up while waiting for a direct reply.
    backlog: VecDeque<Value>,
    next_id: RequestId,
    timeout: Duration,
    state: HostState,
    // Any inbound message counts as a heartbeat.
    started: Instant,
    last_heartbeat: Option<Instant>,
    ping_interval: Duration,
    heartbeat_timeout: Duration,
}

impl<W: Write> PluginClient<W> {
    pub fn new(writer: W, inbound: Receiver<Value>) -> Self {
        Self {
            writer: Some(writer),
            inbound,
            backlog: VecDeque::new(),
            next_id: 1,
            timeout: Duration::from_millis(EXECUTE_TIMEOUT_MS),
            state: HostState::Ready,
            started: Instant::now(),
            last_heartbeat: None,
            ping_interval: Duration::from_millis(PING_INTERVAL_MS),
            heartbeat_timeout: Duration::from_millis(HEARTBEAT_TIMEOUT_MS),
        }
    }

    /// Budget for `execute`/`input` to reach `complete` or `error`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override how often a quiet plugin should be pinged and when it counts as lost.
    pub fn with_heartbeat(mut self, ping_interval: Duration, heartbeat_timeout: Duration) -> Self {
        self.ping_interval = ping_interval;
        self.heartbeat_timeout = heartbeat_timeout;
        self
    }

    /// Time since the plugin last sent anything, or since the client was created.
    pub fn heartbeat_age(&self) -> Duration {
        self.last_heartbeat.unwrap_or(self.started).elapsed()
    }

    /// The plugin has been quiet long enough that a ping is due.
    pub fn needs_ping(&self) -> bool {
        self.heartbeat_age() >= self.ping_interval
    }

    pub fn is_heartbeat_expired(&self) -> bool {
        self.heartbeat_age() > self.heartbeat_timeout
    }

    pub fn state(&self) -> HostState {
        self.state
    }

    pub fn is_awaiting_input(&self) -> bool {
        self.state == HostState::AwaitingInput
    }

    pub fn initialize(&mut self, engine_version: &str) -> Result<InitializeInfo, HostError> {
        let id = self.allocate_id();
        self.send(&initialize_request(id, engine_version))?;
        let result = self.wait_reply(id, "initialize", Duration::from_millis(EXECUTE_TIMEOUT_MS))?;
        let info: InitializeInfo = serde_json::from_value(result)
            .map_err(|err| HostError::Protocol(format!("bad initialize result: {err}")))?;
        info!(
            plugin = %info.name,
            version = %info.version,
            commands = info.commands.len(),
            "plugin initialized"
        );
        Ok(info)
    }

    /// Round-trip time of one ping.
    pub fn ping(&mut self, timestamp: u64) -> Result<Duration, HostError> {
        let id = self.allocate_id();
        let started = Instant::now();
        self.send(&ping_request(id, timestamp))?;
        let result = self.wait_reply(id, "ping", Duration::from_millis(PING_TIMEOUT_MS))?;
        if result.get("timestamp").and_then(Value::as_u64) != Some(timestamp) {
            warn!(expected = timestamp, got = %result, "ping echoed a different timestamp");
        }
        Ok(started.elapsed())
    }

    pub fn execute(
        &mut self,
        function: &str,
        arguments: Value,
        on_stream: impl FnMut(&str),
    ) -> Result<PluginResponse, HostError> {
        self.execute_with_context(function, arguments, &[], None, on_stream)
    }

    /// `execute` with conversation history and an optional system description.
    pub fn execute_with_context(
        &mut self,
        function: &str,
        arguments: Value,
        context: &[ContextMessage],
        system_info: Option<&str>,
        on_stream: impl FnMut(&str),
    ) -> Result<PluginResponse, HostError> {
        if self.state == HostState::Stopped {
            return Err(HostError::Stopped);
        }
        let id = self.allocate_id();
        debug!(request_id = id, function, context = context.len(), "sending execute");
        self.send(&execute_request_with_context(
            id,
            function,
            arguments,
            context,
            system_info,
        ))?;
        self.state = HostState::Executing;
        self.collect(id, on_stream)
    }

    /// Forward one user message to a plugin that asked to keep the session.
    pub fn send_input(
        &mut self,
        content: &str,
        on_stream: impl FnMut(&str),
    ) -> Result<PluginResponse, HostError> {
        match self.state {
            HostState::AwaitingInput => {}
            HostState::Stopped => return Err(HostError::Stopped),
            HostState::Ready | HostState::Executing => return Err(HostError::NotAwaitingInput),
        }
        let id = self.allocate_id();
        self.send(&input_request(id, content, unix_millis()))?;
        self.state = HostState::Executing;

        let ack = match self.wait_reply(id, "input ack", Duration::from_millis(INPUT_ACK_TIMEOUT_MS))
        {
            Ok(ack) => ack,
            Err(err) => {
                self.state = HostState::Ready;
                return Err(err);
            }
        };
        if ack.get("acknowledged").and_then(Value::as_bool) != Some(true) {
            warn!(request_id = id, %ack, "input reply did not acknowledge");
        }
        self.collect(id, on_stream)
    }

    /// Ask the plugin to exit and close its stdin.
    pub fn shutdown(&mut self) -> Result<(), HostError> {
        if self.state == HostState::Stopped {
            return Ok(());
        }
        let id = self.allocate_id();
        let sent = self.send(&shutdown_request(id));
        self.state = HostState::Stopped;
        self.writer = None;
        sent
    }

    fn allocate_id(&mut self) -> RequestId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn send(&mut self, message: &Value) -> Result<(), HostError> {
        let writer = self.writer.as_mut().ok_or(HostError::Stopped)?;
        write_frame(writer, message)?;
        Ok(())
    }

    fn recv_until(
        &mut self,
        deadline: Instant,
        what: &'static str,
        waited: Duration,
    ) -> Result<Value, HostError> {
        match self.inbound.recv_deadline(deadline) {
            Ok(message) => {
                self.last_heartbeat = Some(Instant::now());
                Ok(message)
            }
            Err(RecvTimeoutError::Timeout) => Err(HostError::Timeout { what, waited }),
            Err(RecvTimeoutError::Disconnected) => Err(HostError::Disconnected),
        }
    }

    /// Wait for the direct reply to `id`, parking notifications for later.
    fn wait_reply(&mut self, id: RequestId, what: &'static str, budget: Duration) -> Result<Value, HostError> {
        let deadline = Instant::now() + budget;
        loop {
            let message = self.recv_until(deadline, what, budget)?;
            if message.get("method").is_some() {
                self.backlog.push_back(message);
                continue;
            }
            match message.get("id").and_then(Value::as_i64) {
                Some(reply_id) if reply_id == id => {
                    if let Some(err) = message.get("error") {
                        return Err(HostError::Protocol(err.to_string()));
                    }
                    return Ok(message.get("result").cloned().unwrap_or(Value::Null));
                }
                other => debug!(expected = id, got = ?other, "skipping stale reply"),
            }
        }
    }

    /// Gather notifications for `id` until `complete` or `error`.
    fn collect(
        &mut self,
        id: RequestId,
        mut on_stream: impl FnMut(&str),
    ) -> Result<PluginResponse, HostError> {
        let timeout = self.timeout;
        let deadline = Instant::now() + timeout;
        let mut response = PluginResponse::empty();
        loop {
            let message = match self.backlog.pop_front() {
                Some(message) => message,
                None => match self.recv_until(deadline, "command result", timeout) {
                    Ok(message) => message,
                    Err(err) => {
                        self.state = HostState::Ready;
                        return Err(err);
                    }
                },
            };
            if message.get("method").is_none() {
                debug!(%message, "skipping reply while collecting results");
                continue;
            }
            let notification: Notification = match serde_json::from_value(message) {
                Ok(notification) => notification,
                Err(err) => {
                    warn!("skipping notification: {err}");
                    continue;
                }
            };
            if let Notification::Log { level, message } = &notification {
                forward_log(*level, message);
                continue;
            }
            if notification.request_id() != Some(id) {
                debug!(expected = id, got = ?notification.request_id(), "skipping notification for another request");
                continue;
            }

            match notification {
                Notification::Stream { data, .. } => {
                    if !data.is_empty() {
                        on_stream(&data);
                        response.message.push_str(&data);
                    }
                }
                Notification::Complete {
                    success,
                    data,
                    keep_session,
                    ..
                } => {
                    if let Some(text) = data.as_str() {
                        response.message.push_str(text);
                    }
                    response.success = success;
                    response.data = data;
                    response.awaiting_input = keep_session;
                    self.state = if keep_session {
                        HostState::AwaitingInput
                    } else {
                        HostState::Ready
                    };
                    return Ok(response);
                }
                Notification::Error { code, message, .. } => {
                    error!(request_id = id, code, "plugin reported an error: {message}");
                    response.success = false;
                    response.message = message;
                    response.error_code = Some(code);
                    self.state = HostState::Ready;
                    return Ok(response);
                }
                Notification::Log { .. } => {}
            }
        }
    }
}

fn forward_log(level: LogLevel, message: &str) {
    match level {
        LogLevel::Debug => debug!(target: "plugin", "{message}"),
        LogLevel::Info => info!(target: "plugin", "{message}"),
        LogLevel::Warning => warn!(target: "plugin", "{message}"),
        LogLevel::Error => error!(target: "plugin", "{message}"),
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
