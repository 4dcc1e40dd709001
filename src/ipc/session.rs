use anyhow::anyhow;
use serde_json::{json, Value};
use std::any::Any;
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, info, warn};

use super::protocol::{CommandInfo, ContextMessage, LogLevel, Notification, Request, RequestId};
use super::router::{dispatch, Flow};
use super::transport::{MessageSink, StdioTransport, Transport, TransportError};

/// What a command handler hands back: a JSON result or a failure message.
pub type CommandResult = anyhow::Result<Value>;

// ============================================================================
// Command Handlers
// ============================================================================

/// A named unit of plugin functionality.
///
/// Closures of the shape `FnMut(&mut CommandContext, Value) -> CommandResult`
/// implement this automatically.
pub trait CommandHandler {
    fn invoke(&mut self, ctx: &mut CommandContext<'_>, arguments: Value) -> CommandResult;
}

impl<F> CommandHandler for F
where
    F: FnMut(&mut CommandContext<'_>, Value) -> CommandResult,
{
    fn invoke(&mut self, ctx: &mut CommandContext<'_>, arguments: Value) -> CommandResult {
        self(ctx, arguments)
    }
}

pub(super) struct RegisteredCommand {
    pub(super) description: String,
    pub(super) handler: Box<dyn CommandHandler>,
}

// ============================================================================
// Session State
// ============================================================================

/// Per-request state, reset at the start of every `execute`/`input`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionState {
    current_request_id: Option<RequestId>,
    keep_session: bool,
    context: Vec<ContextMessage>,
    system_info: Option<String>,
}

impl SessionState {
    pub(super) fn begin(&mut self, request_id: RequestId) {
        self.current_request_id = Some(request_id);
        self.keep_session = false;
        self.context.clear();
        self.system_info = None;
    }

    pub(super) fn attach_context(
        &mut self,
        context: Vec<ContextMessage>,
        system_info: Option<String>,
    ) {
        self.context = context;
        self.system_info = system_info;
    }

    pub(super) fn finish(&mut self) {
        self.current_request_id = None;
        self.context.clear();
        self.system_info = None;
    }

    /// Id of the request whose handler is running, if any.
    pub fn current_request_id(&self) -> Option<RequestId> {
        self.current_request_id
    }

    pub fn keep_session(&self) -> bool {
        self.keep_session
    }

    /// Conversation history the engine sent with the running `execute`.
    pub fn context(&self) -> &[ContextMessage] {
        &self.context
    }

    pub fn system_info(&self) -> Option<&str> {
        self.system_info.as_deref()
    }

    pub fn set_keep_session(&mut self, keep: bool) {
        self.keep_session = keep;
    }
}

/// Handle given to a command while it runs.
pub struct CommandContext<'a> {
    sink: &'a dyn MessageSink,
    session: &'a mut SessionState,
}

impl<'a> CommandContext<'a> {
    pub(super) fn new(sink: &'a dyn MessageSink, session: &'a mut SessionState) -> Self {
        Self { sink, session }
    }

    pub fn request_id(&self) -> Option<RequestId> {
        self.session.current_request_id()
    }

    /// Send partial output for the running request.
    pub fn stream(&self, data: impl Into<String>) {
        stream_to(self.sink, &*self.session, data.into());
    }

    /// Ask the engine to route the next user message to `on_input`.
    pub fn set_keep_session(&mut self, keep: bool) {
        self.session.set_keep_session(keep);
    }

    pub fn keep_session(&self) -> bool {
        self.session.keep_session()
    }

    /// Conversation history sent with this `execute`; empty for `input`.
    pub fn context(&self) -> &[ContextMessage] {
        self.session.context()
    }

    /// Free-form description of the user's system, when the engine sent one.
    pub fn system_info(&self) -> Option<&str> {
        self.session.system_info()
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        send_notification(
            self.sink,
            &Notification::Log {
                level,
                message: message.into(),
            },
        );
    }
}

fn stream_to(sink: &dyn MessageSink, session: &SessionState, data: String) {
    let Some(request_id) = session.current_request_id() else {
        debug!("stream() called outside of command execution");
        return;
    };
    send_notification(sink, &Notification::Stream { request_id, data });
}

pub(super) fn send_notification(sink: &dyn MessageSink, notification: &Notification) {
    let message = match serde_json::to_value(notification) {
        Ok(message) => message,
        Err(err) => {
            warn!("failed to encode notification: {err}");
            return;
        }
    };
    send_value(sink, &message);
}

pub(super) fn send_value(sink: &dyn MessageSink, message: &Value) {
    if let Err(err) = sink.send_message(message) {
        // Oversized frames and closed pipes are dropped; the loop keeps going.
        warn!("dropping outbound message: {err}");
    }
}

// ============================================================================
// Plugin Runtime
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Idle,
    Dispatching,
    Stopped,
}

/// Why [`Plugin::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Shutdown,
    TransportClosed,
}

/// A plugin process: metadata, command table, transport, and session state.
pub struct Plugin<R = io::Stdin, W = io::Stdout> {
    pub(super) name: String,
    pub(super) version: String,
    pub(super) description: String,
    pub(super) commands: BTreeMap<String, RegisteredCommand>,
    pub(super) transport: Transport<R, W>,
    pub(super) session: SessionState,
    pub(super) state: RuntimeState,
}

impl Plugin {
    /// A plugin speaking over the process's stdin/stdout.
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Plugin::with_transport(name, version, description, StdioTransport::stdio())
    }
}

impl<R: Read, W: Write> Plugin<R, W> {
    pub fn with_transport(
        name: impl Into<String>,
        version: impl Into<String>,
        description: impl Into<String>,
        transport: Transport<R, W>,
    ) -> Self {
        let plugin = Self {
            name: name.into(),
            version: version.into(),
            description: description.into(),
            commands: BTreeMap::new(),
            transport,
            session: SessionState::default(),
            state: RuntimeState::Idle,
        };
        info!(plugin = %plugin.name, version = %plugin.version, "plugin initialized");
        plugin
    }

    /// Register `handler` under `name`. A later registration replaces an earlier one.
    pub fn command<F>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: FnMut(&mut CommandContext<'_>, Value) -> CommandResult + 'static,
    {
        self.register_handler(name, "", handler)
    }

    pub fn command_with_description<F>(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        handler: F,
    ) -> &mut Self
    where
        F: FnMut(&mut CommandContext<'_>, Value) -> CommandResult + 'static,
    {
        self.register_handler(name, description, handler)
    }

    /// Register any [`CommandHandler`], e.g. a struct carrying its own state.
    pub fn register_handler<H>(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        handler: H,
    ) -> &mut Self
    where
        H: CommandHandler + 'static,
    {
        let name = name.into();
        debug!(command = %name, "registered command");
        self.commands.insert(
            name,
            RegisteredCommand {
                description: description.into(),
                handler: Box::new(handler),
            },
        );
        self
    }

    pub fn has_command(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    /// Registered commands in name order.
    pub fn command_infos(&self) -> Vec<CommandInfo> {
        self.commands
            .iter()
            .map(|(name, command)| CommandInfo {
                name: name.clone(),
                description: command.description.clone(),
            })
            .collect()
    }

    /// Send partial output for the in-flight request. No-op between requests.
    pub fn stream(&self, data: impl Into<String>) {
        stream_to(&self.transport, &self.session, data.into());
    }

    pub fn set_keep_session(&mut self, keep: bool) {
        self.session.set_keep_session(keep);
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        send_notification(
            &self.transport,
            &Notification::Log {
                level,
                message: message.into(),
            },
        );
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn state(&self) -> RuntimeState {
        self.state
    }

    pub fn transport(&self) -> &Transport<R, W> {
        &self.transport
    }

    pub fn into_transport(self) -> Transport<R, W> {
        self.transport
    }

    /// Receive and dispatch requests until `shutdown` or the pipe closes.
    ///
    /// Handlers run inline on this thread, one request at a time.
    pub fn run(&mut self) -> StopReason {
        info!(plugin = %self.name, "starting plugin main loop");
        let reason = loop {
            self.state = RuntimeState::Idle;
            let message = match self.transport.read_message() {
                Ok(message) => message,
                Err(err) if err.is_fatal() => {
                    match err {
                        TransportError::Closed => info!("engine closed the pipe"),
                        other => warn!("transport failed: {other}"),
                    }
                    break StopReason::TransportClosed;
                }
                Err(err) => {
                    warn!("skipping frame: {err}");
                    continue;
                }
            };

            let request = match Request::from_value(message) {
                Ok(request) => request,
                Err(err) => {
                    warn!("skipping message that is not a request: {err}");
                    continue;
                }
            };

            self.state = RuntimeState::Dispatching;
            if dispatch(self, request) == Flow::Stop {
                self.transport.close();
                break StopReason::Shutdown;
            }
        };
        self.state = RuntimeState::Stopped;
        self.session = SessionState::default();
        info!(plugin = %self.name, ?reason, "plugin stopped");
        reason
    }

    /// Run the named command, containing panics. `None` when it isn't registered.
    pub(super) fn invoke(&mut self, name: &str, arguments: Value) -> Option<CommandResult> {
        let command = self.commands.get_mut(name)?;
        let mut ctx = CommandContext::new(&self.transport, &mut self.session);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            command.handler.invoke(&mut ctx, arguments)
        }));
        Some(outcome.unwrap_or_else(|payload| {
            Err(anyhow!(
                "command '{name}' panicked: {}",
                panic_message(payload.as_ref())
            ))
        }))
    }

    pub(super) fn send(&self, notification: &Notification) {
        send_notification(&self.transport, notification);
    }

    pub(super) fn reply(&self, id: RequestId, result: Value) {
        send_value(&self.transport, &json!({ "id": id, "result": result }));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
