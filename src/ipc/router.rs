use crate::utf8_safe::ellipsize;
use serde_json::{json, Value};
use std::io::{Read, Write};
use tracing::{debug, info, warn};

use super::protocol::{
    ErrorCode, InitializeInfo, Method, Notification, Request, RequestId, ON_INPUT_COMMAND,
    PROTOCOL_VERSION,
};
use super::session::{CommandResult, Plugin};

/// Whether the run loop keeps reading after a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Flow {
    Continue,
    Stop,
}

pub(super) fn dispatch<R: Read, W: Write>(plugin: &mut Plugin<R, W>, request: Request) -> Flow {
    let method = request.method();
    debug!(method = method.as_str(), id = ?request.id, "received request");

    if method == Method::Shutdown {
        info!("received shutdown request");
        return Flow::Stop;
    }
    if let Method::Other(name) = &method {
        debug!(method = %name, "ignoring unrecognized method");
        return Flow::Continue;
    }
    let Some(id) = request.request_id() else {
        warn!(method = method.as_str(), id = ?request.id, "dropping request without an integer id");
        return Flow::Continue;
    };

    match method {
        Method::Ping => handle_ping(plugin, id, &request),
        Method::Initialize => handle_initialize(plugin, id, &request),
        Method::Execute => handle_execute(plugin, id, &request),
        Method::Input => handle_input(plugin, id, &request),
        Method::Shutdown | Method::Other(_) => {}
    }
    Flow::Continue
}

// ============================================================================
// Method Handlers
// ============================================================================

fn handle_ping<R: Read, W: Write>(plugin: &Plugin<R, W>, id: RequestId, request: &Request) {
    let timestamp = request.params.get("timestamp").cloned().unwrap_or(Value::Null);
    plugin.reply(id, json!({ "timestamp": timestamp }));
}

fn handle_initialize<R: Read, W: Write>(plugin: &Plugin<R, W>, id: RequestId, request: &Request) {
    let engine_version = request
        .params
        .get("engine_version")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    info!(engine_version, "initializing");

    let info = InitializeInfo {
        name: plugin.name.clone(),
        version: plugin.version.clone(),
        description: plugin.description.clone(),
        protocol_version: PROTOCOL_VERSION.to_string(),
        commands: plugin.command_infos(),
    };
    match serde_json::to_value(&info) {
        Ok(result) => plugin.reply(id, result),
        Err(err) => warn!("failed to encode initialize result: {err}"),
    }
}

fn handle_execute<R: Read, W: Write>(plugin: &mut Plugin<R, W>, id: RequestId, request: &Request) {
    let function = request.param_str("function").to_string();
    let arguments = request.param_object("arguments");
    info!(command = %function, request_id = id, "executing command");

    plugin.session.begin(id);
    plugin
        .session
        .attach_context(request.context(), request.system_info());
    match plugin.invoke(&function, arguments) {
        Some(outcome) => report_outcome(plugin, id, outcome),
        None => {
            warn!(command = %function, "unknown command");
            plugin.send(&Notification::Error {
                request_id: id,
                code: ErrorCode::MethodNotFound.code(),
                message: format!("Unknown command: {function}"),
            });
        }
    }
    plugin.session.finish();
}

fn handle_input<R: Read, W: Write>(plugin: &mut Plugin<R, W>, id: RequestId, request: &Request) {
    let content = request.param_str("content").to_string();
    info!(request_id = id, "received user input: {}", ellipsize(&content, 50));

    plugin.reply(id, json!({ "acknowledged": true }));

    plugin.session.begin(id);
    match plugin.invoke(ON_INPUT_COMMAND, json!({ "content": content })) {
        Some(outcome) => report_outcome(plugin, id, outcome),
        None => plugin.send(&Notification::Complete {
            request_id: id,
            success: true,
            data: Value::String(format!("Received: {content}")),
            keep_session: false,
        }),
    }
    plugin.session.finish();
}

fn report_outcome<R: Read, W: Write>(plugin: &Plugin<R, W>, id: RequestId, outcome: CommandResult) {
    match outcome {
        Ok(data) => plugin.send(&Notification::Complete {
            request_id: id,
            success: true,
            data,
            keep_session: plugin.session.keep_session(),
        }),
        Err(err) => {
            let message = format!("{err:#}");
            warn!(request_id = id, "command failed: {message}");
            plugin.send(&Notification::Error {
                request_id: id,
                code: ErrorCode::PluginError.code(),
                message,
            });
        }
    }
}
