//! JSON-RPC 2.0 message types exchanged between the host engine and a plugin.
//!
//! Every frame on the wire carries one JSON object. Requests flow from the
//! engine to the plugin; responses and notifications flow back.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

// ============================================================================
// Wire Constants
// ============================================================================

/// Largest payload accepted in either direction (10 MiB).
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Size of the big-endian length prefix in front of every payload.
pub const HEADER_SIZE: usize = 4;

pub const JSONRPC_VERSION: &str = "2.0";

/// Plugin protocol revision reported by `initialize`.
pub const PROTOCOL_VERSION: &str = "2.0";

/// Reserved command name that receives passthrough input.
pub const ON_INPUT_COMMAND: &str = "on_input";

// Host-side timing budgets.
pub const PING_TIMEOUT_MS: u64 = 1_000;
pub const INPUT_ACK_TIMEOUT_MS: u64 = 2_000;
pub const EXECUTE_TIMEOUT_MS: u64 = 30_000;
pub const PING_INTERVAL_MS: u64 = 2_000;
pub const HEARTBEAT_TIMEOUT_MS: u64 = 5_000;

pub type RequestId = i64;

// ============================================================================
// Error Codes
// ============================================================================

/// Error codes carried in `error` notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    PluginError,
    Timeout,
    RateLimited,
}

impl ErrorCode {
    pub fn code(self) -> i64 {
        match self {
            ErrorCode::ParseError => -32700,
            ErrorCode::InvalidRequest => -32600,
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::InvalidParams => -32602,
            ErrorCode::InternalError => -32603,
            ErrorCode::PluginError => -1,
            ErrorCode::Timeout => -2,
            ErrorCode::RateLimited => -3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            -32700 => Some(ErrorCode::ParseError),
            -32600 => Some(ErrorCode::InvalidRequest),
            -32601 => Some(ErrorCode::MethodNotFound),
            -32602 => Some(ErrorCode::InvalidParams),
            -32603 => Some(ErrorCode::InternalError),
            -1 => Some(ErrorCode::PluginError),
            -2 => Some(ErrorCode::Timeout),
            -3 => Some(ErrorCode::RateLimited),
            _ => None,
        }
    }
}

// ============================================================================
// Requests (engine → plugin)
// ============================================================================

/// Methods the plugin runtime understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Ping,
    Initialize,
    Execute,
    Input,
    Shutdown,
    Other(String),
}

impl Method {
    pub fn parse(name: &str) -> Self {
        match name {
            "ping" => Method::Ping,
            "initialize" => Method::Initialize,
            "execute" => Method::Execute,
            "input" => Method::Input,
            "shutdown" => Method::Shutdown,
            other => Method::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::Ping => "ping",
            Method::Initialize => "initialize",
            Method::Execute => "execute",
            Method::Input => "input",
            Method::Shutdown => "shutdown",
            Method::Other(name) => name,
        }
    }
}

/// An inbound JSON-RPC request envelope.
///
/// `id` stays raw until a handler needs it, so `shutdown` is honoured
/// whatever its id looks like.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn method(&self) -> Method {
        Method::parse(&self.method)
    }

    /// The id as an integer; `None` when missing or of another type.
    pub fn request_id(&self) -> Option<RequestId> {
        self.id.as_ref().and_then(Value::as_i64)
    }

    /// `params.context`, skipping entries that are not role/content objects.
    pub fn context(&self) -> Vec<ContextMessage> {
        self.params
            .get("context")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| serde_json::from_value(item.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `params.system_info`, `None` when missing or blank.
    pub fn system_info(&self) -> Option<String> {
        self.params
            .get("system_info")
            .and_then(Value::as_str)
            .filter(|info| !info.trim().is_empty())
            .map(str::to_string)
    }

    /// String parameter, empty when missing or not a string.
    pub fn param_str(&self, key: &str) -> &str {
        self.params.get(key).and_then(Value::as_str).unwrap_or("")
    }

    /// Object parameter, `{}` when missing or null.
    pub fn param_object(&self, key: &str) -> Value {
        match self.params.get(key) {
            Some(Value::Null) | None => Value::Object(Map::new()),
            Some(value) => value.clone(),
        }
    }
}

/// One turn of the engine's conversation history, sent with `execute`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContextMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
}

impl ContextMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Builds a request frame as the engine would send it.
pub fn request(id: RequestId, method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "method": method,
        "params": params,
    })
}

pub fn initialize_request(id: RequestId, engine_version: &str) -> Value {
    request(
        id,
        "initialize",
        json!({ "protocol_version": PROTOCOL_VERSION, "engine_version": engine_version }),
    )
}

pub fn execute_request(id: RequestId, function: &str, arguments: Value) -> Value {
    execute_request_with_context(id, function, arguments, &[], None)
}

/// `execute` carrying conversation history and a system description.
/// Empty history and `None` are left out of `params`.
pub fn execute_request_with_context(
    id: RequestId,
    function: &str,
    arguments: Value,
    context: &[ContextMessage],
    system_info: Option<&str>,
) -> Value {
    let mut params = Map::new();
    params.insert("function".to_string(), json!(function));
    params.insert("arguments".to_string(), arguments);
    if !context.is_empty() {
        params.insert("context".to_string(), json!(context));
    }
    if let Some(info) = system_info {
        params.insert("system_info".to_string(), json!(info));
    }
    request(id, "execute", Value::Object(params))
}

pub fn input_request(id: RequestId, content: &str, timestamp: u64) -> Value {
    request(
        id,
        "input",
        json!({ "content": content, "timestamp": timestamp }),
    )
}

pub fn ping_request(id: RequestId, timestamp: u64) -> Value {
    request(id, "ping", json!({ "timestamp": timestamp }))
}

pub fn shutdown_request(id: RequestId) -> Value {
    request(id, "shutdown", json!({}))
}

// ============================================================================
// Responses and Notifications (plugin → engine)
// ============================================================================

/// A direct reply correlated by `id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub result: Value,
}

/// Severity attached to `log` notifications.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// Notifications carry no `id`; `request_id` inside `params` correlates them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum Notification {
    Stream {
        request_id: RequestId,
        data: String,
    },
    Complete {
        request_id: RequestId,
        success: bool,
        data: Value,
        keep_session: bool,
    },
    Error {
        request_id: RequestId,
        code: i64,
        message: String,
    },
    Log {
        level: LogLevel,
        message: String,
    },
}

impl Notification {
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Notification::Stream { request_id, .. }
            | Notification::Complete { request_id, .. }
            | Notification::Error { request_id, .. } => Some(*request_id),
            Notification::Log { .. } => None,
        }
    }
}

/// One registered command as listed by `initialize`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// `initialize` result payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InitializeInfo {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    pub protocol_version: String,
    #[serde(default)]
    pub commands: Vec<CommandInfo>,
}

// ============================================================================
// Classification
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
    Notification,
    Unknown,
}

pub fn classify_message(message: &Value) -> MessageKind {
    if message.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return MessageKind::Unknown;
    }
    let has_id = message.get("id").is_some();
    let has_method = message.get("method").is_some();
    let has_outcome = message.get("result").is_some() || message.get("error").is_some();

    match (has_method, has_id, has_outcome) {
        (false, true, true) => MessageKind::Response,
        (true, true, _) => MessageKind::Request,
        (true, false, _) => MessageKind::Notification,
        _ => MessageKind::Unknown,
    }
}
