//! Plugin side of the length-prefixed JSON-RPC protocol.
//!
//! The engine launches a plugin as a child process and talks to it over
//! stdin/stdout. Everything here runs on one thread:
//! - Transport: frames one JSON object per message
//! - Router: turns each request into replies and notifications
//! - Session: owns the command table and the receive/dispatch loop
//!
//! Protocol:
//! - Each frame is a 4-byte big-endian length followed by JSON
//! - Requests (engine → plugin): `ping`, `initialize`, `execute`, `input`, `shutdown`
//! - Notifications (plugin → engine): `stream`, `complete`, `error`, `log`

pub mod protocol;
mod router;
mod session;
pub mod transport;


pub use protocol::{
    CommandInfo, ContextMessage, ErrorCode, InitializeInfo, LogLevel, Method, Notification, Request, RequestId,
    Response, MAX_MESSAGE_SIZE,
};
pub use session::{
    CommandContext, CommandHandler, CommandResult, Plugin, RuntimeState, SessionState, StopReason,
};
pub use transport::{MessageSink, StdioTransport, Transport, TransportError};
