pub mod config;
pub mod host;
pub mod ipc;
mod lock;
pub mod telemetry;
pub mod utf8_safe;

pub(crate) use lock::{into_inner_or_recover, lock_or_recover};
pub use ipc::{
    CommandContext, CommandHandler, CommandResult, ContextMessage, ErrorCode, LogLevel, Plugin, StopReason,
};
