use crate::ipc::protocol::EXECUTE_TIMEOUT_MS;

pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_PLUGINS_DIR: &str = "./plugins";
pub const DEFAULT_ENGINE_VERSION: &str = "emulator";
pub const DEFAULT_TIMEOUT_MS: u64 = EXECUTE_TIMEOUT_MS;
pub const MIN_TIMEOUT_MS: u64 = 100;
pub const MAX_TIMEOUT_MS: u64 = 600_000;

pub const LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];
