//! Command-line parsing and validation helpers.

mod defaults;
mod validation;

use clap::builder::BoolishValueParser;
use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

pub use defaults::{
    DEFAULT_ENGINE_VERSION, DEFAULT_LOG_LEVEL, DEFAULT_PLUGINS_DIR, DEFAULT_TIMEOUT_MS,
    LOG_LEVELS, MAX_TIMEOUT_MS, MIN_TIMEOUT_MS,
};

/// Logging flags shared by plugin binaries and the host.
#[derive(Debug, Args, Clone)]
pub struct LogArgs {
    /// Log file path (defaults to <temp>/<name>.log)
    #[arg(long = "log-file", env = "GASSIST_PLUGIN_LOG", value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Log verbosity: error, warn, info, debug, trace
    #[arg(long = "log-level", default_value = DEFAULT_LOG_LEVEL)]
    pub log_level: String,

    /// Write log lines as JSON
    #[arg(long = "log-json", default_value_t = false)]
    pub log_json: bool,

    /// Disable the log file entirely
    #[arg(
        long = "no-logs",
        env = "GASSIST_NO_LOGS",
        default_value_t = false,
        action = ArgAction::SetTrue,
        value_parser = BoolishValueParser::new()
    )]
    pub no_logs: bool,
}

/// CLI options for a plugin binary. Stdout is reserved for protocol frames.
#[derive(Debug, Parser, Clone)]
#[command(author, version)]
pub struct PluginConfig {
    #[command(flatten)]
    pub log: LogArgs,
}

/// CLI options for the plugin host emulator.
#[derive(Debug, Parser, Clone)]
#[command(about = "G-Assist plugin host emulator", author, version)]
pub struct HostConfig {
    /// Directory holding one subdirectory per plugin
    #[arg(long = "plugins-dir", env = "GASSIST_PLUGINS_DIR", default_value = DEFAULT_PLUGINS_DIR)]
    pub plugins_dir: PathBuf,

    /// How long to wait for a command to finish (milliseconds)
    #[arg(long = "timeout-ms", default_value_t = DEFAULT_TIMEOUT_MS)]
    pub timeout_ms: u64,

    /// Print stream chunks and protocol details as they arrive
    #[arg(long, short = 'v', default_value_t = false)]
    pub verbose: bool,

    /// Engine version reported to plugins during initialize
    #[arg(long = "engine-version", default_value = DEFAULT_ENGINE_VERSION)]
    pub engine_version: String,

    #[command(flatten)]
    pub log: LogArgs,

    #[command(subcommand)]
    pub command: HostCommand,
}

#[derive(Debug, Subcommand, Clone, PartialEq, Eq)]
pub enum HostCommand {
    /// List plugins found in the plugins directory
    List,
    /// Run one function and print the result
    Exec {
        plugin: String,
        function: String,
        /// Function arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
        /// System description passed along with `execute`
        #[arg(long = "system-info", value_name = "TEXT")]
        system_info: Option<String>,
    },
    /// Run a function, then keep forwarding stdin lines while the plugin asks for input
    Chat {
        plugin: String,
        function: String,
        /// Function arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
        /// System description passed along with `execute`
        #[arg(long = "system-info", value_name = "TEXT")]
        system_info: Option<String>,
    },
    /// Measure a ping round trip
    Ping { plugin: String },
}
