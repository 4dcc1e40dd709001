//! Host emulator: launches plugins from a plugins directory and drives them
//! over the same pipe protocol the engine uses.
//!
//! - `list`: print discovered plugins and their declared functions
//! - `exec`: run one function and print the result
//! - `chat`: run a function, then forward stdin lines while the plugin keeps the session
//! - `ping`: report the round-trip time of one ping

mod commands;

use anyhow::Result;
use gassist_plugin_sdk::config::{HostCommand, HostConfig};
use gassist_plugin_sdk::telemetry::init_tracing;
use tracing::info;

fn main() -> Result<()> {
    let config = HostConfig::parse_args()?;
    init_tracing(&config.log_settings());
    info!(plugins_dir = %config.plugins_dir.display(), "plugin host starting");

    match &config.command {
        HostCommand::List => commands::list(&config),
        HostCommand::Exec { plugin, function, .. } => {
            commands::exec(&config, plugin, function, config.command.arguments()?)
        }
        HostCommand::Chat { plugin, function, .. } => {
            commands::chat(&config, plugin, function, config.command.arguments()?)
        }
        HostCommand::Ping { plugin } => commands::ping(&config, plugin),
    }
}
