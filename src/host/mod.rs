//! Engine side of the plugin protocol.
//!
//! Used by the `plugin-host` emulator and by integration tests to launch a
//! plugin, talk to it, and read its manifest.

pub mod client;
pub mod manifest;
pub mod process;

#[cfg(test)]
mod tests;

pub use client::{HostError, HostState, PluginClient, PluginResponse};
pub use manifest::{
    discover_plugins, validate_plugin_name, FunctionDefinition, ManifestError,
    ParameterDefinition, PluginManifest,
};
pub use process::{pump_frames, LaunchCommand, PluginProcess};
