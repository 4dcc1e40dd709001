use super::defaults::{LOG_LEVELS, MAX_TIMEOUT_MS, MIN_TIMEOUT_MS};
use super::{HostCommand, HostConfig, LogArgs, PluginConfig};
use crate::host::manifest::validate_plugin_name;
use crate::telemetry::{default_log_path, parse_level, LogSettings, LOG_MAX_BYTES};
use anyhow::{bail, Context, Result};
use clap::Parser;
use serde_json::Value;
use std::time::Duration;

impl LogArgs {
    pub fn validate(&self) -> Result<()> {
        if parse_level(&self.log_level).is_none() {
            bail!(
                "--log-level must be one of {LOG_LEVELS:?}, got '{}'",
                self.log_level
            );
        }
        if let Some(path) = &self.log_file {
            if path.as_os_str().is_empty() {
                bail!("--log-file cannot be empty");
            }
            if path.is_dir() {
                bail!("--log-file '{}' is a directory", path.display());
            }
        }
        Ok(())
    }

    /// Resolve into tracing settings for a process called `name`.
    pub fn settings(&self, name: &str) -> LogSettings {
        LogSettings {
            enabled: !self.no_logs,
            path: self
                .log_file
                .clone()
                .unwrap_or_else(|| default_log_path(name)),
            level: parse_level(&self.log_level).unwrap_or(tracing::Level::INFO),
            json: self.log_json,
            max_bytes: LOG_MAX_BYTES,
        }
    }
}

impl PluginConfig {
    /// Parse CLI arguments and validate them right away.
    pub fn parse_args() -> Result<Self> {
        let mut config = Self::parse();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&mut self) -> Result<()> {
        self.log.validate()
    }

    pub fn log_settings(&self, name: &str) -> LogSettings {
        self.log.settings(name)
    }
}

impl HostConfig {
    /// Parse CLI arguments and validate them right away.
    pub fn parse_args() -> Result<Self> {
        let mut config = Self::parse();
        config.validate()?;
        Ok(config)
    }

    /// Check CLI values before any plugin is launched.
    pub fn validate(&mut self) -> Result<()> {
        self.log.validate()?;

        if !(MIN_TIMEOUT_MS..=MAX_TIMEOUT_MS).contains(&self.timeout_ms) {
            bail!(
                "--timeout-ms must be between {MIN_TIMEOUT_MS} and {MAX_TIMEOUT_MS}, got {}",
                self.timeout_ms
            );
        }
        if self.engine_version.trim().is_empty() {
            bail!("--engine-version cannot be empty");
        }
        if let Some(plugin) = self.command.plugin() {
            validate_plugin_name(plugin)?;
        }
        if let Some(function) = self.command.function() {
            if function.trim().is_empty() {
                bail!("function name cannot be empty");
            }
        }
        self.command.arguments()?;
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn log_settings(&self) -> LogSettings {
        self.log.settings("plugin-host")
    }
}

impl HostCommand {
    pub fn plugin(&self) -> Option<&str> {
        match self {
            HostCommand::List => None,
            HostCommand::Exec { plugin, .. }
            | HostCommand::Chat { plugin, .. }
            | HostCommand::Ping { plugin } => Some(plugin),
        }
    }

    pub fn function(&self) -> Option<&str> {
        match self {
            HostCommand::Exec { function, .. } | HostCommand::Chat { function, .. } => {
                Some(function)
            }
            HostCommand::List | HostCommand::Ping { .. } => None,
        }
    }

    pub fn system_info(&self) -> Option<&str> {
        match self {
            HostCommand::Exec { system_info, .. } | HostCommand::Chat { system_info, .. } => {
                system_info.as_deref()
            }
            HostCommand::List | HostCommand::Ping { .. } => None,
        }
    }

    /// `--args` decoded; `{}` for subcommands without one.
    pub fn arguments(&self) -> Result<Value> {
        let raw = match self {
            HostCommand::Exec { args, .. } | HostCommand::Chat { args, .. } => args,
            HostCommand::List | HostCommand::Ping { .. } => return Ok(Value::Object(Default::default())),
        };
        let value: Value = serde_json::from_str(raw).context("--args must be valid JSON")?;
        if !value.is_object() {
            bail!("--args must be a JSON object, got {raw}");
        }
        Ok(value)
    }
}
