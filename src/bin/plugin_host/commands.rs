use anyhow::{bail, Context, Result};
use gassist_plugin_sdk::config::HostConfig;
use gassist_plugin_sdk::host::{discover_plugins, PluginManifest, PluginProcess, PluginResponse};
use serde_json::Value;
use std::io::{self, BufRead, Write};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

pub(crate) fn list(config: &HostConfig) -> Result<()> {
    let names = discover_plugins(&config.plugins_dir);
    let mut out = io::stdout().lock();
    if names.is_empty() {
        writeln!(out, "No plugins found in {}", config.plugins_dir.display())?;
        return Ok(());
    }
    for name in names {
        match PluginManifest::load_dir(&config.plugins_dir.join(&name)) {
            Ok(manifest) => {
                let mode = if manifest.passthrough { " [passthrough]" } else { "" };
                writeln!(out, "{name}{mode} - {}", manifest.description)?;
                for function in &manifest.functions {
                    writeln!(out, "    {}: {}", function.name, function.description)?;
                    if config.verbose {
                        for param in &function.parameters {
                            let required = if param.required { ", required" } else { "" };
                            writeln!(out, "        {} ({}{required})", param.name, param.kind)?;
                        }
                    }
                }
            }
            Err(err) => writeln!(out, "{name} - invalid manifest: {err}")?,
        }
    }
    Ok(())
}

pub(crate) fn exec(config: &HostConfig, plugin: &str, function: &str, args: Value) -> Result<()> {
    let mut process = launch(config, plugin)?;
    let response = process
        .client()
        .execute_with_context(function, args, &[], config.command.system_info(), print_chunk)
        .with_context(|| format!("'{plugin}' failed to run '{function}'"))?;
    process.stop();

    if !finish_turn(&response) {
        bail!("'{function}' reported an error");
    }
    if response.awaiting_input {
        eprintln!("(plugin is waiting for input; use `chat` to continue the conversation)");
    }
    Ok(())
}

pub(crate) fn chat(config: &HostConfig, plugin: &str, function: &str, args: Value) -> Result<()> {
    let mut process = launch(config, plugin)?;
    let mut response = process
        .client()
        .execute_with_context(function, args, &[], config.command.system_info(), print_chunk)
        .with_context(|| format!("'{plugin}' failed to run '{function}'"))?;
    finish_turn(&response);

    let mut lines = io::stdin().lock().lines();
    while response.awaiting_input {
        print!("> ");
        io::stdout().flush()?;
        let Some(line) = lines.next() else {
            break;
        };
        let line = line.context("failed to read stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        if process.client().needs_ping() {
            let rtt = process
                .client()
                .ping(unix_millis())
                .with_context(|| format!("'{plugin}' stopped answering pings"))?;
            debug!(plugin, rtt_ms = rtt.as_millis() as u64, "heartbeat");
        }
        response = process
            .client()
            .send_input(&line, print_chunk)
            .with_context(|| format!("'{plugin}' failed to handle input"))?;
        finish_turn(&response);
    }
    debug!(plugin, "conversation finished");
    process.stop();
    Ok(())
}

pub(crate) fn ping(config: &HostConfig, plugin: &str) -> Result<()> {
    let mut process = launch(config, plugin)?;
    let rtt = process
        .client()
        .ping(unix_millis())
        .with_context(|| format!("'{plugin}' did not answer ping"))?;
    process.stop();
    println!("{plugin}: pong in {:.1} ms", rtt.as_secs_f64() * 1000.0);
    Ok(())
}

fn launch(config: &HostConfig, plugin: &str) -> Result<PluginProcess> {
    let manifest = PluginManifest::load_dir(&config.plugins_dir.join(plugin))
        .with_context(|| format!("failed to load plugin '{plugin}'"))?;
    let mut process = PluginProcess::spawn(&manifest, config.timeout())
        .with_context(|| format!("failed to start plugin '{plugin}'"))?;
    let info = process
        .client()
        .initialize(&config.engine_version)
        .with_context(|| format!("'{plugin}' failed to initialize"))?;
    if config.verbose {
        eprintln!(
            "[{} v{}] protocol {}, {} commands",
            info.name,
            info.version,
            info.protocol_version,
            info.commands.len()
        );
    }
    Ok(process)
}

fn print_chunk(chunk: &str) {
    let mut out = io::stdout();
    let _ = out.write_all(chunk.as_bytes());
    let _ = out.flush();
}

/// Print whatever the stream didn't already show. Returns whether the turn succeeded.
fn finish_turn(response: &PluginResponse) -> bool {
    if !response.success {
        let code = response.error_code.unwrap_or(-1);
        eprintln!("error ({code}): {}", response.message);
        return false;
    }
    match response.data.as_str() {
        Some(text) if !text.is_empty() => println!("{text}"),
        Some(_) => println!(),
        None if response.data.is_null() => println!(),
        None => println!("{}", response.data),
    }
    true
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
