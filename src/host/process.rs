use crossbeam_channel::{unbounded, Sender};
use serde_json::Value;
use std::env;
use std::ffi::OsString;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::ipc::transport::{read_frame, TransportError};

use super::client::{HostError, PluginClient};
use super::manifest::PluginManifest;

/// Interpreter for `.py` plugins; may carry arguments, e.g. `py -3`.
pub const PYTHON_ENV: &str = "GASSIST_PYTHON";
const DEFAULT_PYTHON: &str = "python3";

const STOP_GRACE: Duration = Duration::from_secs(2);
const STOP_POLL: Duration = Duration::from_millis(25);

/// Program and arguments used to start a plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub cwd: Option<PathBuf>,
}

impl LaunchCommand {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    /// Resolve how to run the manifest's executable.
    pub fn for_manifest(manifest: &PluginManifest) -> Result<Self, HostError> {
        let path = &manifest.executable_path;
        if !path.is_file() {
            return Err(HostError::ExecutableNotFound(path.clone()));
        }
        let is_script = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("py"));
        let mut command = if is_script {
            let raw = env::var(PYTHON_ENV).unwrap_or_else(|_| DEFAULT_PYTHON.to_string());
            let mut parts = split_interpreter(&raw).into_iter();
            let program = parts.next().unwrap_or_else(|| DEFAULT_PYTHON.to_string());
            let mut command = LaunchCommand::new(program);
            command.args.extend(parts.map(OsString::from));
            command.args.push(path.clone().into_os_string());
            command
        } else {
            LaunchCommand::new(path.clone())
        };
        command.cwd = Some(manifest.directory.clone());
        Ok(command)
    }
}

pub(super) fn split_interpreter(raw: &str) -> Vec<String> {
    let trimmed = raw.trim();
    shell_words::split(trimmed)
        .unwrap_or_else(|_| trimmed.split_whitespace().map(str::to_string).collect())
}

/// Decode frames from `reader` into `tx` until the stream ends.
///
/// Bad JSON frames are skipped; header violations end the pump.
pub fn pump_frames<R: Read>(mut reader: R, tx: Sender<Value>, plugin: &str) {
    loop {
        match read_frame(&mut reader) {
            Ok(message) => {
                if tx.send(message).is_err() {
                    debug!(plugin, "client gone; stopping reader");
                    return;
                }
            }
            Err(TransportError::Closed) => {
                debug!(plugin, "plugin output closed");
                return;
            }
            Err(err) if !err.is_fatal() => warn!(plugin, "skipping frame: {err}"),
            Err(err) => {
                warn!(plugin, "stopping reader: {err}");
                return;
            }
        }
    }
}

/// A running plugin child process.
pub struct PluginProcess {
    name: String,
    child: Child,
    client: PluginClient<ChildStdin>,
    reader: Option<JoinHandle<()>>,
    stopped: bool,
}

impl PluginProcess {
    pub fn spawn(manifest: &PluginManifest, timeout: Duration) -> Result<Self, HostError> {
        let command = LaunchCommand::for_manifest(manifest)?;
        Self::spawn_command(&manifest.name, &command, timeout)
    }

    pub fn spawn_command(
        name: &str,
        command: &LaunchCommand,
        timeout: Duration,
    ) -> Result<Self, HostError> {
        let mut builder = Command::new(&command.program);
        builder
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        if let Some(cwd) = &command.cwd {
            builder.current_dir(cwd);
        }
        let mut child = builder.spawn().map_err(|source| HostError::Spawn {
            program: Path::new(&command.program).display().to_string(),
            source,
        })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(HostError::Protocol("plugin stdio pipes unavailable".to_string()));
        };

        let (tx, rx) = unbounded();
        let reader_name = name.to_string();
        let reader = thread::Builder::new()
            .name(format!("plugin-reader-{name}"))
            .spawn(move || pump_frames(stdout, tx, &reader_name));
        let reader = match reader {
            Ok(handle) => handle,
            Err(source) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(HostError::Spawn {
                    program: "plugin reader thread".to_string(),
                    source,
                });
            }
        };

        info!(plugin = name, pid = child.id(), "plugin started");
        Ok(Self {
            name: name.to_string(),
            child,
            client: PluginClient::new(stdin, rx).with_timeout(timeout),
            reader: Some(reader),
            stopped: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn client(&mut self) -> &mut PluginClient<ChildStdin> {
        &mut self.client
    }

    /// Send `shutdown`, give the child a moment to exit, then kill it.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        if let Err(err) = self.client.shutdown() {
            debug!(plugin = %self.name, "shutdown request failed: {err}");
        }

        let deadline = Instant::now() + STOP_GRACE;
        let exited = loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    debug!(plugin = %self.name, %status, "plugin exited");
                    break true;
                }
                Ok(None) if Instant::now() < deadline => thread::sleep(STOP_POLL),
                Ok(None) => break false,
                Err(err) => {
                    warn!(plugin = %self.name, "failed to poll plugin: {err}");
                    break false;
                }
            }
        };
        if !exited {
            warn!(plugin = %self.name, "plugin did not exit gracefully, killing");
            let _ = self.child.kill();
            let _ = self.child.wait();
        }

        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        info!(plugin = %self.name, "plugin stopped");
    }
}

impl Drop for PluginProcess {
    fn drop(&mut self) {
        self.stop();
    }
}
