//! Tracing setup for plugin and host processes.
//!
//! Stdout belongs to the protocol, so logs only ever go to a file.

use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use tracing::Level;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::fmt::MakeWriter;

use crate::lock_or_recover;

pub const LOG_PATH_ENV: &str = "GASSIST_PLUGIN_LOG";
pub const LOG_MAX_BYTES: u64 = 5 * 1024 * 1024;

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Resolved logging options, usually built from a `PluginConfig` or `HostConfig`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub enabled: bool,
    pub path: PathBuf,
    pub level: Level,
    pub json: bool,
    pub max_bytes: u64,
}

impl LogSettings {
    pub fn for_process(name: &str) -> Self {
        Self {
            enabled: true,
            path: default_log_path(name),
            level: Level::INFO,
            json: false,
            max_bytes: LOG_MAX_BYTES,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::for_process("gassist-plugin")
        }
    }
}

/// `$GASSIST_PLUGIN_LOG`, or `<temp>/<name>.log`.
pub fn default_log_path(name: &str) -> PathBuf {
    env::var(LOG_PATH_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| env::temp_dir().join(format!("{name}.log")))
}

pub fn parse_level(raw: &str) -> Option<Level> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

/// Install the global subscriber. Later calls are no-ops, as is a log file
/// that cannot be opened.
pub fn init_tracing(settings: &LogSettings) {
    if !settings.enabled {
        return;
    }

    let _ = TRACING_INIT.get_or_init(|| {
        let Some(file) = RotatingLogFile::open(&settings.path, settings.max_bytes) else {
            return;
        };
        let writer = SharedLog::new(file);
        let builder = tracing_subscriber::fmt()
            .with_max_level(settings.level)
            .with_timer(UtcTime::rfc_3339())
            .with_ansi(false)
            .with_writer(writer);
        if settings.json {
            let subscriber = builder
                .json()
                .with_current_span(false)
                .with_span_list(false)
                .finish();
            let _ = tracing::subscriber::set_global_default(subscriber);
        } else {
            let _ = tracing::subscriber::set_global_default(builder.finish());
        }
    });
}

// ============================================================================
// Rotating Log File
// ============================================================================

/// Append-only log file that starts over once it would exceed `max_bytes`.
#[derive(Debug)]
pub struct RotatingLogFile {
    path: PathBuf,
    file: fs::File,
    max_bytes: u64,
    bytes_written: u64,
}

impl RotatingLogFile {
    pub fn open(path: &Path, max_bytes: u64) -> Option<Self> {
        let mut bytes_written = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        if bytes_written > max_bytes {
            let _ = fs::remove_file(path);
            bytes_written = 0;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .ok()?;
        Some(Self {
            path: path.to_path_buf(),
            file,
            max_bytes,
            bytes_written,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn rotate_if_needed(&mut self, next_len: usize) {
        if self.bytes_written.saturating_add(next_len as u64) <= self.max_bytes {
            return;
        }
        if let Ok(file) = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
        {
            self.file = file;
            self.bytes_written = 0;
        }
    }
}

impl Write for RotatingLogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.rotate_if_needed(buf.len());
        self.file.write_all(buf)?;
        self.bytes_written = self.bytes_written.saturating_add(buf.len() as u64);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

struct SharedLog {
    file: Mutex<RotatingLogFile>,
}

impl SharedLog {
    fn new(file: RotatingLogFile) -> Self {
        Self {
            file: Mutex::new(file),
        }
    }
}

struct SharedLogGuard<'a>(std::sync::MutexGuard<'a, RotatingLogFile>);

impl Write for SharedLogGuard<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl<'a> MakeWriter<'a> for SharedLog {
    type Writer = SharedLogGuard<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        SharedLogGuard(lock_or_recover(&self.file, "log file"))
    }
}
