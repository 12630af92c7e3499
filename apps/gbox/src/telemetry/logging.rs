use clap::ValueEnum;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::ParseError;

/// Replaces the computed filter entirely.
pub const FILTER_ENV: &str = "GBOX_LOG_FILTER";
/// Lets per-frame and per-message traces through at `trace`.
pub const WIRE_ENV: &str = "GBOX_TRACE_WIRE";

/// Modules that log once per frame or socket message.
const WIRE_TARGETS: &[&str] = &[
    "gbox_exec_core::protocol::frame",
    "gbox_exec_core::client::websocket",
];

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("cannot open log file {}: {source}", path.display())]
    OpenFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid {FILTER_ENV}: {0}")]
    Filter(#[from] ParseError),
    #[error("logger already installed elsewhere: {0}")]
    Install(#[source] Box<dyn std::error::Error + Send + Sync>),
}

static WRITER_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the process subscriber once; later calls return `Ok` untouched.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if WRITER_GUARD.get().is_some() {
        return Ok(());
    }

    let filter = match std::env::var(FILTER_ENV) {
        Ok(custom) => EnvFilter::try_new(custom)?,
        Err(_) => EnvFilter::try_new(directives(config.level, wire_tracing()))?,
    };
    let (writer, guard) = match &config.file {
        Some(path) => tracing_appender::non_blocking(open_log_file(path)?),
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(config.file.is_none())
        .with_target(config.level >= LogLevel::Debug)
        .try_init()
        .map_err(InitError::Install)?;

    let _ = WRITER_GUARD.set(guard);
    Ok(())
}

fn wire_tracing() -> bool {
    std::env::var(WIRE_ENV).is_ok_and(|value| !value.is_empty() && value != "0")
}

fn open_log_file(path: &Path) -> Result<File, InitError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| InitError::OpenFile {
            path: path.to_owned(),
            source,
        })
}

/// Dependencies stay at `warn`; the chosen level applies to this crate and
/// its binary. Wire modules are held at `debug` unless asked for.
fn directives(level: LogLevel, wire: bool) -> String {
    let crate_level = level.directive();
    let mut out = format!("warn,gbox_exec_core={crate_level},gbox={crate_level}");
    if level == LogLevel::Trace && !wire {
        for target in WIRE_TARGETS {
            out.push_str(&format!(",{target}=debug"));
        }
    }
    out
}

/// Short printable rendering of payload bytes for trace output.
pub fn escape_preview(bytes: &[u8], limit: usize) -> String {
    let shown = &bytes[..bytes.len().min(limit)];
    let mut out: String = shown
        .iter()
        .flat_map(|byte| std::ascii::escape_default(*byte))
        .map(char::from)
        .collect();
    if bytes.len() > limit {
        out.push_str(&format!("... (+{} bytes)", bytes.len() - limit));
    }
    out
}
