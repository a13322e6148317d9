//! Leveled file logging for crewline.
//!
//! Log levels:
//! - ERROR: Failures that end a task or abort an operation
//! - WARN: Recoverable conditions (retries, deferred failover, loop errors)
//! - INFO: Lifecycle notifications (loops started/stopped, failovers, scaling)
//! - DEBUG: Dispatch decisions, probe results
//! - TRACE: Per-tick state
//!
//! The threshold comes from the `[log]` section of the config file and is
//! raised to DEBUG by `--debug` or `CREWLINE_DEBUG=1`. Until [`init`] runs
//! every log call is a no-op.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::error::Error;

static OUTPUT: OnceLock<Output> = OnceLock::new();
static LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    #[default]
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    const ALL: [LogLevel; 5] = [
        LogLevel::Error,
        LogLevel::Warn,
        LogLevel::Info,
        LogLevel::Debug,
        LogLevel::Trace,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        Self::ALL
            .into_iter()
            .find(|l| l.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::Validation(format!("unknown log level: {}", s)))
    }
}

/// The `[log]` config section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: LogLevel,
    /// Defaults to `~/.crewline/crewline.log`.
    pub file: Option<PathBuf>,
    /// Mirror WARN and ERROR lines to stderr.
    pub stderr: bool,
}

struct Output {
    file: Option<PathBuf>,
    stderr: bool,
}

pub fn default_log_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".crewline").join("crewline.log"))
}

/// Configure logging once per process. The log file is truncated.
pub fn init(settings: &LogSettings, debug: bool) {
    let env_debug = std::env::var("CREWLINE_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let level = if debug || env_debug {
        settings.level.max(LogLevel::Debug)
    } else {
        settings.level
    };
    set_level(level);

    let file = settings.file.clone().or_else(default_log_path);
    if let Some(path) = &file {
        if let Some(dir) = path.parent() {
            let _ = fs::create_dir_all(dir);
        }
        let _ = fs::write(path, "");
    }
    OUTPUT
        .set(Output {
            file,
            stderr: settings.stderr,
        })
        .ok();
}

pub fn set_level(level: LogLevel) {
    LEVEL.store(level as u8, Ordering::SeqCst);
}

pub fn level() -> LogLevel {
    let v = LEVEL.load(Ordering::Relaxed);
    LogLevel::ALL
        .get(usize::from(v))
        .copied()
        .unwrap_or(LogLevel::Trace)
}

/// Whether a line at `level` would be written anywhere.
pub fn enabled(level: LogLevel) -> bool {
    level <= self::level() && OUTPUT.get().is_some()
}

pub fn write(level: LogLevel, msg: &str) {
    if level > self::level() {
        return;
    }
    let Some(out) = OUTPUT.get() else {
        return;
    };
    let line = format!(
        "[{}] [{}] {}",
        chrono::Local::now().format("%H:%M:%S%.3f"),
        level,
        msg
    );
    if let Some(path) = &out.file {
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            let _ = writeln!(file, "{}", line);
        }
    }
    if out.stderr && level <= LogLevel::Warn {
        eprintln!("{}", line);
    }
}

/// Log at INFO.
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        if $crate::log::enabled($crate::log::LogLevel::Info) {
            $crate::log::write($crate::log::LogLevel::Info, &format!($($arg)*))
        }
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        if $crate::log::enabled($crate::log::LogLevel::Error) {
            $crate::log::write($crate::log::LogLevel::Error, &format!($($arg)*))
        }
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        if $crate::log::enabled($crate::log::LogLevel::Warn) {
            $crate::log::write($crate::log::LogLevel::Warn, &format!($($arg)*))
        }
    };
}

/// Log at DEBUG; the message is not formatted unless debug is on.
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        if $crate::log::enabled($crate::log::LogLevel::Debug) {
            $crate::log::write($crate::log::LogLevel::Debug, &format!($($arg)*))
        }
    };
}

#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {
        if $crate::log::enabled($crate::log::LogLevel::Trace) {
            $crate::log::write($crate::log::LogLevel::Trace, &format!($($arg)*))
        }
    };
}
