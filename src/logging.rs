//! Logger set-up and rank-aware logging.
//!
//! Messages go through the `log` facade; [`init`] installs a `simplelog` terminal sink.

use std::fmt;

use log::{debug, log, Level, LevelFilter};
use serde::{Deserialize, Serialize};
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode};

use crate::error::{DecompError, Result};
use crate::group::{ProcessGroup, ROOT};

/// Pipeline verbosity, `0..=4`.
///
/// Levels 0-2 only show this crate's own messages, levels 3 and 4 also let through messages
/// from every other crate in the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum LogLevel {
    Quiet = 0,
    #[default]
    Info = 1,
    Debug = 2,
    AllWarnings = 3,
    AllDebug = 4,
}

impl TryFrom<u8> for LogLevel {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(LogLevel::Quiet),
            1 => Ok(LogLevel::Info),
            2 => Ok(LogLevel::Debug),
            3 => Ok(LogLevel::AllWarnings),
            4 => Ok(LogLevel::AllDebug),
            _ => Err(format!("log level must be between 0 and 4, got {}", value)),
        }
    }
}

impl From<LogLevel> for u8 {
    fn from(level: LogLevel) -> u8 {
        level as u8
    }
}

impl LogLevel {
    pub fn filter(&self) -> LevelFilter {
        match self {
            LogLevel::Quiet | LogLevel::AllWarnings => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug | LogLevel::AllDebug => LevelFilter::Debug,
        }
    }

    /// Whether to drop messages that do not come from this crate.
    pub fn crate_only(&self) -> bool {
        matches!(self, LogLevel::Quiet | LogLevel::Info | LogLevel::Debug)
    }
}

/// Install the terminal logger. Fails if a logger is already installed.
pub fn init(level: LogLevel) -> Result<()> {
    let mut config = ConfigBuilder::new();
    if level.crate_only() {
        config.add_filter_allow_str(env!("CARGO_CRATE_NAME"));
    }
    TermLogger::init(
        level.filter(),
        config.build(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )?;
    Ok(())
}

/// Like [`init`], but treats an already installed logger as success.
pub fn try_init(level: LogLevel) {
    if let Err(DecompError::Logger(e)) = init(level) {
        debug!("keeping the existing logger: {}", e);
    }
}

/// Fixed set of message severities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Error,
    Warn,
    Info,
    Debug,
}

impl Severity {
    pub fn level(&self) -> Level {
        match self {
            Severity::Critical | Severity::Error => Level::Error,
            Severity::Warn => Level::Warn,
            Severity::Info => Level::Info,
            Severity::Debug => Level::Debug,
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "critical" => Ok(Severity::Critical),
            "error" => Ok(Severity::Error),
            "warn" | "warning" => Ok(Severity::Warn),
            "info" => Ok(Severity::Info),
            "debug" => Ok(Severity::Debug),
            _ => Err(format!("unknown severity: {}", s)),
        }
    }
}

/// `"MPI rank <n>"` in a multi-process run, `"serial task"` otherwise.
pub fn rank_tag(rank: usize, size: usize) -> String {
    if size > 1 {
        format!("MPI rank {}", rank)
    } else {
        "serial task".to_string()
    }
}

/// Logs on behalf of one rank.
///
/// By default only the root rank's messages are emitted, so a run with many ranks prints each
/// message once. Per-task messages are emitted by every rank and carry the rank tag.
#[derive(Debug, Clone)]
pub struct RankLogger {
    tag: String,
    is_root: bool,
}

impl RankLogger {
    pub fn new(rank: usize, size: usize, root: usize) -> Self {
        Self {
            tag: rank_tag(rank, size),
            is_root: rank == root,
        }
    }

    pub fn for_group<G: ProcessGroup + ?Sized>(group: &G) -> Self {
        Self::new(group.rank(), group.size(), ROOT)
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Whether a message with this scope would be emitted by this rank.
    pub fn emits(&self, per_task: bool) -> bool {
        per_task || self.is_root
    }

    pub fn log(&self, severity: Severity, per_task: bool, message: impl fmt::Display) {
        if !self.emits(per_task) {
            return;
        }
        let marker = if severity == Severity::Critical {
            "CRITICAL "
        } else {
            ""
        };
        if per_task {
            log!(severity.level(), "{}{}: {}", marker, self.tag, message);
        } else {
            log!(severity.level(), "{}{}", marker, message);
        }
    }

    pub fn info(&self, per_task: bool, message: impl fmt::Display) {
        self.log(Severity::Info, per_task, message)
    }

    pub fn warn(&self, per_task: bool, message: impl fmt::Display) {
        self.log(Severity::Warn, per_task, message)
    }

    pub fn debug(&self, per_task: bool, message: impl fmt::Display) {
        self.log(Severity::Debug, per_task, message)
    }
}
