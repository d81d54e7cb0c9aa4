//! Error types shared across posse components.
//!
//! Failures fall into a small set of categories with different blast
//! radii: child-scoped errors (spawn, signal, reap) never abort the
//! deputy and are surfaced to the sheriff as output diagnostics;
//! bootstrap errors (bus, signal handler setup) are fatal.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias for posse operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse grouping used when reporting errors to logs and the sheriff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Fork/exec/pty failures for one child.
    Spawn,
    /// Signal delivery failures for one child.
    Signal,
    /// Misuse of the process-manager API (unknown record, bad state).
    Invalid,
    /// Message bus transport failures.
    Bus,
    /// /proc scraping failures.
    Proc,
    /// Everything else OS-level.
    Io,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCategory::Spawn => "spawn",
            ErrorCategory::Signal => "signal",
            ErrorCategory::Invalid => "invalid",
            ErrorCategory::Bus => "bus",
            ErrorCategory::Proc => "proc",
            ErrorCategory::Io => "io",
        };
        write!(f, "{name}")
    }
}

/// Unified error type for posse.
#[derive(Error, Debug)]
pub enum Error {
    /// forkpty or the pty allocation failed; the child never existed.
    #[error("spawn failed: {message} (errno {errno})")]
    Spawn { errno: i32, message: String },

    /// The exec string produced no argv entries.
    #[error("exec string [{exec_str}] contains no command")]
    EmptyExecString { exec_str: String },

    /// Operation requires a running child but the command is stopped.
    #[error("command is not running")]
    NotRunning,

    /// Operation requires a stopped command but the child is alive.
    #[error("command is already running (pid {pid})")]
    AlreadyRunning { pid: i32 },

    /// Signal delivery to the command's own PID failed.
    #[error("kill({pid}, {signum}) failed: {message}")]
    Kill {
        pid: i32,
        signum: i32,
        message: String,
    },

    /// A command handle that the process manager does not own.
    #[error("invalid command record")]
    InvalidCommand,

    /// Bus transport failure (fatal during bootstrap).
    #[error("bus: {0}")]
    Bus(String),

    /// /proc was unreadable or did not parse.
    #[error("proc: {0}")]
    Proc(String),

    /// POSIX signal handler installation failed or was repeated.
    #[error("signal setup: {0}")]
    SignalSetup(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Category for log/diagnostic grouping.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Spawn { .. } | Error::EmptyExecString { .. } => ErrorCategory::Spawn,
            Error::Kill { .. } => ErrorCategory::Signal,
            Error::NotRunning | Error::AlreadyRunning { .. } | Error::InvalidCommand => {
                ErrorCategory::Invalid
            }
            Error::Bus(_) => ErrorCategory::Bus,
            Error::Proc(_) => ErrorCategory::Proc,
            Error::SignalSetup(_) => ErrorCategory::Io,
            Error::Io(_) => ErrorCategory::Io,
        }
    }

    /// True when the failure concerns a single child and the deputy
    /// should keep running.
    pub fn child_scoped(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Spawn | ErrorCategory::Signal | ErrorCategory::Invalid
        )
    }
}
