#![forbid(unsafe_code)]

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::task::model::TaskStatus;

#[derive(Debug, Error)]
pub enum TaskqError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("invalid config key: {0}")]
    InvalidConfigKey(String),

    #[error("invalid config value for {key}: {msg}")]
    InvalidConfigValue { key: String, msg: String },

    #[error("record with id '{0}' already exists")]
    DuplicateId(String),

    #[error("task not found: {0}")]
    NotFound(String),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("stale state for task '{id}': expected {expected}, found {actual}")]
    StaleState {
        id: String,
        expected: TaskStatus,
        actual: TaskStatus,
    },

    #[error("cannot {op} task '{id}' in '{status}' status")]
    InvalidState {
        id: String,
        status: TaskStatus,
        op: &'static str,
    },

    #[error("no task available in 'todo' status")]
    NoAvailableTask,

    #[error(transparent)]
    Adapter(#[from] AdapterFailure),

    #[error("timed out after {waited:?} waiting for store lock {}", path.display())]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("{what} timed out after {after:?}")]
    Timeout { what: String, after: Duration },

    #[error("cleanup failed: {0}")]
    ResourceCleanup(String),

    #[error("no free port in range {start}-{end}")]
    PortsExhausted { start: u16, end: u16 },

    #[error("corrupt record at {}:{line}: {msg}", path.display())]
    CorruptStore {
        path: PathBuf,
        line: usize,
        msg: String,
    },

    #[error("io error at {}: {source}", path.display())]
    IoPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Other(String),
}

impl TaskqError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::IoPath {
            path: path.into(),
            source,
        }
    }
}

/// Pipeline stage a task was in when something went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Setup,
    Plan,
    Execute,
    Finalize,
}

impl Stage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Plan => "plan",
            Self::Execute => "execute",
            Self::Finalize => "finalize",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A collaborator call that returned non-zero, raised, or timed out.
#[derive(Debug, Clone, Error)]
#[error("[{stage}] {message} (exit code {exit_code})")]
pub struct AdapterFailure {
    pub stage: Stage,
    pub exit_code: i32,
    pub message: String,
    pub stdout: String,
    pub stderr: String,
}

/// Exit code recorded when a collaborator raised instead of exiting.
pub const EXIT_RAISED: i32 = -1;
/// Exit code recorded when a collaborator call timed out.
pub const EXIT_TIMEOUT: i32 = 124;

impl AdapterFailure {
    #[must_use]
    pub fn raised(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            exit_code: EXIT_RAISED,
            message: message.into(),
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    #[must_use]
    pub fn exited(stage: Stage, exit_code: i32, stdout: String, stderr: String) -> Self {
        Self {
            stage,
            exit_code,
            message: format!("{stage} command exited with code {exit_code}"),
            stdout,
            stderr,
        }
    }
}
