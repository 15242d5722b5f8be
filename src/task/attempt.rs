#![forbid(unsafe_code)]

//! Per-attempt directories and the retry transition.
//!
//! Every `(task id, attempt)` pair owns `<root>/<id>/attempt-<n>/{config,data}`,
//! so a retried task can never see the agent state of an earlier attempt.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::TaskqError;
use crate::task::model::{RuntimeFields, TaskRecord, TaskStatus, validate_task_id};
use crate::task::storage::QueueStore;

const AUTH_FILE: &str = "auth.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptPaths {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl AttemptPaths {
    #[must_use]
    pub fn to_runtime_fields(&self) -> RuntimeFields {
        RuntimeFields {
            attempt_config_dir: Some(self.config_dir.to_string_lossy().into_owned()),
            attempt_data_dir: Some(self.data_dir.to_string_lossy().into_owned()),
            ..RuntimeFields::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct AttemptManager {
    root: PathBuf,
    host_config_dir: Option<PathBuf>,
    host_data_dir: Option<PathBuf>,
}

impl AttemptManager {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            host_config_dir: None,
            host_data_dir: None,
        }
    }

    /// Host agent directories to snapshot into each fresh attempt.
    #[must_use]
    pub fn with_host_dirs(mut self, config_dir: PathBuf, data_dir: PathBuf) -> Self {
        self.host_config_dir = Some(config_dir);
        self.host_data_dir = Some(data_dir);
        self
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn task_root(&self, task_id: &str) -> PathBuf {
        self.root.join(task_id)
    }

    #[must_use]
    pub fn attempt_paths(&self, task_id: &str, attempt: u32) -> AttemptPaths {
        let base = self.task_root(task_id).join(format!("attempt-{attempt}"));
        AttemptPaths {
            config_dir: base.join("config"),
            data_dir: base.join("data"),
        }
    }

    /// Create empty attempt directories, replacing leftovers from an interrupted run
    /// of the same attempt, then snapshot the host agent configuration into them.
    pub fn prepare(&self, task_id: &str, attempt: u32) -> Result<AttemptPaths, TaskqError> {
        validate_task_id(task_id)?;
        let paths = self.attempt_paths(task_id, attempt);
        for dir in [&paths.config_dir, &paths.data_dir] {
            if dir.exists() {
                std::fs::remove_dir_all(dir).map_err(|e| TaskqError::io(dir, e))?;
            }
            std::fs::create_dir_all(dir).map_err(|e| TaskqError::io(dir, e))?;
        }

        if let Some(src) = self.host_config_dir.as_deref().filter(|p| p.is_dir()) {
            copy_tree(src, &paths.config_dir)?;
        }
        if let Some(src) = self.host_data_dir.as_deref() {
            let auth = src.join(AUTH_FILE);
            if auth.is_file() {
                let dst = paths.data_dir.join(AUTH_FILE);
                std::fs::copy(&auth, &dst).map_err(|e| TaskqError::io(&dst, e))?;
            }
        }
        debug!(task_id, attempt, config_dir = %paths.config_dir.display(), "prepared attempt dirs");
        Ok(paths)
    }

    /// `failed -> todo`, bump the attempt and drop every runtime handle.
    pub fn retry(&self, store: &QueueStore, task_id: &str) -> Result<TaskRecord, TaskqError> {
        let current = store.get(task_id)?;
        if current.status != TaskStatus::Failed {
            return Err(TaskqError::InvalidState {
                id: task_id.to_owned(),
                status: current.status,
                op: "retry",
            });
        }
        let record = store
            .transition_with(task_id, TaskStatus::Failed, TaskStatus::Todo, |r| {
                r.attempt += 1;
                r.runtime = RuntimeFields::default();
                r.error_ref = None;
            })
            .map_err(|e| match e {
                TaskqError::StaleState { actual, .. } => TaskqError::InvalidState {
                    id: task_id.to_owned(),
                    status: actual,
                    op: "retry",
                },
                other => other,
            })?;

        let previous = self.task_root(task_id).join(format!("attempt-{}", current.attempt));
        if previous.exists()
            && let Err(e) = std::fs::remove_dir_all(&previous)
        {
            warn!(task_id, path = %previous.display(), error = %e, "failed to remove previous attempt dirs");
        }
        Ok(record)
    }

    /// Remove every attempt directory of a task. Missing directories are not an error.
    pub fn remove_task(&self, task_id: &str) -> Result<bool, TaskqError> {
        validate_task_id(task_id)?;
        let dir = self.task_root(task_id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(TaskqError::io(&dir, e)),
        }
    }
}

fn copy_tree(src: &Path, dst: &Path) -> Result<(), TaskqError> {
    std::fs::create_dir_all(dst).map_err(|e| TaskqError::io(dst, e))?;
    for entry in std::fs::read_dir(src).map_err(|e| TaskqError::io(src, e))? {
        let entry = entry.map_err(|e| TaskqError::io(src, e))?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let ty = entry.file_type().map_err(|e| TaskqError::io(&from, e))?;
        if ty.is_dir() {
            copy_tree(&from, &to)?;
        } else if ty.is_file() {
            std::fs::copy(&from, &to).map_err(|e| TaskqError::io(&to, e))?;
        }
    }
    Ok(())
}
