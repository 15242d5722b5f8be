#![forbid(unsafe_code)]

//! Seams to the systems a pipeline drives but does not implement:
//! version control, the container runtime, the coding agent and the review UI.

pub mod agent;
pub mod docker;
pub mod git;
pub mod review;

use std::path::{Path, PathBuf};

use crate::error::TaskqError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeRequest<'a> {
    pub repo: &'a Path,
    pub task_id: &'a str,
    pub base: &'a str,
    pub branch: &'a str,
    pub path: &'a Path,
}

pub trait GitAdapter: Send + Sync {
    /// Materialise `branch` (from `base`) at `path`; returns the checked-out path.
    fn create_worktree(&self, req: &WorktreeRequest<'_>) -> Result<PathBuf, TaskqError>;
    fn remove_worktree(&self, repo: &Path, path: &Path) -> Result<(), TaskqError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest<'a> {
    pub task_id: &'a str,
    pub worktree: &'a Path,
    pub port: u16,
    pub config_dir: &'a Path,
    pub data_dir: &'a Path,
}

pub trait ContainerAdapter: Send + Sync {
    /// Start a container for the task; returns its handle.
    fn launch(&self, req: &LaunchRequest<'_>) -> Result<String, TaskqError>;
    fn list_by_task_id(&self, task_id: &str) -> Result<Vec<String>, TaskqError>;
    fn remove(&self, handle: &str) -> Result<(), TaskqError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

pub trait AgentAdapter: Send + Sync {
    fn make_plan(&self, handle: &str, prompt: &str) -> Result<AgentOutput, TaskqError>;
    fn execute_plan(&self, handle: &str, prompt: &str) -> Result<AgentOutput, TaskqError>;
}

pub trait ReviewAdapter: Send + Sync {
    /// Blocks until the review UI exits; returns its exit code.
    fn launch(&self, config_dir: &Path, data_dir: &Path, port: u16) -> Result<i32, TaskqError>;
}
