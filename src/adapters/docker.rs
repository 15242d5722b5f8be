#![forbid(unsafe_code)]

use std::process::Command;
use std::time::Duration;

use time::OffsetDateTime;
use tracing::{debug, info};

use crate::adapters::{ContainerAdapter, LaunchRequest};
use crate::config::ContainerConfig;
use crate::core::naming::container_name;
use crate::core::process::run_captured;
use crate::error::{AdapterFailure, Stage, TaskqError};

pub const TASK_LABEL: &str = "taskq.task_id";

const CLI_TIMEOUT: Duration = Duration::from_secs(60);

/// Containers through the docker (or compatible) CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    cfg: ContainerConfig,
}

impl DockerCli {
    #[must_use]
    pub fn new(cfg: ContainerConfig) -> Self {
        Self { cfg }
    }

    fn command(&self) -> Command {
        Command::new(&self.cfg.command)
    }

    fn run_args(&self, req: &LaunchRequest<'_>) -> Vec<String> {
        let c = &self.cfg;
        let mut args = vec![
            "run".to_owned(),
            "-d".to_owned(),
            "--name".to_owned(),
            container_name(req.task_id, OffsetDateTime::now_utc()),
            "--label".to_owned(),
            format!("{TASK_LABEL}={}", req.task_id),
            "-p".to_owned(),
            format!("{}:{}:{}", c.host, req.port, c.internal_port),
            "-v".to_owned(),
            format!("{}:{}", req.worktree.display(), c.workdir),
            "-v".to_owned(),
            format!("{}:{}:ro", req.config_dir.display(), c.config_mount),
            "-v".to_owned(),
            format!("{}:{}", req.data_dir.display(), c.data_mount),
            "-w".to_owned(),
            c.workdir.clone(),
            c.image.clone(),
        ];
        args.extend(c.args.iter().cloned());
        args
    }
}

impl ContainerAdapter for DockerCli {
    fn launch(&self, req: &LaunchRequest<'_>) -> Result<String, TaskqError> {
        let args = self.run_args(req);
        debug!(task_id = req.task_id, ?args, "docker run");
        let mut cmd = self.command();
        cmd.args(&args);
        let out = run_captured(cmd, Some(CLI_TIMEOUT))?;
        if !out.success() {
            return Err(AdapterFailure::exited(Stage::Setup, out.code, out.stdout, out.stderr).into());
        }
        let id: String = out.stdout.trim().chars().take(12).collect();
        if id.is_empty() {
            return Err(AdapterFailure::raised(Stage::Setup, "container runtime returned no id").into());
        }
        info!(task_id = req.task_id, container = %id, port = req.port, "container launched");
        Ok(id)
    }

    fn list_by_task_id(&self, task_id: &str) -> Result<Vec<String>, TaskqError> {
        let mut cmd = self.command();
        cmd.args([
            "ps",
            "-a",
            "--filter",
            &format!("label={TASK_LABEL}={task_id}"),
            "--format",
            "{{.ID}}",
        ]);
        let out = run_captured(cmd, Some(CLI_TIMEOUT))?;
        if !out.success() {
            return Err(TaskqError::Other(format!(
                "{} ps failed with exit code {}: {}",
                self.cfg.command,
                out.code,
                out.stderr.trim()
            )));
        }
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_owned)
            .collect())
    }

    fn remove(&self, handle: &str) -> Result<(), TaskqError> {
        let mut cmd = self.command();
        cmd.args(["rm", "-f", handle]);
        let out = run_captured(cmd, Some(CLI_TIMEOUT))?;
        // Already gone counts as removed.
        if out.success() || out.stderr.contains("No such container") {
            return Ok(());
        }
        Err(TaskqError::ResourceCleanup(format!(
            "{} rm -f {handle} failed with exit code {}: {}",
            self.cfg.command,
            out.code,
            out.stderr.trim()
        )))
    }
}
