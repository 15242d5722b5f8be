#![forbid(unsafe_code)]

//! One claimed task through setup, plan, execute and finalize.
//!
//! Adapter calls run without the store lock held. Every status change goes
//! through the store's compare-and-swap, so an operator cancelling a task
//! mid-flight surfaces here as a stale-state error rather than being overwritten.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, info_span, warn};

use crate::adapters::{
    AgentAdapter, AgentOutput, ContainerAdapter, GitAdapter, LaunchRequest, WorktreeRequest,
};
use crate::core::naming::{WorktreeVars, worktree_path};
use crate::error::{AdapterFailure, EXIT_TIMEOUT, Stage, TaskqError};
use crate::pipeline::ports::PortAllocator;
use crate::task::attempt::AttemptManager;
use crate::task::files::read_task_file;
use crate::task::model::{RuntimeFields, TaskRecord, TaskStatus};
use crate::task::report::{ErrorReporter, ReportInput};
use crate::task::storage::QueueStore;

#[derive(Clone)]
pub struct Adapters {
    pub git: Arc<dyn GitAdapter>,
    pub container: Arc<dyn ContainerAdapter>,
    pub agent: Arc<dyn AgentAdapter>,
}

#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    /// Remove the container and worktree as soon as a stage fails.
    pub cleanup_on_fail: bool,
    /// Reuse an existing worktree and force-remove stale containers of the task.
    pub dirty_run: bool,
    pub worktree_base_dir: PathBuf,
    pub naming_template: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskOutcome {
    pub id: String,
    pub status: TaskStatus,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_ref: Option<String>,
}

#[derive(Debug)]
struct StageError {
    stage: Stage,
    source: TaskqError,
}

trait AtStage<T> {
    fn at(self, stage: Stage) -> Result<T, StageError>;
}

impl<T> AtStage<T> for Result<T, TaskqError> {
    fn at(self, stage: Stage) -> Result<T, StageError> {
        self.map_err(|source| StageError { stage, source })
    }
}

#[derive(Debug, Default)]
struct Acquired {
    status: Option<TaskStatus>,
    worktree: Option<PathBuf>,
    port: Option<u16>,
    container: Option<String>,
}

pub struct Processor {
    store: QueueStore,
    attempts: AttemptManager,
    reporter: ErrorReporter,
    ports: Arc<PortAllocator>,
    adapters: Adapters,
    opts: ProcessorOptions,
}

impl Processor {
    #[must_use]
    pub fn new(
        store: QueueStore,
        attempts: AttemptManager,
        reporter: ErrorReporter,
        ports: Arc<PortAllocator>,
        adapters: Adapters,
        opts: ProcessorOptions,
    ) -> Self {
        Self {
            store,
            attempts,
            reporter,
            ports,
            adapters,
            opts,
        }
    }

    #[must_use]
    pub fn store(&self) -> &QueueStore {
        &self.store
    }

    pub fn claim(&self, task_id: Option<&str>) -> Result<Option<TaskRecord>, TaskqError> {
        let claimed = match task_id {
            Some(id) => self.store.claim_specific(id),
            None => self.store.claim_first_todo(),
        };
        match claimed {
            Ok(record) => Ok(Some(record)),
            Err(TaskqError::NoAvailableTask) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Drive a claimed record to `review`, `failed`, or whatever an operator moved it to.
    ///
    /// Stage failures are recorded on the task; only store failures while
    /// recording them are returned as errors.
    pub fn process(&self, record: TaskRecord) -> Result<TaskOutcome, TaskqError> {
        let span = info_span!("task", task_id = %record.id, attempt = record.attempt);
        let _enter = span.enter();

        let mut acquired = Acquired {
            status: Some(record.status),
            ..Acquired::default()
        };
        let result = self.run_stages(&record, &mut acquired);
        let outcome = match result {
            Ok(done) => {
                info!(status = %done.status, "pipeline finished");
                Ok(outcome_of(&done, None, None))
            }
            Err(err) => self.handle_failure(&record, err, &mut acquired),
        };
        if let Some(port) = acquired.port.take() {
            self.ports.release(port);
        }
        outcome
    }

    fn run_stages(
        &self,
        record: &TaskRecord,
        acquired: &mut Acquired,
    ) -> Result<TaskRecord, StageError> {
        let handle = self.setup(record, acquired)?;
        let prompt = task_prompt(record).at(Stage::Plan)?;

        info!(stage = "plan", container = %handle, "running plan");
        let out = self.adapters.agent.make_plan(&handle, &prompt).at(Stage::Plan)?;
        check_exit(Stage::Plan, out)?;

        info!(stage = "execute", container = %handle, "executing plan");
        let out = self
            .adapters
            .agent
            .execute_plan(&handle, &prompt)
            .at(Stage::Execute)?;
        check_exit(Stage::Execute, out)?;

        let done = self
            .store
            .update_status(&record.id, TaskStatus::Building, TaskStatus::Review)
            .at(Stage::Finalize)?;
        acquired.status = Some(done.status);
        Ok(done)
    }

    fn setup(&self, record: &TaskRecord, acquired: &mut Acquired) -> Result<String, StageError> {
        let stage = Stage::Setup;
        // The body is needed later; reading it now fails fast on a missing file.
        task_prompt(record).at(stage)?;

        let paths = self.attempts.prepare(&record.id, record.attempt).at(stage)?;

        let wanted = match &record.worktree_path {
            Some(p) => PathBuf::from(p),
            None => worktree_path(
                &self.opts.worktree_base_dir,
                &self.opts.naming_template,
                &WorktreeVars {
                    repo: Path::new(&record.repo),
                    id: &record.id,
                    branch: &record.branch,
                },
            ),
        };
        let wanted = PathBuf::from(
            self.store
                .resolve_worktree_path(&record.id, &wanted.to_string_lossy())
                .at(stage)?,
        );

        let worktree = if self.opts.dirty_run && wanted.exists() {
            info!(stage = "setup", path = %wanted.display(), "dirty run: reusing worktree");
            wanted
        } else {
            self.adapters
                .git
                .create_worktree(&WorktreeRequest {
                    repo: Path::new(&record.repo),
                    task_id: &record.id,
                    base: &record.base_branch,
                    branch: &record.branch,
                    path: &wanted,
                })
                .at(stage)?
        };
        acquired.worktree = Some(worktree.clone());

        // Containers left behind by an earlier attempt of this task.
        let stale = match self.adapters.container.list_by_task_id(&record.id) {
            Ok(handles) => handles,
            Err(source) if self.opts.dirty_run => return Err(StageError { stage, source }),
            Err(err) => {
                warn!(stage = "setup", error = %err, "could not list stale containers");
                Vec::new()
            }
        };
        for handle in stale {
            match self.adapters.container.remove(&handle) {
                Ok(()) => info!(stage = "setup", container = %handle, "removed stale container"),
                Err(source) if self.opts.dirty_run => return Err(StageError { stage, source }),
                Err(err) => warn!(
                    stage = "setup",
                    container = %handle,
                    error = %err,
                    "could not remove stale container"
                ),
            }
        }

        let exclude = self.ports_in_use().at(stage)?;
        let port = self.ports.reserve(&exclude).at(stage)?;
        acquired.port = Some(port);

        let handle = self
            .adapters
            .container
            .launch(&LaunchRequest {
                task_id: &record.id,
                worktree: &worktree,
                port,
                config_dir: &paths.config_dir,
                data_dir: &paths.data_dir,
            })
            .at(stage)?;
        acquired.container = Some(handle.clone());

        let mut fields = paths.to_runtime_fields();
        fields.port = Some(port);
        fields.container_handle = Some(handle.clone());
        self.store.set_runtime_fields(&record.id, fields).at(stage)?;

        let building = self
            .store
            .update_status(&record.id, TaskStatus::Planning, TaskStatus::Building)
            .at(stage)?;
        acquired.status = Some(building.status);
        info!(stage = "setup", port, container = %handle, "setup complete");
        Ok(handle)
    }

    /// Ports recorded on records that may still own a live container.
    fn ports_in_use(&self) -> Result<BTreeSet<u16>, TaskqError> {
        Ok(self
            .store
            .list(None)?
            .into_iter()
            .filter(|r| r.status.allows_runtime_handles())
            .filter_map(|r| r.runtime.port)
            .collect())
    }

    fn handle_failure(
        &self,
        record: &TaskRecord,
        err: StageError,
        acquired: &mut Acquired,
    ) -> Result<TaskOutcome, TaskqError> {
        let StageError { stage, source } = err;
        if matches!(
            source,
            TaskqError::StaleState { .. } | TaskqError::InvalidState { .. }
        ) {
            return self.abandon(record, &source, acquired);
        }

        let failure = into_failure(stage, source);
        warn!(stage = %stage, exit_code = failure.exit_code, error = %failure.message, "stage failed");

        let error_ref = match self
            .reporter
            .report(&ReportInput::from_failure(&record.id, record.attempt, &failure))
        {
            Ok(path) => Some(path.to_string_lossy().into_owned()),
            Err(e) => {
                error!(error = %e, "failed to write error report");
                None
            }
        };

        if self.opts.cleanup_on_fail {
            self.teardown(record, acquired, true);
        }

        let from = acquired.status.unwrap_or(TaskStatus::Planning);
        let cleanup = self.opts.cleanup_on_fail;
        let failed = self
            .store
            .transition_with(&record.id, from, TaskStatus::Failed, |r| {
                r.error_ref.clone_from(&error_ref);
                if cleanup {
                    r.runtime = RuntimeFields::default();
                }
            });
        match failed {
            Ok(rec) => Ok(outcome_of(&rec, Some(stage), Some(failure.exit_code))),
            Err(e @ (TaskqError::StaleState { .. } | TaskqError::InvalidState { .. })) => {
                self.abandon(record, &e, acquired)
            }
            Err(e) => Err(e),
        }
    }

    fn abandon(
        &self,
        record: &TaskRecord,
        cause: &TaskqError,
        acquired: &mut Acquired,
    ) -> Result<TaskOutcome, TaskqError> {
        info!(reason = %cause, "task changed underneath the pipeline; abandoning");
        self.teardown(record, acquired, false);
        let current = self.store.get(&record.id)?;
        Ok(outcome_of(&current, None, None))
    }

    fn teardown(&self, record: &TaskRecord, acquired: &mut Acquired, remove_worktree: bool) {
        if let Some(handle) = acquired.container.take()
            && let Err(e) = self.adapters.container.remove(&handle)
        {
            warn!(container = %handle, error = %e, "failed to remove container");
        }
        if let Some(port) = acquired.port.take() {
            self.ports.release(port);
        }
        if remove_worktree
            && let Some(path) = acquired.worktree.take()
            && path.exists()
            && let Err(e) = self
                .adapters
                .git
                .remove_worktree(Path::new(&record.repo), &path)
        {
            warn!(path = %path.display(), error = %e, "failed to remove worktree");
        }
        debug!("teardown complete");
    }
}

fn task_prompt(record: &TaskRecord) -> Result<String, TaskqError> {
    let Some(path) = record.task_file.as_deref() else {
        return Err(TaskqError::Validation(format!(
            "task '{}' has no task file",
            record.id
        )));
    };
    let body = read_task_file(Path::new(path))?.body;
    if body.trim().is_empty() {
        return Err(TaskqError::Validation(format!("task file {path} is empty")));
    }
    Ok(body)
}

fn check_exit(stage: Stage, out: AgentOutput) -> Result<(), StageError> {
    if out.exit_code == 0 {
        return Ok(());
    }
    Err(StageError {
        stage,
        source: AdapterFailure::exited(stage, out.exit_code, out.stdout, out.stderr).into(),
    })
}

fn into_failure(stage: Stage, source: TaskqError) -> AdapterFailure {
    match source {
        TaskqError::Adapter(mut f) => {
            f.stage = stage;
            f
        }
        TaskqError::Timeout { what, after } => AdapterFailure {
            stage,
            exit_code: EXIT_TIMEOUT,
            message: format!("{what} timed out after {after:?}"),
            stdout: String::new(),
            stderr: String::new(),
        },
        other => AdapterFailure::raised(stage, other.to_string()),
    }
}

fn outcome_of(record: &TaskRecord, stage: Option<Stage>, exit_code: Option<i32>) -> TaskOutcome {
    TaskOutcome {
        id: record.id.clone(),
        status: record.status,
        attempt: record.attempt,
        failed_stage: stage,
        exit_code,
        error_ref: record.error_ref.clone(),
    }
}
