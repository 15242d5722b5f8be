#![forbid(unsafe_code)]

use std::path::Path;

use serde::Serialize;
use tracing::{debug, warn};

use crate::adapters::{ContainerAdapter, GitAdapter};
use crate::error::TaskqError;
use crate::task::attempt::AttemptManager;
use crate::task::model::{TaskRecord, TaskStatus};
use crate::task::report::ErrorReporter;
use crate::task::storage::QueueStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupFilter {
    pub id: Option<String>,
    pub done_only: bool,
    pub cancelled_only: bool,
    pub keep_worktree: bool,
}

impl CleanupFilter {
    pub fn statuses(&self) -> Result<Vec<TaskStatus>, TaskqError> {
        match (self.done_only, self.cancelled_only) {
            (true, true) => Err(TaskqError::Validation(
                "--done-only and --cancelled-only are mutually exclusive".to_owned(),
            )),
            (true, false) => Ok(vec![TaskStatus::Done]),
            (false, true) => Ok(vec![TaskStatus::Cancelled]),
            (false, false) => Ok(vec![TaskStatus::Done, TaskStatus::Cancelled]),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupSummary {
    pub tasks: Vec<String>,
    pub containers_removed: usize,
    pub worktrees_removed: usize,
    pub reports_removed: usize,
    pub attempt_dirs_removed: usize,
    /// Artifacts that could not be removed; logged and skipped.
    pub warnings: usize,
}

/// Removes runtime artifacts of terminal tasks. Safe to run repeatedly.
pub struct Cleaner<'a> {
    pub store: &'a QueueStore,
    pub attempts: &'a AttemptManager,
    pub reporter: &'a ErrorReporter,
    pub git: &'a dyn GitAdapter,
    pub container: &'a dyn ContainerAdapter,
}

impl Cleaner<'_> {
    pub fn run(&self, filter: &CleanupFilter) -> Result<CleanupSummary, TaskqError> {
        let statuses = filter.statuses()?;
        let records: Vec<TaskRecord> = match &filter.id {
            Some(id) => {
                let record = self.store.get(id)?;
                if statuses.contains(&record.status) {
                    vec![record]
                } else {
                    debug!(task_id = %id, status = %record.status, "not eligible for cleanup");
                    Vec::new()
                }
            }
            None => self
                .store
                .list(None)?
                .into_iter()
                .filter(|r| statuses.contains(&r.status))
                .collect(),
        };

        let mut summary = CleanupSummary::default();
        for record in &records {
            self.clean_one(record, filter.keep_worktree, &mut summary)?;
            summary.tasks.push(record.id.clone());
        }
        Ok(summary)
    }

    fn clean_one(
        &self,
        record: &TaskRecord,
        keep_worktree: bool,
        summary: &mut CleanupSummary,
    ) -> Result<(), TaskqError> {
        let id = record.id.as_str();

        match self.container.list_by_task_id(id) {
            Ok(handles) => {
                for handle in handles {
                    match self.container.remove(&handle) {
                        Ok(()) => summary.containers_removed += 1,
                        Err(e) => warn_cleanup(summary, id, "container", &e),
                    }
                }
            }
            Err(e) => warn_cleanup(summary, id, "container", &e),
        }

        if !keep_worktree
            && let Some(path) = record.worktree_path.as_deref().map(Path::new)
            && path.exists()
        {
            match self.git.remove_worktree(Path::new(&record.repo), path) {
                Ok(()) => summary.worktrees_removed += 1,
                Err(e) => warn_cleanup(summary, id, "worktree", &e),
            }
        }

        match self.reporter.remove_for_task(id) {
            Ok(n) => summary.reports_removed += n,
            Err(e) => warn_cleanup(summary, id, "error reports", &e),
        }

        match self.attempts.remove_task(id) {
            Ok(true) => summary.attempt_dirs_removed += 1,
            Ok(false) => {}
            Err(e) => warn_cleanup(summary, id, "attempt dirs", &e),
        }

        self.store.clear_runtime_fields(id)?;
        Ok(())
    }
}

fn warn_cleanup(summary: &mut CleanupSummary, task_id: &str, what: &str, err: &TaskqError) {
    summary.warnings += 1;
    warn!(task_id, error = %err, "failed to remove {what}");
}
