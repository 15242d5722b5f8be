#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::adapters::{GitAdapter, WorktreeRequest};
use crate::core::git::Git;
use crate::error::TaskqError;

/// Worktrees through the `git` CLI.
#[derive(Debug, Clone, Default)]
pub struct GitCli;

impl GitAdapter for GitCli {
    fn create_worktree(&self, req: &WorktreeRequest<'_>) -> Result<PathBuf, TaskqError> {
        let git = Git::from_dir(req.repo)?;
        // A preserved worktree from a failed attempt is picked up as-is.
        if req.path.exists() {
            match git.worktree_branch(req.path)? {
                Some(branch) if branch == req.branch => {
                    info!(
                        task_id = req.task_id,
                        path = %req.path.display(),
                        "reusing existing worktree"
                    );
                    return Ok(req.path.to_path_buf());
                }
                Some(branch) => {
                    return Err(TaskqError::Validation(format!(
                        "{} is a worktree for branch {branch}, expected {}",
                        req.path.display(),
                        req.branch
                    )));
                }
                None => {}
            }
        }
        if let Some(parent) = req.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| TaskqError::io(parent, e))?;
        }
        // A retried task keeps its branch; check it out again instead of recreating it.
        if git.branch_exists(req.branch)? {
            debug!(task_id = req.task_id, branch = req.branch, "reusing existing branch");
            git.prune_worktrees()?;
            git.add_worktree(req.path, req.branch)?;
        } else {
            git.add_worktree_from_base(req.path, req.branch, req.base)?;
        }
        info!(task_id = req.task_id, path = %req.path.display(), "worktree created");
        Ok(req.path.to_path_buf())
    }

    fn remove_worktree(&self, repo: &Path, path: &Path) -> Result<(), TaskqError> {
        let git = Git::from_dir(repo)?;
        git.remove_worktree(path, true)?;
        git.prune_worktrees()
    }
}
