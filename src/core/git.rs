#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use crate::error::TaskqError;

#[derive(Debug, Clone)]
pub struct Git {
    repo_root: PathBuf,
}

impl Git {
    pub fn from_dir(dir: &Path) -> Result<Self, TaskqError> {
        let repo_root = find_repo_root(dir).ok_or_else(|| {
            TaskqError::Validation(format!("not a git repository: {}", dir.display()))
        })?;
        Ok(Self { repo_root })
    }

    #[must_use]
    pub fn new(repo_root: PathBuf) -> Self {
        Self { repo_root }
    }

    #[must_use]
    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool, TaskqError> {
        let refname = format!("refs/heads/{branch}");
        let out = self.run_raw(&["rev-parse", "--verify", "--quiet", &refname])?;
        Ok(out.status.success())
    }

    /// Create `branch` from `base` and check it out at `path`.
    pub fn add_worktree_from_base(
        &self,
        path: &Path,
        branch: &str,
        base: &str,
    ) -> Result<(), TaskqError> {
        let path = path.to_string_lossy();
        let _ = self.run(&["worktree", "add", "-b", branch, &path, base])?;
        Ok(())
    }

    /// Check out an existing `branch` at `path`.
    pub fn add_worktree(&self, path: &Path, branch: &str) -> Result<(), TaskqError> {
        let path = path.to_string_lossy();
        let _ = self.run(&["worktree", "add", &path, branch])?;
        Ok(())
    }

    pub fn remove_worktree(&self, path: &Path, force: bool) -> Result<(), TaskqError> {
        let path = path.to_string_lossy();
        if force {
            let _ = self.run(&["worktree", "remove", "--force", &path])?;
        } else {
            let _ = self.run(&["worktree", "remove", &path])?;
        }
        Ok(())
    }

    /// Branch checked out by the registered worktree at `path`, if any.
    pub fn worktree_branch(&self, path: &Path) -> Result<Option<String>, TaskqError> {
        let wanted = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let listing = self.run(&["worktree", "list", "--porcelain"])?;
        Ok(parse_worktree_branch(&listing, &wanted))
    }

    pub fn prune_worktrees(&self) -> Result<(), TaskqError> {
        let _ = self.run(&["worktree", "prune"])?;
        Ok(())
    }

    pub fn run(&self, args: &[&str]) -> Result<String, TaskqError> {
        let out = self.run_raw(args)?;
        if out.status.success() {
            Ok(String::from_utf8_lossy(&out.stdout).to_string())
        } else {
            let stderr = String::from_utf8_lossy(&out.stderr);
            Err(TaskqError::Other(format!(
                "git {}: {}",
                args.join(" "),
                stderr.trim()
            )))
        }
    }

    pub fn run_raw(&self, args: &[&str]) -> Result<Output, TaskqError> {
        Command::new("git")
            .args(args)
            .current_dir(&self.repo_root)
            .output()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    TaskqError::Other("git executable not found in PATH".to_owned())
                }
                _ => TaskqError::Other(format!("failed to run git: {e}")),
            })
    }
}

fn parse_worktree_branch(porcelain: &str, wanted: &Path) -> Option<String> {
    porcelain.split("\n\n").find_map(|entry| {
        let mut path = None;
        let mut branch = None;
        for line in entry.lines() {
            if let Some(p) = line.strip_prefix("worktree ") {
                path = Some(PathBuf::from(p));
            } else if let Some(b) = line.strip_prefix("branch ") {
                branch = Some(b.strip_prefix("refs/heads/").unwrap_or(b).to_owned());
            }
        }
        let path = path?;
        let path = std::fs::canonicalize(&path).unwrap_or(path);
        if path == wanted { branch } else { None }
    })
}

fn find_repo_root(start: &Path) -> Option<PathBuf> {
    let mut cur = Some(start);
    while let Some(dir) = cur {
        let candidate = dir.join(".git");
        if candidate.is_dir() || candidate.is_file() {
            return Some(dir.to_path_buf());
        }
        cur = dir.parent();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worktree_listing_maps_paths_to_branches() {
        let listing = "worktree /srv/repo\nHEAD 1111\nbranch refs/heads/main\n\n\
                       worktree /srv/wt/T-1\nHEAD 2222\nbranch refs/heads/task/t-1\n\n\
                       worktree /srv/wt/detached\nHEAD 3333\ndetached\n";
        assert_eq!(
            parse_worktree_branch(listing, Path::new("/srv/wt/T-1")).as_deref(),
            Some("task/t-1")
        );
        assert_eq!(parse_worktree_branch(listing, Path::new("/srv/wt/detached")), None);
        assert_eq!(parse_worktree_branch(listing, Path::new("/srv/wt/T-2")), None);
    }
}
