#![forbid(unsafe_code)]

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::macros::format_description;

use crate::error::{AdapterFailure, Stage, TaskqError};
use crate::task::model::validate_task_id;

/// Front matter of a persisted error report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportHeader {
    pub task_id: String,
    pub attempt: u32,
    pub stage: Stage,
    pub exit_code: i32,
    pub timestamp: String,
    pub hint: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    pub path: PathBuf,
    pub header: ReportHeader,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct ReportInput<'a> {
    pub task_id: &'a str,
    pub attempt: u32,
    pub stage: Stage,
    pub exit_code: i32,
    pub message: &'a str,
    pub stdout: &'a str,
    pub stderr: &'a str,
    pub hint: Option<&'a str>,
}

impl<'a> ReportInput<'a> {
    #[must_use]
    pub fn from_failure(task_id: &'a str, attempt: u32, failure: &'a AdapterFailure) -> Self {
        Self {
            task_id,
            attempt,
            stage: failure.stage,
            exit_code: failure.exit_code,
            message: &failure.message,
            stdout: &failure.stdout,
            stderr: &failure.stderr,
            hint: None,
        }
    }
}

/// Writes one immutable markdown file per stage failure.
#[derive(Debug, Clone)]
pub struct ErrorReporter {
    dir: PathBuf,
    excerpt_bytes: usize,
}

impl ErrorReporter {
    #[must_use]
    pub fn new(dir: PathBuf, excerpt_bytes: usize) -> Self {
        Self { dir, excerpt_bytes }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn report(&self, input: &ReportInput<'_>) -> Result<PathBuf, TaskqError> {
        self.report_at(input, OffsetDateTime::now_utc())
    }

    fn report_at(&self, input: &ReportInput<'_>, now: OffsetDateTime) -> Result<PathBuf, TaskqError> {
        validate_task_id(input.task_id)?;
        std::fs::create_dir_all(&self.dir).map_err(|e| TaskqError::io(&self.dir, e))?;

        let header = ReportHeader {
            task_id: input.task_id.to_owned(),
            attempt: input.attempt,
            stage: input.stage,
            exit_code: input.exit_code,
            timestamp: now
                .format(&time::format_description::well_known::Rfc3339)
                .unwrap_or_else(|_| "unknown".to_owned()),
            hint: input
                .hint
                .map_or_else(|| default_hint(input.stage).to_owned(), str::to_owned),
        };
        let content = render(&header, input, self.excerpt_bytes)?;

        let stamp = file_stamp(now);
        for n in 0u32.. {
            let name = if n == 0 {
                format!("{}-{stamp}.md", input.task_id)
            } else {
                format!("{}-{stamp}-{n}.md", input.task_id)
            };
            let path = self.dir.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut f) => {
                    f.write_all(content.as_bytes())
                        .and_then(|()| f.sync_all())
                        .map_err(|e| TaskqError::io(&path, e))?;
                    return Ok(path);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(TaskqError::io(&path, e)),
            }
        }
        Err(TaskqError::Other(format!(
            "no free report name for task {}",
            input.task_id
        )))
    }

    pub fn load(&self, path: &Path) -> Result<ErrorReport, TaskqError> {
        let raw = std::fs::read_to_string(path).map_err(|e| TaskqError::io(path, e))?;
        let rest = raw
            .strip_prefix("---\n")
            .ok_or_else(|| TaskqError::Validation(format!("{}: missing front matter", path.display())))?;
        let (yaml, body) = rest
            .split_once("\n---\n")
            .ok_or_else(|| TaskqError::Validation(format!("{}: unterminated front matter", path.display())))?;
        let header: ReportHeader = serde_yaml::from_str(yaml)
            .map_err(|e| TaskqError::Validation(format!("{}: {e}", path.display())))?;
        Ok(ErrorReport {
            path: path.to_path_buf(),
            header,
            body: body.to_owned(),
        })
    }

    /// Reports for one task, oldest first.
    pub fn list_for_task(&self, task_id: &str) -> Result<Vec<PathBuf>, TaskqError> {
        validate_task_id(task_id)?;
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(TaskqError::io(&self.dir, e)),
        };
        let prefix = format!("{task_id}-");
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| TaskqError::io(&self.dir, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(rest) = name.strip_prefix(&prefix) else {
                continue;
            };
            if name.ends_with(".md") && is_stamp_prefix(rest) {
                out.push(entry.path());
            }
        }
        out.sort();
        Ok(out)
    }

    /// Delete every report of a task; returns how many were removed.
    pub fn remove_for_task(&self, task_id: &str) -> Result<usize, TaskqError> {
        let mut removed = 0;
        for path in self.list_for_task(task_id)? {
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(TaskqError::io(&path, e)),
            }
        }
        Ok(removed)
    }
}

#[must_use]
pub fn default_hint(stage: Stage) -> &'static str {
    match stage {
        Stage::Setup => {
            "Check that the repository, base branch and task file exist and that the container runtime is reachable."
        }
        Stage::Plan => "Inspect the agent output below; the plan command did not complete.",
        Stage::Execute => {
            "The plan was generated but executing it failed; inspect the worktree and agent output."
        }
        Stage::Finalize => "The task could not be moved to review; check the queue state.",
    }
}

/// Keep the last `max` bytes of `text`, cut at a char boundary.
#[must_use]
pub fn tail_excerpt(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_owned();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("[... {start} bytes truncated ...]\n{}", &text[start..])
}

fn render(header: &ReportHeader, input: &ReportInput<'_>, max: usize) -> Result<String, TaskqError> {
    let yaml = serde_yaml::to_string(header)
        .map_err(|e| TaskqError::Other(format!("failed to encode report header: {e}")))?;
    let mut out = format!("---\n{yaml}---\n");
    out.push_str(&format!(
        "# Task {} failed in {} (attempt {})\n\n",
        header.task_id, header.stage, header.attempt
    ));
    if !input.message.trim().is_empty() {
        out.push_str(input.message.trim());
        out.push_str("\n\n");
    }
    out.push_str(&format!("Exit code: {}\n\n", header.exit_code));
    out.push_str(&format!("## Hint\n\n{}\n\n", header.hint));
    for (title, text) in [("stdout", input.stdout), ("stderr", input.stderr)] {
        out.push_str(&format!("## {title}\n\n```\n"));
        let excerpt = tail_excerpt(text, max);
        out.push_str(excerpt.trim_end());
        out.push_str("\n```\n\n");
    }
    Ok(out)
}

fn file_stamp(now: OffsetDateTime) -> String {
    let fmt = format_description!("[year][month][day]T[hour][minute][second].[subsecond digits:6]Z");
    now.to_offset(time::UtcOffset::UTC)
        .format(&fmt)
        .unwrap_or_else(|_| now.unix_timestamp().to_string())
}

fn is_stamp_prefix(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() > 9 && b[..8].iter().all(u8::is_ascii_digit) && b[8] == b'T'
}
