#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TaskqError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Todo,
    Planning,
    Building,
    Review,
    Done,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Display order used by `status`.
    pub const ALL: [TaskStatus; 7] = [
        Self::Todo,
        Self::Planning,
        Self::Building,
        Self::Review,
        Self::Done,
        Self::Failed,
        Self::Cancelled,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::Planning => "planning",
            Self::Building => "building",
            Self::Review => "review",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }

    /// Owned by a running pipeline; may not be removed.
    #[must_use]
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Planning | Self::Building)
    }

    /// Statuses allowed to carry a port or container handle.
    #[must_use]
    pub fn allows_runtime_handles(self) -> bool {
        !matches!(self, Self::Todo | Self::Done | Self::Cancelled)
    }

    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        use TaskStatus::{Building, Cancelled, Done, Failed, Planning, Review, Todo};
        matches!(
            (self, to),
            (Todo, Planning | Cancelled)
                | (Planning, Building | Failed | Cancelled)
                | (Building, Review | Failed)
                | (Review, Done | Cancelled)
                | (Failed, Todo | Cancelled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = TaskqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|st| st.as_str() == s.trim())
            .ok_or_else(|| TaskqError::Validation(format!("unknown status '{s}'")))
    }
}

/// Handles that exist only while a task owns live runtime artifacts.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_config_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_data_dir: Option<String>,
}

impl RuntimeFields {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Overlay every field that is set in `other`.
    pub fn merge(&mut self, other: RuntimeFields) {
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.container_handle.is_some() {
            self.container_handle = other.container_handle;
        }
        if other.attempt_config_dir.is_some() {
            self.attempt_config_dir = other.attempt_config_dir;
        }
        if other.attempt_data_dir.is_some() {
            self.attempt_data_dir = other.attempt_data_dir;
        }
    }

    pub fn clear_handles(&mut self) {
        self.port = None;
        self.container_handle = None;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskRecord {
    pub id: String,
    pub status: TaskStatus,
    pub repo: String,
    pub base_branch: String,
    pub branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_file: Option<String>,
    pub attempt: u32,
    #[serde(flatten)]
    pub runtime: RuntimeFields,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_ref: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Caller-supplied coordinates for a new task; status and attempt are assigned by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    pub id: String,
    pub repo: String,
    pub base_branch: String,
    pub branch: String,
    pub worktree_path: Option<String>,
    pub task_file: Option<String>,
}

impl NewTask {
    pub fn validate(&self) -> Result<(), TaskqError> {
        validate_task_id(&self.id)?;
        if self.repo.trim().is_empty() {
            return Err(TaskqError::Validation("repo is required".to_owned()));
        }
        if self.base_branch.trim().is_empty() {
            return Err(TaskqError::Validation("base branch is required".to_owned()));
        }
        if self.branch.trim().is_empty() {
            return Err(TaskqError::Validation("branch is required".to_owned()));
        }
        Ok(())
    }

    #[must_use]
    pub fn into_record(self, now: &str) -> TaskRecord {
        TaskRecord {
            id: self.id,
            status: TaskStatus::Todo,
            repo: self.repo,
            base_branch: self.base_branch,
            branch: self.branch,
            worktree_path: self.worktree_path,
            task_file: self.task_file,
            attempt: 1,
            runtime: RuntimeFields::default(),
            error_ref: None,
            created_at: now.to_owned(),
            updated_at: now.to_owned(),
        }
    }
}

impl TaskRecord {
    /// Field constraints that must hold in every persisted snapshot.
    pub fn validate(&self) -> Result<(), TaskqError> {
        validate_task_id(&self.id)?;
        if self.attempt == 0 {
            return Err(TaskqError::Validation(format!(
                "task '{}': attempt must be >= 1",
                self.id
            )));
        }
        if !self.status.allows_runtime_handles()
            && (self.runtime.port.is_some() || self.runtime.container_handle.is_some())
        {
            return Err(TaskqError::Validation(format!(
                "task '{}': runtime handles present in '{}' status",
                self.id, self.status
            )));
        }
        if self.error_ref.is_some() && self.status != TaskStatus::Failed {
            return Err(TaskqError::Validation(format!(
                "task '{}': error reference present in '{}' status",
                self.id, self.status
            )));
        }
        Ok(())
    }

    /// Constraints between two successive snapshots of the same record.
    pub fn validate_successor(&self, next: &TaskRecord) -> Result<(), TaskqError> {
        let immutable = next.id == self.id
            && next.repo == self.repo
            && next.base_branch == self.base_branch
            && next.branch == self.branch
            && next.created_at == self.created_at;
        if !immutable {
            return Err(TaskqError::Validation(format!(
                "task '{}': execution-target coordinates are immutable",
                self.id
            )));
        }
        if self.worktree_path.is_some() && next.worktree_path != self.worktree_path {
            return Err(TaskqError::Validation(format!(
                "task '{}': worktree path is already resolved",
                self.id
            )));
        }
        if next.attempt < self.attempt {
            return Err(TaskqError::Validation(format!(
                "task '{}': attempt may not decrease ({} -> {})",
                self.id, self.attempt, next.attempt
            )));
        }
        next.validate()
    }
}

pub fn validate_task_id(id: &str) -> Result<(), TaskqError> {
    if id.trim().is_empty() {
        return Err(TaskqError::Validation("task ID is required".to_owned()));
    }
    if id.trim() != id {
        return Err(TaskqError::Validation(format!(
            "invalid task ID '{id}': must not have surrounding whitespace"
        )));
    }
    if id.contains('/') || id.contains('\\') {
        return Err(TaskqError::Validation(format!(
            "invalid task ID '{id}': must not contain path separators"
        )));
    }
    if id.contains("..") {
        return Err(TaskqError::Validation(format!(
            "invalid task ID '{id}': must not contain '..'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: TaskStatus) -> TaskRecord {
        let mut r = NewTask {
            id: "T-1".to_owned(),
            repo: "/repo".to_owned(),
            base_branch: "main".to_owned(),
            branch: "task/t-1".to_owned(),
            worktree_path: None,
            task_file: None,
        }
        .into_record("2026-01-01T00:00:00Z");
        r.status = status;
        r
    }

    #[test]
    fn transition_table_matches_state_machine() {
        use TaskStatus::{Building, Cancelled, Done, Failed, Planning, Review, Todo};
        let legal = [
            (Todo, Planning),
            (Todo, Cancelled),
            (Planning, Building),
            (Planning, Failed),
            (Planning, Cancelled),
            (Building, Review),
            (Building, Failed),
            (Review, Done),
            (Review, Cancelled),
            (Failed, Todo),
            (Failed, Cancelled),
        ];
        for from in TaskStatus::ALL {
            for to in TaskStatus::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    legal.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn terminal_statuses_have_no_exits() {
        for to in TaskStatus::ALL {
            assert!(!TaskStatus::Done.can_transition_to(to));
            assert!(!TaskStatus::Cancelled.can_transition_to(to));
        }
    }

    #[test]
    fn status_round_trips_through_strings() {
        for st in TaskStatus::ALL {
            assert_eq!(st.as_str().parse::<TaskStatus>().unwrap(), st);
        }
        assert!("running".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn todo_record_with_port_is_rejected() {
        let mut r = record(TaskStatus::Todo);
        r.runtime.port = Some(30000);
        assert!(r.validate().is_err());

        r.status = TaskStatus::Building;
        r.validate().unwrap();
    }

    #[test]
    fn error_ref_only_while_failed() {
        let mut r = record(TaskStatus::Failed);
        r.error_ref = Some("errors/T-1.md".to_owned());
        r.validate().unwrap();
        r.status = TaskStatus::Review;
        assert!(r.validate().is_err());
    }

    #[test]
    fn successor_cannot_lower_attempt_or_move_worktree() {
        let mut prev = record(TaskStatus::Failed);
        prev.attempt = 2;
        prev.worktree_path = Some("/wt/a".to_owned());

        let mut next = prev.clone();
        next.attempt = 1;
        assert!(prev.validate_successor(&next).is_err());

        let mut next = prev.clone();
        next.worktree_path = Some("/wt/b".to_owned());
        assert!(prev.validate_successor(&next).is_err());

        let mut next = prev.clone();
        next.branch = "other".to_owned();
        assert!(prev.validate_successor(&next).is_err());
    }

    #[test]
    fn runtime_merge_only_overlays_present_fields() {
        let mut rt = RuntimeFields {
            port: Some(1),
            container_handle: Some("c1".to_owned()),
            ..RuntimeFields::default()
        };
        rt.merge(RuntimeFields {
            container_handle: Some("c2".to_owned()),
            ..RuntimeFields::default()
        });
        assert_eq!(rt.port, Some(1));
        assert_eq!(rt.container_handle.as_deref(), Some("c2"));
    }

    #[test]
    fn task_ids_reject_path_tricks() {
        assert!(validate_task_id("").is_err());
        assert!(validate_task_id("a/b").is_err());
        assert!(validate_task_id("..x").is_err());
        assert!(validate_task_id(" T-1").is_err());
        validate_task_id("T-1").unwrap();
    }
}
