#![forbid(unsafe_code)]

use std::fs::File;
use std::io::{BufRead as _, BufReader, BufWriter, Write as _};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::TaskqError;
use crate::task::lock::{LockMode, StoreLock};
use crate::task::model::{NewTask, RuntimeFields, TaskRecord, TaskStatus};
use crate::task::now_rfc3339;

/// Line-per-task record store shared by every worker process on the host.
///
/// Every mutation holds the exclusive lock across read, validate, mutate and
/// write-back; the new snapshot is written to a side file and renamed over the
/// canonical one so readers only ever see complete snapshots.
#[derive(Debug, Clone)]
pub struct QueueStore {
    path: PathBuf,
    lock_path: PathBuf,
    tmp_path: PathBuf,
    lock_timeout: Duration,
}

impl QueueStore {
    pub fn open(path: PathBuf, lock_timeout: Duration) -> Result<Self, TaskqError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| TaskqError::io(parent, e))?;
        }
        let store = Self {
            lock_path: path.with_extension("jsonl.lock"),
            tmp_path: path.with_extension("jsonl.tmp"),
            path,
            lock_timeout,
        };
        if !store.path.exists() {
            let _lock = store.lock(LockMode::Exclusive)?;
            if !store.path.exists() {
                File::create(&store.path).map_err(|e| TaskqError::io(&store.path, e))?;
            }
        }
        Ok(store)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn add(&self, task: NewTask) -> Result<TaskRecord, TaskqError> {
        task.validate()?;
        let record = task.into_record(&now_rfc3339());
        record.validate()?;
        self.mutate(|records| {
            if records.iter().any(|r| r.id == record.id) {
                return Err(TaskqError::DuplicateId(record.id.clone()));
            }
            records.push(record.clone());
            Ok(record.clone())
        })
    }

    pub fn get(&self, id: &str) -> Result<TaskRecord, TaskqError> {
        self.find(id)?
            .ok_or_else(|| TaskqError::NotFound(id.to_owned()))
    }

    pub fn find(&self, id: &str) -> Result<Option<TaskRecord>, TaskqError> {
        Ok(self.snapshot()?.into_iter().find(|r| r.id == id))
    }

    pub fn list(&self, status: Option<TaskStatus>) -> Result<Vec<TaskRecord>, TaskqError> {
        let mut records = self.snapshot()?;
        if let Some(status) = status {
            records.retain(|r| r.status == status);
        }
        Ok(records)
    }

    pub fn claim_first_todo(&self) -> Result<TaskRecord, TaskqError> {
        self.mutate(|records| {
            let idx = records
                .iter()
                .position(|r| r.status == TaskStatus::Todo)
                .ok_or(TaskqError::NoAvailableTask)?;
            let next = transitioned(&records[idx], TaskStatus::Todo, TaskStatus::Planning)?;
            records[idx] = next.clone();
            Ok(next)
        })
    }

    pub fn claim_specific(&self, id: &str) -> Result<TaskRecord, TaskqError> {
        self.mutate(|records| {
            let idx = index_of(records, id)?;
            let status = records[idx].status;
            if status != TaskStatus::Todo {
                return Err(TaskqError::InvalidState {
                    id: id.to_owned(),
                    status,
                    op: "claim",
                });
            }
            let next = transitioned(&records[idx], TaskStatus::Todo, TaskStatus::Planning)?;
            records[idx] = next.clone();
            Ok(next)
        })
    }

    /// Compare-and-swap status change.
    pub fn update_status(
        &self,
        id: &str,
        expected_from: TaskStatus,
        to: TaskStatus,
    ) -> Result<TaskRecord, TaskqError> {
        self.transition_with(id, expected_from, to, |_| {})
    }

    /// Status change plus extra field edits applied in the same locked write.
    ///
    /// The status itself is always set by the store after `edit` runs.
    pub fn transition_with(
        &self,
        id: &str,
        expected_from: TaskStatus,
        to: TaskStatus,
        edit: impl FnOnce(&mut TaskRecord),
    ) -> Result<TaskRecord, TaskqError> {
        self.update(id, |current| {
            let mut next = current.clone();
            edit(&mut next);
            next.status = current.status;
            transitioned(&next, expected_from, to)
        })
    }

    pub fn set_runtime_fields(
        &self,
        id: &str,
        fields: RuntimeFields,
    ) -> Result<TaskRecord, TaskqError> {
        self.update(id, |current| {
            if !current.status.allows_runtime_handles() || current.status == TaskStatus::Failed {
                return Err(TaskqError::InvalidState {
                    id: id.to_owned(),
                    status: current.status,
                    op: "set runtime fields on",
                });
            }
            let mut next = current.clone();
            next.runtime.merge(fields);
            Ok(next)
        })
    }

    pub fn clear_runtime_fields(&self, id: &str) -> Result<TaskRecord, TaskqError> {
        self.mutate(|records| {
            let idx = index_of(records, id)?;
            if records[idx].runtime.is_empty() {
                return Ok(records[idx].clone());
            }
            let mut next = records[idx].clone();
            next.runtime = RuntimeFields::default();
            next.updated_at = now_rfc3339();
            records[idx].validate_successor(&next)?;
            records[idx] = next.clone();
            Ok(next)
        })
    }

    pub fn resolve_worktree_path(&self, id: &str, path: &str) -> Result<String, TaskqError> {
        let record = self.update(id, |current| {
            let mut next = current.clone();
            if next.worktree_path.is_none() {
                next.worktree_path = Some(path.to_owned());
            }
            Ok(next)
        })?;
        record
            .worktree_path
            .ok_or_else(|| TaskqError::Other(format!("worktree path unresolved for {id}")))
    }

    pub fn remove(&self, id: &str) -> Result<TaskRecord, TaskqError> {
        self.mutate(|records| {
            let idx = index_of(records, id)?;
            let status = records[idx].status;
            if status.is_in_flight() {
                return Err(TaskqError::InvalidState {
                    id: id.to_owned(),
                    status,
                    op: "remove",
                });
            }
            Ok(records.remove(idx))
        })
    }

    fn update(
        &self,
        id: &str,
        f: impl FnOnce(&TaskRecord) -> Result<TaskRecord, TaskqError>,
    ) -> Result<TaskRecord, TaskqError> {
        self.mutate(|records| {
            let idx = index_of(records, id)?;
            let mut next = f(&records[idx])?;
            next.updated_at = now_rfc3339();
            records[idx].validate_successor(&next)?;
            records[idx] = next.clone();
            Ok(next)
        })
    }

    /// Exclusive read-modify-write. Nothing is written when `f` fails.
    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut Vec<TaskRecord>) -> Result<T, TaskqError>,
    ) -> Result<T, TaskqError> {
        let _lock = self.lock(LockMode::Exclusive)?;
        let mut records = self.read_all()?;
        let out = f(&mut records)?;
        self.write_all(&records)?;
        Ok(out)
    }

    fn snapshot(&self) -> Result<Vec<TaskRecord>, TaskqError> {
        let _lock = self.lock(LockMode::Shared)?;
        self.read_all()
    }

    fn lock(&self, mode: LockMode) -> Result<StoreLock, TaskqError> {
        StoreLock::acquire(&self.lock_path, mode, self.lock_timeout)
    }

    fn read_all(&self) -> Result<Vec<TaskRecord>, TaskqError> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(TaskqError::io(&self.path, e)),
        };
        let mut records = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| TaskqError::io(&self.path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            let record: TaskRecord =
                serde_json::from_str(&line).map_err(|e| TaskqError::CorruptStore {
                    path: self.path.clone(),
                    line: idx + 1,
                    msg: e.to_string(),
                })?;
            records.push(record);
        }
        Ok(records)
    }

    fn write_all(&self, records: &[TaskRecord]) -> Result<(), TaskqError> {
        let result = self.write_tmp(records).and_then(|()| {
            std::fs::rename(&self.tmp_path, &self.path).map_err(|e| TaskqError::io(&self.path, e))
        });
        if result.is_err() {
            let _ = std::fs::remove_file(&self.tmp_path);
        }
        result
    }

    fn write_tmp(&self, records: &[TaskRecord]) -> Result<(), TaskqError> {
        let file = File::create(&self.tmp_path).map_err(|e| TaskqError::io(&self.tmp_path, e))?;
        let mut w = BufWriter::new(file);
        for record in records {
            record.validate()?;
            let line = serde_json::to_string(record)
                .map_err(|e| TaskqError::Other(format!("failed to encode {}: {e}", record.id)))?;
            w.write_all(line.as_bytes())
                .and_then(|()| w.write_all(b"\n"))
                .map_err(|e| TaskqError::io(&self.tmp_path, e))?;
        }
        let file = w
            .into_inner()
            .map_err(|e| TaskqError::io(&self.tmp_path, e.into_error()))?;
        file.sync_all()
            .map_err(|e| TaskqError::io(&self.tmp_path, e))
    }
}

fn index_of(records: &[TaskRecord], id: &str) -> Result<usize, TaskqError> {
    records
        .iter()
        .position(|r| r.id == id)
        .ok_or_else(|| TaskqError::NotFound(id.to_owned()))
}

/// Apply one edge of the state machine, normalising fields the target status may not carry.
fn transitioned(
    current: &TaskRecord,
    expected_from: TaskStatus,
    to: TaskStatus,
) -> Result<TaskRecord, TaskqError> {
    if current.status != expected_from {
        return Err(TaskqError::StaleState {
            id: current.id.clone(),
            expected: expected_from,
            actual: current.status,
        });
    }
    if !expected_from.can_transition_to(to) {
        return Err(TaskqError::InvalidTransition {
            from: expected_from,
            to,
        });
    }
    let mut next = current.clone();
    next.status = to;
    if !to.allows_runtime_handles() {
        next.runtime.clear_handles();
    }
    if to != TaskStatus::Failed {
        next.error_ref = None;
    }
    next.updated_at = now_rfc3339();
    Ok(next)
}
