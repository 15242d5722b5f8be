#![forbid(unsafe_code)]

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::TaskqError;
use crate::task::model::validate_task_id;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FrontMatter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<String>,
}

/// A human-authored task description.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFile {
    pub front: FrontMatter,
    pub body: String,
}

impl TaskFile {
    /// Content without a leading `---` block is all body.
    pub fn parse(content: &str) -> Result<Self, TaskqError> {
        let re = Regex::new(r"(?s)\A---[ \t]*\r?\n(.*?)\r?\n---[ \t]*(?:\r?\n)?(.*)\z")
            .map_err(|e| TaskqError::Other(format!("front matter pattern: {e}")))?;
        let Some(caps) = re.captures(content) else {
            return Ok(Self {
                front: FrontMatter::default(),
                body: content.to_owned(),
            });
        };
        let yaml = caps.get(1).map_or("", |m| m.as_str());
        let body = caps.get(2).map_or("", |m| m.as_str()).to_owned();

        let value: serde_yaml::Value = serde_yaml::from_str(yaml)
            .map_err(|e| TaskqError::Validation(format!("invalid front matter: {e}")))?;
        let front = match value {
            serde_yaml::Value::Null => FrontMatter::default(),
            serde_yaml::Value::Mapping(_) => serde_yaml::from_value(value)
                .map_err(|e| TaskqError::Validation(format!("invalid front matter: {e}")))?,
            _ => {
                return Err(TaskqError::Validation(
                    "front matter must be a YAML mapping".to_owned(),
                ));
            }
        };
        Ok(Self { front, body })
    }

    pub fn render(&self) -> Result<String, TaskqError> {
        if self.front == FrontMatter::default() {
            return Ok(self.body.clone());
        }
        let yaml = serde_yaml::to_string(&self.front)
            .map_err(|e| TaskqError::Other(format!("failed to encode front matter: {e}")))?;
        Ok(format!("---\n{yaml}---\n{}", self.body))
    }
}

/// Canonical `tasks/<id>.md` files under the queue directory.
#[derive(Debug, Clone)]
pub struct TaskFiles {
    dir: PathBuf,
}

impl TaskFiles {
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn path_for(&self, task_id: &str) -> Result<PathBuf, TaskqError> {
        validate_task_id(task_id)?;
        Ok(self.dir.join(format!("{task_id}.md")))
    }

    pub fn write(&self, task_id: &str, file: &TaskFile) -> Result<PathBuf, TaskqError> {
        let path = self.path_for(task_id)?;
        std::fs::create_dir_all(&self.dir).map_err(|e| TaskqError::io(&self.dir, e))?;
        let tmp = path.with_extension("md.tmp");
        std::fs::write(&tmp, file.render()?).map_err(|e| TaskqError::io(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| TaskqError::io(&path, e))?;
        Ok(path)
    }

    /// Like [`TaskFiles::write`] but never replaces an existing file.
    ///
    /// Returns `Ok(None)` when `<id>.md` is already present.
    pub fn create(&self, task_id: &str, file: &TaskFile) -> Result<Option<PathBuf>, TaskqError> {
        let path = self.path_for(task_id)?;
        std::fs::create_dir_all(&self.dir).map_err(|e| TaskqError::io(&self.dir, e))?;
        let rendered = file.render()?;
        let mut out = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(TaskqError::io(&path, e)),
        };
        if let Err(e) = out.write_all(rendered.as_bytes()).and_then(|()| out.sync_all()) {
            drop(out);
            let _ = std::fs::remove_file(&path);
            return Err(TaskqError::io(&path, e));
        }
        Ok(Some(path))
    }

    /// Returns whether a file was removed.
    pub fn remove(&self, task_id: &str) -> Result<bool, TaskqError> {
        let path = self.path_for(task_id)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(TaskqError::io(&path, e)),
        }
    }
}

pub fn read_task_file(path: &Path) -> Result<TaskFile, TaskqError> {
    let raw = std::fs::read_to_string(path).map_err(|e| TaskqError::io(path, e))?;
    TaskFile::parse(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_front_matter_and_body() {
        let f = TaskFile::parse("---\nid: T-7\nrepo: /src/app\n---\nDo the thing.\n").unwrap();
        assert_eq!(f.front.id.as_deref(), Some("T-7"));
        assert_eq!(f.front.repo.as_deref(), Some("/src/app"));
        assert_eq!(f.front.base, None);
        assert_eq!(f.body, "Do the thing.\n");
    }

    #[test]
    fn content_without_delimiters_is_body() {
        let f = TaskFile::parse("just text\n---\nnot yaml").unwrap();
        assert_eq!(f.front, FrontMatter::default());
        assert_eq!(f.body, "just text\n---\nnot yaml");
    }

    #[test]
    fn rejects_non_mapping_front_matter() {
        assert!(matches!(
            TaskFile::parse("---\n- a\n- b\n---\nbody").unwrap_err(),
            TaskqError::Validation(_)
        ));
        assert!(matches!(
            TaskFile::parse("---\nid: [unclosed\n---\nbody").unwrap_err(),
            TaskqError::Validation(_)
        ));
    }

    #[test]
    fn write_normalises_front_matter() {
        let dir = tempfile::tempdir().expect("tempdir");
        let files = TaskFiles::new(dir.path().join("tasks"));
        let file = TaskFile {
            front: FrontMatter {
                id: Some("T-1".to_owned()),
                base: Some("main".to_owned()),
                ..FrontMatter::default()
            },
            body: "Fix it.\n".to_owned(),
        };
        let path = files.write("T-1", &file).unwrap();
        assert_eq!(path, dir.path().join("tasks/T-1.md"));
        assert_eq!(read_task_file(&path).unwrap(), file);

        assert!(files.remove("T-1").unwrap());
        assert!(!files.remove("T-1").unwrap());
        assert!(files.path_for("../x").is_err());
    }

    #[test]
    fn create_never_replaces_an_existing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let files = TaskFiles::new(dir.path().join("tasks"));
        let first = TaskFile {
            front: FrontMatter::default(),
            body: "first\n".to_owned(),
        };
        let second = TaskFile {
            front: FrontMatter::default(),
            body: "second\n".to_owned(),
        };
        let path = files.create("T-1", &first).unwrap().expect("created");
        assert!(files.create("T-1", &second).unwrap().is_none());
        assert_eq!(read_task_file(&path).unwrap().body, "first\n");
    }
}
