#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use taskq::adapters::{
    AgentAdapter, AgentOutput, ContainerAdapter, GitAdapter, LaunchRequest, WorktreeRequest,
};
use taskq::core::naming::default_branch_name;
use taskq::error::{Stage, TaskqError};
use taskq::pipeline::ports::PortAllocator;
use taskq::pipeline::processor::{Adapters, Processor, ProcessorOptions};
use taskq::task::attempt::AttemptManager;
use taskq::task::files::{TaskFile, TaskFiles};
use taskq::task::model::{NewTask, TaskRecord};
use taskq::task::report::ErrorReporter;
use taskq::task::storage::QueueStore;

pub const PORT_START: u16 = 45000;
pub const PORT_END: u16 = 45009;

type Hook = Box<dyn FnOnce(&str) + Send>;

/// Creates and deletes plain directories instead of git worktrees.
///
/// Like `git worktree add`, creating over an existing directory fails unless
/// it is a worktree this fake made for the same branch.
#[derive(Default)]
pub struct FakeGit {
    pub created: Mutex<Vec<PathBuf>>,
    worktrees: Mutex<HashMap<PathBuf, String>>,
    pub removed: Mutex<Vec<PathBuf>>,
    on_create: Mutex<Option<Hook>>,
}

impl FakeGit {
    /// Run `hook(task_id)` inside the next `create_worktree` call.
    pub fn on_next_create(&self, hook: impl FnOnce(&str) + Send + 'static) {
        *self.on_create.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

impl GitAdapter for FakeGit {
    fn create_worktree(&self, req: &WorktreeRequest<'_>) -> Result<PathBuf, TaskqError> {
        if let Some(hook) = self.on_create.lock().unwrap().take() {
            hook(req.task_id);
        }
        let mut worktrees = self.worktrees.lock().unwrap();
        if req.path.exists() {
            return match worktrees.get(req.path) {
                Some(branch) if branch == req.branch => Ok(req.path.to_path_buf()),
                _ => Err(TaskqError::Other(format!(
                    "fatal: '{}' already exists",
                    req.path.display()
                ))),
            };
        }
        std::fs::create_dir_all(req.path).map_err(|e| TaskqError::Other(e.to_string()))?;
        worktrees.insert(req.path.to_path_buf(), req.branch.to_owned());
        self.created.lock().unwrap().push(req.path.to_path_buf());
        Ok(req.path.to_path_buf())
    }

    fn remove_worktree(&self, _repo: &Path, path: &Path) -> Result<(), TaskqError> {
        std::fs::remove_dir_all(path).map_err(|e| TaskqError::Other(e.to_string()))?;
        self.worktrees.lock().unwrap().remove(path);
        self.removed.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launched {
    pub handle: String,
    pub task_id: String,
    pub port: u16,
    pub config_dir: PathBuf,
}

/// In-memory container runtime. Handles look like `ctr-<task id>-<n>`.
#[derive(Default)]
pub struct FakeContainer {
    next: AtomicUsize,
    pub launches: Mutex<Vec<Launched>>,
    live: Mutex<BTreeMap<String, String>>,
    pub removed: Mutex<Vec<String>>,
    fail_launch: Mutex<bool>,
}

impl FakeContainer {
    pub fn fail_next_launch(&self) {
        *self.fail_launch.lock().unwrap() = true;
    }

    pub fn live(&self) -> Vec<String> {
        self.live.lock().unwrap().keys().cloned().collect()
    }

    pub fn live_for(&self, task_id: &str) -> usize {
        self.live
            .lock()
            .unwrap()
            .values()
            .filter(|t| *t == task_id)
            .count()
    }

    pub fn launches_for(&self, task_id: &str) -> Vec<Launched> {
        self.launches
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.task_id == task_id)
            .cloned()
            .collect()
    }
}

impl ContainerAdapter for FakeContainer {
    fn launch(&self, req: &LaunchRequest<'_>) -> Result<String, TaskqError> {
        if std::mem::take(&mut *self.fail_launch.lock().unwrap()) {
            return Err(taskq::error::AdapterFailure::exited(
                Stage::Setup,
                125,
                String::new(),
                "image not found".to_owned(),
            )
            .into());
        }
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        let handle = format!("ctr-{}-{n}", req.task_id);
        self.live
            .lock()
            .unwrap()
            .insert(handle.clone(), req.task_id.to_owned());
        self.launches.lock().unwrap().push(Launched {
            handle: handle.clone(),
            task_id: req.task_id.to_owned(),
            port: req.port,
            config_dir: req.config_dir.to_path_buf(),
        });
        Ok(handle)
    }

    fn list_by_task_id(&self, task_id: &str) -> Result<Vec<String>, TaskqError> {
        Ok(self
            .live
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, t)| *t == task_id)
            .map(|(h, _)| h.clone())
            .collect())
    }

    fn remove(&self, handle: &str) -> Result<(), TaskqError> {
        self.live.lock().unwrap().remove(handle);
        self.removed.lock().unwrap().push(handle.to_owned());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    Exit(i32),
    Timeout,
    Raise,
}

/// Agent whose result per task and stage is scripted; unscripted calls succeed.
#[derive(Default)]
pub struct FakeAgent {
    script: Mutex<HashMap<(String, Stage), Behaviour>>,
    pub calls: Mutex<Vec<(String, Stage)>>,
    delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl FakeAgent {
    pub fn set(&self, task_id: &str, stage: Stage, behaviour: Behaviour) {
        self.script
            .lock()
            .unwrap()
            .insert((task_id.to_owned(), stage), behaviour);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    fn call(&self, handle: &str, stage: Stage) -> Result<AgentOutput, TaskqError> {
        let task_id = task_of(handle);
        self.calls.lock().unwrap().push((task_id.clone(), stage));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let behaviour = self
            .script
            .lock()
            .unwrap()
            .get(&(task_id, stage))
            .copied()
            .unwrap_or(Behaviour::Exit(0));
        match behaviour {
            Behaviour::Exit(code) => Ok(AgentOutput {
                exit_code: code,
                stdout: format!("{stage} stdout"),
                stderr: if code == 0 {
                    String::new()
                } else {
                    format!("{stage} went wrong")
                },
            }),
            Behaviour::Timeout => Err(TaskqError::Timeout {
                what: format!("{stage} command"),
                after: Duration::from_secs(1),
            }),
            Behaviour::Raise => Err(TaskqError::Other("agent crashed".to_owned())),
        }
    }
}

fn task_of(handle: &str) -> String {
    let rest = handle.strip_prefix("ctr-").unwrap_or(handle);
    rest.rsplit_once('-').map_or(rest, |(t, _)| t).to_owned()
}

impl AgentAdapter for FakeAgent {
    fn make_plan(&self, handle: &str, _prompt: &str) -> Result<AgentOutput, TaskqError> {
        self.call(handle, Stage::Plan)
    }

    fn execute_plan(&self, handle: &str, _prompt: &str) -> Result<AgentOutput, TaskqError> {
        self.call(handle, Stage::Execute)
    }
}

/// A queue directory in a tempdir wired to the fakes above.
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub repo: PathBuf,
    pub store: QueueStore,
    pub files: TaskFiles,
    pub reporter: ErrorReporter,
    pub attempts: AttemptManager,
    pub ports: Arc<PortAllocator>,
    pub git: Arc<FakeGit>,
    pub container: Arc<FakeContainer>,
    pub agent: Arc<FakeAgent>,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let queue = dir.path().join("queue");
        let repo = dir.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();

        let host_config = dir.path().join("host-config");
        let host_data = dir.path().join("host-data");
        std::fs::create_dir_all(&host_config).unwrap();
        std::fs::create_dir_all(&host_data).unwrap();
        std::fs::write(host_config.join("opencode.json"), "{}").unwrap();
        std::fs::write(host_data.join("auth.json"), "{\"token\":\"x\"}").unwrap();

        Self {
            store: QueueStore::open(queue.join("tasks.jsonl"), Duration::from_secs(5)).unwrap(),
            files: TaskFiles::new(queue.join("tasks")),
            reporter: ErrorReporter::new(queue.join("errors"), 256),
            attempts: AttemptManager::new(queue.join("attempts"))
                .with_host_dirs(host_config, host_data),
            ports: Arc::new(PortAllocator::new(PORT_START, PORT_END, "127.0.0.1").without_bind_check()),
            git: Arc::new(FakeGit::default()),
            container: Arc::new(FakeContainer::default()),
            agent: Arc::new(FakeAgent::default()),
            repo,
            dir,
        }
    }

    pub fn worktree_base(&self) -> PathBuf {
        self.dir.path().join("worktrees")
    }

    pub fn add_task(&self, id: &str) -> TaskRecord {
        let file = TaskFile {
            body: format!("Implement {id}.\n"),
            ..TaskFile::default()
        };
        let path = self.files.write(id, &file).unwrap();
        self.store
            .add(NewTask {
                id: id.to_owned(),
                repo: self.repo.to_string_lossy().into_owned(),
                base_branch: "main".to_owned(),
                branch: default_branch_name(id),
                worktree_path: None,
                task_file: Some(path.to_string_lossy().into_owned()),
            })
            .unwrap()
    }

    pub fn processor(&self, cleanup_on_fail: bool, dirty_run: bool) -> Arc<Processor> {
        let adapters = Adapters {
            git: self.git.clone(),
            container: self.container.clone(),
            agent: self.agent.clone(),
        };
        Arc::new(Processor::new(
            self.store.clone(),
            self.attempts.clone(),
            self.reporter.clone(),
            Arc::clone(&self.ports),
            adapters,
            ProcessorOptions {
                cleanup_on_fail,
                dirty_run,
                worktree_base_dir: self.worktree_base(),
                naming_template: "{{repo}}/{{id}}".to_owned(),
            },
        ))
    }
}
