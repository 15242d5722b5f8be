#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{ArgGroup, Parser, Subcommand};
use tracing::{Instrument as _, info_span, warn};
use tracing_subscriber::EnvFilter;

use crate::adapters::ReviewAdapter as _;
use crate::adapters::agent::ContainerExecAgent;
use crate::adapters::docker::DockerCli;
use crate::adapters::git::GitCli;
use crate::adapters::review::ReviewCli;
use crate::config::{self, Config};
use crate::core::naming::{default_branch_name, task_id_from_stem};
use crate::output::table::Table;
use crate::pipeline::ports::PortAllocator;
use crate::pipeline::processor::{Adapters, Processor, ProcessorOptions, TaskOutcome};
use crate::pipeline::worker::{self, RunOptions};
use crate::task::attempt::AttemptManager;
use crate::task::cleanup::{Cleaner, CleanupFilter};
use crate::task::files::{FrontMatter, TaskFile, TaskFiles, read_task_file};
use crate::task::model::{NewTask, TaskRecord, TaskStatus};
use crate::task::report::ErrorReporter;
use crate::task::storage::QueueStore;

pub const LOG_ENV: &str = "TASKQ_LOG";

#[derive(Debug, Parser)]
#[command(
    name = "taskq",
    version,
    about = "Queue coding tasks and run them through isolated agent containers"
)]
pub struct Cli {
    /// Config file (default: $TASKQ_CONFIG or ~/.config/taskq/config.toml)
    #[arg(long = "config", global = true)]
    pub config: Option<PathBuf>,
    /// Log progress at info level
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    Add(AddArgs),
    Status(StatusArgs),
    Run(RunArgs),
    Review(IdArgs),
    Approve(IdArgs),
    Cancel(IdArgs),
    Retry(IdArgs),
    #[command(alias = "rm")]
    Remove(IdArgs),
    Cleanup(CleanupArgs),
    Config(ConfigArgs),
}

#[derive(Debug, Parser)]
#[command(group(ArgGroup::new("source").required(true).args(["task", "task_file"])))]
pub struct AddArgs {
    /// Task id (default: front matter, then the task file name)
    #[arg(long = "id")]
    pub id: Option<String>,
    /// Repository the task works on
    #[arg(long = "repo")]
    pub repo: Option<String>,
    /// Base branch for the task worktree
    #[arg(long = "base")]
    pub base: Option<String>,
    /// Branch created for the task
    #[arg(long = "branch")]
    pub branch: Option<String>,
    /// Explicit worktree location
    #[arg(long = "worktree-path")]
    pub worktree_path: Option<String>,
    /// Inline task description
    #[arg(long = "task")]
    pub task: Option<String>,
    /// Markdown task description, optionally with YAML front matter
    #[arg(long = "task-file")]
    pub task_file: Option<PathBuf>,
}

#[derive(Debug, Parser)]
pub struct StatusArgs {
    #[arg(long = "id")]
    pub id: Option<String>,
    #[arg(long = "json", conflicts_with = "csv")]
    pub json: bool,
    #[arg(long = "csv")]
    pub csv: bool,
}

#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Parser)]
pub struct RunArgs {
    /// Process exactly this task
    #[arg(long = "id")]
    pub id: Option<String>,
    /// Pipelines per pass (default: run.max_parallel)
    #[arg(long = "max-parallel")]
    pub max_parallel: Option<usize>,
    /// Keep polling; the interval defaults to run.poll_interval
    #[arg(long = "poll", value_name = "SECS", num_args = 0..=1, require_equals = true)]
    pub poll: Option<Option<u64>>,
    /// Remove container and worktree of a failed task right away
    #[arg(long = "cleanup-on-fail")]
    pub cleanup_on_fail: bool,
    /// Reuse an existing worktree and replace stale containers
    #[arg(long = "dirty-run")]
    pub dirty_run: bool,
    /// Stream worker logs to stderr
    #[arg(long = "follow")]
    pub follow: bool,
}

#[derive(Debug, Parser)]
pub struct IdArgs {
    #[arg(long = "id")]
    pub id: String,
}

#[derive(Debug, Parser)]
pub struct CleanupArgs {
    #[arg(long = "id")]
    pub id: Option<String>,
    #[arg(long = "done-only", conflicts_with = "cancelled_only")]
    pub done_only: bool,
    #[arg(long = "cancelled-only")]
    pub cancelled_only: bool,
    /// Leave worktrees on disk
    #[arg(long = "keep-worktree")]
    pub keep_worktree: bool,
}

#[derive(Debug, Parser)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub cmd: ConfigCmd,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCmd {
    List,
    Get(ConfigGetArgs),
    Set(ConfigSetArgs),
}

#[derive(Debug, Parser)]
pub struct ConfigGetArgs {
    pub key: String,
}

#[derive(Debug, Parser)]
pub struct ConfigSetArgs {
    pub key: String,
    pub value: String,
}

pub async fn main() -> ExitCode {
    let cli = Cli::parse();
    let follow = matches!(&cli.cmd, Commands::Run(args) if args.follow);
    init_tracing(cli.verbose || follow);

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn init_tracing(verbose: bool) {
    let level = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(level));
    // A second init (tests driving `main`) is not an error worth reporting.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let cfg_path = config::config_path(cli.config.as_deref())?;
    match cli.cmd {
        Commands::Config(args) => cmd_config(&cfg_path, args),
        Commands::Add(args) => cmd_add(&load_cfg(cfg_path).await?, args),
        Commands::Status(args) => cmd_status(&load_cfg(cfg_path).await?, &args),
        Commands::Run(args) => cmd_run(&load_cfg(cfg_path).await?, args).await,
        Commands::Review(args) => cmd_review(&load_cfg(cfg_path).await?, &args.id).await,
        Commands::Approve(args) => cmd_approve(&load_cfg(cfg_path).await?, &args.id),
        Commands::Cancel(args) => cmd_cancel(&load_cfg(cfg_path).await?, &args.id),
        Commands::Retry(args) => cmd_retry(&load_cfg(cfg_path).await?, &args.id),
        Commands::Remove(args) => cmd_remove(&load_cfg(cfg_path).await?, &args.id),
        Commands::Cleanup(args) => cmd_cleanup(&load_cfg(cfg_path).await?, args),
    }
}

async fn load_cfg(path: PathBuf) -> anyhow::Result<Config> {
    let cfg = tokio::task::spawn_blocking(move || config::load_at(&path)).await??;
    Ok(cfg)
}

fn cmd_config(path: &Path, args: ConfigArgs) -> anyhow::Result<ExitCode> {
    match args.cmd {
        ConfigCmd::List => {
            print!("{}", config::list_resolved_toml(path)?);
        }
        ConfigCmd::Get(get) => match config::get_value_string_at_path(path, &get.key)? {
            Some(v) => println!("{v}"),
            None => anyhow::bail!(
                "configuration key '{}' not found - use 'taskq config list' to see available keys",
                get.key
            ),
        },
        ConfigCmd::Set(set) => {
            config::set_value_string_at_path(path, &set.key, &set.value)?;
            println!("Set {} = {}", set.key, set.value);
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Everything under `queue.dir`.
struct Queue {
    store: QueueStore,
    files: TaskFiles,
    reporter: ErrorReporter,
    attempts: AttemptManager,
}

fn open_queue(cfg: &Config) -> anyhow::Result<Queue> {
    let dir = cfg.queue_dir()?;
    let store = QueueStore::open(dir.join("tasks.jsonl"), cfg.lock_timeout()?)
        .with_context(|| format!("failed to open queue in {}", dir.display()))?;
    let attempts = AttemptManager::new(dir.join("attempts"))
        .with_host_dirs(cfg.host_config_dir()?, cfg.host_data_dir()?);
    Ok(Queue {
        store,
        files: TaskFiles::new(dir.join("tasks")),
        reporter: ErrorReporter::new(dir.join("errors"), cfg.errors.excerpt_bytes),
        attempts,
    })
}

fn cmd_add(cfg: &Config, args: AddArgs) -> anyhow::Result<ExitCode> {
    let (source, stem) = match (&args.task, &args.task_file) {
        (Some(text), None) => (TaskFile::parse(text)?, None),
        (None, Some(path)) => {
            let file = read_task_file(path)
                .with_context(|| format!("failed to read task file {}", path.display()))?;
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned());
            (file, stem)
        }
        _ => anyhow::bail!("exactly one of --task or --task-file is required"),
    };
    if source.body.trim().is_empty() {
        anyhow::bail!("task description is empty");
    }
    let front = source.front;

    let id = args
        .id
        .or(front.id)
        .or_else(|| stem.as_deref().map(task_id_from_stem))
        .context("no task id: pass --id, set `id` in the front matter, or use --task-file")?;

    let repo = args
        .repo
        .or(front.repo)
        .context("no repository: pass --repo or set `repo` in the front matter")?;
    let repo = config::expand_path(&repo)?;
    if !repo.is_dir() {
        anyhow::bail!("repository {} is not a directory", repo.display());
    }
    let repo = std::fs::canonicalize(&repo)
        .with_context(|| format!("failed to resolve {}", repo.display()))?;

    let base = args
        .base
        .or(front.base)
        .unwrap_or_else(|| cfg.worktree.default_base.clone());
    let branch = args
        .branch
        .or(front.branch)
        .unwrap_or_else(|| default_branch_name(&id));
    let worktree_path = args
        .worktree_path
        .or(front.worktree_path)
        .map(|p| config::expand_path(&p))
        .transpose()?
        .map(|p| p.to_string_lossy().into_owned());

    let queue = open_queue(cfg)?;
    if queue.store.find(&id)?.is_some() {
        return Err(crate::error::TaskqError::DuplicateId(id).into());
    }

    let repo = repo.to_string_lossy().into_owned();
    let canonical = TaskFile {
        front: FrontMatter {
            id: Some(id.clone()),
            repo: Some(repo.clone()),
            base: Some(base.clone()),
            branch: Some(branch.clone()),
            worktree_path: worktree_path.clone(),
        },
        body: source.body,
    };
    // `create_new` so a concurrent add of the same id never touches the winner's file.
    let Some(task_file) = queue.files.create(&id, &canonical)? else {
        if queue.store.find(&id)?.is_some() {
            return Err(crate::error::TaskqError::DuplicateId(id).into());
        }
        let path = queue.files.path_for(&id)?;
        anyhow::bail!(
            "task file {} already exists without a queued task; remove it and retry",
            path.display()
        );
    };

    let added = queue.store.add(NewTask {
        id: id.clone(),
        repo,
        base_branch: base,
        branch,
        worktree_path,
        task_file: Some(task_file.to_string_lossy().into_owned()),
    });
    let record = match added {
        Ok(r) => r,
        Err(e) => {
            if let Err(rm) = std::fs::remove_file(&task_file) {
                warn!(task_id = %id, error = %rm, "failed to remove task file");
            }
            return Err(e.into());
        }
    };

    println!("Added {} ({} from {})", record.id, record.branch, record.base_branch);
    Ok(ExitCode::SUCCESS)
}

fn cmd_status(cfg: &Config, args: &StatusArgs) -> anyhow::Result<ExitCode> {
    let queue = open_queue(cfg)?;
    let mut records = match &args.id {
        Some(id) => vec![queue.store.get(id)?],
        None => queue.store.list(None)?,
    };
    // Stable: FIFO order within each status group.
    records.sort_by_key(|r| status_rank(r.status));

    if args.json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(ExitCode::SUCCESS);
    }

    let table = status_table(&records);
    if args.csv {
        table.print_csv()?;
    } else if table.is_empty() {
        println!("No tasks.");
    } else {
        table.print()?;
    }
    Ok(ExitCode::SUCCESS)
}

fn status_rank(status: TaskStatus) -> usize {
    TaskStatus::ALL
        .iter()
        .position(|s| *s == status)
        .unwrap_or(TaskStatus::ALL.len())
}

fn status_table(records: &[TaskRecord]) -> Table {
    let mut table = Table::new([
        "ID", "STATUS", "ATTEMPT", "BRANCH", "PORT", "CONTAINER", "UPDATED", "ERROR",
    ]);
    for r in records {
        table.row([
            r.id.clone(),
            r.status.to_string(),
            r.attempt.to_string(),
            r.branch.clone(),
            r.runtime.port.map(|p| p.to_string()).unwrap_or_default(),
            r.runtime.container_handle.clone().unwrap_or_default(),
            r.updated_at.clone(),
            r.error_ref.clone().unwrap_or_default(),
        ]);
    }
    table
}

async fn cmd_run(cfg: &Config, args: RunArgs) -> anyhow::Result<ExitCode> {
    let poll = match args.poll {
        None => None,
        Some(None) => Some(cfg.poll_interval()?),
        Some(Some(secs)) => Some(Duration::from_secs(secs)),
    };
    let opts = RunOptions {
        max_parallel: args.max_parallel.unwrap_or(cfg.run.max_parallel),
        poll,
        task_id: args.id,
    };
    opts.validate()?;

    let processor = Arc::new(build_processor(cfg, args.cleanup_on_fail, args.dirty_run)?);
    let session = uuid::Uuid::new_v4().simple().to_string();
    let session = &session[..8];
    let span = info_span!("run", session = %session);

    let shutdown = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    let summary = worker::run(processor, opts, shutdown).instrument(span).await?;

    if summary.outcomes.is_empty() && summary.errors.is_empty() {
        println!("No tasks to run.");
    } else {
        print_outcomes(&summary.outcomes)?;
    }
    for err in &summary.errors {
        eprintln!("worker error: {err}");
    }
    Ok(if summary.any_failed() {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    })
}

fn build_processor(cfg: &Config, cleanup_on_fail: bool, dirty_run: bool) -> anyhow::Result<Processor> {
    let queue = open_queue(cfg)?;
    let agent = ContainerExecAgent::new(
        cfg.container.command.clone(),
        cfg.container.workdir.clone(),
        cfg.agent.plan_command.clone(),
        cfg.agent.execute_command.clone(),
        Some(cfg.agent_timeout()?),
    );
    let adapters = Adapters {
        git: Arc::new(GitCli),
        container: Arc::new(DockerCli::new(cfg.container.clone())),
        agent: Arc::new(agent),
    };
    let ports = Arc::new(PortAllocator::new(
        cfg.ports.start,
        cfg.ports.end,
        cfg.container.host.clone(),
    ));
    let opts = ProcessorOptions {
        cleanup_on_fail,
        dirty_run,
        worktree_base_dir: cfg.worktree_base_dir()?,
        naming_template: cfg.worktree.naming_template.clone(),
    };
    Ok(Processor::new(
        queue.store,
        queue.attempts,
        queue.reporter,
        ports,
        adapters,
        opts,
    ))
}

fn print_outcomes(outcomes: &[TaskOutcome]) -> anyhow::Result<()> {
    let mut table = Table::new(["ID", "STATUS", "ATTEMPT", "STAGE", "EXIT", "REPORT"]);
    for o in outcomes {
        table.row([
            o.id.clone(),
            o.status.to_string(),
            o.attempt.to_string(),
            o.failed_stage.map(|s| s.to_string()).unwrap_or_default(),
            o.exit_code.map(|c| c.to_string()).unwrap_or_default(),
            o.error_ref.clone().unwrap_or_default(),
        ]);
    }
    table.print()?;
    Ok(())
}

async fn cmd_review(cfg: &Config, id: &str) -> anyhow::Result<ExitCode> {
    let queue = open_queue(cfg)?;
    let record = queue.store.get(id)?;
    if record.status != TaskStatus::Review {
        anyhow::bail!("task {id} is {}; only tasks in review can be reviewed", record.status);
    }
    let port = record
        .runtime
        .port
        .with_context(|| format!("task {id} has no port recorded"))?;

    let fallback = queue.attempts.attempt_paths(id, record.attempt);
    let config_dir = record
        .runtime
        .attempt_config_dir
        .as_deref()
        .map_or(fallback.config_dir, PathBuf::from);
    let data_dir = record
        .runtime
        .attempt_data_dir
        .as_deref()
        .map_or(fallback.data_dir, PathBuf::from);
    for dir in [&config_dir, &data_dir] {
        if !dir.is_dir() {
            anyhow::bail!("attempt directory {} is missing", dir.display());
        }
    }

    let review = ReviewCli::new(
        cfg.review.command.clone(),
        cfg.review.args.clone(),
        cfg.container.host.clone(),
    );
    let code = tokio::task::spawn_blocking(move || review.launch(&config_dir, &data_dir, port))
        .await??;
    Ok(if code == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

fn cmd_approve(cfg: &Config, id: &str) -> anyhow::Result<ExitCode> {
    let queue = open_queue(cfg)?;
    let record = queue
        .store
        .update_status(id, TaskStatus::Review, TaskStatus::Done)?;
    println!("{} approved ({})", record.id, record.status);
    Ok(ExitCode::SUCCESS)
}

fn cmd_cancel(cfg: &Config, id: &str) -> anyhow::Result<ExitCode> {
    let queue = open_queue(cfg)?;
    let current = queue.store.get(id)?;
    let record = queue
        .store
        .update_status(id, current.status, TaskStatus::Cancelled)?;
    println!("{} cancelled (was {})", record.id, current.status);
    Ok(ExitCode::SUCCESS)
}

fn cmd_retry(cfg: &Config, id: &str) -> anyhow::Result<ExitCode> {
    let queue = open_queue(cfg)?;
    let record = queue.attempts.retry(&queue.store, id)?;
    println!("{} queued for attempt {}", record.id, record.attempt);
    Ok(ExitCode::SUCCESS)
}

fn cmd_remove(cfg: &Config, id: &str) -> anyhow::Result<ExitCode> {
    let queue = open_queue(cfg)?;
    let record = queue.store.remove(id)?;
    if let Err(e) = queue.files.remove(id) {
        warn!(task_id = %id, error = %e, "failed to remove task file");
    }
    println!("Removed {} ({})", record.id, record.status);
    Ok(ExitCode::SUCCESS)
}

fn cmd_cleanup(cfg: &Config, args: CleanupArgs) -> anyhow::Result<ExitCode> {
    let queue = open_queue(cfg)?;
    let docker = DockerCli::new(cfg.container.clone());
    let cleaner = Cleaner {
        store: &queue.store,
        attempts: &queue.attempts,
        reporter: &queue.reporter,
        git: &GitCli,
        container: &docker,
    };
    let summary = cleaner.run(&CleanupFilter {
        id: args.id,
        done_only: args.done_only,
        cancelled_only: args.cancelled_only,
        keep_worktree: args.keep_worktree,
    })?;

    if summary.tasks.is_empty() {
        println!("Nothing to clean up.");
        return Ok(ExitCode::SUCCESS);
    }
    println!(
        "Cleaned {} task(s): {} container(s), {} worktree(s), {} report(s), {} attempt dir(s)",
        summary.tasks.len(),
        summary.containers_removed,
        summary.worktrees_removed,
        summary.reports_removed,
        summary.attempt_dirs_removed,
    );
    if summary.warnings > 0 {
        eprintln!("{} artifact(s) could not be removed; see log output", summary.warnings);
    }
    Ok(ExitCode::SUCCESS)
}
