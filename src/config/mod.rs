#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::TaskqError;

pub const CONFIG_ENV: &str = "TASKQ_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub queue: QueueConfig,
    pub worktree: WorktreeConfig,
    pub run: RunConfig,
    pub ports: PortsConfig,
    pub container: ContainerConfig,
    pub agent: AgentConfig,
    pub review: ReviewConfig,
    pub errors: ErrorsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    pub dir: String,
    pub lock_timeout: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            dir: "queue".to_owned(),
            lock_timeout: "30s".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorktreeConfig {
    #[serde(alias = "basedir")]
    pub base_dir: String,
    #[serde(alias = "template")]
    pub naming_template: String,
    pub default_base: String,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            base_dir: "~/worktrees".to_owned(),
            naming_template: "{{repo}}/{{id}}".to_owned(),
            default_base: "main".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    pub max_parallel: usize,
    pub poll_interval: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_parallel: 1,
            poll_interval: "30s".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PortsConfig {
    pub start: u16,
    pub end: u16,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            start: 30000,
            end: 30999,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ContainerConfig {
    pub command: String,
    pub image: String,
    pub host: String,
    pub internal_port: u16,
    pub args: Vec<String>,
    pub config_mount: String,
    pub data_mount: String,
    pub workdir: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            command: "docker".to_owned(),
            image: "sisifo/opencode:latest".to_owned(),
            host: "127.0.0.1".to_owned(),
            internal_port: 8000,
            args: ["serve", "--hostname", "0.0.0.0", "--port", "8000"]
                .map(str::to_owned)
                .to_vec(),
            config_mount: "/root/.config/opencode".to_owned(),
            data_mount: "/root/.local/share/opencode".to_owned(),
            workdir: "/workspace".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub plan_command: Vec<String>,
    pub execute_command: Vec<String>,
    pub timeout: String,
    pub host_config_dir: String,
    pub host_data_dir: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            plan_command: ["opencode", "run", "--command", "make-plan"]
                .map(str::to_owned)
                .to_vec(),
            execute_command: ["opencode", "run", "--command", "execute-plan"]
                .map(str::to_owned)
                .to_vec(),
            timeout: "60m".to_owned(),
            host_config_dir: "~/.config/opencode".to_owned(),
            host_data_dir: "~/.local/share/opencode".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReviewConfig {
    pub command: String,
    pub args: Vec<String>,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            command: "openchamber".to_owned(),
            args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ErrorsConfig {
    pub excerpt_bytes: usize,
}

impl Default for ErrorsConfig {
    fn default() -> Self {
        Self {
            excerpt_bytes: 8192,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), TaskqError> {
        if self.queue.dir.trim().is_empty() {
            return Err(TaskqError::Config("queue.dir must not be empty".to_owned()));
        }
        if self.worktree.base_dir.trim().is_empty() {
            return Err(TaskqError::Config(
                "worktree.base_dir must not be empty".to_owned(),
            ));
        }
        if self.run.max_parallel == 0 {
            return Err(TaskqError::Config(
                "run.max_parallel must be >= 1".to_owned(),
            ));
        }
        if self.ports.start == 0 || self.ports.start > self.ports.end {
            return Err(TaskqError::Config(format!(
                "ports range {}-{} is invalid",
                self.ports.start, self.ports.end
            )));
        }
        if self.container.command.trim().is_empty() || self.container.image.trim().is_empty() {
            return Err(TaskqError::Config(
                "container.command and container.image must not be empty".to_owned(),
            ));
        }
        if self.agent.plan_command.is_empty() || self.agent.execute_command.is_empty() {
            return Err(TaskqError::Config(
                "agent.plan_command and agent.execute_command must not be empty".to_owned(),
            ));
        }
        if self.errors.excerpt_bytes == 0 {
            return Err(TaskqError::Config(
                "errors.excerpt_bytes must be >= 1".to_owned(),
            ));
        }
        for (key, value) in [
            ("queue.lock_timeout", &self.queue.lock_timeout),
            ("run.poll_interval", &self.run.poll_interval),
            ("agent.timeout", &self.agent.timeout),
        ] {
            parse_duration(value).map_err(|e| TaskqError::InvalidConfigValue {
                key: key.to_owned(),
                msg: e.to_string(),
            })?;
        }
        Ok(())
    }

    pub fn queue_dir(&self) -> anyhow::Result<PathBuf> {
        expand_path(&self.queue.dir)
    }

    pub fn worktree_base_dir(&self) -> anyhow::Result<PathBuf> {
        expand_path(&self.worktree.base_dir)
    }

    pub fn host_config_dir(&self) -> anyhow::Result<PathBuf> {
        expand_path(&self.agent.host_config_dir)
    }

    pub fn host_data_dir(&self) -> anyhow::Result<PathBuf> {
        expand_path(&self.agent.host_data_dir)
    }

    pub fn lock_timeout(&self) -> Result<Duration, TaskqError> {
        parse_duration(&self.queue.lock_timeout)
    }

    pub fn poll_interval(&self) -> Result<Duration, TaskqError> {
        parse_duration(&self.run.poll_interval)
    }

    pub fn agent_timeout(&self) -> Result<Duration, TaskqError> {
        parse_duration(&self.agent.timeout)
    }
}

/// `ms|s|m|h|d|w` suffixes; a bare number is seconds.
pub fn parse_duration(s: &str) -> Result<Duration, TaskqError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(TaskqError::Validation("empty duration".to_owned()));
    }

    let (num, unit) = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .map_or((s, ""), |i| s.split_at(i));
    let n: u64 = num
        .parse()
        .map_err(|_| TaskqError::Validation(format!("invalid duration: {s}")))?;

    Ok(match unit {
        "ms" => Duration::from_millis(n),
        "s" | "" => Duration::from_secs(n),
        "m" => Duration::from_secs(n * 60),
        "h" => Duration::from_secs(n * 60 * 60),
        "d" => Duration::from_secs(n * 24 * 60 * 60),
        "w" => Duration::from_secs(n * 7 * 24 * 60 * 60),
        _ => {
            return Err(TaskqError::Validation(format!(
                "unsupported duration unit in '{s}' (use ms|s|m|h|d|w)"
            )));
        }
    })
}

/// Config file: explicit path, then `$TASKQ_CONFIG`, then the platform default.
pub fn config_path(explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    if let Some(p) = explicit {
        return Ok(p.to_path_buf());
    }
    if let Some(p) = std::env::var_os(CONFIG_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(p));
    }
    default_config_path()
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    if !cfg!(windows)
        && let Some(home) = home_dir()
    {
        return Ok(home.join(".config").join("taskq").join("config.toml"));
    }
    let proj = ProjectDirs::from("dev", "taskq", "taskq")
        .context("failed to determine platform config directory")?;
    Ok(proj.config_dir().join("config.toml"))
}

fn home_dir() -> Option<PathBuf> {
    if let Some(v) = std::env::var_os("HOME") {
        return Some(PathBuf::from(v));
    }
    std::env::var_os("USERPROFILE").map(PathBuf::from)
}

#[must_use]
pub fn expand_tilde(input: &str) -> String {
    if let Some(rest) = input.strip_prefix("~/")
        && let Some(home) = home_dir()
    {
        return home.join(rest).to_string_lossy().to_string();
    }
    if input == "~"
        && let Some(home) = home_dir()
    {
        return home.to_string_lossy().to_string();
    }
    input.to_owned()
}

/// Expand `~` and `$VAR`, then make the path absolute against the cwd.
pub fn expand_path(input: &str) -> anyhow::Result<PathBuf> {
    let p = PathBuf::from(expand_env_vars(&expand_tilde(input)));
    if p.is_absolute() {
        return Ok(p);
    }
    let cwd = std::env::current_dir().context("failed to get current directory")?;
    Ok(cwd.join(p))
}

fn expand_env_vars(input: &str) -> String {
    // Unknown vars are left untouched.
    let Ok(re) = regex::Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?") else {
        return input.to_owned();
    };
    re.replace_all(input, |caps: &regex::Captures<'_>| {
        let key = &caps[1];
        std::env::var(key).unwrap_or_else(|_| caps[0].to_owned())
    })
    .to_string()
}

pub fn load_at(path: &Path) -> anyhow::Result<Config> {
    let (_doc, cfg) = load_from_file(path)?;
    cfg.validate()
        .with_context(|| format!("invalid configuration in {}", path.display()))?;
    Ok(cfg)
}

pub fn list_resolved_toml(path: &Path) -> anyhow::Result<String> {
    let cfg = load_at(path)?;
    Ok(toml::to_string_pretty(&cfg)?)
}

fn load_from_file(path: &Path) -> anyhow::Result<(toml_edit::DocumentMut, Config)> {
    if !path.exists() {
        return Ok((toml_edit::DocumentMut::new(), Config::default()));
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;

    let doc = raw
        .parse::<toml_edit::DocumentMut>()
        .with_context(|| format!("failed to parse TOML in {}", path.display()))?;

    let cfg: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to deserialize TOML in {}", path.display()))?;
    Ok((doc, cfg))
}

pub fn get_value_string_at_path(path: &Path, key: &str) -> anyhow::Result<Option<String>> {
    let cfg = load_at(path)?;
    let norm = normalize_key(key);
    if key_type(&norm).is_none() && !is_section(&norm) {
        return Err(TaskqError::InvalidConfigKey(key.to_owned()).into());
    }
    Ok(lookup_value(&cfg, &norm).map(format_value_for_stdout))
}

pub fn set_value_string_at_path(path: &Path, key: &str, value: &str) -> anyhow::Result<()> {
    let (mut doc, cfg) = load_from_file(path)?;
    cfg.validate()?;

    let (norm_key, value_item) = normalize_key_and_parse_value(key, value)?;
    apply_set(&mut doc, &norm_key, value_item)?;

    let new_raw = doc.to_string();
    let new_cfg: Config = toml::from_str(&new_raw)
        .with_context(|| format!("config update produced invalid TOML for {}", path.display()))?;
    new_cfg.validate()?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, new_raw.as_bytes())
        .with_context(|| format!("failed to write {}", path.display()))?;

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyType {
    Int,
    String,
    Duration,
    List,
}

fn normalize_key(key: &str) -> String {
    match key {
        "worktree.basedir" => "worktree.base_dir",
        "worktree.template" => "worktree.naming_template",
        "run.parallel" => "run.max_parallel",
        _ => key,
    }
    .to_owned()
}

fn is_section(key: &str) -> bool {
    matches!(
        key,
        "queue" | "worktree" | "run" | "ports" | "container" | "agent" | "review" | "errors"
    )
}

fn normalize_key_and_parse_value(
    key: &str,
    value: &str,
) -> Result<(String, toml_edit::Item), TaskqError> {
    let norm = normalize_key(key);
    let key_type = key_type(&norm).ok_or_else(|| TaskqError::InvalidConfigKey(key.to_owned()))?;
    let invalid = |msg: String| TaskqError::InvalidConfigValue {
        key: key.to_owned(),
        msg,
    };
    let item = match key_type {
        KeyType::Int => toml_edit::value(parse_int(value).map_err(invalid)?),
        KeyType::String => toml_edit::value(value),
        KeyType::Duration => {
            parse_duration(value).map_err(|e| invalid(e.to_string()))?;
            toml_edit::value(value.trim())
        }
        KeyType::List => {
            let mut arr = toml_edit::Array::new();
            for part in value.split_whitespace() {
                arr.push(part);
            }
            toml_edit::value(arr)
        }
    };
    Ok((norm, item))
}

fn key_type(key: &str) -> Option<KeyType> {
    Some(match key {
        "queue.dir"
        | "worktree.base_dir"
        | "worktree.naming_template"
        | "worktree.default_base"
        | "container.command"
        | "container.image"
        | "container.host"
        | "container.config_mount"
        | "container.data_mount"
        | "container.workdir"
        | "agent.host_config_dir"
        | "agent.host_data_dir"
        | "review.command" => KeyType::String,

        "queue.lock_timeout" | "run.poll_interval" | "agent.timeout" => KeyType::Duration,

        "run.max_parallel"
        | "ports.start"
        | "ports.end"
        | "container.internal_port"
        | "errors.excerpt_bytes" => KeyType::Int,

        "container.args" | "agent.plan_command" | "agent.execute_command" | "review.args" => {
            KeyType::List
        }

        _ => return None,
    })
}

fn parse_int(s: &str) -> Result<i64, String> {
    s.trim()
        .parse::<i64>()
        .map_err(|e| format!("expected integer, got '{s}': {e}"))
}

fn apply_set(
    doc: &mut toml_edit::DocumentMut,
    key: &str,
    value: toml_edit::Item,
) -> Result<(), TaskqError> {
    let parts: Vec<&str> = key.split('.').filter(|p| !p.is_empty()).collect();
    let Some((leaf, tables)) = parts.split_last() else {
        return Err(TaskqError::InvalidConfigKey(key.to_owned()));
    };

    let mut cur = doc.as_table_mut();
    for seg in tables {
        if !cur.contains_key(seg) {
            let mut t = toml_edit::Table::new();
            t.set_implicit(true);
            cur.insert(seg, toml_edit::Item::Table(t));
        }
        cur = cur[seg].as_table_mut().ok_or_else(|| {
            TaskqError::Config(format!("cannot set {key}: '{seg}' is not a table"))
        })?;
    }
    cur.insert(leaf, value);
    Ok(())
}

fn lookup_value(cfg: &Config, key: &str) -> Option<serde_json::Value> {
    let mut v = serde_json::to_value(cfg).ok()?;
    for seg in key.split('.').filter(|s| !s.is_empty()) {
        match v {
            serde_json::Value::Object(mut map) => {
                v = map.remove(seg)?;
            }
            _ => return None,
        }
    }
    Some(v)
}

fn format_value_for_stdout(v: serde_json::Value) -> String {
    match v {
        serde_json::Value::Null => "null".to_owned(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => s,
        serde_json::Value::Array(items) if items.iter().all(serde_json::Value::is_string) => items
            .iter()
            .filter_map(serde_json::Value::as_str)
            .collect::<Vec<_>>()
            .join(" "),
        other => serde_json::to_string_pretty(&other).unwrap_or_else(|_| other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn config_validation_catches_invalid_values() {
        let mut cfg = Config::default();
        cfg.run.max_parallel = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.ports.start = 31000;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.agent.timeout = "soon".to_owned();
        assert!(matches!(
            cfg.validate().unwrap_err(),
            TaskqError::InvalidConfigValue { .. }
        ));
    }

    #[test]
    fn parses_durations() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86_400));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5y").is_err());
    }

    #[test]
    fn missing_file_means_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = load_at(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[ports]\nstart = 40000\nend = 40010\n").unwrap();
        let cfg = load_at(&path).unwrap();
        assert_eq!(cfg.ports.start, 40000);
        assert_eq!(cfg.run.max_parallel, 1);
        assert_eq!(cfg.container.image, "sisifo/opencode:latest");
    }

    #[test]
    fn config_set_and_get_dot_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "# local overrides\n[run]\nmax_parallel = 2\n").unwrap();

        set_value_string_at_path(&path, "run.max_parallel", "4").unwrap();
        assert_eq!(
            get_value_string_at_path(&path, "run.max_parallel")
                .unwrap()
                .as_deref(),
            Some("4")
        );

        set_value_string_at_path(&path, "worktree.basedir", "~/wt").unwrap();
        assert_eq!(
            get_value_string_at_path(&path, "worktree.base_dir")
                .unwrap()
                .as_deref(),
            Some("~/wt")
        );

        set_value_string_at_path(&path, "agent.plan_command", "opencode run --plan").unwrap();
        assert_eq!(
            get_value_string_at_path(&path, "agent.plan_command")
                .unwrap()
                .as_deref(),
            Some("opencode run --plan")
        );

        assert!(set_value_string_at_path(&path, "agent.timeout", "later").is_err());
        assert!(set_value_string_at_path(&path, "no.such_key", "1").is_err());
        assert!(set_value_string_at_path(&path, "run.max_parallel", "0").is_err());

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.starts_with("# local overrides"));
        let cfg = load_at(&path).unwrap();
        assert_eq!(cfg.run.max_parallel, 4);
        assert_eq!(cfg.worktree.base_dir, "~/wt");
    }
}
