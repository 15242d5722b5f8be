#![forbid(unsafe_code)]

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use regex::Regex;
use sha2::{Digest as _, Sha256};
use time::OffsetDateTime;
use time::macros::format_description;

/// Inputs available to the worktree naming template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeVars<'a> {
    pub repo: &'a Path,
    pub id: &'a str,
    pub branch: &'a str,
}

#[must_use]
pub fn render_template(template: &str, vars: &WorktreeVars<'_>) -> String {
    let repo_name = vars
        .repo
        .file_name()
        .and_then(|s| s.to_str())
        .map_or_else(|| vars.repo.to_string_lossy().into_owned(), str::to_owned);
    let hash = short_hash(&vars.repo.to_string_lossy(), vars.branch);

    template
        .replace("{{repo}}", &sanitize_for_filesystem(&repo_name))
        .replace("{{id}}", &sanitize_for_filesystem(vars.id))
        .replace("{{branch}}", &sanitize_for_filesystem(vars.branch))
        .replace("{{hash}}", &hash)
}

/// Default worktree location for a task: `<base_dir>/<rendered template>`.
#[must_use]
pub fn worktree_path(base_dir: &Path, template: &str, vars: &WorktreeVars<'_>) -> PathBuf {
    let rendered = render_template(template, vars);
    let mut path = base_dir.to_path_buf();
    for part in rendered.split('/').filter(|p| !p.is_empty() && *p != "..") {
        path.push(part);
    }
    path
}

#[must_use]
pub fn sanitize_for_filesystem(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if c == '/' || c == '\\' || c == '\0' || c.is_control() {
            out.push('-');
            continue;
        }
        // Windows reserved characters.
        if matches!(c, ':' | '*' | '?' | '"' | '<' | '>' | '|') {
            out.push('-');
            continue;
        }
        out.push(c);
    }
    while out.contains("--") {
        out = out.replace("--", "-");
    }
    out.trim_matches('-').to_owned()
}

/// Lowercase, `[a-z0-9-]` only; used where docker and git are picky about names.
#[must_use]
pub fn safe_slug(input: &str) -> String {
    let lowered = input.to_lowercase();
    let slug = non_alnum_re().map_or_else(
        || lowered.clone(),
        |re| re.replace_all(&lowered, "-").into_owned(),
    );
    let slug = slug.trim_matches('-').to_owned();
    if slug.is_empty() {
        "task".to_owned()
    } else {
        slug
    }
}

/// `task/<id>` with the id lowercased and spaces/underscores turned into dashes.
#[must_use]
pub fn default_branch_name(task_id: &str) -> String {
    let id = task_id.trim().to_lowercase().replace([' ', '_'], "-");
    format!("task/{id}")
}

/// Derive a task id from a file stem: `fix login` becomes `T-FIX-LOGIN`.
#[must_use]
pub fn task_id_from_stem(stem: &str) -> String {
    let upper = stem.trim().to_uppercase();
    let normalized = non_alnum_re().map_or_else(
        || upper.clone(),
        |re| re.replace_all(&upper, "-").into_owned(),
    );
    let normalized = normalized.trim_matches('-');
    if normalized.is_empty() {
        return String::new();
    }
    if normalized.starts_with("T-") {
        normalized.to_owned()
    } else {
        format!("T-{normalized}")
    }
}

#[must_use]
pub fn container_name(task_id: &str, now: OffsetDateTime) -> String {
    format!("task-{}-{}", safe_slug(task_id), compact_timestamp(now))
}

/// `YYYYMMDDHHMMSS` in UTC.
#[must_use]
pub fn compact_timestamp(now: OffsetDateTime) -> String {
    let fmt = format_description!("[year][month][day][hour][minute][second]");
    now.to_offset(time::UtcOffset::UTC)
        .format(&fmt)
        .unwrap_or_else(|_| now.unix_timestamp().to_string())
}

fn non_alnum_re() -> Option<Regex> {
    Regex::new(r"[^A-Za-z0-9]+").ok()
}

fn short_hash(repo: &str, branch: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(repo.as_bytes());
    hasher.update(b"/");
    hasher.update(branch.as_bytes());
    let digest = hasher.finalize();
    let mut s = String::with_capacity(8);
    for b in &digest[..4] {
        let _ = write!(&mut s, "{b:02x}");
    }
    s
}
