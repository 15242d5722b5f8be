use std::path::{Path, PathBuf};
use std::process::Command;

use taskq::adapters::git::GitCli;
use taskq::adapters::{GitAdapter as _, WorktreeRequest};

#[test]
fn task_worktree_create_reuse_and_remove() {
    if Command::new("git").arg("--version").output().is_err() {
        eprintln!("skipping: git not found");
        return;
    }

    let td = tempfile::tempdir().expect("tempdir");
    let repo = init_repo(td.path());

    let worktree = td.path().join("worktrees").join("repo").join("T-1");
    let req = WorktreeRequest {
        repo: &repo,
        task_id: "T-1",
        base: "main",
        branch: "task/t-1",
        path: &worktree,
    };
    let created = GitCli.create_worktree(&req).expect("create worktree");
    assert_eq!(created, worktree);
    assert!(worktree.join("README.md").exists());

    GitCli.remove_worktree(&repo, &worktree).expect("remove worktree");
    assert!(!worktree.exists());

    // The branch survives removal; a retry checks it out again.
    GitCli.create_worktree(&req).expect("recreate worktree");
    assert!(worktree.join("README.md").exists());
    let listed = git_output(&repo, &["worktree", "list", "--porcelain"]);
    assert!(listed.contains("refs/heads/task/t-1"));
}

#[test]
fn preserved_worktree_is_reused_by_the_next_attempt() {
    if Command::new("git").arg("--version").output().is_err() {
        eprintln!("skipping: git not found");
        return;
    }

    let td = tempfile::tempdir().expect("tempdir");
    let repo = init_repo(td.path());
    let worktree = td.path().join("worktrees").join("T-1");
    let req = WorktreeRequest {
        repo: &repo,
        task_id: "T-1",
        base: "main",
        branch: "task/t-1",
        path: &worktree,
    };
    GitCli.create_worktree(&req).expect("first attempt");
    std::fs::write(worktree.join("work.txt"), "partial\n").expect("write");

    let again = GitCli.create_worktree(&req).expect("second attempt");
    assert_eq!(again, worktree);
    assert_eq!(
        std::fs::read_to_string(worktree.join("work.txt")).expect("read"),
        "partial\n"
    );

    let other = WorktreeRequest {
        branch: "task/other",
        ..req
    };
    let err = GitCli.create_worktree(&other).unwrap_err();
    assert!(err.to_string().contains("task/t-1"), "{err}");

    let stray = td.path().join("worktrees").join("stray");
    std::fs::create_dir_all(&stray).expect("mkdir");
    std::fs::write(stray.join("keep.txt"), "x").expect("write");
    let err = GitCli
        .create_worktree(&WorktreeRequest {
            path: &stray,
            branch: "task/stray",
            ..req
        })
        .unwrap_err();
    assert!(err.to_string().contains("already exists"), "{err}");
}

#[test]
fn create_worktree_outside_repository_fails() {
    let td = tempfile::tempdir().expect("tempdir");
    let not_repo = td.path().join("plain");
    std::fs::create_dir_all(&not_repo).expect("mkdir");
    let path = td.path().join("wt");
    let err = GitCli
        .create_worktree(&WorktreeRequest {
            repo: &not_repo,
            task_id: "T-1",
            base: "main",
            branch: "task/t-1",
            path: &path,
        })
        .unwrap_err();
    assert!(err.to_string().contains("not a git repository"));
}

fn init_repo(root: &Path) -> PathBuf {
    let repo = root.join("repo");
    std::fs::create_dir_all(&repo).expect("mkdir repo");
    run(&repo, &["init"]);
    run(&repo, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    run(&repo, &["config", "user.email", "test@example.com"]);
    run(&repo, &["config", "user.name", "Test"]);
    std::fs::write(repo.join("README.md"), "hello\n").expect("write");
    run(&repo, &["add", "."]);
    run(&repo, &["commit", "-m", "init"]);
    repo
}

fn git_output(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git command");
    String::from_utf8_lossy(&out.stdout).into_owned()
}

fn run(dir: &Path, args: &[&str]) {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git command");
    if !out.status.success() {
        panic!(
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&out.stderr)
        );
    }
}
