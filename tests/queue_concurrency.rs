use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::time::Duration;

use taskq::error::TaskqError;
use taskq::task::model::{NewTask, TaskStatus};
use taskq::task::storage::QueueStore;

fn open(path: &Path) -> QueueStore {
    QueueStore::open(path.to_path_buf(), Duration::from_secs(30)).unwrap()
}

fn seed(store: &QueueStore, n: usize) {
    for i in 0..n {
        store
            .add(NewTask {
                id: format!("T-{i:03}"),
                repo: "/tmp/repo".to_owned(),
                base_branch: "main".to_owned(),
                branch: format!("task/t-{i:03}"),
                worktree_path: None,
                task_file: None,
            })
            .unwrap();
    }
}

/// Every worker owns its own store handle, so exclusion comes from the lock file alone.
fn claim_concurrently(path: &Path, workers: usize) -> Vec<String> {
    let barrier = Arc::new(Barrier::new(workers));
    let handles: Vec<_> = (0..workers)
        .map(|_| {
            let path = path.to_path_buf();
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                let store = open(&path);
                barrier.wait();
                match store.claim_first_todo() {
                    Ok(rec) => Some(rec.id),
                    Err(TaskqError::NoAvailableTask) => None,
                    Err(e) => panic!("claim failed: {e}"),
                }
            })
        })
        .collect();
    handles
        .into_iter()
        .filter_map(|h| h.join().unwrap())
        .collect()
}

#[test]
fn concurrent_claims_hand_out_each_task_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.jsonl");
    seed(&open(&path), 12);

    let claimed = claim_concurrently(&path, 24);
    assert_eq!(claimed.len(), 12);
    let distinct: BTreeSet<_> = claimed.iter().cloned().collect();
    assert_eq!(distinct.len(), 12);

    let store = open(&path);
    assert!(store.list(Some(TaskStatus::Todo)).unwrap().is_empty());
    assert_eq!(store.list(Some(TaskStatus::Planning)).unwrap().len(), 12);
}

#[test]
fn fewer_workers_than_tasks_take_the_oldest_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.jsonl");
    seed(&open(&path), 10);

    let claimed: BTreeSet<_> = claim_concurrently(&path, 4).into_iter().collect();
    let expected: BTreeSet<_> = (0..4).map(|i| format!("T-{i:03}")).collect();
    assert_eq!(claimed, expected);

    let todo: Vec<_> = open(&path)
        .list(Some(TaskStatus::Todo))
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(todo.first().map(String::as_str), Some("T-004"));
    assert_eq!(todo.len(), 6);
}

#[test]
fn readers_never_see_a_partial_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.jsonl");
    seed(&open(&path), 20);

    let reader_path = path.clone();
    let reader = std::thread::spawn(move || {
        let store = open(&reader_path);
        for _ in 0..50 {
            assert_eq!(store.list(None).unwrap().len(), 20);
        }
    });
    let writer = open(&path);
    for _ in 0..20 {
        let rec = writer.claim_first_todo().unwrap();
        writer
            .update_status(&rec.id, TaskStatus::Planning, TaskStatus::Cancelled)
            .unwrap();
    }
    reader.join().unwrap();
}
