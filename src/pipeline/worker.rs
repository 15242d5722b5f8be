#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{Span, error, info};

use crate::error::TaskqError;
use crate::pipeline::processor::{Processor, TaskOutcome};
use crate::task::model::TaskStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub max_parallel: usize,
    /// Re-run the pass at this interval until shut down; `None` runs once.
    pub poll: Option<Duration>,
    pub task_id: Option<String>,
}

impl RunOptions {
    pub fn validate(&self) -> Result<(), TaskqError> {
        if self.max_parallel == 0 {
            return Err(TaskqError::Validation(
                "max parallel must be >= 1".to_owned(),
            ));
        }
        if self.task_id.is_some() && self.poll.is_some() {
            return Err(TaskqError::Validation(
                "--id cannot be combined with --poll".to_owned(),
            ));
        }
        if self.poll.is_some_and(|p| p.is_zero()) {
            return Err(TaskqError::Validation(
                "poll interval must be greater than zero".to_owned(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PassSummary {
    pub passes: usize,
    pub outcomes: Vec<TaskOutcome>,
    /// Worker units that died on a store or join error.
    pub errors: Vec<String>,
}

impl PassSummary {
    #[must_use]
    pub fn any_failed(&self) -> bool {
        !self.errors.is_empty() || self.count(TaskStatus::Failed) > 0
    }

    #[must_use]
    pub fn count(&self, status: TaskStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    fn merge(&mut self, other: PassSummary) {
        self.passes += other.passes;
        self.outcomes.extend(other.outcomes);
        self.errors.extend(other.errors);
    }
}

/// Claim and process up to `max_parallel` tasks, waiting for every pipeline to finish.
///
/// With `task_id` exactly that task is claimed and a failed claim is returned as an error.
pub async fn run_pass(
    processor: Arc<Processor>,
    max_parallel: usize,
    task_id: Option<&str>,
) -> Result<PassSummary, TaskqError> {
    let mut summary = PassSummary {
        passes: 1,
        ..PassSummary::default()
    };

    if let Some(id) = task_id {
        let p = Arc::clone(&processor);
        let id = id.to_owned();
        let span = Span::current();
        let res = tokio::task::spawn_blocking(move || {
            let _enter = span.enter();
            let Some(record) = p.claim(Some(&id))? else {
                return Err(TaskqError::NoAvailableTask);
            };
            p.process(record)
        })
        .await
        .map_err(|e| TaskqError::Other(format!("worker join error: {e}")))??;
        summary.outcomes.push(res);
        return Ok(summary);
    }

    let mut joinset: JoinSet<Result<Option<TaskOutcome>, TaskqError>> = JoinSet::new();
    for _ in 0..max_parallel.max(1) {
        let p = Arc::clone(&processor);
        let span = Span::current();
        joinset.spawn_blocking(move || {
            let _enter = span.enter();
            let Some(record) = p.claim(None)? else {
                return Ok(None);
            };
            p.process(record).map(Some)
        });
    }

    while let Some(res) = joinset.join_next().await {
        match res {
            Ok(Ok(Some(outcome))) => summary.outcomes.push(outcome),
            Ok(Ok(None)) => {}
            Ok(Err(e)) => {
                error!(error = %e, "worker failed");
                summary.errors.push(e.to_string());
            }
            Err(e) => {
                error!(error = %e, "worker join error");
                summary.errors.push(format!("worker join error: {e}"));
            }
        }
    }
    info!(
        claimed = summary.outcomes.len(),
        review = summary.count(TaskStatus::Review),
        failed = summary.count(TaskStatus::Failed),
        "pass complete"
    );
    Ok(summary)
}

/// Run one pass, or keep polling until `shutdown` resolves. Shutdown is only
/// observed between passes; in-flight pipelines always run to completion.
pub async fn run<F>(
    processor: Arc<Processor>,
    opts: RunOptions,
    shutdown: F,
) -> Result<PassSummary, TaskqError>
where
    F: Future<Output = ()>,
{
    opts.validate()?;
    tokio::pin!(shutdown);

    let mut total = PassSummary::default();
    loop {
        let pass = run_pass(
            Arc::clone(&processor),
            opts.max_parallel,
            opts.task_id.as_deref(),
        )
        .await?;
        total.merge(pass);

        let Some(interval) = opts.poll else {
            break;
        };
        tokio::select! {
            biased;
            () = &mut shutdown => {
                info!("shutdown requested; stopping after current pass");
                break;
            }
            () = tokio::time::sleep(interval) => {}
        }
    }
    Ok(total)
}
