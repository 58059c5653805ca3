//! Job-body contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::model::{Job, JobOutput};

/// What a job body gets to see about the run it performs.
#[derive(Debug, Clone)]
pub struct JobContext {
    job: Job,
    scheduled: DateTime<Utc>,
    deadline: DateTime<Utc>,
    cancel: CancellationToken,
}

impl JobContext {
    pub fn new(
        job: Job,
        scheduled: DateTime<Utc>,
        deadline: DateTime<Utc>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job,
            scheduled,
            deadline,
            cancel,
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn scheduled(&self) -> DateTime<Utc> {
        self.scheduled
    }

    /// Wall-clock instant after which the executor abandons the body.
    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the node shuts down or the job moves to another node.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}

/// The work a job kind performs. Errors are recorded with their full chain.
#[async_trait]
pub trait JobBody: Send + Sync {
    async fn execute(&self, ctx: JobContext) -> anyhow::Result<JobOutput>;
}
