//! Hand-off from the coordinator to the executors.

use async_trait::async_trait;
use cadence_id::{JobId, NodeId, OrgId};
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::{ExecutionKey, JobKind};

/// Ask the owner of `job_id` to run the job for `scheduled`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExecuteRequest {
    pub kind: JobKind,
    pub job_id: JobId,
    pub org_id: OrgId,
    pub scheduled: DateTime<Utc>,
}

impl ExecuteRequest {
    pub fn key(&self) -> ExecutionKey {
        ExecutionKey {
            job_id: self.job_id,
            org_id: self.org_id,
            scheduled: self.scheduled,
        }
    }
}

/// How a dispatched request was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Enqueued,
    /// The same `(job, scheduled)` is already queued or running on the
    /// owning node.
    AlreadyQueued,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("no cluster member owns job {0}")]
    NoOwner(JobId),

    #[error("executor mailbox full for job {0}")]
    MailboxFull(JobId),

    #[error("executor region on node {0} is stopped")]
    RegionStopped(NodeId),

    #[error("no executor registered for job kind {0}")]
    UnknownJobKind(JobKind),

    #[error("executor is shutting down")]
    ShuttingDown,
}

/// Routes execute requests to the executor that owns the job id.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, request: ExecuteRequest) -> Result<Delivery, DispatchError>;
}
