//! Error taxonomy for job execution.

use std::time::Duration;

use cadence_id::{JobId, OrgId};
use cadence_jobs::{JobKind, RepositoryError};
use cadence_schedule::ScheduleError;
use thiserror::Error;

/// Why a claimed execution ended in FAILED.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecutionFailure {
    /// The body returned an error. Holds the full error chain.
    #[error("{0}")]
    Failed(String),

    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("job body panicked: {0}")]
    Panicked(String),
}

/// Errors surfaced while handling one execute request.
#[derive(Debug, Error)]
pub enum JobError {
    /// Invalid schedule or job definition.
    #[error("invalid job configuration: {0}")]
    Configuration(#[from] ScheduleError),

    #[error("job {job_id} not found in organization {org_id}")]
    NotFound { job_id: JobId, org_id: OrgId },

    #[error("no executor registered for job kind {0}")]
    UnknownKind(JobKind),

    /// The body failed; the failure has been recorded.
    #[error("job execution failed: {0}")]
    Execution(#[from] ExecutionFailure),

    /// Repository unreachable after bounded retry; the attempt was abandoned.
    #[error("infrastructure error: {0}")]
    Infrastructure(#[from] RepositoryError),

    /// Shutdown or rebalance interrupted the body. Nothing was recorded.
    #[error("execution cancelled")]
    Cancelled,
}

impl JobError {
    /// Whether the execution reached a recorded terminal state.
    pub fn is_recorded(&self) -> bool {
        matches!(self, JobError::Execution(_))
    }
}
