//! Job executor.
//!
//! Each node hosts an [`ExecutorRegion`] for the job ids it owns. The region
//! keeps one [`JobExecutorActor`] per job id, so two requests for the same job
//! never run at once on a node; the repository claim covers the cluster.
//!
//! ## Request lifecycle
//!
//! ```text
//! deliver ──> mailbox ──> resolve job ──> claim (job_started)
//!                                            │
//!                       ┌────────────────────┴──────────┐
//!                   Claimed                      AlreadyClaimed /
//!                       │                        AlreadyCompleted
//!                  run body under                       │
//!                  deadline + cancel                  skip
//!                       │
//!        ┌──────────────┼──────────────┐
//!     success    error/panic/deadline  cancelled
//!        │              │              │
//!  job_succeeded    job_failed    left STARTED
//! ```
//!
//! On deadline or cancellation the body's token fires first; the body gets
//! [`ExecutorConfig::cancel_grace`] to return before its task is aborted.
//! Deadlines never exceed `execution_lease - cancel_grace`.

mod actor;
mod region;
mod registry;

use std::time::Duration;

pub use actor::JobExecutorActor;
pub use region::ExecutorRegion;
pub use registry::{JobType, JobTypeRegistry};

use crate::retry::RetryPolicy;

/// Executor tuning.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Per-job mailbox capacity.
    pub mailbox_size: usize,

    /// Idle actors passivate after this. `None` keeps them forever.
    pub idle_timeout: Option<Duration>,

    /// Deadline for jobs without their own timeout.
    pub default_timeout: Duration,

    /// TTL of the claim taken on each execution. Deadlines are capped so a
    /// body and its cancel grace end before the claim can be taken over.
    pub execution_lease: Duration,

    /// How long a cancelled body gets to return before it is aborted.
    pub cancel_grace: Duration,

    /// Retry policy for repository calls.
    pub retry: RetryPolicy,
}

impl ExecutorConfig {
    /// Longest deadline a body may get under this config.
    pub fn max_timeout(&self) -> Duration {
        self.execution_lease.saturating_sub(self.cancel_grace)
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            mailbox_size: 32,
            idle_timeout: Some(Duration::from_secs(300)),
            default_timeout: Duration::from_secs(300),
            execution_lease: Duration::from_secs(900),
            cancel_grace: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}
