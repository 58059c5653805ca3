//! Per-job executor actor.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cadence_id::{JobId, NodeId};
use cadence_jobs::{Claim, Clock, ExecuteRequest, Job, JobContext, JobOutput, StartOutcome};
use chrono::{DateTime, TimeDelta, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::region::QueuedSet;
use super::registry::JobTypeRegistry;
use super::ExecutorConfig;
use crate::actors::{Actor, ActorContext, ActorError};
use crate::error::{ExecutionFailure, JobError};
use crate::retry::retry_with_backoff;

/// How a request that did not fail ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Succeeded,
    /// Someone else holds or completed the instant.
    Skipped(StartOutcome),
}

/// Runs every execute request for one job id, one at a time.
pub struct JobExecutorActor {
    name: String,
    job_id: JobId,
    node_id: NodeId,
    registry: Arc<JobTypeRegistry>,
    clock: Arc<dyn Clock>,
    config: ExecutorConfig,
    queued: Arc<QueuedSet>,
}

impl JobExecutorActor {
    pub(crate) fn new(
        job_id: JobId,
        node_id: NodeId,
        registry: Arc<JobTypeRegistry>,
        clock: Arc<dyn Clock>,
        config: ExecutorConfig,
        queued: Arc<QueuedSet>,
    ) -> Self {
        Self {
            name: format!("executor-{job_id}"),
            job_id,
            node_id,
            registry,
            clock,
            config,
            queued,
        }
    }

    /// Run one request to completion.
    ///
    /// Returns `Err(JobError::Execution)` after a failure has been recorded,
    /// and `Err(JobError::Cancelled)` when `cancel` fired mid-body, in which
    /// case the execution is left STARTED.
    pub async fn execute(
        &self,
        request: &ExecuteRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, JobError> {
        let job_type = self
            .registry
            .get(&request.kind)
            .ok_or_else(|| JobError::UnknownKind(request.kind.clone()))?;
        let repo = job_type.repository.as_ref();
        let retry = &self.config.retry;
        let (job_id, org_id, scheduled) = (request.job_id, request.org_id, request.scheduled);

        let job = retry_with_backoff(retry, "get_job", move || repo.get_job(job_id, org_id))
            .await?
            .ok_or(JobError::NotFound { job_id, org_id })?;

        // Requests drained after cancellation must not take a claim.
        if cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        let claim = Claim::new(self.node_id, self.clock.now(), self.config.execution_lease);
        let start = {
            let claim = claim.clone();
            retry_with_backoff(retry, "job_started", move || {
                repo.job_started(job_id, org_id, scheduled, claim.clone())
            })
            .await?
        };
        match start {
            StartOutcome::Claimed => {}
            StartOutcome::AlreadyClaimed { owner } if owner == self.node_id => {
                // An earlier attempt may have landed before its reply was lost.
                let ours = retry_with_backoff(retry, "get_execution", move || {
                    repo.get_execution(job_id, org_id, scheduled)
                })
                .await?
                .is_some_and(|e| e.claim.as_ref() == Some(&claim));
                if !ours {
                    return Ok(ExecutionOutcome::Skipped(start));
                }
            }
            other => return Ok(ExecutionOutcome::Skipped(other)),
        }

        let timeout = self.timeout_for(&job);
        let deadline = TimeDelta::from_std(timeout)
            .ok()
            .and_then(|t| claim.claimed_at.checked_add_signed(t))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let body_cancel = cancel.child_token();
        let ctx = JobContext::new(job, scheduled, deadline, body_cancel.clone());
        let body = job_type.body.clone();
        let mut task = tokio::spawn(async move { body.execute(ctx).await });

        let outcome: Result<JobOutput, ExecutionFailure> = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                body_cancel.cancel();
                self.wind_down(&mut task).await;
                return Err(JobError::Cancelled);
            }

            joined = tokio::time::timeout(timeout, &mut task) => match joined {
                Err(_) => {
                    body_cancel.cancel();
                    self.wind_down(&mut task).await;
                    Err(ExecutionFailure::DeadlineExceeded(timeout))
                }
                Ok(Ok(Ok(output))) => Ok(output),
                Ok(Ok(Err(e))) => Err(ExecutionFailure::Failed(format!("{e:#}"))),
                Ok(Err(join_error)) if join_error.is_panic() => {
                    Err(ExecutionFailure::Panicked(panic_message(join_error.into_panic())))
                }
                Ok(Err(join_error)) => Err(ExecutionFailure::Failed(join_error.to_string())),
            },
        };

        let claim = &claim;
        match outcome {
            Ok(output) => {
                retry_with_backoff(retry, "job_succeeded", move || {
                    repo.job_succeeded(job_id, org_id, scheduled, claim, output.clone())
                })
                .await?;
                Ok(ExecutionOutcome::Succeeded)
            }
            Err(failure) => {
                let message = failure.to_string();
                retry_with_backoff(retry, "job_failed", move || {
                    repo.job_failed(job_id, org_id, scheduled, claim, message.clone())
                })
                .await?;
                Err(JobError::Execution(failure))
            }
        }
    }
}

#[async_trait]
impl Actor for JobExecutorActor {
    type Message = ExecuteRequest;

    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(
        &mut self,
        request: ExecuteRequest,
        ctx: &mut ActorContext,
    ) -> Result<bool, ActorError> {
        let key = request.key();
        let result = self.execute(&request, &ctx.cancel).await;
        self.queued.remove(&key);

        let (job_id, scheduled) = (request.job_id, request.scheduled);
        match result {
            Ok(ExecutionOutcome::Succeeded) => {
                info!(job_id = %job_id, scheduled = %scheduled, node_id = %self.node_id, "Job succeeded");
            }
            Ok(ExecutionOutcome::Skipped(outcome)) => {
                debug!(job_id = %job_id, scheduled = %scheduled, ?outcome, "Execution not claimed, skipping");
            }
            Err(e @ JobError::Execution(_)) => {
                warn!(job_id = %job_id, scheduled = %scheduled, error = %e, "Job failed");
            }
            Err(JobError::Cancelled) => {
                info!(job_id = %job_id, scheduled = %scheduled, "Execution cancelled, left started for reclaim");
                return Ok(false);
            }
            Err(e @ (JobError::NotFound { .. } | JobError::UnknownKind(_))) => {
                warn!(job_id = %job_id, scheduled = %scheduled, error = %e, "Dropping execute request");
            }
            Err(e @ (JobError::Infrastructure(_) | JobError::Configuration(_))) => {
                error!(job_id = %job_id, scheduled = %scheduled, error = %e, "Execution abandoned");
            }
        }
        Ok(true)
    }

    fn on_discard(&mut self, request: ExecuteRequest, _ctx: &mut ActorContext) {
        debug!(job_id = %request.job_id, scheduled = %request.scheduled, "Discarding undelivered request");
        self.queued.remove(&request.key());
    }
}

impl JobExecutorActor {
    /// The job's own timeout or the default, capped below the claim lease.
    fn timeout_for(&self, job: &Job) -> Duration {
        let requested = job.timeout.unwrap_or(self.config.default_timeout);
        let ceiling = self.config.max_timeout();
        if requested > ceiling {
            warn!(
                job_id = %job.id,
                requested = ?requested,
                ceiling = ?ceiling,
                "Job timeout outlives the execution lease, capping it"
            );
            return ceiling;
        }
        requested
    }

    /// Give a cancelled body `cancel_grace` to return, then abort it.
    async fn wind_down(&self, task: &mut JoinHandle<anyhow::Result<JobOutput>>) {
        let grace = self.config.cancel_grace;
        if tokio::time::timeout(grace, &mut *task).await.is_err() {
            warn!(job_id = %self.job_id, grace = ?grace, "Job body ignored cancellation, aborting");
            task.abort();
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
