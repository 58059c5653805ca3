//! Shared setup for the scheduler integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use cadence_id::{JobId, NodeId, OrgId};
use cadence_jobs::{
    ExecuteRequest, Execution, ExecutionState, JobBody, JobRepository, OrganizationRepository,
};
use cadence_scheduler::{
    BackoffPolicy, CoordinatorConfig, ExecutorConfig, ExecutorRegion, JobTypeRegistry,
    RetryPolicy,
};
use cadence_testing::{wait_until_async, Seeded};
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

pub const WAIT: Duration = Duration::from_secs(5);

/// Retries quickly so fault-injection tests stay fast.
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        backoff: BackoffPolicy {
            base: Duration::from_millis(1),
            max: Duration::from_millis(5),
            jitter: 0.0,
        },
    }
}

pub fn executor_config() -> ExecutorConfig {
    ExecutorConfig {
        retry: fast_retry(3),
        ..ExecutorConfig::default()
    }
}

/// Coordinator config for tests that drive `tick()` by hand.
pub fn manual_ticks() -> CoordinatorConfig {
    CoordinatorConfig {
        tick_interval: Duration::from_secs(3600),
        ..CoordinatorConfig::default()
    }
}

pub fn region_with(
    seeded: &Seeded,
    repository: Arc<dyn JobRepository>,
    body: Arc<dyn JobBody>,
    config: ExecutorConfig,
) -> Arc<ExecutorRegion> {
    let registry = JobTypeRegistry::new().register(repository, body);
    Arc::new(ExecutorRegion::new(
        NodeId::new(),
        Arc::new(registry),
        seeded.clock.clone(),
        config,
        CancellationToken::new(),
    ))
}

pub fn region(seeded: &Seeded, body: Arc<dyn JobBody>) -> Arc<ExecutorRegion> {
    region_with(seeded, seeded.jobs.clone(), body, executor_config())
}

pub fn registry(seeded: &Seeded, body: Arc<dyn JobBody>) -> JobTypeRegistry {
    JobTypeRegistry::new().register(seeded.jobs.clone(), body)
}

pub fn organizations(seeded: &Seeded) -> Arc<dyn OrganizationRepository> {
    seeded.orgs.clone()
}

pub fn request(seeded: &Seeded, job_id: JobId, scheduled: DateTime<Utc>) -> ExecuteRequest {
    ExecuteRequest {
        kind: seeded.kind.clone(),
        job_id,
        org_id: seeded.org.id,
        scheduled,
    }
}

pub async fn execution(
    repository: &dyn JobRepository,
    job_id: JobId,
    org_id: OrgId,
    scheduled: DateTime<Utc>,
) -> Option<Execution> {
    repository
        .get_execution(job_id, org_id, scheduled)
        .await
        .ok()
        .flatten()
}

/// Wait until the execution reaches `state`.
pub async fn wait_for_state(
    repository: &dyn JobRepository,
    job_id: JobId,
    org_id: OrgId,
    scheduled: DateTime<Utc>,
    state: ExecutionState,
) -> bool {
    wait_until_async(WAIT, move || async move {
        execution(repository, job_id, org_id, scheduled)
            .await
            .is_some_and(|e| e.state == state)
    })
    .await
}
