use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cadence_id::{JobId, OrgId};
use cadence_jobs::{
    Claim, Execution, Job, JobKind, JobOutput, JobRepository, Organization,
    OrganizationRepository, Page, PageRequest, RepositoryError, StartOutcome,
};
use chrono::{DateTime, Utc};

/// Repository operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    UpsertJob,
    GetJob,
    ListJobs,
    GetLastRun,
    GetExecution,
    JobStarted,
    JobSucceeded,
    JobFailed,
    ListOrganizations,
}

#[derive(Default)]
struct Faults {
    /// Remaining injected failures per operation. `usize::MAX` = always.
    pending: HashMap<Operation, usize>,
    /// Calls that reach the inner repository but report failure anyway.
    lost_replies: HashMap<Operation, usize>,
    failing_orgs: HashSet<OrgId>,
    calls: HashMap<Operation, usize>,
}

impl Faults {
    fn check(&mut self, op: Operation) -> Result<(), RepositoryError> {
        *self.calls.entry(op).or_default() += 1;
        match self.pending.get_mut(&op) {
            Some(0) | None => Ok(()),
            Some(remaining) => {
                if *remaining != usize::MAX {
                    *remaining -= 1;
                }
                Err(RepositoryError::Unavailable(format!("injected {op:?} failure")))
            }
        }
    }

    fn lose_reply(&mut self, op: Operation) -> Result<(), RepositoryError> {
        match self.lost_replies.get_mut(&op) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(RepositoryError::Unavailable(format!("lost {op:?} reply")))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Default)]
struct FaultPlan(Mutex<Faults>);

impl FaultPlan {
    fn check(&self, op: Operation) -> Result<(), RepositoryError> {
        self.0
            .lock()
            .map_err(|_| RepositoryError::Internal("fault plan poisoned".into()))?
            .check(op)
    }

    fn fail_next(&self, op: Operation, times: usize) {
        if let Ok(mut f) = self.0.lock() {
            f.pending.insert(op, times);
        }
    }

    fn lose_reply(&self, op: Operation) -> Result<(), RepositoryError> {
        self.0
            .lock()
            .map_err(|_| RepositoryError::Internal("fault plan poisoned".into()))?
            .lose_reply(op)
    }

    fn calls(&self, op: Operation) -> usize {
        self.0
            .lock()
            .map(|f| f.calls.get(&op).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

/// Wraps a [`JobRepository`] and injects `Unavailable` errors on demand.
pub struct FlakyJobRepository {
    inner: Arc<dyn JobRepository>,
    faults: FaultPlan,
}

impl FlakyJobRepository {
    pub fn new(inner: Arc<dyn JobRepository>) -> Self {
        Self {
            inner,
            faults: FaultPlan::default(),
        }
    }

    /// Fail the next `times` calls of `op`.
    pub fn fail_next(&self, op: Operation, times: usize) {
        self.faults.fail_next(op, times);
    }

    pub fn fail_always(&self, op: Operation) {
        self.faults.fail_next(op, usize::MAX);
    }

    /// Let the next `times` calls of `op` take effect, then report them as failed.
    pub fn lose_next_replies(&self, op: Operation, times: usize) {
        if let Ok(mut f) = self.faults.0.lock() {
            f.lost_replies.insert(op, times);
        }
    }

    pub fn heal(&self, op: Operation) {
        self.faults.fail_next(op, 0);
    }

    /// Make `list_jobs` fail for one organization only.
    pub fn fail_listing_for(&self, org_id: OrgId) {
        if let Ok(mut f) = self.faults.0.lock() {
            f.failing_orgs.insert(org_id);
        }
    }

    /// Calls made to `op`, failed ones included.
    pub fn calls(&self, op: Operation) -> usize {
        self.faults.calls(op)
    }
}

#[async_trait]
impl JobRepository for FlakyJobRepository {
    fn kind(&self) -> &JobKind {
        self.inner.kind()
    }

    async fn upsert_job(&self, job: Job) -> Result<(), RepositoryError> {
        self.faults.check(Operation::UpsertJob)?;
        self.inner.upsert_job(job).await
    }

    async fn get_job(&self, job_id: JobId, org_id: OrgId) -> Result<Option<Job>, RepositoryError> {
        self.faults.check(Operation::GetJob)?;
        self.inner.get_job(job_id, org_id).await
    }

    async fn list_jobs(
        &self,
        org_id: OrgId,
        page: PageRequest,
    ) -> Result<Page<Job>, RepositoryError> {
        self.faults.check(Operation::ListJobs)?;
        let org_fails = self
            .faults
            .0
            .lock()
            .map(|f| f.failing_orgs.contains(&org_id))
            .unwrap_or(false);
        if org_fails {
            return Err(RepositoryError::Unavailable(format!(
                "injected listing failure for {org_id}"
            )));
        }
        self.inner.list_jobs(org_id, page).await
    }

    async fn get_last_run(
        &self,
        job_id: JobId,
        org_id: OrgId,
    ) -> Result<Option<DateTime<Utc>>, RepositoryError> {
        self.faults.check(Operation::GetLastRun)?;
        self.inner.get_last_run(job_id, org_id).await
    }

    async fn get_execution(
        &self,
        job_id: JobId,
        org_id: OrgId,
        scheduled: DateTime<Utc>,
    ) -> Result<Option<Execution>, RepositoryError> {
        self.faults.check(Operation::GetExecution)?;
        self.inner.get_execution(job_id, org_id, scheduled).await
    }

    async fn job_started(
        &self,
        job_id: JobId,
        org_id: OrgId,
        scheduled: DateTime<Utc>,
        claim: Claim,
    ) -> Result<StartOutcome, RepositoryError> {
        self.faults.check(Operation::JobStarted)?;
        let outcome = self.inner.job_started(job_id, org_id, scheduled, claim).await?;
        self.faults.lose_reply(Operation::JobStarted)?;
        Ok(outcome)
    }

    async fn job_succeeded(
        &self,
        job_id: JobId,
        org_id: OrgId,
        scheduled: DateTime<Utc>,
        claim: &Claim,
        result: JobOutput,
    ) -> Result<(), RepositoryError> {
        self.faults.check(Operation::JobSucceeded)?;
        self.inner
            .job_succeeded(job_id, org_id, scheduled, claim, result)
            .await
    }

    async fn job_failed(
        &self,
        job_id: JobId,
        org_id: OrgId,
        scheduled: DateTime<Utc>,
        claim: &Claim,
        error: String,
    ) -> Result<(), RepositoryError> {
        self.faults.check(Operation::JobFailed)?;
        self.inner
            .job_failed(job_id, org_id, scheduled, claim, error)
            .await
    }
}

/// Wraps an [`OrganizationRepository`] and injects `Unavailable` errors.
pub struct FlakyOrganizationRepository {
    inner: Arc<dyn OrganizationRepository>,
    faults: FaultPlan,
}

impl FlakyOrganizationRepository {
    pub fn new(inner: Arc<dyn OrganizationRepository>) -> Self {
        Self {
            inner,
            faults: FaultPlan::default(),
        }
    }

    pub fn fail_next(&self, times: usize) {
        self.faults.fail_next(Operation::ListOrganizations, times);
    }
}

#[async_trait]
impl OrganizationRepository for FlakyOrganizationRepository {
    async fn list_organizations(&self) -> Result<Vec<Organization>, RepositoryError> {
        self.faults.check(Operation::ListOrganizations)?;
        self.inner.list_organizations().await
    }
}
