//! Repository contracts.
//!
//! A [`JobRepository`] serves one [`JobKind`]: it stores the jobs of that
//! kind and the execution records for their scheduled instants. State
//! transitions are monotonic and guarded by the claim, so the repository
//! alone decides who runs an instant.

use async_trait::async_trait;
use cadence_id::{JobId, OrgId};
use chrono::{DateTime, Utc};

use crate::error::RepositoryError;
use crate::model::{Claim, Execution, Job, JobKind, JobOutput, Organization, StartOutcome};

/// Page selector for [`JobRepository::list_jobs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub offset: usize,
    pub limit: usize,
}

impl PageRequest {
    pub fn first(limit: usize) -> Self {
        Self { offset: 0, limit }
    }
}

/// One page of results plus the total size of the listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
}

impl<T> Page<T> {
    /// The request for the page after `current`, if any items remain.
    pub fn next_request(&self, current: PageRequest) -> Option<PageRequest> {
        let consumed = current.offset + self.items.len();
        (!self.items.is_empty() && consumed < self.total).then_some(PageRequest {
            offset: consumed,
            limit: current.limit,
        })
    }
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    /// The job kind this repository serves.
    fn kind(&self) -> &JobKind;

    /// Creates or replaces a job definition.
    async fn upsert_job(&self, job: Job) -> Result<(), RepositoryError>;

    async fn get_job(&self, job_id: JobId, org_id: OrgId) -> Result<Option<Job>, RepositoryError>;

    /// Jobs of an organization in a stable order.
    async fn list_jobs(
        &self,
        org_id: OrgId,
        page: PageRequest,
    ) -> Result<Page<Job>, RepositoryError>;

    /// Latest scheduled instant that reached a terminal state.
    async fn get_last_run(
        &self,
        job_id: JobId,
        org_id: OrgId,
    ) -> Result<Option<DateTime<Utc>>, RepositoryError>;

    async fn get_execution(
        &self,
        job_id: JobId,
        org_id: OrgId,
        scheduled: DateTime<Utc>,
    ) -> Result<Option<Execution>, RepositoryError>;

    /// Atomically claims the instant. Only a `Claimed` outcome entitles the
    /// caller to run the body.
    async fn job_started(
        &self,
        job_id: JobId,
        org_id: OrgId,
        scheduled: DateTime<Utc>,
        claim: Claim,
    ) -> Result<StartOutcome, RepositoryError>;

    /// Started -> Succeeded. Fails with `Conflict` unless `claim` is the
    /// current claim.
    async fn job_succeeded(
        &self,
        job_id: JobId,
        org_id: OrgId,
        scheduled: DateTime<Utc>,
        claim: &Claim,
        result: JobOutput,
    ) -> Result<(), RepositoryError>;

    /// Started -> Failed. Fails with `Conflict` unless `claim` is the
    /// current claim.
    async fn job_failed(
        &self,
        job_id: JobId,
        org_id: OrgId,
        scheduled: DateTime<Utc>,
        claim: &Claim,
        error: String,
    ) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait OrganizationRepository: Send + Sync {
    async fn list_organizations(&self) -> Result<Vec<Organization>, RepositoryError>;
}
