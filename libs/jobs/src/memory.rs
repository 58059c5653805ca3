//! In-memory repositories.
//!
//! Used by tests, the demo binary and single-process deployments. Every
//! operation takes one mutex, which makes `job_started` a true
//! compare-and-set. The job repository also records each accepted state
//! transition so tests can assert on exactly what happened.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use cadence_id::{JobId, NodeId, OrgId};
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::error::RepositoryError;
use crate::model::{
    Claim, Execution, ExecutionState, Job, JobKind, JobOutput, Organization, StartOutcome,
};
use crate::repository::{JobRepository, OrganizationRepository, Page, PageRequest};

/// One accepted execution state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub job_id: JobId,
    pub scheduled: DateTime<Utc>,
    /// `None` when the record was created by this transition.
    pub from: Option<ExecutionState>,
    pub to: ExecutionState,
    pub node_id: NodeId,
    pub at: DateTime<Utc>,
}

#[derive(Default)]
struct JobStore {
    jobs: BTreeMap<JobId, Job>,
    executions: HashMap<(JobId, DateTime<Utc>), Execution>,
    transitions: Vec<Transition>,
}

impl JobStore {
    fn job_in_org(&self, job_id: JobId, org_id: OrgId) -> Option<&Job> {
        self.jobs.get(&job_id).filter(|job| job.org_id == org_id)
    }

    fn require_job(&self, job_id: JobId, org_id: OrgId) -> Result<(), RepositoryError> {
        match self.job_in_org(job_id, org_id) {
            Some(_) => Ok(()),
            None => Err(RepositoryError::NotFound(format!(
                "job {job_id} in organization {org_id}"
            ))),
        }
    }
}

/// [`JobRepository`] backed by process memory.
pub struct InMemoryJobRepository {
    kind: JobKind,
    clock: Arc<dyn Clock>,
    store: Mutex<JobStore>,
}

impl InMemoryJobRepository {
    pub fn new(kind: JobKind) -> Self {
        Self::with_clock(kind, Arc::new(SystemClock))
    }

    /// Claim expiry and completion timestamps are read from `clock`.
    pub fn with_clock(kind: JobKind, clock: Arc<dyn Clock>) -> Self {
        Self {
            kind,
            clock,
            store: Mutex::new(JobStore::default()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, JobStore>, RepositoryError> {
        self.store
            .lock()
            .map_err(|_| RepositoryError::Internal("job store lock poisoned".to_string()))
    }

    /// Every accepted transition, oldest first.
    pub fn transitions(&self) -> Vec<Transition> {
        self.lock().map(|s| s.transitions.clone()).unwrap_or_default()
    }

    /// Execution records of one job, ordered by scheduled instant.
    pub fn executions_of(&self, job_id: JobId) -> Vec<Execution> {
        let mut executions: Vec<Execution> = self
            .lock()
            .map(|s| {
                s.executions
                    .values()
                    .filter(|e| e.job_id == job_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        executions.sort_by_key(|e| e.scheduled);
        executions
    }

    pub fn remove_job(&self, job_id: JobId) -> Option<Job> {
        self.lock().ok().and_then(|mut s| s.jobs.remove(&job_id))
    }

    fn complete(
        &self,
        job_id: JobId,
        org_id: OrgId,
        scheduled: DateTime<Utc>,
        claim: &Claim,
        outcome: Result<JobOutput, String>,
    ) -> Result<(), RepositoryError> {
        let now = self.clock.now();
        let mut store = self.lock()?;
        store.require_job(job_id, org_id)?;

        let next = if outcome.is_ok() {
            ExecutionState::Succeeded
        } else {
            ExecutionState::Failed
        };

        let execution = store
            .executions
            .get_mut(&(job_id, scheduled))
            .ok_or_else(|| {
                RepositoryError::Conflict(format!(
                    "execution {job_id}@{scheduled} was never started"
                ))
            })?;

        if !execution.state.can_transition_to(next) || execution.state == next {
            return Err(RepositoryError::Conflict(format!(
                "execution {job_id}@{scheduled} is {}, cannot become {next}",
                execution.state
            )));
        }
        if execution.claim.as_ref() != Some(claim) {
            return Err(RepositoryError::Conflict(format!(
                "node {} no longer holds the claim on {job_id}@{scheduled}",
                claim.node_id
            )));
        }

        let from = execution.state;
        execution.state = next;
        execution.completed_at = Some(now);
        match outcome {
            Ok(result) => execution.result = Some(result),
            Err(error) => execution.error = Some(error),
        }

        store.transitions.push(Transition {
            job_id,
            scheduled,
            from: Some(from),
            to: next,
            node_id: claim.node_id,
            at: now,
        });
        debug!(job_id = %job_id, scheduled = %scheduled, state = %next, "execution completed");
        Ok(())
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    fn kind(&self) -> &JobKind {
        &self.kind
    }

    async fn upsert_job(&self, job: Job) -> Result<(), RepositoryError> {
        if job.kind != self.kind {
            return Err(RepositoryError::Conflict(format!(
                "job {} is of kind {}, repository serves {}",
                job.id, job.kind, self.kind
            )));
        }
        self.lock()?.jobs.insert(job.id, job);
        Ok(())
    }

    async fn get_job(&self, job_id: JobId, org_id: OrgId) -> Result<Option<Job>, RepositoryError> {
        Ok(self.lock()?.job_in_org(job_id, org_id).cloned())
    }

    async fn list_jobs(
        &self,
        org_id: OrgId,
        page: PageRequest,
    ) -> Result<Page<Job>, RepositoryError> {
        let store = self.lock()?;
        let matching: Vec<&Job> = store
            .jobs
            .values()
            .filter(|job| job.org_id == org_id)
            .collect();
        let total = matching.len();
        let items = matching
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect();
        Ok(Page { items, total })
    }

    async fn get_last_run(
        &self,
        job_id: JobId,
        org_id: OrgId,
    ) -> Result<Option<DateTime<Utc>>, RepositoryError> {
        let store = self.lock()?;
        Ok(store
            .executions
            .values()
            .filter(|e| e.job_id == job_id && e.org_id == org_id && e.state.is_terminal())
            .map(|e| e.scheduled)
            .max())
    }

    async fn get_execution(
        &self,
        job_id: JobId,
        org_id: OrgId,
        scheduled: DateTime<Utc>,
    ) -> Result<Option<Execution>, RepositoryError> {
        let store = self.lock()?;
        Ok(store
            .executions
            .get(&(job_id, scheduled))
            .filter(|e| e.org_id == org_id)
            .cloned())
    }

    async fn job_started(
        &self,
        job_id: JobId,
        org_id: OrgId,
        scheduled: DateTime<Utc>,
        claim: Claim,
    ) -> Result<StartOutcome, RepositoryError> {
        let now = self.clock.now();
        let mut store = self.lock()?;
        store.require_job(job_id, org_id)?;

        let from = match store.executions.get(&(job_id, scheduled)) {
            None => None,
            Some(existing) if existing.state.is_terminal() => {
                return Ok(StartOutcome::AlreadyCompleted(existing.state));
            }
            Some(existing) if existing.is_in_flight(now) => {
                let owner = existing
                    .claim
                    .as_ref()
                    .map(|c| c.node_id)
                    .unwrap_or(claim.node_id);
                return Ok(StartOutcome::AlreadyClaimed { owner });
            }
            Some(existing) => Some(existing.state),
        };

        let node_id = claim.node_id;
        store.executions.insert(
            (job_id, scheduled),
            Execution {
                job_id,
                org_id,
                scheduled,
                state: ExecutionState::Started,
                started_at: Some(claim.claimed_at),
                claim: Some(claim),
                completed_at: None,
                result: None,
                error: None,
            },
        );
        store.transitions.push(Transition {
            job_id,
            scheduled,
            from,
            to: ExecutionState::Started,
            node_id,
            at: now,
        });
        debug!(job_id = %job_id, scheduled = %scheduled, node_id = %node_id, reclaimed = from.is_some(), "execution claimed");
        Ok(StartOutcome::Claimed)
    }

    async fn job_succeeded(
        &self,
        job_id: JobId,
        org_id: OrgId,
        scheduled: DateTime<Utc>,
        claim: &Claim,
        result: JobOutput,
    ) -> Result<(), RepositoryError> {
        self.complete(job_id, org_id, scheduled, claim, Ok(result))
    }

    async fn job_failed(
        &self,
        job_id: JobId,
        org_id: OrgId,
        scheduled: DateTime<Utc>,
        claim: &Claim,
        error: String,
    ) -> Result<(), RepositoryError> {
        self.complete(job_id, org_id, scheduled, claim, Err(error))
    }
}

/// [`OrganizationRepository`] backed by process memory.
#[derive(Default)]
pub struct InMemoryOrganizationRepository {
    organizations: Mutex<Vec<Organization>>,
}

impl InMemoryOrganizationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, organization: Organization) {
        if let Ok(mut orgs) = self.organizations.lock() {
            orgs.retain(|o| o.id != organization.id);
            orgs.push(organization);
        }
    }
}

#[async_trait]
impl OrganizationRepository for InMemoryOrganizationRepository {
    async fn list_organizations(&self) -> Result<Vec<Organization>, RepositoryError> {
        self.organizations
            .lock()
            .map(|orgs| orgs.clone())
            .map_err(|_| RepositoryError::Internal("organization lock poisoned".to_string()))
    }
}
