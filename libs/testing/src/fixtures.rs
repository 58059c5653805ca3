//! Common jobs and seeded repositories.

use std::sync::Arc;
use std::time::Duration;

use cadence_id::OrgId;
use cadence_jobs::{
    InMemoryJobRepository, InMemoryOrganizationRepository, Job, JobKind, JobRepository,
    Organization,
};
use cadence_schedule::{OneOffSchedule, PeriodUnit, PeriodicSchedule, Schedule, ScheduleBounds};
use chrono::{DateTime, TimeDelta, TimeZone, Utc};

use crate::clock::ManualClock;

/// UTC instant from calendar fields. Panics on an invalid date.
pub fn instant(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, minute, 0)
        .single()
        .unwrap_or_else(|| panic!("invalid instant {year}-{month}-{day} {hour}:{minute}"))
}

/// Periodic schedule starting at `start`.
pub fn periodic(start: DateTime<Utc>, period: PeriodUnit, offset: TimeDelta) -> Schedule {
    match PeriodicSchedule::new(ScheduleBounds::starting(start), period, offset) {
        Ok(schedule) => schedule.into(),
        Err(e) => panic!("invalid periodic schedule: {e}"),
    }
}

pub fn one_off(at: DateTime<Utc>) -> Schedule {
    OneOffSchedule::at(at).into()
}

pub fn job(org_id: OrgId, name: &str, kind: &JobKind, schedule: Schedule) -> Job {
    Job::new(org_id, name, kind.clone(), schedule)
}

/// Repositories sharing one manual clock, with an organization already in
/// place.
pub struct Seeded {
    pub kind: JobKind,
    pub clock: Arc<ManualClock>,
    pub jobs: Arc<InMemoryJobRepository>,
    pub orgs: Arc<InMemoryOrganizationRepository>,
    pub org: Organization,
}

impl Seeded {
    pub fn new(kind: &str, now: DateTime<Utc>) -> Self {
        let kind = JobKind::new(kind);
        let clock = Arc::new(ManualClock::new(now));
        let jobs = Arc::new(InMemoryJobRepository::with_clock(kind.clone(), clock.clone()));
        let orgs = Arc::new(InMemoryOrganizationRepository::new());
        let org = Organization::new("acme");
        orgs.add(org.clone());
        Self {
            kind,
            clock,
            jobs,
            orgs,
            org,
        }
    }

    /// Add another organization.
    pub fn add_org(&self, name: &str) -> Organization {
        let org = Organization::new(name);
        self.orgs.add(org.clone());
        org
    }

    /// Store a job for the default organization.
    pub async fn add_job(&self, name: &str, schedule: Schedule) -> Job {
        self.add_job_to(self.org.id, name, schedule, None).await
    }

    pub async fn add_job_to(
        &self,
        org_id: OrgId,
        name: &str,
        schedule: Schedule,
        timeout: Option<Duration>,
    ) -> Job {
        let mut job = job(org_id, name, &self.kind, schedule);
        job.timeout = timeout;
        if let Err(e) = self.jobs.upsert_job(job.clone()).await {
            panic!("failed to seed job {name}: {e}");
        }
        job
    }
}
