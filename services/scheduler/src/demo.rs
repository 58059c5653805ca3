//! Demo workload for the standalone binary.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use cadence_jobs::{
    InMemoryOrganizationRepository, Job, JobBody, JobContext, JobKind, JobOutput, JobRepository,
    Organization,
};
use cadence_schedule::{PeriodUnit, PeriodicSchedule, ScheduleBounds};
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde_json::json;
use tracing::info;

pub const DEMO_KIND: &str = "demo";

/// Logs the execution and reports the instant it ran for.
#[derive(Debug, Clone)]
pub struct LoggingJobBody {
    work: Duration,
}

impl LoggingJobBody {
    pub fn new(work: Duration) -> Self {
        Self { work }
    }
}

impl Default for LoggingJobBody {
    fn default() -> Self {
        Self::new(Duration::from_millis(250))
    }
}

#[async_trait]
impl JobBody for LoggingJobBody {
    async fn execute(&self, ctx: JobContext) -> Result<JobOutput> {
        info!(
            job_id = %ctx.job().id,
            job_name = %ctx.job().name,
            scheduled = %ctx.scheduled(),
            deadline = %ctx.deadline(),
            "Running demo job"
        );

        tokio::select! {
            _ = ctx.cancelled() => anyhow::bail!("cancelled before completion"),
            _ = tokio::time::sleep(self.work) => {}
        }

        Ok(json!({
            "job": ctx.job().name,
            "scheduled": ctx.scheduled().to_rfc3339(),
        }))
    }
}

/// Seed a demo organization with an hourly job whose first run is the
/// current hour.
pub async fn seed_demo(
    jobs: &dyn JobRepository,
    organizations: &InMemoryOrganizationRepository,
    now: DateTime<Utc>,
) -> Result<Job> {
    let org = Organization::new("demo");
    organizations.add(org.clone());

    let start = now.duration_trunc(TimeDelta::hours(1))?;
    let schedule = PeriodicSchedule::new(
        ScheduleBounds::starting(start),
        PeriodUnit::Hour,
        TimeDelta::zero(),
    )?;
    let job = Job::new(org.id, "hourly-report", JobKind::new(DEMO_KIND), schedule.into());
    jobs.upsert_job(job.clone()).await?;

    info!(org_id = %org.id, job_id = %job.id, "Seeded demo job");
    Ok(job)
}
