//! Tick logic.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use cadence_jobs::{
    Clock, Delivery, Dispatcher, ExecuteRequest, ExecutionKey, Job, JobKind, JobRepository,
    Organization, OrganizationRepository, PageRequest, RepositoryError,
};
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use tracing::{debug, info, instrument, warn};

use super::{CoordinatorConfig, CoordinatorError, CoordinatorStats, TickReport};
use crate::leader::LeaderElection;

const IDLE: u8 = 0;
const SCANNING: u8 = 1;
const DISPATCHING: u8 = 2;

/// Where the current tick is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickPhase {
    Idle,
    Scanning,
    Dispatching,
}

/// Resets the phase to Idle however the tick ends.
struct PhaseGuard<'a>(&'a AtomicU8);

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.0.store(IDLE, Ordering::SeqCst);
    }
}

enum Decision {
    Due(DateTime<Utc>),
    NotDue,
    InFlight,
    Exhausted,
}

#[derive(Default)]
struct OrgScan {
    jobs_scanned: usize,
    due: Vec<ExecuteRequest>,
    not_due: usize,
    in_flight: usize,
    exhausted: usize,
    errors: usize,
}

/// Finds due instants of one job kind and dispatches them.
pub struct JobCoordinator {
    pub(super) kind: JobKind,
    jobs: Arc<dyn JobRepository>,
    organizations: Arc<dyn OrganizationRepository>,
    dispatcher: Arc<dyn Dispatcher>,
    clock: Arc<dyn Clock>,
    pub(super) leader: Arc<dyn LeaderElection>,
    pub(super) config: CoordinatorConfig,
    phase: AtomicU8,
    pub(super) stats: Mutex<CoordinatorStats>,
}

impl JobCoordinator {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        organizations: Arc<dyn OrganizationRepository>,
        dispatcher: Arc<dyn Dispatcher>,
        clock: Arc<dyn Clock>,
        leader: Arc<dyn LeaderElection>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            kind: jobs.kind().clone(),
            jobs,
            organizations,
            dispatcher,
            clock,
            leader,
            config,
            phase: AtomicU8::new(IDLE),
            stats: Mutex::new(CoordinatorStats::default()),
        }
    }

    pub fn kind(&self) -> &JobKind {
        &self.kind
    }

    pub fn phase(&self) -> TickPhase {
        match self.phase.load(Ordering::SeqCst) {
            SCANNING => TickPhase::Scanning,
            DISPATCHING => TickPhase::Dispatching,
            _ => TickPhase::Idle,
        }
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub(super) fn record<F: FnOnce(&mut CoordinatorStats)>(&self, update: F) {
        if let Ok(mut stats) = self.stats.lock() {
            update(&mut stats);
        }
    }

    /// Run one scan-and-dispatch pass.
    ///
    /// Returns [`CoordinatorError::TickInProgress`] without doing anything if
    /// another tick is running.
    #[instrument(skip(self), fields(kind = %self.kind))]
    pub async fn tick(&self) -> Result<TickReport, CoordinatorError> {
        if self
            .phase
            .compare_exchange(IDLE, SCANNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.record(|s| s.ticks_dropped += 1);
            return Err(CoordinatorError::TickInProgress);
        }
        let _guard = PhaseGuard(&self.phase);

        let result = self.scan_and_dispatch().await;
        match &result {
            Ok(report) => self.record(|s| {
                s.ticks += 1;
                s.dispatched += report.dispatched as u64;
            }),
            Err(_) => self.record(|s| s.ticks_failed += 1),
        }
        result
    }

    async fn scan_and_dispatch(&self) -> Result<TickReport, CoordinatorError> {
        let now = self.clock.now();
        let organizations = self
            .organizations
            .list_organizations()
            .await
            .map_err(CoordinatorError::Organizations)?;

        let mut report = TickReport {
            organizations: organizations.len(),
            ..TickReport::default()
        };

        let scans: Vec<(Organization, Result<OrgScan, RepositoryError>)> =
            stream::iter(organizations)
                .map(|org| async move {
                    let scan = self.scan_organization(&org, now).await;
                    (org, scan)
                })
                .buffer_unordered(self.config.org_concurrency.max(1))
                .collect()
                .await;

        let mut due = Vec::new();
        for (org, scan) in scans {
            match scan {
                Ok(scan) => {
                    report.jobs_scanned += scan.jobs_scanned;
                    report.not_due += scan.not_due;
                    report.in_flight += scan.in_flight;
                    report.exhausted += scan.exhausted;
                    report.errors += scan.errors;
                    due.extend(scan.due);
                }
                Err(e) => {
                    warn!(org_id = %org.id, error = %e, "Failed to scan organization, skipping");
                    report.organizations_failed += 1;
                }
            }
        }

        self.phase.store(DISPATCHING, Ordering::SeqCst);
        let mut dispatched: HashSet<ExecutionKey> = HashSet::new();
        for request in due {
            if !dispatched.insert(request.key()) {
                continue;
            }
            let (job_id, scheduled) = (request.job_id, request.scheduled);
            match self.dispatcher.dispatch(request).await {
                Ok(Delivery::Enqueued) => {
                    debug!(job_id = %job_id, scheduled = %scheduled, "Dispatched execution");
                    report.dispatched += 1;
                }
                Ok(Delivery::AlreadyQueued) => report.already_queued += 1,
                Err(e) => {
                    warn!(job_id = %job_id, scheduled = %scheduled, error = %e, "Dispatch failed");
                    report.errors += 1;
                }
            }
        }

        if report.dispatched > 0 || report.errors > 0 || report.organizations_failed > 0 {
            info!(
                organizations = report.organizations,
                organizations_failed = report.organizations_failed,
                jobs_scanned = report.jobs_scanned,
                dispatched = report.dispatched,
                in_flight = report.in_flight,
                errors = report.errors,
                "Coordinator tick complete"
            );
        } else {
            debug!(jobs_scanned = report.jobs_scanned, "Coordinator tick complete");
        }
        Ok(report)
    }

    /// Page through an organization's jobs. A listing failure fails the
    /// organization; a job failure only that job.
    async fn scan_organization(
        &self,
        org: &Organization,
        now: DateTime<Utc>,
    ) -> Result<OrgScan, RepositoryError> {
        let mut scan = OrgScan::default();
        let mut request = Some(PageRequest::first(self.config.page_size.max(1)));

        while let Some(current) = request {
            let page = self.jobs.list_jobs(org.id, current).await?;
            for job in &page.items {
                scan.jobs_scanned += 1;
                match self.evaluate(job, now).await {
                    Ok(Decision::Due(scheduled)) => scan.due.push(ExecuteRequest {
                        kind: job.kind.clone(),
                        job_id: job.id,
                        org_id: job.org_id,
                        scheduled,
                    }),
                    Ok(Decision::NotDue) => scan.not_due += 1,
                    Ok(Decision::InFlight) => scan.in_flight += 1,
                    Ok(Decision::Exhausted) => scan.exhausted += 1,
                    Err(e) => {
                        warn!(job_id = %job.id, org_id = %org.id, error = %e, "Failed to evaluate job, skipping");
                        scan.errors += 1;
                    }
                }
            }
            request = page.next_request(current);
        }
        Ok(scan)
    }

    async fn evaluate(&self, job: &Job, now: DateTime<Utc>) -> Result<Decision, RepositoryError> {
        let last_run = self.jobs.get_last_run(job.id, job.org_id).await?;
        let Some(next) = job.schedule.next_run(last_run) else {
            return Ok(Decision::Exhausted);
        };
        if next > now {
            return Ok(Decision::NotDue);
        }

        let decision = match self.jobs.get_execution(job.id, job.org_id, next).await? {
            None => Decision::Due(next),
            Some(execution) if execution.is_in_flight(now) => Decision::InFlight,
            Some(execution) if execution.state.is_terminal() => {
                // last_run is at least this instant; only a racing completion lands here.
                Decision::InFlight
            }
            Some(_) => Decision::Due(next),
        };
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cadence_id::NodeId;
    use cadence_jobs::{Claim, ExecutionState, StartOutcome};
    use cadence_schedule::PeriodUnit;
    use cadence_testing::{
        fixtures, instant, FlakyJobRepository, FlakyOrganizationRepository, Operation,
        RecordingDispatcher, Seeded,
    };
    use chrono::TimeDelta;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    use crate::leader::StaticLeadership;

    fn coordinator(
        seeded: &Seeded,
        jobs: Arc<dyn JobRepository>,
        organizations: Arc<dyn OrganizationRepository>,
        dispatcher: Arc<RecordingDispatcher>,
        page_size: usize,
    ) -> JobCoordinator {
        JobCoordinator::new(
            jobs,
            organizations,
            dispatcher,
            seeded.clock.clone(),
            Arc::new(StaticLeadership::new(true)),
            CoordinatorConfig {
                page_size,
                ..CoordinatorConfig::default()
            },
        )
    }

    fn simple(seeded: &Seeded, dispatcher: Arc<RecordingDispatcher>) -> JobCoordinator {
        coordinator(seeded, seeded.jobs.clone(), seeded.orgs.clone(), dispatcher, 100)
    }

    fn daily(start: DateTime<Utc>) -> cadence_schedule::Schedule {
        fixtures::periodic(start, PeriodUnit::Day, TimeDelta::hours(2))
    }

    #[tokio::test]
    async fn test_due_job_dispatched_once_per_instant() {
        let seeded = Seeded::new("report", instant(2024, 1, 2, 2, 0));
        let job = seeded.add_job("daily", daily(instant(2024, 1, 1, 0, 10))).await;
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let coordinator = simple(&seeded, dispatcher.clone());

        let report = coordinator.tick().await.unwrap();
        assert_eq!(report.dispatched, 1);
        assert_eq!(report.jobs_scanned, 1);

        let requests = dispatcher.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].job_id, job.id);
        assert_eq!(requests[0].scheduled, instant(2024, 1, 2, 2, 0));

        // Still queued on the executor side.
        let report = coordinator.tick().await.unwrap();
        assert_eq!(report.dispatched, 0);
        assert_eq!(report.already_queued, 1);
    }

    #[tokio::test]
    async fn test_future_instant_not_dispatched() {
        let seeded = Seeded::new("report", instant(2024, 1, 2, 1, 59));
        seeded.add_job("daily", daily(instant(2024, 1, 1, 0, 10))).await;
        let dispatcher = Arc::new(RecordingDispatcher::new());

        let report = simple(&seeded, dispatcher.clone()).tick().await.unwrap();

        assert_eq!(report.not_due, 1);
        assert!(dispatcher.requests().is_empty());
    }

    #[tokio::test]
    async fn test_live_claim_blocks_redispatch_until_expiry() {
        let t = instant(2024, 1, 2, 2, 0);
        let seeded = Seeded::new("report", t);
        let job = seeded.add_job("daily", daily(instant(2024, 1, 1, 0, 10))).await;
        let claim = Claim::new(NodeId::new(), t, Duration::from_secs(600));
        let started = seeded.jobs.job_started(job.id, job.org_id, t, claim).await.unwrap();
        assert_eq!(started, StartOutcome::Claimed);

        let dispatcher = Arc::new(RecordingDispatcher::new());
        let coordinator = simple(&seeded, dispatcher.clone());

        let report = coordinator.tick().await.unwrap();
        assert_eq!(report.in_flight, 1);
        assert_eq!(report.dispatched, 0);

        seeded.clock.advance(TimeDelta::minutes(11));
        let report = coordinator.tick().await.unwrap();
        assert_eq!(report.dispatched, 1);
        assert_eq!(dispatcher.requests()[0].scheduled, t);
    }

    #[tokio::test]
    async fn test_failed_instant_not_retried_before_next_run() {
        let t = instant(2024, 1, 2, 2, 0);
        let seeded = Seeded::new("report", t);
        let job = seeded.add_job("daily", daily(instant(2024, 1, 1, 0, 10))).await;
        let claim = Claim::new(NodeId::new(), t, Duration::from_secs(600));
        seeded.jobs.job_started(job.id, job.org_id, t, claim.clone()).await.unwrap();
        seeded.jobs.job_failed(job.id, job.org_id, t, &claim, "boom".into()).await.unwrap();

        let dispatcher = Arc::new(RecordingDispatcher::new());
        let coordinator = simple(&seeded, dispatcher.clone());

        seeded.clock.advance(TimeDelta::hours(1));
        let report = coordinator.tick().await.unwrap();
        assert_eq!(report.not_due, 1);
        assert!(dispatcher.requests().is_empty());

        seeded.clock.set(instant(2024, 1, 3, 2, 0));
        coordinator.tick().await.unwrap();
        assert_eq!(dispatcher.requests()[0].scheduled, instant(2024, 1, 3, 2, 0));
    }

    #[tokio::test]
    async fn test_exhausted_one_off_is_skipped() {
        let t = instant(2024, 1, 1, 12, 0);
        let seeded = Seeded::new("report", t);
        let job = seeded.add_job("once", fixtures::one_off(t)).await;
        let claim = Claim::new(NodeId::new(), t, Duration::from_secs(60));
        seeded.jobs.job_started(job.id, job.org_id, t, claim.clone()).await.unwrap();
        seeded.jobs.job_succeeded(job.id, job.org_id, t, &claim, json!(1)).await.unwrap();

        let dispatcher = Arc::new(RecordingDispatcher::new());
        let report = simple(&seeded, dispatcher.clone()).tick().await.unwrap();

        assert_eq!(report.exhausted, 1);
        assert!(dispatcher.requests().is_empty());
    }

    #[tokio::test]
    async fn test_pages_through_all_jobs() {
        let t = instant(2024, 1, 2, 2, 0);
        let seeded = Seeded::new("report", t);
        for i in 0..5 {
            seeded.add_job(&format!("job-{i}"), daily(instant(2024, 1, 1, 0, 10))).await;
        }
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let coordinator = coordinator(
            &seeded,
            seeded.jobs.clone(),
            seeded.orgs.clone(),
            dispatcher.clone(),
            2,
        );

        let report = coordinator.tick().await.unwrap();

        assert_eq!(report.jobs_scanned, 5);
        assert_eq!(report.dispatched, 5);
    }

    #[tokio::test]
    async fn test_failing_organization_does_not_block_others() {
        let t = instant(2024, 1, 2, 2, 0);
        let seeded = Seeded::new("report", t);
        let broken = seeded.add_org("broken");
        seeded.add_job("healthy", daily(instant(2024, 1, 1, 0, 10))).await;
        seeded
            .add_job_to(broken.id, "unreachable", daily(instant(2024, 1, 1, 0, 10)), None)
            .await;

        let flaky = Arc::new(FlakyJobRepository::new(seeded.jobs.clone()));
        flaky.fail_listing_for(broken.id);
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let coordinator =
            coordinator(&seeded, flaky, seeded.orgs.clone(), dispatcher.clone(), 100);

        let report = coordinator.tick().await.unwrap();

        assert_eq!(report.organizations, 2);
        assert_eq!(report.organizations_failed, 1);
        assert_eq!(report.dispatched, 1);
        assert_eq!(dispatcher.requests()[0].org_id, seeded.org.id);
    }

    #[tokio::test]
    async fn test_failing_job_does_not_block_others() {
        let t = instant(2024, 1, 2, 2, 0);
        let seeded = Seeded::new("report", t);
        seeded.add_job("a", daily(instant(2024, 1, 1, 0, 10))).await;
        seeded.add_job("b", daily(instant(2024, 1, 1, 0, 10))).await;

        let flaky = Arc::new(FlakyJobRepository::new(seeded.jobs.clone()));
        flaky.fail_next(Operation::GetLastRun, 1);
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let coordinator =
            coordinator(&seeded, flaky, seeded.orgs.clone(), dispatcher.clone(), 100);

        let report = coordinator.tick().await.unwrap();

        assert_eq!(report.errors, 1);
        assert_eq!(report.dispatched, 1);
    }

    #[tokio::test]
    async fn test_organization_listing_failure_aborts_tick_only() {
        let t = instant(2024, 1, 2, 2, 0);
        let seeded = Seeded::new("report", t);
        seeded.add_job("a", daily(instant(2024, 1, 1, 0, 10))).await;

        let orgs = Arc::new(FlakyOrganizationRepository::new(seeded.orgs.clone()));
        orgs.fail_next(1);
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let coordinator = coordinator(&seeded, seeded.jobs.clone(), orgs, dispatcher.clone(), 100);

        let err = coordinator.tick().await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Organizations(_)));
        assert_eq!(coordinator.phase(), TickPhase::Idle);

        let report = coordinator.tick().await.unwrap();
        assert_eq!(report.dispatched, 1);
        assert_eq!(coordinator.stats().ticks_failed, 1);
        assert_eq!(coordinator.stats().ticks, 1);
    }

    #[tokio::test]
    async fn test_dispatch_errors_are_counted() {
        let t = instant(2024, 1, 2, 2, 0);
        let seeded = Seeded::new("report", t);
        let job = seeded.add_job("a", daily(instant(2024, 1, 1, 0, 10))).await;
        let dispatcher = Arc::new(RecordingDispatcher::new());
        dispatcher.fail_with(Some(cadence_jobs::DispatchError::MailboxFull(job.id)));

        let report = simple(&seeded, dispatcher.clone()).tick().await.unwrap();

        assert_eq!(report.errors, 1);
        assert_eq!(report.dispatched, 0);
    }

    /// Organization repository that blocks until a permit is released.
    struct GatedOrganizations {
        inner: Arc<dyn OrganizationRepository>,
        gate: Semaphore,
    }

    #[async_trait]
    impl OrganizationRepository for GatedOrganizations {
        async fn list_organizations(&self) -> Result<Vec<Organization>, RepositoryError> {
            let _permit = self.gate.acquire().await.unwrap();
            self.inner.list_organizations().await
        }
    }

    #[tokio::test]
    async fn test_overlapping_tick_is_dropped() {
        let t = instant(2024, 1, 2, 2, 0);
        let seeded = Seeded::new("report", t);
        seeded.add_job("a", daily(instant(2024, 1, 1, 0, 10))).await;
        let gated = Arc::new(GatedOrganizations {
            inner: seeded.orgs.clone(),
            gate: Semaphore::new(0),
        });
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let coordinator = Arc::new(coordinator(
            &seeded,
            seeded.jobs.clone(),
            gated.clone(),
            dispatcher.clone(),
            100,
        ));

        let first = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.tick().await }
        });
        let observed = coordinator.clone();
        assert!(
            cadence_testing::wait_until(Duration::from_secs(1), move || {
                observed.phase() == TickPhase::Scanning
            })
            .await
        );

        let second = coordinator.tick().await;
        assert!(matches!(second, Err(CoordinatorError::TickInProgress)));

        gated.gate.add_permits(1);
        let report = first.await.unwrap().unwrap();
        assert_eq!(report.dispatched, 1);
        assert_eq!(coordinator.stats().ticks_dropped, 1);
        assert_eq!(dispatcher.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_restart_makes_same_decisions() {
        let t = instant(2024, 1, 2, 2, 0);
        let seeded = Seeded::new("report", t);
        let job = seeded.add_job("daily", daily(instant(2024, 1, 1, 0, 10))).await;

        let first = Arc::new(RecordingDispatcher::new());
        simple(&seeded, first.clone()).tick().await.unwrap();

        let second = Arc::new(RecordingDispatcher::new());
        simple(&seeded, second.clone()).tick().await.unwrap();

        assert_eq!(first.requests(), second.requests());

        // Once the instant completes, a fresh coordinator moves on.
        let claim = Claim::new(NodeId::new(), t, Duration::from_secs(60));
        seeded.jobs.job_started(job.id, job.org_id, t, claim.clone()).await.unwrap();
        seeded.jobs.job_succeeded(job.id, job.org_id, t, &claim, json!(null)).await.unwrap();
        let third = Arc::new(RecordingDispatcher::new());
        let report = simple(&seeded, third.clone()).tick().await.unwrap();
        assert_eq!(report.not_due, 1);
        assert_eq!(
            seeded.jobs.executions_of(job.id)[0].state,
            ExecutionState::Succeeded
        );
    }
}
