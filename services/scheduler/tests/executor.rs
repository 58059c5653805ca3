mod harness;

use std::sync::Arc;
use std::time::Duration;

use cadence_id::JobId;
use cadence_jobs::{ExecutionState, JobRepository};
use cadence_schedule::{PeriodUnit, Schedule};
use cadence_scheduler::ExecutorConfig;
use cadence_testing::{
    fixtures, init_tracing, instant, wait_until, FlakyJobRepository, Operation, ScriptedJobBody,
    Seeded, Step,
};
use chrono::{DateTime, TimeDelta, Utc};
use harness::{
    execution, executor_config, fast_retry, region, region_with, request, wait_for_state, WAIT,
};
use serde_json::json;

fn hourly(start: DateTime<Utc>) -> Schedule {
    fixtures::periodic(start, PeriodUnit::Hour, TimeDelta::zero())
}

#[tokio::test]
async fn same_job_instants_never_overlap() {
    init_tracing();
    let t0 = instant(2024, 1, 1, 0, 0);
    let seeded = Seeded::new("report", t0);
    let job = seeded.add_job("hourly", hourly(t0)).await;
    let body = Arc::new(ScriptedJobBody::new(Step::Sleep(Duration::from_millis(20))));
    let region = region(&seeded, body.clone());

    let instants: Vec<_> = (0..5).map(|h| t0 + TimeDelta::hours(h)).collect();
    for at in &instants {
        region.deliver(request(&seeded, job.id, *at)).await.unwrap();
    }

    for at in &instants {
        assert!(
            wait_for_state(seeded.jobs.as_ref(), job.id, seeded.org.id, *at, ExecutionState::Succeeded).await,
            "instant {at} never succeeded"
        );
    }
    assert_eq!(body.tracker().peak_for(job.id), 1);
    let order: Vec<_> = body.calls().into_iter().map(|(_, at)| at).collect();
    assert_eq!(order, instants);
}

#[tokio::test]
async fn different_jobs_run_in_parallel() {
    let t0 = instant(2024, 1, 1, 0, 0);
    let seeded = Seeded::new("report", t0);
    let first = seeded.add_job("first", hourly(t0)).await;
    let second = seeded.add_job("second", hourly(t0)).await;
    let body = Arc::new(ScriptedJobBody::new(Step::Sleep(Duration::from_millis(200))));
    let region = region(&seeded, body.clone());

    region.deliver(request(&seeded, first.id, t0)).await.unwrap();
    region.deliver(request(&seeded, second.id, t0)).await.unwrap();

    let tracker = body.tracker();
    assert!(wait_until(WAIT, || tracker.peak() >= 2).await);
    assert_eq!(region.active_actors().await, 2);
}

#[tokio::test]
async fn successful_body_records_result() {
    let t0 = instant(2024, 1, 1, 0, 0);
    let seeded = Seeded::new("report", t0);
    let job = seeded.add_job("hourly", hourly(t0)).await;
    let body = Arc::new(ScriptedJobBody::new(Step::Succeed(json!({ "rows": 42 }))));
    let region = region(&seeded, body);

    region.deliver(request(&seeded, job.id, t0)).await.unwrap();

    assert!(wait_for_state(seeded.jobs.as_ref(), job.id, seeded.org.id, t0, ExecutionState::Succeeded).await);
    let recorded = execution(seeded.jobs.as_ref(), job.id, seeded.org.id, t0).await.unwrap();
    assert_eq!(recorded.result, Some(json!({ "rows": 42 })));
    assert_eq!(recorded.claim.map(|c| c.node_id), Some(region.node_id()));
    assert!(wait_until(WAIT, || region.queued_len() == 0).await);
}

#[tokio::test]
async fn failing_body_records_error_chain() {
    let t0 = instant(2024, 1, 1, 0, 0);
    let seeded = Seeded::new("report", t0);
    let job = seeded.add_job("hourly", hourly(t0)).await;
    let body = Arc::new(ScriptedJobBody::new(Step::Fail("upstream refused".into())));
    let region = region(&seeded, body.clone());

    region.deliver(request(&seeded, job.id, t0)).await.unwrap();

    assert!(wait_for_state(seeded.jobs.as_ref(), job.id, seeded.org.id, t0, ExecutionState::Failed).await);
    let recorded = execution(seeded.jobs.as_ref(), job.id, seeded.org.id, t0).await.unwrap();
    assert!(recorded.error.unwrap().contains("upstream refused"));
    // Failure is recorded once; the executor never reruns the body itself.
    assert_eq!(body.call_count(), 1);
}

#[tokio::test]
async fn deadline_exceeded_records_failure() {
    let t0 = instant(2024, 1, 1, 0, 0);
    let seeded = Seeded::new("report", t0);
    let job = seeded
        .add_job_to(seeded.org.id, "slow", hourly(t0), Some(Duration::from_millis(50)))
        .await;
    let body = Arc::new(ScriptedJobBody::new(Step::WaitForCancel));
    let region = region(&seeded, body.clone());

    region.deliver(request(&seeded, job.id, t0)).await.unwrap();

    assert!(wait_for_state(seeded.jobs.as_ref(), job.id, seeded.org.id, t0, ExecutionState::Failed).await);
    let recorded = execution(seeded.jobs.as_ref(), job.id, seeded.org.id, t0).await.unwrap();
    assert!(recorded.error.unwrap().contains("deadline"));
    assert_eq!(body.cancellations(), 1);
}

#[tokio::test]
async fn body_ignoring_cancellation_is_aborted_after_grace() {
    let t0 = instant(2024, 1, 1, 0, 0);
    let seeded = Seeded::new("report", t0);
    let job = seeded
        .add_job_to(seeded.org.id, "stuck", hourly(t0), Some(Duration::from_millis(50)))
        .await;
    let body = Arc::new(ScriptedJobBody::succeeding().with_script([Step::Hang]));
    let config = ExecutorConfig {
        cancel_grace: Duration::from_millis(100),
        ..executor_config()
    };
    let region = region_with(&seeded, seeded.jobs.clone(), body.clone(), config);

    region.deliver(request(&seeded, job.id, t0)).await.unwrap();
    region.deliver(request(&seeded, job.id, t0 + TimeDelta::hours(1))).await.unwrap();

    assert!(wait_for_state(seeded.jobs.as_ref(), job.id, seeded.org.id, t0, ExecutionState::Failed).await);
    let next = t0 + TimeDelta::hours(1);
    assert!(wait_for_state(seeded.jobs.as_ref(), job.id, seeded.org.id, next, ExecutionState::Succeeded).await);
    assert_eq!(body.tracker().active(), 0);
}

#[tokio::test]
async fn job_timeout_is_capped_below_execution_lease() {
    let t0 = instant(2024, 1, 1, 0, 0);
    let seeded = Seeded::new("report", t0);
    let job = seeded
        .add_job_to(seeded.org.id, "long", hourly(t0), Some(Duration::from_secs(3600)))
        .await;
    let body = Arc::new(ScriptedJobBody::new(Step::WaitForCancel));
    let config = ExecutorConfig {
        execution_lease: Duration::from_millis(600),
        cancel_grace: Duration::from_millis(200),
        ..executor_config()
    };
    let region = region_with(&seeded, seeded.jobs.clone(), body.clone(), config);

    region.deliver(request(&seeded, job.id, t0)).await.unwrap();

    assert!(wait_for_state(seeded.jobs.as_ref(), job.id, seeded.org.id, t0, ExecutionState::Failed).await);
    let recorded = execution(seeded.jobs.as_ref(), job.id, seeded.org.id, t0).await.unwrap();
    assert!(recorded.error.unwrap().contains("deadline of 400ms"));
    assert_eq!(body.cancellations(), 1);
}

#[tokio::test]
async fn panicking_body_records_failure() {
    let t0 = instant(2024, 1, 1, 0, 0);
    let seeded = Seeded::new("report", t0);
    let job = seeded.add_job("hourly", hourly(t0)).await;
    let body = Arc::new(
        ScriptedJobBody::succeeding().with_script([Step::Panic("index out of range".into())]),
    );
    let region = region(&seeded, body);

    region.deliver(request(&seeded, job.id, t0)).await.unwrap();
    region.deliver(request(&seeded, job.id, t0 + TimeDelta::hours(1))).await.unwrap();

    assert!(wait_for_state(seeded.jobs.as_ref(), job.id, seeded.org.id, t0, ExecutionState::Failed).await);
    let recorded = execution(seeded.jobs.as_ref(), job.id, seeded.org.id, t0).await.unwrap();
    assert!(recorded.error.unwrap().contains("index out of range"));

    // The actor survives the panic and keeps serving the job.
    let next = t0 + TimeDelta::hours(1);
    assert!(wait_for_state(seeded.jobs.as_ref(), job.id, seeded.org.id, next, ExecutionState::Succeeded).await);
}

#[tokio::test]
async fn missing_job_is_dropped() {
    let t0 = instant(2024, 1, 1, 0, 0);
    let seeded = Seeded::new("report", t0);
    let body = Arc::new(ScriptedJobBody::succeeding());
    let region = region(&seeded, body.clone());
    let unknown = JobId::new();

    region.deliver(request(&seeded, unknown, t0)).await.unwrap();

    assert!(wait_until(WAIT, || region.queued_len() == 0).await);
    assert_eq!(body.call_count(), 0);
    assert!(seeded.jobs.executions_of(unknown).is_empty());
}

#[tokio::test]
async fn completed_instant_is_not_rerun() {
    let t0 = instant(2024, 1, 1, 0, 0);
    let seeded = Seeded::new("report", t0);
    let job = seeded.add_job("hourly", hourly(t0)).await;
    let body = Arc::new(ScriptedJobBody::succeeding());
    let region = region(&seeded, body.clone());

    region.deliver(request(&seeded, job.id, t0)).await.unwrap();
    assert!(wait_for_state(seeded.jobs.as_ref(), job.id, seeded.org.id, t0, ExecutionState::Succeeded).await);
    assert!(wait_until(WAIT, || region.queued_len() == 0).await);

    region.deliver(request(&seeded, job.id, t0)).await.unwrap();
    assert!(wait_until(WAIT, || region.queued_len() == 0).await);

    assert_eq!(body.call_count(), 1);
    assert_eq!(seeded.jobs.transitions().len(), 2);
}

#[tokio::test]
async fn transient_repository_errors_are_retried() {
    let t0 = instant(2024, 1, 1, 0, 0);
    let seeded = Seeded::new("report", t0);
    let job = seeded.add_job("hourly", hourly(t0)).await;
    let flaky = Arc::new(FlakyJobRepository::new(seeded.jobs.clone()));
    flaky.fail_next(Operation::JobStarted, 2);
    flaky.fail_next(Operation::JobSucceeded, 1);
    let body = Arc::new(ScriptedJobBody::succeeding());
    let region = region_with(&seeded, flaky.clone(), body.clone(), executor_config());

    region.deliver(request(&seeded, job.id, t0)).await.unwrap();

    assert!(wait_for_state(seeded.jobs.as_ref(), job.id, seeded.org.id, t0, ExecutionState::Succeeded).await);
    assert_eq!(flaky.calls(Operation::JobStarted), 3);
    assert_eq!(flaky.calls(Operation::JobSucceeded), 2);
    assert_eq!(body.call_count(), 1);
}

#[tokio::test]
async fn lost_claim_reply_is_recovered_through_retried_lookup() {
    let t0 = instant(2024, 1, 1, 0, 0);
    let seeded = Seeded::new("report", t0);
    let job = seeded.add_job("hourly", hourly(t0)).await;
    let flaky = Arc::new(FlakyJobRepository::new(seeded.jobs.clone()));
    flaky.lose_next_replies(Operation::JobStarted, 1);
    flaky.fail_next(Operation::GetExecution, 2);
    let body = Arc::new(ScriptedJobBody::succeeding());
    let region = region_with(&seeded, flaky.clone(), body.clone(), executor_config());

    region.deliver(request(&seeded, job.id, t0)).await.unwrap();

    assert!(wait_for_state(seeded.jobs.as_ref(), job.id, seeded.org.id, t0, ExecutionState::Succeeded).await);
    assert_eq!(flaky.calls(Operation::JobStarted), 2);
    assert_eq!(flaky.calls(Operation::GetExecution), 3);
    assert_eq!(body.call_count(), 1);
    assert_eq!(seeded.jobs.transitions().len(), 2);
}

#[tokio::test]
async fn repository_outage_abandons_request() {
    let t0 = instant(2024, 1, 1, 0, 0);
    let seeded = Seeded::new("report", t0);
    let job = seeded.add_job("hourly", hourly(t0)).await;
    let flaky = Arc::new(FlakyJobRepository::new(seeded.jobs.clone()));
    flaky.fail_always(Operation::JobStarted);
    let body = Arc::new(ScriptedJobBody::succeeding());
    let config = ExecutorConfig {
        retry: fast_retry(4),
        ..executor_config()
    };
    let region = region_with(&seeded, flaky.clone(), body.clone(), config);

    region.deliver(request(&seeded, job.id, t0)).await.unwrap();

    assert!(wait_until(WAIT, || region.queued_len() == 0).await);
    assert_eq!(flaky.calls(Operation::JobStarted), 4);
    assert_eq!(body.call_count(), 0);
    assert!(execution(seeded.jobs.as_ref(), job.id, seeded.org.id, t0).await.is_none());

    // Once the repository recovers, the same instant can be delivered again.
    flaky.heal(Operation::JobStarted);
    region.deliver(request(&seeded, job.id, t0)).await.unwrap();
    assert!(wait_for_state(seeded.jobs.as_ref(), job.id, seeded.org.id, t0, ExecutionState::Succeeded).await);
}

#[tokio::test]
async fn shutdown_leaves_running_execution_started() {
    let t0 = instant(2024, 1, 1, 0, 0);
    let seeded = Seeded::new("report", t0);
    let job = seeded.add_job("hourly", hourly(t0)).await;
    let body = Arc::new(ScriptedJobBody::new(Step::WaitForCancel));
    let region = region(&seeded, body.clone());

    region.deliver(request(&seeded, job.id, t0)).await.unwrap();
    assert!(wait_until(WAIT, || body.call_count() == 1).await);

    region.shutdown(Duration::from_secs(1)).await;

    assert_eq!(body.cancellations(), 1);
    let recorded = execution(seeded.jobs.as_ref(), job.id, seeded.org.id, t0).await.unwrap();
    assert_eq!(recorded.state, ExecutionState::Started);
    assert_eq!(recorded.claim.map(|c| c.node_id), Some(region.node_id()));
    assert_eq!(region.queued_len(), 0);
    assert!(seeded.jobs.get_last_run(job.id, seeded.org.id).await.unwrap().is_none());
}
