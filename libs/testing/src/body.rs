use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cadence_id::JobId;
use cadence_jobs::{JobBody, JobContext, JobOutput};
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::debug;

/// One scripted outcome.
#[derive(Debug, Clone)]
pub enum Step {
    Succeed(JobOutput),
    Fail(String),
    /// Sleep, then succeed. Ignores cancellation.
    Sleep(Duration),
    Panic(String),
    /// Park until the context is cancelled, then fail.
    WaitForCancel,
    /// Never finish, even when cancelled.
    Hang,
}

/// Tracks how many bodies run at once, overall and per job.
#[derive(Debug, Default)]
pub struct ConcurrencyTracker {
    active: AtomicUsize,
    peak: AtomicUsize,
    per_job: Mutex<HashMap<JobId, (usize, usize)>>,
}

impl ConcurrencyTracker {
    fn enter(self: &Arc<Self>, job_id: JobId) -> TrackerGuard {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Ok(mut per_job) = self.per_job.lock() {
            let entry = per_job.entry(job_id).or_default();
            entry.0 += 1;
            entry.1 = entry.1.max(entry.0);
        }
        TrackerGuard {
            tracker: self.clone(),
            job_id,
        }
    }

    /// Highest number of bodies that ever ran at the same time.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Highest number of bodies of `job_id` that ever ran at the same time.
    pub fn peak_for(&self, job_id: JobId) -> usize {
        self.per_job
            .lock()
            .ok()
            .and_then(|m| m.get(&job_id).map(|(_, peak)| *peak))
            .unwrap_or(0)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

struct TrackerGuard {
    tracker: Arc<ConcurrencyTracker>,
    job_id: JobId,
}

impl Drop for TrackerGuard {
    fn drop(&mut self) {
        self.tracker.active.fetch_sub(1, Ordering::SeqCst);
        if let Ok(mut per_job) = self.tracker.per_job.lock() {
            if let Some(entry) = per_job.get_mut(&self.job_id) {
                entry.0 = entry.0.saturating_sub(1);
            }
        }
    }
}

/// Job body that plays back a script. Once the script runs out every call
/// uses the fallback step.
pub struct ScriptedJobBody {
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    calls: Mutex<Vec<(JobId, DateTime<Utc>)>>,
    tracker: Arc<ConcurrencyTracker>,
    cancellations: AtomicUsize,
}

impl ScriptedJobBody {
    pub fn new(fallback: Step) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            calls: Mutex::new(Vec::new()),
            tracker: Arc::new(ConcurrencyTracker::default()),
            cancellations: AtomicUsize::new(0),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(Step::Succeed(json!({ "ok": true })))
    }

    /// Play `steps` in order before falling back.
    pub fn with_script(self, steps: impl IntoIterator<Item = Step>) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.extend(steps);
        }
        self
    }

    /// `(job_id, scheduled)` of every invocation, in call order.
    pub fn calls(&self) -> Vec<(JobId, DateTime<Utc>)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn tracker(&self) -> Arc<ConcurrencyTracker> {
        self.tracker.clone()
    }

    /// How many `WaitForCancel` steps saw their context cancelled.
    pub fn cancellations(&self) -> usize {
        self.cancellations.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> Step {
        self.script
            .lock()
            .ok()
            .and_then(|mut s| s.pop_front())
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl JobBody for ScriptedJobBody {
    async fn execute(&self, ctx: JobContext) -> anyhow::Result<JobOutput> {
        let job_id = ctx.job().id;
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((job_id, ctx.scheduled()));
        }
        let _guard = self.tracker.enter(job_id);
        let step = self.next_step();
        debug!(job_id = %job_id, scheduled = %ctx.scheduled(), ?step, "scripted body running");

        match step {
            Step::Succeed(output) => Ok(output),
            Step::Fail(message) => Err(anyhow::anyhow!(message)),
            Step::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                Ok(json!({ "slept_ms": duration.as_millis() as u64 }))
            }
            Step::Panic(message) => panic!("{message}"),
            Step::WaitForCancel => {
                ctx.cancelled().await;
                self.cancellations.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("cancelled")
            }
            Step::Hang => std::future::pending().await,
        }
    }
}
