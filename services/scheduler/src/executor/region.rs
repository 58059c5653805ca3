//! Node-local executor region.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cadence_id::{JobId, NodeId};
use cadence_jobs::{Clock, Delivery, DispatchError, ExecuteRequest, ExecutionKey};
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::actor::JobExecutorActor;
use super::registry::JobTypeRegistry;
use super::ExecutorConfig;
use crate::actors::{ActorError, Supervisor};
use crate::routing::RegionClient;

/// `(job, scheduled)` pairs queued in a mailbox or running on this node.
#[derive(Default)]
pub(crate) struct QueuedSet {
    inner: Mutex<HashMap<JobId, HashSet<DateTime<Utc>>>>,
}

impl QueuedSet {
    /// Returns false if the pair was already queued.
    pub(crate) fn insert(&self, key: &ExecutionKey) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entry(key.job_id).or_default().insert(key.scheduled)
    }

    pub(crate) fn remove(&self, key: &ExecutionKey) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(instants) = inner.get_mut(&key.job_id) {
            instants.remove(&key.scheduled);
            if instants.is_empty() {
                inner.remove(&key.job_id);
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(HashSet::len)
            .sum()
    }
}

/// Hosts the executor actors for the job ids this node owns.
pub struct ExecutorRegion {
    node_id: NodeId,
    registry: Arc<JobTypeRegistry>,
    clock: Arc<dyn Clock>,
    config: ExecutorConfig,
    queued: Arc<QueuedSet>,
    supervisor: tokio::sync::Mutex<Supervisor<JobId, ExecuteRequest>>,
    stopping: AtomicBool,
}

impl ExecutorRegion {
    /// Actors run under children of `cancel`.
    pub fn new(
        node_id: NodeId,
        registry: Arc<JobTypeRegistry>,
        clock: Arc<dyn Clock>,
        config: ExecutorConfig,
        cancel: CancellationToken,
    ) -> Self {
        let supervisor = Supervisor::new(
            format!("region-{node_id}"),
            config.mailbox_size,
            config.idle_timeout,
            cancel,
        );
        Self {
            node_id,
            registry,
            clock,
            config,
            queued: Arc::new(QueuedSet::default()),
            supervisor: tokio::sync::Mutex::new(supervisor),
            stopping: AtomicBool::new(false),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Queue `request` on the actor for its job id, spawning it if needed.
    #[instrument(skip(self, request), fields(job_id = %request.job_id, scheduled = %request.scheduled))]
    pub async fn deliver(&self, request: ExecuteRequest) -> Result<Delivery, DispatchError> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(DispatchError::ShuttingDown);
        }
        if !self.registry.contains(&request.kind) {
            return Err(DispatchError::UnknownJobKind(request.kind));
        }

        let key = request.key();
        if !self.queued.insert(&key) {
            debug!("Request already queued on this node");
            return Ok(Delivery::AlreadyQueued);
        }

        let mut supervisor = self.supervisor.lock().await;
        // Re-check under the lock; shutdown drains the supervisor while holding it.
        if self.stopping.load(Ordering::SeqCst) {
            self.queued.remove(&key);
            return Err(DispatchError::ShuttingDown);
        }

        let mut attempt = 0;
        let result = loop {
            let handle = supervisor.get_or_spawn(&request.job_id, || self.actor_for(request.job_id));
            match handle.try_send(request.clone()) {
                Ok(()) => break Ok(Delivery::Enqueued),
                Err(ActorError::MailboxFull) => break Err(DispatchError::MailboxFull(request.job_id)),
                // Passivated between lookup and send; the next lookup spawns
                // a successor behind it.
                Err(ActorError::ActorStopped) if attempt == 0 => attempt += 1,
                Err(_) => break Err(DispatchError::RegionStopped(self.node_id)),
            }
        };

        if result.is_err() {
            self.queued.remove(&key);
        }
        result
    }

    fn actor_for(&self, job_id: JobId) -> JobExecutorActor {
        JobExecutorActor::new(
            job_id,
            self.node_id,
            self.registry.clone(),
            self.clock.clone(),
            self.config.clone(),
            self.queued.clone(),
        )
    }

    /// Stop the actors of job ids this node no longer owns. Their in-flight
    /// executions are cancelled and left STARTED; queued requests are
    /// discarded by the stopping actors.
    pub async fn retain_owned<F>(&self, owned: F) -> Vec<JobId>
    where
        F: Fn(JobId) -> bool,
    {
        let mut supervisor = self.supervisor.lock().await;
        supervisor.prune();
        let moved = supervisor.retain(|job_id| owned(*job_id));
        if !moved.is_empty() {
            info!(node_id = %self.node_id, moved = moved.len(), "Stopped executors for moved jobs");
        }
        moved
    }

    /// Refuse new requests, cancel running ones and wait up to `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut supervisor = self.supervisor.lock().await;
        let queued = self.queued.len();
        if queued > 0 {
            warn!(node_id = %self.node_id, queued, "Shutting down with queued executions");
        }
        supervisor.shutdown(grace).await;
        info!(node_id = %self.node_id, "Executor region stopped");
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Number of live executor actors.
    pub async fn active_actors(&self) -> usize {
        self.supervisor.lock().await.running_count()
    }

    /// Number of requests queued or running.
    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }
}

#[async_trait]
impl RegionClient for ExecutorRegion {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    async fn deliver(&self, request: ExecuteRequest) -> Result<Delivery, DispatchError> {
        ExecutorRegion::deliver(self, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_jobs::{ExecutionState, JobKind, JobRepository};
    use cadence_testing::{fixtures, instant, ScriptedJobBody, Seeded, Step};
    use chrono::TimeDelta;
    use std::time::Duration;

    fn region(seeded: &Seeded, body: Arc<ScriptedJobBody>) -> ExecutorRegion {
        let registry = JobTypeRegistry::new().register(seeded.jobs.clone(), body);
        ExecutorRegion::new(
            NodeId::new(),
            Arc::new(registry),
            seeded.clock.clone(),
            ExecutorConfig::default(),
            CancellationToken::new(),
        )
    }

    fn request(seeded: &Seeded, job_id: JobId, scheduled: DateTime<Utc>) -> ExecuteRequest {
        ExecuteRequest {
            kind: seeded.kind.clone(),
            job_id,
            org_id: seeded.org.id,
            scheduled,
        }
    }

    #[test]
    fn test_queued_set_tracks_pairs() {
        let set = QueuedSet::default();
        let key = ExecutionKey {
            job_id: JobId::new(),
            org_id: cadence_id::OrgId::new(),
            scheduled: instant(2024, 1, 1, 0, 0),
        };

        assert!(set.insert(&key));
        assert!(!set.insert(&key));
        assert_eq!(set.len(), 1);

        set.remove(&key);
        assert_eq!(set.len(), 0);
        assert!(set.insert(&key));
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_already_queued() {
        let t0 = instant(2024, 1, 1, 0, 0);
        let seeded = Seeded::new("report", t0);
        let job = seeded.add_job("slow", fixtures::one_off(t0)).await;
        let body = Arc::new(ScriptedJobBody::new(Step::Sleep(Duration::from_millis(100))));
        let region = region(&seeded, body);

        let first = region.deliver(request(&seeded, job.id, t0)).await.unwrap();
        let second = region.deliver(request(&seeded, job.id, t0)).await.unwrap();

        assert_eq!(first, Delivery::Enqueued);
        assert_eq!(second, Delivery::AlreadyQueued);
        assert_eq!(region.queued_len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_kind_is_rejected() {
        let t0 = instant(2024, 1, 1, 0, 0);
        let seeded = Seeded::new("report", t0);
        let region = region(&seeded, Arc::new(ScriptedJobBody::succeeding()));

        let mut req = request(&seeded, JobId::new(), t0);
        req.kind = JobKind::new("billing");

        let err = region.deliver(req).await.unwrap_err();
        assert_eq!(err, DispatchError::UnknownJobKind(JobKind::new("billing")));
        assert_eq!(region.queued_len(), 0);
    }

    #[tokio::test]
    async fn test_full_mailbox_releases_queued_pair() {
        let t0 = instant(2024, 1, 1, 0, 0);
        let seeded = Seeded::new("report", t0);
        let job = seeded.add_job("slow", fixtures::one_off(t0)).await;
        let body = Arc::new(ScriptedJobBody::new(Step::Sleep(Duration::from_millis(200))));
        let registry = JobTypeRegistry::new().register(seeded.jobs.clone(), body);
        let config = ExecutorConfig {
            mailbox_size: 1,
            ..ExecutorConfig::default()
        };
        let region = ExecutorRegion::new(
            NodeId::new(),
            Arc::new(registry),
            seeded.clock.clone(),
            config,
            CancellationToken::new(),
        );

        let at = |h| t0 + TimeDelta::hours(h);
        region.deliver(request(&seeded, job.id, at(0))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        region.deliver(request(&seeded, job.id, at(1))).await.unwrap();

        let err = region.deliver(request(&seeded, job.id, at(2))).await.unwrap_err();
        assert_eq!(err, DispatchError::MailboxFull(job.id));
        assert_eq!(region.queued_len(), 2);
    }

    #[tokio::test]
    async fn test_moved_job_releases_queued_requests() {
        let t0 = instant(2024, 1, 1, 0, 0);
        let seeded = Seeded::new("report", t0);
        let job = seeded.add_job("hourly", fixtures::one_off(t0)).await;
        let body = Arc::new(ScriptedJobBody::new(Step::WaitForCancel));
        let region = region(&seeded, body.clone());
        let next = t0 + TimeDelta::hours(1);

        region.deliver(request(&seeded, job.id, t0)).await.unwrap();
        region.deliver(request(&seeded, job.id, next)).await.unwrap();
        assert!(cadence_testing::wait_until(Duration::from_secs(2), || body.call_count() == 1).await);

        let moved = region.retain_owned(|_| false).await;

        assert_eq!(moved, vec![job.id]);
        assert!(cadence_testing::wait_until(Duration::from_secs(2), || region.queued_len() == 0).await);
        assert_eq!(body.cancellations(), 1);
        assert_eq!(body.call_count(), 1);
        let running = seeded.jobs.get_execution(job.id, seeded.org.id, t0).await.unwrap();
        assert_eq!(running.map(|e| e.state), Some(ExecutionState::Started));
        assert!(seeded.jobs.get_execution(job.id, seeded.org.id, next).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_requests() {
        let t0 = instant(2024, 1, 1, 0, 0);
        let seeded = Seeded::new("report", t0);
        let region = region(&seeded, Arc::new(ScriptedJobBody::succeeding()));

        region.shutdown(Duration::from_millis(100)).await;

        let err = region.deliver(request(&seeded, JobId::new(), t0)).await.unwrap_err();
        assert_eq!(err, DispatchError::ShuttingDown);
        assert!(region.is_stopping());
    }
}
