//! Scheduler node wiring.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use cadence_id::NodeId;
use cadence_jobs::{Clock, JobKind, OrganizationRepository, SystemClock};
use cadence_routing::DEFAULT_VIRTUAL_NODES;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::coordinator::{CoordinatorConfig, JobCoordinator};
use crate::executor::{ExecutorConfig, ExecutorRegion, JobTypeRegistry};
use crate::leader::{LeaderElection, LeaseLeadership, LeaseStore, StaticLeadership};
use crate::routing::{Membership, RegionClient, ShardRouter};

/// Name of the lease that elects the coordinator leader.
pub const COORDINATOR_LEASE: &str = "cadence-coordinator";

/// How a node decides whether it leads.
#[derive(Clone)]
pub enum Leadership {
    Static(bool),
    Lease {
        store: Arc<dyn LeaseStore>,
        ttl: Duration,
    },
}

/// Builder for [`SchedulerNode`].
pub struct SchedulerNodeBuilder {
    node_id: NodeId,
    registry: JobTypeRegistry,
    organizations: Arc<dyn OrganizationRepository>,
    clock: Arc<dyn Clock>,
    leadership: Leadership,
    membership: Membership,
    executor: ExecutorConfig,
    coordinator: CoordinatorConfig,
    virtual_nodes: u32,
}

impl SchedulerNodeBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn leadership(mut self, leadership: Leadership) -> Self {
        self.leadership = leadership;
        self
    }

    /// Join an existing cluster instead of forming a new one.
    pub fn membership(mut self, membership: Membership) -> Self {
        self.membership = membership;
        self
    }

    pub fn executor_config(mut self, config: ExecutorConfig) -> Self {
        self.executor = config;
        self
    }

    pub fn coordinator_config(mut self, config: CoordinatorConfig) -> Self {
        self.coordinator = config;
        self
    }

    pub fn virtual_nodes(mut self, virtual_nodes: u32) -> Self {
        self.virtual_nodes = virtual_nodes;
        self
    }

    pub fn build(self) -> SchedulerNode {
        let cancel = CancellationToken::new();
        let registry = Arc::new(self.registry);

        let region = Arc::new(ExecutorRegion::new(
            self.node_id,
            registry.clone(),
            self.clock.clone(),
            self.executor,
            cancel.child_token(),
        ));
        let router = Arc::new(ShardRouter::new(self.virtual_nodes));

        let (leader, lease): (Arc<dyn LeaderElection>, Option<Arc<LeaseLeadership>>) =
            match self.leadership {
                Leadership::Static(leads) => {
                    (Arc::new(StaticLeadership::new(leads)) as Arc<dyn LeaderElection>, None)
                }
                Leadership::Lease { store, ttl } => {
                    let lease = Arc::new(LeaseLeadership::new(
                        COORDINATOR_LEASE,
                        self.node_id,
                        ttl,
                        store,
                        self.clock.clone(),
                    ));
                    (lease.clone() as Arc<dyn LeaderElection>, Some(lease))
                }
            };

        let coordinators = registry
            .repositories()
            .map(|repository| {
                Arc::new(JobCoordinator::new(
                    repository.clone(),
                    self.organizations.clone(),
                    router.clone(),
                    self.clock.clone(),
                    leader.clone(),
                    self.coordinator.clone(),
                ))
            })
            .collect();

        SchedulerNode {
            node_id: self.node_id,
            region,
            router,
            membership: self.membership,
            coordinators,
            leader,
            lease,
            cancel,
            tasks: Mutex::new(Vec::new()),
        }
    }
}

/// One member of the scheduler cluster.
pub struct SchedulerNode {
    node_id: NodeId,
    region: Arc<ExecutorRegion>,
    router: Arc<ShardRouter>,
    membership: Membership,
    coordinators: Vec<Arc<JobCoordinator>>,
    leader: Arc<dyn LeaderElection>,
    lease: Option<Arc<LeaseLeadership>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SchedulerNode {
    pub fn builder(
        node_id: NodeId,
        registry: JobTypeRegistry,
        organizations: Arc<dyn OrganizationRepository>,
    ) -> SchedulerNodeBuilder {
        SchedulerNodeBuilder {
            node_id,
            registry,
            organizations,
            clock: Arc::new(SystemClock),
            leadership: Leadership::Static(true),
            membership: Membership::new(),
            executor: ExecutorConfig::default(),
            coordinator: CoordinatorConfig::default(),
            virtual_nodes: DEFAULT_VIRTUAL_NODES,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn region(&self) -> &Arc<ExecutorRegion> {
        &self.region
    }

    pub fn router(&self) -> &Arc<ShardRouter> {
        &self.router
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn coordinators(&self) -> &[Arc<JobCoordinator>] {
        &self.coordinators
    }

    pub fn coordinator(&self, kind: &JobKind) -> Option<&Arc<JobCoordinator>> {
        self.coordinators.iter().find(|c| c.kind() == kind)
    }

    pub fn is_leader(&self) -> bool {
        self.leader.is_leader()
    }

    /// Join the membership and start the background tasks.
    #[instrument(skip(self), fields(node_id = %self.node_id))]
    pub async fn start(&self) {
        self.membership
            .join(self.region.clone() as Arc<dyn RegionClient>);
        self.apply_members(&self.membership.members()).await;

        let mut tasks = Vec::new();

        let mut members = self.membership.subscribe();
        let cancel = self.cancel.clone();
        let (node_id, router, region) = (self.node_id, self.router.clone(), self.region.clone());
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = members.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let current = members.borrow_and_update().clone();
                        rebalance(node_id, &router, &region, &current).await;
                    }
                }
            }
        }));

        if let Some(lease) = &self.lease {
            let lease = lease.clone();
            let cancel = self.cancel.clone();
            tasks.push(tokio::spawn(async move { lease.run(cancel).await }));
        }

        for coordinator in &self.coordinators {
            let coordinator = coordinator.clone();
            let cancel = self.cancel.clone();
            tasks.push(tokio::spawn(async move { coordinator.run(cancel).await }));
        }

        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(tasks);
        info!(coordinators = self.coordinators.len(), "Scheduler node started");
    }

    async fn apply_members(&self, members: &[Arc<dyn RegionClient>]) {
        rebalance(self.node_id, &self.router, &self.region, members).await;
    }

    /// Leave the cluster, cancel running executions and wait up to `grace`
    /// for everything to stop. Cancelled executions stay STARTED.
    #[instrument(skip(self), fields(node_id = %self.node_id))]
    pub async fn shutdown(&self, grace: Duration) {
        info!("Shutting down scheduler node");
        self.membership.leave(self.node_id);
        self.cancel.cancel();
        self.region.shutdown(grace).await;

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            if tokio::time::timeout(grace, task).await.is_err() {
                warn!("Background task did not stop within grace period");
            }
        }
        info!("Scheduler node stopped");
    }

    /// Stop without any cleanup, as if the process died: the leader lease is
    /// not released and running executions are dropped where they stand.
    pub async fn crash(&self) {
        warn!(node_id = %self.node_id, "Crashing scheduler node");
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
        self.membership.leave(self.node_id);
        self.cancel.cancel();
        self.region.shutdown(Duration::ZERO).await;
    }
}

/// Point the router at `members` and stop executors for job ids that moved.
async fn rebalance(
    node_id: NodeId,
    router: &ShardRouter,
    region: &ExecutorRegion,
    members: &[Arc<dyn RegionClient>],
) {
    router.set_members(members);
    region
        .retain_owned(|job_id| router.owner(job_id) == Some(node_id))
        .await;
}
