//! In-process cluster.
//!
//! Runs several [`SchedulerNode`]s in one process over shared repositories.
//! Nodes share a [`Membership`] and an in-memory lease store, so sharding,
//! leader election and failover behave as they would across machines.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use cadence_id::NodeId;
use cadence_jobs::{Clock, OrganizationRepository};
use cadence_routing::DEFAULT_VIRTUAL_NODES;
use tracing::{info, warn};

use crate::coordinator::CoordinatorConfig;
use crate::executor::{ExecutorConfig, JobTypeRegistry};
use crate::leader::{InMemoryLeaseStore, LeaseStore};
use crate::node::{Leadership, SchedulerNode, COORDINATOR_LEASE};
use crate::routing::Membership;

/// Settings applied to every node of a [`LocalCluster`].
#[derive(Debug, Clone)]
pub struct ClusterSettings {
    pub executor: ExecutorConfig,
    pub coordinator: CoordinatorConfig,
    pub leader_lease: Duration,
    pub virtual_nodes: u32,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            executor: ExecutorConfig::default(),
            coordinator: CoordinatorConfig::default(),
            leader_lease: Duration::from_secs(15),
            virtual_nodes: DEFAULT_VIRTUAL_NODES,
        }
    }
}

/// A cluster of scheduler nodes inside one process.
pub struct LocalCluster {
    membership: Membership,
    leases: Arc<InMemoryLeaseStore>,
    nodes: Mutex<Vec<Arc<SchedulerNode>>>,
    registry: JobTypeRegistry,
    organizations: Arc<dyn OrganizationRepository>,
    clock: Arc<dyn Clock>,
    settings: ClusterSettings,
}

impl LocalCluster {
    /// Start `size` nodes and wait until every router sees every member.
    pub async fn start(
        size: usize,
        registry: JobTypeRegistry,
        organizations: Arc<dyn OrganizationRepository>,
        clock: Arc<dyn Clock>,
        settings: ClusterSettings,
    ) -> Self {
        let cluster = Self {
            membership: Membership::new(),
            leases: Arc::new(InMemoryLeaseStore::new()),
            nodes: Mutex::new(Vec::with_capacity(size)),
            registry,
            organizations,
            clock,
            settings,
        };
        for _ in 0..size.max(1) {
            cluster.launch(NodeId::new()).await;
        }

        if !cluster.converge(Duration::from_secs(1)).await {
            warn!("Cluster routers did not converge on the member list");
        }
        info!(nodes = cluster.nodes().len(), "Local cluster started");
        cluster
    }

    /// Add a node with id `node_id`. Job ids the ring moves to it are stopped
    /// on their previous owners.
    pub async fn join(&self, node_id: NodeId) -> Arc<SchedulerNode> {
        let node = self.launch(node_id).await;
        if !self.converge(Duration::from_secs(1)).await {
            warn!(node_id = %node_id, "Cluster routers did not converge after join");
        }
        info!(node_id = %node_id, nodes = self.nodes().len(), "Node joined local cluster");
        node
    }

    async fn launch(&self, node_id: NodeId) -> Arc<SchedulerNode> {
        let settings = &self.settings;
        let node = SchedulerNode::builder(node_id, self.registry.clone(), self.organizations.clone())
            .clock(self.clock.clone())
            .leadership(Leadership::Lease {
                store: self.leases.clone() as Arc<dyn LeaseStore>,
                ttl: settings.leader_lease,
            })
            .membership(self.membership.clone())
            .executor_config(settings.executor.clone())
            .coordinator_config(settings.coordinator.clone())
            .virtual_nodes(settings.virtual_nodes)
            .build();
        let node = Arc::new(node);
        node.start().await;
        self.nodes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(node.clone());
        node
    }

    pub fn settings(&self) -> &ClusterSettings {
        &self.settings
    }

    /// Wait until every live node routes over the current member list.
    pub async fn converge(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let mut expected = self.membership.node_ids();
            expected.sort();
            let converged = self.nodes().iter().all(|node| {
                let mut seen = node.router().members();
                seen.sort();
                seen == expected
            });
            if converged {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub fn nodes(&self) -> Vec<Arc<SchedulerNode>> {
        self.nodes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn node(&self, node_id: NodeId) -> Option<Arc<SchedulerNode>> {
        self.nodes().into_iter().find(|n| n.node_id() == node_id)
    }

    /// The node currently holding the coordinator lease, if it still leads.
    pub fn leader(&self) -> Option<Arc<SchedulerNode>> {
        let holder = self.leases.holder(COORDINATOR_LEASE)?;
        self.node(holder).filter(|n| n.is_leader())
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    fn take(&self, node_id: NodeId) -> Option<Arc<SchedulerNode>> {
        let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        let index = nodes.iter().position(|n| n.node_id() == node_id)?;
        Some(nodes.remove(index))
    }

    /// Crash a node. Its executions stay STARTED until their claims lapse.
    pub async fn kill(&self, node_id: NodeId) -> bool {
        let Some(node) = self.take(node_id) else {
            return false;
        };
        node.crash().await;
        self.converge(Duration::from_secs(1)).await;
        true
    }

    /// Gracefully stop one node.
    pub async fn stop(&self, node_id: NodeId, grace: Duration) -> bool {
        let Some(node) = self.take(node_id) else {
            return false;
        };
        node.shutdown(grace).await;
        self.converge(Duration::from_secs(1)).await;
        true
    }

    pub async fn shutdown(&self, grace: Duration) {
        let nodes: Vec<_> = self
            .nodes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for node in nodes {
            node.shutdown(grace).await;
        }
        info!("Local cluster stopped");
    }
}
