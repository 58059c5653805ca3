//! Shard routing across cluster members.
//!
//! Job ids map to nodes through a consistent-hash ring, so a membership
//! change only moves the job ids owned by the node that joined or left.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use cadence_id::{JobId, NodeId};
use cadence_jobs::{Delivery, DispatchError, Dispatcher, ExecuteRequest};
use cadence_routing::HashRing;
use tokio::sync::watch;
use tracing::{debug, info};

/// A node's executor region as seen by the router.
#[async_trait]
pub trait RegionClient: Send + Sync {
    fn node_id(&self) -> NodeId;

    async fn deliver(&self, request: ExecuteRequest) -> Result<Delivery, DispatchError>;
}

struct RouterState {
    ring: HashRing<NodeId>,
    regions: HashMap<NodeId, Arc<dyn RegionClient>>,
}

/// Routes execute requests to the region that owns the job id.
pub struct ShardRouter {
    virtual_nodes: u32,
    state: RwLock<RouterState>,
}

impl ShardRouter {
    pub fn new(virtual_nodes: u32) -> Self {
        Self {
            virtual_nodes,
            state: RwLock::new(RouterState {
                ring: HashRing::new(virtual_nodes),
                regions: HashMap::new(),
            }),
        }
    }

    /// Replace the member set.
    pub fn set_members(&self, members: &[Arc<dyn RegionClient>]) {
        let ring = HashRing::from_members(self.virtual_nodes, members.iter().map(|m| m.node_id()));
        let regions = members.iter().map(|m| (m.node_id(), m.clone())).collect();
        let fingerprint = ring.fingerprint();

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        *state = RouterState { ring, regions };
        info!(members = members.len(), ring = %fingerprint, "Shard ring updated");
    }

    /// The node that owns `job_id`.
    pub fn owner(&self, job_id: JobId) -> Option<NodeId> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.ring.owner_of(&job_id).copied()
    }

    pub fn members(&self) -> Vec<NodeId> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.ring.members().copied().collect()
    }

    fn region_for(&self, job_id: JobId) -> Option<Arc<dyn RegionClient>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let owner = state.ring.owner_of(&job_id)?;
        state.regions.get(owner).cloned()
    }
}

#[async_trait]
impl Dispatcher for ShardRouter {
    async fn dispatch(&self, request: ExecuteRequest) -> Result<Delivery, DispatchError> {
        let region = self
            .region_for(request.job_id)
            .ok_or(DispatchError::NoOwner(request.job_id))?;
        debug!(job_id = %request.job_id, node_id = %region.node_id(), "Routing execute request");
        region.deliver(request).await
    }
}

/// Current cluster members, broadcast to every node.
#[derive(Clone)]
pub struct Membership {
    tx: Arc<watch::Sender<Vec<Arc<dyn RegionClient>>>>,
}

impl Default for Membership {
    fn default() -> Self {
        Self::new()
    }
}

impl Membership {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Vec::new());
        Self { tx: Arc::new(tx) }
    }

    /// Add `region`, replacing a previous entry for the same node.
    pub fn join(&self, region: Arc<dyn RegionClient>) {
        let node_id = region.node_id();
        self.tx.send_modify(|members| {
            members.retain(|m| m.node_id() != node_id);
            members.push(region);
        });
    }

    pub fn leave(&self, node_id: NodeId) {
        self.tx.send_if_modified(|members| {
            let before = members.len();
            members.retain(|m| m.node_id() != node_id);
            members.len() != before
        });
    }

    pub fn members(&self) -> Vec<Arc<dyn RegionClient>> {
        self.tx.borrow().clone()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.tx.borrow().iter().map(|m| m.node_id()).collect()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Arc<dyn RegionClient>>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_id::OrgId;
    use cadence_jobs::JobKind;
    use chrono::Utc;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeRegion {
        node_id: NodeId,
        received: Mutex<Vec<JobId>>,
    }

    impl FakeRegion {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                node_id: NodeId::new(),
                received: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl RegionClient for FakeRegion {
        fn node_id(&self) -> NodeId {
            self.node_id
        }

        async fn deliver(&self, request: ExecuteRequest) -> Result<Delivery, DispatchError> {
            self.received.lock().unwrap().push(request.job_id);
            Ok(Delivery::Enqueued)
        }
    }

    fn request(job_id: JobId) -> ExecuteRequest {
        ExecuteRequest {
            kind: JobKind::new("report"),
            job_id,
            org_id: OrgId::new(),
            scheduled: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_dispatch_reaches_owner_only() {
        let a = FakeRegion::new();
        let b = FakeRegion::new();
        let router = ShardRouter::new(64);
        router.set_members(&[a.clone() as Arc<dyn RegionClient>, b.clone()]);

        let jobs: Vec<JobId> = (0..50).map(|_| JobId::new()).collect();
        for job_id in &jobs {
            router.dispatch(request(*job_id)).await.unwrap();
        }

        for job_id in &jobs {
            let owner = router.owner(*job_id).unwrap();
            let (mine, other) = if owner == a.node_id { (&a, &b) } else { (&b, &a) };
            assert!(mine.received.lock().unwrap().contains(job_id));
            assert!(!other.received.lock().unwrap().contains(job_id));
        }
    }

    #[tokio::test]
    async fn test_empty_router_has_no_owner() {
        let router = ShardRouter::new(64);
        let job_id = JobId::new();
        let err = router.dispatch(request(job_id)).await.unwrap_err();
        assert_eq!(err, DispatchError::NoOwner(job_id));
    }

    #[test]
    fn test_membership_join_and_leave() {
        let membership = Membership::new();
        let mut rx = membership.subscribe();
        let a = FakeRegion::new();
        let b = FakeRegion::new();

        membership.join(a.clone());
        membership.join(b.clone());
        membership.join(a.clone());
        assert_eq!(membership.node_ids(), vec![b.node_id, a.node_id]);
        assert!(rx.has_changed().unwrap());
        let _ = rx.borrow_and_update();

        membership.leave(NodeId::new());
        assert!(!rx.has_changed().unwrap());

        membership.leave(b.node_id);
        assert!(rx.has_changed().unwrap());
        assert_eq!(membership.node_ids(), vec![a.node_id]);
    }
}
