//! Leader election.
//!
//! The coordinator is a cluster singleton: every node runs one, but only the
//! node that currently holds leadership lets it tick. Leadership is a named
//! lease with a TTL, renewed at a third of the TTL. A leader that cannot
//! renew steps down before its lease could be taken over.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cadence_id::NodeId;
use cadence_jobs::{Clock, RepositoryError};
use chrono::{DateTime, TimeDelta, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Answers whether this node may act as the cluster singleton right now.
pub trait LeaderElection: Send + Sync {
    fn is_leader(&self) -> bool;
}

/// Fixed leadership, for single-node deployments and tests.
#[derive(Debug)]
pub struct StaticLeadership(AtomicBool);

impl StaticLeadership {
    pub fn new(leader: bool) -> Self {
        Self(AtomicBool::new(leader))
    }

    pub fn set(&self, leader: bool) {
        self.0.store(leader, Ordering::SeqCst);
    }
}

impl LeaderElection for StaticLeadership {
    fn is_leader(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Storage for named leases.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Take or extend the lease `name` for `holder` until `now + ttl`.
    /// Returns false if another holder's lease is still live.
    async fn try_acquire(
        &self,
        name: &str,
        holder: NodeId,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    /// Drop the lease if `holder` holds it.
    async fn release(&self, name: &str, holder: NodeId) -> Result<(), RepositoryError>;
}

/// [`LeaseStore`] backed by process memory.
#[derive(Default)]
pub struct InMemoryLeaseStore {
    leases: Mutex<HashMap<String, (NodeId, DateTime<Utc>)>>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder of `name`, expired or not.
    pub fn holder(&self, name: &str) -> Option<NodeId> {
        self.leases
            .lock()
            .ok()
            .and_then(|l| l.get(name).map(|(holder, _)| *holder))
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn try_acquire(
        &self,
        name: &str,
        holder: NodeId,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let expires = TimeDelta::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .ok_or_else(|| RepositoryError::Internal(format!("lease ttl {ttl:?} out of range")))?;

        let mut leases = self
            .leases
            .lock()
            .map_err(|_| RepositoryError::Internal("lease store lock poisoned".into()))?;

        let free = match leases.get(name) {
            None => true,
            Some((current, until)) => *current == holder || now >= *until,
        };
        if free {
            leases.insert(name.to_string(), (holder, expires));
        }
        Ok(free)
    }

    async fn release(&self, name: &str, holder: NodeId) -> Result<(), RepositoryError> {
        let mut leases = self
            .leases
            .lock()
            .map_err(|_| RepositoryError::Internal("lease store lock poisoned".into()))?;
        if leases.get(name).is_some_and(|(current, _)| *current == holder) {
            leases.remove(name);
        }
        Ok(())
    }
}

/// Leadership backed by a renewed lease.
pub struct LeaseLeadership {
    name: String,
    node_id: NodeId,
    ttl: Duration,
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    held_until: Mutex<Option<DateTime<Utc>>>,
}

impl LeaseLeadership {
    pub fn new(
        name: impl Into<String>,
        node_id: NodeId,
        ttl: Duration,
        store: Arc<dyn LeaseStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.into(),
            node_id,
            ttl,
            store,
            clock,
            held_until: Mutex::new(None),
        }
    }

    fn set_held_until(&self, until: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        let mut held = self.held_until.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *held, until)
    }

    /// Try to take or extend the lease once. Returns whether this node leads.
    pub async fn renew(&self) -> bool {
        let now = self.clock.now();
        let was_leader = self.is_leader();

        let acquired = match self.store.try_acquire(&self.name, self.node_id, self.ttl, now).await {
            Ok(acquired) => acquired,
            Err(e) => {
                warn!(lease = %self.name, node_id = %self.node_id, error = %e, "Lease renewal failed");
                false
            }
        };

        if acquired {
            let until = TimeDelta::from_std(self.ttl)
                .ok()
                .and_then(|ttl| now.checked_add_signed(ttl));
            self.set_held_until(until);
            if !was_leader {
                info!(lease = %self.name, node_id = %self.node_id, "Acquired leadership");
            }
        } else {
            self.set_held_until(None);
            if was_leader {
                warn!(lease = %self.name, node_id = %self.node_id, "Lost leadership");
            }
        }
        acquired
    }

    /// Step down and release the lease.
    pub async fn resign(&self) {
        if self.set_held_until(None).is_none() {
            return;
        }
        match self.store.release(&self.name, self.node_id).await {
            Ok(()) => info!(lease = %self.name, node_id = %self.node_id, "Released leadership"),
            Err(e) => warn!(lease = %self.name, error = %e, "Failed to release lease"),
        }
    }

    /// Renew until cancelled, then resign.
    #[instrument(skip(self, cancel), fields(lease = %self.name, node_id = %self.node_id))]
    pub async fn run(&self, cancel: CancellationToken) {
        let period = (self.ttl / 3).max(Duration::from_millis(10));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let leader = self.renew().await;
                    debug!(leader, "Lease renewal tick");
                }
            }
        }

        self.resign().await;
    }
}

impl LeaderElection for LeaseLeadership {
    fn is_leader(&self) -> bool {
        let held = *self.held_until.lock().unwrap_or_else(|e| e.into_inner());
        held.is_some_and(|until| self.clock.now() < until)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_testing::{instant, ManualClock};

    fn contenders(
        clock: &Arc<ManualClock>,
    ) -> (Arc<InMemoryLeaseStore>, LeaseLeadership, LeaseLeadership) {
        let store = Arc::new(InMemoryLeaseStore::new());
        let mk = || {
            LeaseLeadership::new(
                "coordinator",
                NodeId::new(),
                Duration::from_secs(15),
                store.clone(),
                clock.clone(),
            )
        };
        let (a, b) = (mk(), mk());
        (store, a, b)
    }

    #[test]
    fn test_static_leadership() {
        let leadership = StaticLeadership::new(false);
        assert!(!leadership.is_leader());
        leadership.set(true);
        assert!(leadership.is_leader());
    }

    #[tokio::test]
    async fn test_only_one_contender_leads() {
        let clock = Arc::new(ManualClock::new(instant(2024, 1, 1, 0, 0)));
        let (store, a, b) = contenders(&clock);

        assert!(a.renew().await);
        assert!(!b.renew().await);
        assert!(a.is_leader());
        assert!(!b.is_leader());
        assert_eq!(store.holder("coordinator"), Some(a.node_id));

        // Renewal by the holder extends the lease.
        clock.advance(TimeDelta::seconds(10));
        assert!(a.renew().await);
        clock.advance(TimeDelta::seconds(10));
        assert!(!b.renew().await);
        assert!(a.is_leader());
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let clock = Arc::new(ManualClock::new(instant(2024, 1, 1, 0, 0)));
        let (_store, a, b) = contenders(&clock);

        assert!(a.renew().await);
        clock.advance(TimeDelta::seconds(16));

        assert!(!a.is_leader());
        assert!(b.renew().await);
        assert!(b.is_leader());
        assert!(!a.renew().await);
    }

    #[tokio::test]
    async fn test_resign_releases_lease() {
        let clock = Arc::new(ManualClock::new(instant(2024, 1, 1, 0, 0)));
        let (store, a, b) = contenders(&clock);

        assert!(a.renew().await);
        a.resign().await;

        assert!(!a.is_leader());
        assert_eq!(store.holder("coordinator"), None);
        assert!(b.renew().await);
    }

    #[tokio::test]
    async fn test_run_acquires_then_resigns_on_cancel() {
        let clock = Arc::new(ManualClock::new(instant(2024, 1, 1, 0, 0)));
        let (store, a, _) = contenders(&clock);
        let a = Arc::new(a);
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let a = a.clone();
            let cancel = cancel.clone();
            async move { a.run(cancel).await }
        });

        let a_watch = a.clone();
        assert!(cadence_testing::wait_until(Duration::from_secs(1), move || a_watch.is_leader()).await);

        cancel.cancel();
        task.await.unwrap();
        assert!(!a.is_leader());
        assert_eq!(store.holder("coordinator"), None);
    }
}
