//! cadence scheduler node.
//!
//! A node hosts three roles:
//!
//! - **Executor region**: one actor per owned job id, running due instants
//!   strictly one at a time ([`executor`])
//! - **Shard router**: maps job ids to the node that owns them on a
//!   consistent-hash ring ([`routing`])
//! - **Coordinator**: the cluster singleton that finds due instants and
//!   dispatches them; only active while this node holds leadership
//!   ([`coordinator`], [`leader`])
//!
//! The repositories in `cadence-jobs` are the single source of truth. A node
//! can die at any point: a claimed execution stays STARTED until its claim
//! lapses, then the next coordinator tick hands it to the new owner.

pub mod actors;
pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod demo;
pub mod error;
pub mod executor;
pub mod leader;
pub mod node;
pub mod retry;
pub mod routing;

pub use cluster::{ClusterSettings, LocalCluster};
pub use config::Config;
pub use coordinator::{CoordinatorConfig, CoordinatorError, JobCoordinator, TickReport};
pub use error::{ExecutionFailure, JobError};
pub use executor::{ExecutorConfig, ExecutorRegion, JobTypeRegistry};
pub use leader::{InMemoryLeaseStore, LeaderElection, LeaseLeadership, LeaseStore, StaticLeadership};
pub use node::{Leadership, SchedulerNode, SchedulerNodeBuilder};
pub use retry::{BackoffPolicy, RetryPolicy};
pub use routing::{Membership, RegionClient, ShardRouter};
