//! ID types used across the scheduler.

use crate::define_id;

define_id!(
    /// Tenant that owns jobs.
    OrgId,
    "org"
);

define_id!(
    /// A schedulable unit of work. This is the shard key for executors.
    JobId,
    "job"
);

define_id!(
    /// A scheduler process participating in the cluster.
    NodeId,
    "node"
);
