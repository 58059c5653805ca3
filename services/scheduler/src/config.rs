//! Configuration for the scheduler node.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use cadence_id::NodeId;

use crate::cluster::ClusterSettings;
use crate::coordinator::CoordinatorConfig;
use crate::executor::ExecutorConfig;
use crate::retry::{BackoffPolicy, RetryPolicy};

/// Scheduler node configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Unique identifier for this node.
    pub node_id: NodeId,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Coordinator tick interval in seconds.
    pub tick_interval_secs: u64,

    /// Jobs fetched per repository page.
    pub page_size: usize,

    /// Default job deadline in seconds.
    pub job_timeout_secs: u64,

    /// Claim TTL in seconds; a STARTED execution older than this is abandoned.
    /// Must exceed the job timeout plus the cancel grace.
    pub execution_lease_secs: u64,

    /// Seconds a cancelled job body gets to return before it is aborted.
    pub cancel_grace_secs: u64,

    /// Per-job executor mailbox capacity.
    pub mailbox_size: usize,

    /// Idle executor actors passivate after this many seconds.
    pub actor_idle_secs: u64,

    /// Attempts per repository call.
    pub retry_attempts: u32,

    pub retry_base_ms: u64,

    pub retry_max_ms: u64,

    /// Leader lease TTL in seconds.
    pub leader_lease_secs: u64,

    /// Virtual nodes per member on the hash ring.
    pub virtual_nodes: u32,

    /// In-process nodes started by the binary.
    pub cluster_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: NodeId::new(),
            log_level: "info".to_string(),
            tick_interval_secs: 30,
            page_size: 100,
            job_timeout_secs: 300,
            execution_lease_secs: 900,
            cancel_grace_secs: 5,
            mailbox_size: 32,
            actor_idle_secs: 300,
            retry_attempts: 5,
            retry_base_ms: 100,
            retry_max_ms: 5000,
            leader_lease_secs: 15,
            virtual_nodes: cadence_routing::DEFAULT_VIRTUAL_NODES,
            cluster_size: 1,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, falling back to defaults for
    /// unset keys. Set but unparsable values are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        // Node ID can be provided or auto-generated
        let node_id = match lookup("CADENCE_NODE_ID") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("invalid CADENCE_NODE_ID: {raw}"))?,
            None => defaults.node_id,
        };

        let log_level = lookup("CADENCE_LOG_LEVEL").unwrap_or(defaults.log_level);

        let config = Self {
            node_id,
            log_level,
            tick_interval_secs: parse(&lookup, "CADENCE_TICK_INTERVAL_SECS", defaults.tick_interval_secs)?,
            page_size: parse(&lookup, "CADENCE_PAGE_SIZE", defaults.page_size)?,
            job_timeout_secs: parse(&lookup, "CADENCE_JOB_TIMEOUT_SECS", defaults.job_timeout_secs)?,
            execution_lease_secs: parse(&lookup, "CADENCE_EXECUTION_LEASE_SECS", defaults.execution_lease_secs)?,
            cancel_grace_secs: parse(&lookup, "CADENCE_CANCEL_GRACE_SECS", defaults.cancel_grace_secs)?,
            mailbox_size: parse(&lookup, "CADENCE_MAILBOX_SIZE", defaults.mailbox_size)?,
            actor_idle_secs: parse(&lookup, "CADENCE_ACTOR_IDLE_SECS", defaults.actor_idle_secs)?,
            retry_attempts: parse(&lookup, "CADENCE_RETRY_ATTEMPTS", defaults.retry_attempts)?,
            retry_base_ms: parse(&lookup, "CADENCE_RETRY_BASE_MS", defaults.retry_base_ms)?,
            retry_max_ms: parse(&lookup, "CADENCE_RETRY_MAX_MS", defaults.retry_max_ms)?,
            leader_lease_secs: parse(&lookup, "CADENCE_LEADER_LEASE_SECS", defaults.leader_lease_secs)?,
            virtual_nodes: parse(&lookup, "CADENCE_VIRTUAL_NODES", defaults.virtual_nodes)?,
            cluster_size: parse(&lookup, "CADENCE_CLUSTER_SIZE", defaults.cluster_size)?,
        };

        anyhow::ensure!(config.tick_interval_secs > 0, "CADENCE_TICK_INTERVAL_SECS must be positive");
        anyhow::ensure!(config.page_size > 0, "CADENCE_PAGE_SIZE must be positive");
        anyhow::ensure!(config.mailbox_size > 0, "CADENCE_MAILBOX_SIZE must be positive");
        anyhow::ensure!(config.leader_lease_secs > 0, "CADENCE_LEADER_LEASE_SECS must be positive");
        anyhow::ensure!(config.job_timeout_secs > 0, "CADENCE_JOB_TIMEOUT_SECS must be positive");
        anyhow::ensure!(config.execution_lease_secs > 0, "CADENCE_EXECUTION_LEASE_SECS must be positive");
        anyhow::ensure!(
            config.job_timeout_secs.saturating_add(config.cancel_grace_secs) < config.execution_lease_secs,
            "CADENCE_EXECUTION_LEASE_SECS ({}) must exceed CADENCE_JOB_TIMEOUT_SECS ({}) plus CADENCE_CANCEL_GRACE_SECS ({})",
            config.execution_lease_secs,
            config.job_timeout_secs,
            config.cancel_grace_secs,
        );
        Ok(config)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts.max(1),
            backoff: BackoffPolicy {
                base: Duration::from_millis(self.retry_base_ms),
                max: Duration::from_millis(self.retry_max_ms),
                ..BackoffPolicy::default()
            },
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            mailbox_size: self.mailbox_size,
            idle_timeout: (self.actor_idle_secs > 0).then(|| Duration::from_secs(self.actor_idle_secs)),
            default_timeout: Duration::from_secs(self.job_timeout_secs),
            execution_lease: Duration::from_secs(self.execution_lease_secs),
            cancel_grace: Duration::from_secs(self.cancel_grace_secs),
            retry: self.retry_policy(),
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            tick_interval: Duration::from_secs(self.tick_interval_secs),
            page_size: self.page_size,
            ..CoordinatorConfig::default()
        }
    }

    pub fn cluster_settings(&self) -> ClusterSettings {
        ClusterSettings {
            executor: self.executor_config(),
            coordinator: self.coordinator_config(),
            leader_lease: Duration::from_secs(self.leader_lease_secs),
            virtual_nodes: self.virtual_nodes,
        }
    }
}

fn parse<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {key}: {raw}")),
        None => Ok(default),
    }
}
