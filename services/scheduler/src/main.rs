//! Cadence scheduler node
//!
//! Runs the job scheduler against in-memory repositories seeded with a demo
//! workload.
//!
//! ## Architecture
//!
//! - **Coordinator**: Leader-only tick loop that finds due executions
//! - **Router**: Consistent-hash ring mapping job ids onto live nodes
//! - **Executor Region**: One actor per job id; runs bodies under a deadline
//! - **Leader Lease**: TTL lease deciding which node coordinates

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use cadence_jobs::{
    Clock, InMemoryJobRepository, InMemoryOrganizationRepository, JobKind, SystemClock,
};
use cadence_scheduler::demo::{seed_demo, LoggingJobBody, DEMO_KIND};
use cadence_scheduler::{Config, JobTypeRegistry, Leadership, LocalCluster, SchedulerNode};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        node_id = %config.node_id,
        cluster_size = config.cluster_size,
        tick_interval_secs = config.tick_interval_secs,
        "Starting cadence scheduler"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let jobs = Arc::new(InMemoryJobRepository::with_clock(
        JobKind::new(DEMO_KIND),
        clock.clone(),
    ));
    let organizations = Arc::new(InMemoryOrganizationRepository::new());
    seed_demo(jobs.as_ref(), &organizations, clock.now()).await?;

    let registry = JobTypeRegistry::new().register(jobs, Arc::new(LoggingJobBody::default()));

    if config.cluster_size <= 1 {
        let node = SchedulerNode::builder(config.node_id, registry, organizations)
            .clock(clock)
            .leadership(Leadership::Static(true))
            .executor_config(config.executor_config())
            .coordinator_config(config.coordinator_config())
            .virtual_nodes(config.virtual_nodes)
            .build();
        node.start().await;

        wait_for_shutdown().await;
        node.shutdown(SHUTDOWN_GRACE).await;
    } else {
        let cluster = LocalCluster::start(
            config.cluster_size,
            registry,
            organizations,
            clock,
            config.cluster_settings(),
        )
        .await;

        wait_for_shutdown().await;
        cluster.shutdown(SHUTDOWN_GRACE).await;
    }

    info!("Scheduler shutdown complete");
    Ok(())
}

async fn wait_for_shutdown() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signal"),
    }
}
