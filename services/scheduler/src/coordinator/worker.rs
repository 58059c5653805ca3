//! Coordinator background loop.

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{CoordinatorError, JobCoordinator, TickReport};

impl JobCoordinator {
    /// Tick on the configured interval until cancelled. Ticks only run while
    /// this node is the leader.
    #[instrument(skip(self, cancel), fields(kind = %self.kind))]
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            interval_secs = self.config.tick_interval.as_secs(),
            "Starting job coordinator"
        );

        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Don't immediately tick on startup - wait for first interval
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Job coordinator shutting down");
                    break;
                }
                _ = interval.tick() => {
                    self.tick_if_leader().await;
                }
            }
        }
    }

    /// Run a tick if this node leads. Returns the report of a completed tick.
    pub async fn tick_if_leader(&self) -> Option<TickReport> {
        if !self.leader.is_leader() {
            debug!("Not the leader, skipping tick");
            return None;
        }
        match self.tick().await {
            Ok(report) => Some(report),
            Err(CoordinatorError::TickInProgress) => {
                debug!("Previous tick still running, dropping this one");
                None
            }
            Err(e) => {
                warn!(error = %e, "Coordinator tick failed");
                None
            }
        }
    }
}
