//! Job coordinator.
//!
//! The coordinator finds due instants and hands them to the executors. It
//! runs one tick at a time on the leader node:
//!
//! ```text
//! Idle ──CAS──> Scanning ──> Dispatching ──> Idle
//!   ▲             │
//!   └─ a tick arriving while not Idle is dropped
//! ```
//!
//! A tick keeps no state beyond itself. Whether an instant is due is decided
//! from the repository alone: the schedule, the last terminal run, and the
//! execution record of the candidate instant.

mod tick;
mod worker;

use std::time::Duration;

use cadence_jobs::RepositoryError;
use thiserror::Error;

pub use tick::{JobCoordinator, TickPhase};

/// Coordinator tuning.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Time between ticks.
    pub tick_interval: Duration,

    /// Jobs fetched per `list_jobs` call.
    pub page_size: usize,

    /// Organizations scanned concurrently.
    pub org_concurrency: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            page_size: 100,
            org_concurrency: 8,
        }
    }
}

/// Tick-level failures. Per-organization and per-job failures never abort a
/// tick; they are counted in the [`TickReport`].
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Another tick is still running; this one was dropped.
    #[error("previous tick still in progress")]
    TickInProgress,

    #[error("failed to list organizations: {0}")]
    Organizations(#[source] RepositoryError),
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub organizations: usize,
    /// Organizations whose job listing failed and were skipped.
    pub organizations_failed: usize,
    pub jobs_scanned: usize,
    pub dispatched: usize,
    pub not_due: usize,
    /// Due instants still held by a live claim.
    pub in_flight: usize,
    /// Schedules with no further runs.
    pub exhausted: usize,
    pub already_queued: usize,
    /// Per-job evaluation and dispatch failures.
    pub errors: usize,
}

/// Lifetime counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub ticks: u64,
    pub ticks_dropped: u64,
    pub ticks_failed: u64,
    pub dispatched: u64,
}
