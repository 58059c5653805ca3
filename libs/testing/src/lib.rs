//! Test doubles and fixtures shared by the cadence test suites.
//!
//! - [`ManualClock`]: a clock that only moves when told to
//! - [`RecordingDispatcher`]: captures execute requests instead of running them
//! - [`ScriptedJobBody`]: a job body that follows a script of outcomes
//! - [`FlakyJobRepository`] / [`FlakyOrganizationRepository`]: fault injection
//! - [`fixtures`]: common jobs and seeded repositories

pub mod body;
pub mod clock;
pub mod dispatch;
pub mod fixtures;
pub mod flaky;

use std::future::Future;
use std::time::Duration;

pub use body::{ConcurrencyTracker, ScriptedJobBody, Step};
pub use clock::ManualClock;
pub use dispatch::RecordingDispatcher;
pub use fixtures::{instant, Seeded};
pub use flaky::{FlakyJobRepository, FlakyOrganizationRepository, Operation};

/// Install a test-writer tracing subscriber once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Poll `condition` until it holds or `timeout` elapses. Returns whether it
/// held.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Async variant of [`wait_until`].
pub async fn wait_until_async<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
