use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use cadence_jobs::{Delivery, DispatchError, Dispatcher, ExecuteRequest};

/// Dispatcher that records requests and never runs anything.
///
/// Requests seen before are answered with `AlreadyQueued` until
/// [`RecordingDispatcher::drain`] empties the queue, mimicking a region whose
/// mailbox still holds them.
#[derive(Default)]
pub struct RecordingDispatcher {
    inner: Mutex<Recorded>,
}

#[derive(Default)]
struct Recorded {
    requests: Vec<ExecuteRequest>,
    queued: HashSet<ExecuteRequest>,
    fail_with: Option<DispatchError>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every accepted request, in dispatch order.
    pub fn requests(&self) -> Vec<ExecuteRequest> {
        self.inner
            .lock()
            .map(|r| r.requests.clone())
            .unwrap_or_default()
    }

    /// Forget queued requests so they can be dispatched again.
    pub fn drain(&self) -> Vec<ExecuteRequest> {
        match self.inner.lock() {
            Ok(mut r) => {
                r.queued.clear();
                std::mem::take(&mut r.requests)
            }
            Err(_) => Vec::new(),
        }
    }

    /// Reject every subsequent dispatch with `error`. `None` restores.
    pub fn fail_with(&self, error: Option<DispatchError>) {
        if let Ok(mut r) = self.inner.lock() {
            r.fail_with = error;
        }
    }
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn dispatch(&self, request: ExecuteRequest) -> Result<Delivery, DispatchError> {
        let mut r = self
            .inner
            .lock()
            .map_err(|_| DispatchError::ShuttingDown)?;
        if let Some(error) = &r.fail_with {
            return Err(error.clone());
        }
        if !r.queued.insert(request.clone()) {
            return Ok(Delivery::AlreadyQueued);
        }
        r.requests.push(request);
        Ok(Delivery::Enqueued)
    }
}
