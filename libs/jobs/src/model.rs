//! Job, organization and execution records.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use cadence_id::{JobId, NodeId, OrgId};
use cadence_schedule::Schedule;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Payload a job body produces on success.
pub type JobOutput = serde_json::Value;

/// Result-type marker of a job. Selects the repository and the body that
/// serve it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobKind(String);

impl JobKind {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobKind {
    fn from(kind: &str) -> Self {
        Self::new(kind)
    }
}

/// Tenant boundary. Jobs are always scoped to one organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: OrgId,
    pub name: String,
}

impl Organization {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: OrgId::new(),
            name: name.into(),
        }
    }
}

/// A scheduled unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub org_id: OrgId,
    pub name: String,
    pub kind: JobKind,
    pub schedule: Schedule,
    /// Overrides the executor's default deadline for this job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl Job {
    pub fn new(org_id: OrgId, name: impl Into<String>, kind: JobKind, schedule: Schedule) -> Self {
        Self {
            id: JobId::new(),
            org_id,
            name: name.into(),
            kind,
            schedule,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Identifies one execution record: a job at one scheduled instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutionKey {
    pub job_id: JobId,
    pub org_id: OrgId,
    pub scheduled: DateTime<Utc>,
}

impl fmt::Display for ExecutionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.job_id, self.scheduled.to_rfc3339())
    }
}

/// Lifecycle state of an execution record.
///
/// ```text
/// Pending ──> Started ──> Succeeded
///               │  ▲
///               │  └─ (re-claim after lease expiry)
///               └───> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Pending,
    Started,
    Succeeded,
    Failed,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Pending => "pending",
            ExecutionState::Started => "started",
            ExecutionState::Succeeded => "succeeded",
            ExecutionState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionState::Succeeded | ExecutionState::Failed)
    }

    /// Started -> Started is the re-claim of an abandoned execution.
    pub fn can_transition_to(&self, next: ExecutionState) -> bool {
        use ExecutionState::*;
        matches!(
            (self, next),
            (Pending, Started) | (Started, Started) | (Started, Succeeded) | (Started, Failed)
        )
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionState::Pending),
            "started" => Ok(ExecutionState::Started),
            "succeeded" => Ok(ExecutionState::Succeeded),
            "failed" => Ok(ExecutionState::Failed),
            other => Err(format!("unknown execution state: {other}")),
        }
    }
}

/// Lease a node holds on a started execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub node_id: NodeId,
    pub claimed_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl Claim {
    pub fn new(node_id: NodeId, claimed_at: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            node_id,
            claimed_at,
            ttl,
        }
    }

    /// `None` when the TTL is too large to represent, i.e. never expires.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        TimeDelta::from_std(self.ttl)
            .ok()
            .and_then(|ttl| self.claimed_at.checked_add_signed(ttl))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|at| now >= at)
    }
}

/// One run of a job at one scheduled instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub job_id: JobId,
    pub org_id: OrgId,
    pub scheduled: DateTime<Utc>,
    pub state: ExecutionState,
    pub claim: Option<Claim>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<JobOutput>,
    pub error: Option<String>,
}

impl Execution {
    pub fn key(&self) -> ExecutionKey {
        ExecutionKey {
            job_id: self.job_id,
            org_id: self.org_id,
            scheduled: self.scheduled,
        }
    }

    /// True while a live claim is held, i.e. someone is (or may still be)
    /// running this instant.
    pub fn is_in_flight(&self, now: DateTime<Utc>) -> bool {
        self.state == ExecutionState::Started
            && self.claim.as_ref().is_some_and(|claim| !claim.is_expired(now))
    }

    /// A started execution whose claim lapsed. Eligible for re-dispatch.
    pub fn is_abandoned(&self, now: DateTime<Utc>) -> bool {
        self.state == ExecutionState::Started
            && self.claim.as_ref().map_or(true, |claim| claim.is_expired(now))
    }
}

/// Outcome of the atomic claim in [`crate::JobRepository::job_started`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// The caller now holds the claim and must run the body.
    Claimed,
    /// A live claim is held by `owner`.
    AlreadyClaimed { owner: NodeId },
    /// The instant already reached a terminal state.
    AlreadyCompleted(ExecutionState),
}
