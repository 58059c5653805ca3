//! # cadence-jobs
//!
//! Data contracts shared by the coordinator, the executors and the outside
//! world:
//!
//! - [`model`]: jobs, organizations and per-instant execution records
//! - [`repository`]: the job and organization repository contracts
//! - [`dispatch`]: how the coordinator hands a due instant to an executor
//! - [`body`]: the pluggable job-body contract
//! - [`clock`]: injectable wall clock
//! - [`memory`]: in-memory repositories for tests and single-process use
//!
//! The repositories are the single source of truth for execution state.
//! In particular [`JobRepository::job_started`] is an atomic claim and is
//! the only thing that keeps two nodes from running the same instant.

pub mod body;
pub mod clock;
pub mod dispatch;
pub mod error;
pub mod memory;
pub mod model;
pub mod repository;

pub use body::{JobBody, JobContext};
pub use clock::{Clock, SystemClock};
pub use dispatch::{Delivery, DispatchError, Dispatcher, ExecuteRequest};
pub use error::RepositoryError;
pub use memory::{InMemoryJobRepository, InMemoryOrganizationRepository, Transition};
pub use model::{
    Claim, Execution, ExecutionKey, ExecutionState, Job, JobKind, JobOutput, Organization,
    StartOutcome,
};
pub use repository::{JobRepository, OrganizationRepository, Page, PageRequest};
