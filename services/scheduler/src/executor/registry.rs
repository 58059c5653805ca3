//! Job kind registry.

use std::collections::HashMap;
use std::sync::Arc;

use cadence_jobs::{JobBody, JobKind, JobRepository};

/// Repository and body serving one job kind.
#[derive(Clone)]
pub struct JobType {
    pub repository: Arc<dyn JobRepository>,
    pub body: Arc<dyn JobBody>,
}

/// Maps each [`JobKind`] to the repository and body that serve it.
#[derive(Clone, Default)]
pub struct JobTypeRegistry {
    types: HashMap<JobKind, JobType>,
}

impl JobTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under the repository's kind, replacing any previous entry.
    pub fn register(
        mut self,
        repository: Arc<dyn JobRepository>,
        body: Arc<dyn JobBody>,
    ) -> Self {
        let kind = repository.kind().clone();
        self.types.insert(kind, JobType { repository, body });
        self
    }

    pub fn get(&self, kind: &JobKind) -> Option<&JobType> {
        self.types.get(kind)
    }

    pub fn contains(&self, kind: &JobKind) -> bool {
        self.types.contains_key(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &JobKind> {
        self.types.keys()
    }

    pub fn repositories(&self) -> impl Iterator<Item = &Arc<dyn JobRepository>> {
        self.types.values().map(|t| &t.repository)
    }
}
