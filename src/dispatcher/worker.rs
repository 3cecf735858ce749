//! Pluggable job bodies

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::jobs::{Job, JobKind};

/// Executes the body of a job. The returned string becomes the job's result summary.
#[async_trait]
pub trait JobWorker: Send + Sync {
    async fn run(&self, job: &Job) -> anyhow::Result<String>;
}

/// Workers registered per job kind
#[derive(Clone, Default)]
pub struct Workers {
    by_kind: HashMap<JobKind, Arc<dyn JobWorker>>,
}

impl Workers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: JobKind, worker: impl JobWorker + 'static) -> Self {
        self.register(kind, Arc::new(worker));
        self
    }

    pub fn register(&mut self, kind: JobKind, worker: Arc<dyn JobWorker>) {
        self.by_kind.insert(kind, worker);
    }

    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn JobWorker>> {
        self.by_kind.get(&kind).cloned()
    }
}

impl fmt::Debug for Workers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.by_kind.keys().collect();
        kinds.sort();
        f.debug_struct("Workers").field("kinds", &kinds).finish()
    }
}
