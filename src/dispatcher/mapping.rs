//! Event-to-job mapping
//!
//! Each change kind maps to the job kinds it derives. The mapping is part of the
//! `[dispatcher]` configuration section.

use serde::{Deserialize, Serialize};

use crate::events::{ChangeEvent, ChangeKind};
use crate::jobs::{JobKind, JobPayload, NewJob};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventJobMapping {
    pub created: Vec<JobKind>,
    pub modified: Vec<JobKind>,
    pub removed: Vec<JobKind>,
    pub renamed: Vec<JobKind>,
}

impl Default for EventJobMapping {
    fn default() -> Self {
        Self {
            created: vec![JobKind::Index],
            modified: vec![JobKind::Index],
            removed: vec![JobKind::Ingest],
            renamed: vec![JobKind::Index],
        }
    }
}

impl EventJobMapping {
    pub fn jobs_for(&self, kind: ChangeKind) -> &[JobKind] {
        match kind {
            ChangeKind::Created => &self.created,
            ChangeKind::Modified => &self.modified,
            ChangeKind::Removed => &self.removed,
            ChangeKind::Renamed => &self.renamed,
        }
    }

    /// Job requests `event` derives for one lane
    pub fn derive(&self, lane: JobKind, event: &ChangeEvent) -> Vec<NewJob> {
        self.jobs_for(event.kind)
            .iter()
            .filter(|kind| **kind == lane)
            .map(|kind| new_job_for(*kind, event))
            .collect()
    }
}

/// The job of `kind` for the file an event touched. Removals ingest a tombstone.
pub fn new_job_for(kind: JobKind, event: &ChangeEvent) -> NewJob {
    let target_key = event.path.to_string_lossy().into_owned();
    let payload = match kind {
        JobKind::Index => JobPayload::Index {
            source_path: event.path.clone(),
        },
        JobKind::Ingest => JobPayload::Ingest {
            source: target_key.clone(),
            tombstone: event.kind == ChangeKind::Removed,
        },
    };
    NewJob {
        target_key,
        payload,
        origin_event_seq: Some(event.seq),
    }
}
