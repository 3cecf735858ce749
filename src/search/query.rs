//! Structured job queries
//!
//! A [`JobQuery`] is a conjunction: every predicate that is set must hold.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::jobs::{Job, JobId, JobKind, JobState};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobQuery {
    pub kind: Option<JobKind>,
    pub state: Option<JobState>,
    pub target_prefix: Option<String>,
    /// Inclusive lower bound on creation time
    pub created_after: Option<DateTime<Utc>>,
    /// Exclusive upper bound on creation time
    pub created_before: Option<DateTime<Utc>>,
}

impl JobQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: JobKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn target_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.target_prefix = Some(prefix.into());
        self
    }

    pub fn created_between(mut self, after: DateTime<Utc>, before: DateTime<Utc>) -> Self {
        self.created_after = Some(after);
        self.created_before = Some(before);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        if self.kind.is_some_and(|kind| job.kind != kind) {
            return false;
        }
        if self.state.is_some_and(|state| job.state != state) {
            return false;
        }
        if let Some(prefix) = &self.target_prefix {
            if !job.target_key.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if self.created_after.is_some_and(|after| job.created_at < after) {
            return false;
        }
        if self
            .created_before
            .is_some_and(|before| job.created_at >= before)
        {
            return false;
        }
        true
    }
}

/// Continuation point for paginated queries: the last job id already returned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobCursor(pub JobId);

#[derive(Debug, Clone, Default)]
pub struct QueryPage {
    pub jobs: Vec<Job>,
    /// Present when more matching jobs exist past this page
    pub next_cursor: Option<JobCursor>,
}
