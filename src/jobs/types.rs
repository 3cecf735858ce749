//! Job entity, lifecycle states and outcomes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::CoreError;

/// Job identifiers are assigned by the store and never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Index,
    Ingest,
}

impl JobKind {
    pub const ALL: [JobKind; 2] = [JobKind::Index, JobKind::Ingest];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Index => "index",
            JobKind::Ingest => "ingest",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "index" => Ok(JobKind::Index),
            "ingest" => Ok(JobKind::Ingest),
            other => Err(CoreError::InvalidInput(format!("unknown job kind: {other}"))),
        }
    }
}

/// Lifecycle: Pending -> Running -> {Succeeded, Failed}; Failed -> Pending only via retry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 4] = [
        JobState::Pending,
        JobState::Running,
        JobState::Succeeded,
        JobState::Failed,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }

    /// Transitions reachable through `JobRegistry::transition`
    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Pending, JobState::Running)
                | (JobState::Running, JobState::Succeeded)
                | (JobState::Running, JobState::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "running" => Ok(JobState::Running),
            "succeeded" => Ok(JobState::Succeeded),
            "failed" => Ok(JobState::Failed),
            other => Err(CoreError::InvalidInput(format!("unknown job state: {other}"))),
        }
    }
}

/// Kind-specific job input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum JobPayload {
    Index { source_path: PathBuf },
    /// `tombstone` marks the source as gone rather than (re)ingested
    Ingest { source: String, tombstone: bool },
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::Index { .. } => JobKind::Index,
            JobPayload::Ingest { .. } => JobKind::Ingest,
        }
    }

    /// Default payload for a job created from just a kind and target key
    pub fn for_target(kind: JobKind, target_key: &str) -> Self {
        match kind {
            JobKind::Index => JobPayload::Index {
                source_path: PathBuf::from(target_key),
            },
            JobKind::Ingest => JobPayload::Ingest {
                source: target_key.to_string(),
                tombstone: false,
            },
        }
    }
}

/// Why a job ended up `Failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum JobFailure {
    /// The worker returned an error
    Worker { message: String },
    TimeoutExceeded { timeout_ms: u64 },
    /// The process stopped while the job was running
    Interrupted,
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobFailure::Worker { message } => write!(f, "worker error: {message}"),
            JobFailure::TimeoutExceeded { timeout_ms } => {
                write!(f, "timeout exceeded after {timeout_ms}ms")
            }
            JobFailure::Interrupted => f.write_str("interrupted"),
        }
    }
}

/// Outcome attached to a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    Output(String),
    Failure(JobFailure),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub from: Option<JobState>,
    pub to: JobState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub target_key: String,
    pub state: JobState,
    pub payload: JobPayload,
    pub history: Vec<StateChange>,
    pub origin_event_seq: Option<u64>,
    pub result: Option<String>,
    pub failure: Option<JobFailure>,
    /// Number of explicit retries so far
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }
}

/// Request to create a job with an explicit payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub target_key: String,
    pub payload: JobPayload,
    pub origin_event_seq: Option<u64>,
}

impl NewJob {
    pub fn kind(&self) -> JobKind {
        self.payload.kind()
    }
}

/// Bounded retry policy supplied by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff_ms: 1000,
        }
    }
}

impl RetryPolicy {
    pub fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_retries
    }

    pub fn backoff(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.backoff_ms)
    }
}
