//! Job tracking: entities, lifecycle and the registry that enforces it

mod registry;
pub mod types;

pub use registry::JobRegistry;
pub use types::{
    Job, JobFailure, JobId, JobKind, JobPayload, JobResult, JobState, NewJob, RetryPolicy,
    StateChange,
};
