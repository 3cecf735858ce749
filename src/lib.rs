//! finspect - durable filesystem change pipeline
//!
//! Watches directories, records every effective file change in an append-only event log,
//! derives index and ingest jobs from those events and tracks each job through its
//! lifecycle with a queryable secondary index.

pub mod config;
pub mod database;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod jobs;
pub mod logging;
pub mod pipeline;
pub mod search;
pub mod watcher;
pub mod workers;


// Re-export common types
pub use config::FinspectConfig;
pub use error::{CoreError, Result};
pub use events::{ChangeEvent, ChangeKind, EventStore, Fingerprint};
pub use jobs::{Job, JobId, JobKind, JobRegistry, JobState};
pub use pipeline::Pipeline;
pub use search::{JobQuery, SearchIndex};
pub use watcher::{WatchManager, WatchPath, WatchPathId};
