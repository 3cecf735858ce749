//! Built-in job workers used by the server binary
//!
//! Real deployments plug their own [`JobWorker`]s into the dispatcher. These two do the
//! minimum that proves a file was seen: hash it, or acknowledge that it is gone.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::path::Path;
use tracing::{debug, info};

use crate::dispatcher::{JobWorker, Workers};
use crate::jobs::{Job, JobKind, JobPayload};

/// Index worker: records the size and blake3 hash of the file
#[derive(Debug, Default, Clone, Copy)]
pub struct FileStatWorker;

#[async_trait]
impl JobWorker for FileStatWorker {
    async fn run(&self, job: &Job) -> Result<String> {
        let JobPayload::Index { source_path } = &job.payload else {
            bail!("file stat worker cannot run {} job {}", job.kind, job.id);
        };
        describe_file(source_path).await
    }
}

/// Ingest worker: reads the source file, or acknowledges a tombstone without touching disk
#[derive(Debug, Default, Clone, Copy)]
pub struct IngestWorker;

#[async_trait]
impl JobWorker for IngestWorker {
    async fn run(&self, job: &Job) -> Result<String> {
        let JobPayload::Ingest { source, tombstone } = &job.payload else {
            bail!("ingest worker cannot run {} job {}", job.kind, job.id);
        };
        if *tombstone {
            info!("Tombstoned {}", source);
            return Ok(format!("tombstone {source}"));
        }
        describe_file(Path::new(source)).await
    }
}

async fn describe_file(path: &Path) -> Result<String> {
    let content = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let hash = blake3::hash(&content);

    debug!("Hashed {} ({} bytes)", path.display(), content.len());
    Ok(format!(
        "{} bytes blake3:{}",
        content.len(),
        hex::encode(hash.as_bytes())
    ))
}

/// The worker set the binary starts with
pub fn default_workers() -> Workers {
    Workers::new()
        .with(JobKind::Index, FileStatWorker)
        .with(JobKind::Ingest, IngestWorker)
}
