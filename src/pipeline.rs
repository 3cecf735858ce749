//! Pipeline: the composition root
//!
//! Opens the database, builds every component around it and exposes the plain-call
//! surface an API layer maps its routes onto: watch path CRUD, index/ingest job
//! CRUD and search, generic file intake and explicit retry.

use std::path::Path;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::info;

use crate::config::FinspectConfig;
use crate::database::{PipelineDatabase, SharedDatabase};
use crate::dispatcher::{Dispatcher, Workers};
use crate::error::{CoreError, Result};
use crate::events::{ChangeEvent, EventFilter, EventScan, EventStore};
use crate::jobs::{Job, JobId, JobKind, JobPayload, JobRegistry, NewJob, RetryPolicy};
use crate::search::{JobCursor, JobQuery, QueryPage, SearchIndex};
use crate::watcher::{WatchManager, WatchPath, WatchPathId};

pub struct Pipeline {
    config: FinspectConfig,
    db: SharedDatabase,
    events: Arc<EventStore>,
    search: Arc<SearchIndex>,
    registry: Arc<JobRegistry>,
    watcher: WatchManager,
    dispatcher: Dispatcher,
}

impl Pipeline {
    /// Open storage, restore state and register the configured watch paths.
    ///
    /// Nothing runs until [`Pipeline::start`].
    pub fn open(config: FinspectConfig, workers: Workers) -> Result<Self> {
        let db = PipelineDatabase::open(&config.storage.db_path)?.into_shared();
        let events = Arc::new(EventStore::open(db.clone())?);
        let search = Arc::new(SearchIndex::new());
        let registry = Arc::new(JobRegistry::open(db.clone(), search.clone())?);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let watcher = WatchManager::new(config.watcher.clone(), db.clone(), events.clone(), event_tx)?;
        let dispatcher = Dispatcher::new(
            &config.dispatcher,
            db.clone(),
            events.clone(),
            registry.clone(),
            workers,
            event_rx,
        );

        for initial in &config.watcher.paths {
            match watcher.add_path(&initial.path, initial.recursive) {
                Ok(_) | Err(CoreError::AlreadyWatched { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        info!(
            "Pipeline opened: {} events, {} jobs, {} watch paths",
            events.highest_seq(),
            search.len(),
            watcher.list_paths().len()
        );
        Ok(Self {
            config,
            db,
            events,
            search,
            registry,
            watcher,
            dispatcher,
        })
    }

    /// Start the dispatcher first so nothing the watcher records waits on it
    pub fn start(&self) -> Result<()> {
        self.dispatcher.start()?;
        self.watcher.start()?;
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.watcher.shutdown().await?;
        self.dispatcher.shutdown().await;
        info!("Pipeline shut down");
        Ok(())
    }

    pub fn config(&self) -> &FinspectConfig {
        &self.config
    }

    pub fn database(&self) -> &SharedDatabase {
        &self.db
    }

    pub fn events(&self) -> &Arc<EventStore> {
        &self.events
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn search(&self) -> &Arc<SearchIndex> {
        &self.search
    }

    pub fn watcher(&self) -> &WatchManager {
        &self.watcher
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    // Watch paths

    /// Watch a path and queue the files already under it
    pub fn add_watch_path(&self, path: impl AsRef<Path>, recursive: bool) -> Result<WatchPath> {
        let watch_path = self.watcher.add_path(path, recursive)?;
        self.watcher.rescan(watch_path.id)?;
        Ok(watch_path)
    }

    pub fn remove_watch_path(&self, id: WatchPathId) -> Result<WatchPath> {
        self.watcher.remove_path(id)
    }

    pub fn get_watch_path(&self, id: WatchPathId) -> Result<WatchPath> {
        self.watcher.get_path(id)
    }

    pub fn list_watch_paths(&self) -> Vec<WatchPath> {
        self.watcher.list_paths()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.watcher.subscribe()
    }

    // Events

    pub fn read_event(&self, seq: u64) -> Result<ChangeEvent> {
        self.events.read(seq)
    }

    pub fn scan_events(&self, from_seq: u64, to_seq: u64, limit: usize) -> EventScan {
        self.events.scan(from_seq, to_seq, limit)
    }

    pub fn search_events(
        &self,
        filter: &EventFilter,
        after_seq: u64,
        limit: usize,
    ) -> Result<Vec<ChangeEvent>> {
        self.events.search(filter, after_seq, limit)
    }

    // Jobs

    /// Create a job outside the event flow and queue it for execution
    pub fn create_job(&self, kind: JobKind, target_key: impl Into<String>) -> Result<Job> {
        let job = self.registry.create(kind, target_key, None)?;
        self.dispatcher.schedule(job.id);
        Ok(job)
    }

    pub fn create_job_with(&self, new: NewJob) -> Result<Job> {
        let job = self.registry.create_job(new)?;
        self.dispatcher.schedule(job.id);
        Ok(job)
    }

    pub fn get_job(&self, id: JobId) -> Result<Job> {
        self.registry.get(id)
    }

    /// A job looked up through a kind-specific route. Other kinds read as absent.
    pub fn get_job_of_kind(&self, kind: JobKind, id: JobId) -> Result<Job> {
        let job = self.registry.get(id)?;
        if job.kind != kind {
            return Err(CoreError::not_found(
                match kind {
                    JobKind::Index => "index job",
                    JobKind::Ingest => "ingest job",
                },
                id,
            ));
        }
        Ok(job)
    }

    pub fn delete_job(&self, kind: JobKind, id: JobId) -> Result<Job> {
        self.get_job_of_kind(kind, id)?;
        self.registry.delete(id)
    }

    /// Search jobs of one kind; the query's own kind is overridden
    pub fn search_jobs(
        &self,
        kind: JobKind,
        query: JobQuery,
        after: Option<JobCursor>,
        limit: usize,
    ) -> QueryPage {
        self.search.query(&query.kind(kind), after, limit)
    }

    /// Explicitly retry a failed job under the caller's policy and queue it
    pub fn retry_job(&self, id: JobId, policy: &RetryPolicy) -> Result<Job> {
        let job = self.registry.retry(id, policy)?;
        self.dispatcher.schedule(job.id);
        Ok(job)
    }

    /// Generic file intake: ingest one existing file
    pub fn intake_file(&self, path: impl AsRef<Path>) -> Result<Job> {
        let requested = path.as_ref();
        let canonical = std::fs::canonicalize(requested).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => CoreError::PathNotFound(requested.to_path_buf()),
            _ => CoreError::Io(e),
        })?;
        if !canonical.is_file() {
            return Err(CoreError::InvalidInput(format!(
                "{} is not a regular file",
                canonical.display()
            )));
        }

        let source = canonical.to_string_lossy().into_owned();
        self.create_job_with(NewJob {
            target_key: source.clone(),
            payload: JobPayload::Ingest {
                source,
                tombstone: false,
            },
            origin_event_seq: None,
        })
    }
}
